//! 内置的 graph object 与 pass
//!
//! 资源 handle 的内置种类见 [`crate::resource_handle::ResourceHandle`] 的构造函数。

pub mod mesh_buffer;
pub mod post_pass;
pub mod present_pass;
pub mod scene_pass;

#[cfg(test)]
mod tests {
    use ember_gfx::basic::extent::Extent2D;
    use ember_gfx::basic::format::PixelFormat;
    use ember_gfx::basic::resource_state::ResourceState;
    use ember_gfx::commands::command::GfxCommand;
    use ember_gfx::headless::instance::HeadlessInstance;
    use ember_gfx::headless::probe::HeadlessProbe;
    use ember_render_interface::asset_depot::{Image, MemoryDepot};
    use ember_render_interface::create_info::RenderCreateInfo;
    use ember_render_interface::render_context::RenderContext;

    use super::mesh_buffer::MeshBuffer;
    use super::post_pass::{BLIT_PS, BLIT_VS, PostPass};
    use super::present_pass::PresentPass;
    use super::scene_pass::{MESH_PS, MESH_VS, ScenePass};
    use crate::graph::Graph;
    use crate::registry::PassId;
    use crate::resource_handle::{ExtentSource, ResourceHandle};

    fn create_graph() -> (Graph, HeadlessProbe) {
        let instance = HeadlessInstance::new();
        let probe = instance.probe();
        let create_info = RenderCreateInfo {
            display_size: Extent2D::new(64, 32),
            render_size: Extent2D::new(32, 16),
            ..Default::default()
        };
        let depot = MemoryDepot::new()
            .with_blob(MESH_VS, vec![1, 2, 3, 4])
            .with_blob(MESH_PS, vec![5, 6, 7, 8])
            .with_blob(BLIT_VS, vec![9, 10, 11, 12])
            .with_blob(BLIT_PS, vec![13, 14, 15, 16])
            .with_image("checker.png", Image::solid(4, 4, [255, 0, 255, 255]));
        let context = RenderContext::new(Box::new(instance), create_info).unwrap();
        (Graph::new(context, Box::new(depot)), probe)
    }

    /// 交换链、场景、深度、mesh 以及 scene / post / present 三个 pass
    fn build_demo(graph: &mut Graph) -> PassId {
        let swap_chain = graph.add_resource(ResourceHandle::swap_chain()).unwrap();
        let scene = graph
            .add_resource(ResourceHandle::scene_target("scene", PixelFormat::Rgba8Unorm, glam::Vec4::ZERO))
            .unwrap();
        let depth = graph.add_resource(ResourceHandle::depth_target("depth")).unwrap();
        let mesh = graph.add_object(MeshBuffer::quad("quad")).unwrap();

        graph.add_pass(ScenePass::new(scene, depth, mesh)).unwrap();
        let post = graph.add_pass(PostPass::new(scene, swap_chain)).unwrap();
        graph.add_pass(PresentPass::new(swap_chain)).unwrap();
        post
    }

    #[test]
    fn test_demo_graph_survives_reconfiguration() {
        let (graph, probe) = create_graph();
        let mut graph = graph.with_fault_limit(2);
        let post = build_demo(&mut graph);

        for _ in 0..2 {
            assert!(graph.run_frame().unwrap());
        }
        assert!(
            probe
                .direct_commands()
                .iter()
                .any(|c| matches!(c, GfxCommand::DrawIndexed { index_count: 6, .. }))
        );

        // 32x16 放进 128x32：放大两倍，左右留黑边
        graph.resize_display(Extent2D::new(128, 32)).unwrap();
        let viewport = graph.pass::<PostPass>(post).unwrap().viewport();
        assert_eq!((viewport.x, viewport.width, viewport.height), (32.0, 64.0, 32.0));

        graph.change_back_buffer_count(3).unwrap();
        probe.clear_records();
        for _ in 0..4 {
            assert!(graph.run_frame().unwrap());
        }
        let presents = probe.presents().iter().map(|p| p.frame_index).collect::<Vec<_>>();
        assert_eq!(presents, vec![0, 1, 2, 0]);

        probe.inject_device_removed();
        assert!(!graph.run_frame().unwrap());
        assert!(graph.run_frame().unwrap());
        assert_eq!(graph.recovery_count(), 1);

        drop(graph);
        assert_eq!(probe.live_objects(), 0);
    }

    #[test]
    fn test_mesh_buffers_end_in_draw_states() {
        let (mut graph, _probe) = create_graph();
        let mesh = graph.add_object(MeshBuffer::quad("quad")).unwrap();

        let args = graph.object::<MeshBuffer>(mesh).unwrap().draw_args().unwrap();
        assert_eq!(args.index_count, 6);
        assert_eq!(args.vertex_stride, 28);
        assert_eq!(graph.states().try_get(args.vertex_buffer), Some(ResourceState::VertexBuffer));
        assert_eq!(graph.states().try_get(args.index_buffer), Some(ResourceState::IndexBuffer));

        graph.remove_object(mesh).unwrap();
        assert!(graph.states().is_empty());
    }

    #[test]
    fn test_texture_and_uniform_handles() {
        let (mut graph, probe) = create_graph();

        let texture = graph.add_resource(ResourceHandle::texture("checker.png")).unwrap();
        let handle = graph.resource(texture).unwrap();
        assert_eq!(handle.extent(), Some(Extent2D::new(4, 4)));
        assert!(handle.srv(0).is_some());
        assert_eq!(graph.resource_state(texture), Some(ResourceState::CopyDest));
        assert!(
            probe
                .submissions()
                .iter()
                .flat_map(|s| s.commands.iter())
                .any(|c| matches!(c, GfxCommand::CopyTexture { .. }))
        );

        let history = graph
            .add_resource(ResourceHandle::rw_texture(
                "history",
                PixelFormat::Rgba16Float,
                Extent2D::default(),
                ExtentSource::RenderSize,
            ))
            .unwrap();
        let handle = graph.resource(history).unwrap();
        assert_eq!(handle.extent(), Some(Extent2D::new(32, 16)));
        assert!(handle.uav(0).is_some() && handle.srv(0).is_some());

        let camera = graph.add_resource(ResourceHandle::uniform("camera", 64)).unwrap();
        graph.write_uniform(camera, &glam::Mat4::IDENTITY).unwrap();
        assert_eq!(graph.resource_state(camera), Some(ResourceState::Uniform));
    }

    #[test]
    fn test_missing_image_fails_registration() {
        let (mut graph, _probe) = create_graph();
        assert!(graph.add_resource(ResourceHandle::texture("missing.png")).is_err());
        assert!(graph.resources().is_empty());
    }
}
