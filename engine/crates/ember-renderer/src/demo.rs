//! 演示用的 graph：一个四边形画到场景 render target，再 blit 到交换链上

use ember_gfx::basic::format::PixelFormat;
use ember_render_graph::builtin::mesh_buffer::MeshBuffer;
use ember_render_graph::builtin::post_pass::{BLIT_PS, BLIT_VS, PostPass};
use ember_render_graph::builtin::present_pass::PresentPass;
use ember_render_graph::builtin::scene_pass::{MESH_PS, MESH_VS, ScenePass};
use ember_render_graph::graph::Graph;
use ember_render_graph::registry::{ObjectId, PassId, ResourceId};
use ember_render_graph::resource_handle::ResourceHandle;
use ember_render_interface::asset_depot::MemoryDepot;
use ember_render_interface::render_error::RenderResult;

pub const SCENE_CLEAR_COLOR: glam::Vec4 = glam::Vec4::new(0.1, 0.1, 0.12, 1.0);

#[derive(Clone, Copy, Debug)]
pub struct DemoGraph {
    pub swap_chain: ResourceId,
    pub scene: ResourceId,
    pub depth: ResourceId,
    pub mesh: ObjectId,
    pub scene_pass: PassId,
    pub post_pass: PassId,
    pub present_pass: PassId,
}

/// 按执行顺序注册：资源、mesh、scene -> post -> present
pub fn build_demo_graph(graph: &mut Graph) -> RenderResult<DemoGraph> {
    let swap_chain = graph.add_resource(ResourceHandle::swap_chain())?;
    let scene = graph.add_resource(ResourceHandle::scene_target(
        "scene",
        PixelFormat::Rgba8Unorm,
        SCENE_CLEAR_COLOR,
    ))?;
    let depth = graph.add_resource(ResourceHandle::depth_target("depth"))?;
    let mesh = graph.add_object(MeshBuffer::quad("quad"))?;

    let scene_pass = graph.add_pass(ScenePass::new(scene, depth, mesh))?;
    let post_pass = graph.add_pass(PostPass::new(scene, swap_chain))?;
    let present_pass = graph.add_pass(PresentPass::new(swap_chain))?;

    log::info!(
        "built demo graph: {} resources, {} objects, {} passes",
        graph.resources().len(),
        graph.objects().len(),
        graph.passes().len()
    );
    Ok(DemoGraph {
        swap_chain,
        scene,
        depth,
        mesh,
        scene_pass,
        post_pass,
        present_pass,
    })
}

/// headless 后端不解析 shader，任意非空的 blob 即可
pub fn headless_depot() -> MemoryDepot {
    MemoryDepot::new()
        .with_blob(MESH_VS, b"ember-headless mesh.vs".to_vec())
        .with_blob(MESH_PS, b"ember-headless mesh.ps".to_vec())
        .with_blob(BLIT_VS, b"ember-headless blit.vs".to_vec())
        .with_blob(BLIT_PS, b"ember-headless blit.ps".to_vec())
}
