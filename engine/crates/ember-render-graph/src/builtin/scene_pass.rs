use ember_gfx::basic::extent::{Scissor, Viewport};
use ember_gfx::basic::format::PixelFormat;
use ember_gfx::handles::GfxPipelineHandle;
use ember_gfx::resources::pipeline::GraphicsPipelineDesc;
use ember_render_interface::render_error::{RenderError, RenderResult};

use crate::builtin::mesh_buffer::{MeshBuffer, MeshVertex};
use crate::pass::{CommandPass, PassContext, RenderTargetBinding};
use crate::registry::{ObjectId, ResourceId};
use crate::state_dep::StateDep;

pub const MESH_VS: &str = "shaders/mesh.vs.spv";
pub const MESH_PS: &str = "shaders/mesh.ps.spv";

/// 把一个 mesh 画到场景 render target 上，带深度
pub struct ScenePass {
    scene: ResourceId,
    depth: ResourceId,
    mesh: ObjectId,

    pipeline: Option<GfxPipelineHandle>,
    viewport: Viewport,
    scissor: Scissor,
}

impl ScenePass {
    pub fn new(scene: ResourceId, depth: ResourceId, mesh: ObjectId) -> Self {
        Self {
            scene,
            depth,
            mesh,
            pipeline: None,
            viewport: Viewport::default(),
            scissor: Scissor::default(),
        }
    }
}

impl CommandPass for ScenePass {
    fn name(&self) -> &str {
        "scene"
    }

    fn dependencies(&self) -> StateDep {
        StateDep::RENDER_SIZE
    }

    fn render_target(&self) -> Option<RenderTargetBinding> {
        Some(RenderTargetBinding {
            target: self.scene,
            depth: Some(self.depth),
        })
    }

    fn create(&mut self, ctx: &mut PassContext) -> RenderResult<()> {
        let mesh = ctx.object::<MeshBuffer>(self.mesh)?;
        let color_format = ctx.resource(self.scene)?.format().unwrap_or(PixelFormat::Rgba8Unorm);
        let desc = GraphicsPipelineDesc {
            name: "scene-mesh".to_string(),
            vertex_shader: ctx.depot.load_blob(MESH_VS)?,
            pixel_shader: ctx.depot.load_blob(MESH_PS)?,
            attributes: MeshVertex::ATTRIBUTES.to_vec(),
            vertex_stride: mesh.vertex_stride(),
            shader_inputs: 0,
            color_format,
            depth_format: Some(PixelFormat::Depth32Float),
        };
        self.pipeline = Some(ctx.render.create_pipeline(&desc)?);

        let extent = ctx.render.render_size();
        self.viewport = Viewport::full(extent);
        self.scissor = Scissor::full(extent);
        Ok(())
    }

    fn execute(&mut self, ctx: &mut PassContext) -> RenderResult<()> {
        let pipeline = self.pipeline.ok_or(RenderError::NotLive("scene pipeline"))?;
        let args = ctx
            .object::<MeshBuffer>(self.mesh)?
            .draw_args()
            .ok_or(RenderError::NotLive("scene mesh"))?;

        ctx.render.set_display(self.viewport, self.scissor)?;
        ctx.render.set_pipeline(pipeline)?;
        ctx.render.set_vertex_buffer(args.vertex_buffer, args.vertex_stride)?;
        ctx.render.set_index_buffer(args.index_buffer, args.index_format)?;
        ctx.render.draw_indexed(args.index_count, 1)
    }

    fn destroy(&mut self, ctx: &mut PassContext) {
        if let Some(pipeline) = self.pipeline.take() {
            ctx.render.destroy_pipeline(pipeline);
        }
    }
}
