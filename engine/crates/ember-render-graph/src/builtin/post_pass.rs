use ember_gfx::basic::extent::{Extent2D, Scissor, Viewport};
use ember_gfx::basic::resource_state::ResourceState;
use ember_gfx::handles::GfxPipelineHandle;
use ember_gfx::resources::pipeline::GraphicsPipelineDesc;
use ember_render_interface::render_error::{RenderError, RenderResult};

use crate::pass::{CommandPass, PassAttachment, PassContext, RenderTargetBinding};
use crate::registry::ResourceId;
use crate::state_dep::StateDep;

pub const BLIT_VS: &str = "shaders/blit.vs.spv";
pub const BLIT_PS: &str = "shaders/blit.ps.spv";

/// 保持宽高比，把 `render` 大小的图像居中放进 `display`
pub fn letterbox(render: Extent2D, display: Extent2D) -> (Viewport, Scissor) {
    let scale = f32::min(
        display.width as f32 / render.width.max(1) as f32,
        display.height as f32 / render.height.max(1) as f32,
    );
    let width = render.width as f32 * scale;
    let height = render.height as f32 * scale;
    let x = (display.width as f32 - width) * 0.5;
    let y = (display.height as f32 - height) * 0.5;

    let viewport = Viewport {
        x,
        y,
        width,
        height,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = Scissor {
        left: x.round() as i32,
        top: y.round() as i32,
        right: (x + width).round() as i32,
        bottom: (y + height).round() as i32,
    };
    (viewport, scissor)
}

/// 把场景 render target 采样拷贝到 back buffer 上
///
/// 全屏三角形，场景纹理通过第 0 个 shader input 传入
pub struct PostPass {
    scene: ResourceId,
    swap_chain: ResourceId,
    attachments: [PassAttachment; 1],

    pipeline: Option<GfxPipelineHandle>,
    viewport: Viewport,
    scissor: Scissor,
}

impl PostPass {
    pub fn new(scene: ResourceId, swap_chain: ResourceId) -> Self {
        Self {
            scene,
            swap_chain,
            attachments: [PassAttachment::new(scene, ResourceState::ShaderResource)],
            pipeline: None,
            viewport: Viewport::default(),
            scissor: Scissor::default(),
        }
    }

    #[inline]
    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    #[inline]
    pub fn scissor(&self) -> Scissor {
        self.scissor
    }
}

impl CommandPass for PostPass {
    fn name(&self) -> &str {
        "post"
    }

    fn dependencies(&self) -> StateDep {
        StateDep::DISPLAY_SIZE | StateDep::RENDER_SIZE
    }

    fn attachments(&self) -> &[PassAttachment] {
        &self.attachments
    }

    fn render_target(&self) -> Option<RenderTargetBinding> {
        Some(RenderTargetBinding {
            target: self.swap_chain,
            depth: None,
        })
    }

    fn create(&mut self, ctx: &mut PassContext) -> RenderResult<()> {
        let desc = GraphicsPipelineDesc {
            name: "post-blit".to_string(),
            vertex_shader: ctx.depot.load_blob(BLIT_VS)?,
            pixel_shader: ctx.depot.load_blob(BLIT_PS)?,
            attributes: Vec::new(),
            vertex_stride: 0,
            shader_inputs: 1,
            color_format: ctx.render.create_info().display_format,
            depth_format: None,
        };
        self.pipeline = Some(ctx.render.create_pipeline(&desc)?);

        (self.viewport, self.scissor) = letterbox(ctx.render.render_size(), ctx.render.display_size());
        Ok(())
    }

    fn execute(&mut self, ctx: &mut PassContext) -> RenderResult<()> {
        let pipeline = self.pipeline.ok_or(RenderError::NotLive("post pipeline"))?;
        let srv = ctx
            .resource(self.scene)?
            .srv(ctx.frame_index())
            .ok_or(RenderError::NotLive("scene srv"))?;

        ctx.render.set_display(self.viewport, self.scissor)?;
        ctx.render.set_pipeline(pipeline)?;
        ctx.render.set_shader_input(0, srv)?;
        ctx.render.draw(3, 1)
    }

    fn destroy(&mut self, ctx: &mut PassContext) {
        if let Some(pipeline) = self.pipeline.take() {
            ctx.render.destroy_pipeline(pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letterbox_pillarboxes_narrow_render() {
        let (viewport, scissor) = letterbox(Extent2D::new(100, 100), Extent2D::new(200, 100));
        assert_eq!(viewport.x, 50.0);
        assert_eq!(viewport.y, 0.0);
        assert_eq!(viewport.width, 100.0);
        assert_eq!(viewport.height, 100.0);
        assert_eq!(
            scissor,
            Scissor {
                left: 50,
                top: 0,
                right: 150,
                bottom: 100
            }
        );
    }

    #[test]
    fn test_letterbox_fills_matching_aspect() {
        let (viewport, scissor) = letterbox(Extent2D::new(960, 540), Extent2D::new(1920, 1080));
        assert_eq!(viewport, Viewport::full(Extent2D::new(1920, 1080)));
        assert_eq!(scissor, Scissor::full(Extent2D::new(1920, 1080)));
    }
}
