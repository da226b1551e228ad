use ember_gfx::basic::resource_state::ResourceState;
use ember_render_interface::render_error::RenderResult;

use crate::pass::{CommandPass, PassAttachment, PassContext};
use crate::registry::ResourceId;
use crate::state_dep::StateDep;

/// 把 back buffer 转换到 `Present`，并让这一帧在结束时 present
///
/// 需要注册在最后
pub struct PresentPass {
    attachments: [PassAttachment; 1],
}

impl PresentPass {
    pub fn new(swap_chain: ResourceId) -> Self {
        Self {
            attachments: [PassAttachment::new(swap_chain, ResourceState::Present)],
        }
    }
}

impl CommandPass for PresentPass {
    fn name(&self) -> &str {
        "present"
    }

    fn dependencies(&self) -> StateDep {
        StateDep::DISPLAY_SIZE | StateDep::BACK_BUFFER_COUNT
    }

    fn attachments(&self) -> &[PassAttachment] {
        &self.attachments
    }

    fn presents(&self) -> bool {
        true
    }

    fn execute(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
        Ok(())
    }
}
