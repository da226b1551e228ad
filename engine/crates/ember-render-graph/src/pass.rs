//! Pass 定义
//!
//! pass 通过 [`PassAttachment`] 声明执行前资源必须处于的状态，graph 负责在执行前插入状态转换。
//! 声明了 render target 的 pass 在执行前由 graph 绑定（并按需清除）render target 与深度。

use ember_gfx::basic::resource_state::ResourceState;
use ember_render_interface::asset_depot::AssetDepot;
use ember_render_interface::render_context::RenderContext;
use ember_render_interface::render_error::{RenderError, RenderResult};

use crate::graph_object::{AsAny, CreateContext, GraphObject};
use crate::registry::{ObjectId, Objects, ResourceId, Resources};
use crate::resource_handle::ResourceHandle;
use crate::resource_states::ResourceStates;
use crate::state_dep::StateDep;

/// pass 执行前 `resource` 必须处于 `state`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassAttachment {
    pub resource: ResourceId,
    pub state: ResourceState,
}

impl PassAttachment {
    #[inline]
    pub fn new(resource: ResourceId, state: ResourceState) -> Self {
        Self { resource, state }
    }
}

/// pass 输出到的 render target 与可选的深度
///
/// 隐式地添加 `RenderTarget` / `DepthWrite` attachment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTargetBinding {
    pub target: ResourceId,
    pub depth: Option<ResourceId>,
}

/// pass 在 create / execute / destroy 时可以访问的部分
pub struct PassContext<'a> {
    pub render: &'a mut RenderContext,
    pub states: &'a mut ResourceStates,
    pub depot: &'a dyn AssetDepot,
    pub resources: &'a Resources,
    pub objects: &'a Objects,
}

impl PassContext<'_> {
    #[inline]
    pub fn frame_index(&self) -> usize {
        self.render.frame_index()
    }

    pub fn resource(&self, id: ResourceId) -> RenderResult<&ResourceHandle> {
        self.resources
            .get(id)
            .ok_or_else(|| RenderError::Validation(format!("resource {:?} is not registered", id)))
    }

    pub fn object<T: GraphObject>(&self, id: ObjectId) -> RenderResult<&T> {
        self.objects
            .get::<T>(id)
            .ok_or_else(|| RenderError::Validation(format!("object {:?} is not a live {}", id, std::any::type_name::<T>())))
    }

    /// 供 pass 创建自己持有的 graph 外资源
    pub fn create_context(&mut self) -> CreateContext<'_> {
        CreateContext {
            render: &mut *self.render,
            states: &mut *self.states,
            depot: self.depot,
        }
    }
}

/// 一个 GPU 工作单元
///
/// - `create` 创建 pass 自己的对象（pipeline、buffer），失败时 graph 会调用 `destroy` 清理
/// - `execute` 每帧调用一次，调用前所有 attachment 已经处于声明的状态
/// - `dependencies` 决定哪些全局配置变化会让 pass 被销毁并重建
pub trait CommandPass: AsAny + 'static {
    fn name(&self) -> &str;

    fn dependencies(&self) -> StateDep {
        StateDep::DEVICE
    }

    fn attachments(&self) -> &[PassAttachment] {
        &[]
    }

    fn render_target(&self) -> Option<RenderTargetBinding> {
        None
    }

    /// 本帧结束时需要 present
    fn presents(&self) -> bool {
        false
    }

    fn create(&mut self, ctx: &mut PassContext) -> RenderResult<()> {
        let _ = ctx;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut PassContext) -> RenderResult<()>;

    fn destroy(&mut self, ctx: &mut PassContext) {
        let _ = ctx;
    }
}

/// 声明的 attachment 加上 render target 隐含的 attachment
pub(crate) fn effective_attachments(pass: &dyn CommandPass) -> Vec<PassAttachment> {
    let mut attachments = pass.attachments().to_vec();
    if let Some(binding) = pass.render_target() {
        attachments.push(PassAttachment::new(binding.target, ResourceState::RenderTarget));
        if let Some(depth) = binding.depth {
            attachments.push(PassAttachment::new(depth, ResourceState::DepthWrite));
        }
    }
    attachments
}
