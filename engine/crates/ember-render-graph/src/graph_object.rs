use std::any::Any;

use ember_render_interface::asset_depot::AssetDepot;
use ember_render_interface::render_context::RenderContext;
use ember_render_interface::render_error::RenderResult;

use crate::resource_states::ResourceStates;
use crate::state_dep::StateDep;

/// graph 中的对象（pass、资源 handle、graph object）所处的阶段
///
/// `Uninitialized -> Created -> Destroyed -> Created -> ...`，
/// 只有 `Created` 的对象会被执行或销毁。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    #[default]
    Uninitialized,
    Created,
    Destroyed,
}

impl Lifecycle {
    #[inline]
    pub fn is_created(self) -> bool {
        self == Lifecycle::Created
    }
}

/// 用于从 trait object 向下转型
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// 创建 / 销毁资源 handle 与 graph object 时可以访问的部分
pub struct CreateContext<'a> {
    pub render: &'a mut RenderContext,
    pub states: &'a mut ResourceStates,
    pub depot: &'a dyn AssetDepot,
}

/// 既不是 pass 也不是资源 handle 的 graph 对象，例如 mesh buffer
///
/// `destroy` 可能在 `create` 失败之后被调用，需要能处理只创建了一部分的情况。
pub trait GraphObject: AsAny + 'static {
    fn name(&self) -> &str;

    fn dependencies(&self) -> StateDep {
        StateDep::DEVICE
    }

    fn create(&mut self, ctx: &mut CreateContext) -> RenderResult<()>;

    fn destroy(&mut self, ctx: &mut CreateContext);
}
