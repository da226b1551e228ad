use ember_gfx::basic::resource_state::ResourceState;
use ember_gfx::handles::GfxResourceHandle;
use slotmap::SecondaryMap;

/// 全局的 {资源 -> 当前状态} 表
///
/// 以设备资源为 key，而不是以 handle 为 key：指向同一资源的多个 handle 看到的是同一个状态。
/// 只在 render 线程上读写。
#[derive(Default)]
pub struct ResourceStates {
    states: SecondaryMap<GfxResourceHandle, ResourceState>,
}

impl ResourceStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取一个从未记录过的资源状态属于调用方错误
    pub fn get(&self, resource: GfxResourceHandle) -> ResourceState {
        match self.states.get(resource) {
            Some(state) => *state,
            None => panic!("state of resource {:?} read before it was recorded", resource),
        }
    }

    #[inline]
    pub fn try_get(&self, resource: GfxResourceHandle) -> Option<ResourceState> {
        self.states.get(resource).copied()
    }

    #[inline]
    pub fn set(&mut self, resource: GfxResourceHandle, state: ResourceState) {
        self.states.insert(resource, state);
    }

    #[inline]
    pub fn remove(&mut self, resource: GfxResourceHandle) -> Option<ResourceState> {
        self.states.remove(resource)
    }

    /// 设备重建之后旧设备的资源全部失效
    pub fn clear(&mut self) {
        self.states.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
