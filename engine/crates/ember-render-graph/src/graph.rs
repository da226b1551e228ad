use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use ember_gfx::basic::extent::Extent2D;
use ember_gfx::basic::resource_state::ResourceState;
use ember_gfx::commands::command::Transition;
use ember_render_interface::asset_depot::AssetDepot;
use ember_render_interface::render_context::{ContextChange, RenderContext};
use ember_render_interface::render_error::{RenderError, RenderResult};

use crate::graph_object::{CreateContext, GraphObject, Lifecycle};
use crate::pass::{CommandPass, PassContext, effective_attachments};
use crate::registry::{ObjectId, Objects, PassId, Passes, ResourceId, Resources};
use crate::resource_handle::ResourceHandle;
use crate::resource_states::ResourceStates;
use crate::state_dep::StateDep;

/// 默认允许的渲染故障数：恢复两次，第三次故障结束会话
pub const DEFAULT_FAULT_LIMIT: u32 = 3;

/// Render graph
///
/// 持有 RenderContext 以及所有的 pass、资源 handle 和 graph object。
///
/// # 调度
/// pass 按注册顺序执行，不做依赖排序；执行前根据 attachment 与全局状态表插入状态转换。
///
/// # 重建
/// 全局配置变化时（分辨率、back buffer 数量、适配器、全屏），先等待 GPU 完成所有工作，
/// 然后逆序销毁依赖该配置的对象，修改配置，再按注册顺序重新创建。
///
/// # 线程
/// graph 只能在创建它的线程（render 线程）上使用，其它线程的请求需要通过工作队列转发。
pub struct Graph {
    context: RenderContext,
    depot: Box<dyn AssetDepot>,

    states: ResourceStates,
    objects: Objects,
    resources: Resources,
    passes: Passes,

    /// 重建期间置位
    busy: Arc<AtomicBool>,
    owner: ThreadId,

    fault_limit: u32,
    render_faults: u32,
    recoveries: u32,
}

// new & init
impl Graph {
    pub fn new(context: RenderContext, depot: Box<dyn AssetDepot>) -> Self {
        Self {
            context,
            depot,
            states: ResourceStates::new(),
            objects: Objects::default(),
            resources: Resources::default(),
            passes: Passes::default(),
            busy: Arc::new(AtomicBool::new(false)),
            owner: thread::current().id(),
            fault_limit: DEFAULT_FAULT_LIMIT,
            render_faults: 0,
            recoveries: 0,
        }
    }

    /// 本次会话允许的渲染故障数，达到该值的故障不再恢复
    pub fn with_fault_limit(mut self, fault_limit: u32) -> Self {
        self.fault_limit = fault_limit.max(1);
        self
    }
}

// destroy
impl Drop for Graph {
    fn drop(&mut self) {
        if let Err(e) = self.context.flush() {
            log::warn!("failed to flush queues while dropping render graph: {}", e);
        }
        self.destroy_if(StateDep::all());
    }
}

// register
impl Graph {
    /// 注册并立即创建一个资源 handle
    pub fn add_resource(&mut self, handle: ResourceHandle) -> RenderResult<ResourceId> {
        self.check_thread();
        let id = self.resources.insert(handle);
        if let Err(e) = self.create_resource(id) {
            log::error!("failed to create resource: {}", e);
            self.resources.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    /// 注册并立即创建一个 graph object
    pub fn add_object<T: GraphObject>(&mut self, object: T) -> RenderResult<ObjectId> {
        self.check_thread();
        let id = self.objects.insert(Box::new(object));
        if let Err(e) = self.create_object(id) {
            self.objects.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    /// 注册并立即创建一个 pass
    pub fn add_pass<T: CommandPass>(&mut self, pass: T) -> RenderResult<PassId> {
        self.check_thread();
        let id = self.passes.insert(Box::new(pass));
        if let Err(e) = self.create_pass(id) {
            self.passes.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn remove_pass(&mut self, id: PassId) -> RenderResult<()> {
        let _busy = self.lock()?;
        self.context.flush()?;
        self.destroy_pass(id);
        self.passes.remove(id);
        Ok(())
    }

    pub fn remove_resource(&mut self, id: ResourceId) -> RenderResult<()> {
        let _busy = self.lock()?;
        self.context.flush()?;
        self.destroy_resource(id);
        self.resources.remove(id);
        Ok(())
    }

    pub fn remove_object(&mut self, id: ObjectId) -> RenderResult<()> {
        let _busy = self.lock()?;
        self.context.flush()?;
        self.destroy_object(id);
        self.objects.remove(id);
        Ok(())
    }
}

// lifecycle
impl Graph {
    fn create_object(&mut self, id: ObjectId) -> RenderResult<()> {
        let Self {
            context,
            depot,
            states,
            objects,
            ..
        } = self;
        let Some(entry) = objects.entry_mut(id) else {
            return Ok(());
        };
        if entry.lifecycle.is_created() {
            return Ok(());
        }

        let mut ctx = CreateContext {
            render: context,
            states,
            depot: &**depot,
        };
        match entry.object.create(&mut ctx) {
            Ok(()) => {
                entry.lifecycle = Lifecycle::Created;
                Ok(())
            }
            Err(e) => {
                log::error!("failed to create object {}: {}", entry.object.name(), e);
                entry.object.destroy(&mut ctx);
                entry.lifecycle = Lifecycle::Destroyed;
                Err(e)
            }
        }
    }

    fn destroy_object(&mut self, id: ObjectId) {
        let Self {
            context,
            depot,
            states,
            objects,
            ..
        } = self;
        let Some(entry) = objects.entry_mut(id) else {
            return;
        };
        if !entry.lifecycle.is_created() {
            return;
        }

        let mut ctx = CreateContext {
            render: context,
            states,
            depot: &**depot,
        };
        entry.object.destroy(&mut ctx);
        entry.lifecycle = Lifecycle::Destroyed;
    }

    fn create_resource(&mut self, id: ResourceId) -> RenderResult<()> {
        let Self {
            context,
            depot,
            states,
            resources,
            ..
        } = self;
        let Some(handle) = resources.get_mut(id) else {
            return Ok(());
        };
        if handle.lifecycle().is_created() {
            return Ok(());
        }

        let mut ctx = CreateContext {
            render: context,
            states,
            depot: &**depot,
        };
        handle.create(&mut ctx)
    }

    fn destroy_resource(&mut self, id: ResourceId) {
        let Self {
            context,
            depot,
            states,
            resources,
            ..
        } = self;
        let Some(handle) = resources.get_mut(id) else {
            return;
        };

        let mut ctx = CreateContext {
            render: context,
            states,
            depot: &**depot,
        };
        handle.destroy(&mut ctx);
    }

    fn create_pass(&mut self, id: PassId) -> RenderResult<()> {
        let Self {
            context,
            depot,
            states,
            objects,
            resources,
            passes,
            ..
        } = self;
        let Some(entry) = passes.entry_mut(id) else {
            return Ok(());
        };
        if entry.lifecycle.is_created() {
            return Ok(());
        }

        let mut ctx = PassContext {
            render: context,
            states,
            depot: &**depot,
            resources,
            objects,
        };
        match entry.pass.create(&mut ctx) {
            Ok(()) => {
                entry.lifecycle = Lifecycle::Created;
                Ok(())
            }
            Err(e) => {
                log::error!("failed to create pass {}: {}", entry.pass.name(), e);
                entry.pass.destroy(&mut ctx);
                entry.lifecycle = Lifecycle::Destroyed;
                Err(e)
            }
        }
    }

    fn destroy_pass(&mut self, id: PassId) {
        let Self {
            context,
            depot,
            states,
            objects,
            resources,
            passes,
            ..
        } = self;
        let Some(entry) = passes.entry_mut(id) else {
            return;
        };
        if !entry.lifecycle.is_created() {
            return;
        }

        let mut ctx = PassContext {
            render: context,
            states,
            depot: &**depot,
            resources,
            objects,
        };
        entry.pass.destroy(&mut ctx);
        entry.lifecycle = Lifecycle::Destroyed;
    }

    /// 按注册顺序创建受 `changed` 影响的对象：object -> resource -> pass
    fn create_if(&mut self, changed: StateDep) -> RenderResult<()> {
        for id in self.objects.ids().to_vec() {
            let deps = self.objects.dependencies(id);
            if deps.is_some_and(|d| d.is_affected_by(changed)) {
                self.create_object(id)?;
            }
        }
        for id in self.resources.ids().to_vec() {
            let deps = self.resources.get(id).map(|h| h.dependencies());
            if deps.is_some_and(|d| d.is_affected_by(changed)) {
                self.create_resource(id)?;
            }
        }
        for id in self.passes.ids().to_vec() {
            let deps = self.passes.dependencies(id);
            if deps.is_some_and(|d| d.is_affected_by(changed)) {
                self.create_pass(id)?;
            }
        }
        Ok(())
    }

    /// 逆序销毁受 `changed` 影响的对象：pass -> resource -> object
    fn destroy_if(&mut self, changed: StateDep) {
        for id in self.passes.ids().iter().rev().copied().collect::<Vec<_>>() {
            if self.passes.dependencies(id).is_some_and(|d| d.is_affected_by(changed)) {
                self.destroy_pass(id);
            }
        }
        for id in self.resources.ids().iter().rev().copied().collect::<Vec<_>>() {
            let deps = self.resources.get(id).map(|h| h.dependencies());
            if deps.is_some_and(|d| d.is_affected_by(changed)) {
                self.destroy_resource(id);
            }
        }
        for id in self.objects.ids().iter().rev().copied().collect::<Vec<_>>() {
            if self.objects.dependencies(id).is_some_and(|d| d.is_affected_by(changed)) {
                self.destroy_object(id);
            }
        }

        // 设备重建之后旧设备的资源全部失效
        if changed.contains(StateDep::DEVICE) {
            self.states.clear();
        }
    }
}

// execute
impl Graph {
    /// 执行一帧
    ///
    /// graph 正在重建时返回 `Ok(false)`，不做任何事情
    pub fn execute(&mut self) -> RenderResult<bool> {
        self.check_thread();
        if self.busy.load(Ordering::Acquire) {
            return Ok(false);
        }
        let _span = tracy_client::span!("Graph::execute");

        self.context.begin_render()?;
        self.context.begin_direct()?;

        let mut present = false;
        for id in self.passes.ids().to_vec() {
            present |= self.execute_pass(id)?;
        }

        self.context.end_direct()?;
        self.context.end_render(present)?;
        Ok(true)
    }

    /// 插入状态转换，绑定 render target，然后执行 pass
    fn execute_pass(&mut self, id: PassId) -> RenderResult<bool> {
        let Self {
            context,
            depot,
            states,
            objects,
            resources,
            passes,
            ..
        } = self;
        let Some(entry) = passes.entry_mut(id) else {
            return Ok(false);
        };
        assert!(
            entry.lifecycle.is_created(),
            "pass {} executed while {:?}",
            entry.pass.name(),
            entry.lifecycle
        );

        let frame_index = context.frame_index();
        let mut transitions = Vec::new();
        for attachment in effective_attachments(&*entry.pass) {
            let resource = resources
                .get(attachment.resource)
                .and_then(|h| h.resource(frame_index))
                .ok_or_else(|| {
                    RenderError::Validation(format!(
                        "pass {} references resource {:?} which is not live",
                        entry.pass.name(),
                        attachment.resource
                    ))
                })?;

            let current = states.try_get(resource).ok_or_else(|| {
                RenderError::Validation(format!("resource {:?} has no recorded state", attachment.resource))
            })?;
            if current != attachment.state {
                transitions.push(Transition {
                    resource,
                    before: current,
                    after: attachment.state,
                });
                states.set(resource, attachment.state);
            }
        }
        context.transition(transitions)?;

        if let Some(binding) = entry.pass.render_target() {
            let target = resources.get(binding.target);
            let rtv = target.and_then(|h| h.rtv(frame_index)).ok_or_else(|| {
                RenderError::Validation(format!("render target of pass {} has no rtv", entry.pass.name()))
            })?;
            let clear_color = target.and_then(|h| h.clear_color());
            let dsv = match binding.depth {
                Some(depth) => Some(resources.get(depth).and_then(|h| h.dsv(frame_index)).ok_or_else(|| {
                    RenderError::Validation(format!("depth target of pass {} has no dsv", entry.pass.name()))
                })?),
                None => None,
            };
            context.bind_render_target(rtv, dsv, clear_color)?;
        }

        let mut ctx = PassContext {
            render: context,
            states,
            depot: &**depot,
            resources,
            objects,
        };
        ctx.render.begin_event(entry.pass.name())?;
        entry.pass.execute(&mut ctx)?;
        ctx.render.end_event()?;

        Ok(entry.pass.presents())
    }

    /// 执行一帧，并处理渲染故障
    ///
    /// 可恢复的错误计入故障数并触发完整的设备重建；故障数达到上限时返回
    /// [`RenderError::FaultLimitExceeded`]。返回值表示这一帧是否被执行。
    ///
    /// 重建失败但已经回退时 graph 仍然可用，视为恢复成功；回退也失败时再计一次故障并重试重建。
    pub fn run_frame(&mut self) -> RenderResult<bool> {
        match self.execute() {
            Ok(executed) => Ok(executed),
            Err(e) if e.is_recoverable() => {
                self.count_fault(e)?;
                loop {
                    match self.resume_from_fault() {
                        Ok(()) => return Ok(false),
                        Err(RenderError::RebuildFailed { reverted: true, source, .. }) => {
                            self.recoveries += 1;
                            log::warn!("fault recovery failed ({}) but the rebuild was reverted", source);
                            return Ok(false);
                        }
                        Err(e @ RenderError::RebuildFailed { reverted: false, .. }) => self.count_fault(e)?,
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) => {
                log::error!("{} unrecoverable render error: {}", self.context.frame_name(), e);
                Err(e)
            }
        }
    }

    /// 故障数加一，达到上限时返回 [`RenderError::FaultLimitExceeded`]
    fn count_fault(&mut self, error: RenderError) -> RenderResult<()> {
        self.render_faults += 1;
        log::error!(
            "{} render fault {}/{}: {}",
            self.context.frame_name(),
            self.render_faults,
            self.fault_limit,
            error
        );

        if self.render_faults >= self.fault_limit {
            log::error!("render fault limit of {} reached, giving up", self.fault_limit);
            return Err(RenderError::FaultLimitExceeded {
                faults: self.render_faults,
                limit: self.fault_limit,
                source: Box::new(error),
            });
        }
        Ok(())
    }
}

// change
impl Graph {
    /// 停下所有 GPU 工作，重建受 `changed` 影响的对象
    ///
    /// 失败时销毁已经创建的部分，回退到原来的配置并重建，然后返回 [`RenderError::RebuildFailed`]。
    pub fn change_data(&mut self, changed: StateDep, change: ContextChange) -> RenderResult<()> {
        if self.context.is_unchanged(change) {
            log::debug!("{} unchanged, skipping rebuild", change);
            return Ok(());
        }
        let _busy = self.lock()?;
        let _span = tracy_client::span!("Graph::change_data");

        match self.context.flush() {
            Ok(()) => {}
            // 设备已经丢失时 flush 可能失败，设备重建无论如何都会进行
            Err(e) if changed.contains(StateDep::DEVICE) => log::warn!("flush before {} failed: {}", change, e),
            Err(e) => return Err(e),
        }

        let revert = self.context.revert_of(change);
        self.destroy_if(changed);

        let result = self.context.apply_change(change).and_then(|()| self.create_if(changed));
        let Err(error) = result else {
            return Ok(());
        };

        log::error!("failed to apply {}: {}, reverting to {}", change, error, revert);
        self.destroy_if(changed);
        let reverted = self.context.apply_change(revert).and_then(|()| self.create_if(changed));
        if let Err(e) = &reverted {
            log::error!("failed to revert to {}: {}", revert, e);
            self.destroy_if(changed);
        }

        Err(RenderError::RebuildFailed {
            change: change.to_string(),
            reverted: reverted.is_ok(),
            source: Box::new(error),
        })
    }

    pub fn resize_display(&mut self, size: Extent2D) -> RenderResult<()> {
        self.change_data(StateDep::DISPLAY_SIZE, ContextChange::DisplaySize(size))
    }

    pub fn resize_render(&mut self, size: Extent2D) -> RenderResult<()> {
        self.change_data(StateDep::RENDER_SIZE, ContextChange::RenderSize(size))
    }

    pub fn change_back_buffer_count(&mut self, count: u32) -> RenderResult<()> {
        self.change_data(StateDep::BACK_BUFFER_COUNT, ContextChange::BackBufferCount(count))
    }

    pub fn change_adapter(&mut self, index: usize) -> RenderResult<()> {
        self.change_data(StateDep::DEVICE, ContextChange::Adapter(index))
    }

    pub fn set_fullscreen(&mut self, fullscreen: bool) -> RenderResult<()> {
        self.change_data(StateDep::DISPLAY_SIZE, ContextChange::Fullscreen(fullscreen))
    }

    /// 完整的设备重建
    pub fn resume_from_fault(&mut self) -> RenderResult<()> {
        let _span = tracy_client::span!("Graph::resume_from_fault");
        self.change_data(StateDep::DEVICE, ContextChange::ResumeFromFault)?;
        self.recoveries += 1;
        log::info!("recovered from render fault ({} recoveries)", self.recoveries);
        Ok(())
    }
}

// tools
impl Graph {
    fn check_thread(&self) {
        assert_eq!(thread::current().id(), self.owner, "render graph used outside of its render thread");
    }

    /// 置位 busy，离开作用域时清除
    fn lock(&self) -> RenderResult<scopeguard::ScopeGuard<Arc<AtomicBool>, fn(Arc<AtomicBool>)>> {
        self.check_thread();
        if self.busy.swap(true, Ordering::AcqRel) {
            log::error!("render graph is already being reconfigured");
            return Err(RenderError::Reentrant);
        }
        let release: fn(Arc<AtomicBool>) = |busy| busy.store(false, Ordering::Release);
        Ok(scopeguard::guard(self.busy.clone(), release))
    }
}

// getters
impl Graph {
    #[inline]
    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    /// 直接操作 context，例如上传数据
    #[inline]
    pub fn context_mut(&mut self) -> &mut RenderContext {
        &mut self.context
    }

    #[inline]
    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    #[inline]
    pub fn objects(&self) -> &Objects {
        &self.objects
    }

    #[inline]
    pub fn passes(&self) -> &Passes {
        &self.passes
    }

    #[inline]
    pub fn states(&self) -> &ResourceStates {
        &self.states
    }

    pub fn resource(&self, id: ResourceId) -> Option<&ResourceHandle> {
        self.resources.get(id)
    }

    pub fn object<T: GraphObject>(&self, id: ObjectId) -> Option<&T> {
        self.objects.get::<T>(id)
    }

    pub fn pass<T: CommandPass>(&self, id: PassId) -> Option<&T> {
        self.passes.get::<T>(id)
    }

    pub fn pass_mut<T: CommandPass>(&mut self, id: PassId) -> Option<&mut T> {
        self.passes.get_mut::<T>(id)
    }

    /// 资源在当前帧的状态
    pub fn resource_state(&self, id: ResourceId) -> Option<ResourceState> {
        self.resources.get(id)?.current_state(&self.states, self.context.frame_index())
    }

    /// 写入 uniform buffer
    pub fn write_uniform<T: bytemuck::Pod>(&mut self, id: ResourceId, value: &T) -> RenderResult<()> {
        let resource = self
            .resources
            .get(id)
            .and_then(|h| h.resource(0))
            .ok_or(RenderError::NotLive("uniform buffer"))?;
        self.context.write_buffer(resource, 0, bytemuck::bytes_of(value))
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    #[inline]
    pub fn fault_count(&self) -> u32 {
        self.render_faults
    }

    #[inline]
    pub fn fault_limit(&self) -> u32 {
        self.fault_limit
    }

    #[inline]
    pub fn recovery_count(&self) -> u32 {
        self.recoveries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use ember_gfx::basic::format::PixelFormat;
    use ember_gfx::gfx_error::GfxError;
    use ember_gfx::headless::instance::HeadlessInstance;
    use ember_gfx::headless::probe::HeadlessProbe;
    use ember_gfx::resources::texture::{TextureDesc, TextureUsage};
    use ember_render_interface::asset_depot::MemoryDepot;
    use ember_render_interface::create_info::RenderCreateInfo;

    use crate::pass::{PassAttachment, RenderTargetBinding};
    use crate::resource_handle::{ExtentSource, ResourceKind, ViewCaps};

    type EventLog = Arc<Mutex<Vec<String>>>;

    /// 记录 create / execute / destroy 调用的 pass
    struct CountingPass {
        name: String,
        deps: StateDep,
        attachments: Vec<PassAttachment>,
        target: Option<RenderTargetBinding>,
        presents: bool,
        log: EventLog,
    }

    impl CountingPass {
        fn new(name: &str, log: &EventLog) -> Self {
            Self {
                name: name.to_string(),
                deps: StateDep::DEVICE,
                attachments: Vec::new(),
                target: None,
                presents: false,
                log: log.clone(),
            }
        }

        fn with_deps(mut self, deps: StateDep) -> Self {
            self.deps = deps;
            self
        }

        fn reading(mut self, resource: ResourceId, state: ResourceState) -> Self {
            self.attachments.push(PassAttachment::new(resource, state));
            self
        }

        fn writing(mut self, target: ResourceId) -> Self {
            self.target = Some(RenderTargetBinding { target, depth: None });
            self
        }

        fn presenting(mut self) -> Self {
            self.presents = true;
            self
        }

        fn push(&self, event: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", event, self.name));
        }
    }

    impl CommandPass for CountingPass {
        fn name(&self) -> &str {
            &self.name
        }

        fn dependencies(&self) -> StateDep {
            self.deps
        }

        fn attachments(&self) -> &[PassAttachment] {
            &self.attachments
        }

        fn render_target(&self) -> Option<RenderTargetBinding> {
            self.target
        }

        fn presents(&self) -> bool {
            self.presents
        }

        fn create(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
            self.push("create");
            Ok(())
        }

        fn execute(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
            self.push("execute");
            Ok(())
        }

        fn destroy(&mut self, _ctx: &mut PassContext) {
            self.push("destroy");
        }
    }

    fn create_graph() -> (Graph, HeadlessProbe, EventLog) {
        let instance = HeadlessInstance::new();
        let probe = instance.probe();
        let create_info = RenderCreateInfo {
            display_size: Extent2D::new(64, 32),
            render_size: Extent2D::new(32, 16),
            ..Default::default()
        };
        let context = RenderContext::new(Box::new(instance), create_info).unwrap();
        let graph = Graph::new(context, Box::new(MemoryDepot::new()));
        (graph, probe, Arc::new(Mutex::new(Vec::new())))
    }

    fn events(log: &EventLog) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn count(log: &EventLog, event: &str) -> usize {
        log.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    fn scene_target() -> ResourceHandle {
        ResourceHandle::scene_target("scene", PixelFormat::Rgba8Unorm, glam::Vec4::new(0.1, 0.2, 0.3, 1.0))
    }

    /// 只依赖 back buffer 数量的纹理
    fn history_texture() -> ResourceHandle {
        let desc = TextureDesc::new("history", Extent2D::new(4, 4), PixelFormat::Rgba8Unorm, TextureUsage::SHADER_READ)
            .with_initial_state(ResourceState::ShaderResource);
        ResourceHandle::new(
            "history",
            ResourceKind::Texture {
                desc,
                extent: ExtentSource::Fixed,
            },
            ViewCaps::SRV,
            StateDep::BACK_BUFFER_COUNT,
        )
    }

    #[test]
    fn test_single_transition_between_writer_and_reader() {
        let (mut graph, probe, log) = create_graph();
        let scene = graph.add_resource(scene_target()).unwrap();
        graph.add_pass(CountingPass::new("a", &log).writing(scene)).unwrap();
        graph
            .add_pass(CountingPass::new("b", &log).reading(scene, ResourceState::ShaderResource))
            .unwrap();

        probe.clear_records();
        assert!(graph.execute().unwrap());
        assert_eq!(events(&log)[2..], ["execute:a".to_string(), "execute:b".to_string()]);

        let resource = graph.resource(scene).unwrap().resource(0).unwrap();
        let rt_to_sr = probe
            .transitions()
            .into_iter()
            .filter(|t| {
                t.resource == resource && t.before == ResourceState::RenderTarget && t.after == ResourceState::ShaderResource
            })
            .count();
        assert_eq!(rt_to_sr, 1);
        assert_eq!(graph.resource_state(scene), Some(ResourceState::ShaderResource));
    }

    #[test]
    fn test_state_map_follows_last_attachment() {
        let (mut graph, probe, log) = create_graph();
        let swap_chain = graph.add_resource(ResourceHandle::swap_chain()).unwrap();
        graph
            .add_pass(CountingPass::new("draw", &log).with_deps(StateDep::DISPLAY_SIZE).writing(swap_chain))
            .unwrap();
        graph
            .add_pass(
                CountingPass::new("present", &log)
                    .reading(swap_chain, ResourceState::Present)
                    .presenting(),
            )
            .unwrap();

        for _ in 0..3 {
            assert!(graph.run_frame().unwrap());
            assert_eq!(graph.resource_state(swap_chain), Some(ResourceState::Present));
        }
        let presents = probe.presents().iter().map(|p| p.frame_index).collect::<Vec<_>>();
        assert_eq!(presents, vec![0, 1, 0]);

        // 每个 back buffer 最终都回到 Present
        let handle = graph.resource(swap_chain).unwrap();
        for slot in handle.slots() {
            assert_eq!(graph.states().try_get(slot.resource.unwrap()), Some(ResourceState::Present));
        }
    }

    #[test]
    fn test_render_resize_rebuilds_only_dependents() {
        let (mut graph, _probe, log) = create_graph();
        let scene = graph.add_resource(scene_target()).unwrap();
        let history = graph.add_resource(history_texture()).unwrap();
        graph
            .add_pass(CountingPass::new("scene", &log).with_deps(StateDep::RENDER_SIZE).writing(scene))
            .unwrap();
        graph.add_pass(CountingPass::new("ui", &log)).unwrap();
        graph.execute().unwrap();

        let history_resource = graph.resource(history).unwrap().resource(0);
        let history_srv = graph.resource(history).unwrap().srv(0);

        graph.resize_render(Extent2D::new(48, 24)).unwrap();

        assert_eq!(count(&log, "destroy:scene"), 1);
        assert_eq!(count(&log, "create:scene"), 2);
        assert_eq!(count(&log, "destroy:ui"), 0);
        assert_eq!(count(&log, "create:ui"), 1);

        let scene = graph.resource(scene).unwrap();
        assert_eq!(scene.generation(), 2);
        assert_eq!(scene.extent(), Some(Extent2D::new(48, 24)));

        let history = graph.resource(history).unwrap();
        assert_eq!(history.generation(), 1);
        assert_eq!(history.resource(0), history_resource);
        assert_eq!(history.srv(0), history_srv);

        assert!(graph.execute().unwrap());
    }

    #[test]
    fn test_unmatched_mask_touches_nothing() {
        let (mut graph, _probe, log) = create_graph();
        let scene = graph.add_resource(scene_target()).unwrap();
        graph
            .add_pass(CountingPass::new("scene", &log).with_deps(StateDep::RENDER_SIZE).writing(scene))
            .unwrap();
        let before = events(&log);

        graph.change_back_buffer_count(3).unwrap();
        assert_eq!(graph.context().back_buffer_count(), 3);
        assert_eq!(events(&log), before);
        assert_eq!(graph.resource(scene).unwrap().generation(), 1);
        assert!(graph.execute().unwrap());
    }

    #[test]
    fn test_unchanged_value_skips_rebuild() {
        let (mut graph, probe, log) = create_graph();
        graph.add_pass(CountingPass::new("fullscreen", &log).with_deps(StateDep::DISPLAY_SIZE)).unwrap();

        graph.set_fullscreen(false).unwrap();
        graph.resize_display(Extent2D::new(64, 32)).unwrap();
        assert_eq!(events(&log), vec!["create:fullscreen".to_string()]);
        assert_eq!(probe.devices_created(), 1);
    }

    #[test]
    fn test_device_rebuild_recreates_everything() {
        let (mut graph, probe, log) = create_graph();
        let scene = graph.add_resource(scene_target()).unwrap();
        graph.add_pass(CountingPass::new("scene", &log).writing(scene)).unwrap();
        graph.execute().unwrap();

        graph.change_adapter(1).unwrap();
        assert_eq!(graph.context().adapter_index(), 1);
        assert_eq!(probe.devices_created(), 2);
        assert_eq!(count(&log, "create:scene"), 2);
        assert_eq!(graph.resource(scene).unwrap().generation(), 2);
        // 旧设备的状态被清空，只剩新资源的初始状态
        assert_eq!(graph.states().len(), 1);
        assert!(graph.execute().unwrap());
    }

    #[test]
    fn test_fault_limit_bounds_recoveries() {
        let (graph, probe, log) = create_graph();
        let mut graph = graph.with_fault_limit(3);
        graph.add_pass(CountingPass::new("scene", &log)).unwrap();

        for expected in 1..=2 {
            probe.inject_device_removed();
            assert!(!graph.run_frame().unwrap());
            assert_eq!(graph.fault_count(), expected);
            assert_eq!(graph.recovery_count(), expected);
        }
        assert_eq!(probe.devices_created(), 3);

        probe.inject_device_removed();
        let err = graph.run_frame().unwrap_err();
        assert!(matches!(err, RenderError::FaultLimitExceeded { faults: 3, limit: 3, .. }));
        assert!(!err.is_recoverable());
        assert_eq!(graph.recovery_count(), 2);
        assert_eq!(probe.devices_created(), 3);
    }

    #[test]
    fn test_frames_continue_after_recovery() {
        let (graph, probe, log) = create_graph();
        assert_eq!(graph.fault_limit(), DEFAULT_FAULT_LIMIT);
        let mut graph = graph.with_fault_limit(2);
        graph.add_pass(CountingPass::new("scene", &log)).unwrap();

        probe.inject_device_removed();
        assert!(!graph.run_frame().unwrap());
        assert!(graph.run_frame().unwrap());
        assert!(graph.run_frame().unwrap());
        assert_eq!(graph.fault_count(), 1);
        assert_eq!(count(&log, "create:scene"), 2);
    }

    #[test]
    fn test_reverted_recovery_keeps_running() {
        let (graph, probe, log) = create_graph();
        let mut graph = graph.with_fault_limit(5);
        let scene = graph.add_resource(scene_target()).unwrap();
        graph.add_pass(CountingPass::new("scene", &log).writing(scene)).unwrap();

        probe.inject_device_removed();
        probe.fail_next_resource(GfxError::OutOfMemory("device"));
        assert!(!graph.run_frame().unwrap());
        assert_eq!(graph.fault_count(), 1);
        assert_eq!(graph.recovery_count(), 1);
        // 故障恢复一次，失败后回退又重建一次
        assert_eq!(probe.devices_created(), 3);
        assert!(graph.resource(scene).unwrap().lifecycle().is_created());

        assert!(graph.run_frame().unwrap());
        assert!(graph.run_frame().unwrap());
        assert_eq!(graph.fault_count(), 1);
    }

    #[test]
    fn test_failed_recovery_counts_as_fault() {
        let (graph, probe, log) = create_graph();
        let mut graph = graph.with_fault_limit(3);
        let scene = graph.add_resource(scene_target()).unwrap();
        graph.add_pass(CountingPass::new("scene", &log).writing(scene)).unwrap();

        // 恢复和回退都失败，重试一次之后成功
        probe.inject_device_removed();
        probe.fail_next_resource(GfxError::OutOfMemory("device"));
        probe.fail_next_resource(GfxError::OutOfMemory("device"));
        assert!(!graph.run_frame().unwrap());
        assert_eq!(graph.fault_count(), 2);
        assert_eq!(graph.recovery_count(), 1);
        assert!(graph.run_frame().unwrap());

    }

    #[test]
    fn test_failed_recovery_reaches_fault_limit() {
        let (graph, probe, log) = create_graph();
        let mut graph = graph.with_fault_limit(2);
        let scene = graph.add_resource(scene_target()).unwrap();
        graph.add_pass(CountingPass::new("scene", &log).writing(scene)).unwrap();

        probe.inject_device_removed();
        probe.fail_next_resource(GfxError::OutOfMemory("device"));
        probe.fail_next_resource(GfxError::OutOfMemory("device"));
        let err = graph.run_frame().unwrap_err();
        match &err {
            RenderError::FaultLimitExceeded { faults, limit, source } => {
                assert_eq!((*faults, *limit), (2, 2));
                assert!(matches!(**source, RenderError::RebuildFailed { reverted: false, .. }));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!err.is_recoverable());
        assert_eq!(graph.recovery_count(), 0);
    }

    #[test]
    fn test_unrecoverable_error_is_not_counted() {
        let (mut graph, probe, _log) = create_graph();
        probe.inject_fault(GfxError::Unsupported("mesh shaders".to_string()));
        let err = graph.run_frame().unwrap_err();
        assert!(matches!(err, RenderError::Gfx(GfxError::Unsupported(_))));
        assert_eq!(graph.fault_count(), 0);
    }

    #[test]
    fn test_failed_rebuild_reverts() {
        let (mut graph, probe, log) = create_graph();
        let scene = graph.add_resource(scene_target()).unwrap();
        graph
            .add_pass(CountingPass::new("scene", &log).with_deps(StateDep::RENDER_SIZE).writing(scene))
            .unwrap();

        probe.fail_next_resource(GfxError::OutOfMemory("device"));
        let err = graph.resize_render(Extent2D::new(4096, 4096)).unwrap_err();
        match &err {
            RenderError::RebuildFailed { reverted, source, .. } => {
                assert!(*reverted);
                assert!(matches!(**source, RenderError::Gfx(GfxError::OutOfMemory(_))));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(err.is_recoverable());

        assert_eq!(graph.context().render_size(), Extent2D::new(32, 16));
        let handle = graph.resource(scene).unwrap();
        assert!(handle.lifecycle().is_created());
        assert_eq!(handle.extent(), Some(Extent2D::new(32, 16)));
        assert_eq!(graph.passes().lifecycle(graph.passes().ids()[0]), Some(Lifecycle::Created));
        assert!(!graph.is_busy());
        assert!(graph.execute().unwrap());
    }

    #[test]
    fn test_busy_graph_skips_frames_and_rejects_changes() {
        let (mut graph, _probe, log) = create_graph();
        graph.add_pass(CountingPass::new("scene", &log)).unwrap();

        graph.busy.store(true, Ordering::Release);
        assert!(!graph.execute().unwrap());
        assert!(matches!(graph.resize_render(Extent2D::new(8, 8)), Err(RenderError::Reentrant)));
        graph.busy.store(false, Ordering::Release);

        assert!(graph.execute().unwrap());
        assert_eq!(count(&log, "execute:scene"), 1);
    }

    #[test]
    fn test_failed_registration_is_rolled_back() {
        let (mut graph, probe, _log) = create_graph();
        probe.fail_next_resource(GfxError::OutOfMemory("device"));
        assert!(graph.add_resource(scene_target()).is_err());
        assert!(graph.resources().is_empty());
        assert_eq!(graph.states().len(), 0);
    }

    #[test]
    fn test_remove_destroys_and_unregisters() {
        let (mut graph, probe, log) = create_graph();
        let live = probe.live_objects();
        let scene = graph.add_resource(scene_target()).unwrap();
        let pass = graph.add_pass(CountingPass::new("scene", &log).writing(scene)).unwrap();
        assert!(graph.pass::<CountingPass>(pass).is_some());

        graph.remove_pass(pass).unwrap();
        assert_eq!(count(&log, "destroy:scene"), 1);
        assert!(graph.passes().is_empty());
        assert!(graph.pass::<CountingPass>(pass).is_none());

        graph.remove_resource(scene).unwrap();
        assert!(graph.resource(scene).is_none());
        assert_eq!(probe.live_objects(), live);
        assert_eq!(graph.context().rtv_heap().unwrap().allocator().allocated_count(), 0);
    }

    #[test]
    fn test_drop_releases_all_objects() {
        let (mut graph, probe, log) = create_graph();
        let scene = graph.add_resource(scene_target()).unwrap();
        graph.add_resource(history_texture()).unwrap();
        graph.add_resource(ResourceHandle::swap_chain()).unwrap();
        graph.add_pass(CountingPass::new("scene", &log).writing(scene)).unwrap();
        graph.run_frame().unwrap();

        drop(graph);
        assert_eq!(count(&log, "destroy:scene"), 1);
        assert_eq!(probe.live_objects(), 0);
        assert_eq!(probe.live_devices(), 0);
    }
}
