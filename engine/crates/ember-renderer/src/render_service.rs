use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use ember_gfx::basic::extent::Extent2D;
use ember_gfx::foundation::instance::GfxInstance;
use ember_gfx::swapchain::display_queue::DisplayTarget;
use ember_render_graph::graph::Graph;
use ember_render_interface::asset_depot::AssetDepot;
use ember_render_interface::render_context::RenderContext;
use ember_render_interface::render_error::RenderResult;

use crate::render_config::RenderConfig;

/// 在 render 线程上对 graph 执行的任意操作，例如创建资源
pub type RenderWork = Box<dyn FnOnce(&mut Graph) -> RenderResult<()> + Send>;

enum RenderRequest {
    ChangeBackBufferCount(u32),
    ChangeAdapter(usize),
    ResizeDisplay(Extent2D),
    ResizeRender(Extent2D),
    SetFullscreen(bool),
    Work(RenderWork),
    Stop,
}

impl RenderRequest {
    fn name(&self) -> &'static str {
        match self {
            RenderRequest::ChangeBackBufferCount(_) => "change back buffer count",
            RenderRequest::ChangeAdapter(_) => "change adapter",
            RenderRequest::ResizeDisplay(_) => "resize display",
            RenderRequest::ResizeRender(_) => "resize render",
            RenderRequest::SetFullscreen(_) => "set fullscreen",
            RenderRequest::Work(_) => "work",
            RenderRequest::Stop => "stop",
        }
    }
}

/// render 线程退出时的统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub frames: u64,
    pub faults: u32,
    pub recoveries: u32,
}

/// 持有 render 线程
///
/// graph 只在 render 线程上创建和使用。其它线程的重建请求放进有界队列，
/// render 线程在每一帧开始前取出并依次执行。
pub struct RenderService {
    sender: Sender<RenderRequest>,
    frames: Arc<AtomicU64>,
    thread: Option<JoinHandle<RenderResult<RenderStats>>>,
}

// new & init
impl RenderService {
    /// 启动 render 线程，在线程上创建 context 和 graph，然后调用 `build` 注册 graph 的内容
    ///
    /// graph 创建失败时返回错误，不会留下运行中的线程
    pub fn start<B>(
        config: RenderConfig,
        instance: Box<dyn GfxInstance>,
        depot: Box<dyn AssetDepot>,
        display_target: DisplayTarget,
        build: B,
    ) -> anyhow::Result<Self>
    where
        B: FnOnce(&mut Graph) -> RenderResult<()> + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(config.queue_size.max(1));
        let (ready_sender, ready_receiver) = crossbeam_channel::bounded::<bool>(1);
        let frames = Arc::new(AtomicU64::new(0));

        let thread_frames = frames.clone();
        let thread = std::thread::Builder::new()
            .name("RenderThread".to_string())
            .spawn(move || {
                tracy_client::Client::start();
                tracy_client::set_thread_name!("RenderThread");

                let create_info = config.to_create_info(display_target);
                let graph = RenderContext::new(instance, create_info).and_then(|context| {
                    let mut graph = Graph::new(context, depot).with_fault_limit(config.fault_limit);
                    build(&mut graph)?;
                    Ok(graph)
                });

                let mut graph = match graph {
                    Ok(graph) => {
                        let _ = ready_sender.send(true);
                        graph
                    }
                    Err(e) => {
                        log::error!("failed to create render graph: {}", e);
                        let _ = ready_sender.send(false);
                        return Err(e);
                    }
                };

                render_loop(&mut graph, &receiver, &thread_frames)
            })
            .context("failed to spawn render thread")?;

        // 线程在发送之前 panic 时 recv 失败
        if !ready_receiver.recv().unwrap_or(false) {
            let joined = thread.join().map_err(|_| anyhow::anyhow!("render thread panicked during start-up"))?;
            return match joined {
                Err(e) => Err(anyhow::Error::from(e).context("failed to start render service")),
                Ok(_) => Err(anyhow::anyhow!("render thread exited during start-up")),
            };
        }

        log::info!("render service started");
        Ok(Self {
            sender,
            frames,
            thread: Some(thread),
        })
    }
}

/// 每一帧：先执行所有排队的请求，再渲染一帧
fn render_loop(graph: &mut Graph, receiver: &Receiver<RenderRequest>, frames: &AtomicU64) -> RenderResult<RenderStats> {
    loop {
        for request in receiver.try_iter() {
            if matches!(request, RenderRequest::Stop) {
                log::info!("render thread stopping after {} frames", frames.load(Ordering::Acquire));
                return Ok(RenderStats {
                    frames: frames.load(Ordering::Acquire),
                    faults: graph.fault_count(),
                    recoveries: graph.recovery_count(),
                });
            }
            apply_request(graph, request)?;
        }

        let _span = tracy_client::span!("RenderThread::frame");
        if graph.run_frame()? {
            frames.fetch_add(1, Ordering::AcqRel);
        }
        tracy_client::frame_mark();
    }
}

/// 可恢复的错误只记录日志，render 线程继续运行
fn apply_request(graph: &mut Graph, request: RenderRequest) -> RenderResult<()> {
    let name = request.name();
    let result = match request {
        RenderRequest::ChangeBackBufferCount(count) => graph.change_back_buffer_count(count),
        RenderRequest::ChangeAdapter(index) => graph.change_adapter(index),
        RenderRequest::ResizeDisplay(size) => graph.resize_display(size),
        RenderRequest::ResizeRender(size) => graph.resize_render(size),
        RenderRequest::SetFullscreen(fullscreen) => graph.set_fullscreen(fullscreen),
        RenderRequest::Work(work) => work(graph),
        RenderRequest::Stop => Ok(()),
    };

    match result {
        Err(e) if e.is_recoverable() => {
            log::error!("{} request failed: {}", name, e);
            Ok(())
        }
        other => other,
    }
}

// destroy
impl RenderService {
    /// 停止 render 线程并等待其退出
    ///
    /// render 线程因为错误提前退出时返回该错误
    pub fn join(mut self) -> anyhow::Result<RenderStats> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> anyhow::Result<RenderStats> {
        let Some(thread) = self.thread.take() else {
            anyhow::bail!("render thread already joined");
        };
        // 线程已经退出时发送失败，忽略
        let _ = self.sender.send(RenderRequest::Stop);

        let result = thread.join().map_err(|_| anyhow::anyhow!("render thread panicked"))?;
        let stats = result.context("render thread stopped with an error")?;
        log::info!(
            "render service stopped: {} frames, {} faults, {} recoveries",
            stats.frames,
            stats.faults,
            stats.recoveries
        );
        Ok(stats)
    }
}

impl Drop for RenderService {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.stop_and_join() {
                log::error!("{:#}", e);
            }
        }
    }
}

// requests
impl RenderService {
    pub fn change_back_buffer_count(&self, count: u32) -> anyhow::Result<()> {
        self.send(RenderRequest::ChangeBackBufferCount(count))
    }

    pub fn change_adapter(&self, index: usize) -> anyhow::Result<()> {
        self.send(RenderRequest::ChangeAdapter(index))
    }

    pub fn resize_display(&self, size: Extent2D) -> anyhow::Result<()> {
        self.send(RenderRequest::ResizeDisplay(size))
    }

    pub fn resize_render(&self, size: Extent2D) -> anyhow::Result<()> {
        self.send(RenderRequest::ResizeRender(size))
    }

    pub fn set_fullscreen(&self, fullscreen: bool) -> anyhow::Result<()> {
        self.send(RenderRequest::SetFullscreen(fullscreen))
    }

    /// 在 render 线程上执行 `work`
    pub fn enqueue_work(&self, work: impl FnOnce(&mut Graph) -> RenderResult<()> + Send + 'static) -> anyhow::Result<()> {
        self.send(RenderRequest::Work(Box::new(work)))
    }

    /// 队列满时阻塞
    fn send(&self, request: RenderRequest) -> anyhow::Result<()> {
        let name = request.name();
        self.sender
            .send(request)
            .map_err(|_| anyhow::anyhow!("render thread is not running, dropped {} request", name))
    }
}

// getters
impl RenderService {
    #[inline]
    pub fn frames_rendered(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// render 线程是否仍在运行
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// 等待 render 线程至少渲染 `frames` 帧
    pub fn wait_for_frames(&self, frames: u64, timeout: Duration) -> anyhow::Result<()> {
        let start = Instant::now();
        while self.frames_rendered() < frames {
            anyhow::ensure!(self.is_running(), "render thread stopped after {} frames", self.frames_rendered());
            anyhow::ensure!(
                start.elapsed() < timeout,
                "timed out waiting for frame {} ({} rendered)",
                frames,
                self.frames_rendered()
            );
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_gfx::gfx_error::GfxError;
    use ember_gfx::headless::instance::HeadlessInstance;
    use ember_render_interface::asset_depot::MemoryDepot;
    use ember_render_interface::render_error::RenderError;

    use crate::demo::{build_demo_graph, headless_depot};

    fn small_config(fault_limit: u32) -> RenderConfig {
        RenderConfig {
            fault_limit,
            draw_width: 64,
            draw_height: 32,
            queue_size: 4,
            ..Default::default()
        }
    }

    fn start(config: RenderConfig, instance: HeadlessInstance) -> RenderService {
        RenderService::start(
            config,
            Box::new(instance),
            Box::new(headless_depot()),
            DisplayTarget::Headless,
            |graph| build_demo_graph(graph).map(|_| ()),
        )
        .unwrap()
    }

    #[test]
    fn test_requests_run_on_render_thread() {
        let service = start(small_config(1), HeadlessInstance::new());
        service.wait_for_frames(3, Duration::from_secs(10)).unwrap();

        service.resize_render(Extent2D::new(16, 8)).unwrap();
        service.change_back_buffer_count(3).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        service
            .enqueue_work(move |graph| {
                let context = graph.context();
                let _ = tx.send((context.render_size(), context.back_buffer_count()));
                Ok(())
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), (Extent2D::new(16, 8), 3));

        let rendered = service.frames_rendered();
        service.wait_for_frames(rendered + 3, Duration::from_secs(10)).unwrap();
        let stats = service.join().unwrap();
        assert!(stats.frames >= rendered + 3);
        assert_eq!(stats.faults, 0);
    }

    #[test]
    fn test_recoverable_request_error_keeps_rendering() {
        let service = start(small_config(1), HeadlessInstance::new());
        service.change_adapter(9).unwrap();
        service.wait_for_frames(5, Duration::from_secs(10)).unwrap();
        assert!(service.is_running());
        service.join().unwrap();
    }

    /// 等待 render 线程自己退出，不发送 Stop
    fn wait_until_stopped(service: &RenderService, timeout: Duration) {
        let start = Instant::now();
        while service.is_running() {
            assert!(start.elapsed() < timeout, "render thread still running after {:?}", timeout);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_fault_limit_stops_render_thread() {
        let instance = HeadlessInstance::new();
        let probe = instance.probe();
        let service = start(small_config(2), instance);
        service.wait_for_frames(1, Duration::from_secs(10)).unwrap();

        let injector = probe.clone();
        service
            .enqueue_work(move |_| {
                injector.inject_device_removed();
                injector.inject_device_removed();
                Ok(())
            })
            .unwrap();

        wait_until_stopped(&service, Duration::from_secs(10));
        let err = service.join().unwrap_err();
        let terminal = err.chain().find_map(|e| e.downcast_ref::<RenderError>());
        assert!(matches!(terminal, Some(RenderError::FaultLimitExceeded { faults: 2, limit: 2, .. })));
        assert_eq!(probe.devices_created(), 2);
    }

    #[test]
    fn test_failed_recovery_keeps_rendering() {
        let instance = HeadlessInstance::new();
        let probe = instance.probe();
        let service = start(small_config(3), instance);
        service.wait_for_frames(1, Duration::from_secs(10)).unwrap();

        let injector = probe.clone();
        service
            .enqueue_work(move |_| {
                injector.inject_device_removed();
                injector.fail_next_resource(GfxError::OutOfMemory("device"));
                Ok(())
            })
            .unwrap();

        let rendered = service.frames_rendered();
        service.wait_for_frames(rendered + 5, Duration::from_secs(10)).unwrap();
        assert!(service.is_running());
        let stats = service.join().unwrap();
        assert_eq!(stats.faults, 1);
        assert_eq!(stats.recoveries, 1);
    }

    #[test]
    fn test_failed_start_reports_error() {
        let result = RenderService::start(
            small_config(1),
            Box::new(HeadlessInstance::new()),
            Box::new(MemoryDepot::new()),
            DisplayTarget::Headless,
            |graph| build_demo_graph(graph).map(|_| ()),
        );
        let err = result.err().unwrap();
        assert!(format!("{:#}", err).contains("failed to start render service"));
    }
}
