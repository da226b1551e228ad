use std::time::Duration;

use ember_crate_tools::ember_path::EmberPath;
use ember_gfx::basic::extent::Extent2D;
use ember_gfx::swapchain::display_queue::{DisplayTarget, SendableDisplayHandle, SendableWindowHandle};
use ember_gfx::vulkan::instance::VulkanInstance;
use ember_render_interface::asset_depot::FileDepot;
use ember_renderer::demo::build_demo_graph;
use ember_renderer::render_config::RenderConfig;
use ember_renderer::render_service::RenderService;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Fullscreen, Window, WindowId};

const RENDER_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// 窗口线程上的程序
///
/// render 线程独立地循环渲染，窗口线程只把事件转换为请求。
/// 窗口必须比 render 线程活得久，退出时先停止 render 线程再释放窗口。
pub struct WindowApp {
    config: RenderConfig,
    back_buffer_count: u32,
    fullscreen: bool,
    /// 内部渲染分辨率是否为 draw size 的一半
    half_render: bool,

    service: Option<RenderService>,
    window: Option<Window>,

    /// 启动或运行中出现的错误，事件循环结束后返回
    error: Option<anyhow::Error>,
}

// 总的 main 函数
impl WindowApp {
    /// 整个程序的入口
    pub fn run(config: RenderConfig) -> anyhow::Result<()> {
        tracy_client::Client::start();
        tracy_client::set_thread_name!("WindowThread");

        let event_loop = EventLoop::new()?;
        // 定期醒来检查 render 线程是否还在运行
        event_loop.set_control_flow(ControlFlow::wait_duration(RENDER_CHECK_INTERVAL));

        let mut app = Self {
            back_buffer_count: config.back_buffer_count,
            config,
            fullscreen: false,
            half_render: false,
            service: None,
            window: None,
            error: None,
        };
        event_loop.run_app(&mut app)?;

        log::info!("end run.");
        app.destroy()
    }
}

// new & init
impl WindowApp {
    /// 在 window 创建之后调用，启动 render 线程
    fn init_after_window(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let window_attr = Window::default_attributes()
            .with_title("Ember")
            .with_inner_size(winit::dpi::PhysicalSize::new(self.config.draw_width, self.config.draw_height));
        let window = event_loop.create_window(window_attr)?;

        let raw_display = window.display_handle()?.as_raw();
        let raw_window = window.window_handle()?.as_raw();
        let instance = VulkanInstance::new("Ember", Some(raw_display), self.config.device_flags())?;

        let service = RenderService::start(
            self.config.clone(),
            Box::new(instance),
            Box::new(FileDepot::new(EmberPath::assets_root())),
            DisplayTarget::Window {
                display: SendableDisplayHandle::new(raw_display),
                window: SendableWindowHandle::new(raw_window),
            },
            |graph| build_demo_graph(graph).map(|_| ()),
        )?;

        // 窗口管理器可能没有按要求的尺寸创建窗口
        let size = window.inner_size();
        if size.width != self.config.draw_width || size.height != self.config.draw_height {
            Self::resize(&service, Extent2D::new(size.width, size.height));
        }

        self.service = Some(service);
        self.window = Some(window);
        Ok(())
    }
}

// destroy
impl WindowApp {
    fn destroy(mut self) -> anyhow::Result<()> {
        let stopped = self.service.take().map(RenderService::join).transpose();
        self.window = None;

        if let Some(error) = self.error.take() {
            return Err(error);
        }
        let stats = stopped?;
        if let Some(stats) = stats {
            log::info!(
                "rendered {} frames with {} faults and {} recoveries",
                stats.frames,
                stats.faults,
                stats.recoveries
            );
        }
        Ok(())
    }
}

// tools
impl WindowApp {
    /// 最小化时尺寸为 0，不重建交换链
    fn resize(service: &RenderService, size: Extent2D) {
        if size.is_empty() {
            return;
        }
        if let Err(e) = service.resize_display(size) {
            log::error!("{:#}", e);
        }
    }

    fn on_key(&mut self, event: &KeyEvent) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        let (Some(service), Some(window)) = (&self.service, &self.window) else {
            return;
        };

        let result = match &event.logical_key {
            Key::Named(NamedKey::F11) => {
                self.fullscreen = !self.fullscreen;
                window.set_fullscreen(self.fullscreen.then_some(Fullscreen::Borderless(None)));
                service.set_fullscreen(self.fullscreen)
            }
            Key::Named(NamedKey::PageUp) => {
                self.back_buffer_count += 1;
                service.change_back_buffer_count(self.back_buffer_count)
            }
            Key::Named(NamedKey::PageDown) if self.back_buffer_count > 1 => {
                self.back_buffer_count -= 1;
                service.change_back_buffer_count(self.back_buffer_count)
            }
            Key::Character(c) if c.as_str() == "r" => {
                self.half_render = !self.half_render;
                let draw = self.config.draw_size();
                let size = if self.half_render {
                    Extent2D::new((draw.width / 2).max(1), (draw.height / 2).max(1))
                } else {
                    draw
                };
                service.resize_render(size)
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            log::error!("{:#}", e);
        }
    }
}

// 各种 winit 的事件处理
impl ApplicationHandler for WindowApp {
    // 建议在这里创建 window 和 Renderer
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        log::info!("winit event: resumed");

        if let Err(e) = self.init_after_window(event_loop) {
            log::error!("failed to start: {:#}", e);
            self.error = Some(e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(service) = &self.service {
                    Self::resize(service, Extent2D::new(size.width, size.height));
                }
            }
            WindowEvent::KeyboardInput { event, .. } => self.on_key(&event),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        // render 线程因错误退出时结束事件循环，错误由 join 返回
        if self.service.as_ref().is_some_and(|s| !s.is_running()) {
            log::warn!("render thread stopped, exiting");
            event_loop.exit();
        }
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        log::warn!("winit event: suspended");
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        log::info!("loop exiting");
    }
}
