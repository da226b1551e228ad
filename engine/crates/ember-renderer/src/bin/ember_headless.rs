//! 在 headless 后端上运行演示 graph
//!
//! 用法：`ember-headless [render.toml]`，没有参数时读取 `config/render.toml`（存在的话）。
//! 渲染过程中依次修改显示尺寸、back buffer 数量，并注入一次设备移除；
//! render 线程因错误退出时进程返回非零值。

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use ember_crate_tools::ember_path::EmberPath;
use ember_crate_tools::init_log::init_log;
use ember_gfx::basic::extent::Extent2D;
use ember_gfx::headless::instance::HeadlessInstance;
use ember_gfx::swapchain::display_queue::DisplayTarget;
use ember_renderer::demo::{build_demo_graph, headless_depot};
use ember_renderer::render_config::RenderConfig;
use ember_renderer::render_service::RenderService;

const FRAME_TIMEOUT: Duration = Duration::from_secs(30);
const FRAMES_PER_STEP: u64 = 10;

fn main() -> ExitCode {
    init_log();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("ember-headless failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| Some(EmberPath::config_path("render.toml")).filter(|p| p.exists()));
    let config = RenderConfig::load_or_default(config_path.as_deref())?;
    log::info!("render config: {:?}", config);

    let instance = HeadlessInstance::new();
    let probe = instance.probe();
    let service = RenderService::start(
        config.clone(),
        Box::new(instance),
        Box::new(headless_depot()),
        DisplayTarget::Headless,
        |graph| build_demo_graph(graph).map(|_| ()),
    )?;

    let mut target = FRAMES_PER_STEP;
    service.wait_for_frames(target, FRAME_TIMEOUT)?;

    let half = Extent2D::new((config.draw_width / 2).max(1), (config.draw_height / 2).max(1));
    service.resize_display(half)?;
    target += FRAMES_PER_STEP;
    service.wait_for_frames(target, FRAME_TIMEOUT).context("rendering after display resize")?;

    service.change_back_buffer_count(config.back_buffer_count + 1)?;
    target += FRAMES_PER_STEP;
    service
        .wait_for_frames(target, FRAME_TIMEOUT)
        .context("rendering after back buffer count change")?;

    log::info!("injecting a device removal");
    service.enqueue_work(move |_| {
        probe.inject_device_removed();
        Ok(())
    })?;
    target += FRAMES_PER_STEP;
    // fault_limit 为 1 时 render 线程在这里退出，错误由 join 返回
    let waited = service.wait_for_frames(target, FRAME_TIMEOUT);

    let stats = service.join()?;
    waited?;
    log::info!(
        "rendered {} frames with {} faults and {} recoveries",
        stats.frames,
        stats.faults,
        stats.recoveries
    );
    Ok(())
}
