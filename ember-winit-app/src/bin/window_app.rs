//! 在窗口中运行演示 graph（Vulkan 后端）
//!
//! 用法：`ember-window [render.toml]`，shader 需要先用 `shader-build` 编译。
//!
//! - F11：切换全屏
//! - PageUp / PageDown：增减 back buffer 数量
//! - R：内部渲染分辨率减半 / 恢复

use std::path::PathBuf;
use std::process::ExitCode;

use ember_crate_tools::ember_path::EmberPath;
use ember_crate_tools::init_log::init_log;
use ember_renderer::render_config::RenderConfig;
use ember_winit_app::app::WindowApp;

fn main() -> ExitCode {
    init_log();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| Some(EmberPath::config_path("render.toml")).filter(|p| p.exists()));
    let result = RenderConfig::load_or_default(config_path.as_deref()).and_then(WindowApp::run);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("ember-window failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
