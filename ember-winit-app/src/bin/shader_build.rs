//! 编译 `assets/shaders/src` 下的所有 GLSL，输出到 `assets/shaders`

use std::process::ExitCode;

use ember_crate_tools::ember_path::EmberPath;
use ember_crate_tools::init_log::init_log;
use ember_winit_app::shader_build::{collect_tasks, compile};
use rayon::prelude::*;

fn main() -> ExitCode {
    init_log();

    let out_dir = EmberPath::assets_path("shaders");
    let tasks = collect_tasks(&out_dir.join("src"), &out_dir);
    log::info!("compiling {} shaders into {}", tasks.len(), out_dir.display());

    let failed = tasks
        .par_iter()
        .filter_map(|task| match compile(task) {
            Ok(()) => {
                log::info!("compiled {}", task.output.display());
                None
            }
            Err(e) => {
                log::error!("{:#}", e);
                Some(task)
            }
        })
        .count();

    if failed > 0 {
        log::error!("{} of {} shaders failed to compile", failed, tasks.len());
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
