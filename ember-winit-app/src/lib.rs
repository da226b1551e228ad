//! 窗口程序
//!
//! - [`app`]：winit 事件循环，把窗口事件转换为 render 线程的请求
//! - [`shader_build`]：把 `assets/shaders/src` 下的 GLSL 编译为 SPIR-V

pub mod app;
pub mod shader_build;
