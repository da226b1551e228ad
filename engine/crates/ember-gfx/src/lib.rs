//! Ember GFX 层
//!
//! 以 handle + trait 的形式描述 GPU 设备：
//! - [`foundation`]：instance / adapter / device 三层接口
//! - [`commands`]：命令录制使用的 [`commands::command::GfxCommand`]
//! - [`resources`]：纹理、缓冲区、描述符堆、管线的创建描述
//! - [`swapchain`]：显示队列（交换链）
//!
//! 后端：
//! - [`headless`]：不依赖任何驱动，记录所有提交的命令，用于测试和离屏运行
//! - `vulkan`：基于 ash / vk-mem 的实现，需要开启 `vulkan` feature

pub mod basic;
pub mod commands;
pub mod foundation;
pub mod gfx_error;
pub mod handles;
pub mod headless;
pub mod resources;
pub mod swapchain;

#[cfg(feature = "vulkan")]
pub mod vulkan;
