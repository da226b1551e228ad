//! 基于 ash / vk-mem 的 Vulkan 后端
//!
//! 需要 Vulkan 1.3：dynamic rendering、synchronization2、timeline semaphore 与 descriptor indexing。
//!
//! 与抽象层的对应关系：
//! - fence：timeline semaphore
//! - command memory：command pool，每个 pool 懒分配一个 primary command buffer
//! - rtv / dsv 堆：image view 槽位表，host 描述符地址只在后端内部解析
//! - shader data 堆：一个 bindless descriptor set，shader input 通过 push constant 传递下标
//! - display：窗口目标使用交换链，headless 目标使用离屏纹理轮转

pub mod convert;
pub mod debug_messenger;
pub mod descriptor;
pub mod device;
pub mod display;
pub mod instance;
pub mod pipeline;
pub mod recorder;
