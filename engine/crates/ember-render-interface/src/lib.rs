//! RenderContext 与其依赖的边界类型
//!
//! - [`render_context::RenderContext`]：设备、队列、描述符堆、交换链以及每帧命令内存的唯一持有者
//! - [`descriptor_alloc::DescriptorAlloc`]：描述符堆 + 位图分配器
//! - [`asset_depot::AssetDepot`]：shader / 图片的同步加载接口

pub mod asset_depot;
pub mod create_info;
pub mod descriptor_alloc;
pub mod frame_counter;
pub mod render_context;
pub mod render_error;
