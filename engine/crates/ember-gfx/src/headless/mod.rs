//! 不依赖驱动的后端
//!
//! GPU 在这里是“瞬时”的：队列提交后 fence 立即到达目标值。
//! 所有提交的命令、present 以及存活对象数量都记录在 [`probe::HeadlessProbe`] 中，
//! 测试可以通过它检查命令流，或者注入设备错误。

pub mod device;
pub mod instance;
pub mod probe;
