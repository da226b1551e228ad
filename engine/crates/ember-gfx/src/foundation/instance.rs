use crate::foundation::device::GfxDevice;
use crate::gfx_error::GfxResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Discrete,
    Integrated,
    Virtual,
    /// 软件光栅化（WARP / lavapipe / headless）
    Software,
    Other,
}

/// 物理适配器的静态信息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub kind: AdapterKind,
    pub vendor_id: u32,
    pub device_id: u32,
    /// 独占显存，字节
    pub video_memory: u64,
}

bitflags::bitflags! {
    /// 创建 instance / device 时的调试选项
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DeviceFlags: u32 {
        /// 开启 validation layer / debug layer
        const DEBUG = 1 << 0;
        /// 把 validation 消息打印到日志
        const INFO_QUEUE = 1 << 1;
        /// 设备丢失时收集额外的诊断信息
        const EXTENDED_INFO = 1 << 2;
    }
}

/// 图形 API 的顶层上下文
///
/// 枚举适配器是一个纯查询操作；切换适配器时 instance 保持不变，只重建 device。
pub trait GfxInstance: Send {
    fn enumerate_adapters(&mut self) -> GfxResult<Vec<Box<dyn GfxAdapter>>>;

    /// 打印仍然存活的对象，用于在设备重建之后检查泄漏
    fn report_live_objects(&self);
}

pub trait GfxAdapter: Send {
    fn info(&self) -> &AdapterInfo;

    fn create_device(&self, flags: DeviceFlags) -> GfxResult<Box<dyn GfxDevice>>;
}
