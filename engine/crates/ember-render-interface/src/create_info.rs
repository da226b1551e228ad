use ember_gfx::basic::extent::Extent2D;
use ember_gfx::basic::format::PixelFormat;
use ember_gfx::foundation::instance::DeviceFlags;
use ember_gfx::swapchain::display_queue::DisplayTarget;

/// RenderContext 的创建参数
///
/// 运行期间的修改只能通过 RenderContext 的 `change_*` 接口完成，
/// 这里始终记录当前生效的配置。
#[derive(Clone, Debug)]
pub struct RenderCreateInfo {
    pub display_target: DisplayTarget,

    pub adapter_index: usize,
    pub back_buffer_count: u32,
    /// 交换链尺寸
    pub display_size: Extent2D,
    /// 内部渲染分辨率
    pub render_size: Extent2D,
    pub display_format: PixelFormat,

    pub rtv_heap_size: usize,
    pub dsv_heap_size: usize,
    pub srv_heap_size: usize,

    pub device_flags: DeviceFlags,
    /// 窗口模式下 present 是否允许撕裂；全屏时始终关闭
    pub allow_tearing: bool,
}

impl Default for RenderCreateInfo {
    fn default() -> Self {
        Self {
            display_target: DisplayTarget::Headless,
            adapter_index: 0,
            back_buffer_count: 2,
            display_size: Extent2D::new(1920, 1080),
            render_size: Extent2D::new(1920, 1080),
            display_format: PixelFormat::Rgba8Unorm,
            rtv_heap_size: 16,
            dsv_heap_size: 16,
            srv_heap_size: 64,
            device_flags: DeviceFlags::DEBUG | DeviceFlags::INFO_QUEUE | DeviceFlags::EXTENDED_INFO,
            allow_tearing: false,
        }
    }
}
