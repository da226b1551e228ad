use crate::basic::extent::Extent2D;
use crate::basic::format::PixelFormat;
use crate::foundation::device::GfxDevice;
use crate::gfx_error::GfxResult;
use crate::handles::{GfxDisplayHandle, GfxQueueHandle, GfxResourceHandle};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

/// 包装 RawDisplayHandle 使其可以跨线程发送
///
/// 窗口句柄可以在线程间传递，但创建 surface 之外的窗口操作必须回到窗口线程
#[derive(Clone, Copy, Debug)]
pub struct SendableDisplayHandle(RawDisplayHandle);

unsafe impl Send for SendableDisplayHandle {}
unsafe impl Sync for SendableDisplayHandle {}

impl SendableDisplayHandle {
    pub fn new(handle: RawDisplayHandle) -> Self {
        Self(handle)
    }

    pub fn raw(&self) -> RawDisplayHandle {
        self.0
    }
}

/// 包装 RawWindowHandle 使其可以跨线程发送
#[derive(Clone, Copy, Debug)]
pub struct SendableWindowHandle(RawWindowHandle);

unsafe impl Send for SendableWindowHandle {}
unsafe impl Sync for SendableWindowHandle {}

impl SendableWindowHandle {
    pub fn new(handle: RawWindowHandle) -> Self {
        Self(handle)
    }

    pub fn raw(&self) -> RawWindowHandle {
        self.0
    }
}

/// 显示队列呈现到哪里
#[derive(Clone, Copy, Debug)]
pub enum DisplayTarget {
    /// 不呈现到任何窗口，back buffer 是普通的离屏纹理
    Headless,
    Window {
        display: SendableDisplayHandle,
        window: SendableWindowHandle,
    },
}

#[derive(Clone, Debug)]
pub struct DisplayDesc {
    pub target: DisplayTarget,
    pub extent: Extent2D,
    pub buffer_count: u32,
    pub format: PixelFormat,
}

/// 显示队列（交换链）
///
/// 持有呈现目标以及每一帧的 back buffer；尺寸与 back buffer 数量变化时整体重建 back buffer。
pub struct DisplayQueue {
    handle: GfxDisplayHandle,
    extent: Extent2D,
    buffer_count: u32,
    format: PixelFormat,

    destroyed: bool,
}

// new & init
impl DisplayQueue {
    pub fn new(device: &mut dyn GfxDevice, queue: GfxQueueHandle, desc: &DisplayDesc) -> GfxResult<Self> {
        let _span = tracy_client::span!("DisplayQueue::new");

        let handle = device.create_display(queue, desc)?;
        let buffer_count = match device.display_buffer_count(handle) {
            Ok(count) => count,
            Err(e) => {
                device.destroy(handle.into());
                return Err(e);
            }
        };
        log::info!("created display queue: {} with {} back buffers", desc.extent, buffer_count);

        Ok(Self {
            handle,
            extent: desc.extent,
            buffer_count,
            format: desc.format,
            destroyed: false,
        })
    }
}

// destroy
impl DisplayQueue {
    /// 全屏状态下不能销毁交换链，需要先退出全屏
    pub fn destroy(mut self, device: &mut dyn GfxDevice) {
        if device.fullscreen_state(self.handle).unwrap_or(false) {
            if let Err(e) = device.set_fullscreen(self.handle, false) {
                log::warn!("failed to leave fullscreen before destroying display: {}", e);
            }
        }
        device.destroy(self.handle.into());
        self.destroyed = true;
    }
}
impl Drop for DisplayQueue {
    fn drop(&mut self) {
        debug_assert!(self.destroyed || std::thread::panicking(), "DisplayQueue dropped without destroy");
    }
}

// getters
impl DisplayQueue {
    #[inline]
    pub fn handle(&self) -> GfxDisplayHandle {
        self.handle
    }

    #[inline]
    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    /// 设备实际创建的 back buffer 数量
    #[inline]
    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn frame_index(&self, device: &dyn GfxDevice) -> GfxResult<usize> {
        device.display_frame_index(self.handle)
    }

    pub fn render_target(&self, device: &dyn GfxDevice, index: usize) -> GfxResult<GfxResourceHandle> {
        device.display_buffer(self.handle, index)
    }

    pub fn fullscreen_state(&self, device: &dyn GfxDevice) -> GfxResult<bool> {
        device.fullscreen_state(self.handle)
    }
}

// update
impl DisplayQueue {
    pub fn acquire_next_image(&self, device: &mut dyn GfxDevice) -> GfxResult<usize> {
        device.acquire_next_image(self.handle)
    }

    pub fn resize_buffers(&mut self, device: &mut dyn GfxDevice, buffer_count: u32, extent: Extent2D) -> GfxResult<()> {
        let _span = tracy_client::span!("DisplayQueue::resize_buffers");

        device.resize_display(self.handle, buffer_count, extent)?;
        self.buffer_count = device.display_buffer_count(self.handle)?;
        self.extent = extent;
        Ok(())
    }

    pub fn set_fullscreen_state(&mut self, device: &mut dyn GfxDevice, fullscreen: bool) -> GfxResult<()> {
        device.set_fullscreen(self.handle, fullscreen)
    }

    pub fn present(&self, device: &mut dyn GfxDevice, allow_tearing: bool) -> GfxResult<()> {
        device.present(self.handle, allow_tearing)
    }
}
