use crate::basic::extent::Extent2D;
use crate::commands::command::{CommandType, GfxCommand};
use crate::foundation::instance::AdapterInfo;
use crate::gfx_error::GfxResult;
use crate::handles::*;
use crate::resources::buffer::BufferDesc;
use crate::resources::heap::{HeapDesc, HeapLayout, HostDescriptor, ViewKind};
use crate::resources::pipeline::GraphicsPipelineDesc;
use crate::resources::texture::TextureDesc;
use crate::swapchain::display_queue::DisplayDesc;

/// 逻辑设备
///
/// 所有设备对象都以 handle 的形式返回，由调用方负责通过 [`GfxDevice::destroy`] 释放。
/// 命令提交的流程固定为 `begin -> record -> end -> submit -> signal -> (wait)`。
pub trait GfxDevice: Send {
    fn adapter_info(&self) -> &AdapterInfo;

    // ---------------- 队列与同步 ----------------

    fn create_queue(&mut self, ty: CommandType, name: &str) -> GfxResult<GfxQueueHandle>;

    /// 创建一个初始值为 0 的 fence
    fn create_fence(&mut self, name: &str) -> GfxResult<GfxFenceHandle>;

    /// GPU 已经完成的 fence 值
    fn fence_value(&self, fence: GfxFenceHandle) -> GfxResult<u64>;

    /// 阻塞直到 fence 到达 `value`
    fn wait_fence(&mut self, fence: GfxFenceHandle, value: u64) -> GfxResult<()>;

    /// 在队列中插入一个信号，队列执行到这里时把 fence 设为 `value`
    fn signal(&mut self, queue: GfxQueueHandle, fence: GfxFenceHandle, value: u64) -> GfxResult<()>;

    fn submit(&mut self, queue: GfxQueueHandle, list: GfxCommandListHandle) -> GfxResult<()>;

    // ---------------- 命令录制 ----------------

    fn create_command_memory(&mut self, ty: CommandType, name: &str) -> GfxResult<GfxCommandMemoryHandle>;

    fn create_command_list(
        &mut self,
        memory: GfxCommandMemoryHandle,
        name: &str,
    ) -> GfxResult<GfxCommandListHandle>;

    /// 重置 command memory 和 command list，然后开始录制
    fn begin_commands(&mut self, list: GfxCommandListHandle, memory: GfxCommandMemoryHandle) -> GfxResult<()>;

    /// 结束录制（close）
    fn end_commands(&mut self, list: GfxCommandListHandle) -> GfxResult<()>;

    fn record(&mut self, list: GfxCommandListHandle, command: GfxCommand) -> GfxResult<()>;

    // ---------------- 描述符堆与资源 ----------------

    fn create_heap(&mut self, desc: &HeapDesc) -> GfxResult<GfxHeapHandle>;

    fn heap_layout(&self, heap: GfxHeapHandle) -> GfxResult<HeapLayout>;

    /// 在 `descriptor` 指向的槽位写入资源的视图
    fn map_view(&mut self, descriptor: HostDescriptor, resource: GfxResourceHandle, view: ViewKind) -> GfxResult<()>;

    /// 创建的纹理处于 `ResourceState::Common`
    fn create_texture(&mut self, desc: &TextureDesc) -> GfxResult<GfxResourceHandle>;

    fn create_buffer(&mut self, desc: &BufferDesc) -> GfxResult<GfxResourceHandle>;

    /// 写入 `HOST_WRITE` 的 buffer
    fn write_buffer(&mut self, buffer: GfxResourceHandle, offset: u64, data: &[u8]) -> GfxResult<()>;

    fn create_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> GfxResult<GfxPipelineHandle>;

    // ---------------- 显示队列 ----------------

    fn create_display(&mut self, queue: GfxQueueHandle, desc: &DisplayDesc) -> GfxResult<GfxDisplayHandle>;

    /// 获取下一帧可以渲染的 back buffer 下标
    fn acquire_next_image(&mut self, display: GfxDisplayHandle) -> GfxResult<usize>;

    fn display_frame_index(&self, display: GfxDisplayHandle) -> GfxResult<usize>;

    /// back buffer 由显示队列持有，调用方不能销毁
    fn display_buffer(&self, display: GfxDisplayHandle, index: usize) -> GfxResult<GfxResourceHandle>;

    /// 实际的 back buffer 数量，可能与请求的数量不同
    fn display_buffer_count(&self, display: GfxDisplayHandle) -> GfxResult<u32>;

    /// 重建所有 back buffer；之前获取的 back buffer handle 全部失效
    fn resize_display(&mut self, display: GfxDisplayHandle, buffer_count: u32, extent: Extent2D) -> GfxResult<()>;

    fn set_fullscreen(&mut self, display: GfxDisplayHandle, fullscreen: bool) -> GfxResult<()>;

    fn fullscreen_state(&self, display: GfxDisplayHandle) -> GfxResult<bool>;

    fn present(&mut self, display: GfxDisplayHandle, allow_tearing: bool) -> GfxResult<()>;

    // ---------------- 生命周期与诊断 ----------------

    /// 销毁一个设备对象；handle 已经失效时忽略
    fn destroy(&mut self, object: GfxObject);

    /// 设备出错之后打印诊断信息
    fn report_fault_info(&self);

    fn live_object_count(&self) -> usize;
}
