use std::fmt;

use ember_gfx::basic::extent::{Extent2D, Scissor, Viewport};
use ember_gfx::basic::format::IndexFormat;
use ember_gfx::commands::command::{CommandType, GfxCommand, Transition};
use ember_gfx::foundation::device::GfxDevice;
use ember_gfx::foundation::instance::{AdapterInfo, GfxAdapter, GfxInstance};
use ember_gfx::gfx_error::GfxError;
use ember_gfx::handles::*;
use ember_gfx::resources::buffer::BufferDesc;
use ember_gfx::resources::heap::{DeviceDescriptor, HostDescriptor, ViewKind};
use ember_gfx::resources::pipeline::GraphicsPipelineDesc;
use ember_gfx::resources::texture::TextureDesc;
use ember_gfx::swapchain::display_queue::{DisplayDesc, DisplayQueue};

use crate::create_info::RenderCreateInfo;
use crate::descriptor_alloc::*;
use crate::frame_counter::FrameCounter;
use crate::render_error::{RenderError, RenderResult};

/// 设备以及设备级别的队列与同步对象
struct DeviceData {
    device: Box<dyn GfxDevice>,

    direct_queue: GfxQueueHandle,
    direct_fence: GfxFenceHandle,

    copy_queue: GfxQueueHandle,
    copy_fence: GfxFenceHandle,
    copy_memory: GfxCommandMemoryHandle,
    copy_commands: GfxCommandListHandle,
}

struct HeapData {
    rtv: RenderTargetAlloc,
    dsv: DepthStencilAlloc,
    srv: ShaderDataAlloc,
}

/// 每个 back buffer 一份 command memory
struct FrameMemory {
    memory: GfxCommandMemoryHandle,
    /// 最近一次使用这份 memory 的提交所 signal 的值
    fence_value: u64,
}

struct FrameData {
    direct_commands: GfxCommandListHandle,
    memories: Vec<FrameMemory>,
}

/// 对 RenderContext 的一次全局修改
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ContextChange {
    DisplaySize(Extent2D),
    RenderSize(Extent2D),
    BackBufferCount(u32),
    Adapter(usize),
    Fullscreen(bool),
    ResumeFromFault,
}

impl fmt::Display for ContextChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextChange::DisplaySize(size) => write!(f, "display size {}", size),
            ContextChange::RenderSize(size) => write!(f, "render size {}", size),
            ContextChange::BackBufferCount(count) => write!(f, "back buffer count {}", count),
            ContextChange::Adapter(index) => write!(f, "adapter #{}", index),
            ContextChange::Fullscreen(fullscreen) => write!(f, "fullscreen {}", fullscreen),
            ContextChange::ResumeFromFault => write!(f, "fault recovery"),
        }
    }
}

/// 渲染层的唯一入口
///
/// 持有 instance、适配器列表、设备、direct / copy 队列、描述符堆、交换链以及每帧的 command memory。
///
/// 内部的各部分按依赖顺序创建：context -> device -> heaps -> display -> frames，销毁时逆序。
/// 任何一部分缺失时，[`RenderContext::ensure_created`] 只补齐缺失的部分，
/// 因此各种重建操作都是“先拆掉受影响的部分，再 ensure_created”。
pub struct RenderContext {
    create_info: RenderCreateInfo,

    instance: Box<dyn GfxInstance>,
    adapters: Vec<Box<dyn GfxAdapter>>,

    device: Option<DeviceData>,
    heaps: Option<HeapData>,
    display: Option<DisplayQueue>,
    frames: Option<FrameData>,

    /// 下一次 signal 使用的值，direct 与 copy 各自独立递增
    direct_fence_value: u64,
    copy_fence_value: u64,

    /// 当前帧使用的 back buffer 下标
    frame_index: usize,
    reported_fullscreen: bool,
    direct_recording: bool,
    copy_recording: bool,
    /// 本帧最近一次绑定的 render target
    current_render_target: Option<HostDescriptor>,
    /// 等待 copy 队列完成之后销毁的 staging buffer
    pending_staging: Vec<GfxResourceHandle>,

    frame_counter: FrameCounter,
}

// new & init
impl RenderContext {
    pub fn new(instance: Box<dyn GfxInstance>, create_info: RenderCreateInfo) -> RenderResult<Self> {
        let _span = tracy_client::span!("RenderContext::new");

        let mut context = Self {
            create_info,
            instance,
            adapters: Vec::new(),
            device: None,
            heaps: None,
            display: None,
            frames: None,
            direct_fence_value: 1,
            copy_fence_value: 1,
            frame_index: 0,
            reported_fullscreen: false,
            direct_recording: false,
            copy_recording: false,
            current_render_target: None,
            pending_staging: Vec::new(),
            frame_counter: FrameCounter::default(),
        };
        // 创建失败时由 Drop 负责清理已经创建的部分
        context.ensure_created()?;
        Ok(context)
    }

    /// 按依赖顺序补齐所有缺失的部分
    pub fn ensure_created(&mut self) -> RenderResult<()> {
        if self.adapters.is_empty() {
            self.create_context_data()?;
        }
        if self.device.is_none() {
            self.create_device_data()?;
        }
        if self.heaps.is_none() {
            self.create_heaps()?;
        }
        if self.display.is_none() {
            self.create_display_data()?;
        }
        if self.frames.is_none() {
            self.create_frame_data()?;
        }
        Ok(())
    }

    fn create_context_data(&mut self) -> RenderResult<()> {
        let adapters = self.instance.enumerate_adapters()?;
        if adapters.is_empty() {
            return Err(GfxError::Unsupported("no graphics adapter available".to_string()).into());
        }

        for (index, adapter) in adapters.iter().enumerate() {
            let info = adapter.info();
            log::info!(
                "adapter #{}: {} ({:?}, {} MiB)",
                index,
                info.name,
                info.kind,
                info.video_memory >> 20
            );
        }
        if self.create_info.adapter_index >= adapters.len() {
            log::warn!(
                "adapter index {} out of range ({} adapters), falling back to adapter #0",
                self.create_info.adapter_index,
                adapters.len()
            );
            self.create_info.adapter_index = 0;
        }

        self.adapters = adapters;
        Ok(())
    }

    fn create_device_data(&mut self) -> RenderResult<()> {
        let _span = tracy_client::span!("RenderContext::create_device_data");

        let adapter = &self.adapters[self.create_info.adapter_index];
        log::info!("selected adapter #{}: {}", self.create_info.adapter_index, adapter.info().name);
        let device = adapter.create_device(self.create_info.device_flags)?;

        // 创建过程中出错时，逆序销毁已经创建的对象
        let mut guard = scopeguard::guard((device, Vec::<GfxObject>::new()), |(mut device, objects)| {
            for object in objects.into_iter().rev() {
                device.destroy(object);
            }
        });
        let (device, objects) = &mut *guard;

        let direct_queue = device.create_queue(CommandType::Direct, "direct-queue")?;
        objects.push(direct_queue.into());
        let direct_fence = device.create_fence("direct-fence")?;
        objects.push(direct_fence.into());
        let copy_queue = device.create_queue(CommandType::Copy, "copy-queue")?;
        objects.push(copy_queue.into());
        let copy_fence = device.create_fence("copy-fence")?;
        objects.push(copy_fence.into());
        let copy_memory = device.create_command_memory(CommandType::Copy, "copy-memory")?;
        objects.push(copy_memory.into());
        let copy_commands = device.create_command_list(copy_memory, "copy-commands")?;

        let (device, _) = scopeguard::ScopeGuard::into_inner(guard);
        self.device = Some(DeviceData {
            device,
            direct_queue,
            direct_fence,
            copy_queue,
            copy_fence,
            copy_memory,
            copy_commands,
        });
        self.direct_fence_value = 1;
        self.copy_fence_value = 1;
        log::info!("created device data");
        Ok(())
    }

    fn create_heaps(&mut self) -> RenderResult<()> {
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?.device.as_mut();

        let rtv = RenderTargetAlloc::new(device, self.create_info.rtv_heap_size, "rtv-heap")?;
        let dsv = match DepthStencilAlloc::new(device, self.create_info.dsv_heap_size, "dsv-heap") {
            Ok(dsv) => dsv,
            Err(e) => {
                rtv.destroy(device);
                return Err(e);
            }
        };
        let srv = match ShaderDataAlloc::new(device, self.create_info.srv_heap_size, "srv-heap") {
            Ok(srv) => srv,
            Err(e) => {
                dsv.destroy(device);
                rtv.destroy(device);
                return Err(e);
            }
        };

        self.heaps = Some(HeapData { rtv, dsv, srv });
        Ok(())
    }

    fn create_display_data(&mut self) -> RenderResult<()> {
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        let desc = DisplayDesc {
            target: self.create_info.display_target,
            extent: self.create_info.display_size,
            buffer_count: self.create_info.back_buffer_count,
            format: self.create_info.display_format,
        };

        let display = DisplayQueue::new(device.device.as_mut(), device.direct_queue, &desc)?;
        self.frame_index = display.frame_index(device.device.as_ref())?;
        self.reported_fullscreen = display.fullscreen_state(device.device.as_ref())?;
        self.display = Some(display);
        Ok(())
    }

    fn create_frame_data(&mut self) -> RenderResult<()> {
        let count = self.frame_count();
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?.device.as_mut();

        let mut guard = scopeguard::guard((device, Vec::<GfxObject>::new()), |(device, objects)| {
            for object in objects.into_iter().rev() {
                device.destroy(object);
            }
        });
        let (device, objects) = &mut *guard;

        let mut memories = Vec::with_capacity(count);
        for i in 0..count {
            let memory = device.create_command_memory(CommandType::Direct, &format!("frame-memory-{}", i))?;
            objects.push(memory.into());
            memories.push(FrameMemory { memory, fence_value: 0 });
        }
        let direct_commands = device.create_command_list(memories[0].memory, "direct-commands")?;

        scopeguard::ScopeGuard::into_inner(guard);
        self.frames = Some(FrameData {
            direct_commands,
            memories,
        });
        self.direct_recording = false;
        log::info!("created frame data for {} back buffers", count);
        Ok(())
    }
}

// destroy
impl RenderContext {
    fn destroy_frame_data(&mut self) {
        let Some(frames) = self.frames.take() else {
            return;
        };
        self.direct_recording = false;
        self.current_render_target = None;

        if let Some(device) = self.device.as_mut() {
            device.device.destroy(frames.direct_commands.into());
            for memory in frames.memories.into_iter().rev() {
                device.device.destroy(memory.memory.into());
            }
        }
    }

    fn destroy_display_data(&mut self) {
        let Some(display) = self.display.take() else {
            return;
        };
        match self.device.as_mut() {
            Some(device) => display.destroy(device.device.as_mut()),
            None => log::error!("display queue outlived its device"),
        }
    }

    fn destroy_heaps(&mut self) {
        let Some(heaps) = self.heaps.take() else {
            return;
        };
        match self.device.as_mut() {
            Some(device) => {
                heaps.srv.destroy(device.device.as_mut());
                heaps.dsv.destroy(device.device.as_mut());
                heaps.rtv.destroy(device.device.as_mut());
            }
            None => log::error!("descriptor heaps outlived their device"),
        }
    }

    fn destroy_device_data(&mut self) {
        let Some(mut data) = self.device.take() else {
            return;
        };
        self.copy_recording = false;

        let device = data.device.as_mut();
        for staging in self.pending_staging.drain(..) {
            device.destroy(staging.into());
        }
        device.destroy(data.copy_commands.into());
        device.destroy(data.copy_memory.into());
        device.destroy(data.copy_fence.into());
        device.destroy(data.copy_queue.into());
        device.destroy(data.direct_fence.into());
        device.destroy(data.direct_queue.into());

        let live = device.live_object_count();
        if live > 0 {
            log::warn!("device destroyed with {} live objects", live);
        }
        log::info!("destroyed device data");
    }

    /// 拆掉设备以及所有依赖设备的部分
    fn destroy_device_dependents(&mut self) {
        self.destroy_frame_data();
        self.destroy_display_data();
        self.destroy_heaps();
        self.destroy_device_data();
    }
}
impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("failed to flush queues while dropping render context: {}", e);
        }
        self.destroy_device_dependents();
        self.instance.report_live_objects();
    }
}

// frame
impl RenderContext {
    /// 获取本帧的 back buffer，并等待这一帧的 command memory 被 GPU 用完
    pub fn begin_render(&mut self) -> RenderResult<()> {
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        let display = self.display.as_ref().ok_or(RenderError::NotLive("display queue"))?;
        let frames = self.frames.as_ref().ok_or(RenderError::NotLive("frame data"))?;

        let frame_index = display.acquire_next_image(device.device.as_mut())?;
        let memory = frames.memories.get(frame_index).ok_or_else(|| {
            RenderError::Validation(format!(
                "back buffer {} has no command memory ({} frames)",
                frame_index,
                frames.memories.len()
            ))
        })?;
        if device.device.fence_value(device.direct_fence)? < memory.fence_value {
            device.device.wait_fence(device.direct_fence, memory.fence_value)?;
        }

        self.frame_index = frame_index;
        self.current_render_target = None;
        Ok(())
    }

    /// 重置本帧的 command memory 并开始录制
    pub fn begin_direct(&mut self) -> RenderResult<()> {
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        let heaps = self.heaps.as_ref().ok_or(RenderError::NotLive("descriptor heaps"))?;
        let frames = self.frames.as_ref().ok_or(RenderError::NotLive("frame data"))?;

        let memory = frames.memories[self.frame_index].memory;
        device.device.begin_commands(frames.direct_commands, memory)?;
        self.direct_recording = true;
        device.device.record(frames.direct_commands, GfxCommand::SetShaderHeap(heaps.srv.heap()))?;
        Ok(())
    }

    /// 结束录制，提交到 direct 队列，并记录这一帧的 fence 值
    pub fn end_direct(&mut self) -> RenderResult<()> {
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        let frames = self.frames.as_mut().ok_or(RenderError::NotLive("frame data"))?;

        self.direct_recording = false;
        device.device.end_commands(frames.direct_commands)?;
        device.device.submit(device.direct_queue, frames.direct_commands)?;

        let value = self.direct_fence_value;
        self.direct_fence_value += 1;
        device.device.signal(device.direct_queue, device.direct_fence, value)?;
        frames.memories[self.frame_index].fence_value = value;
        Ok(())
    }

    pub fn end_render(&mut self, present: bool) -> RenderResult<()> {
        if present {
            let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
            let display = self.display.as_ref().ok_or(RenderError::NotLive("display queue"))?;
            // 全屏时不允许撕裂
            let allow_tearing = !self.reported_fullscreen && self.create_info.allow_tearing;
            display.present(device.device.as_mut(), allow_tearing)?;
        }
        self.frame_counter.next_frame();
        Ok(())
    }

    pub fn begin_copy(&mut self) -> RenderResult<()> {
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        device.device.begin_commands(device.copy_commands, device.copy_memory)?;
        self.copy_recording = true;
        Ok(())
    }

    /// 提交 copy 命令并阻塞等待完成，之后销毁本批次的 staging buffer
    pub fn end_copy(&mut self) -> RenderResult<()> {
        let _span = tracy_client::span!("RenderContext::end_copy");

        let result = self.submit_copy();
        if let Some(device) = self.device.as_mut() {
            for staging in self.pending_staging.drain(..) {
                device.device.destroy(staging.into());
            }
        }
        result
    }

    fn submit_copy(&mut self) -> RenderResult<()> {
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        self.copy_recording = false;
        device.device.end_commands(device.copy_commands)?;
        device.device.submit(device.copy_queue, device.copy_commands)?;
        self.wait_for_copy_queue()
    }

    pub fn wait_for_direct_queue(&mut self) -> RenderResult<()> {
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        let value = self.direct_fence_value;
        self.direct_fence_value += 1;

        device.device.signal(device.direct_queue, device.direct_fence, value)?;
        if device.device.fence_value(device.direct_fence)? < value {
            device.device.wait_fence(device.direct_fence, value)?;
        }
        Ok(())
    }

    pub fn wait_for_copy_queue(&mut self) -> RenderResult<()> {
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        let value = self.copy_fence_value;
        self.copy_fence_value += 1;

        device.device.signal(device.copy_queue, device.copy_fence, value)?;
        if device.device.fence_value(device.copy_fence)? < value {
            device.device.wait_fence(device.copy_fence, value)?;
        }
        Ok(())
    }

    /// 等待两个队列上的所有工作完成
    pub fn flush(&mut self) -> RenderResult<()> {
        self.wait_for_direct_queue()?;
        self.wait_for_copy_queue()
    }
}

// commands
impl RenderContext {
    fn record(&mut self, command: GfxCommand) -> RenderResult<()> {
        if !self.direct_recording {
            return Err(RenderError::Validation(format!("{:?} recorded outside of begin_direct", command)));
        }
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        let frames = self.frames.as_ref().ok_or(RenderError::NotLive("frame data"))?;
        device.device.record(frames.direct_commands, command)?;
        Ok(())
    }

    fn record_copy(&mut self, command: GfxCommand) -> RenderResult<()> {
        if !self.copy_recording {
            return Err(RenderError::Validation(format!("{:?} recorded outside of begin_copy", command)));
        }
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        device.device.record(device.copy_commands, command)?;
        Ok(())
    }

    /// 一批状态转换合并为一条命令；空批次直接忽略
    pub fn transition(&mut self, transitions: Vec<Transition>) -> RenderResult<()> {
        if transitions.is_empty() {
            return Ok(());
        }
        self.record(GfxCommand::Transition(transitions))
    }

    /// 在 copy 队列上进行状态转换
    pub fn transition_copy(&mut self, transitions: Vec<Transition>) -> RenderResult<()> {
        if transitions.is_empty() {
            return Ok(());
        }
        self.record_copy(GfxCommand::Transition(transitions))
    }

    /// 绑定 render target 与可选的 depth stencil
    ///
    /// - render target 与本帧上一次绑定的不同时，使用 `clear_color` 清除
    /// - depth stencil 每次绑定都会清除
    pub fn bind_render_target(
        &mut self,
        rtv: RtvIndex,
        dsv: Option<DsvIndex>,
        clear_color: Option<glam::Vec4>,
    ) -> RenderResult<()> {
        let rtv = self.rtv_descriptor(rtv)?;
        let dsv = dsv.map(|dsv| self.dsv_descriptor(dsv)).transpose()?;

        self.record(GfxCommand::SetRenderTarget { rtv, dsv })?;
        if self.current_render_target != Some(rtv) {
            if let Some(color) = clear_color {
                self.record(GfxCommand::ClearRenderTarget { rtv, color })?;
            }
            self.current_render_target = Some(rtv);
        }
        if let Some(dsv) = dsv {
            self.record(GfxCommand::ClearDepthStencil {
                dsv,
                depth: 1.0,
                stencil: 0,
            })?;
        }
        Ok(())
    }

    pub fn clear_render_target(&mut self, rtv: RtvIndex, color: glam::Vec4) -> RenderResult<()> {
        let rtv = self.rtv_descriptor(rtv)?;
        self.record(GfxCommand::ClearRenderTarget { rtv, color })
    }

    pub fn clear_depth_stencil(&mut self, dsv: DsvIndex, depth: f32, stencil: u8) -> RenderResult<()> {
        let dsv = self.dsv_descriptor(dsv)?;
        self.record(GfxCommand::ClearDepthStencil { dsv, depth, stencil })
    }

    pub fn set_display(&mut self, viewport: Viewport, scissor: Scissor) -> RenderResult<()> {
        self.record(GfxCommand::SetDisplay { viewport, scissor })
    }

    pub fn set_pipeline(&mut self, pipeline: GfxPipelineHandle) -> RenderResult<()> {
        self.record(GfxCommand::SetPipeline(pipeline))
    }

    pub fn set_shader_input(&mut self, slot: u32, srv: SrvIndex) -> RenderResult<()> {
        let descriptor = self.srv_descriptor(srv)?;
        self.record(GfxCommand::SetShaderInput { slot, descriptor })
    }

    pub fn set_vertex_buffer(&mut self, buffer: GfxResourceHandle, stride: u32) -> RenderResult<()> {
        self.record(GfxCommand::SetVertexBuffer { buffer, stride })
    }

    pub fn set_index_buffer(&mut self, buffer: GfxResourceHandle, format: IndexFormat) -> RenderResult<()> {
        self.record(GfxCommand::SetIndexBuffer { buffer, format })
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> RenderResult<()> {
        self.record(GfxCommand::Draw {
            vertex_count,
            instance_count,
        })
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> RenderResult<()> {
        self.record(GfxCommand::DrawIndexed {
            index_count,
            instance_count,
        })
    }

    pub fn begin_event(&mut self, name: impl Into<String>) -> RenderResult<()> {
        self.record(GfxCommand::BeginEvent(name.into()))
    }

    pub fn end_event(&mut self) -> RenderResult<()> {
        self.record(GfxCommand::EndEvent)
    }

    /// 通过 staging buffer 把数据拷贝到 `dst`，必须位于 begin_copy / end_copy 之间
    pub fn copy_buffer(&mut self, dst: GfxResourceHandle, data: &[u8]) -> RenderResult<()> {
        let staging = self.create_staging(data)?;
        self.record_copy(GfxCommand::CopyBuffer {
            dst,
            src: staging,
            size: data.len() as u64,
        })
    }

    /// 通过 staging buffer 上传整张纹理，`dst` 需要处于 `CopyDest`
    pub fn copy_texture(&mut self, dst: GfxResourceHandle, pixels: &[u8]) -> RenderResult<()> {
        let staging = self.create_staging(pixels)?;
        self.record_copy(GfxCommand::CopyTexture { dst, src: staging })
    }

    fn create_staging(&mut self, data: &[u8]) -> RenderResult<GfxResourceHandle> {
        if data.is_empty() {
            return Err(RenderError::Validation("upload of zero bytes".to_string()));
        }
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?.device.as_mut();

        let staging = device.create_buffer(&BufferDesc::staging("staging", data.len() as u64))?;
        // 无论后续是否成功，都在 end_copy 时销毁
        self.pending_staging.push(staging);
        device.write_buffer(staging, 0, data)?;
        Ok(staging)
    }
}

// resources
impl RenderContext {
    pub fn create_texture(&mut self, desc: &TextureDesc) -> RenderResult<GfxResourceHandle> {
        Ok(self.device_mut()?.create_texture(desc)?)
    }

    pub fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<GfxResourceHandle> {
        Ok(self.device_mut()?.create_buffer(desc)?)
    }

    pub fn create_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> RenderResult<GfxPipelineHandle> {
        Ok(self.device_mut()?.create_pipeline(desc)?)
    }

    /// 写入 CPU 可见的 buffer
    pub fn write_buffer(&mut self, buffer: GfxResourceHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        Ok(self.device_mut()?.write_buffer(buffer, offset, data)?)
    }

    /// 设备已经不存在时忽略
    pub fn destroy_resource(&mut self, resource: GfxResourceHandle) {
        if let Some(device) = self.device.as_mut() {
            device.device.destroy(resource.into());
        }
    }

    pub fn destroy_pipeline(&mut self, pipeline: GfxPipelineHandle) {
        if let Some(device) = self.device.as_mut() {
            device.device.destroy(pipeline.into());
        }
    }
}

// descriptors
impl RenderContext {
    fn map_into<T: HeapMarker>(
        device: &mut dyn GfxDevice,
        heap: &mut DescriptorAlloc<T>,
        resource: GfxResourceHandle,
        view: ViewKind,
    ) -> RenderResult<DescriptorIndex<T>> {
        let index = heap.alloc()?;
        if let Err(e) = device.map_view(heap.host_offset(index), resource, view) {
            heap.release(index);
            return Err(e.into());
        }
        Ok(index)
    }

    pub fn map_render_target(&mut self, resource: GfxResourceHandle) -> RenderResult<RtvIndex> {
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        let heaps = self.heaps.as_mut().ok_or(RenderError::NotLive("descriptor heaps"))?;
        Self::map_into(device.device.as_mut(), &mut heaps.rtv, resource, ViewKind::RenderTarget)
    }

    pub fn map_depth_stencil(&mut self, resource: GfxResourceHandle) -> RenderResult<DsvIndex> {
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        let heaps = self.heaps.as_mut().ok_or(RenderError::NotLive("descriptor heaps"))?;
        Self::map_into(device.device.as_mut(), &mut heaps.dsv, resource, ViewKind::DepthStencil)
    }

    pub fn map_shader_resource(&mut self, resource: GfxResourceHandle) -> RenderResult<SrvIndex> {
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        let heaps = self.heaps.as_mut().ok_or(RenderError::NotLive("descriptor heaps"))?;
        Self::map_into(device.device.as_mut(), &mut heaps.srv, resource, ViewKind::ShaderResource)
    }

    pub fn map_unordered_access(&mut self, resource: GfxResourceHandle) -> RenderResult<SrvIndex> {
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        let heaps = self.heaps.as_mut().ok_or(RenderError::NotLive("descriptor heaps"))?;
        Self::map_into(device.device.as_mut(), &mut heaps.srv, resource, ViewKind::UnorderedAccess)
    }

    pub fn map_uniform(&mut self, resource: GfxResourceHandle) -> RenderResult<SrvIndex> {
        let device = self.device.as_mut().ok_or(RenderError::NotLive("device"))?;
        let heaps = self.heaps.as_mut().ok_or(RenderError::NotLive("descriptor heaps"))?;
        Self::map_into(device.device.as_mut(), &mut heaps.srv, resource, ViewKind::Uniform)
    }

    /// 堆已经随设备销毁时忽略
    pub fn release_rtv(&mut self, index: RtvIndex) {
        if let Some(heaps) = self.heaps.as_mut() {
            heaps.rtv.release(index);
        }
    }

    pub fn release_dsv(&mut self, index: DsvIndex) {
        if let Some(heaps) = self.heaps.as_mut() {
            heaps.dsv.release(index);
        }
    }

    pub fn release_srv(&mut self, index: SrvIndex) {
        if let Some(heaps) = self.heaps.as_mut() {
            heaps.srv.release(index);
        }
    }

    pub fn rtv_descriptor(&self, index: RtvIndex) -> RenderResult<HostDescriptor> {
        let heaps = self.heaps.as_ref().ok_or(RenderError::NotLive("descriptor heaps"))?;
        Ok(heaps.rtv.host_offset(index))
    }

    pub fn dsv_descriptor(&self, index: DsvIndex) -> RenderResult<HostDescriptor> {
        let heaps = self.heaps.as_ref().ok_or(RenderError::NotLive("descriptor heaps"))?;
        Ok(heaps.dsv.host_offset(index))
    }

    pub fn srv_descriptor(&self, index: SrvIndex) -> RenderResult<DeviceDescriptor> {
        let heaps = self.heaps.as_ref().ok_or(RenderError::NotLive("descriptor heaps"))?;
        heaps
            .srv
            .device_offset(index)
            .ok_or_else(|| RenderError::Validation("srv heap is not shader visible".to_string()))
    }
}

// change
impl RenderContext {
    pub fn apply_change(&mut self, change: ContextChange) -> RenderResult<()> {
        match change {
            ContextChange::DisplaySize(size) => self.change_display_size(size),
            ContextChange::RenderSize(size) => self.change_render_size(size),
            ContextChange::BackBufferCount(count) => self.change_back_buffer_count(count),
            ContextChange::Adapter(index) => self.change_adapter(index),
            ContextChange::Fullscreen(fullscreen) => self.change_fullscreen(fullscreen),
            ContextChange::ResumeFromFault => self.resume_from_fault(),
        }
    }

    /// 撤销 `change` 需要应用的修改，基于当前（修改之前）的配置
    pub fn revert_of(&self, change: ContextChange) -> ContextChange {
        match change {
            ContextChange::DisplaySize(_) => ContextChange::DisplaySize(self.create_info.display_size),
            ContextChange::RenderSize(_) => ContextChange::RenderSize(self.create_info.render_size),
            ContextChange::BackBufferCount(_) => ContextChange::BackBufferCount(self.create_info.back_buffer_count),
            ContextChange::Adapter(_) => ContextChange::Adapter(self.create_info.adapter_index),
            ContextChange::Fullscreen(_) => ContextChange::Fullscreen(self.reported_fullscreen),
            ContextChange::ResumeFromFault => ContextChange::ResumeFromFault,
        }
    }

    /// 修改后的值与当前配置相同时为 true
    pub fn is_unchanged(&self, change: ContextChange) -> bool {
        match change {
            ContextChange::DisplaySize(size) => self.create_info.display_size == size,
            ContextChange::RenderSize(size) => self.create_info.render_size == size,
            ContextChange::BackBufferCount(count) => self.create_info.back_buffer_count == count,
            ContextChange::Adapter(index) => self.create_info.adapter_index == index,
            ContextChange::Fullscreen(fullscreen) => self.reported_fullscreen == fullscreen,
            ContextChange::ResumeFromFault => false,
        }
    }

    pub fn change_display_size(&mut self, size: Extent2D) -> RenderResult<()> {
        let _span = tracy_client::span!("RenderContext::change_display_size");
        if size.is_empty() {
            return Err(RenderError::Validation(format!("display size {} is empty", size)));
        }

        self.create_info.display_size = size;
        self.resize_display_buffers()?;
        self.ensure_created()?;
        log::info!("changed display size to {}", size);
        Ok(())
    }

    /// render size 只影响 graph 中的资源，context 只记录新的值
    pub fn change_render_size(&mut self, size: Extent2D) -> RenderResult<()> {
        if size.is_empty() {
            return Err(RenderError::Validation(format!("render size {} is empty", size)));
        }
        self.create_info.render_size = size;
        log::info!("changed render size to {}", size);
        Ok(())
    }

    pub fn change_back_buffer_count(&mut self, count: u32) -> RenderResult<()> {
        let _span = tracy_client::span!("RenderContext::change_back_buffer_count");
        if count == 0 {
            return Err(RenderError::Validation("back buffer count must be at least 1".to_string()));
        }

        self.destroy_frame_data();
        self.create_info.back_buffer_count = count;
        self.resize_display_buffers()?;
        self.ensure_created()?;
        log::info!("changed back buffer count to {}", count);
        Ok(())
    }

    pub fn change_fullscreen(&mut self, fullscreen: bool) -> RenderResult<()> {
        let _span = tracy_client::span!("RenderContext::change_fullscreen");

        if let (Some(device), Some(display)) = (self.device.as_mut(), self.display.as_mut()) {
            display.set_fullscreen_state(device.device.as_mut(), fullscreen)?;
            self.reported_fullscreen = display.fullscreen_state(device.device.as_ref())?;
        }
        // 切换全屏之后 back buffer 需要重建
        self.resize_display_buffers()?;
        self.ensure_created()?;
        log::info!("changed fullscreen state to {}", self.reported_fullscreen);
        Ok(())
    }

    /// 切换适配器：instance 保持不变，重建设备以及依赖设备的所有部分
    pub fn change_adapter(&mut self, index: usize) -> RenderResult<()> {
        let _span = tracy_client::span!("RenderContext::change_adapter");
        if index >= self.adapters.len() {
            return Err(RenderError::Validation(format!(
                "adapter index {} out of range ({} adapters)",
                index,
                self.adapters.len()
            )));
        }

        self.destroy_device_dependents();
        self.create_info.adapter_index = index;
        self.ensure_created()?;
        log::info!("changed adapter to #{}: {}", index, self.adapters[index].info().name);
        Ok(())
    }

    /// 完整的设备重建：报告故障信息，拆掉设备，重新枚举适配器，然后重建
    pub fn resume_from_fault(&mut self) -> RenderResult<()> {
        let _span = tracy_client::span!("RenderContext::resume_from_fault");
        log::warn!("resuming from render fault with a full device rebuild");

        self.report_fault_info();
        self.destroy_device_dependents();
        self.adapters.clear();
        self.instance.report_live_objects();
        self.ensure_created()
    }

    pub fn report_fault_info(&self) {
        match self.device.as_ref() {
            Some(device) => device.device.report_fault_info(),
            None => log::warn!("render fault reported without a live device"),
        }
    }

    fn resize_display_buffers(&mut self) -> RenderResult<()> {
        self.current_render_target = None;
        if let (Some(device), Some(display)) = (self.device.as_mut(), self.display.as_mut()) {
            display.resize_buffers(
                device.device.as_mut(),
                self.create_info.back_buffer_count,
                self.create_info.display_size,
            )?;
            self.frame_index = display.frame_index(device.device.as_ref())?;
        }
        Ok(())
    }
}

// getters
impl RenderContext {
    #[inline]
    pub fn create_info(&self) -> &RenderCreateInfo {
        &self.create_info
    }

    #[inline]
    pub fn display_size(&self) -> Extent2D {
        self.create_info.display_size
    }

    #[inline]
    pub fn render_size(&self) -> Extent2D {
        self.create_info.render_size
    }

    /// 请求的 back buffer 数量
    #[inline]
    pub fn back_buffer_count(&self) -> u32 {
        self.create_info.back_buffer_count
    }

    /// 显示队列实际持有的 back buffer 数量，每个 back buffer 对应一份 command memory
    pub fn frame_count(&self) -> usize {
        self.display
            .as_ref()
            .map_or(self.create_info.back_buffer_count, DisplayQueue::buffer_count) as usize
    }

    #[inline]
    pub fn adapter_index(&self) -> usize {
        self.create_info.adapter_index
    }

    pub fn adapters(&self) -> Vec<AdapterInfo> {
        self.adapters.iter().map(|a| a.info().clone()).collect()
    }

    #[inline]
    pub fn is_fullscreen(&self) -> bool {
        self.reported_fullscreen
    }

    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    #[inline]
    pub fn frame_counter(&self) -> &FrameCounter {
        &self.frame_counter
    }

    /// 用于日志，形如 `[F42#1]`
    pub fn frame_name(&self) -> String {
        self.frame_counter.frame_name(self.frame_index)
    }

    /// 所有部分都已经创建
    pub fn is_live(&self) -> bool {
        !self.adapters.is_empty()
            && self.device.is_some()
            && self.heaps.is_some()
            && self.display.is_some()
            && self.frames.is_some()
    }

    pub fn device(&self) -> RenderResult<&dyn GfxDevice> {
        Ok(self.device.as_ref().ok_or(RenderError::NotLive("device"))?.device.as_ref())
    }

    fn device_mut(&mut self) -> RenderResult<&mut dyn GfxDevice> {
        Ok(self.device.as_mut().ok_or(RenderError::NotLive("device"))?.device.as_mut())
    }

    /// 第 `index` 个 back buffer，由显示队列持有
    pub fn back_buffer(&self, index: usize) -> RenderResult<GfxResourceHandle> {
        let device = self.device.as_ref().ok_or(RenderError::NotLive("device"))?;
        let display = self.display.as_ref().ok_or(RenderError::NotLive("display queue"))?;
        Ok(display.render_target(device.device.as_ref(), index)?)
    }

    pub fn display(&self) -> Option<&DisplayQueue> {
        self.display.as_ref()
    }

    pub fn rtv_heap(&self) -> Option<&RenderTargetAlloc> {
        self.heaps.as_ref().map(|h| &h.rtv)
    }

    pub fn dsv_heap(&self) -> Option<&DepthStencilAlloc> {
        self.heaps.as_ref().map(|h| &h.dsv)
    }

    pub fn srv_heap(&self) -> Option<&ShaderDataAlloc> {
        self.heaps.as_ref().map(|h| &h.srv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_gfx::basic::format::PixelFormat;
    use ember_gfx::basic::resource_state::ResourceState;
    use ember_gfx::headless::instance::HeadlessInstance;
    use ember_gfx::headless::probe::HeadlessProbe;
    use ember_gfx::resources::buffer::BufferUsage;
    use ember_gfx::resources::texture::TextureUsage;

    fn create_context() -> (RenderContext, HeadlessProbe) {
        let instance = HeadlessInstance::new();
        let probe = instance.probe();
        let create_info = RenderCreateInfo {
            display_size: Extent2D::new(64, 32),
            render_size: Extent2D::new(32, 16),
            ..Default::default()
        };
        (RenderContext::new(Box::new(instance), create_info).unwrap(), probe)
    }

    fn run_empty_frame(context: &mut RenderContext) {
        context.begin_render().unwrap();
        context.begin_direct().unwrap();
        let back_buffer = context.back_buffer(context.frame_index()).unwrap();
        // present 要求 back buffer 处于 Present 状态，这里只做一次往返
        context
            .transition(vec![Transition {
                resource: back_buffer,
                before: ResourceState::Present,
                after: ResourceState::RenderTarget,
            }])
            .unwrap();
        context
            .transition(vec![Transition {
                resource: back_buffer,
                before: ResourceState::RenderTarget,
                after: ResourceState::Present,
            }])
            .unwrap();
        context.end_direct().unwrap();
        context.end_render(true).unwrap();
    }

    #[test]
    fn test_create_and_drop_leaves_no_objects() {
        let (context, probe) = create_context();
        assert!(context.is_live());
        assert_eq!(context.adapters().len(), 2);
        assert!(probe.live_objects() > 0);
        drop(context);
        assert_eq!(probe.live_objects(), 0);
        assert_eq!(probe.live_devices(), 0);
    }

    #[test]
    fn test_out_of_range_adapter_falls_back() {
        let instance = HeadlessInstance::new();
        let create_info = RenderCreateInfo {
            adapter_index: 7,
            ..Default::default()
        };
        let context = RenderContext::new(Box::new(instance), create_info).unwrap();
        assert_eq!(context.adapter_index(), 0);
    }

    #[test]
    fn test_frames_rotate_and_present() {
        let (mut context, probe) = create_context();
        for _ in 0..3 {
            run_empty_frame(&mut context);
        }

        let presents = probe.presents();
        assert_eq!(presents.iter().map(|p| p.frame_index).collect::<Vec<_>>(), vec![0, 1, 0]);
        assert!(presents.iter().all(|p| !p.allow_tearing));
        assert_eq!(context.frame_counter().frame_id(), 3);

        // 每一帧的提交都以设置 shader heap 开始
        let submissions = probe.submissions();
        assert_eq!(submissions.len(), 3);
        assert!(submissions.iter().all(|s| matches!(s.commands[0], GfxCommand::SetShaderHeap(_))));
    }

    #[test]
    fn test_begin_render_waits_for_frame_fence() {
        let (mut context, probe) = create_context();
        probe.hold_fences(true);

        // 两个 back buffer：前两帧的 command memory 都是新的，不需要等待
        run_empty_frame(&mut context);
        run_empty_frame(&mut context);
        assert!(probe.fence_waits().is_empty());

        // 之后每一帧都要等到上一次使用同一块 memory 的那一帧完成
        run_empty_frame(&mut context);
        run_empty_frame(&mut context);
        let waits = probe.fence_waits();
        assert_eq!(waits.iter().map(|w| w.value).collect::<Vec<_>>(), vec![1, 2]);
        assert!(waits.iter().all(|w| w.fence_name == "direct-fence"));
        assert_eq!(probe.presents().len(), 4);
    }

    #[test]
    fn test_recording_outside_direct_is_rejected() {
        let (mut context, _probe) = create_context();
        let err = context.draw(3, 1).unwrap_err();
        assert!(matches!(err, RenderError::Validation(_)));
    }

    #[test]
    fn test_copy_upload_destroys_staging() {
        let (mut context, probe) = create_context();
        let buffer = context
            .create_buffer(&BufferDesc::new("vertices", 64, BufferUsage::VERTEX | BufferUsage::COPY_DST))
            .unwrap();
        let before = probe.live_objects();

        context.begin_copy().unwrap();
        context.copy_buffer(buffer, &[7u8; 64]).unwrap();
        assert_eq!(probe.live_objects(), before + 1);
        context.end_copy().unwrap();
        assert_eq!(probe.live_objects(), before);

        let copies = probe.submissions().into_iter().filter(|s| s.queue_type == CommandType::Copy).count();
        assert_eq!(copies, 1);
        context.destroy_resource(buffer);
    }

    #[test]
    fn test_failed_map_releases_descriptor() {
        let (mut context, _probe) = create_context();
        let buffer = context.create_buffer(&BufferDesc::new("plain", 16, BufferUsage::VERTEX)).unwrap();

        assert!(context.map_shader_resource(buffer).is_err());
        assert_eq!(context.srv_heap().unwrap().allocator().allocated_count(), 0);

        let texture = context
            .create_texture(&TextureDesc::new(
                "scene",
                Extent2D::new(8, 8),
                PixelFormat::Rgba8Unorm,
                TextureUsage::RENDER_TARGET | TextureUsage::SHADER_READ,
            ))
            .unwrap();
        let srv = context.map_shader_resource(texture).unwrap();
        let rtv = context.map_render_target(texture).unwrap();
        assert_eq!(srv.get(), 0);
        assert_eq!(rtv.get(), 0);
        context.release_srv(srv);
        context.release_rtv(rtv);

        context.destroy_resource(texture);
        context.destroy_resource(buffer);
    }

    #[test]
    fn test_back_buffer_count_change_rebuilds_frames() {
        let (mut context, probe) = create_context();
        run_empty_frame(&mut context);

        context.flush().unwrap();
        context.change_back_buffer_count(3).unwrap();
        assert_eq!(context.back_buffer_count(), 3);
        assert!(context.back_buffer(2).is_ok());

        probe.clear_records();
        for _ in 0..4 {
            run_empty_frame(&mut context);
        }
        let indices: Vec<_> = probe.presents().iter().map(|p| p.frame_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_fullscreen_disables_tearing() {
        let instance = HeadlessInstance::new();
        let probe = instance.probe();
        let create_info = RenderCreateInfo {
            allow_tearing: true,
            ..Default::default()
        };
        let mut context = RenderContext::new(Box::new(instance), create_info).unwrap();

        run_empty_frame(&mut context);
        context.change_fullscreen(true).unwrap();
        assert!(context.is_fullscreen());
        run_empty_frame(&mut context);

        let tearing: Vec<_> = probe.presents().iter().map(|p| p.allow_tearing).collect();
        assert_eq!(tearing, vec![true, false]);
    }

    #[test]
    fn test_resume_from_fault_rebuilds_device() {
        let (mut context, probe) = create_context();
        probe.inject_device_removed();

        context.begin_render().unwrap();
        context.begin_direct().unwrap();
        let err = context.end_direct().unwrap_err();
        assert!(err.is_recoverable());

        context.resume_from_fault().unwrap();
        assert_eq!(probe.devices_created(), 2);
        assert_eq!(probe.live_devices(), 1);
        assert_eq!(probe.fault_reports(), 1);
        run_empty_frame(&mut context);
    }

    #[test]
    fn test_change_adapter_validates_index() {
        let (mut context, probe) = create_context();
        assert!(matches!(context.change_adapter(5), Err(RenderError::Validation(_))));
        assert_eq!(probe.devices_created(), 1);

        context.change_adapter(1).unwrap();
        assert_eq!(context.adapter_index(), 1);
        assert_eq!(probe.devices_created(), 2);
        assert_eq!(context.device().unwrap().adapter_info().name, "Ember Headless Software");
    }

    #[test]
    fn test_revert_of_captures_current_values() {
        let (context, _probe) = create_context();
        assert_eq!(
            context.revert_of(ContextChange::DisplaySize(Extent2D::new(1, 1))),
            ContextChange::DisplaySize(Extent2D::new(64, 32))
        );
        assert!(context.is_unchanged(ContextChange::BackBufferCount(2)));
        assert!(!context.is_unchanged(ContextChange::ResumeFromFault));
    }
}
