use crate::basic::extent::Extent2D;
use crate::basic::resource_state::ResourceState;
use crate::commands::command::{CommandType, GfxCommand};
use crate::foundation::device::GfxDevice;
use crate::foundation::instance::AdapterInfo;
use crate::gfx_error::{GfxError, GfxResult};
use crate::handles::*;
use crate::headless::probe::{FenceWait, HeadlessProbe, PresentRecord, Submission};
use crate::resources::buffer::{BufferDesc, BufferUsage};
use crate::resources::heap::{HeapDesc, HeapKind, HeapLayout, HostDescriptor, ViewKind};
use crate::resources::pipeline::GraphicsPipelineDesc;
use crate::resources::texture::{TextureDesc, TextureUsage};
use crate::swapchain::display_queue::DisplayDesc;
use slotmap::SlotMap;

/// 每个描述符堆占用的地址区间
const HEAP_ADDRESS_SPAN: u64 = 1 << 24;
/// device 地址在 host 地址的基础上置位
const DEVICE_ADDRESS_BIT: u64 = 1 << 48;
const DESCRIPTOR_STRIDE: u64 = 32;
const MAX_BACK_BUFFERS: u32 = 16;

struct HeadlessQueue {
    ty: CommandType,
    name: String,
    /// 上一次 signal 之后提交过的 command memory
    unfenced: Vec<GfxCommandMemoryHandle>,
}

struct HeadlessFence {
    name: String,
    /// GPU 已经完成的值
    value: u64,
    /// 已经 signal 但可能尚未完成的最大值
    signalled: u64,
}

struct HeadlessCommandMemory {
    ty: CommandType,
    name: String,
    /// 这块 memory 上的命令在该 fence 值完成之前仍在执行
    in_flight: Option<(GfxFenceHandle, u64)>,
}

struct HeadlessCommandList {
    ty: CommandType,
    name: String,
    memory: GfxCommandMemoryHandle,
    recording: bool,
    commands: Vec<GfxCommand>,
}

struct HeadlessHeap {
    desc: HeapDesc,
    layout: HeapLayout,
    slots: Vec<Option<(GfxResourceHandle, ViewKind)>>,
}

enum ResourceKind {
    Texture(TextureDesc),
    Buffer { desc: BufferDesc, data: Vec<u8> },
}

struct HeadlessResource {
    kind: ResourceKind,
    /// 录制时跟踪的状态，用于模拟 debug layer 的状态校验
    state: ResourceState,
    /// back buffer 由 display 持有
    display_owned: bool,
}

impl HeadlessResource {
    fn name(&self) -> &str {
        match &self.kind {
            ResourceKind::Texture(desc) => &desc.name,
            ResourceKind::Buffer { desc, .. } => &desc.name,
        }
    }
}

struct HeadlessDisplay {
    desc: DisplayDesc,
    buffers: Vec<GfxResourceHandle>,
    frame_index: usize,
    fullscreen: bool,
}

/// headless 逻辑设备
///
/// 录制命令时会检查 transition 的前置状态、render target 是否映射等，
/// 相当于一个始终开启的 validation layer。
pub struct HeadlessDevice {
    info: AdapterInfo,
    probe: HeadlessProbe,
    /// 设备被移除的原因
    removed: Option<String>,

    queues: SlotMap<GfxQueueHandle, HeadlessQueue>,
    fences: SlotMap<GfxFenceHandle, HeadlessFence>,
    memories: SlotMap<GfxCommandMemoryHandle, HeadlessCommandMemory>,
    lists: SlotMap<GfxCommandListHandle, HeadlessCommandList>,
    heaps: SlotMap<GfxHeapHandle, HeadlessHeap>,
    resources: SlotMap<GfxResourceHandle, HeadlessResource>,
    pipelines: SlotMap<GfxPipelineHandle, GraphicsPipelineDesc>,
    displays: SlotMap<GfxDisplayHandle, HeadlessDisplay>,

    next_heap_base: u64,
}

// new & init
impl HeadlessDevice {
    pub(crate) fn new(info: AdapterInfo, probe: HeadlessProbe) -> Self {
        probe.on_device_created();

        Self {
            info,
            probe,
            removed: None,
            queues: SlotMap::with_key(),
            fences: SlotMap::with_key(),
            memories: SlotMap::with_key(),
            lists: SlotMap::with_key(),
            heaps: SlotMap::with_key(),
            resources: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            displays: SlotMap::with_key(),
            next_heap_base: HEAP_ADDRESS_SPAN,
        }
    }
}
impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        let live = self.live_object_count();
        if live > 0 {
            log::warn!("headless device {} dropped with {} live objects", self.info.name, live);
        }
        self.probe.on_device_dropped();
    }
}

// tools
impl HeadlessDevice {
    fn check_live(&self) -> GfxResult<()> {
        match &self.removed {
            Some(reason) => Err(GfxError::DeviceRemoved(reason.clone())),
            None => Ok(()),
        }
    }

    fn insert_resource(&mut self, kind: ResourceKind, state: ResourceState, display_owned: bool) -> GfxResourceHandle {
        self.probe.on_object_created();
        self.resources.insert(HeadlessResource {
            kind,
            state,
            display_owned,
        })
    }

    fn create_back_buffers(&mut self, desc: &DisplayDesc) -> Vec<GfxResourceHandle> {
        (0..desc.buffer_count)
            .map(|i| {
                let texture = TextureDesc::new(
                    format!("back-buffer-{}", i),
                    desc.extent,
                    desc.format,
                    TextureUsage::RENDER_TARGET,
                )
                .with_initial_state(ResourceState::Present);
                self.insert_resource(ResourceKind::Texture(texture), ResourceState::Present, true)
            })
            .collect()
    }

    fn destroy_back_buffers(&mut self, buffers: &[GfxResourceHandle]) {
        let removed = buffers.iter().filter(|b| self.resources.remove(**b).is_some()).count();
        self.probe.on_object_destroyed(removed);
    }

    fn validate_display_desc(buffer_count: u32, extent: Extent2D) -> GfxResult<()> {
        if buffer_count == 0 || buffer_count > MAX_BACK_BUFFERS {
            return Err(GfxError::InvalidArgument(format!(
                "back buffer count {} out of range 1..={}",
                buffer_count, MAX_BACK_BUFFERS
            )));
        }
        if extent.is_empty() {
            return Err(GfxError::InvalidArgument(format!("display extent {} is empty", extent)));
        }
        Ok(())
    }

    /// 根据 host 描述符地址找到所属的堆与槽位
    fn resolve_descriptor(&self, descriptor: HostDescriptor) -> GfxResult<(GfxHeapHandle, usize)> {
        self.heaps
            .iter()
            .find_map(|(handle, heap)| heap.layout.host_index(descriptor).map(|index| (handle, index)))
            .ok_or_else(|| {
                GfxError::InvalidArgument(format!("descriptor {:#x} does not belong to any heap", descriptor.0))
            })
    }

    /// 取出描述符当前指向的资源，并检查资源仍然存活
    fn mapped_resource(&self, descriptor: HostDescriptor, kind: HeapKind) -> GfxResult<GfxResourceHandle> {
        let (heap, index) = self.resolve_descriptor(descriptor)?;
        let heap = &self.heaps[heap];
        if heap.desc.kind != kind {
            return Err(GfxError::InvalidArgument(format!(
                "descriptor {:#x} belongs to a {} heap, expected {}",
                descriptor.0,
                heap.desc.kind.name(),
                kind.name()
            )));
        }

        let (resource, _) = heap.slots[index].ok_or_else(|| {
            GfxError::InvalidArgument(format!("{} descriptor #{} is not mapped", kind.name(), index))
        })?;
        if !self.resources.contains_key(resource) {
            return Err(GfxError::InvalidArgument(format!(
                "{} descriptor #{} references a destroyed resource",
                kind.name(),
                index
            )));
        }
        Ok(resource)
    }

    fn expect_state(&self, resource: GfxResourceHandle, expected: ResourceState, usage: &str) -> GfxResult<()> {
        let res = self.resources.get(resource).ok_or(GfxError::invalid_handle("resource"))?;
        if res.state != expected {
            return Err(GfxError::InvalidArgument(format!(
                "{} used as {} while in state {}, expected {}",
                res.name(),
                usage,
                res.state,
                expected
            )));
        }
        Ok(())
    }

    fn expect_buffer(&self, buffer: GfxResourceHandle, usage: BufferUsage) -> GfxResult<&BufferDesc> {
        match self.resources.get(buffer).map(|r| &r.kind) {
            Some(ResourceKind::Buffer { desc, .. }) if desc.usage.contains(usage) => Ok(desc),
            Some(_) => Err(GfxError::InvalidArgument(format!("resource is not a buffer with {:?} usage", usage))),
            None => Err(GfxError::invalid_handle("buffer")),
        }
    }

    /// 模拟 debug layer：检查命令的合法性，并推进录制时的资源状态
    fn validate_command(&mut self, command: &GfxCommand) -> GfxResult<()> {
        match command {
            GfxCommand::Transition(transitions) => {
                for transition in transitions {
                    let res =
                        self.resources.get_mut(transition.resource).ok_or(GfxError::invalid_handle("resource"))?;
                    if res.state != transition.before {
                        return Err(GfxError::InvalidArgument(format!(
                            "transition of {} expects {} but resource is in {}",
                            res.name(),
                            transition.before,
                            res.state
                        )));
                    }
                    res.state = transition.after;
                }
            }
            GfxCommand::SetShaderHeap(heap) => {
                let heap = self.heaps.get(*heap).ok_or(GfxError::invalid_handle("heap"))?;
                if !heap.desc.kind.shader_visible() {
                    return Err(GfxError::InvalidArgument(format!("{} heap is not shader visible", heap.desc.name)));
                }
            }
            GfxCommand::SetPipeline(pipeline) => {
                if !self.pipelines.contains_key(*pipeline) {
                    return Err(GfxError::invalid_handle("pipeline"));
                }
            }
            GfxCommand::SetShaderInput { slot, descriptor } => {
                if *slot >= GraphicsPipelineDesc::MAX_SHADER_INPUTS {
                    return Err(GfxError::InvalidArgument(format!("shader input slot {} out of range", slot)));
                }
                let found = self.heaps.values().any(|heap| heap.layout.device_index(*descriptor).is_some());
                if !found {
                    return Err(GfxError::InvalidArgument(format!(
                        "device descriptor {:#x} does not belong to any heap",
                        descriptor.0
                    )));
                }
            }
            GfxCommand::SetRenderTarget { rtv, dsv } => {
                let target = self.mapped_resource(*rtv, HeapKind::RenderTarget)?;
                self.expect_state(target, ResourceState::RenderTarget, "render target")?;
                if let Some(dsv) = dsv {
                    let depth = self.mapped_resource(*dsv, HeapKind::DepthStencil)?;
                    self.expect_state(depth, ResourceState::DepthWrite, "depth stencil")?;
                }
            }
            GfxCommand::ClearRenderTarget { rtv, .. } => {
                let target = self.mapped_resource(*rtv, HeapKind::RenderTarget)?;
                self.expect_state(target, ResourceState::RenderTarget, "clear target")?;
            }
            GfxCommand::ClearDepthStencil { dsv, .. } => {
                let depth = self.mapped_resource(*dsv, HeapKind::DepthStencil)?;
                self.expect_state(depth, ResourceState::DepthWrite, "clear depth")?;
            }
            GfxCommand::SetVertexBuffer { buffer, .. } => {
                self.expect_buffer(*buffer, BufferUsage::VERTEX)?;
            }
            GfxCommand::SetIndexBuffer { buffer, .. } => {
                self.expect_buffer(*buffer, BufferUsage::INDEX)?;
            }
            GfxCommand::CopyBuffer { dst, src, size } => {
                let dst_size = self.expect_buffer(*dst, BufferUsage::COPY_DST)?.size;
                let src_size = self.expect_buffer(*src, BufferUsage::COPY_SRC)?.size;
                if *size > dst_size || *size > src_size {
                    return Err(GfxError::InvalidArgument(format!(
                        "copy of {} bytes exceeds buffer sizes (src {}, dst {})",
                        size, src_size, dst_size
                    )));
                }
            }
            GfxCommand::CopyTexture { dst, src } => {
                let src_size = self.expect_buffer(*src, BufferUsage::COPY_SRC)?.size;
                let required = match self.resources.get(*dst).map(|r| &r.kind) {
                    Some(ResourceKind::Texture(desc)) => desc.byte_size(),
                    Some(_) => return Err(GfxError::InvalidArgument("copy destination is not a texture".to_string())),
                    None => return Err(GfxError::invalid_handle("texture")),
                };
                if src_size < required {
                    return Err(GfxError::InvalidArgument(format!(
                        "staging buffer holds {} bytes, texture needs {}",
                        src_size, required
                    )));
                }
                self.expect_state(*dst, ResourceState::CopyDest, "copy destination")?;
            }
            GfxCommand::SetDisplay { .. }
            | GfxCommand::Draw { .. }
            | GfxCommand::DrawIndexed { .. }
            | GfxCommand::BeginEvent(_)
            | GfxCommand::EndEvent => {}
        }
        Ok(())
    }
}

impl GfxDevice for HeadlessDevice {
    fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    fn create_queue(&mut self, ty: CommandType, name: &str) -> GfxResult<GfxQueueHandle> {
        self.check_live()?;
        self.probe.on_object_created();
        Ok(self.queues.insert(HeadlessQueue {
            ty,
            name: name.to_string(),
            unfenced: Vec::new(),
        }))
    }

    fn create_fence(&mut self, name: &str) -> GfxResult<GfxFenceHandle> {
        self.check_live()?;
        self.probe.on_object_created();
        Ok(self.fences.insert(HeadlessFence {
            name: name.to_string(),
            value: 0,
            signalled: 0,
        }))
    }

    fn fence_value(&self, fence: GfxFenceHandle) -> GfxResult<u64> {
        self.fences.get(fence).map(|f| f.value).ok_or(GfxError::invalid_handle("fence"))
    }

    fn wait_fence(&mut self, fence: GfxFenceHandle, value: u64) -> GfxResult<()> {
        let fence = self.fences.get_mut(fence).ok_or(GfxError::invalid_handle("fence"))?;
        if fence.value >= value {
            return Ok(());
        }
        // 没有被 signal 过的值永远不会到达
        if fence.signalled < value {
            log::error!("fence {} waits for {} but only {} was signalled", fence.name, value, fence.signalled);
            return Err(GfxError::Timeout { value });
        }

        // 被挂起的 GPU 在 CPU 等待时追上进度
        fence.value = value;
        self.probe.record_fence_wait(FenceWait {
            fence_name: fence.name.clone(),
            value,
        });
        Ok(())
    }

    fn signal(&mut self, queue: GfxQueueHandle, fence_handle: GfxFenceHandle, value: u64) -> GfxResult<()> {
        let queue = self.queues.get_mut(queue).ok_or(GfxError::invalid_handle("queue"))?;
        let fence = self.fences.get_mut(fence_handle).ok_or(GfxError::invalid_handle("fence"))?;

        fence.signalled = fence.signalled.max(value);
        if self.removed.is_some() {
            // 设备移除之后所有 fence 都视为完成，等待不会卡死
            fence.value = u64::MAX;
        } else if !self.probe.fences_held() {
            fence.value = fence.value.max(value);
        }

        for memory in queue.unfenced.drain(..) {
            if let Some(memory) = self.memories.get_mut(memory) {
                memory.in_flight = Some((fence_handle, value));
            }
        }
        Ok(())
    }

    fn submit(&mut self, queue_handle: GfxQueueHandle, list: GfxCommandListHandle) -> GfxResult<()> {
        self.check_live()?;

        let queue = self.queues.get(queue_handle).ok_or(GfxError::invalid_handle("queue"))?;
        let queue_type = queue.ty;
        let list = self.lists.get(list).ok_or(GfxError::invalid_handle("command list"))?;
        if list.recording {
            return Err(GfxError::InvalidArgument(format!("command list {} is still recording", list.name)));
        }
        if list.ty != queue_type {
            return Err(GfxError::InvalidArgument(format!(
                "{} command list {} submitted to {} queue {}",
                list.ty.name(),
                list.name,
                queue_type.name(),
                queue.name
            )));
        }

        if queue_type == CommandType::Direct {
            if let Some(fault) = self.probe.take_fault() {
                if let GfxError::DeviceRemoved(reason) = &fault {
                    log::error!("headless device {} removed: {}", self.info.name, reason);
                    self.removed = Some(reason.clone());
                }
                return Err(fault);
            }
        }

        self.probe.record_submission(Submission {
            queue_type,
            list_name: list.name.clone(),
            commands: list.commands.clone(),
        });
        let memory = list.memory;
        if let Some(queue) = self.queues.get_mut(queue_handle) {
            queue.unfenced.push(memory);
        }
        Ok(())
    }

    fn create_command_memory(&mut self, ty: CommandType, name: &str) -> GfxResult<GfxCommandMemoryHandle> {
        self.check_live()?;
        self.probe.on_object_created();
        Ok(self.memories.insert(HeadlessCommandMemory {
            ty,
            name: name.to_string(),
            in_flight: None,
        }))
    }

    fn create_command_list(
        &mut self,
        memory: GfxCommandMemoryHandle,
        name: &str,
    ) -> GfxResult<GfxCommandListHandle> {
        self.check_live()?;
        let ty = self.memories.get(memory).ok_or(GfxError::invalid_handle("command memory"))?.ty;
        self.probe.on_object_created();
        Ok(self.lists.insert(HeadlessCommandList {
            ty,
            name: name.to_string(),
            memory,
            recording: false,
            commands: Vec::new(),
        }))
    }

    fn begin_commands(&mut self, list: GfxCommandListHandle, memory: GfxCommandMemoryHandle) -> GfxResult<()> {
        let memory_info = self.memories.get_mut(memory).ok_or(GfxError::invalid_handle("command memory"))?;
        if let Some((fence, value)) = memory_info.in_flight {
            // fence 已经销毁时视为完成
            let reached = self.fences.get(fence).map_or(u64::MAX, |f| f.value);
            if reached < value {
                return Err(GfxError::InvalidArgument(format!(
                    "command memory {} reset while in flight: fence at {}, needs {}",
                    memory_info.name, reached, value
                )));
            }
            memory_info.in_flight = None;
        }
        let (memory_ty, memory_name) = (memory_info.ty, memory_info.name.clone());
        let list = self.lists.get_mut(list).ok_or(GfxError::invalid_handle("command list"))?;
        if list.ty != memory_ty {
            return Err(GfxError::InvalidArgument(format!(
                "{} command list {} cannot record into {} memory {}",
                list.ty.name(),
                list.name,
                memory_ty.name(),
                memory_name
            )));
        }
        if list.recording {
            log::debug!("command list {} reset while recording", list.name);
        }

        list.memory = memory;
        list.commands.clear();
        list.recording = true;
        Ok(())
    }

    fn end_commands(&mut self, list: GfxCommandListHandle) -> GfxResult<()> {
        let list = self.lists.get_mut(list).ok_or(GfxError::invalid_handle("command list"))?;
        if !list.recording {
            return Err(GfxError::InvalidArgument(format!("command list {} is not recording", list.name)));
        }
        list.recording = false;
        Ok(())
    }

    fn record(&mut self, list: GfxCommandListHandle, command: GfxCommand) -> GfxResult<()> {
        let (ty, recording) = {
            let list = self.lists.get(list).ok_or(GfxError::invalid_handle("command list"))?;
            (list.ty, list.recording)
        };
        if !recording {
            return Err(GfxError::InvalidArgument("recording into a closed command list".to_string()));
        }
        if !command.allowed_on(ty) {
            return Err(GfxError::InvalidArgument(format!("{:?} is not allowed on a {} list", command, ty.name())));
        }

        self.validate_command(&command)?;
        self.lists[list].commands.push(command);
        Ok(())
    }

    fn create_heap(&mut self, desc: &HeapDesc) -> GfxResult<GfxHeapHandle> {
        self.check_live()?;
        if desc.capacity as u64 * DESCRIPTOR_STRIDE >= HEAP_ADDRESS_SPAN {
            return Err(GfxError::OutOfMemory("descriptor"));
        }

        let host_base = self.next_heap_base;
        self.next_heap_base += HEAP_ADDRESS_SPAN;
        let layout = HeapLayout {
            host_base,
            device_base: desc.kind.shader_visible().then_some(host_base | DEVICE_ADDRESS_BIT),
            stride: DESCRIPTOR_STRIDE,
            capacity: desc.capacity,
        };

        self.probe.on_object_created();
        Ok(self.heaps.insert(HeadlessHeap {
            desc: desc.clone(),
            layout,
            slots: vec![None; desc.capacity],
        }))
    }

    fn heap_layout(&self, heap: GfxHeapHandle) -> GfxResult<HeapLayout> {
        self.heaps.get(heap).map(|h| h.layout).ok_or(GfxError::invalid_handle("heap"))
    }

    fn map_view(&mut self, descriptor: HostDescriptor, resource: GfxResourceHandle, view: ViewKind) -> GfxResult<()> {
        let (heap, index) = self.resolve_descriptor(descriptor)?;
        let heap_kind = self.heaps[heap].desc.kind;
        if heap_kind != view.heap_kind() {
            return Err(GfxError::InvalidArgument(format!("{:?} view cannot live in a {} heap", view, heap_kind.name())));
        }

        let res = self.resources.get(resource).ok_or(GfxError::invalid_handle("resource"))?;
        let compatible = match (&res.kind, view) {
            (ResourceKind::Texture(desc), ViewKind::RenderTarget) => desc.usage.contains(TextureUsage::RENDER_TARGET),
            (ResourceKind::Texture(desc), ViewKind::DepthStencil) => desc.usage.contains(TextureUsage::DEPTH_STENCIL),
            (ResourceKind::Texture(desc), ViewKind::ShaderResource) => desc.usage.contains(TextureUsage::SHADER_READ),
            (ResourceKind::Texture(desc), ViewKind::UnorderedAccess) => desc.usage.contains(TextureUsage::STORAGE),
            (ResourceKind::Buffer { desc, .. }, ViewKind::Uniform) => desc.usage.contains(BufferUsage::UNIFORM),
            _ => false,
        };
        if !compatible {
            return Err(GfxError::InvalidArgument(format!("{} does not support a {:?} view", res.name(), view)));
        }

        self.heaps[heap].slots[index] = Some((resource, view));
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> GfxResult<GfxResourceHandle> {
        self.check_live()?;
        if let Some(error) = self.probe.take_create_failure() {
            return Err(error);
        }
        if desc.extent.is_empty() {
            return Err(GfxError::InvalidArgument(format!("texture {} has empty extent {}", desc.name, desc.extent)));
        }
        if desc.format.is_depth() != desc.usage.contains(TextureUsage::DEPTH_STENCIL) {
            return Err(GfxError::InvalidArgument(format!(
                "texture {} format {:?} does not match usage {:?}",
                desc.name, desc.format, desc.usage
            )));
        }

        Ok(self.insert_resource(ResourceKind::Texture(desc.clone()), desc.initial_state, false))
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> GfxResult<GfxResourceHandle> {
        self.check_live()?;
        if let Some(error) = self.probe.take_create_failure() {
            return Err(error);
        }
        if desc.size == 0 {
            return Err(GfxError::InvalidArgument(format!("buffer {} has zero size", desc.name)));
        }

        let data = if desc.usage.contains(BufferUsage::HOST_WRITE) { vec![0; desc.size as usize] } else { Vec::new() };
        Ok(self.insert_resource(
            ResourceKind::Buffer {
                desc: desc.clone(),
                data,
            },
            desc.initial_state,
            false,
        ))
    }

    fn write_buffer(&mut self, buffer: GfxResourceHandle, offset: u64, bytes: &[u8]) -> GfxResult<()> {
        self.check_live()?;
        match self.resources.get_mut(buffer).map(|r| &mut r.kind) {
            Some(ResourceKind::Buffer { desc, data }) if desc.usage.contains(BufferUsage::HOST_WRITE) => {
                let start = offset as usize;
                let end = start + bytes.len();
                if end > data.len() {
                    return Err(GfxError::InvalidArgument(format!(
                        "write of {} bytes at {} overflows buffer {} ({} bytes)",
                        bytes.len(),
                        offset,
                        desc.name,
                        desc.size
                    )));
                }
                data[start..end].copy_from_slice(bytes);
                Ok(())
            }
            Some(_) => Err(GfxError::InvalidArgument("resource is not a host writable buffer".to_string())),
            None => Err(GfxError::invalid_handle("buffer")),
        }
    }

    fn create_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> GfxResult<GfxPipelineHandle> {
        self.check_live()?;
        if desc.vertex_shader.is_empty() || desc.pixel_shader.is_empty() {
            return Err(GfxError::InvalidArgument(format!("pipeline {} is missing shader code", desc.name)));
        }
        if desc.shader_inputs > GraphicsPipelineDesc::MAX_SHADER_INPUTS {
            return Err(GfxError::InvalidArgument(format!(
                "pipeline {} declares {} shader inputs",
                desc.name, desc.shader_inputs
            )));
        }

        self.probe.on_object_created();
        Ok(self.pipelines.insert(desc.clone()))
    }

    fn create_display(&mut self, queue: GfxQueueHandle, desc: &DisplayDesc) -> GfxResult<GfxDisplayHandle> {
        self.check_live()?;
        match self.queues.get(queue) {
            Some(q) if q.ty == CommandType::Direct => {}
            Some(_) => return Err(GfxError::InvalidArgument("display queue requires a direct queue".to_string())),
            None => return Err(GfxError::invalid_handle("queue")),
        }
        Self::validate_display_desc(desc.buffer_count, desc.extent)?;

        let buffers = self.create_back_buffers(desc);
        self.probe.on_object_created();
        Ok(self.displays.insert(HeadlessDisplay {
            desc: desc.clone(),
            buffers,
            frame_index: 0,
            fullscreen: false,
        }))
    }

    fn acquire_next_image(&mut self, display: GfxDisplayHandle) -> GfxResult<usize> {
        self.check_live()?;
        self.display_frame_index(display)
    }

    fn display_frame_index(&self, display: GfxDisplayHandle) -> GfxResult<usize> {
        self.displays.get(display).map(|d| d.frame_index).ok_or(GfxError::invalid_handle("display"))
    }

    fn display_buffer(&self, display: GfxDisplayHandle, index: usize) -> GfxResult<GfxResourceHandle> {
        let display = self.displays.get(display).ok_or(GfxError::invalid_handle("display"))?;
        display.buffers.get(index).copied().ok_or_else(|| {
            GfxError::InvalidArgument(format!("back buffer {} out of range ({})", index, display.buffers.len()))
        })
    }

    fn display_buffer_count(&self, display: GfxDisplayHandle) -> GfxResult<u32> {
        let display = self.displays.get(display).ok_or(GfxError::invalid_handle("display"))?;
        Ok(display.buffers.len() as u32)
    }

    fn resize_display(&mut self, display: GfxDisplayHandle, buffer_count: u32, extent: Extent2D) -> GfxResult<()> {
        self.check_live()?;
        Self::validate_display_desc(buffer_count, extent)?;

        let old_buffers = {
            let display = self.displays.get_mut(display).ok_or(GfxError::invalid_handle("display"))?;
            display.desc.buffer_count = buffer_count;
            display.desc.extent = extent;
            display.frame_index = 0;
            std::mem::take(&mut display.buffers)
        };
        self.destroy_back_buffers(&old_buffers);

        let desc = self.displays[display].desc.clone();
        let buffers = self.create_back_buffers(&desc);
        self.displays[display].buffers = buffers;
        Ok(())
    }

    fn set_fullscreen(&mut self, display: GfxDisplayHandle, fullscreen: bool) -> GfxResult<()> {
        let display = self.displays.get_mut(display).ok_or(GfxError::invalid_handle("display"))?;
        display.fullscreen = fullscreen;
        Ok(())
    }

    fn fullscreen_state(&self, display: GfxDisplayHandle) -> GfxResult<bool> {
        self.displays.get(display).map(|d| d.fullscreen).ok_or(GfxError::invalid_handle("display"))
    }

    fn present(&mut self, display: GfxDisplayHandle, allow_tearing: bool) -> GfxResult<()> {
        self.check_live()?;

        let (frame_index, buffer, fullscreen) = {
            let display = self.displays.get(display).ok_or(GfxError::invalid_handle("display"))?;
            (display.frame_index, display.buffers[display.frame_index], display.fullscreen)
        };
        self.expect_state(buffer, ResourceState::Present, "present source")?;

        self.probe.record_present(PresentRecord {
            frame_index,
            allow_tearing,
            fullscreen,
        });

        let display = &mut self.displays[display];
        display.frame_index = (display.frame_index + 1) % display.buffers.len();
        Ok(())
    }

    fn destroy(&mut self, object: GfxObject) {
        let removed = match object {
            GfxObject::Queue(h) => self.queues.remove(h).is_some(),
            GfxObject::Fence(h) => self.fences.remove(h).is_some(),
            GfxObject::CommandMemory(h) => self.memories.remove(h).is_some(),
            GfxObject::CommandList(h) => self.lists.remove(h).is_some(),
            GfxObject::Heap(h) => self.heaps.remove(h).is_some(),
            GfxObject::Pipeline(h) => self.pipelines.remove(h).is_some(),
            GfxObject::Resource(h) => {
                if self.resources.get(h).is_some_and(|r| r.display_owned) {
                    log::error!("back buffers are owned by the display queue and cannot be destroyed directly");
                    false
                } else {
                    self.resources.remove(h).is_some()
                }
            }
            GfxObject::Display(h) => match self.displays.remove(h) {
                Some(display) => {
                    self.destroy_back_buffers(&display.buffers);
                    true
                }
                None => false,
            },
        };

        if removed {
            self.probe.on_object_destroyed(1);
        }
    }

    fn report_fault_info(&self) {
        self.probe.on_fault_report();
        match &self.removed {
            Some(reason) => log::error!("device {} fault: removed ({})", self.info.name, reason),
            None => log::warn!("device {} fault reported, device still alive", self.info.name),
        }
    }

    fn live_object_count(&self) -> usize {
        self.queues.len()
            + self.fences.len()
            + self.memories.len()
            + self.lists.len()
            + self.heaps.len()
            + self.resources.len()
            + self.pipelines.len()
            + self.displays.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::format::PixelFormat;
    use crate::commands::command::Transition;
    use crate::foundation::instance::{DeviceFlags, GfxInstance};
    use crate::headless::instance::HeadlessInstance;
    use crate::swapchain::display_queue::DisplayTarget;

    fn create_device() -> (Box<dyn GfxDevice>, HeadlessProbe) {
        let mut instance = HeadlessInstance::new();
        let probe = instance.probe();
        let adapters = instance.enumerate_adapters().unwrap();
        (adapters[0].create_device(DeviceFlags::DEBUG).unwrap(), probe)
    }

    #[test]
    fn test_submit_records_commands_and_signals() {
        let (mut device, probe) = create_device();
        let queue = device.create_queue(CommandType::Direct, "direct").unwrap();
        let fence = device.create_fence("fence").unwrap();
        let memory = device.create_command_memory(CommandType::Direct, "memory").unwrap();
        let list = device.create_command_list(memory, "list").unwrap();

        device.begin_commands(list, memory).unwrap();
        device.record(list, GfxCommand::BeginEvent("frame".to_string())).unwrap();
        device.record(list, GfxCommand::EndEvent).unwrap();
        // 还在录制时不能提交
        assert!(device.submit(queue, list).is_err());
        device.end_commands(list).unwrap();
        device.submit(queue, list).unwrap();

        device.signal(queue, fence, 1).unwrap();
        device.wait_fence(fence, 1).unwrap();
        assert_eq!(device.fence_value(fence).unwrap(), 1);
        assert_eq!(device.wait_fence(fence, 2), Err(GfxError::Timeout { value: 2 }));

        assert_eq!(probe.submissions().len(), 1);
        assert_eq!(probe.direct_commands().len(), 2);
    }

    #[test]
    fn test_held_fence_blocks_memory_reuse() {
        let (mut device, probe) = create_device();
        probe.hold_fences(true);
        let queue = device.create_queue(CommandType::Direct, "direct").unwrap();
        let fence = device.create_fence("fence").unwrap();
        let memory = device.create_command_memory(CommandType::Direct, "memory").unwrap();
        let list = device.create_command_list(memory, "list").unwrap();

        device.begin_commands(list, memory).unwrap();
        device.end_commands(list).unwrap();
        device.submit(queue, list).unwrap();
        device.signal(queue, fence, 1).unwrap();
        assert_eq!(device.fence_value(fence).unwrap(), 0);

        // GPU 还没有完成，memory 不能被重置
        let err = device.begin_commands(list, memory).unwrap_err();
        assert!(matches!(err, GfxError::InvalidArgument(_)));
        assert_eq!(device.wait_fence(fence, 2), Err(GfxError::Timeout { value: 2 }));

        device.wait_fence(fence, 1).unwrap();
        assert_eq!(device.fence_value(fence).unwrap(), 1);
        assert_eq!(
            probe.fence_waits(),
            vec![FenceWait {
                fence_name: "fence".to_string(),
                value: 1
            }]
        );
        device.begin_commands(list, memory).unwrap();
    }

    #[test]
    fn test_transition_validates_before_state() {
        let (mut device, _probe) = create_device();
        let memory = device.create_command_memory(CommandType::Direct, "memory").unwrap();
        let list = device.create_command_list(memory, "list").unwrap();
        let texture = device
            .create_texture(&TextureDesc::new(
                "scene",
                Extent2D::new(4, 4),
                PixelFormat::Rgba8Unorm,
                TextureUsage::RENDER_TARGET | TextureUsage::SHADER_READ,
            ))
            .unwrap();

        device.begin_commands(list, memory).unwrap();
        let wrong = GfxCommand::Transition(vec![Transition {
            resource: texture,
            before: ResourceState::RenderTarget,
            after: ResourceState::ShaderResource,
        }]);
        assert!(matches!(device.record(list, wrong), Err(GfxError::InvalidArgument(_))));

        let right = GfxCommand::Transition(vec![Transition {
            resource: texture,
            before: ResourceState::Common,
            after: ResourceState::RenderTarget,
        }]);
        device.record(list, right).unwrap();
    }

    #[test]
    fn test_injected_removal_and_leak_tracking() {
        let (mut device, probe) = create_device();
        let queue = device.create_queue(CommandType::Direct, "direct").unwrap();
        let fence = device.create_fence("fence").unwrap();
        let memory = device.create_command_memory(CommandType::Direct, "memory").unwrap();
        let list = device.create_command_list(memory, "list").unwrap();
        let display = device
            .create_display(
                queue,
                &DisplayDesc {
                    target: DisplayTarget::Headless,
                    extent: Extent2D::new(16, 16),
                    buffer_count: 2,
                    format: PixelFormat::Rgba8Unorm,
                },
            )
            .unwrap();
        // queue + fence + memory + list + display + 2 back buffers
        assert_eq!(probe.live_objects(), 7);

        probe.inject_device_removed();
        device.begin_commands(list, memory).unwrap();
        device.end_commands(list).unwrap();
        assert!(matches!(device.submit(queue, list), Err(GfxError::DeviceRemoved(_))));
        // 移除之后 fence 等待立即返回
        device.signal(queue, fence, 10).unwrap();
        device.wait_fence(fence, 10).unwrap();
        assert!(device.create_fence("late").is_err());

        for object in [
            GfxObject::from(display),
            list.into(),
            memory.into(),
            fence.into(),
            queue.into(),
        ] {
            device.destroy(object);
        }
        assert_eq!(probe.live_objects(), 0);
        drop(device);
        assert_eq!(probe.live_devices(), 0);
    }

    #[test]
    fn test_present_rotates_back_buffers() {
        let (mut device, probe) = create_device();
        let queue = device.create_queue(CommandType::Direct, "direct").unwrap();
        let display = device
            .create_display(
                queue,
                &DisplayDesc {
                    target: DisplayTarget::Headless,
                    extent: Extent2D::new(8, 8),
                    buffer_count: 3,
                    format: PixelFormat::Bgra8Unorm,
                },
            )
            .unwrap();

        for expected in [0, 1, 2, 0] {
            assert_eq!(device.acquire_next_image(display).unwrap(), expected);
            device.present(display, false).unwrap();
        }
        assert_eq!(probe.presents().len(), 4);

        let before = device.display_buffer(display, 0).unwrap();
        device.resize_display(display, 2, Extent2D::new(4, 4)).unwrap();
        assert_eq!(device.display_frame_index(display).unwrap(), 0);
        assert_ne!(device.display_buffer(display, 0).unwrap(), before);
        assert!(device.display_buffer(display, 2).is_err());
    }
}
