use std::ffi::CString;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use ash::vk;
use slotmap::SlotMap;
use vk_mem::Alloc;

use crate::basic::extent::Extent2D;
use crate::basic::resource_state::ResourceState;
use crate::commands::command::{CommandType, GfxCommand};
use crate::foundation::device::GfxDevice;
use crate::foundation::instance::{AdapterInfo, DeviceFlags};
use crate::gfx_error::{GfxError, GfxResult};
use crate::handles::*;
use crate::resources::buffer::{BufferDesc, BufferUsage};
use crate::resources::heap::{HeapDesc, HeapKind, HeapLayout, HostDescriptor, ViewKind};
use crate::resources::pipeline::GraphicsPipelineDesc;
use crate::resources::texture::{TextureDesc, TextureUsage};
use crate::swapchain::display_queue::DisplayDesc;
use crate::vulkan::convert::{aspect_mask, buffer_usage, pixel_format, texture_usage, vk_error};
use crate::vulkan::descriptor::{BindlessLayout, DescriptorSlot, VkHeap};
use crate::vulkan::display::VkDisplay;
use crate::vulkan::instance::VulkanCore;
use crate::vulkan::pipeline::create_graphics_pipeline;
use crate::vulkan::recorder::RecordState;

/// 每个描述符堆占用的地址区间
const HEAP_ADDRESS_SPAN: u64 = 1 << 24;
/// device 地址在 host 地址的基础上置位
const DEVICE_ADDRESS_BIT: u64 = 1 << 48;
const DESCRIPTOR_STRIDE: u64 = 32;
/// 等待 fence 的超时时间，纳秒
const FENCE_TIMEOUT_NS: u64 = 10_000_000_000;

pub(crate) struct VkQueue {
    pub(crate) ty: CommandType,
    pub(crate) name: String,
    pub(crate) queue: vk::Queue,
    /// 下一次提交需要等待的 binary semaphore（交换链 acquire）
    pub(crate) pending_waits: Vec<vk::Semaphore>,
    /// 下一次提交需要 signal 的 binary semaphore（交换链 present）
    pub(crate) pending_signals: Vec<vk::Semaphore>,
}

/// timeline semaphore
pub(crate) struct VkFence {
    pub(crate) name: String,
    pub(crate) semaphore: vk::Semaphore,
}

pub(crate) struct VkCommandMemory {
    pub(crate) ty: CommandType,
    pub(crate) name: String,
    pub(crate) pool: vk::CommandPool,
    /// 第一次录制时分配
    pub(crate) buffer: vk::CommandBuffer,
}

pub(crate) struct VkCommandList {
    pub(crate) ty: CommandType,
    pub(crate) name: String,
    pub(crate) memory: GfxCommandMemoryHandle,
    pub(crate) buffer: vk::CommandBuffer,
    pub(crate) recording: bool,
    pub(crate) state: RecordState,
}

pub(crate) enum VkResourceKind {
    Texture {
        desc: TextureDesc,
        image: vk::Image,
        /// 交换链图像没有 allocation
        allocation: Option<vk_mem::Allocation>,
        /// `Present` 状态对应的 layout
        present_layout: vk::ImageLayout,
        /// 还没有做过 layout 转换，内容未定义
        initialized: bool,
    },
    Buffer {
        desc: BufferDesc,
        buffer: vk::Buffer,
        allocation: vk_mem::Allocation,
    },
}

pub(crate) struct VkResource {
    pub(crate) kind: VkResourceKind,
    /// 录制时跟踪的状态
    pub(crate) state: ResourceState,
    /// back buffer 由 display 持有
    pub(crate) display_owned: bool,
}

impl VkResource {
    pub(crate) fn name(&self) -> &str {
        match &self.kind {
            VkResourceKind::Texture { desc, .. } => &desc.name,
            VkResourceKind::Buffer { desc, .. } => &desc.name,
        }
    }
}

/// Vulkan 逻辑设备
///
/// 使用一个全能的 queue family，direct 与 copy 队列都映射到它的 0 号队列。
/// 录制时跟踪资源状态，transition 的前置状态不匹配时直接报错，与 headless 后端的校验一致。
pub struct VulkanDevice {
    pub(crate) core: Arc<VulkanCore>,
    pub(crate) info: AdapterInfo,
    pub(crate) flags: DeviceFlags,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) queue_family: u32,

    pub(crate) device: ash::Device,
    pub(crate) swapchain_loader: Option<ash::khr::swapchain::Device>,
    pub(crate) debug_utils: Option<ash::ext::debug_utils::Device>,
    /// 必须在 device 之前销毁
    pub(crate) allocator: ManuallyDrop<vk_mem::Allocator>,
    pub(crate) bindless: BindlessLayout,

    /// 设备丢失的原因
    pub(crate) removed: Option<String>,

    pub(crate) queues: SlotMap<GfxQueueHandle, VkQueue>,
    pub(crate) fences: SlotMap<GfxFenceHandle, VkFence>,
    pub(crate) memories: SlotMap<GfxCommandMemoryHandle, VkCommandMemory>,
    pub(crate) lists: SlotMap<GfxCommandListHandle, VkCommandList>,
    pub(crate) heaps: SlotMap<GfxHeapHandle, VkHeap>,
    pub(crate) resources: SlotMap<GfxResourceHandle, VkResource>,
    pub(crate) pipelines: SlotMap<GfxPipelineHandle, (String, vk::Pipeline)>,
    pub(crate) displays: SlotMap<GfxDisplayHandle, VkDisplay>,

    /// 创建时带有初始状态的纹理，在下一次开始录制时转换 layout
    pub(crate) pending_init: Vec<GfxResourceHandle>,
    next_heap_base: u64,
}

// new & init
impl VulkanDevice {
    pub(crate) fn new(
        core: Arc<VulkanCore>,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        info: AdapterInfo,
        flags: DeviceFlags,
    ) -> GfxResult<Self> {
        let _span = tracy_client::span!("VulkanDevice::new");

        let mut device_exts = vec![];
        if core.surface.is_some() {
            device_exts.push(ash::khr::swapchain::NAME.as_ptr());
        }

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            // 即使一些 descriptor 是 invalid
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_uniform_buffer_update_after_bind(true)
            .uniform_buffer_standard_layout(true);
        let mut features13 =
            vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true).synchronization2(true);

        let queue_priorities = [1.0];
        let queue_ci = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities);
        let device_ci = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_ci))
            .enabled_extension_names(&device_exts)
            .push_next(&mut features12)
            .push_next(&mut features13);

        let device = unsafe { core.instance.create_device(physical_device, &device_ci, None) }
            .map_err(|e| vk_error(e, "vkCreateDevice"))?;

        let mut allocator_ci = vk_mem::AllocatorCreateInfo::new(&core.instance, &device, physical_device);
        allocator_ci.vulkan_api_version = vk::API_VERSION_1_3;
        let allocator = match unsafe { vk_mem::Allocator::new(allocator_ci) } {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(vk_error(e, "vmaCreateAllocator"));
            }
        };

        let bindless = match BindlessLayout::new(&device) {
            Ok(bindless) => bindless,
            Err(e) => {
                drop(allocator);
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let swapchain_loader = core.surface.as_ref().map(|_| ash::khr::swapchain::Device::new(&core.instance, &device));
        let debug_utils = core.debug_utils.then(|| ash::ext::debug_utils::Device::new(&core.instance, &device));
        core.live_devices.fetch_add(1, Ordering::Relaxed);

        let device = Self {
            core,
            info,
            flags,
            physical_device,
            queue_family,
            device,
            swapchain_loader,
            debug_utils,
            allocator: ManuallyDrop::new(allocator),
            bindless,
            removed: None,
            queues: SlotMap::with_key(),
            fences: SlotMap::with_key(),
            memories: SlotMap::with_key(),
            lists: SlotMap::with_key(),
            heaps: SlotMap::with_key(),
            resources: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            displays: SlotMap::with_key(),
            pending_init: Vec::new(),
            next_heap_base: HEAP_ADDRESS_SPAN,
        };
        device.set_debug_name(device.device.handle(), &format!("device::{}", device.info.name));
        Ok(device)
    }
}
impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("destroying vulkan device {}", self.info.name);
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("device wait idle failed while dropping: {:?}", e);
            }
        }

        let live = self.live_object_count();
        if live > 0 {
            log::warn!("vulkan device {} dropped with {} live objects", self.info.name, live);
        }
        let displays = self.displays.keys().collect::<Vec<_>>();
        for display in displays {
            self.destroy(GfxObject::Display(display));
        }
        let objects = self
            .pipelines
            .keys()
            .map(GfxObject::Pipeline)
            .chain(self.heaps.keys().map(GfxObject::Heap))
            .chain(self.resources.keys().map(GfxObject::Resource))
            .chain(self.lists.keys().map(GfxObject::CommandList))
            .chain(self.memories.keys().map(GfxObject::CommandMemory))
            .chain(self.fences.keys().map(GfxObject::Fence))
            .chain(self.queues.keys().map(GfxObject::Queue))
            .collect::<Vec<_>>();
        for object in objects {
            self.destroy(object);
        }

        self.bindless.destroy(&self.device);
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        self.core.live_devices.fetch_sub(1, Ordering::Relaxed);
    }
}

// tools
impl VulkanDevice {
    pub(crate) fn set_debug_name<H: vk::Handle>(&self, handle: H, name: &str) {
        if !self.flags.contains(DeviceFlags::DEBUG) {
            return;
        }
        let (Some(debug_utils), Ok(name)) = (&self.debug_utils, CString::new(name)) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default().object_handle(handle).object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&name_info) } {
            log::debug!("failed to set debug name {:?}: {:?}", name, e);
        }
    }

    pub(crate) fn check_live(&self) -> GfxResult<()> {
        match &self.removed {
            Some(reason) => Err(GfxError::DeviceRemoved(reason.clone())),
            None => Ok(()),
        }
    }

    /// 设备丢失时记录原因，之后所有创建与提交都会失败
    pub(crate) fn on_error(&mut self, error: GfxError) -> GfxError {
        if let GfxError::DeviceRemoved(reason) = &error {
            if self.removed.is_none() {
                log::error!("vulkan device {} lost: {}", self.info.name, reason);
                self.removed = Some(reason.clone());
            }
        }
        error
    }

    /// 根据 host 描述符地址找到所属的堆与槽位
    pub(crate) fn resolve_descriptor(&self, descriptor: HostDescriptor) -> GfxResult<(GfxHeapHandle, usize)> {
        self.heaps
            .iter()
            .find_map(|(handle, heap)| heap.layout.host_index(descriptor).map(|index| (handle, index)))
            .ok_or_else(|| {
                GfxError::InvalidArgument(format!("descriptor {:#x} does not belong to any heap", descriptor.0))
            })
    }

    /// 取出描述符当前映射的资源与 image view
    pub(crate) fn mapped_view(&self, descriptor: HostDescriptor, kind: HeapKind) -> GfxResult<DescriptorSlot> {
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
        let slot = heap.slots[index].ok_or_else(|| {
            GfxError::InvalidArgument(format!("{} descriptor #{} is not mapped", kind.name(), index))
        })?;
        if !self.resources.contains_key(slot.resource) {
            return Err(GfxError::InvalidArgument(format!(
                "{} descriptor #{} references a destroyed resource",
                kind.name(),
                index
            )));
        }
        Ok(slot)
    }

    pub(crate) fn expect_state(&self, resource: GfxResourceHandle, expected: ResourceState, usage: &str) -> GfxResult<()> {
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

    pub(crate) fn expect_buffer(&self, buffer: GfxResourceHandle, usage: BufferUsage) -> GfxResult<(vk::Buffer, u64)> {
        match self.resources.get(buffer).map(|r| &r.kind) {
            Some(VkResourceKind::Buffer { desc, buffer, .. }) if desc.usage.contains(usage) => Ok((*buffer, desc.size)),
            Some(_) => Err(GfxError::InvalidArgument(format!("resource is not a buffer with {:?} usage", usage))),
            None => Err(GfxError::invalid_handle("buffer")),
        }
    }

    /// 分配一张纹理，`display_owned` 的纹理只能由 display 销毁
    pub(crate) fn allocate_texture(
        &mut self,
        desc: &TextureDesc,
        present_layout: vk::ImageLayout,
        display_owned: bool,
    ) -> GfxResult<GfxResourceHandle> {
        let image_ci = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(pixel_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(texture_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (image, allocation) = unsafe { self.allocator.create_image(&image_ci, &alloc_ci) }
            .map_err(|e| vk_error(e, "vmaCreateImage"))?;
        self.set_debug_name(image, &format!("Image::{}", desc.name));

        Ok(self.resources.insert(VkResource {
            kind: VkResourceKind::Texture {
                desc: desc.clone(),
                image,
                allocation: Some(allocation),
                present_layout,
                initialized: false,
            },
            state: desc.initial_state,
            display_owned,
        }))
    }

    /// 交换链图像：只登记，不持有内存
    pub(crate) fn register_external_texture(
        &mut self,
        desc: TextureDesc,
        image: vk::Image,
        present_layout: vk::ImageLayout,
    ) -> GfxResourceHandle {
        let state = desc.initial_state;
        self.resources.insert(VkResource {
            kind: VkResourceKind::Texture {
                desc,
                image,
                allocation: None,
                present_layout,
                initialized: false,
            },
            state,
            display_owned: true,
        })
    }

    /// 释放资源以及所有指向它的视图
    pub(crate) fn release_resource(&mut self, handle: GfxResourceHandle) -> bool {
        let views = self.heaps.values_mut().flat_map(|heap| heap.release_resource(handle)).collect::<Vec<_>>();
        for view in views {
            unsafe { self.device.destroy_image_view(view, None) };
        }
        self.pending_init.retain(|h| *h != handle);

        let Some(resource) = self.resources.remove(handle) else {
            return false;
        };
        match resource.kind {
            VkResourceKind::Texture {
                image,
                allocation: Some(mut allocation),
                ..
            } => unsafe { self.allocator.destroy_image(image, &mut allocation) },
            VkResourceKind::Texture { allocation: None, .. } => {}
            VkResourceKind::Buffer {
                buffer, mut allocation, ..
            } => unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) },
        }
        true
    }

    fn create_image_view(&self, resource: GfxResourceHandle) -> GfxResult<(vk::ImageView, bool)> {
        let Some(VkResourceKind::Texture { desc, image, .. }) = self.resources.get(resource).map(|r| &r.kind) else {
            return Err(GfxError::InvalidArgument("image views require a texture".to_string()));
        };
        let view_ci = vk::ImageViewCreateInfo::default()
            .image(*image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(pixel_format(desc.format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_mask(desc.format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { self.device.create_image_view(&view_ci, None) }
            .map_err(|e| vk_error(e, "vkCreateImageView"))?;
        self.set_debug_name(view, &format!("ImageView::{}", desc.name));
        Ok((view, desc.format.is_depth()))
    }
}

impl GfxDevice for VulkanDevice {
    fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    fn create_queue(&mut self, ty: CommandType, name: &str) -> GfxResult<GfxQueueHandle> {
        self.check_live()?;
        let queue = unsafe { self.device.get_device_queue(self.queue_family, 0) };
        self.set_debug_name(queue, &format!("Queue::{}", name));
        Ok(self.queues.insert(VkQueue {
            ty,
            name: name.to_string(),
            queue,
            pending_waits: Vec::new(),
            pending_signals: Vec::new(),
        }))
    }

    fn create_fence(&mut self, name: &str) -> GfxResult<GfxFenceHandle> {
        self.check_live()?;
        let mut type_ci = vk::SemaphoreTypeCreateInfo::default().semaphore_type(vk::SemaphoreType::TIMELINE).initial_value(0);
        let semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut type_ci);
        let semaphore = unsafe { self.device.create_semaphore(&semaphore_ci, None) }
            .map_err(|e| vk_error(e, "vkCreateSemaphore"))?;
        self.set_debug_name(semaphore, &format!("Timeline::{}", name));
        Ok(self.fences.insert(VkFence {
            name: name.to_string(),
            semaphore,
        }))
    }

    fn fence_value(&self, fence: GfxFenceHandle) -> GfxResult<u64> {
        let fence = self.fences.get(fence).ok_or(GfxError::invalid_handle("fence"))?;
        // 设备丢失之后所有 fence 都视为完成
        if self.removed.is_some() {
            return Ok(u64::MAX);
        }
        unsafe { self.device.get_semaphore_counter_value(fence.semaphore) }
            .map_err(|e| vk_error(e, "vkGetSemaphoreCounterValue"))
    }

    fn wait_fence(&mut self, fence: GfxFenceHandle, value: u64) -> GfxResult<()> {
        let _span = tracy_client::span!("VulkanDevice::wait_fence");

        let fence = self.fences.get(fence).ok_or(GfxError::invalid_handle("fence"))?;
        if self.removed.is_some() {
            return Ok(());
        }
        let semaphores = [fence.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        match unsafe { self.device.wait_semaphores(&wait_info, FENCE_TIMEOUT_NS) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                log::error!("fence {} timed out waiting for {}", fence.name, value);
                Err(GfxError::Timeout { value })
            }
            Err(e) => {
                let error = vk_error(e, "vkWaitSemaphores");
                Err(self.on_error(error))
            }
        }
    }

    fn signal(&mut self, queue: GfxQueueHandle, fence: GfxFenceHandle, value: u64) -> GfxResult<()> {
        let vk_queue = self.queues.get(queue).ok_or(GfxError::invalid_handle("queue"))?.queue;
        let semaphore = self.fences.get(fence).ok_or(GfxError::invalid_handle("fence"))?.semaphore;
        // 设备丢失之后 fence 不会再前进，等待时直接返回
        if self.removed.is_some() {
            return Ok(());
        }

        let signal_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        let submit_info = vk::SubmitInfo2::default().signal_semaphore_infos(std::slice::from_ref(&signal_info));
        unsafe { self.device.queue_submit2(vk_queue, std::slice::from_ref(&submit_info), vk::Fence::null()) }
            .map_err(|e| vk_error(e, "vkQueueSubmit2"))
            .map_err(|e| self.on_error(e))
    }

    fn submit(&mut self, queue: GfxQueueHandle, list: GfxCommandListHandle) -> GfxResult<()> {
        let _span = tracy_client::span!("VulkanDevice::submit");
        self.check_live()?;

        let queue_entry = self.queues.get(queue).ok_or(GfxError::invalid_handle("queue"))?;
        let list_entry = self.lists.get(list).ok_or(GfxError::invalid_handle("command list"))?;
        if list_entry.recording {
            return Err(GfxError::InvalidArgument(format!("command list {} is still recording", list_entry.name)));
        }
        if list_entry.ty != queue_entry.ty {
            return Err(GfxError::InvalidArgument(format!(
                "{} command list {} submitted to {} queue {}",
                list_entry.ty.name(),
                list_entry.name,
                queue_entry.ty.name(),
                queue_entry.name
            )));
        }
        if list_entry.buffer == vk::CommandBuffer::null() {
            return Err(GfxError::InvalidArgument(format!("command list {} was never recorded", list_entry.name)));
        }
        let command_buffer = list_entry.buffer;

        let queue_entry = &mut self.queues[queue];
        let vk_queue = queue_entry.queue;
        let waits = std::mem::take(&mut queue_entry.pending_waits)
            .into_iter()
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            })
            .collect::<Vec<_>>();
        let signals = std::mem::take(&mut queue_entry.pending_signals)
            .into_iter()
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect::<Vec<_>>();
        let command_info = vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer);
        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(std::slice::from_ref(&command_info))
            .signal_semaphore_infos(&signals);

        unsafe { self.device.queue_submit2(vk_queue, std::slice::from_ref(&submit_info), vk::Fence::null()) }
            .map_err(|e| vk_error(e, "vkQueueSubmit2"))
            .map_err(|e| self.on_error(e))
    }

    fn create_command_memory(&mut self, ty: CommandType, name: &str) -> GfxResult<GfxCommandMemoryHandle> {
        self.check_live()?;
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { self.device.create_command_pool(&pool_ci, None) }
            .map_err(|e| vk_error(e, "vkCreateCommandPool"))?;
        self.set_debug_name(pool, &format!("CommandPool::{}", name));
        Ok(self.memories.insert(VkCommandMemory {
            ty,
            name: name.to_string(),
            pool,
            buffer: vk::CommandBuffer::null(),
        }))
    }

    fn create_command_list(
        &mut self,
        memory: GfxCommandMemoryHandle,
        name: &str,
    ) -> GfxResult<GfxCommandListHandle> {
        self.check_live()?;
        let ty = self.memories.get(memory).ok_or(GfxError::invalid_handle("command memory"))?.ty;
        Ok(self.lists.insert(VkCommandList {
            ty,
            name: name.to_string(),
            memory,
            buffer: vk::CommandBuffer::null(),
            recording: false,
            state: RecordState::default(),
        }))
    }

    fn begin_commands(&mut self, list: GfxCommandListHandle, memory: GfxCommandMemoryHandle) -> GfxResult<()> {
        self.check_live()?;
        let memory_entry = self.memories.get(memory).ok_or(GfxError::invalid_handle("command memory"))?;
        let list_entry = self.lists.get(list).ok_or(GfxError::invalid_handle("command list"))?;
        if list_entry.ty != memory_entry.ty {
            return Err(GfxError::InvalidArgument(format!(
                "{} command list {} cannot record into {} memory {}",
                list_entry.ty.name(),
                list_entry.name,
                memory_entry.ty.name(),
                memory_entry.name
            )));
        }
        let (pool, mut buffer) = (memory_entry.pool, memory_entry.buffer);

        unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty()) }
            .map_err(|e| vk_error(e, "vkResetCommandPool"))?;
        if buffer == vk::CommandBuffer::null() {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
                .map_err(|e| vk_error(e, "vkAllocateCommandBuffers"))?;
            buffer = buffers.into_iter().next().ok_or(GfxError::OutOfMemory("command buffer"))?;
            self.set_debug_name(buffer, &format!("CommandBuffer::{}", self.memories[memory].name));
            self.memories[memory].buffer = buffer;
        }

        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(buffer, &begin_info) }
            .map_err(|e| vk_error(e, "vkBeginCommandBuffer"))?;

        let list_entry = &mut self.lists[list];
        list_entry.memory = memory;
        list_entry.buffer = buffer;
        list_entry.recording = true;
        list_entry.state = RecordState::default();

        self.record_pending_init(buffer);
        Ok(())
    }

    fn end_commands(&mut self, list: GfxCommandListHandle) -> GfxResult<()> {
        let list_entry = self.lists.get_mut(list).ok_or(GfxError::invalid_handle("command list"))?;
        if !list_entry.recording {
            return Err(GfxError::InvalidArgument(format!("command list {} is not recording", list_entry.name)));
        }
        let buffer = list_entry.buffer;
        list_entry.recording = false;
        self.end_rendering(list);

        unsafe { self.device.end_command_buffer(buffer) }.map_err(|e| vk_error(e, "vkEndCommandBuffer"))
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

        self.record_command(list, &command)
    }

    fn create_heap(&mut self, desc: &HeapDesc) -> GfxResult<GfxHeapHandle> {
        self.check_live()?;
        if desc.capacity as u64 * DESCRIPTOR_STRIDE >= HEAP_ADDRESS_SPAN {
            return Err(GfxError::OutOfMemory("descriptor"));
        }

        let (pool, set) = if desc.kind.shader_visible() {
            self.bindless.create_set(&self.device, desc)?
        } else {
            (vk::DescriptorPool::null(), vk::DescriptorSet::null())
        };
        if pool != vk::DescriptorPool::null() {
            self.set_debug_name(pool, &format!("DescriptorPool::{}", desc.name));
        }

        let host_base = self.next_heap_base;
        self.next_heap_base += HEAP_ADDRESS_SPAN;
        let layout = HeapLayout {
            host_base,
            device_base: desc.kind.shader_visible().then_some(host_base | DEVICE_ADDRESS_BIT),
            stride: DESCRIPTOR_STRIDE,
            capacity: desc.capacity,
        };

        Ok(self.heaps.insert(VkHeap {
            desc: desc.clone(),
            layout,
            slots: vec![None; desc.capacity],
            pool,
            set,
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
        let (compatible, uniform_buffer) = match (&res.kind, view) {
            (VkResourceKind::Texture { desc, .. }, ViewKind::RenderTarget) => {
                (desc.usage.contains(TextureUsage::RENDER_TARGET), None)
            }
            (VkResourceKind::Texture { desc, .. }, ViewKind::DepthStencil) => {
                (desc.usage.contains(TextureUsage::DEPTH_STENCIL), None)
            }
            (VkResourceKind::Texture { desc, .. }, ViewKind::ShaderResource) => {
                (desc.usage.contains(TextureUsage::SHADER_READ), None)
            }
            (VkResourceKind::Texture { desc, .. }, ViewKind::UnorderedAccess) => {
                (desc.usage.contains(TextureUsage::STORAGE), None)
            }
            (VkResourceKind::Buffer { desc, buffer, .. }, ViewKind::Uniform) => {
                (desc.usage.contains(BufferUsage::UNIFORM), Some(*buffer))
            }
            _ => (false, None),
        };
        if !compatible {
            return Err(GfxError::InvalidArgument(format!("{} does not support a {:?} view", res.name(), view)));
        }

        let image_view = match uniform_buffer {
            Some(buffer) => {
                let set = self.heaps[heap].set;
                self.bindless.write_uniform(&self.device, set, index, buffer);
                vk::ImageView::null()
            }
            None => {
                let (image_view, is_depth) = self.create_image_view(resource)?;
                if heap_kind.shader_visible() {
                    let layout = match view {
                        ViewKind::UnorderedAccess => vk::ImageLayout::GENERAL,
                        _ if is_depth => vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL,
                        _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    };
                    let set = self.heaps[heap].set;
                    self.bindless.write_image(&self.device, set, index, view, image_view, layout);
                }
                image_view
            }
        };

        let previous = self.heaps[heap].slots[index].replace(DescriptorSlot {
            resource,
            image_view,
        });
        if let Some(previous) = previous.filter(|p| p.image_view != vk::ImageView::null()) {
            unsafe { self.device.destroy_image_view(previous.image_view, None) };
        }
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> GfxResult<GfxResourceHandle> {
        self.check_live()?;
        if desc.extent.is_empty() {
            return Err(GfxError::InvalidArgument(format!("texture {} has empty extent {}", desc.name, desc.extent)));
        }
        if desc.format.is_depth() != desc.usage.contains(TextureUsage::DEPTH_STENCIL) {
            return Err(GfxError::InvalidArgument(format!(
                "texture {} format {:?} does not match usage {:?}",
                desc.name, desc.format, desc.usage
            )));
        }

        let handle = self.allocate_texture(desc, vk::ImageLayout::GENERAL, false)?;
        if desc.initial_state != ResourceState::Common {
            self.pending_init.push(handle);
        }
        Ok(handle)
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> GfxResult<GfxResourceHandle> {
        self.check_live()?;
        if desc.size == 0 {
            return Err(GfxError::InvalidArgument(format!("buffer {} has zero size", desc.name)));
        }

        let buffer_ci = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let alloc_ci = if desc.usage.contains(BufferUsage::HOST_WRITE) {
            vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            }
        } else {
            vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            }
        };

        let (buffer, allocation) = unsafe { self.allocator.create_buffer(&buffer_ci, &alloc_ci) }
            .map_err(|e| vk_error(e, "vmaCreateBuffer"))?;
        self.set_debug_name(buffer, &format!("Buffer::{}", desc.name));

        Ok(self.resources.insert(VkResource {
            kind: VkResourceKind::Buffer {
                desc: desc.clone(),
                buffer,
                allocation,
            },
            state: desc.initial_state,
            display_owned: false,
        }))
    }

    fn write_buffer(&mut self, buffer: GfxResourceHandle, offset: u64, bytes: &[u8]) -> GfxResult<()> {
        self.check_live()?;
        let allocator = &*self.allocator;
        match self.resources.get_mut(buffer).map(|r| &mut r.kind) {
            Some(VkResourceKind::Buffer { desc, allocation, .. }) if desc.usage.contains(BufferUsage::HOST_WRITE) => {
                let end = offset.checked_add(bytes.len() as u64).filter(|end| *end <= desc.size);
                if end.is_none() {
                    return Err(GfxError::InvalidArgument(format!(
                        "write of {} bytes at {} overflows buffer {} ({} bytes)",
                        bytes.len(),
                        offset,
                        desc.name,
                        desc.size
                    )));
                }
                unsafe {
                    let ptr = allocator.map_memory(allocation).map_err(|e| vk_error(e, "vmaMapMemory"))?;
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset as usize), bytes.len());
                    let flushed = allocator.flush_allocation(allocation, offset, bytes.len() as u64);
                    allocator.unmap_memory(allocation);
                    flushed.map_err(|e| vk_error(e, "vmaFlushAllocation"))
                }
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

        let pipeline = create_graphics_pipeline(&self.device, self.bindless.pipeline_layout, desc)?;
        self.set_debug_name(pipeline, &format!("Pipeline::{}", desc.name));
        Ok(self.pipelines.insert((desc.name.clone(), pipeline)))
    }

    fn create_display(&mut self, queue: GfxQueueHandle, desc: &DisplayDesc) -> GfxResult<GfxDisplayHandle> {
        self.check_live()?;
        match self.queues.get(queue) {
            Some(q) if q.ty == CommandType::Direct => {}
            Some(_) => return Err(GfxError::InvalidArgument("display queue requires a direct queue".to_string())),
            None => return Err(GfxError::invalid_handle("queue")),
        }
        self.create_display_impl(queue, desc)
    }

    fn acquire_next_image(&mut self, display: GfxDisplayHandle) -> GfxResult<usize> {
        self.check_live()?;
        self.acquire_next_image_impl(display)
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
        self.resize_display_impl(display, buffer_count, extent)
    }

    fn set_fullscreen(&mut self, display: GfxDisplayHandle, fullscreen: bool) -> GfxResult<()> {
        let display = self.displays.get_mut(display).ok_or(GfxError::invalid_handle("display"))?;
        // 窗口本身的全屏切换由窗口线程完成，这里只记录状态
        display.fullscreen = fullscreen;
        Ok(())
    }

    fn fullscreen_state(&self, display: GfxDisplayHandle) -> GfxResult<bool> {
        self.displays.get(display).map(|d| d.fullscreen).ok_or(GfxError::invalid_handle("display"))
    }

    fn present(&mut self, display: GfxDisplayHandle, allow_tearing: bool) -> GfxResult<()> {
        self.check_live()?;
        self.present_impl(display, allow_tearing)
    }

    fn destroy(&mut self, object: GfxObject) {
        match object {
            GfxObject::Queue(h) => {
                self.queues.remove(h);
            }
            GfxObject::Fence(h) => {
                if let Some(fence) = self.fences.remove(h) {
                    unsafe { self.device.destroy_semaphore(fence.semaphore, None) };
                }
            }
            GfxObject::CommandMemory(h) => {
                // pool 中分配的 command buffer 一并释放
                if let Some(memory) = self.memories.remove(h) {
                    for list in self.lists.values_mut().filter(|l| l.memory == h) {
                        list.buffer = vk::CommandBuffer::null();
                        list.recording = false;
                    }
                    unsafe { self.device.destroy_command_pool(memory.pool, None) };
                }
            }
            GfxObject::CommandList(h) => {
                self.lists.remove(h);
            }
            GfxObject::Heap(h) => {
                if let Some(heap) = self.heaps.remove(h) {
                    unsafe {
                        for view in heap.image_views() {
                            self.device.destroy_image_view(view, None);
                        }
                        if heap.pool != vk::DescriptorPool::null() {
                            self.device.destroy_descriptor_pool(heap.pool, None);
                        }
                    }
                }
            }
            GfxObject::Pipeline(h) => {
                if let Some((_, pipeline)) = self.pipelines.remove(h) {
                    unsafe { self.device.destroy_pipeline(pipeline, None) };
                }
            }
            GfxObject::Resource(h) => {
                if self.resources.get(h).is_some_and(|r| r.display_owned) {
                    log::error!("back buffers are owned by the display queue and cannot be destroyed directly");
                } else {
                    self.release_resource(h);
                }
            }
            GfxObject::Display(h) => {
                if let Some(display) = self.displays.remove(h) {
                    self.destroy_display_impl(display);
                }
            }
        }
    }

    fn report_fault_info(&self) {
        match &self.removed {
            Some(reason) => log::error!("device {} fault: lost ({})", self.info.name, reason),
            None => log::warn!("device {} fault reported, device still alive", self.info.name),
        }
        if self.flags.contains(DeviceFlags::EXTENDED_INFO) {
            log::error!(
                "live objects at fault: {} queues, {} fences, {} command memories, {} lists, {} heaps, {} resources, {} pipelines, {} displays",
                self.queues.len(),
                self.fences.len(),
                self.memories.len(),
                self.lists.len(),
                self.heaps.len(),
                self.resources.len(),
                self.pipelines.len(),
                self.displays.len()
            );
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
