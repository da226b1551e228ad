//! 显示队列在 Vulkan 上的实现
//!
//! - 窗口目标：`VkSwapchainKHR`，acquire 得到的图像下标即为当前帧
//! - headless 目标：一组离屏纹理，每次 present 之后轮转到下一张

use ash::vk;
use itertools::Itertools;

use crate::basic::extent::Extent2D;
use crate::basic::resource_state::ResourceState;
use crate::gfx_error::{GfxError, GfxResult};
use crate::handles::{GfxDisplayHandle, GfxQueueHandle, GfxResourceHandle};
use crate::resources::texture::{TextureDesc, TextureUsage};
use crate::swapchain::display_queue::{DisplayDesc, DisplayTarget};
use crate::vulkan::convert::{extent, pixel_format, vk_error};
use crate::vulkan::device::VulkanDevice;

const MAX_BACK_BUFFERS: u32 = 16;
/// acquire 的超时时间，纳秒
const ACQUIRE_TIMEOUT_NS: u64 = 1_000_000_000;

pub(crate) struct SwapchainState {
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    /// 每次 acquire 轮流使用，数量比图像多一个
    acquire_semaphores: Vec<vk::Semaphore>,
    acquire_cursor: usize,
    /// 每张图像一个，渲染完成之后 present 等待它
    present_semaphores: Vec<vk::Semaphore>,
}

pub(crate) enum DisplaySurface {
    Offscreen,
    Swapchain(SwapchainState),
}

pub(crate) struct VkDisplay {
    pub(crate) queue: GfxQueueHandle,
    pub(crate) desc: DisplayDesc,
    pub(crate) buffers: Vec<GfxResourceHandle>,
    pub(crate) frame_index: usize,
    pub(crate) fullscreen: bool,
    pub(crate) surface: DisplaySurface,
}

// tools
impl VulkanDevice {
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

    /// 确定交换链的尺寸
    ///
    /// 如果 current_extent 包含特殊值 0xFFFFFFFF，则表示可以自己设置交换链的 extent
    fn calculate_swapchain_extent(caps: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
        let surface_extent = caps.current_extent;
        if surface_extent.width == 0xFFFFFFFF || surface_extent.height == 0xFFFFFFFF {
            vk::Extent2D {
                width: window_extent.width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: window_extent.height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        } else {
            surface_extent
        }
    }

    /// max_image_count == 0 表示不限制数量
    fn clamp_image_count(caps: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
        let count = requested.max(caps.min_image_count);
        if caps.max_image_count == 0 { count } else { count.min(caps.max_image_count) }
    }

    fn create_binary_semaphores(&self, count: usize, name: &str) -> GfxResult<Vec<vk::Semaphore>> {
        let mut semaphores = Vec::with_capacity(count);
        for i in 0..count {
            match unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) } {
                Ok(semaphore) => {
                    self.set_debug_name(semaphore, &format!("Semaphore::{}-{}", name, i));
                    semaphores.push(semaphore);
                }
                Err(e) => {
                    self.destroy_semaphores(&semaphores);
                    return Err(vk_error(e, "vkCreateSemaphore"));
                }
            }
        }
        Ok(semaphores)
    }

    fn destroy_semaphores(&self, semaphores: &[vk::Semaphore]) {
        for semaphore in semaphores {
            unsafe { self.device.destroy_semaphore(*semaphore, None) };
        }
    }

    fn create_offscreen_buffers(&mut self, desc: &DisplayDesc) -> GfxResult<Vec<GfxResourceHandle>> {
        let mut buffers = Vec::with_capacity(desc.buffer_count as usize);
        for i in 0..desc.buffer_count {
            let texture =
                TextureDesc::new(format!("back-buffer-{}", i), desc.extent, desc.format, TextureUsage::RENDER_TARGET)
                    .with_initial_state(ResourceState::Present);
            match self.allocate_texture(&texture, vk::ImageLayout::GENERAL, true) {
                Ok(handle) => buffers.push(handle),
                Err(e) => {
                    for buffer in buffers {
                        self.release_resource(buffer);
                    }
                    return Err(e);
                }
            }
        }
        Ok(buffers)
    }

    /// 创建交换链并登记它的图像，返回交换链与 back buffer
    fn create_swapchain(
        &mut self,
        surface: vk::SurfaceKHR,
        desc: &DisplayDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> GfxResult<(vk::SwapchainKHR, Vec<GfxResourceHandle>)> {
        let (Some(surface_loader), Some(swapchain_loader)) = (&self.core.surface, &self.swapchain_loader) else {
            return Err(GfxError::Unsupported(
                "window displays require an instance created with a display handle".to_string(),
            ));
        };

        let caps = unsafe { surface_loader.get_physical_device_surface_capabilities(self.physical_device, surface) }
            .map_err(|e| vk_error(e, "vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(self.physical_device, surface) }
            .map_err(|e| vk_error(e, "vkGetPhysicalDeviceSurfaceFormatsKHR"))?;
        let wanted = pixel_format(desc.format);
        let Some(surface_format) = formats
            .iter()
            .find(|f| f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .copied()
        else {
            return Err(GfxError::Unsupported(format!(
                "surface does not support {:?}, available: {}",
                desc.format,
                formats.iter().map(|f| format!("{:?}", f.format)).join(", ")
            )));
        };

        let swapchain_extent = Self::calculate_swapchain_extent(&caps, extent(desc.extent));
        let image_count = Self::clamp_image_count(&caps, desc.buffer_count);
        if image_count != desc.buffer_count {
            log::warn!("surface requires {} back buffers, {} requested", image_count, desc.buffer_count);
        }
        log::info!(
            "create swapchain:
            surface current extent: {}x{}, min extent: {}x{}, max extent: {}x{}
            requested extent: {}
            final swapchain extent: {}x{}, images: {}",
            caps.current_extent.width,
            caps.current_extent.height,
            caps.min_image_extent.width,
            caps.min_image_extent.height,
            caps.max_image_extent.width,
            caps.max_image_extent.height,
            desc.extent,
            swapchain_extent.width,
            swapchain_extent.height,
            image_count
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(swapchain_extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            // FIFO 总是可用；tearing 由驱动的 present mode 决定，这里不切换
            .present_mode(vk::PresentModeKHR::FIFO)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| vk_error(e, "vkCreateSwapchainKHR"))?;
        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(vk_error(e, "vkGetSwapchainImagesKHR"));
            }
        };
        self.set_debug_name(swapchain, "Swapchain::main");

        let back_buffer_extent = Extent2D::new(swapchain_extent.width, swapchain_extent.height);
        let buffers = images
            .into_iter()
            .enumerate()
            .map(|(i, image)| {
                let texture = TextureDesc::new(
                    format!("back-buffer-{}", i),
                    back_buffer_extent,
                    desc.format,
                    TextureUsage::RENDER_TARGET,
                )
                .with_initial_state(ResourceState::Present);
                self.set_debug_name(image, &format!("Image::{}", texture.name));
                self.register_external_texture(texture, image, vk::ImageLayout::PRESENT_SRC_KHR)
            })
            .collect_vec();

        Ok((swapchain, buffers))
    }

    fn create_swapchain_state(
        &mut self,
        surface: vk::SurfaceKHR,
        desc: &DisplayDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> GfxResult<(SwapchainState, Vec<GfxResourceHandle>)> {
        let (swapchain, buffers) = self.create_swapchain(surface, desc, old_swapchain)?;
        let semaphores = self
            .create_binary_semaphores(buffers.len() + 1, "acquire")
            .and_then(|acquire| match self.create_binary_semaphores(buffers.len(), "present") {
                Ok(present) => Ok((acquire, present)),
                Err(e) => {
                    self.destroy_semaphores(&acquire);
                    Err(e)
                }
            });
        let (acquire_semaphores, present_semaphores) = match semaphores {
            Ok(semaphores) => semaphores,
            Err(e) => {
                for buffer in buffers {
                    self.release_resource(buffer);
                }
                if let Some(loader) = &self.swapchain_loader {
                    unsafe { loader.destroy_swapchain(swapchain, None) };
                }
                return Err(e);
            }
        };

        Ok((
            SwapchainState {
                surface,
                swapchain,
                acquire_semaphores,
                acquire_cursor: 0,
                present_semaphores,
            },
            buffers,
        ))
    }

    fn destroy_swapchain_state(&self, state: &SwapchainState, destroy_surface: bool) {
        self.destroy_semaphores(&state.acquire_semaphores);
        self.destroy_semaphores(&state.present_semaphores);
        if let Some(loader) = &self.swapchain_loader {
            unsafe { loader.destroy_swapchain(state.swapchain, None) };
        }
        if destroy_surface {
            if let Some(surface_loader) = &self.core.surface {
                unsafe { surface_loader.destroy_surface(state.surface, None) };
            }
        }
    }

    /// 交换链上还没有被提交消费的 semaphore 必须丢弃
    fn clear_pending_semaphores(&mut self, queue: GfxQueueHandle) {
        if let Some(queue) = self.queues.get_mut(queue) {
            queue.pending_waits.clear();
            queue.pending_signals.clear();
        }
    }
}

// display
impl VulkanDevice {
    pub(crate) fn create_display_impl(
        &mut self,
        queue: GfxQueueHandle,
        desc: &DisplayDesc,
    ) -> GfxResult<GfxDisplayHandle> {
        let _span = tracy_client::span!("VulkanDevice::create_display");
        Self::validate_display_desc(desc.buffer_count, desc.extent)?;

        let (surface, buffers) = match desc.target {
            DisplayTarget::Headless => (DisplaySurface::Offscreen, self.create_offscreen_buffers(desc)?),
            DisplayTarget::Window { display, window } => {
                let Some(surface_loader) = &self.core.surface else {
                    return Err(GfxError::Unsupported(
                        "window displays require an instance created with a display handle".to_string(),
                    ));
                };
                let surface = unsafe {
                    ash_window::create_surface(&self.core.entry, &self.core.instance, display.raw(), window.raw(), None)
                }
                .map_err(|e| vk_error(e, "ash_window::create_surface"))?;

                let supported = unsafe {
                    surface_loader.get_physical_device_surface_support(self.physical_device, self.queue_family, surface)
                }
                .unwrap_or(false);
                if !supported {
                    unsafe { surface_loader.destroy_surface(surface, None) };
                    return Err(GfxError::Unsupported("queue family cannot present to this surface".to_string()));
                }

                match self.create_swapchain_state(surface, desc, vk::SwapchainKHR::null()) {
                    Ok((state, buffers)) => (DisplaySurface::Swapchain(state), buffers),
                    Err(e) => {
                        if let Some(surface_loader) = &self.core.surface {
                            unsafe { surface_loader.destroy_surface(surface, None) };
                        }
                        return Err(e);
                    }
                }
            }
        };

        Ok(self.displays.insert(VkDisplay {
            queue,
            desc: desc.clone(),
            buffers,
            frame_index: 0,
            fullscreen: false,
            surface,
        }))
    }

    pub(crate) fn acquire_next_image_impl(&mut self, display: GfxDisplayHandle) -> GfxResult<usize> {
        let _span = tracy_client::span!("VulkanDevice::acquire_next_image");

        let display_entry = self.displays.get_mut(display).ok_or(GfxError::invalid_handle("display"))?;
        let queue = display_entry.queue;
        let state = match &mut display_entry.surface {
            DisplaySurface::Swapchain(state) => state,
            DisplaySurface::Offscreen => return Ok(display_entry.frame_index),
        };
        let Some(loader) = &self.swapchain_loader else {
            return Err(GfxError::Unsupported("swapchain extension is not enabled".to_string()));
        };

        let acquire_semaphore = state.acquire_semaphores[state.acquire_cursor];
        let result =
            unsafe { loader.acquire_next_image(state.swapchain, ACQUIRE_TIMEOUT_NS, acquire_semaphore, vk::Fence::null()) };
        let image_index = match result {
            Ok((image_index, suboptimal)) => {
                if suboptimal {
                    log::warn!("swapchain acquire image index {} is not optimal", image_index);
                }
                image_index as usize
            }
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                return Err(GfxError::Surface("timed out acquiring a swapchain image".to_string()));
            }
            Err(e) => {
                log::warn!("failed to acquire next swapchain image: {:?}", e);
                let error = vk_error(e, "vkAcquireNextImageKHR");
                return Err(self.on_error(error));
            }
        };

        state.acquire_cursor = (state.acquire_cursor + 1) % state.acquire_semaphores.len();
        let present_semaphore = state.present_semaphores[image_index];
        display_entry.frame_index = image_index;

        // 下一次提交等待图像可用，并在完成时通知 present
        if let Some(queue) = self.queues.get_mut(queue) {
            queue.pending_waits.push(acquire_semaphore);
            queue.pending_signals.push(present_semaphore);
        }
        Ok(image_index)
    }

    pub(crate) fn present_impl(&mut self, display: GfxDisplayHandle, allow_tearing: bool) -> GfxResult<()> {
        let _span = tracy_client::span!("VulkanDevice::present");

        let (frame_index, buffer, queue) = {
            let display = self.displays.get(display).ok_or(GfxError::invalid_handle("display"))?;
            (display.frame_index, display.buffers[display.frame_index], display.queue)
        };
        self.expect_state(buffer, ResourceState::Present, "present source")?;
        if allow_tearing {
            log::trace!("tearing is not switchable on the vulkan backend, presenting with FIFO");
        }

        let vk_queue = self.queues.get(queue).ok_or(GfxError::invalid_handle("queue"))?.queue;
        let display_entry = &mut self.displays[display];
        let state = match &display_entry.surface {
            DisplaySurface::Swapchain(state) => state,
            DisplaySurface::Offscreen => {
                display_entry.frame_index = (frame_index + 1) % display_entry.buffers.len();
                return Ok(());
            }
        };
        let Some(loader) = &self.swapchain_loader else {
            return Err(GfxError::Unsupported("swapchain extension is not enabled".to_string()));
        };

        let image_indices = [frame_index as u32];
        let wait_semaphores = [state.present_semaphores[frame_index]];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .image_indices(&image_indices)
            .swapchains(std::slice::from_ref(&state.swapchain));

        match unsafe { loader.queue_present(vk_queue, &present_info) } {
            Ok(suboptimal) => {
                if suboptimal {
                    log::warn!("swapchain present image index {} is not optimal", frame_index);
                }
                Ok(())
            }
            Err(e) => {
                log::warn!("failed to present swapchain image: {:?}", e);
                let error = vk_error(e, "vkQueuePresentKHR");
                Err(self.on_error(error))
            }
        }
    }

    pub(crate) fn resize_display_impl(
        &mut self,
        display: GfxDisplayHandle,
        buffer_count: u32,
        extent: Extent2D,
    ) -> GfxResult<()> {
        let _span = tracy_client::span!("VulkanDevice::resize_display");
        Self::validate_display_desc(buffer_count, extent)?;

        // 旧的 back buffer 可能还在被 GPU 使用
        unsafe { self.device.device_wait_idle() }.map_err(|e| vk_error(e, "vkDeviceWaitIdle"))?;

        let (queue, old_buffers, mut desc) = {
            let display = self.displays.get_mut(display).ok_or(GfxError::invalid_handle("display"))?;
            display.frame_index = 0;
            (display.queue, std::mem::take(&mut display.buffers), display.desc.clone())
        };
        desc.buffer_count = buffer_count;
        desc.extent = extent;
        self.clear_pending_semaphores(queue);
        for buffer in old_buffers {
            self.release_resource(buffer);
        }

        let old_surface = std::mem::replace(&mut self.displays[display].surface, DisplaySurface::Offscreen);
        let (surface, buffers) = match old_surface {
            DisplaySurface::Offscreen => (DisplaySurface::Offscreen, self.create_offscreen_buffers(&desc)?),
            DisplaySurface::Swapchain(old_state) => {
                let created = self.create_swapchain_state(old_state.surface, &desc, old_state.swapchain);
                // 旧交换链在新交换链创建之后才能销毁，surface 继续复用
                self.destroy_swapchain_state(&old_state, created.is_err());
                let (state, buffers) = created?;
                (DisplaySurface::Swapchain(state), buffers)
            }
        };

        let display = &mut self.displays[display];
        display.desc = desc;
        display.buffers = buffers;
        display.surface = surface;
        Ok(())
    }

    pub(crate) fn destroy_display_impl(&mut self, display: VkDisplay) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::warn!("device wait idle failed while destroying display: {:?}", e);
        }
        self.clear_pending_semaphores(display.queue);
        for buffer in display.buffers {
            self.release_resource(buffer);
        }
        if let DisplaySurface::Swapchain(state) = &display.surface {
            self.destroy_swapchain_state(state, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: vk::Extent2D, min_images: u32, max_images: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            min_image_count: min_images,
            max_image_count: max_images,
            ..Default::default()
        }
    }

    #[test]
    fn test_swapchain_extent_follows_window_when_undefined() {
        let caps = caps(
            vk::Extent2D {
                width: 0xFFFFFFFF,
                height: 0xFFFFFFFF,
            },
            2,
            3,
        );
        let extent = VulkanDevice::calculate_swapchain_extent(
            &caps,
            vk::Extent2D {
                width: 8000,
                height: 600,
            },
        );
        assert_eq!(extent.width, 4096);
        assert_eq!(extent.height, 600);
    }

    #[test]
    fn test_swapchain_extent_uses_surface_extent() {
        let current = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let extent = VulkanDevice::calculate_swapchain_extent(&caps(current, 2, 3), vk::Extent2D { width: 1, height: 1 });
        assert_eq!(extent, current);
    }

    #[test]
    fn test_image_count_is_clamped() {
        assert_eq!(VulkanDevice::clamp_image_count(&caps(vk::Extent2D::default(), 2, 3), 1), 2);
        assert_eq!(VulkanDevice::clamp_image_count(&caps(vk::Extent2D::default(), 2, 3), 8), 3);
        // 0 表示没有上限
        assert_eq!(VulkanDevice::clamp_image_count(&caps(vk::Extent2D::default(), 2, 0), 8), 8);
    }

    #[test]
    fn test_display_desc_validation() {
        assert!(VulkanDevice::validate_display_desc(0, Extent2D::new(4, 4)).is_err());
        assert!(VulkanDevice::validate_display_desc(17, Extent2D::new(4, 4)).is_err());
        assert!(VulkanDevice::validate_display_desc(3, Extent2D::new(0, 4)).is_err());
        assert!(VulkanDevice::validate_display_desc(3, Extent2D::new(4, 4)).is_ok());
    }
}
