//! 抽象层类型到 Vulkan 类型的转换

use ash::vk;

use crate::basic::extent::{Extent2D, Scissor, Viewport};
use crate::basic::format::{IndexFormat, PixelFormat, VertexFormat};
use crate::basic::resource_state::ResourceState;
use crate::foundation::instance::AdapterKind;
use crate::gfx_error::GfxError;
use crate::resources::buffer::BufferUsage;
use crate::resources::texture::TextureUsage;

pub fn pixel_format(format: PixelFormat) -> vk::Format {
    match format {
        PixelFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        PixelFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        PixelFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        PixelFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        PixelFormat::R32Float => vk::Format::R32_SFLOAT,
        PixelFormat::Depth32Float => vk::Format::D32_SFLOAT,
    }
}

pub fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
    }
}

pub fn index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::Uint16 => vk::IndexType::UINT16,
        IndexFormat::Uint32 => vk::IndexType::UINT32,
    }
}

pub fn adapter_kind(ty: vk::PhysicalDeviceType) -> AdapterKind {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => AdapterKind::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterKind::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterKind::Virtual,
        vk::PhysicalDeviceType::CPU => AdapterKind::Software,
        _ => AdapterKind::Other,
    }
}

#[inline]
pub fn aspect_mask(format: PixelFormat) -> vk::ImageAspectFlags {
    if format.is_depth() { vk::ImageAspectFlags::DEPTH } else { vk::ImageAspectFlags::COLOR }
}

pub fn texture_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::RENDER_TARGET) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsage::DEPTH_STENCIL) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(TextureUsage::SHADER_READ) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    flags
}

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    flags
}

/// 资源状态在 synchronization2 中对应的访问范围
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateAccess {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

/// `present_layout`：交换链图像为 PRESENT_SRC_KHR，离屏 back buffer 为 GENERAL
pub fn state_access(state: ResourceState, present_layout: vk::ImageLayout) -> StateAccess {
    let (layout, stage, access) = match state {
        ResourceState::Common => (
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ),
        ResourceState::Present => (present_layout, vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
        ResourceState::RenderTarget => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        ResourceState::DepthWrite => (
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        ResourceState::DepthRead => (
            vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::SHADER_SAMPLED_READ,
        ),
        ResourceState::ShaderResource => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        ),
        ResourceState::UnorderedAccess => (
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
        ),
        ResourceState::Uniform => (
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::UNIFORM_READ,
        ),
        ResourceState::VertexBuffer => (
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        ),
        ResourceState::IndexBuffer => {
            (vk::ImageLayout::GENERAL, vk::PipelineStageFlags2::INDEX_INPUT, vk::AccessFlags2::INDEX_READ)
        }
        ResourceState::CopySource => {
            (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_READ)
        }
        ResourceState::CopyDest => {
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_WRITE)
        }
    };
    StateAccess { layout, stage, access }
}

#[inline]
pub fn extent(extent: Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: extent.width,
        height: extent.height,
    }
}

#[inline]
pub fn viewport(viewport: &Viewport) -> vk::Viewport {
    vk::Viewport {
        x: viewport.x,
        y: viewport.y,
        width: viewport.width,
        height: viewport.height,
        min_depth: viewport.min_depth,
        max_depth: viewport.max_depth,
    }
}

pub fn scissor(scissor: &Scissor) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D {
            x: scissor.left,
            y: scissor.top,
        },
        extent: vk::Extent2D {
            width: (scissor.right - scissor.left).max(0) as u32,
            height: (scissor.bottom - scissor.top).max(0) as u32,
        },
    }
}

/// `what` 描述出错的调用，写入错误信息
pub fn vk_error(result: vk::Result, what: &str) -> GfxError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => GfxError::DeviceRemoved(format!("{} returned {:?}", what, result)),
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => GfxError::OutOfMemory("host"),
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => GfxError::OutOfMemory("device"),
        vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => GfxError::OutOfMemory("descriptor"),
        vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR | vk::Result::SUBOPTIMAL_KHR => {
            GfxError::Surface(format!("{} returned {:?}", what, result))
        }
        vk::Result::ERROR_FEATURE_NOT_PRESENT
        | vk::Result::ERROR_EXTENSION_NOT_PRESENT
        | vk::Result::ERROR_LAYER_NOT_PRESENT
        | vk::Result::ERROR_INCOMPATIBLE_DRIVER => GfxError::Unsupported(format!("{} returned {:?}", what, result)),
        _ => GfxError::Backend(format!("{} returned {:?}", what, result)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_is_recoverable() {
        let error = vk_error(vk::Result::ERROR_DEVICE_LOST, "vkQueueSubmit2");
        assert!(matches!(error, GfxError::DeviceRemoved(_)));
        assert!(error.is_recoverable());
        assert!(!vk_error(vk::Result::ERROR_INITIALIZATION_FAILED, "vkCreateDevice").is_recoverable());
    }

    #[test]
    fn test_present_state_follows_image_kind() {
        let swapchain = state_access(ResourceState::Present, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(swapchain.layout, vk::ImageLayout::PRESENT_SRC_KHR);
        let offscreen = state_access(ResourceState::Present, vk::ImageLayout::GENERAL);
        assert_eq!(offscreen.layout, vk::ImageLayout::GENERAL);
        assert_eq!(
            state_access(ResourceState::RenderTarget, vk::ImageLayout::GENERAL).layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn test_scissor_clamps_inverted_rect() {
        let rect = scissor(&Scissor {
            left: 10,
            top: 4,
            right: 2,
            bottom: 8,
        });
        assert_eq!(rect.extent.width, 0);
        assert_eq!(rect.extent.height, 4);
    }
}
