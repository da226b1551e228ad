//! 把 [`GfxCommand`] 翻译为 Vulkan 命令
//!
//! 录制时跟踪每个资源的状态，规则与 headless 后端相同：
//! transition 的前置状态必须等于当前状态，render target / depth 必须处于对应状态。

use std::ffi::CString;

use ash::vk;

use crate::basic::extent::Extent2D;
use crate::basic::resource_state::ResourceState;
use crate::commands::command::{GfxCommand, Transition};
use crate::gfx_error::{GfxError, GfxResult};
use crate::handles::{GfxCommandListHandle, GfxResourceHandle};
use crate::resources::buffer::BufferUsage;
use crate::resources::heap::{HeapKind, HostDescriptor};
use crate::resources::pipeline::GraphicsPipelineDesc;
use crate::vulkan::convert::{aspect_mask, extent, index_type, scissor, state_access, viewport};
use crate::vulkan::device::{VkResourceKind, VulkanDevice};

/// 当前打开的 dynamic rendering
#[derive(Clone, Copy, Debug)]
pub(crate) struct ActiveRendering {
    pub(crate) rtv: HostDescriptor,
    pub(crate) dsv: Option<HostDescriptor>,
    pub(crate) extent: Extent2D,
}

/// 命令列表的录制状态
#[derive(Default, Debug)]
pub(crate) struct RecordState {
    /// 设置 render target 时开启，遇到拷贝、transition 或结束录制时关闭
    pub(crate) rendering: Option<ActiveRendering>,
}

// tools
impl VulkanDevice {
    /// 关闭当前的 dynamic rendering（如果有）
    pub(crate) fn end_rendering(&mut self, list: GfxCommandListHandle) {
        let Some(list) = self.lists.get_mut(list) else {
            return;
        };
        if list.state.rendering.take().is_some() {
            unsafe { self.device.cmd_end_rendering(list.buffer) };
        }
    }

    /// 把带有初始状态的新纹理从 UNDEFINED 转换到对应的 layout
    pub(crate) fn record_pending_init(&mut self, buffer: vk::CommandBuffer) {
        let pending = std::mem::take(&mut self.pending_init);
        let barriers = pending
            .into_iter()
            .filter_map(|handle| {
                let resource = self.resources.get_mut(handle)?;
                let VkResourceKind::Texture {
                    desc,
                    image,
                    present_layout,
                    initialized,
                    ..
                } = &mut resource.kind
                else {
                    return None;
                };
                *initialized = true;
                let dst = state_access(resource.state, *present_layout);
                Some(
                    vk::ImageMemoryBarrier2::default()
                        .image(*image)
                        .subresource_range(full_range(aspect_mask(desc.format)))
                        .src_stage_mask(vk::PipelineStageFlags2::NONE)
                        .src_access_mask(vk::AccessFlags2::NONE)
                        .dst_stage_mask(dst.stage)
                        .dst_access_mask(dst.access)
                        .old_layout(vk::ImageLayout::UNDEFINED)
                        .new_layout(dst.layout),
                )
            })
            .collect::<Vec<_>>();
        if barriers.is_empty() {
            return;
        }

        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe { self.device.cmd_pipeline_barrier2(buffer, &dependency) };
    }

    fn record_transitions(&mut self, buffer: vk::CommandBuffer, transitions: &[Transition]) -> GfxResult<()> {
        let mut image_barriers = Vec::with_capacity(transitions.len());
        let mut buffer_barriers = Vec::new();

        for transition in transitions {
            let resource = self.resources.get_mut(transition.resource).ok_or(GfxError::invalid_handle("resource"))?;
            if resource.state != transition.before {
                return Err(GfxError::InvalidArgument(format!(
                    "transition of {} expects {} but resource is in {}",
                    resource.name(),
                    transition.before,
                    resource.state
                )));
            }
            resource.state = transition.after;

            match &mut resource.kind {
                VkResourceKind::Texture {
                    desc,
                    image,
                    present_layout,
                    initialized,
                    ..
                } => {
                    let src = state_access(transition.before, *present_layout);
                    let dst = state_access(transition.after, *present_layout);
                    // 第一次使用时内容未定义，可以丢弃
                    let old_layout = if *initialized { src.layout } else { vk::ImageLayout::UNDEFINED };
                    *initialized = true;
                    image_barriers.push(
                        vk::ImageMemoryBarrier2::default()
                            .image(*image)
                            .subresource_range(full_range(aspect_mask(desc.format)))
                            .src_stage_mask(src.stage)
                            .src_access_mask(src.access)
                            .dst_stage_mask(dst.stage)
                            .dst_access_mask(dst.access)
                            .old_layout(old_layout)
                            .new_layout(dst.layout),
                    );
                }
                VkResourceKind::Buffer { buffer, .. } => {
                    let src = state_access(transition.before, vk::ImageLayout::GENERAL);
                    let dst = state_access(transition.after, vk::ImageLayout::GENERAL);
                    buffer_barriers.push(
                        vk::BufferMemoryBarrier2::default()
                            .buffer(*buffer)
                            .offset(0)
                            .size(vk::WHOLE_SIZE)
                            .src_stage_mask(src.stage)
                            .src_access_mask(src.access)
                            .dst_stage_mask(dst.stage)
                            .dst_access_mask(dst.access),
                    );
                }
            }
        }

        let dependency = vk::DependencyInfo::default()
            .image_memory_barriers(&image_barriers)
            .buffer_memory_barriers(&buffer_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(buffer, &dependency) };
        Ok(())
    }

    fn texture_extent(&self, resource: GfxResourceHandle) -> GfxResult<Extent2D> {
        match self.resources.get(resource).map(|r| &r.kind) {
            Some(VkResourceKind::Texture { desc, .. }) => Ok(desc.extent),
            Some(_) => Err(GfxError::InvalidArgument("expected a texture".to_string())),
            None => Err(GfxError::invalid_handle("texture")),
        }
    }

    fn begin_rendering(
        &mut self,
        list: GfxCommandListHandle,
        rtv: HostDescriptor,
        dsv: Option<HostDescriptor>,
    ) -> GfxResult<()> {
        let color = self.mapped_view(rtv, HeapKind::RenderTarget)?;
        self.expect_state(color.resource, ResourceState::RenderTarget, "render target")?;
        let depth = match dsv {
            Some(dsv) => {
                let depth = self.mapped_view(dsv, HeapKind::DepthStencil)?;
                self.expect_state(depth.resource, ResourceState::DepthWrite, "depth stencil")?;
                Some(depth)
            }
            None => None,
        };
        let target_extent = self.texture_extent(color.resource)?;

        self.end_rendering(list);
        let buffer = self.lists[list].buffer;

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(color.image_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE);
        let depth_attachment = depth.map(|depth| {
            vk::RenderingAttachmentInfo::default()
                .image_view(depth.image_view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: extent(target_extent),
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));
        if let Some(depth_attachment) = &depth_attachment {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }
        unsafe { self.device.cmd_begin_rendering(buffer, &rendering_info) };

        self.lists[list].state.rendering = Some(ActiveRendering {
            rtv,
            dsv,
            extent: target_extent,
        });
        Ok(())
    }

    fn active_rendering(&self, list: GfxCommandListHandle, what: &str) -> GfxResult<ActiveRendering> {
        self.lists[list]
            .state
            .rendering
            .ok_or_else(|| GfxError::InvalidArgument(format!("{} requires a bound render target", what)))
    }

    /// 检查命令的合法性，并录制对应的 Vulkan 命令
    pub(crate) fn record_command(&mut self, list: GfxCommandListHandle, command: &GfxCommand) -> GfxResult<()> {
        let buffer = self.lists[list].buffer;

        match command {
            GfxCommand::Transition(transitions) => {
                self.end_rendering(list);
                self.record_transitions(buffer, transitions)?;
            }
            GfxCommand::SetShaderHeap(heap) => {
                let heap = self.heaps.get(*heap).ok_or(GfxError::invalid_handle("heap"))?;
                if !heap.desc.kind.shader_visible() {
                    return Err(GfxError::InvalidArgument(format!("{} heap is not shader visible", heap.desc.name)));
                }
                unsafe {
                    self.device.cmd_bind_descriptor_sets(
                        buffer,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.bindless.pipeline_layout,
                        0,
                        std::slice::from_ref(&heap.set),
                        &[],
                    )
                };
            }
            GfxCommand::SetPipeline(pipeline) => {
                let (_, pipeline) = self.pipelines.get(*pipeline).ok_or(GfxError::invalid_handle("pipeline"))?;
                unsafe { self.device.cmd_bind_pipeline(buffer, vk::PipelineBindPoint::GRAPHICS, *pipeline) };
            }
            GfxCommand::SetDisplay {
                viewport: vp,
                scissor: rect,
            } => unsafe {
                self.device.cmd_set_viewport(buffer, 0, &[viewport(vp)]);
                self.device.cmd_set_scissor(buffer, 0, &[scissor(rect)]);
            },
            GfxCommand::SetShaderInput { slot, descriptor } => {
                if *slot >= GraphicsPipelineDesc::MAX_SHADER_INPUTS {
                    return Err(GfxError::InvalidArgument(format!("shader input slot {} out of range", slot)));
                }
                // shader 中以下标访问 bindless 数组
                let index = self.heaps.values().find_map(|heap| heap.layout.device_index(*descriptor)).ok_or_else(|| {
                    GfxError::InvalidArgument(format!("device descriptor {:#x} does not belong to any heap", descriptor.0))
                })?;
                let index = index as u32;
                unsafe {
                    self.device.cmd_push_constants(
                        buffer,
                        self.bindless.pipeline_layout,
                        vk::ShaderStageFlags::ALL_GRAPHICS,
                        slot * size_of::<u32>() as u32,
                        &index.to_ne_bytes(),
                    )
                };
            }
            GfxCommand::SetRenderTarget { rtv, dsv } => {
                self.begin_rendering(list, *rtv, *dsv)?;
            }
            GfxCommand::ClearRenderTarget { rtv, color } => {
                let target = self.mapped_view(*rtv, HeapKind::RenderTarget)?;
                self.expect_state(target.resource, ResourceState::RenderTarget, "clear target")?;
                let rendering = self.active_rendering(list, "clearing a render target")?;
                if rendering.rtv != *rtv {
                    return Err(GfxError::InvalidArgument(
                        "clearing a render target that is not bound".to_string(),
                    ));
                }
                let attachment = vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    color_attachment: 0,
                    clear_value: vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: color.to_array(),
                        },
                    },
                };
                let rect = clear_rect(rendering.extent);
                unsafe { self.device.cmd_clear_attachments(buffer, &[attachment], &[rect]) };
            }
            GfxCommand::ClearDepthStencil { dsv, depth, stencil } => {
                let target = self.mapped_view(*dsv, HeapKind::DepthStencil)?;
                self.expect_state(target.resource, ResourceState::DepthWrite, "clear depth")?;
                let rendering = self.active_rendering(list, "clearing a depth target")?;
                if rendering.dsv != Some(*dsv) {
                    return Err(GfxError::InvalidArgument("clearing a depth target that is not bound".to_string()));
                }
                let attachment = vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::DEPTH,
                    color_attachment: 0,
                    clear_value: vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: *depth,
                            stencil: *stencil as u32,
                        },
                    },
                };
                let rect = clear_rect(rendering.extent);
                unsafe { self.device.cmd_clear_attachments(buffer, &[attachment], &[rect]) };
            }
            GfxCommand::SetVertexBuffer { buffer: vertex_buffer, .. } => {
                // stride 已经写在管线中
                let (vertex_buffer, _) = self.expect_buffer(*vertex_buffer, BufferUsage::VERTEX)?;
                unsafe { self.device.cmd_bind_vertex_buffers(buffer, 0, &[vertex_buffer], &[0]) };
            }
            GfxCommand::SetIndexBuffer {
                buffer: index_buffer,
                format,
            } => {
                let (index_buffer, _) = self.expect_buffer(*index_buffer, BufferUsage::INDEX)?;
                unsafe { self.device.cmd_bind_index_buffer(buffer, index_buffer, 0, index_type(*format)) };
            }
            GfxCommand::Draw {
                vertex_count,
                instance_count,
            } => {
                self.active_rendering(list, "draw")?;
                unsafe { self.device.cmd_draw(buffer, *vertex_count, *instance_count, 0, 0) };
            }
            GfxCommand::DrawIndexed {
                index_count,
                instance_count,
            } => {
                self.active_rendering(list, "indexed draw")?;
                unsafe { self.device.cmd_draw_indexed(buffer, *index_count, *instance_count, 0, 0, 0) };
            }
            GfxCommand::CopyBuffer { dst, src, size } => {
                let (dst_buffer, dst_size) = self.expect_buffer(*dst, BufferUsage::COPY_DST)?;
                let (src_buffer, src_size) = self.expect_buffer(*src, BufferUsage::COPY_SRC)?;
                if *size > dst_size || *size > src_size {
                    return Err(GfxError::InvalidArgument(format!(
                        "copy of {} bytes exceeds buffer sizes (src {}, dst {})",
                        size, src_size, dst_size
                    )));
                }
                self.end_rendering(list);
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: *size,
                };
                unsafe { self.device.cmd_copy_buffer(buffer, src_buffer, dst_buffer, &[region]) };
            }
            GfxCommand::CopyTexture { dst, src } => {
                let (src_buffer, src_size) = self.expect_buffer(*src, BufferUsage::COPY_SRC)?;
                let (image, desc) = match self.resources.get(*dst).map(|r| &r.kind) {
                    Some(VkResourceKind::Texture { image, desc, .. }) => (*image, desc),
                    Some(_) => return Err(GfxError::InvalidArgument("copy destination is not a texture".to_string())),
                    None => return Err(GfxError::invalid_handle("texture")),
                };
                if src_size < desc.byte_size() {
                    return Err(GfxError::InvalidArgument(format!(
                        "staging buffer holds {} bytes, texture needs {}",
                        src_size,
                        desc.byte_size()
                    )));
                }
                let region = vk::BufferImageCopy {
                    buffer_offset: 0,
                    // 0 表示紧密排列
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: aspect_mask(desc.format),
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width: desc.extent.width,
                        height: desc.extent.height,
                        depth: 1,
                    },
                };
                self.expect_state(*dst, ResourceState::CopyDest, "copy destination")?;
                self.end_rendering(list);
                unsafe {
                    self.device.cmd_copy_buffer_to_image(
                        buffer,
                        src_buffer,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
            }
            GfxCommand::BeginEvent(name) => {
                if let (Some(debug_utils), Ok(name)) = (&self.debug_utils, CString::new(name.as_str())) {
                    let label = vk::DebugUtilsLabelEXT::default().label_name(&name);
                    unsafe { debug_utils.cmd_begin_debug_utils_label(buffer, &label) };
                }
            }
            GfxCommand::EndEvent => {
                if let Some(debug_utils) = &self.debug_utils {
                    unsafe { debug_utils.cmd_end_debug_utils_label(buffer) };
                }
            }
        }
        Ok(())
    }
}

fn full_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn clear_rect(target: Extent2D) -> vk::ClearRect {
    vk::ClearRect {
        rect: vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: extent(target),
        },
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_rect_covers_target() {
        let rect = clear_rect(Extent2D::new(640, 480));
        assert_eq!(rect.rect.extent.width, 640);
        assert_eq!(rect.rect.extent.height, 480);
        assert_eq!(rect.layer_count, 1);
    }

    #[test]
    fn test_record_state_starts_outside_rendering() {
        assert!(RecordState::default().rendering.is_none());
    }
}
