//! 描述符堆在 Vulkan 上的实现
//!
//! 所有 shader data 堆共用一个 bindless descriptor set layout：
//! - binding 0：combined image sampler，用于 `ShaderResource`
//! - binding 1：storage image，用于 `UnorderedAccess`
//! - binding 2：uniform buffer，用于 `Uniform`
//!
//! 三个 binding 使用同一个下标空间，shader 根据访问方式选择 binding。
//! pipeline layout 固定为这个 set 加上 `MAX_SHADER_INPUTS` 个 u32 的 push constant。

use ash::vk;

use crate::gfx_error::{GfxError, GfxResult};
use crate::handles::GfxResourceHandle;
use crate::resources::heap::{HeapDesc, HeapLayout, ViewKind};
use crate::resources::pipeline::GraphicsPipelineDesc;
use crate::vulkan::convert::vk_error;

/// 每个 binding 的描述符数量上限，shader data 堆的容量不能超过它
pub const BINDLESS_CAPACITY: u32 = 4096;

pub const SAMPLED_IMAGE_BINDING: u32 = 0;
pub const STORAGE_IMAGE_BINDING: u32 = 1;
pub const UNIFORM_BUFFER_BINDING: u32 = 2;

/// 堆中一个槽位映射的视图
#[derive(Clone, Copy, Debug)]
pub(crate) struct DescriptorSlot {
    pub(crate) resource: GfxResourceHandle,
    /// buffer 视图为 null
    pub(crate) image_view: vk::ImageView,
}

pub(crate) struct VkHeap {
    pub(crate) desc: HeapDesc,
    pub(crate) layout: HeapLayout,
    pub(crate) slots: Vec<Option<DescriptorSlot>>,
    /// 只有 shader 可见的堆才有 descriptor pool / set
    pub(crate) pool: vk::DescriptorPool,
    pub(crate) set: vk::DescriptorSet,
}

impl VkHeap {
    /// 清空所有引用 `resource` 的槽位，返回需要销毁的 image view
    pub(crate) fn release_resource(&mut self, resource: GfxResourceHandle) -> Vec<vk::ImageView> {
        self.slots
            .iter_mut()
            .filter(|slot| slot.is_some_and(|s| s.resource == resource))
            .filter_map(|slot| slot.take())
            .map(|slot| slot.image_view)
            .filter(|view| *view != vk::ImageView::null())
            .collect()
    }

    pub(crate) fn image_views(&self) -> impl Iterator<Item = vk::ImageView> + '_ {
        self.slots.iter().flatten().map(|slot| slot.image_view).filter(|view| *view != vk::ImageView::null())
    }
}

/// device 级别共享的 bindless 布局
pub(crate) struct BindlessLayout {
    pub(crate) set_layout: vk::DescriptorSetLayout,
    pub(crate) pipeline_layout: vk::PipelineLayout,
    /// binding 0 使用的线性采样器
    pub(crate) sampler: vk::Sampler,
}

// new & init
impl BindlessLayout {
    pub(crate) fn new(device: &ash::Device) -> GfxResult<Self> {
        let bindings = [
            (SAMPLED_IMAGE_BINDING, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            (STORAGE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE),
            (UNIFORM_BUFFER_BINDING, vk::DescriptorType::UNIFORM_BUFFER),
        ]
        .map(|(binding, ty)| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(BINDLESS_CAPACITY)
                .stage_flags(vk::ShaderStageFlags::ALL_GRAPHICS)
        });
        // 即使部分 descriptor 无效也可以绑定，并允许在绑定之后更新
        let binding_flags =
            [vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND; 3];
        let mut binding_flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let set_layout_ci = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut binding_flags_ci);

        let set_layout = unsafe { device.create_descriptor_set_layout(&set_layout_ci, None) }
            .map_err(|e| vk_error(e, "vkCreateDescriptorSetLayout"))?;

        let push_constant_range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::ALL_GRAPHICS,
            offset: 0,
            size: GraphicsPipelineDesc::MAX_SHADER_INPUTS * size_of::<u32>() as u32,
        };
        let pipeline_layout_ci = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&set_layout))
            .push_constant_ranges(std::slice::from_ref(&push_constant_range));
        let pipeline_layout = match unsafe { device.create_pipeline_layout(&pipeline_layout_ci, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(vk_error(e, "vkCreatePipelineLayout"));
            }
        };

        let sampler_ci = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = match unsafe { device.create_sampler(&sampler_ci, None) } {
            Ok(sampler) => sampler,
            Err(e) => {
                unsafe {
                    device.destroy_pipeline_layout(pipeline_layout, None);
                    device.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(vk_error(e, "vkCreateSampler"));
            }
        };

        Ok(Self {
            set_layout,
            pipeline_layout,
            sampler,
        })
    }

    /// 为一个 shader data 堆创建 descriptor pool 与 set
    pub(crate) fn create_set(
        &self,
        device: &ash::Device,
        desc: &HeapDesc,
    ) -> GfxResult<(vk::DescriptorPool, vk::DescriptorSet)> {
        if desc.capacity as u64 > BINDLESS_CAPACITY as u64 {
            return Err(GfxError::InvalidArgument(format!(
                "heap {} capacity {} exceeds bindless capacity {}",
                desc.name, desc.capacity, BINDLESS_CAPACITY
            )));
        }

        let pool_sizes = [
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::UNIFORM_BUFFER,
        ]
        .map(|ty| vk::DescriptorPoolSize {
            ty,
            descriptor_count: BINDLESS_CAPACITY,
        });
        let pool_ci = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_ci, None) }
            .map_err(|e| vk_error(e, "vkCreateDescriptorPool"))?;

        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(std::slice::from_ref(&self.set_layout));
        match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) if !sets.is_empty() => Ok((pool, sets[0])),
            Ok(_) => {
                unsafe { device.destroy_descriptor_pool(pool, None) };
                Err(GfxError::OutOfMemory("descriptor"))
            }
            Err(e) => {
                unsafe { device.destroy_descriptor_pool(pool, None) };
                Err(vk_error(e, "vkAllocateDescriptorSets"))
            }
        }
    }

    pub(crate) fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_sampler(self.sampler, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

// tools
impl BindlessLayout {
    /// `image_layout`：采样时图像所处的 layout
    pub(crate) fn write_image(
        &self,
        device: &ash::Device,
        set: vk::DescriptorSet,
        index: usize,
        view: ViewKind,
        image_view: vk::ImageView,
        image_layout: vk::ImageLayout,
    ) {
        let (binding, ty, sampler) = match view {
            ViewKind::UnorderedAccess => (STORAGE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE, vk::Sampler::null()),
            _ => (SAMPLED_IMAGE_BINDING, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, self.sampler),
        };
        let image_info = vk::DescriptorImageInfo {
            sampler,
            image_view,
            image_layout,
        };
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(index as u32)
            .descriptor_type(ty)
            .image_info(std::slice::from_ref(&image_info));
        unsafe { device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
    }

    pub(crate) fn write_uniform(&self, device: &ash::Device, set: vk::DescriptorSet, index: usize, buffer: vk::Buffer) {
        let buffer_info = vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        };
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(UNIFORM_BUFFER_BINDING)
            .dst_array_element(index as u32)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info));
        unsafe { device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
    }
}
