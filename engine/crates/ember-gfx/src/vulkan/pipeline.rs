use std::io::Cursor;

use ash::vk;
use itertools::Itertools;

use crate::gfx_error::{GfxError, GfxResult};
use crate::resources::pipeline::GraphicsPipelineDesc;
use crate::vulkan::convert::{pixel_format, vertex_format, vk_error};

/// 从 SPIR-V 创建 shader module
fn create_shader_module(device: &ash::Device, code: &[u8], name: &str) -> GfxResult<vk::ShaderModule> {
    let words = ash::util::read_spv(&mut Cursor::new(code))
        .map_err(|e| GfxError::InvalidArgument(format!("{} is not valid SPIR-V: {}", name, e)))?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
    unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| vk_error(e, "vkCreateShaderModule"))
}

/// 使用 dynamic rendering 的图形管线，viewport 与 scissor 为动态状态
pub(crate) fn create_graphics_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    desc: &GraphicsPipelineDesc,
) -> GfxResult<vk::Pipeline> {
    let _span = tracy_client::span!("create_graphics_pipeline");

    let vertex_module = create_shader_module(device, &desc.vertex_shader, &format!("{}.vs", desc.name))?;
    let pixel_module = match create_shader_module(device, &desc.pixel_shader, &format!("{}.ps", desc.name)) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_shader_module(vertex_module, None) };
            return Err(e);
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(pixel_module)
            .name(c"main"),
    ];

    // 没有顶点属性时（例如全屏三角形）不绑定顶点 buffer
    let bindings = if desc.attributes.is_empty() {
        vec![]
    } else {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: desc.vertex_stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    };
    let attributes = desc
        .attributes
        .iter()
        .enumerate()
        .map(|(location, attr)| vk::VertexInputAttributeDescription {
            location: location as u32,
            binding: 0,
            format: vertex_format(attr.format),
            offset: attr.offset,
        })
        .collect_vec();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::default().topology(vk::PrimitiveTopology::TRIANGLE_LIST);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample =
        vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_format.is_some())
        .depth_write_enable(desc.depth_format.is_some())
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
    let blend_attachment = vk::PipelineColorBlendAttachmentState::default().color_write_mask(vk::ColorComponentFlags::RGBA);
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(std::slice::from_ref(&blend_attachment));
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats = [pixel_format(desc.color_format)];
    let mut rendering_ci = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(desc.depth_format.map_or(vk::Format::UNDEFINED, pixel_format));

    let pipeline_ci = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_ci);

    let result = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&pipeline_ci), None)
    };

    // module 只在创建阶段需要
    unsafe {
        device.destroy_shader_module(pixel_module, None);
        device.destroy_shader_module(vertex_module, None);
    }

    match result {
        Ok(pipelines) => pipelines
            .into_iter()
            .next()
            .ok_or_else(|| GfxError::Backend(format!("no pipeline returned for {}", desc.name))),
        Err((pipelines, e)) => {
            for pipeline in pipelines.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                unsafe { device.destroy_pipeline(pipeline, None) };
            }
            Err(vk_error(e, "vkCreateGraphicsPipelines"))
        }
    }
}
