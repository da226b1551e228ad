use crate::basic::format::{PixelFormat, VertexFormat};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub name: &'static str,
    pub format: VertexFormat,
    pub offset: u32,
}

/// 图形管线的创建描述
///
/// shader 以二进制 blob 的形式提供（由 asset depot 加载）。
/// shader 通过 `shader_inputs` 个 32 位常量获得描述符下标。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphicsPipelineDesc {
    pub name: String,
    pub vertex_shader: Vec<u8>,
    pub pixel_shader: Vec<u8>,
    pub attributes: Vec<VertexAttribute>,
    pub vertex_stride: u32,
    pub shader_inputs: u32,
    pub color_format: PixelFormat,
    pub depth_format: Option<PixelFormat>,
}

impl GraphicsPipelineDesc {
    pub const MAX_SHADER_INPUTS: u32 = 16;
}
