use crate::basic::extent::Extent2D;
use crate::basic::format::PixelFormat;
use crate::basic::resource_state::ResourceState;

bitflags::bitflags! {
    /// 纹理的用途，决定了它可以映射到哪些描述符堆
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const RENDER_TARGET = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        const SHADER_READ = 1 << 2;
        const STORAGE = 1 << 3;
        const COPY_DST = 1 << 4;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextureDesc {
    pub name: String,
    pub extent: Extent2D,
    pub format: PixelFormat,
    pub usage: TextureUsage,
    /// 创建完成时资源所处的状态
    pub initial_state: ResourceState,
    /// 作为 render target / depth 时的优化清除值
    pub clear_color: Option<glam::Vec4>,
}

impl TextureDesc {
    pub fn new(name: impl Into<String>, extent: Extent2D, format: PixelFormat, usage: TextureUsage) -> Self {
        Self {
            name: name.into(),
            extent,
            format,
            usage,
            initial_state: ResourceState::Common,
            clear_color: None,
        }
    }

    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn with_clear_color(mut self, clear_color: glam::Vec4) -> Self {
        self.clear_color = Some(clear_color);
        self
    }

    /// 紧密排列时整张纹理的字节数
    #[inline]
    pub fn byte_size(&self) -> u64 {
        self.extent.width as u64 * self.extent.height as u64 * self.format.bytes_per_pixel() as u64
    }

    #[inline]
    pub fn row_pitch(&self) -> u64 {
        self.extent.width as u64 * self.format.bytes_per_pixel() as u64
    }
}
