/// 资源在命令流中某一点上的访问状态
///
/// 两个状态不同时，必须先录制一次 transition 才能以新的方式访问资源。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// 创建时的初始状态，内容未定义
    #[default]
    Common,
    Present,
    RenderTarget,
    DepthWrite,
    DepthRead,
    /// 在 shader 中采样读取
    ShaderResource,
    /// 在 shader 中随机读写
    UnorderedAccess,
    Uniform,
    VertexBuffer,
    IndexBuffer,
    CopySource,
    CopyDest,
}

impl ResourceState {
    /// 该状态下 GPU 是否会写入资源
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            ResourceState::RenderTarget
                | ResourceState::DepthWrite
                | ResourceState::UnorderedAccess
                | ResourceState::CopyDest
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            ResourceState::Common => "common",
            ResourceState::Present => "present",
            ResourceState::RenderTarget => "render-target",
            ResourceState::DepthWrite => "depth-write",
            ResourceState::DepthRead => "depth-read",
            ResourceState::ShaderResource => "shader-resource",
            ResourceState::UnorderedAccess => "unordered-access",
            ResourceState::Uniform => "uniform",
            ResourceState::VertexBuffer => "vertex-buffer",
            ResourceState::IndexBuffer => "index-buffer",
            ResourceState::CopySource => "copy-source",
            ResourceState::CopyDest => "copy-dest",
        }
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
