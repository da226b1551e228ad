use crate::basic::resource_state::ResourceState;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const COPY_SRC = 1 << 3;
        const COPY_DST = 1 << 4;
        /// CPU 可以直接写入（upload heap）
        const HOST_WRITE = 1 << 5;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub usage: BufferUsage,
    pub initial_state: ResourceState,
}

impl BufferDesc {
    pub fn new(name: impl Into<String>, size: u64, usage: BufferUsage) -> Self {
        Self {
            name: name.into(),
            size,
            usage,
            initial_state: ResourceState::Common,
        }
    }

    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }

    /// 用于上传的 staging buffer
    pub fn staging(name: impl Into<String>, size: u64) -> Self {
        Self::new(name, size, BufferUsage::COPY_SRC | BufferUsage::HOST_WRITE).with_initial_state(ResourceState::CopySource)
    }
}
