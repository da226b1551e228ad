use crate::basic::extent::{Scissor, Viewport};
use crate::basic::format::IndexFormat;
use crate::basic::resource_state::ResourceState;
use crate::handles::{GfxHeapHandle, GfxPipelineHandle, GfxResourceHandle};
use crate::resources::heap::{DeviceDescriptor, HostDescriptor};

/// 命令队列 / 命令内存的种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// 图形 + 计算 + 拷贝
    Direct,
    /// 只能执行拷贝命令
    Copy,
}

impl CommandType {
    pub const fn name(self) -> &'static str {
        match self {
            CommandType::Direct => "direct",
            CommandType::Copy => "copy",
        }
    }
}

/// 一次资源状态转换
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub resource: GfxResourceHandle,
    pub before: ResourceState,
    pub after: ResourceState,
}

/// 录制到命令列表中的一条命令
///
/// 后端负责把它翻译成对应图形 API 的调用。
#[derive(Clone, Debug, PartialEq)]
pub enum GfxCommand {
    Transition(Vec<Transition>),

    SetShaderHeap(GfxHeapHandle),
    SetPipeline(GfxPipelineHandle),
    SetDisplay { viewport: Viewport, scissor: Scissor },
    /// 把一个 shader 可见的描述符地址传给 shader 的第 `slot` 个输入
    SetShaderInput { slot: u32, descriptor: DeviceDescriptor },

    SetRenderTarget { rtv: HostDescriptor, dsv: Option<HostDescriptor> },
    ClearRenderTarget { rtv: HostDescriptor, color: glam::Vec4 },
    ClearDepthStencil { dsv: HostDescriptor, depth: f32, stencil: u8 },

    SetVertexBuffer { buffer: GfxResourceHandle, stride: u32 },
    SetIndexBuffer { buffer: GfxResourceHandle, format: IndexFormat },
    Draw { vertex_count: u32, instance_count: u32 },
    DrawIndexed { index_count: u32, instance_count: u32 },

    CopyBuffer { dst: GfxResourceHandle, src: GfxResourceHandle, size: u64 },
    /// 从紧密排列的 staging buffer 拷贝整张纹理
    CopyTexture { dst: GfxResourceHandle, src: GfxResourceHandle },

    BeginEvent(String),
    EndEvent,
}

impl GfxCommand {
    /// copy 队列只能执行拷贝、状态转换和标记命令
    pub fn allowed_on(&self, ty: CommandType) -> bool {
        match ty {
            CommandType::Direct => true,
            CommandType::Copy => matches!(
                self,
                GfxCommand::Transition(_)
                    | GfxCommand::CopyBuffer { .. }
                    | GfxCommand::CopyTexture { .. }
                    | GfxCommand::BeginEvent(_)
                    | GfxCommand::EndEvent
            ),
        }
    }
}
