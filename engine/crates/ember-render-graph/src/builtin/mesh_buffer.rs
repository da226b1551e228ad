use ember_gfx::basic::format::{IndexFormat, VertexFormat};
use ember_gfx::basic::resource_state::ResourceState;
use ember_gfx::commands::command::Transition;
use ember_gfx::handles::GfxResourceHandle;
use ember_gfx::resources::buffer::{BufferDesc, BufferUsage};
use ember_gfx::resources::pipeline::VertexAttribute;
use ember_render_interface::render_context::RenderContext;
use ember_render_interface::render_error::{RenderError, RenderResult};

use crate::graph_object::{CreateContext, GraphObject};

/// 内置 mesh 的顶点格式
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

impl MeshVertex {
    pub const ATTRIBUTES: [VertexAttribute; 2] = [
        VertexAttribute {
            name: "position",
            format: VertexFormat::Float3,
            offset: 0,
        },
        VertexAttribute {
            name: "color",
            format: VertexFormat::Float4,
            offset: 12,
        },
    ];

    #[inline]
    pub fn new(position: [f32; 3], color: [f32; 4]) -> Self {
        Self { position, color }
    }
}

/// 绘制一个 mesh 需要的全部参数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshDrawArgs {
    pub vertex_buffer: GfxResourceHandle,
    pub vertex_stride: u32,
    pub index_buffer: GfxResourceHandle,
    pub index_format: IndexFormat,
    pub index_count: u32,
}

/// 顶点与索引 buffer
///
/// 创建时通过 copy 队列阻塞上传，上传完成后 buffer 分别处于 `VertexBuffer` / `IndexBuffer` 状态。
pub struct MeshBuffer {
    name: String,

    vertices: Vec<u8>,
    vertex_stride: u32,
    indices: Vec<u8>,
    index_format: IndexFormat,
    index_count: u32,

    vertex_buffer: Option<GfxResourceHandle>,
    index_buffer: Option<GfxResourceHandle>,
}

// new & init
impl MeshBuffer {
    pub fn new<V: bytemuck::Pod>(name: impl Into<String>, vertices: &[V], indices: &[u32]) -> Self {
        Self {
            name: name.into(),
            vertices: bytemuck::cast_slice(vertices).to_vec(),
            vertex_stride: size_of::<V>() as u32,
            indices: bytemuck::cast_slice(indices).to_vec(),
            index_format: IndexFormat::Uint32,
            index_count: indices.len() as u32,
            vertex_buffer: None,
            index_buffer: None,
        }
    }

    /// 16 位索引
    pub fn new_u16<V: bytemuck::Pod>(name: impl Into<String>, vertices: &[V], indices: &[u16]) -> Self {
        Self {
            indices: bytemuck::cast_slice(indices).to_vec(),
            index_format: IndexFormat::Uint16,
            index_count: indices.len() as u32,
            ..Self::new::<V>(name, vertices, &[])
        }
    }

    /// 一个覆盖 [-0.5, 0.5] 的彩色四边形
    pub fn quad(name: impl Into<String>) -> Self {
        let vertices = [
            MeshVertex::new([-0.5, -0.5, 0.0], [1.0, 0.0, 0.0, 1.0]),
            MeshVertex::new([0.5, -0.5, 0.0], [0.0, 1.0, 0.0, 1.0]),
            MeshVertex::new([0.5, 0.5, 0.0], [0.0, 0.0, 1.0, 1.0]),
            MeshVertex::new([-0.5, 0.5, 0.0], [1.0, 1.0, 1.0, 1.0]),
        ];
        Self::new_u16(name, &vertices, &[0, 1, 2, 0, 2, 3])
    }

    fn upload(&self, render: &mut RenderContext, vb: GfxResourceHandle, ib: GfxResourceHandle) -> RenderResult<()> {
        render.copy_buffer(vb, &self.vertices)?;
        render.copy_buffer(ib, &self.indices)?;
        render.transition_copy(vec![
            Transition {
                resource: vb,
                before: ResourceState::CopyDest,
                after: ResourceState::VertexBuffer,
            },
            Transition {
                resource: ib,
                before: ResourceState::CopyDest,
                after: ResourceState::IndexBuffer,
            },
        ])
    }
}

impl GraphObject for MeshBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&mut self, ctx: &mut CreateContext) -> RenderResult<()> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(RenderError::asset(self.name.clone(), "mesh has no vertices or indices"));
        }

        let vb = ctx.render.create_buffer(
            &BufferDesc::new(
                format!("{}-vertices", self.name),
                self.vertices.len() as u64,
                BufferUsage::VERTEX | BufferUsage::COPY_DST,
            )
            .with_initial_state(ResourceState::CopyDest),
        )?;
        self.vertex_buffer = Some(vb);
        ctx.states.set(vb, ResourceState::CopyDest);

        let ib = ctx.render.create_buffer(
            &BufferDesc::new(
                format!("{}-indices", self.name),
                self.indices.len() as u64,
                BufferUsage::INDEX | BufferUsage::COPY_DST,
            )
            .with_initial_state(ResourceState::CopyDest),
        )?;
        self.index_buffer = Some(ib);
        ctx.states.set(ib, ResourceState::CopyDest);

        ctx.render.begin_copy()?;
        let uploaded = self.upload(ctx.render, vb, ib);
        ctx.render.end_copy()?;
        uploaded?;

        ctx.states.set(vb, ResourceState::VertexBuffer);
        ctx.states.set(ib, ResourceState::IndexBuffer);
        log::info!(
            "uploaded mesh {}: {} bytes of vertices, {} indices",
            self.name,
            self.vertices.len(),
            self.index_count
        );
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut CreateContext) {
        for buffer in [self.index_buffer.take(), self.vertex_buffer.take()].into_iter().flatten() {
            ctx.states.remove(buffer);
            ctx.render.destroy_resource(buffer);
        }
    }
}

// getters
impl MeshBuffer {
    /// 未创建时返回 None
    pub fn draw_args(&self) -> Option<MeshDrawArgs> {
        Some(MeshDrawArgs {
            vertex_buffer: self.vertex_buffer?,
            vertex_stride: self.vertex_stride,
            index_buffer: self.index_buffer?,
            index_format: self.index_format,
            index_count: self.index_count,
        })
    }

    #[inline]
    pub fn vertex_buffer(&self) -> Option<GfxResourceHandle> {
        self.vertex_buffer
    }

    #[inline]
    pub fn index_buffer(&self) -> Option<GfxResourceHandle> {
        self.index_buffer
    }

    #[inline]
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    #[inline]
    pub fn vertex_stride(&self) -> u32 {
        self.vertex_stride
    }

    #[inline]
    pub fn index_format(&self) -> IndexFormat {
        self.index_format
    }
}
