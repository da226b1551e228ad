//! 资源 handle
//!
//! 一个 handle 持有零个或一个设备资源（交换链的 handle 例外，每个 back buffer 一个），
//! 以及该资源在各个描述符堆中的下标。
//!
//! handle 的种类是一个封闭的集合：能力（RTV / DSV / SRV / UAV）由 [`ViewCaps`] 描述，
//! 资源来源（自己持有 / 外部提供）由 [`ResourceKind`] 描述。

use ember_gfx::basic::extent::Extent2D;
use ember_gfx::basic::format::PixelFormat;
use ember_gfx::basic::resource_state::ResourceState;
use ember_gfx::handles::GfxResourceHandle;
use ember_gfx::resources::buffer::{BufferDesc, BufferUsage};
use ember_gfx::resources::texture::{TextureDesc, TextureUsage};
use ember_render_interface::descriptor_alloc::{DsvIndex, RtvIndex, SrvIndex};
use ember_render_interface::render_context::RenderContext;
use ember_render_interface::render_error::{RenderError, RenderResult};

use crate::graph_object::{CreateContext, Lifecycle};
use crate::resource_states::ResourceStates;
use crate::state_dep::StateDep;

bitflags::bitflags! {
    /// handle 需要在哪些描述符堆中占用槽位
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ViewCaps: u32 {
        const RTV = 1 << 0;
        const DSV = 1 << 1;
        /// 纹理为 shader resource view，buffer 为 uniform view
        const SRV = 1 << 2;
        const UAV = 1 << 3;
    }
}

/// 纹理尺寸的来源
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentSource {
    /// 使用 desc 中的尺寸
    Fixed,
    RenderSize,
    DisplaySize,
}

#[derive(Clone, Debug)]
pub enum ResourceKind {
    /// 自己持有的纹理
    Texture { desc: TextureDesc, extent: ExtentSource },
    /// 从 asset depot 加载的图片，通过 copy 队列上传
    Image { name: String },
    /// 自己持有的 buffer，`data` 不为空时通过 copy 队列上传
    Buffer { desc: BufferDesc, data: Option<Vec<u8>> },
    /// 交换链的 back buffer，由显示队列持有
    BackBuffers,
}

/// 一个设备资源及其描述符
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceSlot {
    pub resource: Option<GfxResourceHandle>,
    pub rtv: Option<RtvIndex>,
    pub dsv: Option<DsvIndex>,
    pub srv: Option<SrvIndex>,
    pub uav: Option<SrvIndex>,
}

pub struct ResourceHandle {
    name: String,
    deps: StateDep,
    caps: ViewCaps,
    kind: ResourceKind,

    lifecycle: Lifecycle,
    /// 成功创建的次数
    generation: u32,
    slots: Vec<ResourceSlot>,
    /// 最近一次创建时的尺寸
    extent: Option<Extent2D>,
}

// new & init
impl ResourceHandle {
    pub fn new(name: impl Into<String>, kind: ResourceKind, caps: ViewCaps, deps: StateDep) -> Self {
        Self {
            name: name.into(),
            deps: deps | StateDep::DEVICE,
            caps,
            kind,
            lifecycle: Lifecycle::Uninitialized,
            generation: 0,
            slots: Vec::new(),
            extent: None,
        }
    }

    /// 交换链的 back buffer，每个 back buffer 一个 RTV
    pub fn swap_chain() -> Self {
        Self::new(
            "swap-chain",
            ResourceKind::BackBuffers,
            ViewCaps::RTV,
            StateDep::DISPLAY_SIZE | StateDep::BACK_BUFFER_COUNT,
        )
    }

    /// 跟随 render size 的颜色目标，可以作为 render target 写入，也可以被 shader 读取
    pub fn scene_target(name: impl Into<String>, format: PixelFormat, clear_color: glam::Vec4) -> Self {
        let name = name.into();
        let desc = TextureDesc::new(
            name.clone(),
            Extent2D::default(),
            format,
            TextureUsage::RENDER_TARGET | TextureUsage::SHADER_READ,
        )
        .with_initial_state(ResourceState::ShaderResource)
        .with_clear_color(clear_color);

        Self::new(
            name,
            ResourceKind::Texture {
                desc,
                extent: ExtentSource::RenderSize,
            },
            ViewCaps::RTV | ViewCaps::SRV,
            StateDep::RENDER_SIZE,
        )
    }

    /// 跟随 render size 的深度目标
    pub fn depth_target(name: impl Into<String>) -> Self {
        let name = name.into();
        let desc = TextureDesc::new(
            name.clone(),
            Extent2D::default(),
            PixelFormat::Depth32Float,
            TextureUsage::DEPTH_STENCIL,
        )
        .with_initial_state(ResourceState::DepthWrite);

        Self::new(
            name,
            ResourceKind::Texture {
                desc,
                extent: ExtentSource::RenderSize,
            },
            ViewCaps::DSV,
            StateDep::RENDER_SIZE,
        )
    }

    /// 从 asset depot 加载的只读纹理
    pub fn texture(image: impl Into<String>) -> Self {
        let image = image.into();
        Self::new(
            image.clone(),
            ResourceKind::Image { name: image },
            ViewCaps::SRV,
            StateDep::DEVICE,
        )
    }

    /// 可读写的纹理
    pub fn rw_texture(name: impl Into<String>, format: PixelFormat, extent: Extent2D, source: ExtentSource) -> Self {
        let name = name.into();
        let desc = TextureDesc::new(name.clone(), extent, format, TextureUsage::STORAGE | TextureUsage::SHADER_READ)
            .with_initial_state(ResourceState::UnorderedAccess);
        let deps = match source {
            ExtentSource::Fixed => StateDep::DEVICE,
            ExtentSource::RenderSize => StateDep::RENDER_SIZE,
            ExtentSource::DisplaySize => StateDep::DISPLAY_SIZE,
        };

        Self::new(
            name,
            ResourceKind::Texture { desc, extent: source },
            ViewCaps::UAV | ViewCaps::SRV,
            deps,
        )
    }

    /// CPU 可写的 uniform buffer，大小按 256 对齐
    pub fn uniform(name: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        let desc = BufferDesc::new(
            name.clone(),
            size.next_multiple_of(256),
            BufferUsage::UNIFORM | BufferUsage::HOST_WRITE,
        )
        .with_initial_state(ResourceState::Uniform);

        Self::new(name, ResourceKind::Buffer { desc, data: None }, ViewCaps::SRV, StateDep::DEVICE)
    }
}

// create & destroy
impl ResourceHandle {
    /// 创建设备资源并映射描述符
    ///
    /// 失败时释放已经创建的部分，handle 回到未创建状态
    pub fn create(&mut self, ctx: &mut CreateContext) -> RenderResult<()> {
        assert!(!self.lifecycle.is_created(), "resource handle {} created twice", self.name);

        if let Err(e) = self.create_slots(ctx) {
            log::error!("failed to create resource {}: {}", self.name, e);
            self.release_slots(ctx.render, ctx.states);
            return Err(e);
        }
        debug_assert!(self.slots.iter().all(|slot| self.caps_match(slot)));

        self.lifecycle = Lifecycle::Created;
        self.generation += 1;
        Ok(())
    }

    /// 未创建的 handle 忽略
    pub fn destroy(&mut self, ctx: &mut CreateContext) {
        if !self.lifecycle.is_created() {
            return;
        }
        self.release_slots(ctx.render, ctx.states);
        self.lifecycle = Lifecycle::Destroyed;
    }

    fn create_slots(&mut self, ctx: &mut CreateContext) -> RenderResult<()> {
        match &self.kind {
            ResourceKind::BackBuffers => {
                self.extent = Some(ctx.render.display_size());
                for index in 0..ctx.render.frame_count() {
                    let resource = ctx.render.back_buffer(index)?;
                    self.slots.push(ResourceSlot {
                        resource: Some(resource),
                        ..Default::default()
                    });
                    ctx.states.set(resource, ResourceState::Present);
                    Self::map_views(&mut self.slots[index], self.caps, ctx.render, false)?;
                }
            }
            ResourceKind::Texture { desc, extent } => {
                let mut desc = desc.clone();
                desc.extent = match extent {
                    ExtentSource::Fixed => desc.extent,
                    ExtentSource::RenderSize => ctx.render.render_size(),
                    ExtentSource::DisplaySize => ctx.render.display_size(),
                };
                self.extent = Some(desc.extent);

                let resource = ctx.render.create_texture(&desc)?;
                self.slots.push(ResourceSlot {
                    resource: Some(resource),
                    ..Default::default()
                });
                ctx.states.set(resource, desc.initial_state);
                Self::map_views(&mut self.slots[0], self.caps, ctx.render, false)?;
            }
            ResourceKind::Image { name } => {
                let image = ctx.depot.load_image(name)?;
                let extent = Extent2D::new(image.width, image.height);
                let desc = TextureDesc::new(
                    name.clone(),
                    extent,
                    PixelFormat::Rgba8Unorm,
                    TextureUsage::SHADER_READ | TextureUsage::COPY_DST,
                )
                .with_initial_state(ResourceState::CopyDest);
                if image.pixels.len() as u64 != desc.byte_size() {
                    return Err(RenderError::asset(
                        name.clone(),
                        format!("{} bytes of pixels for a {} image", image.pixels.len(), extent),
                    ));
                }
                self.extent = Some(extent);

                let resource = ctx.render.create_texture(&desc)?;
                self.slots.push(ResourceSlot {
                    resource: Some(resource),
                    ..Default::default()
                });
                ctx.states.set(resource, ResourceState::CopyDest);

                ctx.render.begin_copy()?;
                let copied = ctx.render.copy_texture(resource, &image.pixels);
                ctx.render.end_copy()?;
                copied?;

                Self::map_views(&mut self.slots[0], self.caps, ctx.render, false)?;
            }
            ResourceKind::Buffer { desc, data } => {
                let resource = ctx.render.create_buffer(desc)?;
                self.slots.push(ResourceSlot {
                    resource: Some(resource),
                    ..Default::default()
                });
                ctx.states.set(resource, desc.initial_state);

                if let Some(data) = data {
                    ctx.render.begin_copy()?;
                    let copied = ctx.render.copy_buffer(resource, data);
                    ctx.render.end_copy()?;
                    copied?;
                }
                Self::map_views(&mut self.slots[0], self.caps, ctx.render, true)?;
            }
        }
        Ok(())
    }

    fn map_views(slot: &mut ResourceSlot, caps: ViewCaps, render: &mut RenderContext, is_buffer: bool) -> RenderResult<()> {
        let Some(resource) = slot.resource else {
            return Ok(());
        };

        if caps.contains(ViewCaps::RTV) {
            slot.rtv = Some(render.map_render_target(resource)?);
        }
        if caps.contains(ViewCaps::DSV) {
            slot.dsv = Some(render.map_depth_stencil(resource)?);
        }
        if caps.contains(ViewCaps::SRV) {
            slot.srv = Some(if is_buffer {
                render.map_uniform(resource)?
            } else {
                render.map_shader_resource(resource)?
            });
        }
        if caps.contains(ViewCaps::UAV) {
            slot.uav = Some(render.map_unordered_access(resource)?);
        }
        Ok(())
    }

    /// 逆序释放描述符、状态表中的记录以及自己持有的资源
    fn release_slots(&mut self, render: &mut RenderContext, states: &mut ResourceStates) {
        let owned = self.is_owned();
        for slot in self.slots.drain(..).rev() {
            if let Some(uav) = slot.uav {
                render.release_srv(uav);
            }
            if let Some(srv) = slot.srv {
                render.release_srv(srv);
            }
            if let Some(dsv) = slot.dsv {
                render.release_dsv(dsv);
            }
            if let Some(rtv) = slot.rtv {
                render.release_rtv(rtv);
            }
            if let Some(resource) = slot.resource {
                states.remove(resource);
                if owned {
                    render.destroy_resource(resource);
                }
            }
        }
    }

    fn caps_match(&self, slot: &ResourceSlot) -> bool {
        slot.rtv.is_some() == self.caps.contains(ViewCaps::RTV)
            && slot.dsv.is_some() == self.caps.contains(ViewCaps::DSV)
            && slot.srv.is_some() == self.caps.contains(ViewCaps::SRV)
            && slot.uav.is_some() == self.caps.contains(ViewCaps::UAV)
    }
}

// getters
impl ResourceHandle {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 总是包含 `DEVICE`
    #[inline]
    pub fn dependencies(&self) -> StateDep {
        self.deps
    }

    #[inline]
    pub fn caps(&self) -> ViewCaps {
        self.caps
    }

    #[inline]
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    #[inline]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub fn extent(&self) -> Option<Extent2D> {
        self.extent
    }

    /// 资源由显示队列等外部对象持有
    #[inline]
    pub fn is_external(&self) -> bool {
        matches!(self.kind, ResourceKind::BackBuffers)
    }

    #[inline]
    pub fn is_owned(&self) -> bool {
        !self.is_external()
    }

    /// 纹理的像素格式，buffer 与交换链返回 None
    pub fn format(&self) -> Option<PixelFormat> {
        match &self.kind {
            ResourceKind::Texture { desc, .. } => Some(desc.format),
            ResourceKind::Image { .. } => Some(PixelFormat::Rgba8Unorm),
            ResourceKind::Buffer { .. } | ResourceKind::BackBuffers => None,
        }
    }

    pub fn clear_color(&self) -> Option<glam::Vec4> {
        match &self.kind {
            ResourceKind::Texture { desc, .. } => desc.clear_color,
            _ => None,
        }
    }

    /// 当前帧对应的槽位：交换链跟随 back buffer 下标，其它 handle 只有一个槽位
    pub fn slot(&self, frame_index: usize) -> Option<&ResourceSlot> {
        if self.is_external() { self.slots.get(frame_index) } else { self.slots.first() }
    }

    #[inline]
    pub fn slots(&self) -> &[ResourceSlot] {
        &self.slots
    }

    #[inline]
    pub fn resource(&self, frame_index: usize) -> Option<GfxResourceHandle> {
        self.slot(frame_index).and_then(|s| s.resource)
    }

    #[inline]
    pub fn rtv(&self, frame_index: usize) -> Option<RtvIndex> {
        self.slot(frame_index).and_then(|s| s.rtv)
    }

    #[inline]
    pub fn dsv(&self, frame_index: usize) -> Option<DsvIndex> {
        self.slot(frame_index).and_then(|s| s.dsv)
    }

    #[inline]
    pub fn srv(&self, frame_index: usize) -> Option<SrvIndex> {
        self.slot(frame_index).and_then(|s| s.srv)
    }

    #[inline]
    pub fn uav(&self, frame_index: usize) -> Option<SrvIndex> {
        self.slot(frame_index).and_then(|s| s.uav)
    }

    /// 查询全局状态表，未创建时返回 None
    pub fn current_state(&self, states: &ResourceStates, frame_index: usize) -> Option<ResourceState> {
        self.resource(frame_index).and_then(|r| states.try_get(r))
    }

    pub fn set_current_state(&self, states: &mut ResourceStates, frame_index: usize, state: ResourceState) {
        if let Some(resource) = self.resource(frame_index) {
            states.set(resource, state);
        }
    }
}
