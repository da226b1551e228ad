//! 设备对象的 handle
//!
//! 所有设备对象都由后端保存在 `SlotMap` 中，对外只暴露带代际信息的轻量 handle，
//! 对象销毁之后旧 handle 自动失效。

slotmap::new_key_type! { pub struct GfxQueueHandle; }
slotmap::new_key_type! { pub struct GfxFenceHandle; }
slotmap::new_key_type! { pub struct GfxCommandMemoryHandle; }
slotmap::new_key_type! { pub struct GfxCommandListHandle; }
slotmap::new_key_type! { pub struct GfxResourceHandle; }
slotmap::new_key_type! { pub struct GfxHeapHandle; }
slotmap::new_key_type! { pub struct GfxPipelineHandle; }
slotmap::new_key_type! { pub struct GfxDisplayHandle; }

/// 任意一种可销毁的设备对象
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GfxObject {
    Queue(GfxQueueHandle),
    Fence(GfxFenceHandle),
    CommandMemory(GfxCommandMemoryHandle),
    CommandList(GfxCommandListHandle),
    Resource(GfxResourceHandle),
    Heap(GfxHeapHandle),
    Pipeline(GfxPipelineHandle),
    Display(GfxDisplayHandle),
}

macro_rules! impl_from_handle {
    ($($handle:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$handle> for GfxObject {
                #[inline]
                fn from(handle: $handle) -> Self {
                    GfxObject::$variant(handle)
                }
            }
        )*
    };
}

impl_from_handle! {
    GfxQueueHandle => Queue,
    GfxFenceHandle => Fence,
    GfxCommandMemoryHandle => CommandMemory,
    GfxCommandListHandle => CommandList,
    GfxResourceHandle => Resource,
    GfxHeapHandle => Heap,
    GfxPipelineHandle => Pipeline,
    GfxDisplayHandle => Display,
}
