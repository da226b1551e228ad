//! 描述符堆 + 位图分配器
//!
//! 每个 [`DescriptorAlloc`] 持有一个定长的描述符堆，以及一个同样大小的 [`BitMap`]。
//! 分配得到的下标可以换算成 host 端和（shader 可见时）device 端的描述符地址。

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use ember_gfx::foundation::device::GfxDevice;
use ember_gfx::handles::GfxHeapHandle;
use ember_gfx::resources::heap::{DeviceDescriptor, HeapDesc, HeapKind, HeapLayout, HostDescriptor};
use ember_utils::bitmap::{BitIndex, BitMap};

use crate::render_error::{RenderError, RenderResult};

/// 标记描述符堆的种类，用于在类型上区分不同堆的下标
pub trait HeapMarker: 'static {
    const KIND: HeapKind;
}

pub struct RenderTargetHeap;
pub struct DepthStencilHeap;
pub struct ShaderDataHeap;

impl HeapMarker for RenderTargetHeap {
    const KIND: HeapKind = HeapKind::RenderTarget;
}
impl HeapMarker for DepthStencilHeap {
    const KIND: HeapKind = HeapKind::DepthStencil;
}
impl HeapMarker for ShaderDataHeap {
    const KIND: HeapKind = HeapKind::ShaderData;
}

pub type RenderTargetAlloc = DescriptorAlloc<RenderTargetHeap>;
pub type DepthStencilAlloc = DescriptorAlloc<DepthStencilHeap>;
pub type ShaderDataAlloc = DescriptorAlloc<ShaderDataHeap>;

pub type RtvIndex = DescriptorIndex<RenderTargetHeap>;
pub type DsvIndex = DescriptorIndex<DepthStencilHeap>;
pub type SrvIndex = DescriptorIndex<ShaderDataHeap>;

/// 某个描述符堆中的下标
///
/// 不同堆的下标是不同的类型，不能混用
pub struct DescriptorIndex<T: HeapMarker> {
    index: usize,
    _marker: PhantomData<T>,
}

impl<T: HeapMarker> DescriptorIndex<T> {
    #[inline]
    fn new(index: usize) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn get(self) -> usize {
        self.index
    }
}

impl<T: HeapMarker> Clone for DescriptorIndex<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: HeapMarker> Copy for DescriptorIndex<T> {}
impl<T: HeapMarker> PartialEq for DescriptorIndex<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl<T: HeapMarker> Eq for DescriptorIndex<T> {}
impl<T: HeapMarker> Hash for DescriptorIndex<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}
impl<T: HeapMarker> fmt::Debug for DescriptorIndex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", T::KIND.name(), self.index)
    }
}

pub struct DescriptorAlloc<T: HeapMarker> {
    heap: GfxHeapHandle,
    layout: HeapLayout,
    allocator: BitMap,

    destroyed: bool,
    _marker: PhantomData<T>,
}

// new & init
impl<T: HeapMarker> DescriptorAlloc<T> {
    pub fn new(device: &mut dyn GfxDevice, capacity: usize, name: &str) -> RenderResult<Self> {
        let heap = device.create_heap(&HeapDesc {
            name: name.to_string(),
            kind: T::KIND,
            capacity,
        })?;
        let layout = match device.heap_layout(heap) {
            Ok(layout) => layout,
            Err(e) => {
                device.destroy(heap.into());
                return Err(e.into());
            }
        };
        log::info!("created {} descriptor heap {} with {} slots", T::KIND.name(), name, capacity);

        Ok(Self {
            heap,
            layout,
            allocator: BitMap::new(capacity),
            destroyed: false,
            _marker: PhantomData,
        })
    }
}

// destroy
impl<T: HeapMarker> DescriptorAlloc<T> {
    pub fn destroy(mut self, device: &mut dyn GfxDevice) {
        let live = self.allocator.allocated_count();
        if live > 0 {
            log::debug!("destroying {} heap with {} live descriptors", T::KIND.name(), live);
        }
        device.destroy(self.heap.into());
        self.destroyed = true;
    }
}
impl<T: HeapMarker> Drop for DescriptorAlloc<T> {
    fn drop(&mut self) {
        debug_assert!(
            self.destroyed || std::thread::panicking(),
            "{} descriptor heap dropped without destroy",
            T::KIND.name()
        );
    }
}

// alloc & release
impl<T: HeapMarker> DescriptorAlloc<T> {
    /// 堆已满时返回可恢复的 [`RenderError::HeapExhausted`]
    pub fn alloc(&mut self) -> RenderResult<DescriptorIndex<T>> {
        let index = self.allocator.alloc();
        if !index.is_valid() {
            log::error!(
                "out of descriptor heap space: {} heap is full ({} slots)",
                T::KIND.name(),
                self.allocator.size()
            );
            return Err(RenderError::HeapExhausted {
                heap: T::KIND.name(),
                capacity: self.allocator.size(),
            });
        }
        Ok(DescriptorIndex::new(index.get()))
    }

    /// 释放未分配的下标是调用方错误
    pub fn release(&mut self, index: DescriptorIndex<T>) {
        let bit = BitIndex::new(index.get());
        assert!(self.allocator.test(bit), "release of unallocated descriptor {:?}", index);
        self.allocator.release(bit);
    }

    /// 整体清空，用于堆即将被重建的情况
    pub fn reset(&mut self) {
        self.allocator.reset();
    }
}

// getters
impl<T: HeapMarker> DescriptorAlloc<T> {
    #[inline]
    pub fn host_offset(&self, index: DescriptorIndex<T>) -> HostDescriptor {
        self.layout.host_descriptor(index.get())
    }

    /// 只有 shader 可见的堆才有 device 地址
    #[inline]
    pub fn device_offset(&self, index: DescriptorIndex<T>) -> Option<DeviceDescriptor> {
        self.layout.device_descriptor(index.get())
    }

    #[inline]
    pub fn heap(&self) -> GfxHeapHandle {
        self.heap
    }

    #[inline]
    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.allocator.size()
    }

    /// 用于查看堆的占用情况
    #[inline]
    pub fn allocator(&self) -> &BitMap {
        &self.allocator
    }

    #[inline]
    pub fn is_allocated(&self, index: DescriptorIndex<T>) -> bool {
        self.allocator.test(BitIndex::new(index.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_gfx::foundation::instance::{DeviceFlags, GfxInstance};
    use ember_gfx::headless::instance::HeadlessInstance;

    fn create_device() -> Box<dyn GfxDevice> {
        let mut instance = HeadlessInstance::new();
        let adapters = instance.enumerate_adapters().unwrap();
        adapters[0].create_device(DeviceFlags::empty()).unwrap()
    }

    #[test]
    fn test_offsets_are_stable_and_disjoint() {
        let mut device = create_device();
        let mut srv = ShaderDataAlloc::new(device.as_mut(), 8, "srv").unwrap();

        let indices: Vec<_> = (0..5).map(|_| srv.alloc().unwrap()).collect();
        let host: Vec<_> = indices.iter().map(|i| srv.host_offset(*i)).collect();
        let dev: Vec<_> = indices.iter().map(|i| srv.device_offset(*i).unwrap()).collect();

        let stride = srv.layout().stride;
        for a in 0..host.len() {
            for b in (a + 1)..host.len() {
                assert!(host[a].0.abs_diff(host[b].0) >= stride);
                assert!(dev[a].0.abs_diff(dev[b].0) >= stride);
            }
        }

        srv.release(indices[1]);
        srv.release(indices[3]);
        // 其它存活下标的地址不变
        for i in [0, 2, 4] {
            assert_eq!(srv.host_offset(indices[i]), host[i]);
            assert_eq!(srv.device_offset(indices[i]), Some(dev[i]));
        }
        // 重新分配到最小的空闲槽位
        assert_eq!(srv.alloc().unwrap(), indices[1]);

        srv.destroy(device.as_mut());
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        let mut device = create_device();
        let mut rtv = RenderTargetAlloc::new(device.as_mut(), 2, "rtv").unwrap();

        let first = rtv.alloc().unwrap();
        rtv.alloc().unwrap();
        let err = rtv.alloc().unwrap_err();
        assert!(matches!(err, RenderError::HeapExhausted { heap: "rtv", capacity: 2 }));
        assert!(err.is_recoverable());

        rtv.release(first);
        assert_eq!(rtv.alloc().unwrap().get(), 0);
        assert_eq!(rtv.allocator().allocated_count(), 2);

        rtv.reset();
        assert_eq!(rtv.allocator().allocated_count(), 0);
        rtv.destroy(device.as_mut());
    }

    #[test]
    fn test_render_target_heap_has_no_device_offset() {
        let mut device = create_device();
        let mut dsv = DepthStencilAlloc::new(device.as_mut(), 1, "dsv").unwrap();
        let index = dsv.alloc().unwrap();
        assert!(dsv.device_offset(index).is_none());
        dsv.destroy(device.as_mut());
    }

    #[test]
    #[should_panic]
    fn test_release_unallocated_panics() {
        let mut device = create_device();
        let mut srv = ShaderDataAlloc::new(device.as_mut(), 4, "srv").unwrap();
        srv.release(DescriptorIndex::new(2));
    }
}
