//! 描述符堆
//!
//! 描述符堆是一段定长的描述符数组。host 端描述符地址用于录制 render target 等绑定，
//! shader 可见的堆额外拥有 device 端地址，供 shader 通过下标访问。

/// 描述符堆的种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapKind {
    RenderTarget,
    DepthStencil,
    /// CBV / SRV / UAV
    ShaderData,
}

impl HeapKind {
    pub const fn name(self) -> &'static str {
        match self {
            HeapKind::RenderTarget => "rtv",
            HeapKind::DepthStencil => "dsv",
            HeapKind::ShaderData => "srv",
        }
    }

    /// 只有 shader data 堆对 shader 可见
    #[inline]
    pub const fn shader_visible(self) -> bool {
        matches!(self, HeapKind::ShaderData)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapDesc {
    pub name: String,
    pub kind: HeapKind,
    pub capacity: usize,
}

/// 描述符堆在地址空间中的布局
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapLayout {
    pub host_base: u64,
    /// 不是 shader 可见的堆没有 device 地址
    pub device_base: Option<u64>,
    /// 相邻两个描述符之间的字节数
    pub stride: u64,
    pub capacity: usize,
}

impl HeapLayout {
    #[inline]
    pub fn host_descriptor(&self, index: usize) -> HostDescriptor {
        HostDescriptor(self.host_base + index as u64 * self.stride)
    }

    #[inline]
    pub fn device_descriptor(&self, index: usize) -> Option<DeviceDescriptor> {
        self.device_base.map(|base| DeviceDescriptor(base + index as u64 * self.stride))
    }

    /// 从 host 地址反推下标；地址不属于该堆时返回 None
    pub fn host_index(&self, descriptor: HostDescriptor) -> Option<usize> {
        let offset = descriptor.0.checked_sub(self.host_base)?;
        if offset % self.stride != 0 {
            return None;
        }
        let index = (offset / self.stride) as usize;
        (index < self.capacity).then_some(index)
    }

    pub fn device_index(&self, descriptor: DeviceDescriptor) -> Option<usize> {
        let offset = descriptor.0.checked_sub(self.device_base?)?;
        if offset % self.stride != 0 {
            return None;
        }
        let index = (offset / self.stride) as usize;
        (index < self.capacity).then_some(index)
    }
}

/// CPU 可见的描述符地址
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostDescriptor(pub u64);

/// GPU 可见的描述符地址
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceDescriptor(pub u64);

/// 写入描述符时使用的视图类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ViewKind {
    RenderTarget,
    DepthStencil,
    ShaderResource,
    UnorderedAccess,
    Uniform,
}

impl ViewKind {
    /// 该视图只能写入哪一种堆
    pub const fn heap_kind(self) -> HeapKind {
        match self {
            ViewKind::RenderTarget => HeapKind::RenderTarget,
            ViewKind::DepthStencil => HeapKind::DepthStencil,
            ViewKind::ShaderResource | ViewKind::UnorderedAccess | ViewKind::Uniform => HeapKind::ShaderData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_round_trip() {
        let layout = HeapLayout {
            host_base: 0x1000,
            device_base: Some(0x8000),
            stride: 32,
            capacity: 4,
        };
        for index in 0..4 {
            assert_eq!(layout.host_index(layout.host_descriptor(index)), Some(index));
            assert_eq!(layout.device_index(layout.device_descriptor(index).unwrap()), Some(index));
        }
        assert_eq!(layout.host_index(HostDescriptor(0x1000 + 4 * 32)), None);
        assert_eq!(layout.host_index(HostDescriptor(0x1001)), None);
        assert_eq!(layout.host_index(HostDescriptor(0x10)), None);
    }
}
