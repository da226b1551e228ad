bitflags::bitflags! {
    /// 哪些全局配置的变化会使一个 graph 对象失效
    ///
    /// 所有对象都隐式依赖 `DEVICE`：设备重建时所有对象都会被重建。
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct StateDep: u32 {
        const DEVICE = 1 << 0;
        const DISPLAY_SIZE = 1 << 1;
        const RENDER_SIZE = 1 << 2;
        const BACK_BUFFER_COUNT = 1 << 3;
    }
}

impl StateDep {
    /// 依赖 `self` 的对象是否需要因为 `changed` 而重建
    #[inline]
    pub fn is_affected_by(self, changed: StateDep) -> bool {
        (self | StateDep::DEVICE).intersects(changed)
    }
}

impl Default for StateDep {
    fn default() -> Self {
        StateDep::DEVICE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_change_affects_everything() {
        assert!(StateDep::RENDER_SIZE.is_affected_by(StateDep::DEVICE));
        assert!(StateDep::empty().is_affected_by(StateDep::DEVICE));
        assert!(StateDep::RENDER_SIZE.is_affected_by(StateDep::RENDER_SIZE));
        assert!(!StateDep::RENDER_SIZE.is_affected_by(StateDep::DISPLAY_SIZE));
        assert!(!StateDep::DEVICE.is_affected_by(StateDep::BACK_BUFFER_COUNT));
    }
}
