use crate::foundation::device::GfxDevice;
use crate::foundation::instance::{AdapterInfo, AdapterKind, DeviceFlags, GfxAdapter, GfxInstance};
use crate::gfx_error::GfxResult;
use crate::headless::device::HeadlessDevice;
use crate::headless::probe::HeadlessProbe;

pub struct HeadlessInstance {
    adapters: Vec<AdapterInfo>,
    probe: HeadlessProbe,
}

// new & init
impl HeadlessInstance {
    /// 默认提供一个“独显”和一个软件适配器
    pub fn new() -> Self {
        Self::with_adapters(vec![
            AdapterInfo {
                name: "Ember Headless Discrete".to_string(),
                kind: AdapterKind::Discrete,
                vendor_id: 0xE0E0,
                device_id: 1,
                video_memory: 8 << 30,
            },
            AdapterInfo {
                name: "Ember Headless Software".to_string(),
                kind: AdapterKind::Software,
                vendor_id: 0xE0E0,
                device_id: 2,
                video_memory: 0,
            },
        ])
    }

    pub fn with_adapters(adapters: Vec<AdapterInfo>) -> Self {
        Self {
            adapters,
            probe: HeadlessProbe::default(),
        }
    }
}
impl Default for HeadlessInstance {
    fn default() -> Self {
        Self::new()
    }
}

// getters
impl HeadlessInstance {
    /// 返回与该 instance 创建的所有 device 共享的 probe
    #[inline]
    pub fn probe(&self) -> HeadlessProbe {
        self.probe.clone()
    }
}

impl GfxInstance for HeadlessInstance {
    fn enumerate_adapters(&mut self) -> GfxResult<Vec<Box<dyn GfxAdapter>>> {
        Ok(self
            .adapters
            .iter()
            .map(|info| {
                Box::new(HeadlessAdapter {
                    info: info.clone(),
                    probe: self.probe.clone(),
                }) as Box<dyn GfxAdapter>
            })
            .collect())
    }

    fn report_live_objects(&self) {
        log::info!(
            "headless live objects: {} objects across {} devices",
            self.probe.live_objects(),
            self.probe.live_devices()
        );
    }
}

pub struct HeadlessAdapter {
    info: AdapterInfo,
    probe: HeadlessProbe,
}

impl GfxAdapter for HeadlessAdapter {
    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn create_device(&self, flags: DeviceFlags) -> GfxResult<Box<dyn GfxDevice>> {
        log::info!("creating headless device on {} ({:?})", self.info.name, flags);
        Ok(Box::new(HeadlessDevice::new(self.info.clone(), self.probe.clone())))
    }
}
