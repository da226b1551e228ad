use std::ffi::{CStr, CString, c_char};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ash::vk;
use itertools::Itertools;
use raw_window_handle::RawDisplayHandle;

use crate::foundation::device::GfxDevice;
use crate::foundation::instance::{AdapterInfo, DeviceFlags, GfxAdapter, GfxInstance};
use crate::gfx_error::{GfxError, GfxResult};
use crate::vulkan::convert::{adapter_kind, vk_error};
use crate::vulkan::debug_messenger::VulkanDebugMessenger;
use crate::vulkan::device::VulkanDevice;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// instance 级别的函数指针，由 instance 与它创建的所有 device 共享
pub(crate) struct VulkanCore {
    /// drop 之后会卸载动态库，因此放在最后 drop
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    /// 只有传入了 display handle 才会开启 surface 扩展
    pub(crate) surface: Option<ash::khr::surface::Instance>,
    pub(crate) debug_utils: bool,
    debug_messenger: Option<VulkanDebugMessenger>,
    pub(crate) live_devices: AtomicUsize,
}
impl Drop for VulkanCore {
    fn drop(&mut self) {
        log::info!("destroying vulkan instance");
        self.debug_messenger.take();
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

pub struct VulkanInstance {
    core: Arc<VulkanCore>,
}

// new & init
impl VulkanInstance {
    /// - `display`：需要呈现到窗口时传入，用于开启对应平台的 surface 扩展
    /// - `flags`：`DEBUG` 开启 validation layer，`INFO_QUEUE` 把 validation 消息转发到日志
    pub fn new(app_name: &str, display: Option<RawDisplayHandle>, flags: DeviceFlags) -> GfxResult<Self> {
        let _span = tracy_client::span!("VulkanInstance::new");

        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GfxError::Unsupported(format!("failed to load vulkan library: {}", e)))?;

        let app_name = CString::new(app_name).map_err(|e| GfxError::InvalidArgument(e.to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3)
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"Ember")
            .engine_version(vk::make_api_version(0, 1, 0, 0));

        let supported_exts = unsafe { entry.enumerate_instance_extension_properties(None) }
            .map_err(|e| vk_error(e, "vkEnumerateInstanceExtensionProperties"))?;
        let is_ext_supported = |ext: &CStr| {
            supported_exts.iter().any(|props| props.extension_name_as_c_str().is_ok_and(|name| name == ext))
        };

        let mut exts: Vec<*const c_char> = Vec::new();
        if let Some(display) = display {
            let surface_exts = ash_window::enumerate_required_extensions(display)
                .map_err(|e| vk_error(e, "ash_window::enumerate_required_extensions"))?;
            exts.extend_from_slice(surface_exts);
        }
        let debug_utils = is_ext_supported(ash::ext::debug_utils::NAME);
        if debug_utils {
            exts.push(ash::ext::debug_utils::NAME.as_ptr());
        } else {
            log::warn!("{:?} is not supported, debug names are disabled", ash::ext::debug_utils::NAME);
        }

        let mut layers: Vec<*const c_char> = Vec::new();
        if flags.contains(DeviceFlags::DEBUG) {
            let supported_layers = unsafe { entry.enumerate_instance_layer_properties() }
                .map_err(|e| vk_error(e, "vkEnumerateInstanceLayerProperties"))?;
            if supported_layers.iter().any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER))
            {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                log::warn!("{:?} is not installed, running without validation", VALIDATION_LAYER);
            }
        }

        log::info!(
            "instance extensions: {}",
            exts.iter().map(|ext| format!("\n\t{:?}", unsafe { CStr::from_ptr(*ext) })).join("")
        );
        log::info!(
            "instance layers: {}",
            layers.iter().map(|layer| format!("\n\t{:?}", unsafe { CStr::from_ptr(*layer) })).join("")
        );

        let use_messenger = debug_utils && flags.contains(DeviceFlags::INFO_QUEUE);
        let mut messenger_ci = VulkanDebugMessenger::create_info();
        let mut instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&exts)
            .enabled_layer_names(&layers);
        if use_messenger {
            instance_ci = instance_ci.push_next(&mut messenger_ci);
        }

        let instance =
            unsafe { entry.create_instance(&instance_ci, None) }.map_err(|e| vk_error(e, "vkCreateInstance"))?;

        let debug_messenger = if use_messenger {
            match VulkanDebugMessenger::new(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    log::warn!("failed to create debug messenger: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let surface = display.map(|_| ash::khr::surface::Instance::new(&entry, &instance));

        Ok(Self {
            core: Arc::new(VulkanCore {
                entry,
                instance,
                surface,
                debug_utils,
                debug_messenger,
                live_devices: AtomicUsize::new(0),
            }),
        })
    }
}

// tools
impl VulkanInstance {
    /// 只接受支持 Vulkan 1.3 且带有图形队列的物理设备
    fn describe_adapter(&self, physical_device: vk::PhysicalDevice) -> Option<VulkanAdapter> {
        let instance = &self.core.instance;
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = props.device_name_as_c_str().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

        if props.api_version < vk::API_VERSION_1_3 {
            log::warn!(
                "skipping {}: vulkan {}.{} is below 1.3",
                name,
                vk::api_version_major(props.api_version),
                vk::api_version_minor(props.api_version)
            );
            return None;
        }

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let Some((queue_family, _)) = queue_families
            .iter()
            .find_position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER))
        else {
            log::warn!("skipping {}: no graphics queue family", name);
            return None;
        };

        let mem_props = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let video_memory = mem_props.memory_heaps[..mem_props.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();

        Some(VulkanAdapter {
            core: self.core.clone(),
            physical_device,
            queue_family: queue_family as u32,
            info: AdapterInfo {
                name,
                kind: adapter_kind(props.device_type),
                vendor_id: props.vendor_id,
                device_id: props.device_id,
                video_memory,
            },
        })
    }
}

impl GfxInstance for VulkanInstance {
    fn enumerate_adapters(&mut self) -> GfxResult<Vec<Box<dyn GfxAdapter>>> {
        let physical_devices = unsafe { self.core.instance.enumerate_physical_devices() }
            .map_err(|e| vk_error(e, "vkEnumeratePhysicalDevices"))?;

        Ok(physical_devices
            .into_iter()
            .filter_map(|physical_device| self.describe_adapter(physical_device))
            // 独显排在前面
            .sorted_by_key(|adapter| adapter.info.kind != crate::foundation::instance::AdapterKind::Discrete)
            .map(|adapter| Box::new(adapter) as Box<dyn GfxAdapter>)
            .collect())
    }

    fn report_live_objects(&self) {
        log::info!("vulkan live devices: {}", self.core.live_devices.load(Ordering::Relaxed));
    }
}

pub struct VulkanAdapter {
    core: Arc<VulkanCore>,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    info: AdapterInfo,
}

impl GfxAdapter for VulkanAdapter {
    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn create_device(&self, flags: DeviceFlags) -> GfxResult<Box<dyn GfxDevice>> {
        log::info!("creating vulkan device on {} ({:?})", self.info.name, flags);
        let device = VulkanDevice::new(self.core.clone(), self.physical_device, self.queue_family, self.info.clone(), flags)?;
        Ok(Box::new(device))
    }
}
