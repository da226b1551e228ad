use std::path::Path;

use anyhow::Context;
use ember_gfx::basic::extent::Extent2D;
use ember_gfx::foundation::instance::DeviceFlags;
use ember_gfx::swapchain::display_queue::DisplayTarget;
use ember_render_graph::graph::DEFAULT_FAULT_LIMIT;
use ember_render_interface::create_info::RenderCreateInfo;
use serde::{Deserialize, Serialize};

/// `[render]` 配置段
///
/// 只在启动时读取；运行期间的修改通过 [`crate::render_service::RenderService`] 的请求完成。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// 本次会话允许的渲染故障数，达到该值时 render 线程退出
    pub fault_limit: u32,
    pub draw_width: u32,
    pub draw_height: u32,
    pub back_buffer_count: u32,
    pub adapter_index: usize,
    /// 请求队列的容量
    pub queue_size: usize,
    pub allow_tearing: bool,
    pub rtv_heap_size: usize,
    pub dsv_heap_size: usize,
    pub srv_heap_size: usize,
    pub debug: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            fault_limit: DEFAULT_FAULT_LIMIT,
            draw_width: 1920,
            draw_height: 1080,
            back_buffer_count: 2,
            adapter_index: 0,
            queue_size: 64,
            allow_tearing: false,
            rtv_heap_size: 16,
            dsv_heap_size: 16,
            srv_heap_size: 64,
            debug: true,
        }
    }
}

#[derive(Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    render: RenderConfig,
}

// new & init
impl RenderConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = toml::from_str(text)?;
        file.render.validate()?;
        Ok(file.render)
    }

    /// 没有给出路径时使用默认配置
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                log::info!("no render config given, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.fault_limit >= 1, "fault_limit must be at least 1");
        anyhow::ensure!(self.back_buffer_count >= 1, "back_buffer_count must be at least 1");
        anyhow::ensure!(self.queue_size >= 1, "queue_size must be at least 1");
        anyhow::ensure!(
            self.draw_width > 0 && self.draw_height > 0,
            "draw size {}x{} is empty",
            self.draw_width,
            self.draw_height
        );
        Ok(())
    }
}

// tools
impl RenderConfig {
    #[inline]
    pub fn draw_size(&self) -> Extent2D {
        Extent2D::new(self.draw_width, self.draw_height)
    }

    /// 创建 instance 时也需要同样的调试选项
    pub fn device_flags(&self) -> DeviceFlags {
        if self.debug {
            DeviceFlags::DEBUG | DeviceFlags::INFO_QUEUE | DeviceFlags::EXTENDED_INFO
        } else {
            DeviceFlags::empty()
        }
    }

    /// 交换链与内部渲染分辨率都使用 draw size
    pub fn to_create_info(&self, display_target: DisplayTarget) -> RenderCreateInfo {
        let device_flags = self.device_flags();

        RenderCreateInfo {
            display_target,
            adapter_index: self.adapter_index,
            back_buffer_count: self.back_buffer_count,
            display_size: self.draw_size(),
            render_size: self.draw_size(),
            rtv_heap_size: self.rtv_heap_size,
            dsv_heap_size: self.dsv_heap_size,
            srv_heap_size: self.srv_heap_size,
            device_flags,
            allow_tearing: self.allow_tearing,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_use_defaults() {
        let config = RenderConfig::from_toml("[render]\ndraw_width = 640\n").unwrap();
        assert_eq!(config.fault_limit, 3);
        assert_eq!(config.draw_width, 640);
        assert_eq!(config.draw_height, 1080);
        assert_eq!(config.queue_size, 64);

        assert_eq!(RenderConfig::from_toml("").unwrap(), RenderConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(RenderConfig::from_toml("[render]\nfault_limit = 0\n").is_err());
        assert!(RenderConfig::from_toml("[render]\nback_buffer_count = 0\n").is_err());
        assert!(RenderConfig::from_toml("[render]\ndraw_width = \"wide\"\n").is_err());
    }

    #[test]
    fn test_create_info_follows_config() {
        let config = RenderConfig {
            back_buffer_count: 3,
            debug: false,
            draw_width: 800,
            draw_height: 600,
            ..Default::default()
        };
        let create_info = config.to_create_info(DisplayTarget::Headless);
        assert_eq!(create_info.back_buffer_count, 3);
        assert_eq!(create_info.display_size, Extent2D::new(800, 600));
        assert_eq!(create_info.render_size, Extent2D::new(800, 600));
        assert!(create_info.device_flags.is_empty());
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = RenderConfig::from_file(Path::new("/nonexistent/render.toml")).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to read"));
    }
}
