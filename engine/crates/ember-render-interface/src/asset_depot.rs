//! 资源加载接口
//!
//! 渲染层在创建 pass / handle 时同步地从 depot 读取 shader 与图片。

use std::collections::HashMap;
use std::path::PathBuf;

use crate::render_error::{RenderError, RenderResult};

/// 解码后的 RGBA8 图片
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    /// 紧密排列的 RGBA8 像素
    pub pixels: Vec<u8>,
}

impl Image {
    /// 单色图片
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = rgba.iter().copied().cycle().take(width as usize * height as usize * 4).collect();
        Self { width, height, pixels }
    }
}

pub trait AssetDepot: Send {
    fn load_blob(&self, name: &str) -> RenderResult<Vec<u8>>;

    fn load_image(&self, name: &str) -> RenderResult<Image>;
}

/// 从磁盘目录读取资源，图片通过 `image` crate 解码为 RGBA8
pub struct FileDepot {
    root: PathBuf,
}

impl FileDepot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetDepot for FileDepot {
    fn load_blob(&self, name: &str) -> RenderResult<Vec<u8>> {
        let path = self.root.join(name);
        std::fs::read(&path).map_err(|e| RenderError::asset(path.display().to_string(), e))
    }

    fn load_image(&self, name: &str) -> RenderResult<Image> {
        let path = self.root.join(name);
        let img = image::ImageReader::open(&path)
            .map_err(|e| RenderError::asset(name, e))?
            .decode()
            .map_err(|e| RenderError::asset(name, e))?
            .into_rgba8();

        Ok(Image {
            width: img.width(),
            height: img.height(),
            pixels: img.into_raw(),
        })
    }
}

/// 内存中的资源表，用于测试与 headless 运行
#[derive(Default)]
pub struct MemoryDepot {
    blobs: HashMap<String, Vec<u8>>,
    images: HashMap<String, Image>,
}

impl MemoryDepot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.blobs.insert(name.into(), data);
        self
    }

    pub fn with_image(mut self, name: impl Into<String>, image: Image) -> Self {
        self.images.insert(name.into(), image);
        self
    }
}

impl AssetDepot for MemoryDepot {
    fn load_blob(&self, name: &str) -> RenderResult<Vec<u8>> {
        self.blobs.get(name).cloned().ok_or_else(|| RenderError::asset(name, "no such blob"))
    }

    fn load_image(&self, name: &str) -> RenderResult<Image> {
        self.images.get(name).cloned().ok_or_else(|| RenderError::asset(name, "no such image"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_depot_lookup() {
        let depot = MemoryDepot::new()
            .with_blob("blit.vs", vec![1, 2, 3])
            .with_image("white", Image::solid(2, 2, [255; 4]));

        assert_eq!(depot.load_blob("blit.vs").unwrap(), vec![1, 2, 3]);
        assert_eq!(depot.load_image("white").unwrap().pixels.len(), 16);

        let err = depot.load_blob("missing.ps").unwrap_err();
        assert!(matches!(err, RenderError::Asset { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_file_depot_missing_file() {
        let depot = FileDepot::new(std::env::temp_dir().join("ember-depot-missing"));
        assert!(depot.load_blob("nothing.bin").is_err());
        assert!(depot.load_image("nothing.png").is_err());
    }
}
