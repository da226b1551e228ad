use std::path::{Path, PathBuf};

/// 统一路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导）。
///
/// # 使用示例
/// ```ignore
/// let config = EmberPath::config_path("render.toml"); // config/render.toml
/// let shader = EmberPath::assets_path("blit.vs.spv");  // assets/blit.vs.spv
/// ```
pub struct EmberPath {}
// 核心路径
impl EmberPath {
    /// 获取工作区根目录
    pub fn workspace_path() -> PathBuf {
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.parent().map(Path::to_path_buf).unwrap_or_else(|| manifest_dir.to_path_buf())
    }

    pub fn target_path() -> PathBuf {
        Self::workspace_path().join("target")
    }
}
// 根目录下
impl EmberPath {
    /// 获取 `assets/` 目录下的文件路径
    pub fn assets_path(filename: &str) -> PathBuf {
        Self::assets_root().join(filename)
    }

    pub fn assets_root() -> PathBuf {
        Self::workspace_path().join("assets")
    }

    /// 获取 `config/` 目录下的文件路径
    pub fn config_path(filename: &str) -> PathBuf {
        Self::workspace_path().join("config").join(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_rooted_in_workspace() {
        let root = EmberPath::workspace_path();
        assert!(EmberPath::assets_path("a.png").starts_with(&root));
        assert!(EmberPath::config_path("render.toml").ends_with("config/render.toml"));
    }
}
