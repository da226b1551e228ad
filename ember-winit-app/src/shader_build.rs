use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;

/// 一个具体的编译任务
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderBuildTask {
    pub source: PathBuf,
    pub output: PathBuf,
}

/// `mesh.vert` -> `mesh.vs.spv`，`blit.frag` -> `blit.ps.spv`，其余扩展名返回 None
pub fn output_name(source: &Path) -> Option<String> {
    let stem = source.file_stem()?.to_str()?;
    let stage = match source.extension()?.to_str()? {
        "vert" => "vs",
        "frag" => "ps",
        _ => return None,
    };
    Some(format!("{}.{}.spv", stem, stage))
}

/// 遍历 `src_dir`，输出文件放在 `out_dir` 下
pub fn collect_tasks(src_dir: &Path, out_dir: &Path) -> Vec<ShaderBuildTask> {
    walkdir::WalkDir::new(src_dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let output = out_dir.join(output_name(entry.path())?);
            Some(ShaderBuildTask {
                source: entry.into_path(),
                output,
            })
        })
        .collect()
}

/// 使用 glslc (来自 Vulkan SDK) 编译
pub fn compile(task: &ShaderBuildTask) -> anyhow::Result<()> {
    let output = Command::new("glslc")
        .arg("-g")
        .arg("--target-env=vulkan1.3")
        .arg("-o")
        .arg(&task.output)
        .arg(&task.source)
        .output()
        .context("failed to execute glslc")?;

    if !output.stdout.is_empty() {
        log::info!("stdout: {}", String::from_utf8_lossy(&output.stdout));
    }
    if !output.status.success() {
        anyhow::bail!("{}: {}", task.source.display(), String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_name_follows_stage() {
        assert_eq!(output_name(Path::new("shaders/mesh.vert")).as_deref(), Some("mesh.vs.spv"));
        assert_eq!(output_name(Path::new("blit.frag")).as_deref(), Some("blit.ps.spv"));
        assert_eq!(output_name(Path::new("common.glsl")), None);
        assert_eq!(output_name(Path::new("README")), None);
    }

    #[test]
    fn test_collect_tasks_skips_unknown_files() {
        let dir = std::env::temp_dir().join(format!("ember-shader-build-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("a.vert"), "").unwrap();
        std::fs::write(dir.join("nested/b.frag"), "").unwrap();
        std::fs::write(dir.join("notes.txt"), "").unwrap();

        let out = Path::new("out");
        let mut outputs = collect_tasks(&dir, out).into_iter().map(|t| t.output).collect::<Vec<_>>();
        outputs.sort();
        assert_eq!(outputs, vec![out.join("a.vs.spv"), out.join("b.ps.spv")]);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
