//! 输入文件收集与模型主目录定位.

use std::env;
use std::io;
use std::path::{Path, PathBuf};

use bone_berry::naming;
use bone_berry::LabeledVolume;
use log::debug;

/// 获取模型主目录.
///
/// 1. 若环境变量 `$SKELLYTOUR_HOME` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/.skellytour`;
/// 3. 无法确定用户主目录时返回 `None`.
pub fn model_home_from_env_or_home() -> Option<PathBuf> {
    match env::var(crate::MODEL_HOME_ENV) {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => crate::home_model_dir(),
    }
}

/// 收集输入. `path` 为单个文件时原样返回; 为目录时返回其中所有 nifti 文件 (不递归),
/// 按文件名排序.
///
/// 目录中的隐藏文件和本工具写出的结果 (见 [`naming::is_derived`]) 会被跳过,
/// 因此对同一目录重复运行不会处理上一轮的输出.
pub fn nifti_inputs<P: AsRef<Path>>(path: P) -> io::Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if !path.is_dir() {
        return Ok(vec![path.to_owned()]);
    }
    let mut files = Vec::new();
    for entry in path.read_dir()? {
        let p = entry?.path();
        if !p.is_file() || !naming::is_nifti(&p) || is_hidden(&p) {
            continue;
        }
        if naming::is_derived(&p) {
            debug!("skip derived file {}", p.display());
            continue;
        }
        files.push(p);
    }
    files.sort();
    Ok(files)
}

#[inline]
fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
}

/// 按顺序逐个打开一组 nifti 文件的加载器.
#[derive(Debug)]
pub struct VolumeLoader {
    paths_rev: Vec<PathBuf>,
}

impl VolumeLoader {
    /// 由一组路径创建加载器.
    pub fn new<I: IntoIterator<Item = PathBuf>>(paths: I) -> Self {
        let mut paths_rev: Vec<PathBuf> = paths.into_iter().collect();
        paths_rev.reverse();
        Self { paths_rev }
    }

    /// 收集 `path` 下的所有输入 (见 [`nifti_inputs`]) 并创建加载器.
    pub fn from_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::new(nifti_inputs(path)?))
    }
}

impl Iterator for VolumeLoader {
    type Item = (PathBuf, bone_berry::Result<LabeledVolume>);

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.paths_rev.pop()?;
        let data = LabeledVolume::open(&path);
        Some((path, data))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.paths_rev.len(), Some(self.paths_rev.len()))
    }
}

impl ExactSizeIterator for VolumeLoader {}
