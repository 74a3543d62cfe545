//! 输出文件命名约定.
//!
//! 对于输入 `<dir>/<base>.nii.gz` (或 `.nii`) 和输出目录 `out`:
//!
//! | 阶段 | 文件 |
//! |---|---|
//! | 模型预测 | `out/<base>.nii.gz` |
//! | 后处理 | `out/<base>_postprocessed.nii.gz` |
//! | 子分割原始预测 | `out/<base>_postprocessed_subseg_raw.nii.gz` |
//! | 子分割修复 | `out/<base>_postprocessed_subseg.nii.gz` |

use std::path::{Path, PathBuf};

use crate::consts::{NII, NII_GZ, POSTPROCESSED_SUFFIX, SUBSEG_SUFFIX};

/// 子分割原始预测的附加后缀.
const RAW_SUFFIX: &str = "_raw";

/// 获取不含目录和 nifti 扩展名的文件名.
///
/// 只去掉 `.nii.gz` 或 `.nii`; 其它扩展名保持原样.
pub fn base_name<P: AsRef<Path>>(path: P) -> String {
    let name = path
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(NII_GZ)
        .or_else(|| name.strip_suffix(NII))
        .unwrap_or(&name)
        .to_owned()
}

/// 文件名是否带有 nifti 扩展名?
pub fn is_nifti<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .file_name()
        .map(|n| n.to_string_lossy())
        .is_some_and(|n| n.ends_with(NII_GZ) || n.ends_with(NII))
}

/// 文件名是否是本工具写出的中间或最终结果 (后处理, 子分割原始预测, 子分割修复)?
///
/// 按目录批量处理时, 这些文件不应再被当作输入.
pub fn is_derived<P: AsRef<Path>>(path: P) -> bool {
    let base = base_name(path);
    base.ends_with(POSTPROCESSED_SUFFIX)
        || base.ends_with(SUBSEG_SUFFIX)
        || base
            .strip_suffix(RAW_SUFFIX)
            .is_some_and(|b| b.ends_with(SUBSEG_SUFFIX))
}

#[inline]
fn join(out_dir: &Path, base: &str, suffixes: &[&str]) -> PathBuf {
    let mut name = String::from(base);
    suffixes.iter().for_each(|s| name.push_str(s));
    name.push_str(NII_GZ);
    out_dir.join(name)
}

/// 模型预测结果的路径.
pub fn segmentation_path<P: AsRef<Path>, Q: AsRef<Path>>(input: P, out_dir: Q) -> PathBuf {
    join(out_dir.as_ref(), &base_name(input), &[])
}

/// 后处理结果的路径.
pub fn postprocessed_path<P: AsRef<Path>, Q: AsRef<Path>>(input: P, out_dir: Q) -> PathBuf {
    join(out_dir.as_ref(), &base_name(input), &[POSTPROCESSED_SUFFIX])
}

/// 子分割原始预测的路径.
pub fn subseg_raw_path<P: AsRef<Path>, Q: AsRef<Path>>(input: P, out_dir: Q) -> PathBuf {
    join(
        out_dir.as_ref(),
        &base_name(input),
        &[POSTPROCESSED_SUFFIX, SUBSEG_SUFFIX, RAW_SUFFIX],
    )
}

/// 子分割修复结果的路径.
pub fn subseg_path<P: AsRef<Path>, Q: AsRef<Path>>(input: P, out_dir: Q) -> PathBuf {
    join(
        out_dir.as_ref(),
        &base_name(input),
        &[POSTPROCESSED_SUFFIX, SUBSEG_SUFFIX],
    )
}

/// 与 `input` 位于同一目录, 名称附加 `suffix` 的 nii.gz 路径.
pub fn sibling_with_suffix<P: AsRef<Path>>(input: P, suffix: &str) -> PathBuf {
    let input = input.as_ref();
    let dir = input.parent().unwrap_or_else(|| Path::new(""));
    join(dir, &base_name(input), &[suffix])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/data/ct/case_001.nii.gz"), "case_001");
        assert_eq!(base_name("case_002.nii"), "case_002");
        assert_eq!(base_name("scan.v2.nii.gz"), "scan.v2");
        assert_eq!(base_name("notes.txt"), "notes.txt");
        assert_eq!(base_name("/"), "");
    }

    #[test]
    fn test_is_nifti() {
        assert!(is_nifti("a/b.nii.gz"));
        assert!(is_nifti("b.nii"));
        assert!(!is_nifti("b.nrrd"));
        assert!(!is_nifti("/"));
    }

    #[test]
    fn test_is_derived() {
        let input = "/in/case.nii.gz";
        assert!(!is_derived(input));
        assert!(!is_derived(segmentation_path(input, "/out")));
        assert!(is_derived(postprocessed_path(input, "/out")));
        assert!(is_derived(subseg_raw_path(input, "/out")));
        assert!(is_derived(subseg_path(input, "/out")));
        assert!(is_derived(sibling_with_suffix(input, SUBSEG_SUFFIX)));
        assert!(is_derived("case_subseg_raw.nii"));
        // 只看后缀, 名称中间出现的片段不算.
        assert!(!is_derived("case_postprocessed_v2.nii.gz"));
        assert!(!is_derived("case_raw.nii.gz"));
    }

    #[test]
    fn test_output_paths() {
        let input = "/in/case.nii";
        assert_eq!(segmentation_path(input, "/out"), Path::new("/out/case.nii.gz"));
        assert_eq!(
            postprocessed_path(input, "/out"),
            Path::new("/out/case_postprocessed.nii.gz")
        );
        assert_eq!(
            subseg_raw_path(input, "/out"),
            Path::new("/out/case_postprocessed_subseg_raw.nii.gz")
        );
        assert_eq!(
            subseg_path(input, "/out"),
            Path::new("/out/case_postprocessed_subseg.nii.gz")
        );
        assert_eq!(
            sibling_with_suffix("/seg/case.nii.gz", POSTPROCESSED_SUFFIX),
            Path::new("/seg/case_postprocessed.nii.gz")
        );
        assert_eq!(
            sibling_with_suffix("case.nii.gz", SUBSEG_SUFFIX),
            Path::new("case_subseg.nii.gz")
        );
    }
}
