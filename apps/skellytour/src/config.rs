//! 单个病例的流水线配置.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Result};
use bone_berry::naming;
use bone_berry::post_proc::ModelKind;

use crate::models::FOLDS;

/// 一次流水线运行的选项.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// 骨骼分割模型. 不能是 [`ModelKind::Subseg`].
    pub model: ModelKind,
    /// 输出目录.
    pub out_dir: PathBuf,
    /// 是否覆盖已存在的输出.
    pub overwrite: bool,
    /// 是否对预测结果做后处理.
    pub postprocess: bool,
    /// 是否运行皮质/松质子分割.
    pub subseg: bool,
    /// 使用的交叉验证折.
    pub folds: Vec<u8>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::Medium,
            out_dir: PathBuf::from("."),
            overwrite: false,
            postprocess: true,
            subseg: false,
            folds: FOLDS.to_vec(),
        }
    }
}

impl PipelineConfig {
    /// 检查选项组合是否合法.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.model != ModelKind::Subseg,
            "`{}` is not a bone segmentation model",
            self.model
        );
        ensure!(!self.folds.is_empty(), "at least one fold is required");
        ensure!(
            self.folds.iter().all(|f| FOLDS.contains(f)),
            "folds must be within {FOLDS:?}, got {:?}",
            self.folds
        );
        Ok(())
    }

    /// 输入 `input` 对应的各阶段输出路径.
    pub fn paths<P: AsRef<Path>>(&self, input: P) -> CasePaths {
        let (input, out) = (input.as_ref(), self.out_dir.as_path());
        CasePaths {
            segmentation: naming::segmentation_path(input, out),
            postprocessed: naming::postprocessed_path(input, out),
            subseg_raw: naming::subseg_raw_path(input, out),
            subseg: naming::subseg_path(input, out),
        }
    }
}

/// 单个病例在各阶段的文件.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CasePaths {
    pub segmentation: PathBuf,
    pub postprocessed: PathBuf,
    pub subseg_raw: PathBuf,
    pub subseg: PathBuf,
}
