//! 预训练模型登记表与本地模型仓库.
//!
//! 模型按 nnU-Net v1 的目录结构存放:
//! `<home>/results/nnUNet/3d_fullres/<task>/<trainer>__<plans>/fold_<i>/model_final_checkpoint.model(.pkl)`.
//! 本程序不负责下载, 缺失文件时只报告发布地址.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bone_berry::post_proc::ModelKind;
use log::{debug, info};

/// 模型发布地址前缀.
const RELEASE_URL: &str = "https://github.com/cpwardell/Skellytour/releases/download/v0.0.1";

/// 使用的检查点名称.
pub const CHECKPOINT: &str = "model_final_checkpoint";

/// 每个模型的交叉验证折数.
pub const FOLDS: [u8; 5] = [0, 1, 2, 3, 4];

/// 单个预训练模型的描述.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModelSpec {
    /// 模型.
    pub kind: ModelKind,
    /// nnU-Net 任务名.
    pub task: &'static str,
    /// 训练器名.
    pub trainer: &'static str,
    /// 计划名.
    pub plans: &'static str,
    /// 预测时是否启用镜像测试时增强.
    pub mirroring: bool,
}

impl ModelSpec {
    /// 获取 `kind` 的模型描述.
    pub const fn of(kind: ModelKind) -> Self {
        const PLANS: &str = "nnUNetPlansv2.1";
        const NO_MIRRORING: &str = "nnUNetTrainerV2_noMirroring";
        let (task, trainer, mirroring) = match kind {
            ModelKind::Low => ("Task812", NO_MIRRORING, false),
            ModelKind::Medium => ("Task815", NO_MIRRORING, false),
            ModelKind::High => ("Task810", NO_MIRRORING, false),
            ModelKind::Subseg => ("Task850", "nnUNetTrainerV2", true),
        };
        Self {
            kind,
            task,
            trainer,
            plans: PLANS,
            mirroring,
        }
    }

    /// 任务编号, 例如 `Task815` 对应 `815`.
    pub fn task_id(&self) -> &'static str {
        self.task.trim_start_matches("Task")
    }

    /// 训练器目录名, 形如 `<trainer>__<plans>`.
    pub fn trainer_dir(&self) -> String {
        format!("{}__{}", self.trainer, self.plans)
    }

    /// 模型压缩包的下载地址.
    pub fn url(&self) -> String {
        format!("{RELEASE_URL}/{}.zip", self.task)
    }
}

/// 本地模型仓库.
#[derive(Clone, Debug)]
pub struct ModelStore {
    home: PathBuf,
}

impl ModelStore {
    /// 以 `home` 为主目录创建仓库. 不会访问文件系统.
    pub fn new<P: AsRef<Path>>(home: P) -> Self {
        Self {
            home: home.as_ref().to_owned(),
        }
    }

    /// 主目录.
    #[inline]
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// nnU-Net 的 `RESULTS_FOLDER`.
    pub fn results_folder(&self) -> PathBuf {
        self.home.join("results")
    }

    /// 所有 3d_fullres 模型所在的目录.
    pub fn fullres_dir(&self) -> PathBuf {
        self.results_folder().join("nnUNet").join("3d_fullres")
    }

    /// 模型 `spec` 的目录.
    pub fn model_dir(&self, spec: &ModelSpec) -> PathBuf {
        self.fullres_dir().join(spec.task).join(spec.trainer_dir())
    }

    /// 创建主目录及 `results/nnUNet/3d_fullres` 子目录.
    pub fn bootstrap(&self) -> Result<()> {
        let dir = self.fullres_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create model directory {}", dir.display()))?;
        info!("Models are stored here: {}", self.home.display());
        Ok(())
    }

    /// 模型 `spec` 所需的全部检查点文件.
    pub fn checkpoint_files(&self, spec: &ModelSpec) -> Vec<PathBuf> {
        let model_dir = self.model_dir(spec);
        FOLDS
            .iter()
            .flat_map(|fold| {
                let fold_dir = model_dir.join(format!("fold_{fold}"));
                [
                    fold_dir.join(format!("{CHECKPOINT}.model")),
                    fold_dir.join(format!("{CHECKPOINT}.model.pkl")),
                ]
            })
            .collect()
    }

    /// 模型 `spec` 缺失的检查点文件.
    pub fn missing_files(&self, spec: &ModelSpec) -> Vec<PathBuf> {
        self.checkpoint_files(spec)
            .into_iter()
            .filter(|p| !p.is_file())
            .collect()
    }

    /// 确认模型 `spec` 的全部文件就绪, 返回模型目录.
    ///
    /// 缺失文件时返回错误, 错误信息包含下载地址与解压位置.
    pub fn ensure(&self, spec: &ModelSpec) -> Result<PathBuf> {
        let missing = self.missing_files(spec);
        if let Some(first) = missing.first() {
            bail!(
                "{} model ({}) is missing {} file(s), e.g. {}. \
                 Download {} and unzip it into {}",
                spec.kind,
                spec.task,
                missing.len(),
                first.display(),
                spec.url(),
                self.fullres_dir().display()
            );
        }
        let dir = self.model_dir(spec);
        debug!("{} model found at {}", spec.kind, dir.display());
        Ok(dir)
    }
}
