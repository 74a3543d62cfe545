//! 外部神经网络推理.
//!
//! 推理本身完全交给 nnU-Net v1 的 `nnUNet_predict` 命令. 这里只负责准备输入目录,
//! 传入显式的环境变量, 并把结果移动到期望的位置.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use bone_berry::naming;
use log::{debug, info};
use tempfile::NamedTempFile;
use xshell::Shell;

use crate::models::{ModelSpec, ModelStore, CHECKPOINT, FOLDS};

/// 一次推理请求.
#[derive(Clone, Debug)]
pub struct PredictRequest {
    /// 输入 nifti 文件.
    pub input: PathBuf,
    /// 使用的模型.
    pub model: ModelSpec,
    /// 使用的交叉验证折.
    pub folds: Vec<u8>,
    /// 预测结果的输出路径.
    pub output: PathBuf,
}

impl PredictRequest {
    /// 使用模型 `model` 的全部折, 将 `input` 的预测写到 `output`.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(input: P, model: ModelSpec, output: Q) -> Self {
        Self {
            input: input.as_ref().to_owned(),
            model,
            folds: FOLDS.to_vec(),
            output: output.as_ref().to_owned(),
        }
    }
}

/// 推理后端: 给定请求, 在 `request.output` 处产生一个标签体数据.
pub trait Predictor: Sync {
    /// 执行推理. 成功时 `request.output` 必须已经存在.
    fn predict(&self, request: &PredictRequest) -> Result<()>;
}

/// 以子进程方式调用 `nnUNet_predict`.
#[derive(Clone, Debug)]
pub struct NnUnetCommand {
    /// 可执行文件名或路径.
    pub program: String,
    /// 模型仓库, 决定 `RESULTS_FOLDER` 等环境变量.
    pub store: ModelStore,
}

impl NnUnetCommand {
    /// 使用 `PATH` 中的 `nnUNet_predict`.
    pub fn new(store: ModelStore) -> Self {
        Self {
            program: "nnUNet_predict".to_owned(),
            store,
        }
    }

    /// 命令行参数 (不含输入输出目录).
    fn model_args(&self, request: &PredictRequest) -> Vec<String> {
        let spec = &request.model;
        let mut args: Vec<String> = [
            "-t",
            spec.task_id(),
            "-m",
            "3d_fullres",
            "-tr",
            spec.trainer,
            "-p",
            spec.plans,
            "-chk",
            CHECKPOINT,
            "--num_threads_preprocessing",
            "2",
            "--num_threads_nifti_save",
            "2",
        ]
        .map(String::from)
        .to_vec();
        args.push("-f".to_owned());
        args.extend(request.folds.iter().map(u8::to_string));
        if !spec.mirroring {
            args.push("--disable_tta".to_owned());
        }
        args
    }
}

impl Predictor for NnUnetCommand {
    fn predict(&self, request: &PredictRequest) -> Result<()> {
        self.store.ensure(&request.model)?;
        let case = naming::base_name(&request.input);
        let staging = tempfile::tempdir().context("cannot create staging directory")?;
        let (in_dir, out_dir) = (staging.path().join("in"), staging.path().join("out"));
        fs::create_dir_all(&in_dir)?;
        fs::create_dir_all(&out_dir)?;

        // nnU-Net 要求输入文件名带有模态编号后缀.
        let staged = in_dir.join(format!("{case}_0000.nii.gz"));
        fs::copy(&request.input, &staged)
            .with_context(|| format!("cannot stage {}", request.input.display()))?;

        let home = self.store.home();
        let sh = Shell::new()?;
        let program = &self.program;
        let args = self.model_args(request);
        info!(
            "Running {program} with {} ({} fold(s))",
            request.model.task,
            request.folds.len()
        );
        sh.cmd(program)
            .arg("-i")
            .arg(&in_dir)
            .arg("-o")
            .arg(&out_dir)
            .args(args)
            .env("RESULTS_FOLDER", self.store.results_folder())
            .env("nnUNet_raw_data_base", home)
            .env("nnUNet_preprocessed", home)
            .run()
            .with_context(|| format!("{program} failed on {}", request.input.display()))?;

        let produced = out_dir.join(format!("{case}.nii.gz"));
        ensure!(
            produced.is_file(),
            "{program} did not produce {}",
            produced.display()
        );
        move_file(&produced, &request.output)?;
        debug!("Prediction written to {}", request.output.display());
        Ok(())
    }
}

/// 移动文件. 跨文件系统时先复制到 `to` 所在目录的临时文件, 再改名,
/// 因此 `to` 要么完整, 要么不存在.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let dir = match to.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("cannot create a temporary file in {}", dir.display()))?;
    let mut src = fs::File::open(from).with_context(|| format!("cannot read {}", from.display()))?;
    io::copy(&mut src, tmp.as_file_mut())
        .with_context(|| format!("cannot write {}", to.display()))?;
    tmp.persist(to)
        .map_err(|e| e.error)
        .with_context(|| format!("cannot write {}", to.display()))?;
    Ok(())
}
