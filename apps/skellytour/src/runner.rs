//! 程序运行函数.

use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use bone_berry::naming;
use bone_berry::post_proc::{self, ModelKind, PostprocessReport, SubsegConfig};
use log::{error, info};

use crate::config::{CasePaths, PipelineConfig};
use crate::models::ModelSpec;
use crate::predict::{PredictRequest, Predictor};
use crate::result::RunResult;

/// 流水线的各个阶段.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// 骨骼分割预测.
    Predict,
    /// 连通域后处理.
    Postprocess,
    /// 子分割预测.
    SubsegPredict,
    /// 子分割修复.
    Reconcile,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Predict => "prediction",
            Self::Postprocess => "postprocessing",
            Self::SubsegPredict => "subsegmentation",
            Self::Reconcile => "subsegmentation repair",
        })
    }
}

/// 阶段的执行情况.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StageStatus {
    /// 本次运行产生了输出.
    Done,
    /// 输出已存在, 未覆盖.
    Skipped,
}

/// 单个病例的运行记录.
#[derive(Debug)]
pub struct CaseReport {
    /// 各阶段的文件.
    pub paths: CasePaths,
    /// 实际经过的阶段.
    pub stages: Vec<(Stage, StageStatus)>,
    /// 本次运行的后处理统计.
    pub postprocess: Option<PostprocessReport>,
    /// 用时.
    pub elapsed: Duration,
}

impl CaseReport {
    fn new(paths: CasePaths) -> Self {
        Self {
            paths,
            stages: Vec::with_capacity(4),
            postprocess: None,
            elapsed: Duration::ZERO,
        }
    }

    /// 阶段 `stage` 的执行情况. 未经过时返回 `None`.
    pub fn status(&self, stage: Stage) -> Option<StageStatus> {
        self.stages
            .iter()
            .find_map(|(s, status)| (*s == stage).then_some(*status))
    }

    /// 若 `output` 已存在且不允许覆盖, 记录跳过并返回 `true`.
    fn skip(&mut self, stage: Stage, output: &Path, overwrite: bool) -> bool {
        let skip = !overwrite && output.exists();
        if skip {
            info!("{stage} output already exists: {}", output.display());
            self.stages.push((stage, StageStatus::Skipped));
        }
        skip
    }
}

/// 对一个病例运行完整流水线: 预测, 后处理, 子分割预测, 子分割修复.
///
/// 各阶段的输出已存在且 `config.overwrite` 为 `false` 时跳过该阶段.
/// 后处理由 `config.postprocess` 控制; 子分割只在后处理结果存在时运行.
pub fn run_case<P: Predictor + ?Sized>(
    input: &Path,
    config: &PipelineConfig,
    predictor: &P,
) -> Result<CaseReport> {
    config.validate()?;
    let start = Instant::now();
    let mut report = CaseReport::new(config.paths(input));
    let paths = report.paths.clone();

    if !report.skip(Stage::Predict, &paths.segmentation, config.overwrite) {
        info!("Performing {} prediction on {}", config.model, input.display());
        let mut request =
            PredictRequest::new(input, ModelSpec::of(config.model), &paths.segmentation);
        request.folds = config.folds.clone();
        predictor.predict(&request)?;
        info!("Prediction complete, output is: {}", paths.segmentation.display());
        report.stages.push((Stage::Predict, StageStatus::Done));
    }

    if config.postprocess
        && !report.skip(Stage::Postprocess, &paths.postprocessed, config.overwrite)
    {
        info!("Performing postprocessing");
        let pp = post_proc_file(&paths.segmentation, &paths.postprocessed, config.model)
            .with_context(|| format!("cannot postprocess {}", paths.segmentation.display()))?;
        info!(
            "Postprocessing complete, output is: {}",
            paths.postprocessed.display()
        );
        report.postprocess = Some(pp);
        report.stages.push((Stage::Postprocess, StageStatus::Done));
    }

    if config.subseg && paths.postprocessed.exists() {
        if !report.skip(Stage::Reconcile, &paths.subseg, config.overwrite) {
            if !report.skip(Stage::SubsegPredict, &paths.subseg_raw, config.overwrite) {
                info!("Performing subsegmentation");
                let mut request = PredictRequest::new(
                    &paths.postprocessed,
                    ModelSpec::of(ModelKind::Subseg),
                    &paths.subseg_raw,
                );
                request.folds = config.folds.clone();
                predictor.predict(&request)?;
                report.stages.push((Stage::SubsegPredict, StageStatus::Done));
            }

            let subseg = SubsegConfig::for_model(config.model)?;
            reconcile_file(&paths.subseg_raw, &paths.postprocessed, &paths.subseg, &subseg)
                .with_context(|| format!("cannot repair {}", paths.subseg_raw.display()))?;
            info!(
                "Subsegmentation complete, output is: {}",
                paths.subseg.display()
            );
            report.stages.push((Stage::Reconcile, StageStatus::Done));
        }
    } else if config.subseg {
        info!(
            "Subsegmentation needs {}, skipped",
            paths.postprocessed.display()
        );
    }

    report.elapsed = start.elapsed();
    Ok(report)
}

/// 依次对 `inputs` 运行流水线. 失败的病例记录错误后继续.
///
/// 推理通常独占 GPU, 因此这里不并行.
pub fn run_cases<P: Predictor + ?Sized>(
    inputs: &[PathBuf],
    config: &PipelineConfig,
    predictor: &P,
) -> RunResult {
    inputs
        .iter()
        .map(|input| {
            let r = run_case(input, config, predictor);
            if let Err(e) = &r {
                error!("{}: {e:#}", input.display());
            }
            (input.clone(), r)
        })
        .collect()
}

/// 独立后处理时的输出路径: 指定 `out_dir` 时放在其中, 否则与输入同目录.
pub fn postprocess_output(input: &Path, out_dir: Option<&Path>) -> PathBuf {
    match out_dir {
        Some(dir) => naming::postprocessed_path(input, dir),
        None => naming::sibling_with_suffix(input, bone_berry::consts::POSTPROCESSED_SUFFIX),
    }
}

/// 对已有的分割结果 `input` 做后处理.
pub fn postprocess_case(
    input: &Path,
    out_dir: Option<&Path>,
    model: ModelKind,
    overwrite: bool,
) -> Result<CaseReport> {
    let start = Instant::now();
    let output = postprocess_output(input, out_dir);
    let mut report = CaseReport::new(CasePaths {
        segmentation: input.to_owned(),
        postprocessed: output.clone(),
        subseg_raw: PathBuf::new(),
        subseg: PathBuf::new(),
    });
    if !report.skip(Stage::Postprocess, &output, overwrite) {
        let pp = post_proc_file(input, &output, model)
            .with_context(|| format!("cannot postprocess {}", input.display()))?;
        info!("{} -> {}", input.display(), output.display());
        report.postprocess = Some(pp);
        report.stages.push((Stage::Postprocess, StageStatus::Done));
    }
    report.elapsed = start.elapsed();
    Ok(report)
}

/// 以至多 `jobs` 个线程批量后处理. 每个线程依次处理若干病例, 病例之间不共享数据.
pub fn postprocess_cases(
    inputs: &[PathBuf],
    out_dir: Option<&Path>,
    model: ModelKind,
    overwrite: bool,
    jobs: usize,
) -> RunResult {
    if inputs.is_empty() {
        return RunResult::default();
    }
    let chunk = inputs.len().div_ceil(jobs.max(1));
    thread::scope(|s| {
        let handles: Vec<_> = inputs
            .chunks(chunk)
            .map(|part| {
                s.spawn(move || {
                    part.iter()
                        .map(|input| {
                            let r = postprocess_case(input, out_dir, model, overwrite);
                            if let Err(e) = &r {
                                error!("{}: {e:#}", input.display());
                            }
                            (input.clone(), r)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .zip(inputs.chunks(chunk))
            .flat_map(|(th, part)| {
                th.join().unwrap_or_else(|_| {
                    part.iter()
                        .map(|p| (p.clone(), Err(anyhow!("worker thread panicked"))))
                        .collect()
                })
            })
            .collect()
    })
}

/// 单个文件的后处理. 启用 `rayon` 时各标签并行.
fn post_proc_file(input: &Path, output: &Path, model: ModelKind) -> Result<PostprocessReport> {
    Ok(post_proc::postprocess_file(
        input,
        output,
        model.label_classes()?,
    )?)
}

/// 单个文件的子分割修复.
pub fn reconcile_file(raw: &Path, bone: &Path, output: &Path, config: &SubsegConfig) -> Result<()> {
    post_proc::reconcile_files(raw, bone, output, config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bone_berry::consts::subseg::{CORTICAL, TRABECULAR};
    use bone_berry::LabeledVolume;
    use ndarray::{s, Array3};
    use std::sync::Mutex;

    /// 按模型写出固定合成结果的推理后端.
    #[derive(Default)]
    struct FakePredictor {
        calls: Mutex<Vec<ModelKind>>,
    }

    impl FakePredictor {
        fn calls(&self) -> Vec<ModelKind> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Predictor for FakePredictor {
        fn predict(&self, request: &PredictRequest) -> Result<()> {
            self.calls.lock().unwrap().push(request.model.kind);
            let data = match request.model.kind {
                ModelKind::Subseg => Array3::from_elem((8, 8, 8), TRABECULAR),
                _ => {
                    // 股骨 (标签 4) 一大一小两块.
                    let mut seg = Array3::<u8>::zeros((8, 8, 8));
                    seg.slice_mut(s![1..5, 1..5, 1..5]).fill(4);
                    seg[(7, 7, 7)] = 4;
                    seg
                }
            };
            LabeledVolume::fake(data, [1.0, 1.0, 1.0])?.save(&request.output)?;
            Ok(())
        }
    }

    /// 总是失败的推理后端.
    struct Broken;

    impl Predictor for Broken {
        fn predict(&self, request: &PredictRequest) -> Result<()> {
            Err(anyhow!("no GPU for {}", request.input.display()))
        }
    }

    fn config_in(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            out_dir: dir.to_owned(),
            subseg: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_full_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("ct.nii.gz");
        let config = config_in(dir.path());
        let predictor = FakePredictor::default();

        let report = run_case(&input, &config, &predictor).unwrap();
        assert_eq!(predictor.calls(), vec![ModelKind::Medium, ModelKind::Subseg]);
        for stage in [
            Stage::Predict,
            Stage::Postprocess,
            Stage::SubsegPredict,
            Stage::Reconcile,
        ] {
            assert_eq!(report.status(stage), Some(StageStatus::Done));
        }
        let pp = report.postprocess.as_ref().unwrap();
        assert_eq!(pp.label(4).unwrap().islands_kept, 1);
        assert_eq!(pp.voxels_removed(), 1);

        let paths = &report.paths;
        let cleaned = LabeledVolume::open(&paths.postprocessed).unwrap();
        assert_eq!(cleaned.count(4), 64);
        let fixed = LabeledVolume::open(&paths.subseg).unwrap();
        assert_eq!(fixed.count(TRABECULAR) + fixed.count(CORTICAL), 64);
        assert_eq!(fixed.count(TRABECULAR), 8);
    }

    #[test]
    fn test_existing_outputs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("ct.nii.gz");
        let mut config = config_in(dir.path());
        let predictor = FakePredictor::default();
        run_case(&input, &config, &predictor).unwrap();

        let again = run_case(&input, &config, &predictor).unwrap();
        assert_eq!(predictor.calls().len(), 2);
        assert_eq!(again.status(Stage::Predict), Some(StageStatus::Skipped));
        assert_eq!(again.status(Stage::Postprocess), Some(StageStatus::Skipped));
        assert_eq!(again.status(Stage::Reconcile), Some(StageStatus::Skipped));
        assert_eq!(again.status(Stage::SubsegPredict), None);

        config.overwrite = true;
        let forced = run_case(&input, &config, &predictor).unwrap();
        assert_eq!(predictor.calls().len(), 4);
        assert_eq!(forced.status(Stage::Reconcile), Some(StageStatus::Done));
    }

    #[test]
    fn test_subseg_needs_postprocessing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("ct.nii.gz");
        let config = PipelineConfig {
            postprocess: false,
            ..config_in(dir.path())
        };
        let predictor = FakePredictor::default();

        let report = run_case(&input, &config, &predictor).unwrap();
        assert_eq!(predictor.calls(), vec![ModelKind::Medium]);
        assert_eq!(report.status(Stage::Postprocess), None);
        assert_eq!(report.status(Stage::Reconcile), None);
        assert!(!report.paths.subseg.exists());
    }

    #[test]
    fn test_failed_case_does_not_stop_batch() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = vec![dir.path().join("a.nii.gz"), dir.path().join("b.nii.gz")];
        let result = run_cases(&inputs, &config_in(dir.path()), &Broken);
        assert_eq!(result.len(), 2);
        assert_eq!(result.failed(), 2);
        assert!(!dir.path().join("a_postprocessed.nii.gz").exists());
    }

    #[test]
    fn test_postprocess_cases() {
        let dir = tempfile::tempdir().unwrap();
        let predictor = FakePredictor::default();
        let mut inputs = Vec::new();
        for name in ["a", "b", "c"] {
            let path = dir.path().join(format!("{name}.nii.gz"));
            let request = PredictRequest::new(&path, ModelSpec::of(ModelKind::Low), &path);
            predictor.predict(&request).unwrap();
            inputs.push(path);
        }
        inputs.push(dir.path().join("missing.nii.gz"));

        let result = postprocess_cases(&inputs, None, ModelKind::High, false, 2);
        assert_eq!(result.len(), 4);
        assert_eq!(result.failed(), 1);
        for name in ["a", "b", "c"] {
            let out = dir.path().join(format!("{name}_postprocessed.nii.gz"));
            assert_eq!(LabeledVolume::open(out).unwrap().count(4), 64);
        }

        let again = postprocess_cases(&inputs[..3], None, ModelKind::High, false, 8);
        assert_eq!(again.failed(), 0);
        assert_eq!(again.skipped(Stage::Postprocess), 3);
    }

    #[test]
    fn test_directory_rerun_ignores_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.nii.gz");
        let request = PredictRequest::new(&path, ModelSpec::of(ModelKind::Low), &path);
        FakePredictor::default().predict(&request).unwrap();

        for round in 0..2 {
            let inputs = utils::loader::nifti_inputs(dir.path()).unwrap();
            assert_eq!(inputs, vec![path.clone()]);
            let result = postprocess_cases(&inputs, None, ModelKind::High, false, 2);
            assert_eq!(result.failed(), 0);
            assert_eq!(result.skipped(Stage::Postprocess), round);
        }
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.nii.gz", "a_postprocessed.nii.gz"]);
    }

    #[test]
    fn test_postprocess_output() {
        assert_eq!(
            postprocess_output(Path::new("/seg/x.nii"), None),
            Path::new("/seg/x_postprocessed.nii.gz")
        );
        assert_eq!(
            postprocess_output(Path::new("/seg/x.nii"), Some(Path::new("/out"))),
            Path::new("/out/x_postprocessed.nii.gz")
        );
    }
}
