//! CT 骨骼分割命令行工具.
//!
//! # 命令
//!
//! - `skellytour run -i <ct>` - 预测, 后处理, (可选) 子分割
//! - `skellytour postprocess -i <seg>` - 只对已有分割结果做后处理
//! - `skellytour reconcile --raw <subseg> --bone <seg>` - 只做子分割修复
//! - `skellytour info -i <nifti>` - 查看体数据的几何信息与标签
//! - `skellytour models` - 检查本地模型仓库

mod config;
mod models;
mod predict;
mod result;
mod runner;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use bone_berry::post_proc::{ModelKind, SubsegConfig};
use bone_berry::NiftiHeaderAttr;
use clap::{ArgAction, Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use utils::loader::{self, VolumeLoader};

use crate::config::PipelineConfig;
use crate::models::{ModelSpec, ModelStore, FOLDS};
use crate::predict::NnUnetCommand;

/// CT 骨骼分割与后处理
#[derive(Parser)]
#[command(name = "skellytour")]
#[command(about = "Bone segmentation of CT scans with connected-component postprocessing", long_about = None)]
#[command(version)]
struct Cli {
    /// More output (-v: debug, -vv: trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment CT scans: predict, postprocess and optionally subsegment
    Run {
        /// Input CT scan (.nii/.nii.gz) or a directory of scans
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Model: low, medium or high
        #[arg(short, long, default_value = "medium")]
        model: ModelKind,

        /// Overwrite existing outputs
        #[arg(long)]
        overwrite: bool,

        /// Do not postprocess the segmentation
        #[arg(long)]
        nopp: bool,

        /// Assign trabecular and cortical labels
        #[arg(long)]
        subseg: bool,

        /// Model folds to ensemble
        #[arg(short, long, num_args = 1.., default_values_t = FOLDS)]
        folds: Vec<u8>,

        /// Model home (defaults to $SKELLYTOUR_HOME, then ~/.skellytour)
        #[arg(long)]
        model_home: Option<PathBuf>,

        /// nnU-Net prediction executable
        #[arg(long, default_value = "nnUNet_predict")]
        predictor: String,
    },

    /// Postprocess existing segmentations
    Postprocess {
        /// Segmentation (.nii/.nii.gz) or a directory of segmentations
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory (defaults to next to each input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Model that produced the segmentation
        #[arg(short, long, default_value = "medium")]
        model: ModelKind,

        /// Overwrite existing outputs
        #[arg(long)]
        overwrite: bool,

        /// Worker threads (defaults to the number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Repair a raw subsegmentation against a postprocessed segmentation
    Reconcile {
        /// Raw cortical/trabecular prediction
        #[arg(long)]
        raw: PathBuf,

        /// Postprocessed bone segmentation
        #[arg(long)]
        bone: PathBuf,

        /// Output file (defaults to `<bone>_subseg.nii.gz`)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Model that produced the bone segmentation
        #[arg(short, long, default_value = "medium")]
        model: ModelKind,
    },

    /// Print geometry and labels of label volumes
    Info {
        /// Volume (.nii/.nii.gz) or a directory of volumes
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Check the local model store
    Models {
        /// Model home (defaults to $SKELLYTOUR_HOME, then ~/.skellytour)
        #[arg(long)]
        model_home: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => LevelFilter::Warn,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("cannot install logger: {e}");
    }

    let start = Instant::now();
    info!("Start");
    let code = match dispatch(cli.command) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failed) => {
            error!("{failed} case(s) failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    };
    info!("End, total time taken: {:.3} s", start.elapsed().as_secs_f64());
    code
}

/// 执行子命令, 返回失败的病例数.
fn dispatch(command: Commands) -> Result<usize> {
    match command {
        Commands::Run {
            input,
            output,
            model,
            overwrite,
            nopp,
            subseg,
            folds,
            model_home,
            predictor,
        } => {
            let config = PipelineConfig {
                model,
                out_dir: output,
                overwrite,
                postprocess: !nopp,
                subseg,
                folds,
            };
            config.validate()?;
            std::fs::create_dir_all(&config.out_dir).with_context(|| {
                format!("cannot create output directory {}", config.out_dir.display())
            })?;

            let store = open_store(model_home)?;
            let mut nnunet = NnUnetCommand::new(store);
            nnunet.program = predictor;

            let inputs = collect_inputs(&input)?;
            let result = runner::run_cases(&inputs, &config, &nnunet);
            result.analyze();
            Ok(result.failed())
        }
        Commands::Postprocess {
            input,
            output,
            model,
            overwrite,
            jobs,
        } => {
            // 提前检查, 避免每个病例各报一次.
            model.label_classes()?;
            if let Some(dir) = &output {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("cannot create output directory {}", dir.display()))?;
            }
            let inputs = collect_inputs(&input)?;
            let jobs = jobs.unwrap_or_else(utils::cpus).clamp(1, inputs.len().max(1));
            info!("Postprocessing {} file(s) with {jobs} thread(s)", inputs.len());
            let result = runner::postprocess_cases(&inputs, output.as_deref(), model, overwrite, jobs);
            result.analyze();
            Ok(result.failed())
        }
        Commands::Reconcile {
            raw,
            bone,
            output,
            model,
        } => {
            let output = output.unwrap_or_else(|| {
                bone_berry::naming::sibling_with_suffix(&bone, bone_berry::consts::SUBSEG_SUFFIX)
            });
            let config = SubsegConfig::for_model(model)?;
            runner::reconcile_file(&raw, &bone, &output, &config)?;
            info!("Subsegmentation repaired, output is: {}", output.display());
            Ok(0)
        }
        Commands::Info { input } => {
            let loader = VolumeLoader::from_path(&input)
                .with_context(|| format!("cannot read {}", input.display()))?;
            let mut failed = 0;
            for (path, volume) in loader {
                println!("{}", utils::sep());
                match volume {
                    Ok(v) => {
                        println!("{}", path.display());
                        println!("    Orientation: {}", v.native_orientation());
                        println!("    Shape (z, h, w): {:?}", v.shape());
                        println!("    Spacing (mm): {:?}", v.pix_dim());
                        println!("    Origin (mm): {:?}", v.origin());
                        println!("    Labels: {:?}", v.labels());
                    }
                    Err(e) => {
                        error!("{}: {e}", path.display());
                        failed += 1;
                    }
                }
            }
            Ok(failed)
        }
        Commands::Models { model_home } => {
            let store = open_store(model_home)?;
            let mut incomplete = 0;
            for kind in ModelKind::ALL {
                let spec = ModelSpec::of(kind);
                match store.missing_files(&spec).len() {
                    0 => println!("{:>8}: ready ({})", kind.name(), spec.task),
                    n => {
                        incomplete += 1;
                        println!(
                            "{:>8}: missing {n} file(s), download {}",
                            kind.name(),
                            spec.url()
                        );
                    }
                }
            }
            if incomplete > 0 {
                warn!(
                    "Unzip downloaded models into {}",
                    store.fullres_dir().display()
                );
            }
            Ok(0)
        }
    }
}

/// 定位并初始化模型仓库: `--model-home`, `$SKELLYTOUR_HOME`, `~/.skellytour` 依次生效.
fn open_store(flag: Option<PathBuf>) -> Result<ModelStore> {
    let home = flag
        .or_else(loader::model_home_from_env_or_home)
        .ok_or_else(|| anyhow!("cannot determine model home, use --model-home"))?;
    let store = ModelStore::new(home);
    store.bootstrap()?;
    Ok(store)
}

fn collect_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    let inputs = loader::nifti_inputs(input)
        .with_context(|| format!("cannot read {}", input.display()))?;
    if inputs.is_empty() {
        warn!("No nifti files found in {}", input.display());
    }
    Ok(inputs)
}
