//! 运行结果.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::runner::{CaseReport, Stage, StageStatus};

/// 将单个病例的结果写进 `w` 中.
fn describe_into<W: Write>(input: &Path, r: &Result<CaseReport>, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    writeln!(w, "Case `{}`:", input.display())?;
    let report = match r {
        Ok(report) => report,
        Err(e) => return write!(w, "{S4}Failed: {e:#}"),
    };
    for (stage, status) in report.stages.iter() {
        let status = match status {
            StageStatus::Done => "done",
            StageStatus::Skipped => "skipped (output exists)",
        };
        writeln!(w, "{S4}{stage}: {status}")?;
    }
    if let Some(pp) = &report.postprocess {
        let kept: usize = pp.labels.iter().map(|l| l.voxels_kept).sum();
        writeln!(w, "{S4}Labels processed: {}", pp.labels.len())?;
        writeln!(w, "{S4}Voxels kept: {kept}")?;
        writeln!(w, "{S4}Voxels removed: {}", pp.voxels_removed())?;
        if !pp.dropped.is_empty() {
            writeln!(w, "{S4}Labels without policy (dropped): {:?}", pp.dropped)?;
        }
    }
    write!(w, "{S4}Time: {:.3} s", report.elapsed.as_secs_f64())?;
    Ok(())
}

/// 一批病例的最终结果.
#[derive(Debug, Default)]
pub struct RunResult {
    data: Vec<(PathBuf, Result<CaseReport>)>,
}

impl FromIterator<(PathBuf, Result<CaseReport>)> for RunResult {
    fn from_iter<I: IntoIterator<Item = (PathBuf, Result<CaseReport>)>>(it: I) -> Self {
        Self {
            data: it.into_iter().collect(),
        }
    }
}

impl RunResult {
    /// 病例数.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 失败的病例数.
    pub fn failed(&self) -> usize {
        self.data.iter().filter(|(_, r)| r.is_err()).count()
    }

    /// 阶段 `stage` 被跳过的病例数.
    pub fn skipped(&self, stage: Stage) -> usize {
        self.data
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .filter(|r| r.status(stage) == Some(StageStatus::Skipped))
            .count()
    }

    /// 分析运行结果.
    pub fn analyze(&self) {
        println!("{}", utils::sep());
        let mut buf = Vec::with_capacity(512);

        for (input, r) in self.data.iter() {
            if describe_into(input, r, &mut buf).is_ok() {
                println!("{}", String::from_utf8_lossy(&buf));
            }
            buf.clear();

            println!("{}", utils::sep());
        }
        println!(
            "{} case(s), {} succeeded, {} failed",
            self.len(),
            self.len() - self.failed(),
            self.failed()
        );
    }
}
