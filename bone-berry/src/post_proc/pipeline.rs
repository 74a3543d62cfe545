//! 逐标签后处理: 对每个出现过的标签做连通域分析, 按照标签保留策略拼出最终标签.

use std::path::Path;

use cfg_if::cfg_if;
use log::{debug, info, warn};
use ndarray::{s, Array3, ArrayView3, Ix3, SliceInfo, SliceInfoElem};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::policy::{LabelClass, LabelClassAssignment};
use crate::data::{LabeledVolume, NiftiHeaderAttr};
use crate::error::Result;
use crate::island::Islands;
use crate::Idx3d;

/// 单个标签的后处理结果.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LabelReport {
    /// 标签值.
    pub label: u8,
    /// 使用的保留策略.
    pub class: LabelClass,
    /// 原始标签中岛的个数.
    pub islands_found: usize,
    /// 保留下来的岛的个数.
    pub islands_kept: usize,
    /// 保留的体素个数.
    pub voxels_kept: usize,
    /// 被移除的体素个数.
    pub voxels_removed: usize,
}

/// 一次后处理的完整报告.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PostprocessReport {
    /// 被处理的标签, 按标签值升序.
    pub labels: Vec<LabelReport>,
    /// 输入中出现, 但没有任何保留策略的标签. 这些标签被整体丢弃.
    pub dropped: Vec<u8>,
    /// 有保留策略, 但在输入中不存在的标签.
    pub missing: Vec<u8>,
}

impl PostprocessReport {
    /// 获取标签 `label` 的结果.
    pub fn label(&self, label: u8) -> Option<&LabelReport> {
        self.labels.iter().find(|r| r.label == label)
    }

    /// 被保留策略移除的体素总数, 不包括被整体丢弃的标签.
    pub fn voxels_removed(&self) -> usize {
        self.labels.iter().map(|r| r.voxels_removed).sum()
    }
}

/// 后处理得到的新体数据及其报告.
#[derive(Debug, Clone)]
pub struct Postprocessed {
    /// 与输入几何信息相同的新标签.
    pub volume: LabeledVolume,
    /// 报告.
    pub report: PostprocessReport,
}

/// 某个标签的包围盒, 两端均包含.
#[derive(Copy, Clone, Debug)]
struct Bounds {
    lo: Idx3d,
    hi: Idx3d,
}

impl Bounds {
    #[inline]
    fn at(pos: Idx3d) -> Self {
        Self { lo: pos, hi: pos }
    }

    #[inline]
    fn extend(&mut self, (z, h, w): Idx3d) {
        self.lo = (self.lo.0.min(z), self.lo.1.min(h), self.lo.2.min(w));
        self.hi = (self.hi.0.max(z), self.hi.1.max(h), self.hi.2.max(w));
    }

    #[inline]
    fn roi(&self) -> SliceInfo<[SliceInfoElem; 3], Ix3, Ix3> {
        let (lo, hi) = (self.lo, self.hi);
        s![lo.0..=hi.0, lo.1..=hi.1, lo.2..=hi.2]
    }
}

/// 一次扫描得到所有非零标签的包围盒. 下标即为标签值.
fn label_bounds(data: ArrayView3<u8>) -> Vec<Option<Bounds>> {
    let mut bounds: Vec<Option<Bounds>> = vec![None; 256];
    for (pos, &v) in data.indexed_iter() {
        if v == 0 {
            continue;
        }
        bounds[v as usize].get_or_insert(Bounds::at(pos)).extend(pos);
    }
    bounds
}

/// 单个标签的一轮分析结果: 保留下来的体素 (整个数组中的坐标) 以及报告.
///
/// 岛的编号图只在 [`LabelPass::analyse`] 内部存在, 分析结束即释放.
/// 不同标签保留的体素互不重叠, 因此所有标签的结果加起来不超过体数据大小.
struct LabelPass {
    voxels: Vec<Idx3d>,
    report: LabelReport,
}

impl LabelPass {
    /// 在原始标签 `data` 的包围盒 `bounds` 内对 `label` 做连通域分析,
    /// 并按 `class` 决定保留哪些岛.
    fn analyse(
        data: ArrayView3<u8>,
        label: u8,
        bounds: Bounds,
        class: LabelClass,
        voxel: f64,
    ) -> Self {
        let mask = data.slice(bounds.roi()).map(|&v| v == label);
        let islands = Islands::label(mask.view());
        let kept = class.retain(&islands, voxel);

        let mut keep = vec![false; islands.count() + 1];
        kept.iter().for_each(|&id| keep[id as usize] = true);

        let (z0, h0, w0) = bounds.lo;
        let voxels: Vec<Idx3d> = islands
            .map()
            .indexed_iter()
            .filter(|&(_, &id)| keep[id as usize])
            .map(|((z, h, w), _)| (z + z0, h + h0, w + w0))
            .collect();

        let total: usize = (1..=islands.count() as u32).map(|id| islands.voxel_count(id)).sum();
        debug!(
            "label {label} ({class}): kept {}/{} island(s), {}/{total} voxel(s)",
            kept.len(),
            islands.count(),
            voxels.len()
        );
        let report = LabelReport {
            label,
            class,
            islands_found: islands.count(),
            islands_kept: kept.len(),
            voxels_kept: voxels.len(),
            voxels_removed: total - voxels.len(),
        };
        Self { voxels, report }
    }
}

/// 把各标签的分析结果依次写入全零数组, 报告按标签顺序追加到 `report`.
///
/// `passes` 是惰性迭代器时, 每个标签写完即释放.
fn assemble<I>(dim: Ix3, passes: I, report: &mut PostprocessReport) -> Array3<u8>
where
    I: IntoIterator<Item = LabelPass>,
{
    let mut out = Array3::<u8>::zeros(dim);
    for pass in passes {
        let label = pass.report.label;
        pass.voxels.iter().for_each(|&pos| out[pos] = label);
        report.labels.push(pass.report);
    }
    out
}

/// 将输入中出现过的标签分为两类: 有保留策略的标签返回待处理,
/// 没有保留策略的标签记入 `report.dropped`. 同时记录缺失的标签.
fn plan(
    bounds: &[Option<Bounds>],
    assignment: &LabelClassAssignment,
    report: &mut PostprocessReport,
) -> Vec<(u8, Bounds, LabelClass)> {
    let mut todo = Vec::new();
    for (label, b) in bounds.iter().enumerate().skip(1) {
        let Some(b) = *b else { continue };
        let label = label as u8;
        match assignment.class_of(label) {
            Some(class) => todo.push((label, b, class)),
            None => {
                debug!("label {label} has no retention class, dropped");
                report.dropped.push(label);
            }
        }
    }

    for (label, _) in assignment.iter() {
        if bounds[label as usize].is_none() {
            warn!("label {label} is not present in the input, nothing retained");
            report.missing.push(label);
        }
    }
    todo
}

/// 对规范方向下的标签数组 `data` 做逐标签后处理. `voxel` 为单个体素体积 (立方毫米).
///
/// 每个标签的连通域总是在 **原始** 数组上计算, 因此标签之间互不影响,
/// 处理顺序也不影响结果. 没有保留策略的标签和背景在输出中为 0.
///
/// # 注意
///
/// 有保留策略但在输入中不存在的标签不是错误, 只会产生一条警告.
pub fn postprocess_array(
    data: ArrayView3<u8>,
    assignment: &LabelClassAssignment,
    voxel: f64,
) -> (Array3<u8>, PostprocessReport) {
    let bounds = label_bounds(data);
    let mut report = PostprocessReport::default();
    let passes = plan(&bounds, assignment, &mut report)
        .into_iter()
        .map(|(label, b, class)| LabelPass::analyse(data, label, b, class, voxel));
    let out = assemble(data.raw_dim(), passes, &mut report);
    (out, report)
}

/// 对 `volume` 做后处理, 返回几何信息相同的新标签. `volume` 本身不会被修改.
pub fn postprocess(
    volume: &LabeledVolume,
    assignment: &LabelClassAssignment,
) -> Result<Postprocessed> {
    let (data, report) = postprocess_array(volume.data(), assignment, volume.voxel());
    let volume = volume.derive(data)?;
    Ok(Postprocessed { volume, report })
}

/// 读取 `input`, 后处理, 并按原始方向写出到 `output`.
///
/// 只有在全部计算成功后才会写出文件.
pub fn postprocess_file<P: AsRef<Path>, Q: AsRef<Path>>(
    input: P,
    output: Q,
    assignment: &LabelClassAssignment,
) -> Result<PostprocessReport> {
    let volume = LabeledVolume::open(input.as_ref())?;
    info!(
        "Postprocessing {} ({} label(s), voxel {:.4} mm3)",
        input.as_ref().display(),
        volume.labels().len(),
        volume.voxel()
    );

    #[cfg(feature = "rayon")]
    let Postprocessed { volume, report } = par_postprocess(&volume, assignment)?;
    #[cfg(not(feature = "rayon"))]
    let Postprocessed { volume, report } = postprocess(&volume, assignment)?;

    volume.save(output.as_ref())?;
    info!(
        "Wrote {}: {} label(s) kept, {} dropped, {} voxel(s) removed",
        output.as_ref().display(),
        report.labels.len(),
        report.dropped.len(),
        report.voxels_removed()
    );
    Ok(report)
}

cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};

        /// 借助 `rayon`, 并行地对各个标签做连通域分析. 结果与 [`postprocess_array`] 完全相同.
        ///
        /// 同时进行的分析不超过线程数; 分析完成的标签只保留其体素坐标.
        pub fn par_postprocess_array(
            data: ArrayView3<u8>,
            assignment: &LabelClassAssignment,
            voxel: f64,
        ) -> (Array3<u8>, PostprocessReport) {
            let bounds = label_bounds(data);
            let mut report = PostprocessReport::default();
            let passes: Vec<LabelPass> = plan(&bounds, assignment, &mut report)
                .into_par_iter()
                .map(|(label, b, class)| LabelPass::analyse(data, label, b, class, voxel))
                .collect();
            let out = assemble(data.raw_dim(), passes, &mut report);
            (out, report)
        }

        /// [`postprocess`] 的并行版本.
        pub fn par_postprocess(
            volume: &LabeledVolume,
            assignment: &LabelClassAssignment,
        ) -> Result<Postprocessed> {
            let (data, report) = par_postprocess_array(volume.data(), assignment, volume.voxel());
            let volume = volume.derive(data)?;
            Ok(Postprocessed { volume, report })
        }
    }
}
