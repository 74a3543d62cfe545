//! 皮质/松质子分割与粗分割 (骨骼掩膜) 的一致性修复.
//!
//! 修复按以下顺序进行, 每一步都以上一步的结果为输入:
//!
//! 1. 体素匹配: 非骨骼体素清零, 未分类的骨骼体素设为松质骨;
//! 2. 皮质边缘: 邻域内存在背景的骨骼体素设为皮质骨;
//! 3. 边界安全: 位于体数据外表面上的松质骨体素设为皮质骨.

use std::path::Path;

use cfg_if::cfg_if;
use log::info;
use ndarray::{s, Array3, ArrayView3, Axis, Zip};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::policy::ModelKind;
use crate::consts::subseg::{is_background, is_trabecular, BACKGROUND, CORTICAL, TRABECULAR};
use crate::consts::{CORTICAL_EDGE_RADIUS, LABEL_BACKGROUND};
use crate::data::{LabeledVolume, NiftiHeaderAttr};
use crate::error::{BoneError, Result};
use crate::Idx3d;

/// 子分割修复的配置.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubsegConfig {
    /// 在粗分割中不属于骨骼的非零标签 (例如包裹骨骼的软组织标签).
    non_bone_labels: Vec<u8>,
}

impl Default for SubsegConfig {
    fn default() -> Self {
        Self::new([])
    }
}

impl SubsegConfig {
    /// 以 `non_bone_labels` 作为非骨骼标签创建配置.
    pub fn new<I: IntoIterator<Item = u8>>(non_bone_labels: I) -> Self {
        let mut non_bone_labels: Vec<u8> = non_bone_labels.into_iter().collect();
        non_bone_labels.sort_unstable();
        non_bone_labels.dedup();
        Self { non_bone_labels }
    }

    /// 粗分割由模型 `model` 产生时的配置: 该模型所有 "全部保留" 类的标签都不是骨骼.
    ///
    /// `model` 没有标签表时返回 `Err(BoneError::UnknownLabelConfiguration)`.
    pub fn for_model(model: ModelKind) -> Result<Self> {
        Ok(Self::new(model.label_classes()?.keep_all_labels()))
    }

    /// 非骨骼标签.
    #[inline]
    pub fn non_bone_labels(&self) -> &[u8] {
        &self.non_bone_labels
    }

    /// 粗分割中的体素值 `p` 是否代表骨骼?
    #[inline]
    pub fn is_bone(&self, p: u8) -> bool {
        p != LABEL_BACKGROUND && self.non_bone_labels.binary_search(&p).is_err()
    }
}

/// 检查形状是否一致.
fn check_shape(raw: &ArrayView3<u8>, bone: &ArrayView3<u8>) -> Result<()> {
    if raw.dim() != bone.dim() {
        return Err(BoneError::ShapeMismatch {
            expected: bone.dim(),
            found: raw.dim(),
        });
    }
    Ok(())
}

/// 第一步: 子分割与骨骼掩膜逐体素对齐.
fn match_voxels(raw: ArrayView3<u8>, bone: ArrayView3<u8>, config: &SubsegConfig) -> Array3<u8> {
    Zip::from(raw).and(bone).map_collect(|&r, &b| {
        match (config.is_bone(b), is_background(r)) {
            (false, _) => BACKGROUND,
            (true, true) => TRABECULAR,
            (true, false) => r,
        }
    })
}

/// 第二步的判据: 骨骼体素 `b` 以 `pos` 为中心, 半径为 [`CORTICAL_EDGE_RADIUS`]
/// 的立方邻域 (在边界处截断) 内是否存在背景?
#[inline]
fn is_edge(config: &SubsegConfig, matched: &ArrayView3<u8>, (z, h, w): Idx3d, b: u8) -> bool {
    if !config.is_bone(b) {
        return false;
    }
    let radius = CORTICAL_EDGE_RADIUS;
    let (lz, lh, lw) = matched.dim();
    let window = s![
        z.saturating_sub(radius)..=(z + radius).min(lz - 1),
        h.saturating_sub(radius)..=(h + radius).min(lh - 1),
        w.saturating_sub(radius)..=(w + radius).min(lw - 1)
    ];
    matched.slice(window).iter().any(|&p| is_background(p))
}

/// 将第二步找到的边缘 `edges` 设为皮质骨, 然后做第三步.
fn finish(mut regions: Array3<u8>, edges: Array3<bool>) -> Array3<u8> {
    Zip::from(&mut regions).and(&edges).for_each(|p, &e| {
        if e {
            *p = CORTICAL;
        }
    });
    fix_border(&mut regions);
    regions
}

/// 第三步: 外表面上的松质骨体素设为皮质骨.
fn fix_border(regions: &mut Array3<u8>) {
    if regions.is_empty() {
        return;
    }
    for axis in 0..3 {
        let last = regions.len_of(Axis(axis)) - 1;
        for idx in [0, last] {
            regions
                .index_axis_mut(Axis(axis), idx)
                .map_inplace(|p| {
                    if is_trabecular(*p) {
                        *p = CORTICAL;
                    }
                });
        }
    }
}

/// 对规范方向下的原始子分割 `raw` 和骨骼掩膜 `bone` 做一致性修复.
///
/// 两者形状必须一致, 否则返回 `Err(BoneError::ShapeMismatch)`.
/// 骨骼掩膜为空时结果全为 0, 这不是错误.
pub fn reconcile_array(
    raw: ArrayView3<u8>,
    bone: ArrayView3<u8>,
    config: &SubsegConfig,
) -> Result<Array3<u8>> {
    check_shape(&raw, &bone)?;
    let regions = match_voxels(raw, bone, config);
    let matched = regions.view();
    let edges = Zip::indexed(bone).map_collect(|pos, &b| is_edge(config, &matched, pos, b));
    Ok(finish(regions, edges))
}

/// 以 `bone` 为骨骼掩膜修复子分割 `raw`. 结果沿用 `raw` 的几何信息,
/// 两者均不会被修改.
pub fn reconcile(
    raw: &LabeledVolume,
    bone: &LabeledVolume,
    config: &SubsegConfig,
) -> Result<LabeledVolume> {
    let regions = reconcile_array(raw.data(), bone.data(), config)?;
    raw.derive(regions)
}

/// 读取原始子分割 `raw` 与骨骼分割 `bone`, 修复后按 `raw` 的原始方向写出到 `output`.
pub fn reconcile_files<P, Q, R>(raw: P, bone: Q, output: R, config: &SubsegConfig) -> Result<()>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
{
    let raw_volume = LabeledVolume::open(raw.as_ref())?;
    let bone_volume = LabeledVolume::open(bone.as_ref())?;
    info!(
        "Reconciling {} against {} ({:?})",
        raw.as_ref().display(),
        bone.as_ref().display(),
        raw_volume.shape()
    );

    #[cfg(feature = "rayon")]
    let fixed = par_reconcile(&raw_volume, &bone_volume, config)?;
    #[cfg(not(feature = "rayon"))]
    let fixed = reconcile(&raw_volume, &bone_volume, config)?;
    fixed.save(output.as_ref())?;
    info!(
        "Wrote {}: {} cortical, {} trabecular voxel(s)",
        output.as_ref().display(),
        fixed.count(CORTICAL),
        fixed.count(TRABECULAR)
    );
    Ok(())
}

cfg_if! {
    if #[cfg(feature = "rayon")] {
        /// [`reconcile_array`] 的并行版本, 结果完全相同.
        pub fn par_reconcile_array(
            raw: ArrayView3<u8>,
            bone: ArrayView3<u8>,
            config: &SubsegConfig,
        ) -> Result<Array3<u8>> {
            check_shape(&raw, &bone)?;
            let regions = match_voxels(raw, bone, config);
            let matched = regions.view();
            let edges = Zip::indexed(bone).par_map_collect(|pos, &b| is_edge(config, &matched, pos, b));
            Ok(finish(regions, edges))
        }

        /// [`reconcile`] 的并行版本, 结果完全相同.
        pub fn par_reconcile(
            raw: &LabeledVolume,
            bone: &LabeledVolume,
            config: &SubsegConfig,
        ) -> Result<LabeledVolume> {
            let regions = par_reconcile_array(raw.data(), bone.data(), config)?;
            raw.derive(regions)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn medium() -> SubsegConfig {
        SubsegConfig::for_model(ModelKind::Medium).unwrap()
    }

    /// 7x7x7 的骨骼掩膜, 中心为 3x3x3 的骨块.
    fn interior_block() -> Array3<u8> {
        let mut bone = Array3::zeros((7, 7, 7));
        bone.slice_mut(s![2..5, 2..5, 2..5]).fill(7);
        bone
    }

    fn assert_consistent(out: &Array3<u8>, bone: &Array3<u8>, config: &SubsegConfig) {
        Zip::from(out).and(bone).for_each(|&o, &b| {
            assert_eq!(o != 0, config.is_bone(b));
        });
    }

    fn assert_no_border_trabecular(out: &Array3<u8>) {
        for axis in 0..3 {
            let last = out.len_of(Axis(axis)) - 1;
            for idx in [0, last] {
                assert!(out.index_axis(Axis(axis), idx).iter().all(|&p| p != TRABECULAR));
            }
        }
    }

    #[test]
    fn test_config() {
        let config = medium();
        assert_eq!(config.non_bone_labels(), &[38]);
        assert!(config.is_bone(1));
        assert!(config.is_bone(37));
        assert!(!config.is_bone(38));
        assert!(!config.is_bone(0));
        assert_eq!(SubsegConfig::for_model(ModelKind::High).unwrap().non_bone_labels(), &[60]);
        assert!(SubsegConfig::for_model(ModelKind::Subseg).is_err());
    }

    #[test]
    fn test_interior_block_from_empty_prediction() {
        let bone = interior_block();
        let raw = Array3::zeros(bone.raw_dim());
        let out = reconcile_array(raw.view(), bone.view(), &medium()).unwrap();

        // 表面的 26 个体素与背景相邻, 均为皮质骨.
        let block = out.slice(s![2..5, 2..5, 2..5]);
        assert_eq!(block.iter().filter(|&&p| p == CORTICAL).count(), 26);
        // 半径为 1 时, 中心体素的邻域全部是骨骼, 保持松质骨.
        assert_eq!(out[(3, 3, 3)], TRABECULAR);
        assert_eq!(out.iter().filter(|&&p| p != 0).count(), 27);
        assert_consistent(&out, &bone, &medium());
    }

    #[test]
    fn test_voxel_match() {
        let mut bone = Array3::<u8>::zeros((5, 5, 5));
        bone.slice_mut(s![1..4, 1..4, 1..4]).fill(3);
        bone[(0, 0, 0)] = 38;
        // 原始预测在软组织和背景上也有值, 在骨骼上部分缺失.
        let mut raw = Array3::<u8>::from_elem((5, 5, 5), TRABECULAR);
        raw[(2, 2, 2)] = 0;
        raw[(1, 1, 1)] = CORTICAL;

        let config = medium();
        let out = reconcile_array(raw.view(), bone.view(), &config).unwrap();
        assert_consistent(&out, &bone, &config);
        assert_eq!(out[(0, 0, 0)], 0);
        // 中心被补为松质骨, 其邻域全为骨骼.
        assert_eq!(out[(2, 2, 2)], TRABECULAR);
        assert_eq!(out[(1, 1, 1)], CORTICAL);
    }

    #[test]
    fn test_large_block_keeps_core() {
        let mut bone = Array3::<u8>::zeros((9, 9, 9));
        bone.slice_mut(s![1..8, 1..8, 1..8]).fill(2);
        let raw = Array3::from_elem((9, 9, 9), TRABECULAR);
        let out = reconcile_array(raw.view(), bone.view(), &medium()).unwrap();

        assert!(out.slice(s![2..7, 2..7, 2..7]).iter().all(|&p| p == TRABECULAR));
        assert_eq!(out.iter().filter(|&&p| p == CORTICAL).count(), 7 * 7 * 7 - 5 * 5 * 5);
    }

    #[test]
    fn test_border_is_never_trabecular() {
        // 骨骼填满整个体数据, 只有边界修正能够生效.
        let bone = Array3::<u8>::from_elem((4, 5, 6), 9);
        let mut raw = Array3::from_elem((4, 5, 6), TRABECULAR);
        raw[(1, 1, 1)] = CORTICAL;
        let out = reconcile_array(raw.view(), bone.view(), &medium()).unwrap();

        assert_no_border_trabecular(&out);
        assert_eq!(out[(1, 1, 1)], CORTICAL);
        assert_eq!(out[(2, 2, 2)], TRABECULAR);
        assert_eq!(out[(0, 2, 2)], CORTICAL);
        assert_consistent(&out, &bone, &medium());
    }

    #[test]
    fn test_empty_bone_mask() {
        let bone = Array3::<u8>::from_elem((3, 4, 5), 38);
        let raw = Array3::from_elem((3, 4, 5), CORTICAL);
        let out = reconcile_array(raw.view(), bone.view(), &medium()).unwrap();
        assert!(out.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_shape_mismatch() {
        let bone = Array3::<u8>::zeros((3, 4, 5));
        let raw = Array3::<u8>::zeros((3, 5, 4));
        let err = reconcile_array(raw.view(), bone.view(), &medium()).unwrap_err();
        assert!(matches!(
            err,
            BoneError::ShapeMismatch {
                expected: (3, 4, 5),
                found: (3, 5, 4)
            }
        ));
    }

    #[test]
    fn test_reconcile_volume_keeps_raw_geometry() {
        let bone = LabeledVolume::fake(interior_block(), [1.0, 1.0, 1.0]).unwrap();
        let raw = LabeledVolume::fake(Array3::zeros((7, 7, 7)), [1.0, 0.5, 2.0]).unwrap();
        let out = reconcile(&raw, &bone, &medium()).unwrap();
        assert_eq!(out.pix_dim(), raw.pix_dim());
        assert_eq!(out.count(CORTICAL), 26);
        assert_eq!(raw.count(0), 7 * 7 * 7);
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn test_par_reconcile_matches_serial() {
        let bone = Array3::from_shape_fn((8, 9, 10), |(z, h, w)| ((z * 3 + h * 5 + w) % 7) as u8 * 7);
        let raw = Array3::from_shape_fn((8, 9, 10), |(z, h, w)| ((z + h * w) % 3) as u8);
        let config = SubsegConfig::new([14]);
        let serial = reconcile_array(raw.view(), bone.view(), &config).unwrap();
        let parallel = par_reconcile_array(raw.view(), bone.view(), &config).unwrap();
        assert_eq!(serial, parallel);
        assert_consistent(&parallel, &bone, &config);
        assert_no_border_trabecular(&parallel);
    }
}
