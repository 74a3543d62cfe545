//! 标签保留策略.
//!
//! 每个模型都把自己的标签值划分到三类保留策略中, 未被划分的标签直接丢弃.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use once_cell::sync::Lazy;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::consts::{RIB_MAX_ISLANDS, RIB_MIN_ISLAND_MM3};
use crate::error::{BoneError, Result};
use crate::island::{IslandId, Islands};

/// 单个标签的岛保留策略.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LabelClass {
    /// 只保留体积最大的岛.
    LargestOnly,

    /// 保留所有岛.
    KeepAll,

    /// 按体积从大到小, 保留排名不超过 `max_count` 且体积不小于
    /// `min_volume_mm3` 的岛.
    BoundedBySize {
        /// 最多考察的岛个数 (按排名).
        max_count: usize,
        /// 单个岛的最小体积, 以立方毫米为单位.
        min_volume_mm3: f64,
    },
}

impl LabelClass {
    /// 肋骨使用的策略: 最多 12 个岛, 每个岛不小于 1000 立方毫米.
    pub const RIBS: LabelClass = LabelClass::BoundedBySize {
        max_count: RIB_MAX_ISLANDS,
        min_volume_mm3: RIB_MIN_ISLAND_MM3,
    };

    /// 给定某个标签的全部岛 `islands` 和单个体素体积 `voxel` (立方毫米),
    /// 返回需要保留的岛编号.
    ///
    /// 对于 [`LabelClass::BoundedBySize`], 排名先于体积判断:
    /// 排名在 `max_count` 之后的岛无论多大都不会被保留.
    pub fn retain(&self, islands: &Islands, voxel: f64) -> Vec<IslandId> {
        match *self {
            LabelClass::LargestOnly => islands
                .rank_by_size_desc(voxel)
                .into_iter()
                .take(1)
                .collect(),
            LabelClass::KeepAll => (1..=islands.count() as IslandId).collect(),
            LabelClass::BoundedBySize {
                max_count,
                min_volume_mm3,
            } => islands
                .rank_by_size_desc(voxel)
                .into_iter()
                .take(max_count)
                .filter(|&id| islands.volume_mm3(id, voxel) >= min_volume_mm3)
                .collect(),
        }
    }
}

impl Display for LabelClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelClass::LargestOnly => f.write_str("largest-only"),
            LabelClass::KeepAll => f.write_str("keep-all"),
            LabelClass::BoundedBySize {
                max_count,
                min_volume_mm3,
            } => write!(f, "bounded-by-size({max_count}, {min_volume_mm3} mm3)"),
        }
    }
}

/// 标签值到保留策略的映射. 每个标签至多属于一个策略类.
#[derive(Clone, Debug)]
pub struct LabelClassAssignment {
    classes: Box<[Option<LabelClass>; 256]>,
}

impl Default for LabelClassAssignment {
    fn default() -> Self {
        Self {
            classes: Box::new([None; 256]),
        }
    }
}

impl LabelClassAssignment {
    /// 创建空映射 (所有标签都会被丢弃).
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 把 `labels` 中的所有标签划分为 `class`.
    ///
    /// 背景 (0) 不能被划分; 如果某个标签已经属于某个类, 则返回
    /// `Err(BoneError::OverlappingLabelClass)`.
    pub fn with<I: IntoIterator<Item = u8>>(mut self, labels: I, class: LabelClass) -> Result<Self> {
        for label in labels {
            let slot = &mut self.classes[label as usize];
            if label == 0 || slot.is_some() {
                return Err(BoneError::OverlappingLabelClass(label));
            }
            *slot = Some(class);
        }
        Ok(self)
    }

    /// 获取 `label` 的保留策略. `None` 代表该标签会被丢弃.
    #[inline]
    pub fn class_of(&self, label: u8) -> Option<LabelClass> {
        self.classes[label as usize]
    }

    /// 按升序迭代所有被划分的 `(标签, 策略)`.
    pub fn iter(&self) -> impl Iterator<Item = (u8, LabelClass)> + '_ {
        self.classes
            .iter()
            .enumerate()
            .filter_map(|(l, c)| c.map(|c| (l as u8, c)))
    }

    /// 所有策略为 [`LabelClass::KeepAll`] 的标签, 按升序排列.
    pub fn keep_all_labels(&self) -> Vec<u8> {
        self.iter()
            .filter_map(|(l, c)| matches!(c, LabelClass::KeepAll).then_some(l))
            .collect()
    }
}

/// 分割模型.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ModelKind {
    /// 17 个标签.
    Low,
    /// 38 个标签 (默认).
    Medium,
    /// 60 个标签.
    High,
    /// 皮质/松质子分割模型. 没有标签保留策略.
    Subseg,
}

impl ModelKind {
    /// 所有模型, 按名称顺序.
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Low,
        ModelKind::Medium,
        ModelKind::High,
        ModelKind::Subseg,
    ];

    /// 模型名称.
    pub const fn name(&self) -> &'static str {
        match self {
            ModelKind::Low => "low",
            ModelKind::Medium => "medium",
            ModelKind::High => "high",
            ModelKind::Subseg => "subseg",
        }
    }

    /// 获取该模型的标签保留策略表.
    ///
    /// 子分割模型没有策略表, 返回 `Err(BoneError::UnknownLabelConfiguration)`.
    pub fn label_classes(&self) -> Result<&'static LabelClassAssignment> {
        let table = match self {
            ModelKind::Low => &LOW,
            ModelKind::Medium => &MEDIUM,
            ModelKind::High => &HIGH,
            ModelKind::Subseg => {
                return Err(BoneError::UnknownLabelConfiguration(self.name().into()))
            }
        };
        table
            .as_ref()
            .ok_or_else(|| BoneError::UnknownLabelConfiguration(self.name().into()))
    }
}

impl FromStr for ModelKind {
    type Err = BoneError;

    fn from_str(s: &str) -> Result<Self> {
        ModelKind::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| BoneError::UnknownLabelConfiguration(s.into()))
    }
}

impl Display for ModelKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// 三张静态表在首次使用时构建. 表本身是常量, 构建失败意味着表写错了,
// 此时 `label_classes` 会把它当作未知配置报告出来.
static LOW: Lazy<Option<LabelClassAssignment>> = Lazy::new(|| {
    LabelClassAssignment::new()
        .with((1..=11).chain(14..=16), LabelClass::LargestOnly)
        .and_then(|a| a.with([12, 13], LabelClass::RIBS))
        .and_then(|a| a.with([17], LabelClass::KeepAll))
        .ok()
});

static MEDIUM: Lazy<Option<LabelClassAssignment>> = Lazy::new(|| {
    LabelClassAssignment::new()
        .with((1..=11).chain(14..=37), LabelClass::LargestOnly)
        .and_then(|a| a.with([12, 13], LabelClass::RIBS))
        .and_then(|a| a.with([38], LabelClass::KeepAll))
        .ok()
});

static HIGH: Lazy<Option<LabelClassAssignment>> = Lazy::new(|| {
    LabelClassAssignment::new()
        .with(1..=59, LabelClass::LargestOnly)
        .and_then(|a| a.with([60], LabelClass::KeepAll))
        .ok()
});

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array3};

    /// 在 `(1, 2n, 20)` 的平面上放置 `n` 条互不相邻的横条, 第 `i` 条位于第 `2i` 行, 长度为 `lens[i]`.
    fn bars(lens: &[usize]) -> Islands {
        let mut mask = Array3::from_elem((1, 2 * lens.len(), 20), false);
        for (i, &len) in lens.iter().enumerate() {
            mask.slice_mut(s![0, 2 * i, 0..len]).fill(true);
        }
        Islands::label(mask.view())
    }

    #[test]
    fn test_model_tables() {
        let low = ModelKind::Low.label_classes().unwrap();
        assert_eq!(low.class_of(5), Some(LabelClass::LargestOnly));
        assert_eq!(low.class_of(12), Some(LabelClass::RIBS));
        assert_eq!(low.class_of(17), Some(LabelClass::KeepAll));
        assert_eq!(low.class_of(18), None);
        assert_eq!(low.iter().last(), Some((17, LabelClass::KeepAll)));
        assert_eq!(low.iter().count(), 17);

        let medium = ModelKind::Medium.label_classes().unwrap();
        assert_eq!(medium.class_of(13), Some(LabelClass::RIBS));
        assert_eq!(medium.class_of(37), Some(LabelClass::LargestOnly));
        assert_eq!(medium.keep_all_labels(), vec![38]);
        assert_eq!(medium.iter().count(), 38);

        let high = ModelKind::High.label_classes().unwrap();
        assert_eq!(high.class_of(12), Some(LabelClass::LargestOnly));
        assert_eq!(high.keep_all_labels(), vec![60]);
        assert_eq!(high.iter().count(), 60);

        assert!(matches!(
            ModelKind::Subseg.label_classes(),
            Err(BoneError::UnknownLabelConfiguration(_))
        ));
    }

    #[test]
    fn test_model_names() {
        assert_eq!("Medium".parse::<ModelKind>().unwrap(), ModelKind::Medium);
        assert_eq!(ModelKind::High.to_string(), "high");
        assert!(matches!(
            "ultra".parse::<ModelKind>(),
            Err(BoneError::UnknownLabelConfiguration(_))
        ));
    }

    #[test]
    fn test_assignment_is_disjoint() {
        let err = LabelClassAssignment::new()
            .with([1, 2], LabelClass::LargestOnly)
            .and_then(|a| a.with([2], LabelClass::KeepAll))
            .unwrap_err();
        assert!(matches!(err, BoneError::OverlappingLabelClass(2)));

        let err = LabelClassAssignment::new()
            .with([0], LabelClass::KeepAll)
            .unwrap_err();
        assert!(matches!(err, BoneError::OverlappingLabelClass(0)));
    }

    #[test]
    fn test_largest_only() {
        let islands = bars(&[3, 9, 9, 1]);
        assert_eq!(LabelClass::LargestOnly.retain(&islands, 1.0), vec![2]);
        assert!(LabelClass::LargestOnly.retain(&bars(&[]), 1.0).is_empty());
    }

    #[test]
    fn test_keep_all() {
        let islands = bars(&[3, 9, 1]);
        assert_eq!(islands.map().dim(), (1, 6, 20));
        assert_eq!(islands.map()[(0, 2, 8)], 2);
        assert_eq!(islands.map()[(0, 1, 0)], 0);
        assert_eq!(LabelClass::KeepAll.retain(&islands, 1.0), vec![1, 2, 3]);
    }

    #[test]
    fn test_bounded_rank_before_volume() {
        // 排名: 4 (12), 1 (10), 2 (8), 3 (5), 5 (2)
        let islands = bars(&[10, 8, 5, 12, 2]);
        let class = LabelClass::BoundedBySize {
            max_count: 3,
            min_volume_mm3: 9.0,
        };
        // 前三名中只有 12 和 10 达到阈值.
        assert_eq!(class.retain(&islands, 1.0), vec![4, 1]);

        // 体积翻倍: 前三名全部达到阈值, 第四名 (10 mm3) 虽然达到阈值但排名超限.
        assert_eq!(class.retain(&islands, 2.0), vec![4, 1, 2]);
    }

    #[test]
    fn test_ribs_bound() {
        let lens = [15; 15];
        let islands = bars(&lens);
        // 15 个体素 * 100 mm3 = 1500 mm3, 全部达到阈值, 但只保留 12 个.
        let kept = LabelClass::RIBS.retain(&islands, 100.0);
        assert_eq!(kept, (1..=12).collect::<Vec<_>>());
        // 单个体素 1 mm3, 全部不足 1000 mm3.
        assert!(LabelClass::RIBS.retain(&islands, 1.0).is_empty());
    }
}
