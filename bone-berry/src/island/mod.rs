//! 3D 连通域 ("岛") 分析.
//!
//! 两个前景体素属于同一个岛, 当且仅当存在一条从一个体素到另一个体素的
//! 钻石型 (6-相邻, 仅共面) 路径, 且路径上的所有体素都是前景.

use std::cmp::Reverse;
use std::collections::VecDeque;

use ndarray::{Array3, ArrayView3};
use ordered_float::OrderedFloat;

use crate::Idx3d;

/// 岛编号. 同一次分析中从 1 开始连续编号, 0 代表背景.
pub type IslandId = u32;

/// 一个二值掩膜上的全部岛.
#[derive(Debug, Clone)]
pub struct Islands {
    /// 每个体素所属的岛编号, 背景为 0.
    map: Array3<IslandId>,

    /// `sizes[id - 1]` 为编号 `id` 的岛的体素个数.
    sizes: Vec<usize>,
}

/// 获取 `pos` 前后上下左右六个点中不越界的那些.
#[inline]
fn diamond_neighbours((z, h, w): Idx3d, (lz, lh, lw): Idx3d) -> impl Iterator<Item = Idx3d> {
    [
        (z.wrapping_sub(1), h, w),
        (z.saturating_add(1), h, w),
        (z, h.wrapping_sub(1), w),
        (z, h.saturating_add(1), w),
        (z, h, w.wrapping_sub(1)),
        (z, h, w.saturating_add(1)),
    ]
    .into_iter()
    .filter(move |&(a, b, c)| a < lz && b < lh && c < lw)
}

impl Islands {
    /// 按照 6-相邻规则标记 `mask` 中的所有岛.
    ///
    /// 体素按行优先顺序扫描, 岛按其第一个被扫描到的体素的先后顺序编号,
    /// 因此对同一掩膜多次运行的结果完全一致.
    pub fn label(mask: ArrayView3<bool>) -> Self {
        let dim = mask.dim();
        let mut map = Array3::<IslandId>::zeros(dim);
        let mut sizes = Vec::new();
        let mut bfs_q = VecDeque::with_capacity(64);

        for (pos, &fg) in mask.indexed_iter() {
            if !fg || map[pos] != 0 {
                continue;
            }
            let id = sizes.len() as IslandId + 1;
            let mut size = 0usize;
            map[pos] = id;
            bfs_q.push_back(pos);

            while let Some(cur) = bfs_q.pop_front() {
                size += 1;
                for neigh in diamond_neighbours(cur, dim) {
                    if mask[neigh] && map[neigh] == 0 {
                        map[neigh] = id;
                        bfs_q.push_back(neigh);
                    }
                }
            }
            sizes.push(size);
        }

        Self { map, sizes }
    }

    /// 岛的个数.
    #[inline]
    pub fn count(&self) -> usize {
        self.sizes.len()
    }

    /// 是否不存在任何岛?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// 岛编号图.
    #[inline]
    pub fn map(&self) -> ArrayView3<'_, IslandId> {
        self.map.view()
    }

    /// 编号 `id` 的岛的体素个数. 编号不存在时返回 0.
    #[inline]
    pub fn voxel_count(&self, id: IslandId) -> usize {
        (id as usize)
            .checked_sub(1)
            .and_then(|i| self.sizes.get(i))
            .copied()
            .unwrap_or(0)
    }

    /// 编号 `id` 的岛的实际体积, 以立方毫米为单位. `voxel` 为单个体素体积.
    #[inline]
    pub fn volume_mm3(&self, id: IslandId, voxel: f64) -> f64 {
        self.voxel_count(id) as f64 * voxel
    }

    /// 按实际体积从大到小排列的岛编号. 体积相同时编号小者在前.
    pub fn rank_by_size_desc(&self, voxel: f64) -> Vec<IslandId> {
        let mut ids: Vec<IslandId> = (1..=self.count() as IslandId).collect();
        ids.sort_by_key(|&id| (Reverse(OrderedFloat(self.volume_mm3(id, voxel))), id));
        ids
    }

}
