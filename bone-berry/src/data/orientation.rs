//! 体数据的空间方向.
//!
//! nifti 的世界坐标系是 RAS+: x 轴正方向指向患者右侧 (Right), y 轴指向前方 (Anterior),
//! z 轴指向头侧 (Superior). 每个数组轴都在仿射矩阵中对应一列, 该列的主分量
//! 决定了该轴 "沿索引增长方向指向" 的解剖学方向, 三个轴拼起来就是诸如 "RAS",
//! "LPS" 之类的三字母方向码.
//!
//! 所有连通域分析都在规范方向 "RAS" 下进行, 写出前再恢复成原始方向.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use itertools::iproduct;
use ndarray::{ArrayBase, Axis, Ix3, RawData};
use nifti::NiftiHeader;

use crate::error::{BoneError, Result};

/// 仿射矩阵列向量被视为零向量的阈值.
const DEGENERATE_EPS: f64 = 1e-12;

/// 单个数组轴沿索引增长方向所指向的解剖学方向.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AxisCode {
    /// 右.
    R,
    /// 左.
    L,
    /// 前.
    A,
    /// 后.
    P,
    /// 上 (头侧).
    S,
    /// 下 (足侧).
    I,
}

impl AxisCode {
    /// 该方向所属的世界坐标轴: 0 (左右), 1 (前后), 2 (上下).
    #[inline]
    pub const fn world_axis(&self) -> usize {
        match self {
            AxisCode::R | AxisCode::L => 0,
            AxisCode::A | AxisCode::P => 1,
            AxisCode::S | AxisCode::I => 2,
        }
    }

    /// 该方向是否与 RAS+ 世界坐标轴的正方向一致?
    #[inline]
    pub const fn is_positive(&self) -> bool {
        matches!(self, AxisCode::R | AxisCode::A | AxisCode::S)
    }

    /// 由世界坐标轴和符号构建方向.
    const fn from_world(axis: usize, positive: bool) -> Self {
        match (axis, positive) {
            (0, true) => AxisCode::R,
            (0, false) => AxisCode::L,
            (1, true) => AxisCode::A,
            (1, false) => AxisCode::P,
            (_, true) => AxisCode::S,
            (_, false) => AxisCode::I,
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'R' => Some(AxisCode::R),
            'L' => Some(AxisCode::L),
            'A' => Some(AxisCode::A),
            'P' => Some(AxisCode::P),
            'S' => Some(AxisCode::S),
            'I' => Some(AxisCode::I),
            _ => None,
        }
    }

    const fn as_char(&self) -> char {
        match self {
            AxisCode::R => 'R',
            AxisCode::L => 'L',
            AxisCode::A => 'A',
            AxisCode::P => 'P',
            AxisCode::S => 'S',
            AxisCode::I => 'I',
        }
    }
}

/// 三字母方向码, 按 nifti 数组轴 `(x, y, z)` 的顺序存储.
///
/// 合法的方向码中, 三个世界坐标轴恰好各出现一次.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Orientation([AxisCode; 3]);

impl Orientation {
    /// 规范方向. 所有算法都在该方向下运行.
    pub const RAS: Orientation = Orientation([AxisCode::R, AxisCode::A, AxisCode::S]);

    /// DICOM 惯用方向.
    pub const LPS: Orientation = Orientation([AxisCode::L, AxisCode::P, AxisCode::S]);

    /// 由三个轴方向构建. 如果某个世界坐标轴出现不止一次, 则返回 `Err`.
    pub fn new(codes: [AxisCode; 3]) -> Result<Self> {
        let mut seen = [false; 3];
        for c in codes.iter() {
            if std::mem::replace(&mut seen[c.world_axis()], true) {
                return Err(BoneError::InvalidOrientation(format!(
                    "axis {} repeated in {}",
                    c.as_char(),
                    Orientation(codes)
                )));
            }
        }
        Ok(Self(codes))
    }

    /// 获取三个轴方向.
    #[inline]
    pub fn codes(&self) -> [AxisCode; 3] {
        self.0
    }

    /// 从仿射矩阵推断方向码.
    ///
    /// 对于斜切 (oblique) 扫描, 每个数组轴取其列向量中绝对值最大且尚未被占用的世界轴.
    pub fn from_affine(affine: &Affine) -> Result<Self> {
        let cols = affine.columns();
        let mut candidates: Vec<(f64, usize, usize)> = iproduct!(0..3, 0..3)
            .map(|(i, j)| (cols[i][j].abs(), i, j))
            .collect();
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut codes = [None; 3];
        let mut used = [false; 3];
        for (magnitude, i, j) in candidates {
            if magnitude <= DEGENERATE_EPS {
                break;
            }
            if codes[i].is_none() && !used[j] {
                codes[i] = Some(AxisCode::from_world(j, cols[i][j] > 0.0));
                used[j] = true;
            }
        }

        match codes {
            [Some(x), Some(y), Some(z)] => Self::new([x, y, z]),
            _ => Err(BoneError::InvalidOrientation(format!(
                "degenerate affine {:?}",
                affine.rows
            ))),
        }
    }
}

impl FromStr for Orientation {
    type Err = BoneError;

    fn from_str(s: &str) -> Result<Self> {
        let codes: Vec<AxisCode> = s.chars().filter_map(AxisCode::from_char).collect();
        match codes.as_slice() {
            [x, y, z] if s.chars().count() == 3 => Self::new([*x, *y, *z]),
            _ => Err(BoneError::InvalidOrientation(format!("`{s}`"))),
        }
    }
}

impl Display for Orientation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [x, y, z] = self.0;
        write!(f, "{}{}{}", x.as_char(), y.as_char(), z.as_char())
    }
}

/// 体素索引 `(x, y, z)` 到 RAS+ 世界坐标 (毫米) 的仿射变换. 只保存前三行.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Affine {
    rows: [[f64; 4]; 3],
}

impl Affine {
    /// 直接由前三行构建.
    #[inline]
    pub fn from_rows(rows: [[f64; 4]; 3]) -> Self {
        Self { rows }
    }

    /// 从 nifti header 中读取仿射变换.
    ///
    /// 优先使用 sform (`sform_code > 0`), 其次是 qform 四元数 (`qform_code > 0`),
    /// 两者都不可用时退化为仅由 `pixdim` 组成的对角矩阵.
    pub fn from_header(h: &NiftiHeader) -> Self {
        if h.sform_code > 0 {
            let row = |r: &[f32; 4]| r.map(f64::from);
            return Self::from_rows([row(&h.srow_x), row(&h.srow_y), row(&h.srow_z)]);
        }

        let [_, dx, dy, dz, ..] = h.pixdim.map(f64::from);
        if h.qform_code <= 0 {
            return Self::from_rows([
                [dx, 0.0, 0.0, 0.0],
                [0.0, dy, 0.0, 0.0],
                [0.0, 0.0, dz, 0.0],
            ]);
        }

        // 四元数 -> 旋转矩阵, 参见 nifti1.h 中 qform 的定义.
        let (b, c, d) = (
            f64::from(h.quatern_b),
            f64::from(h.quatern_c),
            f64::from(h.quatern_d),
        );
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if h.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let r = [
            [
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
            ],
            [
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
            ],
            [
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - c * c - b * b,
            ],
        ];
        let scale = [dx, dy, dz * qfac];
        let offset = [
            f64::from(h.quatern_x),
            f64::from(h.quatern_y),
            f64::from(h.quatern_z),
        ];
        let mut rows = [[0.0; 4]; 3];
        for (i, row) in rows.iter_mut().enumerate() {
            for j in 0..3 {
                row[j] = r[i][j] * scale[j];
            }
            row[3] = offset[i];
        }
        Self { rows }
    }

    /// 三个数组轴在世界坐标系下的列向量 (包含体素间距).
    pub fn columns(&self) -> [[f64; 3]; 3] {
        let mut cols = [[0.0; 3]; 3];
        for (i, col) in cols.iter_mut().enumerate() {
            for (j, v) in col.iter_mut().enumerate() {
                *v = self.rows[j][i];
            }
        }
        cols
    }

    /// 索引 `(0, 0, 0)` 体素中心的世界坐标.
    #[inline]
    pub fn origin(&self) -> [f64; 3] {
        self.rows.map(|r| r[3])
    }

    /// 三个数组轴的体素间距, 即列向量的模.
    pub fn spacing(&self) -> [f64; 3] {
        self.columns()
            .map(|c| c.iter().map(|v| v * v).sum::<f64>().sqrt())
    }

    /// 按照 `reo` 对形状为 `shape` (`(x, y, z)` 顺序) 的数组重定向后,
    /// 新数组对应的仿射变换. 世界坐标保持不变.
    pub fn reoriented(&self, reo: &Reorientation, shape: [usize; 3]) -> Self {
        let cols = self.columns();
        let mut rows = self.rows;
        for d in 0..3 {
            let s = reo.perm[d];
            let sign = if reo.flip[d] { -1.0 } else { 1.0 };
            for j in 0..3 {
                rows[j][d] = sign * cols[s][j];
            }
        }
        for d in (0..3).filter(|d| reo.flip[*d]) {
            let s = reo.perm[d];
            let steps = shape[s].saturating_sub(1) as f64;
            for j in 0..3 {
                rows[j][3] += cols[s][j] * steps;
            }
        }
        Self { rows }
    }

    /// 将该仿射变换作为 sform 写入 `header`, 并停用 qform.
    pub fn write_sform(&self, header: &mut NiftiHeader) {
        let row = |r: &[f64; 4]| r.map(|v| v as f32);
        header.srow_x = row(&self.rows[0]);
        header.srow_y = row(&self.rows[1]);
        header.srow_z = row(&self.rows[2]);
        if header.sform_code <= 0 {
            // NIFTI_XFORM_SCANNER_ANAT
            header.sform_code = 1;
        }
        header.qform_code = 0;
        let [sx, sy, sz] = self.spacing();
        header.pixdim[1] = sx as f32;
        header.pixdim[2] = sy as f32;
        header.pixdim[3] = sz as f32;
    }
}

/// 从一个方向到另一个方向的轴置换与翻转.
///
/// 作用于 `(x, y, z)` 顺序的数组: 新数组的第 `d` 轴来自原数组的第 `perm[d]` 轴,
/// 若 `flip[d]` 为 `true` 则同时反转该轴.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Reorientation {
    perm: [usize; 3],
    flip: [bool; 3],
}

impl Reorientation {
    /// 构建将 `src` 方向的数组变为 `dst` 方向的变换.
    pub fn between(src: Orientation, dst: Orientation) -> Self {
        let mut perm = [0; 3];
        let mut flip = [false; 3];
        for (d, dst_code) in dst.codes().iter().enumerate() {
            // 两个方向码都是合法的, 因此一定能找到对应的世界轴.
            let s = src
                .codes()
                .iter()
                .position(|c| c.world_axis() == dst_code.world_axis())
                .unwrap_or(d);
            perm[d] = s;
            flip[d] = src.codes()[s] != *dst_code;
        }
        Self { perm, flip }
    }

    /// 对 `(x, y, z)` 顺序的数组 (或视图) 施加变换. 不复制数据.
    pub fn apply<S: RawData>(&self, array: ArrayBase<S, Ix3>) -> ArrayBase<S, Ix3> {
        let mut array = array.permuted_axes(self.perm);
        for d in (0..3).filter(|d| self.flip[*d]) {
            array.invert_axis(Axis(d));
        }
        array
    }

    /// 变换后数组的形状.
    #[inline]
    pub fn apply_shape(&self, shape: [usize; 3]) -> [usize; 3] {
        self.perm.map(|s| shape[s])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn orient(s: &str) -> Orientation {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_orientation() {
        assert_eq!(orient("RAS"), Orientation::RAS);
        assert_eq!(orient("lps"), Orientation::LPS);
        assert_eq!(orient("PIR").to_string(), "PIR");
        assert!("RRS".parse::<Orientation>().is_err());
        assert!("RA".parse::<Orientation>().is_err());
        assert!("RASX".parse::<Orientation>().is_err());
        assert!("RXS".parse::<Orientation>().is_err());
    }

    #[test]
    fn test_orientation_from_affine() {
        let ras = Affine::from_rows([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 2.0, 0.0, 0.0],
            [0.0, 0.0, 3.0, 0.0],
        ]);
        assert_eq!(Orientation::from_affine(&ras).unwrap(), Orientation::RAS);

        let lps = Affine::from_rows([
            [-0.8, 0.0, 0.0, 10.0],
            [0.0, -0.8, 0.0, 20.0],
            [0.0, 0.0, 2.5, -30.0],
        ]);
        assert_eq!(Orientation::from_affine(&lps).unwrap(), Orientation::LPS);

        // 斜切扫描: 取主分量.
        let oblique = Affine::from_rows([
            [0.1, 0.0, -0.9, 0.0],
            [0.95, 0.1, 0.0, 0.0],
            [0.0, 1.0, 0.2, 0.0],
        ]);
        assert_eq!(Orientation::from_affine(&oblique).unwrap(), orient("ASL"));

        let degenerate = Affine::from_rows([[0.0; 4]; 3]);
        assert!(Orientation::from_affine(&degenerate).is_err());
    }

    #[test]
    fn test_reorientation_round_trip() {
        let a = Array3::from_shape_fn((2, 3, 4), |(x, y, z)| (x * 100 + y * 10 + z) as u16);
        for s in ["LPS", "PIR", "SAL", "RAS", "ILA"] {
            let to = Reorientation::between(orient(s), Orientation::RAS);
            let back = Reorientation::between(Orientation::RAS, orient(s));
            let canonical = to.apply(a.view());
            assert_eq!(back.apply(canonical), a.view());
        }
        let same = Reorientation::between(Orientation::RAS, Orientation::RAS);
        assert_eq!(same.apply(a.view()), a.view());
    }

    #[test]
    fn test_reorientation_moves_voxels() {
        // LPS -> RAS: 反转 x, y 轴.
        let mut a = Array3::<u8>::zeros((3, 2, 2));
        a[(0, 0, 1)] = 7;
        let reo = Reorientation::between(Orientation::LPS, Orientation::RAS);
        let b = reo.apply(a.view());
        assert_eq!(b.shape(), &[3, 2, 2]);
        assert_eq!(b[(2, 1, 1)], 7);

        // PIR -> RAS: 新 x 来自原 z, 新 y 来自原 x (反转), 新 z 来自原 y (反转).
        let a = Array3::from_shape_fn((2, 3, 4), |(x, y, z)| (x * 100 + y * 10 + z) as u16);
        let reo = Reorientation::between(orient("PIR"), Orientation::RAS);
        assert_eq!(reo.apply_shape([2, 3, 4]), [4, 2, 3]);
        let b = reo.apply(a.view());
        assert_eq!(b[(3, 0, 0)], a[(1, 2, 3)]);
    }

    #[test]
    fn test_affine_reoriented_keeps_world_coordinates() {
        let lps = Affine::from_rows([
            [-0.8, 0.0, 0.0, 10.0],
            [0.0, -0.7, 0.0, 20.0],
            [0.0, 0.0, 2.5, -30.0],
        ]);
        let shape = [5, 6, 7];
        let reo = Reorientation::between(Orientation::LPS, Orientation::RAS);
        let ras = lps.reoriented(&reo, shape);
        assert_eq!(Orientation::from_affine(&ras).unwrap(), Orientation::RAS);

        let world = |aff: &Affine, idx: [f64; 3]| -> [f64; 3] {
            let cols = aff.columns();
            let o = aff.origin();
            [0, 1, 2].map(|j| o[j] + (0..3).map(|i| cols[i][j] * idx[i]).sum::<f64>())
        };
        // LPS 中的 (0, 0, 0) 在 RAS 中是 (4, 5, 0).
        let w1 = world(&lps, [0.0, 0.0, 0.0]);
        let w2 = world(&ras, [4.0, 5.0, 0.0]);
        for j in 0..3 {
            assert!((w1[j] - w2[j]).abs() < 1e-9);
        }
        assert_eq!(ras.spacing(), lps.spacing());
    }

    #[test]
    fn test_qform_identity() {
        let mut h = NiftiHeader::default();
        h.qform_code = 1;
        h.sform_code = 0;
        h.pixdim = [1.0, 0.5, 0.5, 2.0, 0.0, 0.0, 0.0, 0.0];
        h.quatern_b = 0.0;
        h.quatern_c = 0.0;
        h.quatern_d = 1.0;
        // 绕 z 轴旋转 180 度: x, y 取反.
        let affine = Affine::from_header(&h);
        assert_eq!(Orientation::from_affine(&affine).unwrap(), Orientation::LPS);
        assert_eq!(affine.spacing(), [0.5, 0.5, 2.0]);
    }
}
