//! 通用常量.

/// 子分割 (皮质/松质) 标签值.
pub mod subseg {
    /// 背景 (非骨骼) 体素值.
    pub const BACKGROUND: u8 = 0;

    /// 松质骨 (trabecular) 体素值.
    pub const TRABECULAR: u8 = 1;

    /// 皮质骨 (cortical) 体素值.
    pub const CORTICAL: u8 = 2;

    /// 体素是否是背景?
    #[inline]
    pub const fn is_background(p: u8) -> bool {
        matches!(p, BACKGROUND)
    }

    /// 体素是否是松质骨?
    #[inline]
    pub const fn is_trabecular(p: u8) -> bool {
        matches!(p, TRABECULAR)
    }
}

/// 粗分割标签中, 背景的体素值.
pub const LABEL_BACKGROUND: u8 = 0;

/// 肋骨类标签最多保留的岛个数.
pub const RIB_MAX_ISLANDS: usize = 12;

/// 肋骨类标签单个岛的最小保留体积, 以立方毫米为单位.
pub const RIB_MIN_ISLAND_MM3: f64 = 1000.0;

/// 皮质边缘修正时检查的立方邻域半径 (体素个数).
pub const CORTICAL_EDGE_RADIUS: usize = 1;

/// 后处理后的分割文件名后缀.
pub const POSTPROCESSED_SUFFIX: &str = "_postprocessed";

/// 修复后的子分割文件名后缀.
pub const SUBSEG_SUFFIX: &str = "_subseg";

/// 统一使用的 nifti 压缩文件扩展名.
pub const NII_GZ: &str = ".nii.gz";

/// 未压缩的 nifti 文件扩展名.
pub const NII: &str = ".nii";
