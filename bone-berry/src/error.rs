//! 运行时错误.

use crate::Idx3d;
use thiserror::Error;

/// 本 crate 所有可失败操作的返回类型.
pub type Result<T> = std::result::Result<T, BoneError>;

/// 读写、后处理或子分割修复过程中的错误.
///
/// 所有错误都是致命的: 出错的那一轮处理不会写出任何文件.
/// "标签在输入中不存在" 不属于错误, 只会以 `log::warn!` 的形式报告.
#[derive(Debug, Error)]
pub enum BoneError {
    /// 底层 I/O 错误 (文件不存在, 不可写等).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// nifti 文件无法解析或写出.
    #[error("nifti error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    /// 文件不是 3D 体数据. 参数为实际维数.
    #[error("expected a 3D volume, found {0} dimension(s)")]
    NotAVolume(usize),

    /// 两个体数据 (或体数据与新数组) 的形状不一致.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// 期望的形状.
        expected: Idx3d,
        /// 实际的形状.
        found: Idx3d,
    },

    /// 体数据某一轴的长度超出 nifti-1 header 的表示范围. 参数为 `(z, h, w)` 形状.
    #[error("shape {0:?} does not fit in a nifti-1 header")]
    TooLarge(Idx3d),

    /// 模型名称没有对应的标签分类表.
    #[error("no label class assignment for model `{0}`")]
    UnknownLabelConfiguration(String),

    /// 同一个标签被分配到了多个标签类.
    #[error("label {0} is assigned to more than one label class")]
    OverlappingLabelClass(u8),

    /// 无法解析或退化的方向信息.
    #[error("invalid orientation: {0}")]
    InvalidOrientation(String),
}
