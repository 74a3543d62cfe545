#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 对 CT 骨骼分割模型输出的 nifti 标签做连通域后处理,
//! 并修复皮质/松质子分割与骨骼分割之间的一致性.
//!
//! 该 crate 只包含确定性的 CPU 计算, 不涉及神经网络推理, 模型下载与命令行解析.
//!
//! # 注意
//!
//! 1. 所有算法都在规范 (RAS) 方向下进行, 数组按 `(z, h, w)` 即 `(S, A, R)` 组织.
//!   读入时自动转换, 写出时自动恢复原始方向.
//! 2. 标签值以 `u8` 保存, 背景为 0.
//!
//! # 开发计划
//!
//! ### 方向感知的 nifti 读写 ✅
//!
//! 由 sform / qform / pixdim 推断方向码, 支持任意轴置换与翻转.
//! 原始方向写出时 header 逐位保持.
//!
//! 实现位于 `bone-berry/src/data`.
//!
//! ### 6-相邻连通域分析 ✅
//!
//! 实现位于 `bone-berry/src/island`.
//!
//! ### 标签保留策略与逐标签后处理 ✅
//!
//! 三类策略: 只保留最大岛, 全部保留, 肋骨 (按排名与体积双重限制).
//! low / medium / high 三个模型各自的标签分类表.
//!
//! 实现位于 `bone-berry/src/post_proc/{policy, pipeline}.rs`.
//!
//! ### 皮质/松质子分割修复 ✅
//!
//! 体素匹配, 皮质边缘修正, 边界安全修正.
//!
//! 实现位于 `bone-berry/src/post_proc/subseg.rs`.
//!
//! ### 并行版本 ✅
//!
//! `rayon` feature 打开时提供 `par_*` 版本, 结果与串行版本完全一致.
//!
//! ### 逐岛统计导出 ⌛️
//!
//! 目前报告只精确到标签, 没有保留每个岛的质心与包围盒.

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 3D nii 标签基础数据结构.
mod data;

pub use data::orientation::{self, Affine, AxisCode, Orientation, Reorientation};
pub use data::{LabeledVolume, NiftiHeaderAttr};

pub mod consts;
pub mod error;

pub use error::{BoneError, Result};

pub mod island;

pub mod naming;
pub mod post_proc;
pub mod prelude;
