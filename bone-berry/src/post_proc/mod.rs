//! 分割结果的后处理.
//!
//! - [`policy`]: 标签保留策略与各模型的标签分类表;
//! - [`pipeline`]: 基于连通域的逐标签后处理;
//! - [`subseg`]: 皮质/松质子分割的一致性修复.

pub mod pipeline;
pub mod policy;
pub mod subseg;

pub use pipeline::{
    postprocess, postprocess_array, postprocess_file, LabelReport, PostprocessReport,
    Postprocessed,
};
pub use policy::{LabelClass, LabelClassAssignment, ModelKind};
pub use subseg::{reconcile, reconcile_array, reconcile_files, SubsegConfig};

#[cfg(feature = "rayon")]
pub use pipeline::{par_postprocess, par_postprocess_array};
#[cfg(feature = "rayon")]
pub use subseg::{par_reconcile, par_reconcile_array};
