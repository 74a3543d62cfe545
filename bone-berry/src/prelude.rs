//! 🦴
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::Idx3d;

pub use crate::data::orientation::{Affine, Orientation, Reorientation};
pub use crate::data::{LabeledVolume, NiftiHeaderAttr};

pub use crate::consts::subseg::{CORTICAL, TRABECULAR};
pub use crate::consts::{RIB_MAX_ISLANDS, RIB_MIN_ISLAND_MM3};

pub use crate::error::{BoneError, Result};
pub use crate::island::{IslandId, Islands};

pub use crate::post_proc::{
    postprocess, postprocess_file, reconcile, reconcile_files, LabelClass, LabelClassAssignment,
    ModelKind, PostprocessReport, Postprocessed, SubsegConfig,
};

#[cfg(feature = "rayon")]
pub use crate::post_proc::{par_postprocess, par_reconcile};

pub use crate::naming;
