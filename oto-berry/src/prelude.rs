//! 一次性导入: `use oto_berry::prelude::*;`.

pub use crate::batch::{BatchConfig, BatchReport, VolumeBatchRunner};
pub use crate::consts::label::{SEG_BACKGROUND, SEG_FOREGROUND};
pub use crate::oracle::{PrecomputedOracle, SegmentOracle};
pub use crate::pipeline::{Exporter, NiftiObjExporter, NullExporter, RunOptions};
pub use crate::structure::{default_structures, StructureSpec, DEFAULT_STRUCTURES};
pub use crate::{
    resample_isotropic, CombineOp, CtMask, CtVolume, HuWindow, Idx3d, Interpolation, IslandOp,
    NiftiGeometry,
};
