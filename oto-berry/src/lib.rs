#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 提供颞骨 (temporal bone) CT 体数据的结构化信息、AI
//! 自动分割管线和形态学精化算法.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 分割模型推理由外部 oracle 服务完成 (见 [`oracle`] 模块),
//!   本 crate 只负责编排调用与后处理, 不负责模型本身.
//! 2. 在非期望情况下 (内部几何不变量被破坏), 程序会直接 panic,
//!   而不会导致内存错误. As what Rust promises.
//!
//! # 功能总览
//!
//! ### 3D 体数据与掩膜 ✅
//!
//! nifti 文件加载/保存, HU 体素网格与二值掩膜, 几何一致性校验.
//!
//! 实现位于 `oto-berry/src/data`.
//!
//! ### HU 强度窗口 ✅
//!
//! 以闭区间表示的 Hounsfield 门控窗口, 用于限制单次操作的作用范围.
//!
//! 实现位于 `oto-berry/src/data/window.rs`.
//!
//! ### 三维形态学操作 ✅
//!
//! 物理距离 margin 扩张/收缩 (各向异性感知), 连通域 (island) 过滤,
//! 掩膜间布尔运算.
//!
//! 实现位于 `oto-berry/src/data/morph`.
//!
//! ### 各向同性重采样 ✅
//!
//! 将体数据重采样到目标各向同性分辨率 (默认 0.25mm),
//! 依据原分辨率自动选择三线性或三次插值.
//!
//! 实现位于 `oto-berry/src/data/resample.rs`.
//!
//! ### 结构描述表与分割管线 ✅
//!
//! 六个解剖结构 (内耳/耳囊复合体, 听小骨, 蜗管, 面神经, 乙状窦)
//! 的固定处理序列, 以及逐结构的 oracle 调用 + 精化 + 导出编排.
//!
//! 实现位于 `oto-berry/src/{structure, pipeline}`.
//!
//! ### 批量运行器 ✅
//!
//! 对目录内全部体数据做惰性迭代处理, 单文件失败不影响整批.
//!
//! 实现位于 `oto-berry/src/batch.rs`.

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 3D CT nii 文件基础数据结构.
mod data;

pub use data::morph::{CombineOp, GeometryMismatch, IslandOp};
pub use data::resample::{resample_isotropic, Interpolation};
pub use data::{CtMask, CtVolume, HuWindow, NiftiGeometry};

pub mod consts;

pub mod oracle;

pub mod structure;

pub mod pipeline;

pub mod batch;

pub mod prelude;
