//! 多结构分割流水线.
//!
//! 对单个 (已重采样的) 体数据, 按结构表顺序逐结构执行:
//! 请求 oracle 初始掩膜 (或从空掩膜开始), 依次应用后处理步骤, 导出结果.
//! 单个结构失败只记录失败项, 不中断后续结构.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::data::morph;
use crate::oracle::{OracleError, SegmentOracle};
use crate::structure::{RefineStep, StepOp, StructureSpec};
use crate::{CtMask, CtVolume, GeometryMismatch};

pub mod export;

pub use export::{ExportError, Exporter, NiftiObjExporter, NullExporter};

/// 流水线运行选项.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// 是否逐结构导出掩膜 labelmap.
    pub export_labelmaps: bool,

    /// 是否逐结构导出表面网格.
    pub export_meshes: bool,

    /// 是否为噪声敏感结构启用中值滤波强度参考.
    pub median_filter: bool,

    /// 运行结束后是否额外导出 DICOM 序列.
    pub export_dicom: bool,

    /// 外部取消标记. 置位后流水线在当前结构完成后停止.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            export_labelmaps: true,
            export_meshes: true,
            median_filter: true,
            export_dicom: false,
            cancel: None,
        }
    }
}

impl RunOptions {
    /// 外部取消标记是否已置位?
    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_deref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// 单个结构处理失败的原因.
#[derive(Debug)]
pub enum StructureError {
    /// oracle 调用失败.
    Oracle(OracleError),

    /// 依赖的来源结构不存在 (未定义或本次运行中已失败).
    MissingDependency(&'static str),

    /// 掩膜间几何不一致.
    Geometry(GeometryMismatch),

    /// 结果导出失败.
    Export(ExportError),
}

impl fmt::Display for StructureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oracle(e) => write!(f, "{e}"),
            Self::MissingDependency(src) => write!(f, "dependency {src} is unavailable"),
            Self::Geometry(e) => write!(f, "{e}"),
            Self::Export(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StructureError {}

impl From<OracleError> for StructureError {
    fn from(e: OracleError) -> Self {
        Self::Oracle(e)
    }
}

impl From<GeometryMismatch> for StructureError {
    fn from(e: GeometryMismatch) -> Self {
        Self::Geometry(e)
    }
}

impl From<ExportError> for StructureError {
    fn from(e: ExportError) -> Self {
        Self::Export(e)
    }
}

/// 一次失败记录: 哪个结构, 因何失败.
#[derive(Debug)]
pub struct StructureFailure {
    /// 结构名.
    pub structure: &'static str,

    /// 失败原因.
    pub error: StructureError,
}

/// 成功完成的各结构掩膜, 按执行顺序存储.
#[derive(Debug, Default)]
pub struct SegmentationResult {
    masks: Vec<(&'static str, CtMask)>,
    // 纯种子结构名 (labelmap 与网格均不导出). 不参与合并 labelmap.
    hidden: Vec<&'static str>,
}

impl SegmentationResult {
    /// 按结构名查找掩膜.
    pub fn mask(&self, name: &str) -> Option<&CtMask> {
        self.masks
            .iter()
            .find_map(|(n, m)| (*n == name).then_some(m))
    }

    /// 所有 (结构名, 掩膜) 对, 按执行顺序.
    #[inline]
    pub fn masks(&self) -> &[(&'static str, CtMask)] {
        &self.masks
    }

    /// 完成的结构个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// 是否没有任何结构完成?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// 把所有可导出结构合并成一张多标签 labelmap.
    ///
    /// 纯种子结构 (如内耳) 不上色, 其占据的区域归后续雕刻出的结构.
    /// 标签值为结构在参与合并的序列中的序号加一; 重叠体素归先完成的结构.
    /// 无任何完成结构时返回 `None`.
    pub fn combined_labelmap(&self) -> Option<CtMask> {
        let (_, first) = self.masks.first()?;
        let mut labelmap = CtMask::empty_like(first);
        let mut label = 0u8;
        for (name, mask) in &self.masks {
            if self.hidden.contains(name) {
                continue;
            }
            label += 1;
            labelmap.paint_from(mask, label);
        }
        Some(labelmap)
    }
}

/// 单个体数据的流水线运行报告.
#[derive(Debug, Default)]
pub struct VolumeReport {
    /// 成功完成的结构掩膜.
    pub result: SegmentationResult,

    /// 失败的结构及原因.
    pub failures: Vec<StructureFailure>,

    /// 本次运行是否被外部取消.
    pub cancelled: bool,
}

impl VolumeReport {
    /// 所有结构是否全部成功?
    #[inline]
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failures.is_empty()
    }
}

/// 对 `volume` 按结构表 `specs` 依次执行分割流水线.
///
/// 逐结构的导出产物写入 `out_dir`. 单结构失败 (oracle 不可用, 依赖缺失,
/// 导出失败等) 只记入报告, 不影响其余结构.
///
/// # 注意
///
/// `volume` 应当已重采样到目标分辨率, 本函数不再做重采样.
pub fn run<O, E>(
    volume: &CtVolume,
    specs: &[StructureSpec],
    oracle: &mut O,
    exporter: &mut E,
    out_dir: &Path,
    options: &RunOptions,
) -> VolumeReport
where
    O: SegmentOracle + ?Sized,
    E: Exporter + ?Sized,
{
    log::info!("{}: processing started", volume.name());
    let mut report = VolumeReport::default();

    // 噪声敏感结构的强度参考, 按需惰性生成.
    let mut filtered: Option<CtVolume> = None;

    for spec in specs {
        if options.is_cancelled() {
            log::warn!("{}: processing cancelled", volume.name());
            report.cancelled = true;
            break;
        }

        let reference = if spec.median_reference && options.median_filter {
            filtered.get_or_insert_with(|| volume.median_filtered())
        } else {
            volume
        };

        match run_structure(spec, reference, &report.result, oracle) {
            Ok(mask) => {
                log::info!("{}/{}: {} 前景体素", volume.name(), spec.name, mask.count());
                if let Err(e) = export_structure(spec, &mask, exporter, out_dir, options) {
                    log::error!("{}/{}: {e}", volume.name(), spec.name);
                    report.failures.push(StructureFailure {
                        structure: spec.name,
                        error: e,
                    });
                }
                // 导出失败不影响后续结构引用该掩膜.
                if !spec.export_labelmap && !spec.export_mesh {
                    report.result.hidden.push(spec.name);
                }
                report.result.masks.push((spec.name, mask));
            }
            Err(e) => {
                log::error!("{}/{}: {e}", volume.name(), spec.name);
                report.failures.push(StructureFailure {
                    structure: spec.name,
                    error: e,
                });
            }
        }
    }

    log::info!(
        "{}: processing completed ({} 成功, {} 失败)",
        volume.name(),
        report.result.len(),
        report.failures.len()
    );
    report
}

/// 取初始掩膜并依次应用全部后处理步骤.
///
/// `reference` 既是 oracle 的输入, 也是各步骤的强度参考;
/// 对噪声敏感的结构, 调用方会传入中值滤波后的克隆.
fn run_structure<O>(
    spec: &StructureSpec,
    reference: &CtVolume,
    done: &SegmentationResult,
    oracle: &mut O,
) -> Result<CtMask, StructureError>
where
    O: SegmentOracle + ?Sized,
{
    let mut mask = match spec.model {
        Some(model) => oracle.segment(reference, model)?,
        None => CtMask::empty_like(reference),
    };

    for step in &spec.steps {
        apply_step(&mut mask, step, reference, done)?;
    }
    Ok(mask)
}

/// 应用单个后处理步骤, 窗口门控交由 [`morph::gated`] 处理.
fn apply_step(
    mask: &mut CtMask,
    step: &RefineStep,
    reference: &CtVolume,
    done: &SegmentationResult,
) -> Result<(), StructureError> {
    match &step.op {
        StepOp::Margin(size) => {
            let mm = size.resolve(reference);
            morph::gated(mask, reference, step.window, |m| {
                m.grow_margin(mm);
                Ok(())
            })?;
        }
        StepOp::Islands(op) => {
            morph::gated(mask, reference, step.window, |m| {
                m.filter_islands(*op);
                Ok(())
            })?;
        }
        StepOp::Combine { op, source } => {
            let src = done
                .mask(source)
                .ok_or(StructureError::MissingDependency(*source))?;
            morph::gated(mask, reference, step.window, |m| m.combine(src, *op))?;
        }
    }
    Ok(())
}

fn export_structure<E>(
    spec: &StructureSpec,
    mask: &CtMask,
    exporter: &mut E,
    out_dir: &Path,
    options: &RunOptions,
) -> Result<(), StructureError>
where
    E: Exporter + ?Sized,
{
    // 结构表与运行选项都允许时才导出.
    if spec.export_labelmap && options.export_labelmaps {
        exporter.save_labelmap(out_dir, spec.name, mask)?;
    }
    if spec.export_mesh && options.export_meshes {
        exporter.save_mesh(out_dir, spec.name, mask)?;
    }
    Ok(())
}
