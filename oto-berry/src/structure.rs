//! 颞骨结构定义表.
//!
//! 每个结构由一条 [`StructureSpec`] 描述: 初始掩膜来源 (oracle 模型或空掩膜),
//! 随后按顺序执行的一串后处理步骤, 以及导出参数.
//! 结构表整体有固定顺序, 流水线按该顺序逐结构执行.

use once_cell::sync::Lazy;

use crate::consts::*;
use crate::data::HuWindow;
use crate::{CombineOp, IslandOp, NiftiGeometry};

/// margin 扩张/收缩距离的表示方式.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MarginSize {
    /// 固定物理距离, 以毫米为单位. 正值扩张, 负值收缩.
    Mm(f64),

    /// z 向体素分辨率的倍数, 在运行时根据体数据几何换算成毫米.
    SpacingZTimes(f64),
}

impl MarginSize {
    /// 换算成以毫米为单位的有符号距离.
    pub fn resolve<G: NiftiGeometry>(&self, geom: &G) -> f64 {
        match *self {
            Self::Mm(mm) => mm,
            Self::SpacingZTimes(k) => k * geom.z_mm(),
        }
    }
}

/// 单个后处理步骤的操作内容.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOp {
    /// 按物理距离扩张或收缩掩膜.
    Margin(MarginSize),

    /// 连通域过滤.
    Islands(IslandOp),

    /// 与先前已完成结构 `source` 的掩膜做布尔合并.
    Combine {
        /// 合并方式.
        op: CombineOp,
        /// 来源结构名. 必须是结构表中更靠前的结构.
        source: &'static str,
    },
}

/// 带可选强度门控的后处理步骤.
///
/// `window` 只门控本步骤: 参考体数据中 HU 值落在窗外的体素不会被本步骤修改,
/// 但对后续步骤仍然完全可见.
#[derive(Clone, Debug, PartialEq)]
pub struct RefineStep {
    /// 操作内容.
    pub op: StepOp,

    /// 本步骤的强度门控窗口.
    pub window: Option<HuWindow>,
}

impl RefineStep {
    /// 构建无门控的步骤.
    #[inline]
    pub fn plain(op: StepOp) -> Self {
        Self { op, window: None }
    }

    /// 构建带门控窗口的步骤.
    #[inline]
    pub fn gated(op: StepOp, window: HuWindow) -> Self {
        Self {
            op,
            window: Some(window),
        }
    }
}

/// 单个待分割结构的完整描述.
#[derive(Clone, Debug)]
pub struct StructureSpec {
    /// 结构名, 同时作为导出文件的主名.
    pub name: &'static str,

    /// oracle 模型名. `None` 表示不调用 oracle, 从空掩膜开始
    /// (该结构完全由后处理步骤雕刻得到).
    pub model: Option<&'static str>,

    /// 展示颜色, RGB 各分量取值 \[0, 1\].
    pub color: [f32; 3],

    /// 按顺序执行的后处理步骤.
    pub steps: Vec<RefineStep>,

    /// 是否导出该结构的 labelmap.
    pub export_labelmap: bool,

    /// 是否导出该结构的表面网格.
    pub export_mesh: bool,

    /// 后处理步骤是否以中值滤波后的体数据为强度参考.
    ///
    /// 对噪声敏感的结构用滤波后数据门控, 其余结构保持原始 HU 值.
    pub median_reference: bool,
}

impl StructureSpec {
    /// 第一个带门控步骤的窗口, 无则返回 `None`.
    pub fn primary_window(&self) -> Option<HuWindow> {
        self.steps.iter().find_map(|s| s.window)
    }

    /// 第一个小连通域过滤步骤的体素数阈值, 无则返回 `None`.
    pub fn min_island_size(&self) -> Option<u32> {
        self.steps.iter().find_map(|s| match s.op {
            StepOp::Islands(IslandOp::RemoveSmallerThan(n)) => Some(n),
            _ => None,
        })
    }
}

/// 内置结构表 ([`default_structures`] 的全局只读版本).
pub static DEFAULT_STRUCTURES: Lazy<Vec<StructureSpec>> = Lazy::new(default_structures);

/// 在内置结构表中按名字查找结构.
pub fn find_structure(name: &str) -> Option<&'static StructureSpec> {
    DEFAULT_STRUCTURES.iter().find(|s| s.name == name)
}

/// 表中常量窗口的构建入口. 常量非法属于编程错误, 直接 panic.
fn win(low: f32, high: f32) -> HuWindow {
    HuWindow::new(low, high).expect("内置结构表窗口常量非法")
}

/// 构建内置的颞骨六结构表, 按固定的执行顺序排列.
///
/// 顺序不可随意调整: 耳囊从内耳掩膜雕刻得到, 必须排在内耳之后.
pub fn default_structures() -> Vec<StructureSpec> {
    vec![
        // 内耳 (膜迷路): oracle 结果在软组织窗内向外扩张, 补齐欠分割边缘.
        // 本身不导出, 仅作为耳囊雕刻的种子.
        StructureSpec {
            name: "inner_ear",
            model: Some("inner_ear"),
            color: [1.0, 0.0, 0.0],
            steps: vec![RefineStep::gated(
                StepOp::Margin(MarginSize::Mm(MEMBRANOUS_MARGIN_MM)),
                win(-300.0, 550.0),
            )],
            export_labelmap: false,
            export_mesh: false,
            median_reference: false,
        },
        // 耳囊: 无专用模型, 从内耳掩膜出发, 在骨窗内向外雕刻出包绕的致密骨壳.
        StructureSpec {
            name: "otic_capsule",
            model: None,
            color: [0.89, 0.92, 0.65],
            steps: vec![
                RefineStep::plain(StepOp::Combine {
                    op: CombineOp::Copy,
                    source: "inner_ear",
                }),
                RefineStep::gated(
                    StepOp::Margin(MarginSize::SpacingZTimes(CAPSULE_MARGIN_SPACING_FACTOR)),
                    win(650.0, 2500.0),
                ),
                RefineStep::plain(StepOp::Islands(IslandOp::KeepLargest)),
            ],
            export_labelmap: true,
            export_mesh: true,
            median_reference: false,
        },
        // 听小骨: 去除骨窗外的假阳性后过滤小碎块.
        StructureSpec {
            name: "ossicles",
            model: Some("ossicles"),
            color: [1.0, 1.0, 0.88],
            steps: vec![RefineStep::gated(
                StepOp::Islands(IslandOp::RemoveSmallerThan(OSSICLES_MIN_ISLAND)),
                win(0.0, 2500.0),
            )],
            export_labelmap: true,
            export_mesh: true,
            median_reference: false,
        },
        // 蜗管: 与内耳同理, 在专属软组织窗内扩张.
        StructureSpec {
            name: "cochlear_duct",
            model: Some("cochlear_duct"),
            color: [1.0, 0.0, 0.0],
            steps: vec![RefineStep::gated(
                StepOp::Margin(MarginSize::Mm(MEMBRANOUS_MARGIN_MM)),
                win(-410.0, 750.0),
            )],
            export_labelmap: true,
            export_mesh: true,
            median_reference: false,
        },
        // 面神经: 对噪声敏感, 以中值滤波后的体数据做强度参考.
        StructureSpec {
            name: "facial_nerve",
            model: Some("facial_nerve"),
            color: [0.9, 1.0, 0.0],
            steps: vec![RefineStep::gated(
                StepOp::Margin(MarginSize::Mm(MEMBRANOUS_MARGIN_MM)),
                win(-300.0, 500.0),
            )],
            export_labelmap: true,
            export_mesh: true,
            median_reference: true,
        },
        // 乙状窦: 只做大尺度碎块清理.
        StructureSpec {
            name: "sigmoid_sinus",
            model: Some("sigmoid_sinus"),
            color: [0.27, 0.45, 0.77],
            steps: vec![RefineStep::plain(StepOp::Islands(IslandOp::RemoveSmallerThan(
                SIGMOID_MIN_ISLAND,
            )))],
            export_labelmap: true,
            export_mesh: true,
            median_reference: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CtVolume;
    use ndarray::Array3;

    #[test]
    fn test_structure_order_is_fixed() {
        let names: Vec<_> = DEFAULT_STRUCTURES.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            [
                "inner_ear",
                "otic_capsule",
                "ossicles",
                "cochlear_duct",
                "facial_nerve",
                "sigmoid_sinus"
            ]
        );
    }

    #[test]
    fn test_combine_sources_appear_earlier() {
        let specs = default_structures();
        for (idx, spec) in specs.iter().enumerate() {
            for step in &spec.steps {
                if let StepOp::Combine { source, .. } = step.op {
                    let src_idx = specs.iter().position(|s| s.name == source);
                    assert!(matches!(src_idx, Some(i) if i < idx), "{source} 必须排在 {} 之前", spec.name);
                }
            }
        }
    }

    #[test]
    fn test_margin_resolution() {
        let v = CtVolume::fake("demo", Array3::zeros((4, 4, 4)), [0.5, 0.25, 0.25]);
        assert_eq!(MarginSize::Mm(0.3).resolve(&v), 0.3);
        assert_eq!(MarginSize::SpacingZTimes(5.0).resolve(&v), 2.5);
    }

    #[test]
    fn test_spec_accessors() {
        let ossicles = find_structure("ossicles").unwrap();
        assert_eq!(ossicles.min_island_size(), Some(OSSICLES_MIN_ISLAND));
        assert_eq!(ossicles.primary_window(), HuWindow::new(0.0, 2500.0));

        let capsule = find_structure("otic_capsule").unwrap();
        assert!(capsule.model.is_none());
        assert_eq!(capsule.min_island_size(), None);
        assert_eq!(capsule.primary_window(), HuWindow::new(650.0, 2500.0));

        assert!(find_structure("stapes").is_none());
    }
}
