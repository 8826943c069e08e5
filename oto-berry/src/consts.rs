//! 通用常量.

/// 单通道掩膜体素值.
pub mod label {
    /// 掩膜中背景的体素值.
    pub const SEG_BACKGROUND: u8 = 0;

    /// 掩膜中前景 (目标结构) 的体素值.
    pub const SEG_FOREGROUND: u8 = 1;

    /// 体素是否是前景?
    #[inline]
    pub const fn is_foreground(p: u8) -> bool {
        !is_background(p)
    }

    /// 体素是否是背景?
    #[inline]
    pub const fn is_background(p: u8) -> bool {
        matches!(p, SEG_BACKGROUND)
    }
}

/// 重采样的目标各向同性体素分辨率, 以毫米为单位.
pub const TARGET_ISO_SPACING_MM: f64 = 0.25;

/// 膜性结构 (内耳, 蜗管, 面神经) 的 margin 扩张距离, 以毫米为单位.
pub const MEMBRANOUS_MARGIN_MM: f64 = 0.3;

/// 耳囊雕刻 margin 相对 z 向体素分辨率的倍数.
pub const CAPSULE_MARGIN_SPACING_FACTOR: f64 = 5.0;

/// 听小骨小连通域过滤的最小体素数.
pub const OSSICLES_MIN_ISLAND: u32 = 50;

/// 乙状窦小连通域过滤的最小体素数.
pub const SIGMOID_MIN_ISLAND: u32 = 500;

/// 批处理默认匹配的体数据文件名后缀.
pub const DEFAULT_VOLUME_SUFFIX: &str = ".nii.gz";
