#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// HU 强度窗口, 以闭区间 \[low, high\] 表示.
///
/// 该窗口用于门控单次掩膜操作: 只有 HU 值落在窗口内的体素允许被该次操作修改,
/// 窗口本身不改变底层 HU 值. 该窗口是只读的. 若要修改窗口参数,
/// 你应该创建新的实例.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HuWindow {
    low: f32,
    high: f32,
}

impl HuWindow {
    /// 构建 HU 窗口.
    ///
    /// `low` 和 `high` 必须在合理范围内且 `low <= high`, 否则返回 `None`.
    pub fn new(low: f32, high: f32) -> Option<HuWindow> {
        if (-1e5..=1e5).contains(&low) && (-1e5..=1e5).contains(&high) && low <= high {
            Some(Self { low, high })
        } else {
            None
        }
    }

    /// 窗下限.
    #[inline]
    pub fn low(&self) -> f32 {
        self.low
    }

    /// 窗上限.
    #[inline]
    pub fn high(&self) -> f32 {
        self.high
    }

    /// 判断 `hu` 是否落在窗口闭区间内.
    ///
    /// 无意义的 HU 值 (如 inf, NaN) 一律视为窗外.
    #[inline]
    pub fn contains(&self, hu: f32) -> bool {
        hu.is_finite() && self.low <= hu && hu <= self.high
    }
}
