//! 3D 形态学操作.
//!
//! 所有操作都定义在掩膜 ([`CtMask`]) 上, 以显式参数接收参考体数据与窗口,
//! 不依赖任何隐式共享状态, 因此每个步骤都可以被独立测试.

use super::{CtMask, CtVolume, HuWindow, NiftiGeometry};
use crate::consts::label::*;
use crate::Idx3d;
use ndarray::{Array3, Axis};
use std::fmt;

mod islands;

pub use islands::IslandOp;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 两个掩膜之间的布尔合并方式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CombineOp {
    /// 以右侧掩膜的体素值整体覆盖左侧.
    Copy,

    /// 体素级逻辑或.
    Union,

    /// 从左侧去除右侧的前景体素 (AND-NOT).
    Subtract,
}

/// 掩膜间几何不一致错误.
///
/// 两个掩膜 (或掩膜与体数据) 仅在形状与体素分辨率完全一致时才允许相互运算.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GeometryMismatch {
    /// 左侧 (操作目标) 的形状.
    pub expected: Idx3d,

    /// 右侧 (操作来源) 的形状.
    pub found: Idx3d,
}

impl fmt::Display for GeometryMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mask geometry mismatch: expected {:?}, found {:?}",
            self.expected, self.found
        )
    }
}

impl std::error::Error for GeometryMismatch {}

impl CtMask {
    /// 将 HU 值落在 `window` 之外的前景体素全部清零.
    ///
    /// 该操作不修改 `volume` 本身. 若需要保留原掩膜,
    /// 请使用 [`Self::masked_within`].
    ///
    /// # 注意
    ///
    /// `volume` 必须与掩膜共几何, 否则程序 panic (这是调用方的编程错误).
    pub fn retain_within(&mut self, volume: &CtVolume, window: HuWindow) {
        assert!(self.same_geometry(volume), "掩膜与体数据几何不一致");
        self.data
            .iter_mut()
            .zip(volume.data.iter())
            .for_each(|(pix, &hu)| {
                if is_foreground(*pix) && !window.contains(hu) {
                    *pix = SEG_BACKGROUND;
                }
            });
    }

    /// [`Self::retain_within`] 的非破坏版本, 返回新掩膜, 原掩膜保持不变.
    #[inline]
    pub fn masked_within(&self, volume: &CtVolume, window: HuWindow) -> CtMask {
        let mut ans = self.clone();
        ans.retain_within(volume, window);
        ans
    }

    /// 按物理距离 `distance_mm` 沿三个轴分别扩张 (正值) 或收缩 (负值) 掩膜.
    ///
    /// 每个轴的扩张步数为 `round(|distance_mm| / 该轴分辨率)`,
    /// 因此各向异性体素会在不同轴上走不同的步数. 距离不足半个体素的轴不变化.
    pub fn grow_margin(&mut self, distance_mm: f64) {
        let dilate = distance_mm > 0.0;
        let d = distance_mm.abs();
        let [z_mm, h_mm, w_mm] = self.pix_dim();

        for (axis, mm) in [(0usize, z_mm), (1, h_mm), (2, w_mm)] {
            let steps = (d / mm).round() as usize;
            if steps != 0 {
                axis_margin(&mut self.data, Axis(axis), steps, dilate);
            }
        }
    }

    /// 以 `op` 方式将 `other` 合并进当前掩膜.
    ///
    /// 两侧几何不一致时返回 [`GeometryMismatch`].
    pub fn combine(&mut self, other: &CtMask, op: CombineOp) -> Result<(), GeometryMismatch> {
        if !self.same_geometry(other) {
            return Err(GeometryMismatch {
                expected: self.shape(),
                found: other.shape(),
            });
        }

        let it = self.data.iter_mut().zip(other.data.iter());
        match op {
            CombineOp::Copy => it.for_each(|(a, &b)| *a = b),
            CombineOp::Union => it.for_each(|(a, &b)| {
                if is_foreground(b) {
                    *a = SEG_FOREGROUND;
                }
            }),
            CombineOp::Subtract => it.for_each(|(a, &b)| {
                if is_foreground(b) {
                    *a = SEG_BACKGROUND;
                }
            }),
        }
        Ok(())
    }

    /// 将 `other` 的前景体素以标签值 `label` 画入当前标签图.
    ///
    /// 已有标签的体素保持不变, 即先画入的结构拥有重叠优先权.
    ///
    /// # 注意
    ///
    /// `other` 必须与当前对象共几何, 否则程序 panic.
    pub fn paint_from(&mut self, other: &CtMask, label: u8) {
        assert!(self.same_geometry(other), "标签图与掩膜几何不一致");
        assert_ne!(label, SEG_BACKGROUND);
        self.data
            .iter_mut()
            .zip(other.data.iter())
            .for_each(|(dst, &src)| {
                if is_foreground(src) && is_background(*dst) {
                    *dst = label;
                }
            });
    }
}

/// 在可选窗口门控下执行一次掩膜操作.
///
/// 窗口只门控这一次操作: 操作结束后, HU 值落在窗外的体素被恢复为操作前的值,
/// 但它们对后续操作仍然完全可见.
pub(crate) fn gated<F>(
    mask: &mut CtMask,
    volume: &CtVolume,
    window: Option<HuWindow>,
    op: F,
) -> Result<(), GeometryMismatch>
where
    F: FnOnce(&mut CtMask) -> Result<(), GeometryMismatch>,
{
    let Some(window) = window else {
        return op(mask);
    };

    assert!(mask.same_geometry(volume), "掩膜与体数据几何不一致");
    let snapshot = mask.clone();
    op(mask)?;

    // 恢复窗外体素
    mask.data
        .iter_mut()
        .zip(snapshot.data.iter())
        .zip(volume.data.iter())
        .for_each(|((cur, &old), &hu)| {
            if !window.contains(hu) {
                *cur = old;
            }
        });
    Ok(())
}

/// 沿 `axis` 方向对二值数组做 `steps` 步扩张或收缩.
///
/// 实现方式为逐 lane 的两趟最近目标距离扫描, 单 lane 开销 O(n).
fn axis_margin(data: &mut Array3<u8>, axis: Axis, steps: usize, dilate: bool) {
    // 扩张找最近前景, 收缩找最近背景.
    let target = if dilate { SEG_FOREGROUND } else { SEG_BACKGROUND };
    let mut dist: Vec<usize> = Vec::new();

    for mut lane in data.lanes_mut(axis) {
        let n = lane.len();
        dist.clear();
        dist.resize(n, usize::MAX);

        let mut last = None;
        for i in 0..n {
            if lane[i] == target {
                last = Some(i);
            }
            if let Some(j) = last {
                dist[i] = i - j;
            }
        }
        last = None;
        for i in (0..n).rev() {
            if lane[i] == target {
                last = Some(i);
            }
            if let Some(j) = last {
                dist[i] = dist[i].min(j - i);
            }
        }

        for i in 0..n {
            if dist[i] <= steps {
                lane[i] = target;
            }
        }
    }
}
