//! 掩膜连通域 (island) 过滤.
//!
//! 连通性约定: 本模块统一采用 6-连通 (钻石型邻域, 即只有面相邻的体素连通),
//! 所有结构的 island 过滤都遵循该约定.

use super::CtMask;
use crate::consts::label::*;
use crate::Idx3d;
use ndarray::Array3;
use std::collections::VecDeque;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 连通域过滤方式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IslandOp {
    /// 仅保留体素数最大的连通域.
    ///
    /// 若存在并列最大, 保留按 (z, H, W) 行优先扫描最先遇到的那个 (稳定性).
    KeepLargest,

    /// 移除体素数小于给定阈值的所有连通域.
    RemoveSmallerThan(u32),
}

impl CtMask {
    /// 按 `op` 过滤掩膜中的连通域.
    ///
    /// 空掩膜是 no-op.
    pub fn filter_islands(&mut self, op: IslandOp) {
        let (components, sizes) = self.label_components();
        if sizes.is_empty() {
            return;
        }

        match op {
            IslandOp::KeepLargest => {
                // 严格大于保证并列时保留最先遇到的连通域.
                let mut keep = 0usize;
                for (idx, &size) in sizes.iter().enumerate() {
                    if size > sizes[keep] {
                        keep = idx;
                    }
                }
                // 连通域编号从 1 开始.
                let keep = (keep + 1) as u32;
                self.data
                    .iter_mut()
                    .zip(components.iter())
                    .for_each(|(pix, &c)| {
                        if c != keep {
                            *pix = SEG_BACKGROUND;
                        }
                    });
            }
            IslandOp::RemoveSmallerThan(min) => {
                self.data
                    .iter_mut()
                    .zip(components.iter())
                    .for_each(|(pix, &c)| {
                        if c != 0 && sizes[(c - 1) as usize] < min {
                            *pix = SEG_BACKGROUND;
                        }
                    });
            }
        }
    }

    /// 对前景做 6-连通域标记.
    ///
    /// # 返回值
    ///
    /// 1. 与掩膜同形状的连通域编号数组, 0 代表背景, 编号按行优先发现顺序从 1 递增;
    /// 2. 每个连通域的体素数, 下标为 `编号 - 1`.
    fn label_components(&self) -> (Array3<u32>, Vec<u32>) {
        let shape = self.data.dim();
        let mut components = Array3::<u32>::zeros(shape);
        let mut sizes: Vec<u32> = Vec::new();
        let mut queue: VecDeque<Idx3d> = VecDeque::new();

        for (seed, &pix) in self.data.indexed_iter() {
            if is_background(pix) || components[seed] != 0 {
                continue;
            }

            let id = (sizes.len() + 1) as u32;
            let mut size = 0u32;
            components[seed] = id;
            queue.push_back(seed);

            while let Some(pos) = queue.pop_front() {
                size += 1;
                for neigh in diamond_neighbours(pos, shape) {
                    if is_foreground(self.data[neigh]) && components[neigh] == 0 {
                        components[neigh] = id;
                        queue.push_back(neigh);
                    }
                }
            }
            sizes.push(size);
        }

        (components, sizes)
    }
}

/// 获取 `pos` 前后上下左右六个点的坐标.
///
/// 在数据范围外的坐标会被过滤掉, 不会包含在返回值中.
fn diamond_neighbours((z, h, w): Idx3d, (lz, lh, lw): Idx3d) -> impl Iterator<Item = Idx3d> {
    [
        (z.wrapping_sub(1), h, w),
        (z.saturating_add(1), h, w),
        (z, h.wrapping_sub(1), w),
        (z, h.saturating_add(1), w),
        (z, h, w.wrapping_sub(1)),
        (z, h, w.saturating_add(1)),
    ]
    .into_iter()
    .filter(move |&(z0, h0, w0)| z0 < lz && h0 < lh && w0 < lw)
}
