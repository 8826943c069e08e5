//! 体数据重采样.
//!
//! 颞骨精细结构 (如听小骨, 蜗管) 的尺度接近常规 CT 的体素大小,
//! 分割前需要先把体数据重采样到统一的各向同性分辨率.

use super::{spacing_eq, BoxedHeader, CtVolume, NiftiGeometry};
use ndarray::Array3;

/// 重采样插值方式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Interpolation {
    /// 三线性插值.
    Trilinear,

    /// 分离式 Catmull-Rom 三次插值 (a = -0.5).
    Cubic,
}

impl Interpolation {
    /// 根据体数据几何选择插值方式.
    ///
    /// z 向分辨率不粗于目标分辨率时用三线性即可;
    /// 否则属于层间上采样场景, 用三次插值以保留细结构边缘.
    pub fn preferred<G: NiftiGeometry>(geom: &G, target_mm: f64) -> Self {
        if geom.z_mm() <= target_mm {
            Self::Trilinear
        } else {
            Self::Cubic
        }
    }
}

/// 将体数据重采样到 `target_mm` 的各向同性分辨率.
///
/// 插值方式按 [`Interpolation::preferred`] 自动选择.
/// 已经满足目标分辨率的体数据直接返回克隆.
pub fn resample_isotropic(volume: &CtVolume, target_mm: f64) -> CtVolume {
    resample_with(volume, target_mm, Interpolation::preferred(volume, target_mm))
}

/// [`resample_isotropic`] 的显式插值版本.
pub fn resample_with(volume: &CtVolume, target_mm: f64, interp: Interpolation) -> CtVolume {
    assert!(target_mm > 0.0);

    let [z_mm, h_mm, w_mm] = volume.pix_dim();
    if [z_mm, h_mm, w_mm].iter().all(|&mm| spacing_eq(mm, target_mm)) {
        return volume.clone();
    }

    let (z, h, w) = volume.shape();
    let out_z = out_len(z, z_mm, target_mm);
    let out_h = out_len(h, h_mm, target_mm);
    let out_w = out_len(w, w_mm, target_mm);

    // 分离式插值: 每个输出下标在各轴上独立决定采样点与权重.
    let taps_z = axis_taps(out_z, z, target_mm / z_mm, interp);
    let taps_h = axis_taps(out_h, h, target_mm / h_mm, interp);
    let taps_w = axis_taps(out_w, w, target_mm / w_mm, interp);

    let src = volume.data();
    let mut out = Array3::<f32>::zeros((out_z, out_h, out_w));
    for (zi, tz) in taps_z.iter().enumerate() {
        for (hi, th) in taps_h.iter().enumerate() {
            for (wi, tw) in taps_w.iter().enumerate() {
                let mut acc = 0f64;
                for &(zj, zw) in tz {
                    for &(hj, hw) in th {
                        for &(wj, ww) in tw {
                            acc += zw * hw * ww * src[(zj, hj, wj)] as f64;
                        }
                    }
                }
                out[(zi, hi, wi)] = acc as f32;
            }
        }
    }

    let mut header: BoxedHeader = Box::new(volume.header().clone());
    header.dim[1] = out_w as u16;
    header.dim[2] = out_h as u16;
    header.dim[3] = out_z as u16;
    header.pixdim[1] = target_mm as f32;
    header.pixdim[2] = target_mm as f32;
    header.pixdim[3] = target_mm as f32;
    volume.replace_parts(header, out)
}

/// 给定原体素个数与分辨率, 计算目标分辨率下的体素个数.
#[inline]
fn out_len(len: usize, mm: f64, target_mm: f64) -> usize {
    ((len as f64 * mm / target_mm).round() as usize).max(1)
}

/// 计算某一轴上所有输出下标的 (输入下标, 权重) 采样点.
///
/// 输出体素中心映射到输入坐标系: `src = (i + 0.5) * scale - 0.5`.
/// 越界的采样下标按边界 clamp (边缘复制).
fn axis_taps(out_len: usize, in_len: usize, scale: f64, interp: Interpolation) -> Vec<Vec<(usize, f64)>> {
    let clamp = |j: isize| j.clamp(0, in_len as isize - 1) as usize;
    (0..out_len)
        .map(|i| {
            let src = (i as f64 + 0.5) * scale - 0.5;
            let base = src.floor();
            let t = src - base;
            let base = base as isize;
            match interp {
                Interpolation::Trilinear => {
                    vec![(clamp(base), 1.0 - t), (clamp(base + 1), t)]
                }
                Interpolation::Cubic => (-1..=2)
                    .zip(catmull_rom(t))
                    .map(|(off, w)| (clamp(base + off), w))
                    .collect(),
            }
        })
        .collect()
}

/// Catmull-Rom 核在偏移 \[-1, 0, 1, 2\] 四个采样点处的权重.
#[inline]
fn catmull_rom(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        -0.5 * t3 + t2 - 0.5 * t,
        1.5 * t3 - 2.5 * t2 + 1.0,
        -1.5 * t3 + 2.0 * t2 + 0.5 * t,
        0.5 * t3 - 0.5 * t2,
    ]
}
