use std::ops::{Index, IndexMut};
use std::path::Path;

use ndarray::{Array3, ArrayView, ArrayViewMut, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::consts::label::*;
use crate::Idx3d;

pub mod morph;
pub mod resample;
pub mod window;

pub use window::HuWindow;

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 将 (W, H, z) 转换成 (z, H, W). 以后均按照该模式访问.
#[inline]
fn get_shape_from_header(h: &NiftiHeader) -> Idx3d {
    // [W, H, z]. 体素个数数组.
    let [_, w, h, z, ..] = h.dim;
    (z as usize, h as usize, w as usize)
}

/// 比较两个以毫米为单位的分辨率分量是否一致 (允许浮点存储误差).
#[inline]
fn spacing_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-4 * a.abs().max(b.abs()).max(1.0)
}

/// 3D nifti 体数据的共用几何属性.
///
/// 体数据与掩膜均通过该 trait 暴露形状与体素分辨率信息;
/// 所有跨对象操作 (布尔运算, 强度门控) 都要求两侧几何一致.
pub trait NiftiGeometry {
    /// 获取 header 部分.
    fn header(&self) -> &NiftiHeader;

    /// 获取数据形状大小, 按 (z, H, W) 排列.
    #[inline]
    fn shape(&self) -> Idx3d {
        get_shape_from_header(self.header())
    }

    /// 获取数据体素个数.
    #[inline]
    fn size(&self) -> usize {
        let (z, h, w) = self.shape();
        z * h * w
    }

    /// 检查索引是否合法.
    #[inline]
    fn check(&self, (z0, h0, w0): &Idx3d) -> bool {
        let (z, h, w) = self.shape();
        *z0 < z && *h0 < h && *w0 < w
    }

    /// 获取单个体素分辨率. 该分辨率以毫米为单位, 分别代表空间 (相邻切片方向),
    /// 高 (自然图像的垂直方向), 宽 (自然图像的水平方向).
    #[inline]
    fn pix_dim(&self) -> [f64; 3] {
        let [_, w, h, z, ..] = self.header().pixdim;
        [z as f64, h as f64, w as f64]
    }

    /// 获取 width 方向体素分辨率, 以毫米为单位.
    #[inline]
    fn width_mm(&self) -> f64 {
        self.header().pixdim[1] as f64
    }

    /// 获取 height 方向体素分辨率, 以毫米为单位.
    #[inline]
    fn height_mm(&self) -> f64 {
        self.header().pixdim[2] as f64
    }

    /// 获取空间方向 (相邻 2D 切片的方向) 体素分辨率, 以毫米为单位.
    #[inline]
    fn z_mm(&self) -> f64 {
        self.header().pixdim[3] as f64
    }

    /// 体素分辨率在三个维度上是否是各向同的?
    #[inline]
    fn is_isotropic(&self) -> bool {
        let [z, h, w] = self.pix_dim();
        spacing_eq(z, h) && spacing_eq(z, w)
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    fn voxel_mm3(&self) -> f64 {
        self.pix_dim().iter().product()
    }

    /// 判断两个对象是否共享同一几何 (形状与体素分辨率均一致).
    ///
    /// 掩膜只允许与同几何的掩膜/体数据相互运算.
    fn same_geometry<G: NiftiGeometry>(&self, other: &G) -> bool
    where
        Self: Sized,
    {
        if self.shape() != other.shape() {
            return false;
        }
        let [az, ah, aw] = self.pix_dim();
        let [bz, bh, bw] = other.pix_dim();
        spacing_eq(az, bz) && spacing_eq(ah, bh) && spacing_eq(aw, bw)
    }
}

/// nii 格式 3D CT 体数据, 包括 header 和 CT 扫描 (HU). HU 值以 `f32` 保存.
#[derive(Debug, Clone)]
pub struct CtVolume {
    name: String,
    header: BoxedHeader,
    data: Array3<f32>,
}

impl NiftiGeometry for CtVolume {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl Index<Idx3d> for CtVolume {
    type Output = f32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for CtVolume {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

/// 从文件路径提取体数据展示名 (去掉 `.nii` / `.nii.gz` 后缀).
pub(crate) fn display_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.trim_end_matches(".gz").trim_end_matches(".nii").to_owned()
}

impl CtVolume {
    /// 打开 nii 文件格式的 3D CT 体数据. `path` 为 nii 文件的本地路径.
    /// 如果打开成功, 则返回 `Ok(Self)`, 否则返回 `Err`.
    pub fn open<P: AsRef<Path>>(path: P) -> nifti::Result<Self> {
        let path = path.as_ref();
        let obj = ReaderOptions::new().read_file(path)?;
        let header = Box::new(obj.header().clone());

        // [W, H, z] -> [z, H, W].
        // hint: 原第一维向下增长, 原第二维向右增长.
        let data = obj
            .into_volume()
            .into_ndarray::<f32>()?
            .permuted_axes([2, 1, 0].as_slice());

        // 该操作不会生成 `Err`, 可直接 unwrap.
        let data = Array3::<f32>::from_shape_vec(
            get_shape_from_header(&header),
            data.iter().copied().collect(),
        )
        .unwrap();

        Ok(Self {
            name: display_name(path),
            header,
            data,
        })
    }

    /// 将体数据按原几何保存为 nifti 文件. 以 `.gz` 结尾的路径自动压缩.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> nifti::Result<()> {
        // [z, H, W] -> [W, H, z]. 写出时恢复 nifti 惯用布局.
        let view = self.data.view().permuted_axes([2, 1, 0]);
        WriterOptions::new(path.as_ref())
            .reference_header(&self.header)
            .write_nifti(&view)
    }

    /// 获取体数据展示名. 通常为来源文件名去掉 `.nii`/`.nii.gz` 后缀.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, f32, Ix3> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut<'_, f32, Ix3> {
        self.data.view_mut()
    }

    /// 返回对该体数据实施 3x3x3 中值滤波后的克隆.
    ///
    /// 越界处的邻域窗口会被裁剪到体数据边界内. 原体数据保持不变,
    /// 因此对噪声不敏感的结构仍可引用原始 HU 值.
    pub fn median_filtered(&self) -> Self {
        let (z, h, w) = self.shape();
        let mut out = Array3::<f32>::zeros((z, h, w));
        let mut window = Vec::with_capacity(27);

        for zi in 0..z {
            for hi in 0..h {
                for wi in 0..w {
                    window.clear();
                    for zn in zi.saturating_sub(1)..(zi + 2).min(z) {
                        for hn in hi.saturating_sub(1)..(hi + 2).min(h) {
                            for wn in wi.saturating_sub(1)..(wi + 2).min(w) {
                                window.push(self.data[(zn, hn, wn)]);
                            }
                        }
                    }
                    window.sort_unstable_by(|a, b| a.total_cmp(b));
                    out[(zi, hi, wi)] = window[window.len() / 2];
                }
            }
        }

        Self {
            name: self.name.clone(),
            header: self.header.clone(),
            data: out,
        }
    }

    /// 根据裸数据和体素分辨率直接创建 `CtVolume` 实体.
    ///
    /// # 参数
    ///
    /// 1. `data` 按照 (z, H, W) 格式存储且非空.
    /// 2. `pix_dim` 按照 \[z, h, w\] 格式存储, 以毫米为单位.
    ///
    /// # 注意
    ///
    /// 该方法可能会创建不一致的实体, 因此你应仅将其用于实验目的.
    pub fn fake(name: &str, data: Array3<f32>, pix_dim: [f32; 3]) -> Self {
        assert_ne!(data.len(), 0);
        let header = fake_header(data.dim(), pix_dim);
        Self {
            name: name.to_owned(),
            header,
            data,
        }
    }

    /// 判断该结构是否是由 [`Self::fake`] 手动拼接的.
    pub fn is_faked(&self) -> bool {
        self.header.intent_name.starts_with(b"fake")
    }

    /// 在保持名字不变的前提下替换几何与数据. 仅供 crate 内部的重采样使用.
    pub(crate) fn replace_parts(&self, header: BoxedHeader, data: Array3<f32>) -> Self {
        Self {
            name: self.name.clone(),
            header,
            data,
        }
    }
}

/// 为 `fake_*` 构造器生成一致的最小 header.
fn fake_header((z, h, w): Idx3d, [pz, ph, pw]: [f32; 3]) -> BoxedHeader {
    assert!(pz > 0.0 && ph > 0.0 && pw > 0.0);
    let mut header = Box::<NiftiHeader>::default();
    header.dim = [3, w as u16, h as u16, z as u16, 1, 1, 1, 1];
    header.pixdim = [1.0, pw, ph, pz, 1.0, 1.0, 1.0, 1.0];
    header.intent_name[..4].copy_from_slice(b"fake");
    header
}

/// 与某个体数据共几何的二值掩膜. 体素值为 0 (背景) 或 1 (前景), 以 `u8` 保存.
#[derive(Debug, Clone)]
pub struct CtMask {
    header: BoxedHeader,
    data: Array3<u8>,
}

impl NiftiGeometry for CtMask {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl Index<Idx3d> for CtMask {
    type Output = u8;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for CtMask {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl CtMask {
    /// 打开 nii 文件格式的 3D 掩膜. 非零体素统一归一化为前景.
    pub fn open<P: AsRef<Path>>(path: P) -> nifti::Result<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let header = Box::new(obj.header().clone());

        // [W, H, z] -> [z, H, W]
        let data = obj
            .into_volume()
            .into_ndarray::<u8>()?
            .permuted_axes([2, 1, 0].as_slice());

        let data = Array3::<u8>::from_shape_vec(
            get_shape_from_header(&header),
            data.iter()
                .map(|&p| if is_background(p) { SEG_BACKGROUND } else { SEG_FOREGROUND })
                .collect(),
        )
        .unwrap();

        Ok(Self { header, data })
    }

    /// 将掩膜按原几何保存为 nifti 文件. 以 `.gz` 结尾的路径自动压缩.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> nifti::Result<()> {
        let view = self.data.view().permuted_axes([2, 1, 0]);
        WriterOptions::new(path.as_ref())
            .reference_header(&self.header)
            .write_nifti(&view)
    }

    /// 创建一个与 `geom` 共几何的全背景掩膜.
    pub fn empty_like<G: NiftiGeometry>(geom: &G) -> Self {
        let (z, h, w) = geom.shape();
        Self {
            header: Box::new(geom.header().clone()),
            data: Array3::zeros((z, h, w)),
        }
    }

    /// 根据裸掩膜数据和体素分辨率直接创建 `CtMask` 实体.
    ///
    /// # 参数
    ///
    /// 1. `data` 按照 (z, H, W) 格式存储且非空, 体素值必须为 0 或 1.
    /// 2. `pix_dim` 按照 \[z, h, w\] 格式存储, 以毫米为单位.
    ///
    /// # 注意
    ///
    /// 该方法可能会创建不一致的实体, 因此你应仅将其用于实验目的.
    pub fn fake(data: Array3<u8>, pix_dim: [f32; 3]) -> Self {
        assert_ne!(data.len(), 0);
        debug_assert!(data.iter().all(|&p| p <= SEG_FOREGROUND));
        let header = fake_header(data.dim(), pix_dim);
        Self { header, data }
    }

    /// 获取掩膜前景体素个数.
    #[inline]
    pub fn count(&self) -> usize {
        self.data.iter().filter(|p| is_foreground(**p)).count()
    }

    /// 掩膜是否不含任何前景体素?
    #[inline]
    pub fn is_empty_mask(&self) -> bool {
        self.data.iter().all(|p| is_background(*p))
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, u8, Ix3> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut<'_, u8, Ix3> {
        self.data.view_mut()
    }

    /// 收集所有前景体素对应的下标. 结果按行优先存储.
    pub fn foreground_pos(&self) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(ref pos, pixel)| is_foreground(*pixel).then_some(*pos))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_fake_volume_geometry() {
        let v = CtVolume::fake("demo", Array3::zeros((4, 6, 8)), [0.5, 0.25, 0.25]);
        assert!(v.is_faked());
        assert_eq!(v.shape(), (4, 6, 8));
        assert_eq!(v.pix_dim(), [0.5, 0.25, 0.25]);
        assert!(!v.is_isotropic());
        assert!((v.voxel_mm3() - 0.03125).abs() < 1e-9);
    }

    #[test]
    fn test_same_geometry() {
        let v = CtVolume::fake("demo", Array3::zeros((4, 4, 4)), [0.25, 0.25, 0.25]);
        let m = CtMask::empty_like(&v);
        assert!(m.same_geometry(&v));

        let other = CtMask::fake(Array3::zeros((4, 4, 5)), [0.25, 0.25, 0.25]);
        assert!(!other.same_geometry(&v));

        let coarse = CtMask::fake(Array3::zeros((4, 4, 4)), [0.5, 0.25, 0.25]);
        assert!(!coarse.same_geometry(&v));
    }

    #[test]
    fn test_median_filter_flattens_outlier() {
        let mut data = Array3::<f32>::zeros((3, 3, 3));
        data[(1, 1, 1)] = 1000.0;
        let v = CtVolume::fake("demo", data, [0.25, 0.25, 0.25]);
        let filtered = v.median_filtered();
        // 27 邻域中仅一个异常值, 中值应保持 0.
        assert_eq!(filtered[(1, 1, 1)], 0.0);
        // 原数据不被修改.
        assert_eq!(v[(1, 1, 1)], 1000.0);
    }

    #[test]
    fn test_volume_save_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.nii.gz");

        let data = Array3::from_shape_fn((3, 4, 5), |(z, h, w)| (z * 100 + h * 10 + w) as f32);
        let v = CtVolume::fake("demo", data, [0.5, 0.25, 0.25]);
        v.save(&path).unwrap();

        // 写出时轴序换回 (W, H, z), 读回后几何与体素值逐一还原.
        let r = CtVolume::open(&path).unwrap();
        assert_eq!(r.name(), "demo");
        assert_eq!(r.shape(), (3, 4, 5));
        assert_eq!(r.pix_dim(), [0.5, 0.25, 0.25]);
        assert_eq!(r.data(), v.data());
    }

    #[test]
    fn test_mask_count() {
        let mut m = CtMask::fake(Array3::zeros((2, 2, 2)), [1.0, 1.0, 1.0]);
        assert!(m.is_empty_mask());
        m[(0, 1, 1)] = 1;
        m[(1, 0, 0)] = 1;
        assert_eq!(m.count(), 2);
        assert_eq!(m.foreground_pos(), vec![(0, 1, 1), (1, 0, 0)]);
    }
}
