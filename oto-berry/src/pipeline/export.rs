//! 分割结果导出.
//!
//! 导出通过 [`Exporter`] trait 抽象, 流水线不关心落盘格式的实现细节.
//! 内置实现 [`NiftiObjExporter`] 将标签图写为 nifti, 将表面网格写为
//! Wavefront OBJ; [`NullExporter`] 全部丢弃, 用于实验与测试.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::consts::label::is_foreground;
use crate::{CtMask, CtVolume, NiftiGeometry};

/// 导出错误.
#[derive(Debug)]
pub enum ExportError {
    /// 底层 IO 错误.
    Io(std::io::Error),

    /// nifti 序列化错误.
    Nifti(nifti::NiftiError),

    /// 当前导出器不支持该格式.
    Unsupported(&'static str),
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "export io error: {e}"),
            Self::Nifti(e) => write!(f, "export nifti error: {e}"),
            Self::Unsupported(what) => write!(f, "export format not supported: {what}"),
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Nifti(e) => Some(e),
            Self::Unsupported(_) => None,
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nifti::NiftiError> for ExportError {
    fn from(e: nifti::NiftiError) -> Self {
        Self::Nifti(e)
    }
}

/// 分割结果导出器.
///
/// 所有方法都以目标目录 `dir` 为根, 文件名由实现方约定.
pub trait Exporter {
    /// 导出单结构掩膜 (`<name>_labelmap.nii.gz`).
    fn save_labelmap(&mut self, dir: &Path, name: &str, mask: &CtMask) -> Result<(), ExportError>;

    /// 导出单结构表面网格 (`<name>.obj`), 顶点坐标以毫米为单位.
    fn save_mesh(&mut self, dir: &Path, name: &str, mask: &CtMask) -> Result<(), ExportError>;

    /// 导出 (通常是重采样后的) 参考体数据.
    fn save_volume(&mut self, dir: &Path, volume: &CtVolume) -> Result<(), ExportError>;

    /// 导出各结构体积统计 (`stats.csv`), 每行一个 `(结构名, 立方毫米体积)`.
    fn save_stats_csv(&mut self, dir: &Path, rows: &[(&str, f64)]) -> Result<(), ExportError>;

    /// 将体数据与分割一起导出为 DICOM 序列.
    fn export_dicom(&mut self, dir: &Path, volume: &CtVolume) -> Result<(), ExportError>;
}

/// 内置的 nifti + OBJ 导出器.
#[derive(Debug, Default, Clone)]
pub struct NiftiObjExporter;

impl Exporter for NiftiObjExporter {
    fn save_labelmap(&mut self, dir: &Path, name: &str, mask: &CtMask) -> Result<(), ExportError> {
        mask.save(dir.join(format!("{name}_labelmap.nii.gz")))?;
        Ok(())
    }

    fn save_mesh(&mut self, dir: &Path, name: &str, mask: &CtMask) -> Result<(), ExportError> {
        let file = File::create(dir.join(format!("{name}.obj")))?;
        write_obj_surface(BufWriter::new(file), mask)?;
        Ok(())
    }

    fn save_volume(&mut self, dir: &Path, volume: &CtVolume) -> Result<(), ExportError> {
        volume.save(dir.join(format!("{}.nii.gz", volume.name())))?;
        Ok(())
    }

    fn save_stats_csv(&mut self, dir: &Path, rows: &[(&str, f64)]) -> Result<(), ExportError> {
        let mut file = BufWriter::new(File::create(dir.join("stats.csv"))?);
        writeln!(file, "segment,volume_mm3")?;
        for (name, mm3) in rows {
            writeln!(file, "{name},{mm3:.3}")?;
        }
        Ok(())
    }

    fn export_dicom(&mut self, _dir: &Path, _volume: &CtVolume) -> Result<(), ExportError> {
        Err(ExportError::Unsupported("dicom"))
    }
}

/// 丢弃一切输出的导出器.
#[derive(Debug, Default, Clone)]
pub struct NullExporter;

impl Exporter for NullExporter {
    fn save_labelmap(&mut self, _: &Path, _: &str, _: &CtMask) -> Result<(), ExportError> {
        Ok(())
    }

    fn save_mesh(&mut self, _: &Path, _: &str, _: &CtMask) -> Result<(), ExportError> {
        Ok(())
    }

    fn save_volume(&mut self, _: &Path, _: &CtVolume) -> Result<(), ExportError> {
        Ok(())
    }

    fn save_stats_csv(&mut self, _: &Path, _: &[(&str, f64)]) -> Result<(), ExportError> {
        Ok(())
    }

    fn export_dicom(&mut self, _: &Path, _: &CtVolume) -> Result<(), ExportError> {
        Ok(())
    }
}

/// 将掩膜前景的体素面表面写成 OBJ 网格.
///
/// 每个与背景 (或体数据边界) 相邻的体素面输出一个四边形面片,
/// 顶点按体素角点物理坐标 (毫米) 写出并在相邻面片间去重.
fn write_obj_surface<W: Write>(mut out: W, mask: &CtMask) -> std::io::Result<()> {
    let (lz, lh, lw) = mask.shape();
    let [z_mm, h_mm, w_mm] = mask.pix_dim();

    // 体素角点 (z, h, w) -> 1 起始的 OBJ 顶点编号.
    let mut vertex_ids: HashMap<(usize, usize, usize), usize> = HashMap::new();
    let mut vertices: Vec<(usize, usize, usize)> = Vec::new();
    let mut faces: Vec<[usize; 4]> = Vec::new();

    let mut quad = |corners: [(usize, usize, usize); 4]| {
        let mut ids = [0usize; 4];
        for (slot, c) in ids.iter_mut().zip(corners) {
            *slot = *vertex_ids.entry(c).or_insert_with(|| {
                vertices.push(c);
                vertices.len()
            });
        }
        faces.push(ids);
    };

    for (pos, &pix) in mask.data().indexed_iter() {
        if !is_foreground(pix) {
            continue;
        }
        let (z, h, w) = pos;

        // 面片角点按外法线逆时针排列.
        if w == 0 || !is_foreground(mask[(z, h, w - 1)]) {
            quad([(z, h, w), (z + 1, h, w), (z + 1, h + 1, w), (z, h + 1, w)]);
        }
        if w + 1 == lw || !is_foreground(mask[(z, h, w + 1)]) {
            quad([(z, h, w + 1), (z, h + 1, w + 1), (z + 1, h + 1, w + 1), (z + 1, h, w + 1)]);
        }
        if h == 0 || !is_foreground(mask[(z, h - 1, w)]) {
            quad([(z, h, w), (z, h, w + 1), (z + 1, h, w + 1), (z + 1, h, w)]);
        }
        if h + 1 == lh || !is_foreground(mask[(z, h + 1, w)]) {
            quad([(z, h + 1, w), (z + 1, h + 1, w), (z + 1, h + 1, w + 1), (z, h + 1, w + 1)]);
        }
        if z == 0 || !is_foreground(mask[(z - 1, h, w)]) {
            quad([(z, h, w), (z, h + 1, w), (z, h + 1, w + 1), (z, h, w + 1)]);
        }
        if z + 1 == lz || !is_foreground(mask[(z + 1, h, w)]) {
            quad([(z + 1, h, w), (z + 1, h, w + 1), (z + 1, h + 1, w + 1), (z + 1, h + 1, w)]);
        }
    }

    for (z, h, w) in vertices {
        writeln!(
            out,
            "v {} {} {}",
            w as f64 * w_mm,
            h as f64 * h_mm,
            z as f64 * z_mm
        )?;
    }
    for [a, b, c, d] in faces {
        writeln!(out, "f {a} {b} {c} {d}")?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use std::fs;

    const ISO: [f32; 3] = [0.25, 0.25, 0.25];

    fn obj_counts(text: &str) -> (usize, usize) {
        let v = text.lines().filter(|l| l.starts_with("v ")).count();
        let f = text.lines().filter(|l| l.starts_with("f ")).count();
        (v, f)
    }

    #[test]
    fn test_single_voxel_mesh() {
        let mut data = Array3::<u8>::zeros((3, 3, 3));
        data[(1, 1, 1)] = 1;
        let mask = CtMask::fake(data, ISO);

        let mut buf = Vec::new();
        write_obj_surface(&mut buf, &mask).unwrap();
        let text = String::from_utf8(buf).unwrap();

        // 单体素是立方体: 8 个去重后的顶点, 6 个面片.
        assert_eq!(obj_counts(&text), (8, 6));
    }

    #[test]
    fn test_adjacent_voxels_share_face() {
        let mut data = Array3::<u8>::zeros((3, 3, 4));
        data[(1, 1, 1)] = 1;
        data[(1, 1, 2)] = 1;
        let mask = CtMask::fake(data, ISO);

        let mut buf = Vec::new();
        write_obj_surface(&mut buf, &mask).unwrap();
        let text = String::from_utf8(buf).unwrap();

        // 共享面被吞掉: 2x1x1 长方体表面为 12 顶点 10 面.
        assert_eq!(obj_counts(&text), (12, 10));
    }

    #[test]
    fn test_vertex_coordinates_are_physical() {
        let mut data = Array3::<u8>::zeros((2, 2, 2));
        data[(0, 0, 0)] = 1;
        let mask = CtMask::fake(data, [0.5, 0.25, 0.25]);

        let mut buf = Vec::new();
        write_obj_surface(&mut buf, &mask).unwrap();
        let text = String::from_utf8(buf).unwrap();

        // 体素 (0, 0, 0) 的对角顶点落在 (0.25, 0.25, 0.5) 毫米处.
        assert!(text.lines().any(|l| l == "v 0 0 0"));
        assert!(text.lines().any(|l| l == "v 0.25 0.25 0.5"));
    }

    #[test]
    fn test_exporter_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let volume = CtVolume::fake("patient01", Array3::zeros((2, 2, 2)), ISO);
        let mut mask = CtMask::empty_like(&volume);
        mask[(0, 0, 0)] = 1;

        let mut exporter = NiftiObjExporter;
        exporter.save_labelmap(dir.path(), "inner_ear", &mask).unwrap();
        exporter.save_mesh(dir.path(), "inner_ear", &mask).unwrap();
        exporter.save_volume(dir.path(), &volume).unwrap();
        exporter
            .save_stats_csv(dir.path(), &[("inner_ear", 0.015625)])
            .unwrap();

        assert!(dir.path().join("inner_ear_labelmap.nii.gz").is_file());
        assert!(dir.path().join("inner_ear.obj").is_file());
        assert!(dir.path().join("patient01.nii.gz").is_file());

        let csv = fs::read_to_string(dir.path().join("stats.csv")).unwrap();
        assert_eq!(csv, "segment,volume_mm3\ninner_ear,0.016\n");

        assert!(matches!(
            exporter.export_dicom(dir.path(), &volume),
            Err(ExportError::Unsupported("dicom"))
        ));
    }
}
