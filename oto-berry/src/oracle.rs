//! 分割 oracle: 为单个结构产出初始掩膜的外部推理服务.
//!
//! 流水线只依赖 [`SegmentOracle`] trait, 不关心掩膜具体从哪里来.
//! 本 crate 内置 [`PrecomputedOracle`], 从本地目录读取离线推理结果;
//! 在线推理客户端可在 crate 外实现同一 trait 后直接接入.

use std::fmt;
use std::path::PathBuf;

use crate::{CtMask, CtVolume, NiftiGeometry};

/// oracle 调用错误.
#[derive(Debug)]
pub enum OracleError {
    /// oracle 无法给出结果 (服务不可达, 文件缺失, 结果无法解析等).
    Unavailable(String),

    /// oracle 正常返回, 但掩膜不含任何前景体素.
    EmptyResult,
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(why) => write!(f, "oracle unavailable: {why}"),
            Self::EmptyResult => write!(f, "oracle returned an empty mask"),
        }
    }
}

impl std::error::Error for OracleError {}

/// 结构分割 oracle 的统一接口.
pub trait SegmentOracle {
    /// 为 `volume` 请求模型 `model` 的初始分割掩膜.
    ///
    /// 实现方必须保证返回的掩膜与 `volume` 共几何且非空.
    fn segment(&mut self, volume: &CtVolume, model: &str) -> Result<CtMask, OracleError>;
}

/// 目录式离线 oracle.
///
/// 约定目录布局为 `<root>/<体数据名>/<模型名>.nii.gz`,
/// 即推理结果按体数据分目录预先落盘.
#[derive(Debug, Clone)]
pub struct PrecomputedOracle {
    root: PathBuf,
}

impl PrecomputedOracle {
    /// 以 `root` 为推理结果根目录创建 oracle.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl SegmentOracle for PrecomputedOracle {
    fn segment(&mut self, volume: &CtVolume, model: &str) -> Result<CtMask, OracleError> {
        let path = self.root.join(volume.name()).join(format!("{model}.nii.gz"));
        let mask = CtMask::open(&path)
            .map_err(|e| OracleError::Unavailable(format!("{}: {e}", path.display())))?;

        if !mask.same_geometry(volume) {
            return Err(OracleError::Unavailable(format!(
                "{}: 掩膜与体数据几何不一致",
                path.display()
            )));
        }
        if mask.is_empty_mask() {
            return Err(OracleError::EmptyResult);
        }
        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use std::fs;

    const ISO: [f32; 3] = [0.25, 0.25, 0.25];

    fn fixture() -> (tempfile::TempDir, CtVolume) {
        let dir = tempfile::tempdir().unwrap();
        let volume = CtVolume::fake("patient01", Array3::zeros((3, 4, 5)), ISO);
        fs::create_dir_all(dir.path().join("patient01")).unwrap();
        (dir, volume)
    }

    #[test]
    fn test_precomputed_roundtrip() {
        let (dir, volume) = fixture();
        let mut mask = CtMask::empty_like(&volume);
        mask[(1, 2, 3)] = 1;
        mask[(2, 0, 0)] = 1;
        mask.save(dir.path().join("patient01/inner_ear.nii.gz")).unwrap();

        let mut oracle = PrecomputedOracle::new(dir.path());
        let got = oracle.segment(&volume, "inner_ear").unwrap();
        assert!(got.same_geometry(&volume));
        assert_eq!(got.count(), 2);
        assert_eq!(got[(1, 2, 3)], 1);
    }

    #[test]
    fn test_missing_model_is_unavailable() {
        let (dir, volume) = fixture();
        let mut oracle = PrecomputedOracle::new(dir.path());
        let err = oracle.segment(&volume, "ossicles").unwrap_err();
        assert!(matches!(err, OracleError::Unavailable(_)));
    }

    #[test]
    fn test_empty_mask_is_rejected() {
        let (dir, volume) = fixture();
        CtMask::empty_like(&volume)
            .save(dir.path().join("patient01/inner_ear.nii.gz"))
            .unwrap();

        let mut oracle = PrecomputedOracle::new(dir.path());
        let err = oracle.segment(&volume, "inner_ear").unwrap_err();
        assert!(matches!(err, OracleError::EmptyResult));
    }

    #[test]
    fn test_geometry_mismatch_is_unavailable() {
        let (dir, volume) = fixture();
        CtMask::fake(ndarray::Array3::from_elem((3, 4, 6), 1), ISO)
            .save(dir.path().join("patient01/inner_ear.nii.gz"))
            .unwrap();

        let mut oracle = PrecomputedOracle::new(dir.path());
        let err = oracle.segment(&volume, "inner_ear").unwrap_err();
        assert!(matches!(err, OracleError::Unavailable(_)));
    }
}
