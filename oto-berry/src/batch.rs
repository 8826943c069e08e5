//! 目录级批处理.
//!
//! 扫描输入目录下的全部体数据文件, 逐个执行重采样与分割流水线.
//! 运行器是惰性迭代器: 每次 `next` 才加载并处理一个文件,
//! 文件之间互不影响, 单个文件的失败不会中断批次.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::{fmt, fs};

use itertools::Itertools;

use crate::consts::{DEFAULT_VOLUME_SUFFIX, TARGET_ISO_SPACING_MM};
use crate::data::display_name;
use crate::data::resample::resample_isotropic;
use crate::oracle::SegmentOracle;
use crate::pipeline::{self, ExportError, Exporter, RunOptions, VolumeReport};
use crate::structure::StructureSpec;
use crate::{CtVolume, NiftiGeometry};

#[cfg(feature = "serde")]
use serde::Serialize;

/// 批处理配置.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// 输入目录, 其下每个匹配 `pattern` 的文件视为一个体数据.
    pub input_dir: PathBuf,

    /// 输出根目录, 每个体数据的产物写入 `<output_dir>/<体数据名>/`.
    pub output_dir: PathBuf,

    /// 输入文件名后缀过滤.
    pub pattern: String,

    /// 重采样目标分辨率, 以毫米为单位.
    pub target_spacing_mm: f64,

    /// 逐体数据的流水线选项.
    pub options: RunOptions,
}

impl BatchConfig {
    /// 以默认后缀, 默认目标分辨率与默认流水线选项构建配置.
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(input_dir: P, output_dir: Q) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            pattern: DEFAULT_VOLUME_SUFFIX.to_owned(),
            target_spacing_mm: TARGET_ISO_SPACING_MM,
            options: RunOptions::default(),
        }
    }
}

/// 批处理无法启动的原因.
#[derive(Debug)]
pub enum InputError {
    /// 输入路径不存在或不是目录.
    NotADirectory(PathBuf),

    /// 扫描输入目录失败.
    Io(io::Error),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotADirectory(p) => write!(f, "not a directory: {}", p.display()),
            Self::Io(e) => write!(f, "cannot scan input directory: {e}"),
        }
    }
}

impl std::error::Error for InputError {}

impl From<io::Error> for InputError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// 单个文件层面的失败 (未能进入或完成流水线).
#[derive(Debug)]
pub enum FileError {
    /// 体数据加载失败.
    Load(nifti::NiftiError),

    /// 输出目录创建失败.
    Output(io::Error),

    /// 体数据级产物导出失败.
    Export(ExportError),
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load(e) => write!(f, "cannot load volume: {e}"),
            Self::Output(e) => write!(f, "cannot create output directory: {e}"),
            Self::Export(e) => write!(f, "cannot export volume artifacts: {e}"),
        }
    }
}

impl std::error::Error for FileError {}

/// 单个文件的批处理结局.
#[derive(Debug)]
pub struct FileOutcome {
    /// 体数据展示名.
    pub file: String,

    /// 流水线报告, 或文件层面的失败.
    pub result: Result<VolumeReport, FileError>,

    /// 流水线完成后体数据级产物的导出失败 (若有).
    /// 即使出现, `result` 中的逐结构报告也依然保留.
    pub volume_export: Option<FileError>,
}

/// 目录批处理运行器.
///
/// 实现 [`Iterator`], 每个元素对应一个输入文件的处理结局.
/// 文件按路径字典序处理.
pub struct VolumeBatchRunner<'a, O, E> {
    /// 未处理文件, 逆序存储, 每次从尾部弹出.
    files: Vec<PathBuf>,
    specs: &'a [StructureSpec],
    oracle: &'a mut O,
    exporter: &'a mut E,
    config: BatchConfig,
}

impl<'a, O: SegmentOracle, E: Exporter> VolumeBatchRunner<'a, O, E> {
    /// 扫描输入目录并构建运行器. 目录不可用时返回 [`InputError`].
    pub fn new(
        config: BatchConfig,
        specs: &'a [StructureSpec],
        oracle: &'a mut O,
        exporter: &'a mut E,
    ) -> Result<Self, InputError> {
        if !config.input_dir.is_dir() {
            return Err(InputError::NotADirectory(config.input_dir.clone()));
        }

        let pattern = config.pattern.as_str();
        let files: Vec<PathBuf> = fs::read_dir(&config.input_dir)?
            .filter_map_ok(|entry| {
                let path = entry.path();
                let matched = path
                    .file_name()
                    .map(|n| n.to_string_lossy().ends_with(pattern))
                    .unwrap_or(false);
                (matched && path.is_file()).then_some(path)
            })
            .collect::<io::Result<Vec<_>>>()?
            .into_iter()
            .sorted()
            .rev()
            .collect();

        log::info!(
            "{}: {} 个体数据待处理",
            config.input_dir.display(),
            files.len()
        );
        Ok(Self {
            files,
            specs,
            oracle,
            exporter,
            config,
        })
    }

    /// 尚未处理的文件个数.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.files.len()
    }

    /// 处理完所有剩余文件并汇总成报告.
    pub fn run_to_end(self) -> BatchReport {
        let mut report = BatchReport::default();
        for outcome in self {
            report.absorb(outcome);
        }
        report
    }

    fn process(&mut self, path: &Path) -> FileOutcome {
        // 展示名统一取自路径, 成败两侧保持一致.
        let file = display_name(path);
        match self.process_inner(path) {
            Ok((report, volume_export)) => FileOutcome {
                file,
                result: Ok(report),
                volume_export,
            },
            Err(e) => FileOutcome {
                file,
                result: Err(e),
                volume_export: None,
            },
        }
    }

    fn process_inner(&mut self, path: &Path) -> Result<(VolumeReport, Option<FileError>), FileError> {
        let volume = CtVolume::open(path).map_err(FileError::Load)?;
        let volume = resample_isotropic(&volume, self.config.target_spacing_mm);

        let out_dir = self.config.output_dir.join(volume.name());
        fs::create_dir_all(&out_dir).map_err(FileError::Output)?;

        let report = pipeline::run(
            &volume,
            self.specs,
            &mut *self.oracle,
            &mut *self.exporter,
            &out_dir,
            &self.config.options,
        );

        // 体数据级导出失败不吞掉已算好的逐结构报告, 只附带记录.
        let volume_export = self.export_volume_artifacts(&out_dir, &volume, &report).err();
        if let Some(e) = &volume_export {
            log::error!("{}: {e}", volume.name());
        }
        Ok((report, volume_export))
    }

    /// 体数据级产物: 重采样体数据, 合并 labelmap, 体积统计, 可选 DICOM.
    fn export_volume_artifacts(
        &mut self,
        out_dir: &Path,
        volume: &CtVolume,
        report: &VolumeReport,
    ) -> Result<(), FileError> {
        self.exporter
            .save_volume(out_dir, volume)
            .map_err(FileError::Export)?;
        if let Some(combined) = report.result.combined_labelmap() {
            self.exporter
                .save_labelmap(out_dir, "combined", &combined)
                .map_err(FileError::Export)?;
        }
        let mm3 = volume.voxel_mm3();
        let rows: Vec<(&str, f64)> = report
            .result
            .masks()
            .iter()
            .map(|(n, m)| (*n, m.count() as f64 * mm3))
            .collect();
        self.exporter
            .save_stats_csv(out_dir, &rows)
            .map_err(FileError::Export)?;

        if self.config.options.export_dicom {
            // DICOM 属于附加产物, 导出器不支持时只降级告警.
            if let Err(e) = self.exporter.export_dicom(out_dir, volume) {
                log::warn!("{}: dicom export skipped: {e}", volume.name());
            }
        }
        Ok(())
    }
}

impl<O: SegmentOracle, E: Exporter> Iterator for VolumeBatchRunner<'_, O, E> {
    type Item = FileOutcome;

    fn next(&mut self) -> Option<Self::Item> {
        // 体数据之间同样响应取消.
        if self.config.options.is_cancelled() {
            log::warn!("batch cancelled, {} 个文件未处理", self.files.len());
            self.files.clear();
            return None;
        }
        let path = self.files.pop()?;
        Some(self.process(&path))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.files.len(), Some(self.files.len()))
    }
}

/// 批处理汇总中的单条失败记录.
#[derive(Debug)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct BatchFailure {
    /// 体数据展示名.
    pub file: String,

    /// 失败的结构名. 文件层面的失败为 `None`.
    pub structure: Option<&'static str>,

    /// 失败原因描述.
    pub message: String,
}

/// 批处理汇总报告.
#[derive(Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct BatchReport {
    /// 已处理的文件总数.
    pub files_total: usize,

    /// 全部结构成功的文件数.
    pub files_completed: usize,

    /// 被取消的文件数.
    pub files_cancelled: usize,

    /// 所有失败记录.
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    /// 将单个文件的结局并入汇总.
    pub fn absorb(&mut self, outcome: FileOutcome) {
        self.files_total += 1;
        match outcome.result {
            Ok(report) => {
                if report.is_complete() && outcome.volume_export.is_none() {
                    self.files_completed += 1;
                }
                if report.cancelled {
                    self.files_cancelled += 1;
                }
                for failure in report.failures {
                    self.failures.push(BatchFailure {
                        file: outcome.file.clone(),
                        structure: Some(failure.structure),
                        message: failure.error.to_string(),
                    });
                }
                if let Some(e) = outcome.volume_export {
                    self.failures.push(BatchFailure {
                        file: outcome.file,
                        structure: None,
                        message: e.to_string(),
                    });
                }
            }
            Err(e) => self.failures.push(BatchFailure {
                file: outcome.file,
                structure: None,
                message: e.to_string(),
            }),
        }
    }

    /// 是否所有文件的所有结构都成功?
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.files_completed == self.files_total
    }

    /// 将汇总写入 `writer`.
    pub fn describe_into<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(
            writer,
            "batch finished: {}/{} completed, {} cancelled, {} failure(s)",
            self.files_completed,
            self.files_total,
            self.files_cancelled,
            self.failures.len()
        )?;
        for f in &self.failures {
            match f.structure {
                Some(s) => writeln!(writer, "  {}/{s}: {}", f.file, f.message)?,
                None => writeln!(writer, "  {}: {}", f.file, f.message)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleError;
    use crate::pipeline::NullExporter;
    use crate::structure::default_structures;
    use crate::CtMask;
    use ndarray::Array3;

    const ISO: [f32; 3] = [0.25, 0.25, 0.25];

    /// 对指定体数据一律报错的测试 oracle.
    struct NameOracle {
        fail_volume: &'static str,
    }

    impl SegmentOracle for NameOracle {
        fn segment(&mut self, volume: &CtVolume, _: &str) -> Result<CtMask, OracleError> {
            if volume.name() == self.fail_volume {
                return Err(OracleError::Unavailable("scripted failure".to_owned()));
            }
            let mut mask = CtMask::empty_like(volume);
            mask[(4, 4, 4)] = 1;
            Ok(mask)
        }
    }

    fn seed_input(dir: &Path, names: &[&str]) {
        for name in names {
            CtVolume::fake(name, Array3::zeros((8, 8, 8)), ISO)
                .save(dir.join(format!("{name}.nii.gz")))
                .unwrap();
        }
    }

    #[test]
    fn test_missing_input_dir() {
        let config = BatchConfig::new("/no/such/dir", "/tmp/out");
        let mut oracle = NameOracle { fail_volume: "" };
        let mut exporter = NullExporter;
        let specs = default_structures();
        let Err(err) = VolumeBatchRunner::new(config, &specs, &mut oracle, &mut exporter) else {
            panic!("不存在的输入目录应当拒绝构建");
        };
        assert!(matches!(err, InputError::NotADirectory(_)));
    }

    #[test]
    fn test_batch_isolates_per_file_failures() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        seed_input(input.path(), &["a", "b", "c"]);

        let config = BatchConfig::new(input.path(), output.path());
        let mut oracle = NameOracle { fail_volume: "b" };
        let mut exporter = NullExporter;
        let specs = default_structures();

        let runner = VolumeBatchRunner::new(config, &specs, &mut oracle, &mut exporter).unwrap();
        assert_eq!(runner.remaining(), 3);

        let outcomes: Vec<FileOutcome> = runner.collect();
        // 按字典序处理.
        let names: Vec<&str> = outcomes.iter().map(|o| o.file.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let mut report = BatchReport::default();
        outcomes.into_iter().for_each(|o| report.absorb(o));

        assert_eq!(report.files_total, 3);
        assert_eq!(report.files_completed, 2);
        assert!(!report.failures.is_empty());
        assert!(report.failures.iter().all(|f| f.file == "b"));

        // 每个体数据一个输出目录, 文件失败也不影响目录创建.
        for name in ["a", "b", "c"] {
            assert!(output.path().join(name).is_dir());
        }
    }

    #[test]
    fn test_pattern_filters_input() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        seed_input(input.path(), &["a"]);
        fs::write(input.path().join("notes.txt"), "misc").unwrap();

        let config = BatchConfig::new(input.path(), output.path());
        let mut oracle = NameOracle { fail_volume: "" };
        let mut exporter = NullExporter;
        let specs = default_structures();

        let runner = VolumeBatchRunner::new(config, &specs, &mut oracle, &mut exporter).unwrap();
        assert_eq!(runner.remaining(), 1);
        let report = runner.run_to_end();
        assert!(report.is_clean());
        assert_eq!(report.files_total, 1);
    }

    #[test]
    fn test_load_failure_uses_display_name() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        fs::write(input.path().join("bad.nii.gz"), b"not a nifti file").unwrap();

        let config = BatchConfig::new(input.path(), output.path());
        let mut oracle = NameOracle { fail_volume: "" };
        let mut exporter = NullExporter;
        let specs = default_structures();

        let runner = VolumeBatchRunner::new(config, &specs, &mut oracle, &mut exporter).unwrap();
        let outcomes: Vec<FileOutcome> = runner.collect();
        let [outcome] = &outcomes[..] else {
            panic!("应恰好处理一个文件");
        };
        // 展示名与成功路径保持一致, 不带文件后缀.
        assert_eq!(outcome.file, "bad");
        assert!(matches!(outcome.result, Err(FileError::Load(_))));
    }

    #[test]
    fn test_volume_export_failure_keeps_structure_report() {
        /// 对指定模型报错的测试 oracle.
        struct ModelOracle {
            fail_model: &'static str,
        }

        impl SegmentOracle for ModelOracle {
            fn segment(&mut self, volume: &CtVolume, model: &str) -> Result<CtMask, OracleError> {
                if model == self.fail_model {
                    return Err(OracleError::Unavailable("scripted failure".to_owned()));
                }
                let mut mask = CtMask::empty_like(volume);
                mask[(4, 4, 4)] = 1;
                Ok(mask)
            }
        }

        /// 只有重采样体数据写不出去的导出器.
        struct NoVolumeExporter;

        impl Exporter for NoVolumeExporter {
            fn save_labelmap(
                &mut self,
                _: &Path,
                _: &str,
                _: &CtMask,
            ) -> Result<(), ExportError> {
                Ok(())
            }
            fn save_mesh(&mut self, _: &Path, _: &str, _: &CtMask) -> Result<(), ExportError> {
                Ok(())
            }
            fn save_volume(&mut self, _: &Path, _: &CtVolume) -> Result<(), ExportError> {
                Err(ExportError::Unsupported("volume"))
            }
            fn save_stats_csv(&mut self, _: &Path, _: &[(&str, f64)]) -> Result<(), ExportError> {
                Ok(())
            }
            fn export_dicom(&mut self, _: &Path, _: &CtVolume) -> Result<(), ExportError> {
                Ok(())
            }
        }

        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        seed_input(input.path(), &["a"]);

        let config = BatchConfig::new(input.path(), output.path());
        let mut oracle = ModelOracle {
            fail_model: "ossicles",
        };
        let mut exporter = NoVolumeExporter;
        let specs = default_structures();

        let runner = VolumeBatchRunner::new(config, &specs, &mut oracle, &mut exporter).unwrap();
        let report = runner.run_to_end();

        // 逐结构报告不因体数据级导出失败而丢失: 两条记录并存.
        assert_eq!(report.files_total, 1);
        assert_eq!(report.files_completed, 0);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.file == "a"));
        assert!(report
            .failures
            .iter()
            .any(|f| f.structure == Some("ossicles")));
        assert!(report
            .failures
            .iter()
            .any(|f| f.structure.is_none() && f.message.contains("volume artifacts")));
    }

    #[test]
    fn test_describe_report() {
        let mut report = BatchReport::default();
        report.absorb(FileOutcome {
            file: "a".to_owned(),
            result: Ok(VolumeReport::default()),
            volume_export: None,
        });

        let mut buf = Vec::new();
        report.describe_into(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("batch finished: 1/1 completed"));
    }
}
