//! 批量分割命令行入口.
//!
//! 扫描输入目录下的 nifti 体数据, 逐个执行重采样 + 多结构分割,
//! 产物写入输出目录. 离线推理结果 (oracle) 从本地目录读取.
//!
//! 仅当批次无法启动 (输入目录不可用) 时返回非零退出码;
//! 个别文件或结构失败只体现在结尾的汇总报告中.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use oto_berry::consts::TARGET_ISO_SPACING_MM;
use oto_berry::prelude::*;

#[derive(Parser, Debug)]
#[command(version, about = "颞骨 CT 多结构批量自动分割")]
struct Cli {
    /// 输入目录, 其下每个匹配后缀的文件视为一个体数据.
    input: PathBuf,

    /// 输出根目录, 每个体数据的产物写入 `<output>/<体数据名>/`.
    output: PathBuf,

    /// 离线推理结果根目录, 布局为 `<dir>/<体数据名>/<模型名>.nii.gz`.
    #[arg(long, value_name = "DIR")]
    oracle_dir: PathBuf,

    /// 输入文件名后缀过滤.
    #[arg(long, default_value = ".nii.gz")]
    pattern: String,

    /// 重采样目标分辨率 (毫米).
    #[arg(long, default_value_t = TARGET_ISO_SPACING_MM)]
    spacing: f64,

    /// 不导出逐结构掩膜 labelmap.
    #[arg(long)]
    no_labelmaps: bool,

    /// 不导出逐结构 OBJ 表面网格.
    #[arg(long)]
    no_obj: bool,

    /// 对噪声敏感结构禁用中值滤波强度参考.
    #[arg(long)]
    no_median_filter: bool,

    /// 额外尝试导出 DICOM 序列.
    #[arg(long)]
    export_dicom: bool,

    /// 输出更详细的日志.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    simple_logger::init_with_level(level).expect("logger 重复初始化");

    let mut config = BatchConfig::new(cli.input, cli.output);
    config.pattern = cli.pattern;
    config.target_spacing_mm = cli.spacing;
    config.options = RunOptions {
        export_labelmaps: !cli.no_labelmaps,
        export_meshes: !cli.no_obj,
        median_filter: !cli.no_median_filter,
        export_dicom: cli.export_dicom,
        cancel: None,
    };

    let specs = default_structures();
    let mut oracle = PrecomputedOracle::new(cli.oracle_dir);
    let mut exporter = NiftiObjExporter;

    let runner = match VolumeBatchRunner::new(config, &specs, &mut oracle, &mut exporter) {
        Ok(runner) => runner,
        Err(e) => {
            log::error!("批次无法启动: {e}");
            return ExitCode::FAILURE;
        }
    };

    let report = runner.run_to_end();
    let mut stdout = std::io::stdout().lock();
    let _ = report.describe_into(&mut stdout);
    let _ = stdout.flush();
    ExitCode::SUCCESS
}
