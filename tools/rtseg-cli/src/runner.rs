//! `run` 子命令.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Args;
use ct_rtseg::error::ExportError;
use ct_rtseg::prelude::*;

use crate::input;

/// `run` 的参数.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// nifti 文件或 DICOM 序列目录.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// 器官, 逗号分隔. 为空时运行通用任务的全部类别.
    #[arg(short, long, value_delimiter = ',')]
    organs: Vec<String>,

    /// 指定任务.
    #[arg(long)]
    task: Option<Task>,

    /// 覆盖配置中的设备.
    #[arg(long)]
    device: Option<Device>,

    /// 使用加速模式.
    #[arg(long)]
    fast: bool,

    /// 导出网格 `ROWS,COLS,SLICES`. 默认由掩码形状转置得到.
    #[arg(long, value_delimiter = ',')]
    target: Option<Vec<usize>>,

    /// 输出根目录.
    #[arg(short = 'O', long)]
    output: Option<PathBuf>,

    /// 患者名, 用于输出目录命名.
    #[arg(long, default_value = "Patient")]
    patient: String,

    /// 分割程序.
    #[arg(long, default_value = "TotalSegmentator")]
    program: PathBuf,

    /// 中间文件目录.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// 推理服务的标签元数据 (JSON).
    #[arg(long)]
    metadata: Option<PathBuf>,
}

fn log_progress(ev: &Progress) {
    match ev {
        Progress::TaskStarted { task, index, total } => {
            tracing::info!("[{}/{total}] {task}", index + 1);
        }
        Progress::TaskFinished { task, state } => tracing::debug!(%task, ?state, "task finished"),
        Progress::OrganExtracted { organ, voxels, .. } => {
            tracing::debug!(%organ, voxels, "organ extracted")
        }
        _ => {}
    }
}

/// 实际运行.
pub fn run(cfg: &SegConfig, args: RunArgs) -> anyhow::Result<()> {
    let path = input::input_from_env_or_config(args.input, cfg)
        .ok_or_else(|| anyhow!("no input given (use --input or ${})", input::INPUT_ENV))?;
    let source = input::volume_source(&path)?;

    let provider = Arc::new(CommandProvider::new(CommandProviderConfig {
        program: args.program,
        work_dir: args.work_dir,
        extra_args: vec![],
        metadata: args.metadata,
    }));
    let catalog = Arc::new(TaskCatalog::resolve(provider.metadata().as_deref()));

    let mut request = SegmentationRequest::from_config(cfg, args.organs);
    if let Some(task) = args.task {
        request = request.with_task(task);
    }
    if let Some(device) = args.device {
        request.device = device;
    }
    if args.fast {
        request.mode = Mode::Fast;
    }

    let handle = SegmentationWorker::new(provider, catalog)
        .spawn(source, request)
        .context("spawning segmentation worker")?;
    for ev in handle.progress().iter() {
        log_progress(&ev);
    }
    let report = handle
        .join()
        .map_err(|_| anyhow!("segmentation worker panicked"))?;

    for (task, state) in &report.states {
        if state.is_terminal() {
            tracing::info!(%task, ?state, "task state");
        } else {
            tracing::warn!(%task, "task was not launched");
        }
    }
    if report.status == RunStatus::Cancelled {
        tracing::warn!("run was cancelled, exporting partial results");
    }
    let Some((_, first)) = report.masks.iter().next() else {
        tracing::warn!("no masks produced, export skipped");
        return Ok(());
    };

    let target = match args.target.as_deref() {
        Some(&[r, c, s]) => ReconciliationTarget::new(r, c, s),
        Some(other) => bail!("--target needs exactly 3 values, got {}", other.len()),
        None => {
            let (z, y, x) = first.shape();
            ReconciliationTarget::new(y, x, z)
        }
    };
    let set = match prepare_export(&report.masks, target, &cfg.export.into()) {
        Ok(set) => set,
        Err(ExportError::NoMasks) => {
            tracing::warn!("no mask survived reconciliation, export skipped");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let root = args
        .output
        .or_else(|| cfg.paths.output.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let out = NpzStructureWriter::new(root).write(&set, &args.patient)?;
    println!("{}", out.display());
    Ok(())
}
