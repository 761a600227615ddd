//! `rtseg`: 命令行入口.
//!
//! 读取配置, 安装日志, 然后执行子命令. 推理由外部分割程序完成,
//! 结果以 npz 加清单的形式写出.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ct_rtseg::config::{config_path_from_env_or_home, LogConfig};
use ct_rtseg::prelude::*;
use tracing_subscriber::EnvFilter;

mod input;
mod runner;

#[derive(Parser, Debug)]
#[command(name = "rtseg", version, about = "CT 多任务器官分割与结构集导出")]
struct Cli {
    /// 配置文件. 默认为 `$CT_RTSEG_CONFIG` 或 `~/.ct-rtseg/config.toml`.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// 列出任务及其器官数.
    Tasks {
        /// 推理服务的标签元数据 (JSON).
        #[arg(long)]
        metadata: Option<PathBuf>,
    },

    /// 显示给定器官的任务规划.
    Plan {
        /// 器官, 逗号分隔.
        #[arg(value_delimiter = ',')]
        organs: Vec<String>,

        /// 指定任务.
        #[arg(long)]
        task: Option<Task>,
    },

    /// 分割并导出.
    Run(runner::RunArgs),

    /// 写出默认配置.
    InitConfig {
        /// 覆盖已有文件.
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(cfg: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(p) => SegConfig::load_from(p),
        None => SegConfig::load(),
    };
    let cfg = match loaded {
        Ok(cfg) => {
            init_logging(&cfg.log);
            cfg
        }
        Err(e) => {
            init_logging(&LogConfig::default());
            tracing::warn!(error = %e, "could not load config, using defaults");
            SegConfig::default()
        }
    };

    match cli.cmd {
        Cmd::Tasks { metadata } => {
            let json = metadata
                .map(|p| std::fs::read_to_string(&p).with_context(|| format!("reading {}", p.display())))
                .transpose()?;
            let catalog = TaskCatalog::resolve(json.as_deref());
            for (task, table) in catalog.iter() {
                let mode = if task.requires_accurate_mode() { "accurate only" } else { "" };
                println!("{:<24}{:>5} organs  {mode}", task.id(), table.len());
            }
        }
        Cmd::Plan { organs, task } => {
            let catalog = TaskCatalog::bundled();
            let index = OrganIndex::build(&catalog);
            let mut req = SegmentationRequest::from_config(&cfg, organs);
            if let Some(t) = task {
                req = req.with_task(t);
            }
            let plan = req.plan(&index, &catalog);
            for (task, subset) in plan.assignment.iter() {
                match subset.to_request() {
                    Some(o) => println!("{task}: {}", o.join(", ")),
                    None => println!("{task}: <all>"),
                }
            }
            for d in &plan.derived {
                println!("derived: {d}");
            }
            for e in &plan.unmet {
                println!("unmet: {e}");
            }
        }
        Cmd::Run(args) => runner::run(&cfg, args)?,
        Cmd::InitConfig { force } => {
            let path = match cli.config {
                Some(p) => p,
                None => config_path_from_env_or_home()?,
            };
            if path.exists() && !force {
                bail!("{} already exists, use --force to overwrite", path.display());
            }
            SegConfig::default().save(&path)?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
