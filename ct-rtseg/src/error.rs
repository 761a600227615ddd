//! 运行时错误.
//!
//! 每类错误都只在自己的边界内被捕获和记录: 规划失败丢弃器官,
//! 推理失败丢弃任务, 协调失败丢弃导出中的器官. 取消不是错误,
//! 见 [`crate::dispatch::RunStatus::Cancelled`].

use crate::catalog::Task;
use crate::Shape3d;
use std::path::PathBuf;
use thiserror::Error;

/// 规划错误. 器官会从请求中被丢弃.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    /// 没有任何任务能输出该器官.
    #[error("organ `{0}` is not produced by any known task")]
    Unmapped(String),

    /// 选中的任务实际上不包含该器官 (目录不一致).
    #[error("organ `{organ}` is missing from the label table of task `{task}`")]
    NotInTable {
        /// 器官名.
        organ: String,
        /// 被选中的任务.
        task: Task,
    },

    /// 请求指定了某个真实任务, 但该任务不输出此器官.
    #[error("organ `{organ}` is not covered by requested task `{task}`")]
    NotCoveredByTask {
        /// 器官名.
        organ: String,
        /// 请求的任务.
        task: Task,
    },
}

impl PlanningError {
    /// 获取出错的器官名.
    pub fn organ(&self) -> &str {
        match self {
            Self::Unmapped(o) => o,
            Self::NotInTable { organ, .. } | Self::NotCoveredByTask { organ, .. } => organ,
        }
    }
}

/// 外部推理服务错误. 该任务不产生任何掩码, 运行继续.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 推理进程无法启动.
    #[error("failed to launch inference command `{command}`: {source}")]
    Launch {
        /// 命令.
        command: String,
        /// 底层 I/O 错误.
        #[source]
        source: std::io::Error,
    },

    /// 推理进程以非零状态退出.
    #[error("inference for task `{task}` exited with status {status}: {stderr}")]
    Exit {
        /// 任务.
        task: Task,
        /// 退出码描述.
        status: String,
        /// 标准错误输出 (截断).
        stderr: String,
    },

    /// 推理结果无法读取.
    #[error("failed to read inference output {path}: {source}")]
    Output {
        /// 输出文件.
        path: PathBuf,
        /// nifti 读取错误.
        #[source]
        source: nifti::NiftiError,
    },

    /// 推理结果不是三维标签体积.
    #[error("inference output has unexpected dimensionality {0}")]
    Dimensionality(usize),

    /// 服务不支持该输入.
    #[error("unsupported volume source: {0}")]
    UnsupportedSource(String),

    /// 服务端报告的其它错误.
    #[error("provider failure: {0}")]
    Other(String),
}

/// 几何协调错误. 器官会从本次导出中被丢弃.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconciliationError {
    /// 缩放畸变超过上限, 拒绝缩放.
    #[error(
        "resize from {from:?} to {to:?} refused: distortion {distortion:.2} exceeds {ceiling}"
    )]
    ExcessiveDistortion {
        /// 原形状.
        from: Shape3d,
        /// 目标形状.
        to: Shape3d,
        /// 实际畸变.
        distortion: f64,
        /// 允许的上限.
        ceiling: f64,
    },

    /// 形状中有长度为 0 的轴.
    #[error("cannot resample degenerate shape {0:?}")]
    Degenerate(Shape3d),

    /// 某个策略不适用于当前形状.
    #[error("{strategy}: {reason}")]
    Inapplicable {
        /// 策略名.
        strategy: &'static str,
        /// 原因.
        reason: String,
    },

    /// 所有策略均失败. 内含每个策略的失败原因.
    #[error("no strategy reconciled {from:?} to {to:?}: {}", reasons.join("; "))]
    Exhausted {
        /// 原形状.
        from: Shape3d,
        /// 目标形状.
        to: Shape3d,
        /// 每个策略的失败原因.
        reasons: Vec<String>,
    },
}

/// 手动体积构建错误.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// 有效切片不足.
    #[error("too many damaged slices to build a volume: {good} usable, at least {required} needed")]
    TooFewSlices {
        /// 有效切片数.
        good: usize,
        /// 所需最少切片数.
        required: usize,
    },

    /// 切片尺寸不一致.
    #[error("slice {index} has shape {found:?}, expected {expected:?}")]
    InconsistentSlice {
        /// 切片序号.
        index: usize,
        /// 实际形状.
        found: (usize, usize),
        /// 期望形状.
        expected: (usize, usize),
    },

    /// 缺少必要的几何标签.
    #[error("missing geometry tag `{0}` on the first slice")]
    MissingTag(&'static str),

    /// 写出 nifti 失败.
    #[error("failed to write nifti volume: {0}")]
    Nifti(#[from] nifti::NiftiError),
}

/// 任务目录错误.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// 元数据不是合法 JSON 或结构不符.
    #[error("malformed task metadata: {0}")]
    Malformed(#[from] serde_json::Error),

    /// 元数据中没有任何可识别的任务.
    #[error("task metadata contains no known task")]
    NoKnownTask,
}

/// 配置错误.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 读写配置文件失败.
    #[error("failed to access config file {path}: {source}")]
    Io {
        /// 配置路径.
        path: PathBuf,
        /// 底层 I/O 错误.
        #[source]
        source: std::io::Error,
    },

    /// 配置解析失败.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// 配置序列化失败.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// 配置值非法.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// 无法定位用户主目录.
    #[error("home directory is not available")]
    NoHome,
}

/// 导出错误.
#[derive(Debug, Error)]
pub enum ExportError {
    /// 协调后没有任何掩码存活, 不写出空结构集.
    #[error("no mask survived reconciliation; structure set export skipped")]
    NoMasks,

    /// 写出失败.
    #[error("failed to write structure set to {path}: {reason}")]
    Write {
        /// 输出路径.
        path: PathBuf,
        /// 原因.
        reason: String,
    },
}
