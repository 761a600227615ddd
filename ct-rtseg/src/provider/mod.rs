//! 外部推理服务接口.
//!
//! 神经网络推理本身不在本 crate 范围内. 这里只定义调度器调用推理服务的方式,
//! 以及两个实现: 调用外部可执行程序的 [`CommandProvider`],
//! 和用于测试/演练的 [`ScriptedProvider`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array3;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::catalog::Task;
use crate::error::ProviderError;
use crate::volume::ManualVolume;

mod command;
mod scripted;

pub use command::{CommandProvider, CommandProviderConfig};
pub use scripted::{ScriptedCall, ScriptedProvider};

/// 推理设备偏好.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// 中央处理器.
    #[default]
    Cpu,

    /// 图形处理器.
    Gpu,
}

impl Device {
    /// 推理服务识别的设备名.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "cuda" => Ok(Device::Gpu),
            other => Err(format!("unknown device `{other}`")),
        }
    }
}

/// 推理模式.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// 加速模式 (低分辨率模型).
    Fast,

    /// 精确模式 (全分辨率模型).
    Accurate,
}

impl Mode {
    /// 是否为加速模式.
    #[inline]
    pub const fn is_fast(&self) -> bool {
        matches!(self, Mode::Fast)
    }
}

/// 体素物理间距, 单位为毫米, 按 `(z, y, x)` 组织.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Spacing {
    /// 层间 (slice) 方向.
    pub z: f64,

    /// 行方向.
    pub y: f64,

    /// 列方向.
    pub x: f64,
}

impl Default for Spacing {
    fn default() -> Self {
        Self::isotropic(1.0)
    }
}

impl Spacing {
    /// 直接创建.
    #[inline]
    pub const fn new(z: f64, y: f64, x: f64) -> Self {
        Self { z, y, x }
    }

    /// 各向同性间距.
    #[inline]
    pub const fn isotropic(mm: f64) -> Self {
        Self::new(mm, mm, mm)
    }

    /// 转换为 `[z, y, x]` 数组, 与推理空间轴序一致.
    #[inline]
    pub const fn as_array(&self) -> [f64; 3] {
        [self.z, self.y, self.x]
    }

    /// 三个方向中的最小间距.
    #[inline]
    pub fn min(&self) -> f64 {
        self.z.min(self.y).min(self.x)
    }

    /// 三个分量是否均为有限正数.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite() && *v > 0.0)
    }
}

/// 推理输入.
#[derive(Clone, Debug)]
pub enum VolumeSource {
    /// 一个 DICOM 序列所在目录, 以及按实例号排好序的切片文件.
    DicomSeries {
        /// 序列目录.
        dir: PathBuf,
        /// 有序切片文件.
        files: Vec<PathBuf>,
    },

    /// 已有的 nifti 体积文件.
    Nifti(PathBuf),

    /// 标准读取器失败后手动构建的体积.
    Manual(Arc<ManualVolume>),
}

impl VolumeSource {
    /// 简短描述, 用于日志.
    pub fn describe(&self) -> String {
        match self {
            VolumeSource::DicomSeries { dir, files } => {
                format!("dicom series {} ({} slices)", dir.display(), files.len())
            }
            VolumeSource::Nifti(p) => format!("nifti {}", p.display()),
            VolumeSource::Manual(v) => format!("manual volume {:?}", v.shape()),
        }
    }

    /// 若为手动构建的体积, 返回之.
    #[inline]
    pub fn manual(&self) -> Option<&ManualVolume> {
        match self {
            VolumeSource::Manual(v) => Some(v),
            _ => None,
        }
    }
}

/// 一次推理的输出.
#[derive(Clone, Debug)]
pub struct ProviderOutput {
    /// 多标签体积, 按 `(z, y, x)` 组织. 0 为背景.
    pub labels: Array3<u16>,

    /// 输出体积的体素间距.
    pub spacing: Spacing,
}

/// 外部推理服务.
///
/// 调用是同步阻塞的; 服务内部是否并行对调度器不可见.
pub trait InferenceProvider: Send + Sync {
    /// 对 `source` 运行任务 `task`.
    ///
    /// `organs` 为 `None` 时请求该任务支持的全部器官.
    fn run(
        &self,
        source: &VolumeSource,
        task: Task,
        organs: Option<&[String]>,
        mode: Mode,
        device: Device,
    ) -> Result<ProviderOutput, ProviderError>;

    /// 推理服务自身的标签元数据 (JSON), 不可获取时返回 `None`.
    fn metadata(&self) -> Option<String> {
        None
    }

    /// 首次运行该任务是否会触发大体积模型下载.
    fn needs_download(&self, _task: Task) -> bool {
        true
    }
}

static SHARED_CACHE: Lazy<Arc<ModelCache>> = Lazy::new(|| Arc::new(ModelCache::new()));

/// 进程级模型缓存状态.
///
/// 仅记录 "已下载" 标志. 请求由单个 worker 串行执行, 不存在下载竞争.
#[derive(Debug, Default)]
pub struct ModelCache {
    downloaded: AtomicBool,
}

impl ModelCache {
    /// 新建 (未下载) 状态.
    #[inline]
    pub const fn new() -> Self {
        Self {
            downloaded: AtomicBool::new(false),
        }
    }

    /// 进程内共享的实例.
    #[inline]
    pub fn shared() -> Arc<ModelCache> {
        SHARED_CACHE.clone()
    }

    /// 模型是否已下载.
    #[inline]
    pub fn is_downloaded(&self) -> bool {
        self.downloaded.load(Ordering::Acquire)
    }

    /// 标记模型已下载.
    #[inline]
    pub fn mark_downloaded(&self) {
        self.downloaded.store(true, Ordering::Release);
    }
}
