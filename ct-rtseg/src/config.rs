//! 运行配置.
//!
//! 配置以 TOML 保存. 查找顺序:
//!
//! 1. 显式给出的路径;
//! 2. 环境变量 `$CT_RTSEG_CONFIG`;
//! 3. `$HOME/.ct-rtseg/config.toml`.
//!
//! 文件不存在时使用默认值. 文件存在但无法读取或解析时返回 `Err`,
//! 由调用方记录后回退到默认值.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::Task;
use crate::consts::{DEFAULT_MAX_DISTORTION, MIN_EXPORT_VOXELS};
use crate::error::ConfigError;
use crate::morph::{Refinement, SmoothMethod, SmoothOptions};
use crate::provider::{Device, Mode};

/// 覆盖配置路径的环境变量.
pub const CONFIG_ENV: &str = "CT_RTSEG_CONFIG";

/// 按轴翻转.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlipConfig {
    /// 左右 (x 轴).
    pub lr: bool,

    /// 前后 (y 轴).
    pub ap: bool,

    /// 上下 (z 轴).
    pub si: bool,
}

impl Default for FlipConfig {
    fn default() -> Self {
        Self {
            lr: false,
            ap: true,
            si: false,
        }
    }
}

impl FlipConfig {
    /// 是否有任一轴需要翻转.
    #[inline]
    pub fn any(&self) -> bool {
        self.lr || self.ap || self.si
    }
}

/// 平滑配置.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// 是否平滑.
    pub enabled: bool,

    /// 方法.
    pub method: SmoothMethod,

    /// 平滑尺度, 毫米.
    pub sigma_mm: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: SmoothMethod::Gaussian,
            sigma_mm: 1.0,
        }
    }
}

/// 导出配置.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// 重采样允许的最大畸变.
    pub max_distortion: f64,

    /// 掩码最少体素数.
    pub min_pixels: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_distortion: DEFAULT_MAX_DISTORTION,
            min_pixels: MIN_EXPORT_VOXELS,
        }
    }
}

/// 日志配置. 仅由可执行程序使用.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 默认过滤级别, 可被 `RUST_LOG` 覆盖.
    pub level: String,

    /// 是否输出 JSON.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// 输入输出目录.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// 上次使用的输入目录.
    pub input: Option<PathBuf>,

    /// 结构集输出目录.
    pub output: Option<PathBuf>,
}

/// 分割运行配置.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegConfig {
    /// 是否清理掩码 (填洞, 最大连通域).
    pub clean_masks: bool,

    /// 是否在前景包围盒内做清理与平滑.
    pub use_crop: bool,

    /// 包围盒外扩的体素数.
    pub crop_margin: usize,

    /// 设备偏好.
    pub device: Device,

    /// 是否使用加速模式.
    pub fast: bool,

    /// 是否总是将肺叶融合为左右肺.
    pub fuse_lung_lobes: bool,

    /// 按轴翻转.
    pub flip: FlipConfig,

    /// 平滑.
    pub smoothing: SmoothingConfig,

    /// 任务开关. 未列出的任务默认启用.
    pub tasks: BTreeMap<String, bool>,

    /// 导出.
    pub export: ExportConfig,

    /// 日志.
    pub log: LogConfig,

    /// 目录.
    pub paths: PathConfig,
}

impl Default for SegConfig {
    fn default() -> Self {
        Self {
            clean_masks: true,
            use_crop: true,
            crop_margin: 10,
            device: Device::Cpu,
            fast: false,
            fuse_lung_lobes: false,
            flip: FlipConfig::default(),
            smoothing: SmoothingConfig::default(),
            tasks: BTreeMap::new(),
            export: ExportConfig::default(),
            log: LogConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

/// 默认配置路径: `$HOME/.ct-rtseg/config.toml`.
pub fn home_config_path() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.extend([".ct-rtseg", "config.toml"]);
    Some(ans)
}

/// 获取配置路径.
///
/// 1. 若环境变量 `$CT_RTSEG_CONFIG` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/.ct-rtseg/config.toml`.
pub fn config_path_from_env_or_home() -> Result<PathBuf, ConfigError> {
    match env::var(CONFIG_ENV) {
        Ok(p) if !p.is_empty() => Ok(PathBuf::from(p)),
        _ => home_config_path().ok_or(ConfigError::NoHome),
    }
}

impl SegConfig {
    /// 从 TOML 文本解析并校验.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 从文件加载. 文件不存在时返回默认值.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = Self::from_toml(&text)?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(cfg)
    }

    /// 从 `$CT_RTSEG_CONFIG` 或 `$HOME/.ct-rtseg/config.toml` 加载.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_path_from_env_or_home()?)
    }

    /// 写回 TOML 文件. 必要时创建父目录.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text).map_err(io_err)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// 校验配置值.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.smoothing.sigma_mm >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "smoothing.sigma_mm must be non-negative, got {}",
                self.smoothing.sigma_mm
            )));
        }
        if !(self.export.max_distortion > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "export.max_distortion must be positive, got {}",
                self.export.max_distortion
            )));
        }
        if self.export.min_pixels == 0 {
            return Err(ConfigError::Invalid(
                "export.min_pixels must be at least 1".into(),
            ));
        }
        for id in self.tasks.keys() {
            if id.parse::<Task>().is_err() {
                tracing::warn!(task = %id, "unknown task in config allow-list");
            }
        }
        Ok(())
    }

    /// 全局推理模式.
    #[inline]
    pub fn mode(&self) -> Mode {
        if self.fast {
            Mode::Fast
        } else {
            Mode::Accurate
        }
    }

    /// 掩码精修参数.
    pub fn refinement(&self) -> Refinement {
        Refinement {
            clean: self.clean_masks,
            smoothing: self.smoothing.enabled.then_some(SmoothOptions {
                method: self.smoothing.method,
                sigma_mm: self.smoothing.sigma_mm,
            }),
            crop_margin: self.use_crop.then_some(self.crop_margin),
        }
    }
}
