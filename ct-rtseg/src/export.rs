//! 结构集导出准备.
//!
//! 把冻结的掩码集合逐个对齐到导出网格, 生成 DICOM 安全名称与显示颜色,
//! 然后交给 [`StructureSetWriter`]. 真正的 RTSTRUCT 写出器是外部协作方;
//! 本 crate 自带的 [`NpzStructureWriter`] 把结果写成 npz 加清单文件.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::Local;
use ndarray::Array3;
use ndarray_npy::NpzWriter;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::ExportConfig;
use crate::consts::{DICOM_NAME_MAX_LEN, ICRU_COLORS};
use crate::error::ExportError;
use crate::masks::FrozenMaskSet;
use crate::reconcile::{ReconciliationTarget, Reconciler};

/// 将器官名转换为 DICOM ROI 名称: 下划线换成空格, 最多 32 个字符.
pub fn dicom_safe_name(organ: &str) -> String {
    organ.replace('_', " ").chars().take(DICOM_NAME_MAX_LEN).collect()
}

/// 器官显示颜色.
///
/// 名称包含 ICRU 关键字时使用推荐颜色; 否则由名称的 md5 前 6 位十六进制确定,
/// 若三个通道之和小于 60 (接近黑色), 每个通道按位或 `0x40`.
pub fn organ_color(organ: &str) -> [u8; 3] {
    let lower = organ.to_lowercase();
    if let Some((_, c)) = ICRU_COLORS.iter().find(|(k, _)| lower.contains(&k.to_lowercase())) {
        return *c;
    }
    let digest = md5::compute(organ.as_bytes());
    let [r, g, b] = [digest[0], digest[1], digest[2]];
    if u16::from(r) + u16::from(g) + u16::from(b) < 60 {
        [r | 0x40, g | 0x40, b | 0x40]
    } else {
        [r, g, b]
    }
}

static ILLEGAL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*]"#).expect("static regex is valid"));

static REPEATED_UNDERSCORES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_+").expect("static regex is valid"));

/// 文件名净化: 非法字符换成下划线, 合并连续下划线, 去掉首尾空格和下划线.
/// 结果为空时返回 `"Patient"`.
pub fn sanitize_filename(name: &str) -> String {
    let s = ILLEGAL_CHARS.replace_all(name, "_");
    let s = REPEATED_UNDERSCORES.replace_all(&s, "_");
    let s = s.trim_matches(|c| c == ' ' || c == '_');
    if s.is_empty() {
        "Patient".to_string()
    } else {
        s.to_string()
    }
}

/// 导出参数.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ExportOptions {
    /// 重采样允许的最大畸变.
    pub max_distortion: f64,

    /// 掩码最少体素数, 协调前后各检查一次.
    pub min_pixels: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportConfig::default().into()
    }
}

impl From<ExportConfig> for ExportOptions {
    fn from(c: ExportConfig) -> Self {
        Self {
            max_distortion: c.max_distortion,
            min_pixels: c.min_pixels,
        }
    }
}

/// 一个待写出的 ROI.
#[derive(Clone, Debug)]
pub struct ExportRoi {
    /// 原器官名.
    pub organ: String,

    /// DICOM 安全名称.
    pub name: String,

    /// 显示颜色.
    pub color: [u8; 3],

    /// 已对齐到 `(rows, cols, slices)` 的掩码.
    pub mask: Array3<bool>,
}

impl ExportRoi {
    /// 前景体素个数.
    #[inline]
    pub fn voxels(&self) -> usize {
        self.mask.iter().filter(|&&p| p).count()
    }
}

/// 导出准备结果.
#[derive(Clone, Debug)]
pub struct ExportSet {
    /// 目标形状.
    pub target: ReconciliationTarget,

    /// 可写出的 ROI, 按器官名升序.
    pub rois: Vec<ExportRoi>,

    /// 被丢弃的器官及原因.
    pub dropped: Vec<(String, String)>,
}

/// 为导出准备掩码.
///
/// 协调前后体素数少于 `min_pixels` 的掩码, 以及无法协调的掩码都被丢弃并记录原因.
/// 没有任何掩码存活时返回 [`ExportError::NoMasks`].
pub fn prepare_export(
    masks: &FrozenMaskSet,
    target: ReconciliationTarget,
    opts: &ExportOptions,
) -> Result<ExportSet, ExportError> {
    tracing::info!(%target, masks = masks.len(), "preparing structure set export");
    let reconciler = Reconciler::new(opts.max_distortion);
    let mut ans = ExportSet {
        target,
        rois: vec![],
        dropped: vec![],
    };

    for (organ, mask) in masks.iter() {
        let mut skip = |reason: String| {
            tracing::warn!(organ, %reason, "organ dropped from export");
            ans.dropped.push((organ.to_string(), reason));
        };

        let before = mask.voxels();
        if before < opts.min_pixels {
            skip(format!("mask too small ({before} < {})", opts.min_pixels));
            continue;
        }
        let data = match reconciler.reconcile(&mask.data, target.shape()) {
            Ok((data, strategy)) => {
                tracing::debug!(organ, %strategy, "mask reconciled");
                data
            }
            Err(e) => {
                skip(e.to_string());
                continue;
            }
        };
        let after = data.iter().filter(|&&p| p).count();
        if after < opts.min_pixels {
            skip(format!(
                "reconciled mask too small ({after} < {})",
                opts.min_pixels
            ));
            continue;
        }
        ans.rois.push(ExportRoi {
            organ: organ.to_string(),
            name: dicom_safe_name(organ),
            color: organ_color(organ),
            mask: data,
        });
    }

    if ans.rois.is_empty() {
        tracing::warn!(dropped = ans.dropped.len(), "no valid ROI survived, export skipped");
        return Err(ExportError::NoMasks);
    }
    tracing::info!(rois = ans.rois.len(), dropped = ans.dropped.len(), "export prepared");
    Ok(ans)
}

/// 结构集写出器.
pub trait StructureSetWriter {
    /// 写出 `set`. 返回写出的主文件路径.
    fn write(&self, set: &ExportSet, patient: &str) -> Result<PathBuf, ExportError>;
}

/// 清单中的单个 ROI.
#[derive(Serialize)]
struct ManifestRoi<'a> {
    entry: String,
    name: &'a str,
    organ: &'a str,
    color: [u8; 3],
    voxels: usize,
}

/// 清单.
#[derive(Serialize)]
struct Manifest<'a> {
    patient: &'a str,
    created: String,
    shape: [usize; 3],
    rois: Vec<ManifestRoi<'a>>,
}

/// 把每个 ROI 写成 npz 条目, 另写一份 `manifest.toml` 记录名称与颜色.
///
/// 输出目录为 `<root>/<净化后的患者名>_<时间戳>/`.
#[derive(Clone, Debug)]
pub struct NpzStructureWriter {
    root: PathBuf,
}

impl NpzStructureWriter {
    /// 输出到 `root` 下.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// 创建本次导出的目录.
    fn output_dir(&self, patient: &str) -> Result<PathBuf, ExportError> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let dir = self
            .root
            .join(format!("{}_{stamp}", sanitize_filename(patient)));
        fs::create_dir_all(&dir).map_err(|e| write_err(&dir, e))?;
        tracing::info!(dir = %dir.display(), "output directory");
        Ok(dir)
    }
}

#[inline]
fn write_err<E: ToString>(path: &Path, e: E) -> ExportError {
    ExportError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

impl StructureSetWriter for NpzStructureWriter {
    fn write(&self, set: &ExportSet, patient: &str) -> Result<PathBuf, ExportError> {
        if set.rois.is_empty() {
            return Err(ExportError::NoMasks);
        }
        let dir = self.output_dir(patient)?;
        let npz_path = dir.join("structures.npz");
        let file = File::create(&npz_path).map_err(|e| write_err(&npz_path, e))?;
        let mut npz = NpzWriter::new(file);

        let mut rois = Vec::with_capacity(set.rois.len());
        for (i, roi) in set.rois.iter().enumerate() {
            let entry = format!("roi_{i:03}.npy");
            npz.add_array(entry.as_str(), &roi.mask)
                .map_err(|e| write_err(&npz_path, e))?;
            rois.push(ManifestRoi {
                entry,
                name: &roi.name,
                organ: &roi.organ,
                color: roi.color,
                voxels: roi.voxels(),
            });
        }
        npz.finish().map_err(|e| write_err(&npz_path, e))?;

        let (r, c, s) = set.target.shape();
        let manifest = Manifest {
            patient,
            created: Local::now().to_rfc3339(),
            shape: [r, c, s],
            rois,
        };
        let manifest_path = dir.join("manifest.toml");
        let text = toml::to_string_pretty(&manifest).map_err(|e| write_err(&manifest_path, e))?;
        fs::write(&manifest_path, text).map_err(|e| write_err(&manifest_path, e))?;

        tracing::info!(path = %npz_path.display(), rois = set.rois.len(), "structure set saved");
        Ok(npz_path)
    }
}
