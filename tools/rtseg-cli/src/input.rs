//! 输入定位.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use ct_rtseg::prelude::*;

/// 覆盖输入路径的环境变量.
pub const INPUT_ENV: &str = "CT_RTSEG_INPUT";

/// 获取输入路径.
///
/// 1. 命令行给出的路径;
/// 2. 若环境变量 `$CT_RTSEG_INPUT` 非空, 则返回其值;
/// 3. 否则, 返回配置中上次使用的输入目录.
pub fn input_from_env_or_config(arg: Option<PathBuf>, cfg: &SegConfig) -> Option<PathBuf> {
    arg.or_else(|| match env::var(INPUT_ENV) {
        Ok(p) if !p.is_empty() => Some(PathBuf::from(p)),
        _ => None,
    })
    .or_else(|| cfg.paths.input.clone())
}

/// 目录视为 DICOM 序列 (文件按名称排序), 文件视为 nifti 体积.
pub fn volume_source(path: &Path) -> anyhow::Result<VolumeSource> {
    if path.is_file() {
        return Ok(VolumeSource::Nifti(path.to_path_buf()));
    }
    if !path.is_dir() {
        bail!("input {} does not exist", path.display());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("reading {}", path.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    if files.is_empty() {
        bail!("no files in {}", path.display());
    }
    files.sort();
    Ok(VolumeSource::DicomSeries {
        dir: path.to_path_buf(),
        files,
    })
}
