//! 调用外部分割可执行程序的推理服务.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use ndarray::{Array3, Ix3};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use super::{Device, InferenceProvider, Mode, ProviderOutput, Spacing, VolumeSource};
use crate::catalog::Task;
use crate::error::ProviderError;

/// 标准错误输出保留的最大字节数.
const STDERR_TAIL: usize = 2000;

/// 命令行推理服务配置.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandProviderConfig {
    /// 可执行程序.
    pub program: PathBuf,

    /// 中间文件目录. `None` 时使用系统临时目录.
    pub work_dir: Option<PathBuf>,

    /// 追加在每次调用末尾的参数.
    pub extra_args: Vec<String>,

    /// 推理服务标签元数据 (JSON) 文件.
    pub metadata: Option<PathBuf>,
}

impl Default for CommandProviderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("TotalSegmentator"),
            work_dir: None,
            extra_args: vec![],
            metadata: None,
        }
    }
}

/// 通过外部命令运行推理:
///
/// `<program> -i <input> -o <output.nii.gz> --ml --task <id> [--fast] [--roi_subset ...] --device <cpu|gpu>`
///
/// 输出的多标签 nifti 被读回并转换为 `(z, y, x)`.
#[derive(Clone, Debug)]
pub struct CommandProvider {
    config: CommandProviderConfig,
}

impl CommandProvider {
    /// 创建.
    #[inline]
    pub fn new(config: CommandProviderConfig) -> Self {
        Self { config }
    }

    /// 中间文件目录.
    fn work_dir(&self) -> PathBuf {
        self.config
            .work_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join(format!("ct-rtseg-{}", std::process::id())))
    }

    /// 推理输入路径. 手动构建的体积先写入 `dir` 下的临时目录,
    /// 该目录随返回的 [`TempDir`] 一起删除.
    fn input_path(
        &self,
        source: &VolumeSource,
        dir: &Path,
    ) -> Result<(PathBuf, Option<TempDir>), ProviderError> {
        match source {
            VolumeSource::DicomSeries { dir, .. } => Ok((dir.clone(), None)),
            VolumeSource::Nifti(p) => Ok((p.clone(), None)),
            VolumeSource::Manual(v) => {
                let staging = tempfile::Builder::new()
                    .prefix("manual-")
                    .tempdir_in(dir)
                    .map_err(|e| ProviderError::Other(format!("cannot create staging dir: {e}")))?;
                let p = staging.path().join("manual_input.nii.gz");
                v.write_nifti(&p)
                    .map_err(|e| ProviderError::Other(format!("cannot stage manual volume: {e}")))?;
                Ok((p, Some(staging)))
            }
        }
    }

    /// 组装参数列表.
    fn args(
        &self,
        input: &Path,
        output: &Path,
        task: Task,
        organs: Option<&[String]>,
        mode: Mode,
        device: Device,
    ) -> Vec<String> {
        let mut ans = vec![
            "-i".to_string(),
            input.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
            "--ml".to_string(),
            "--task".to_string(),
            task.id().to_string(),
        ];
        if mode.is_fast() {
            ans.push("--fast".to_string());
        }
        if let Some(organs) = organs.filter(|o| !o.is_empty()) {
            ans.push("--roi_subset".to_string());
            ans.extend(organs.iter().cloned());
        }
        ans.push("--device".to_string());
        ans.push(device.as_str().to_string());
        ans.extend(self.config.extra_args.iter().cloned());
        ans
    }
}

/// 读取多标签 nifti, 返回 `(z, y, x)` 标签体积及其体素间距.
pub(crate) fn read_label_volume(path: &Path) -> Result<ProviderOutput, ProviderError> {
    let output_err = |source| ProviderError::Output {
        path: path.to_path_buf(),
        source,
    };
    let obj = ReaderOptions::new().read_file(path).map_err(output_err)?;
    let pixdim = obj.header().pixdim;

    // [x, y, z] -> [z, y, x]
    let data = obj
        .into_volume()
        .into_ndarray::<u16>()
        .map_err(output_err)?
        .permuted_axes([2, 1, 0].as_slice());
    let ndim = data.ndim();
    let data = data
        .into_dimensionality::<Ix3>()
        .map_err(|_| ProviderError::Dimensionality(ndim))?;
    let labels: Array3<u16> = data.as_standard_layout().into_owned();

    let spacing = Spacing::new(
        f64::from(pixdim[3]),
        f64::from(pixdim[2]),
        f64::from(pixdim[1]),
    );
    let spacing = if spacing.is_valid() {
        spacing
    } else {
        tracing::warn!(?spacing, "output spacing invalid, assuming 1 mm isotropic");
        Spacing::default()
    };
    Ok(ProviderOutput { labels, spacing })
}

/// 截取字符串末尾至多 `n` 字节 (按字符边界).
fn tail(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut start = s.len() - n;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

impl InferenceProvider for CommandProvider {
    fn run(
        &self,
        source: &VolumeSource,
        task: Task,
        organs: Option<&[String]>,
        mode: Mode,
        device: Device,
    ) -> Result<ProviderOutput, ProviderError> {
        let program = self.config.program.display().to_string();
        let dir = self.work_dir();
        fs::create_dir_all(&dir).map_err(|source| ProviderError::Launch {
            command: program.clone(),
            source,
        })?;

        let (input, _staging) = self.input_path(source, &dir)?;
        let output = dir.join(format!("{}.nii.gz", task.id()));
        let args = self.args(&input, &output, task, organs, mode, device);
        tracing::debug!(%program, ?args, "launching inference command");

        let out = Command::new(&self.config.program)
            .args(&args)
            .output()
            .map_err(|source| ProviderError::Launch {
                command: program.clone(),
                source,
            })?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ProviderError::Exit {
                task,
                status: out.status.to_string(),
                stderr: tail(stderr.trim(), STDERR_TAIL).to_string(),
            });
        }

        let ans = read_label_volume(&output)?;
        if let Err(e) = fs::remove_file(&output) {
            tracing::debug!(path = %output.display(), error = %e, "could not remove inference output");
        }
        Ok(ans)
    }

    fn metadata(&self) -> Option<String> {
        let path = self.config.metadata.as_ref()?;
        match fs::read_to_string(path) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "provider metadata unreadable");
                None
            }
        }
    }
}
