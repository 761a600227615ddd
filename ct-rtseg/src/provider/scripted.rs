//! 进程内的脚本化推理服务. 按任务返回预先给定的标签体积或错误, 并记录每次调用.
//!
//! 用于测试与演练 (dry run), 不依赖任何外部程序.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use ndarray::Array3;

use super::{Device, InferenceProvider, Mode, ProviderOutput, Spacing, VolumeSource};
use crate::catalog::Task;
use crate::error::ProviderError;

/// 一次被记录的调用.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptedCall {
    /// 任务.
    pub task: Task,

    /// 请求的器官. `None` 表示全部.
    pub organs: Option<Vec<String>>,

    /// 模式.
    pub mode: Mode,

    /// 设备.
    pub device: Device,
}

type Hook = Box<dyn Fn(Task) + Send + Sync>;

/// 脚本化推理服务.
#[derive(Default)]
pub struct ScriptedProvider {
    script: BTreeMap<Task, Result<ProviderOutput, String>>,
    calls: Mutex<Vec<ScriptedCall>>,
    metadata: Option<String>,
    no_download: bool,
    hook: Option<Hook>,
}

impl fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("tasks", &self.script.keys().collect::<Vec<_>>())
            .field("calls", &self.lock().len())
            .field("metadata", &self.metadata.is_some())
            .finish()
    }
}

impl ScriptedProvider {
    /// 空脚本. 任何调用都会失败.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 任务 `task` 返回 `labels`.
    pub fn with_output(mut self, task: Task, labels: Array3<u16>, spacing: Spacing) -> Self {
        self.script
            .insert(task, Ok(ProviderOutput { labels, spacing }));
        self
    }

    /// 任务 `task` 以 `reason` 失败.
    pub fn with_failure<S: Into<String>>(mut self, task: Task, reason: S) -> Self {
        self.script.insert(task, Err(reason.into()));
        self
    }

    /// 服务提供的标签元数据.
    pub fn with_metadata<S: Into<String>>(mut self, json: S) -> Self {
        self.metadata = Some(json.into());
        self
    }

    /// 模型视为已在本地, 不触发下载提示.
    pub fn without_download(mut self) -> Self {
        self.no_download = true;
        self
    }

    /// 每次调用 (返回之前) 执行 `hook`.
    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Task) + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ScriptedCall>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 迄今为止的调用记录.
    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.lock().clone()
    }

    /// 被调用过的任务, 按调用顺序.
    pub fn called_tasks(&self) -> Vec<Task> {
        self.lock().iter().map(|c| c.task).collect()
    }
}

impl InferenceProvider for ScriptedProvider {
    fn run(
        &self,
        source: &VolumeSource,
        task: Task,
        organs: Option<&[String]>,
        mode: Mode,
        device: Device,
    ) -> Result<ProviderOutput, ProviderError> {
        tracing::debug!(%task, source = %source.describe(), "scripted inference");
        self.lock().push(ScriptedCall {
            task,
            organs: organs.map(<[String]>::to_vec),
            mode,
            device,
        });
        if let Some(hook) = &self.hook {
            hook(task);
        }
        match self.script.get(&task) {
            Some(Ok(out)) => Ok(out.clone()),
            Some(Err(reason)) => Err(ProviderError::Other(reason.clone())),
            None => Err(ProviderError::Other(format!("no scripted output for `{task}`"))),
        }
    }

    fn metadata(&self) -> Option<String> {
        self.metadata.clone()
    }

    fn needs_download(&self, _task: Task) -> bool {
        !self.no_download
    }
}
