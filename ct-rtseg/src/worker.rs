//! 后台分割线程.
//!
//! 每个请求由一个独立线程完整执行 (规划, 调度, 后处理). 控制线程通过
//! [`WorkerHandle`] 接收进度事件, 请求取消, 并在结束后取得冻结的结果.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver};
use tokio_util::sync::CancellationToken;

use crate::catalog::TaskCatalog;
use crate::dispatch::{Dispatcher, FrozenReport, Progress, SegmentationRequest};
use crate::provider::{InferenceProvider, ModelCache, VolumeSource};

/// 后台分割线程的构建器.
pub struct SegmentationWorker {
    provider: Arc<dyn InferenceProvider>,
    catalog: Arc<TaskCatalog>,
    cache: Arc<ModelCache>,
}

impl SegmentationWorker {
    /// 创建. 模型缓存状态在进程内共享.
    pub fn new(provider: Arc<dyn InferenceProvider>, catalog: Arc<TaskCatalog>) -> Self {
        Self {
            provider,
            catalog,
            cache: ModelCache::shared(),
        }
    }

    /// 使用指定的模型缓存状态.
    pub fn with_cache(mut self, cache: Arc<ModelCache>) -> Self {
        self.cache = cache;
        self
    }

    /// 在新线程上执行请求.
    pub fn spawn(&self, source: VolumeSource, request: SegmentationRequest) -> io::Result<WorkerHandle> {
        let (tx, rx) = unbounded();
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(self.provider.clone(), self.catalog.clone(), source, request)
            .with_cache(self.cache.clone())
            .with_cancel(cancel.clone())
            .with_progress(tx);

        let join = thread::Builder::new()
            .name("ct-rtseg-worker".into())
            .spawn(move || dispatcher.run_request().freeze())?;
        tracing::debug!("segmentation worker spawned");
        Ok(WorkerHandle {
            progress: rx,
            cancel,
            join,
        })
    }
}

/// 后台分割线程句柄.
#[derive(Debug)]
pub struct WorkerHandle {
    progress: Receiver<Progress>,
    cancel: CancellationToken,
    join: JoinHandle<FrozenReport>,
}

impl WorkerHandle {
    /// 进度事件. 线程结束后通道关闭.
    #[inline]
    pub fn progress(&self) -> &Receiver<Progress> {
        &self.progress
    }

    /// 请求取消. 正在进行的推理调用不会被打断, 在下一个检查点生效.
    pub fn cancel(&self) {
        tracing::info!("cancellation requested");
        self.cancel.cancel();
    }

    /// 线程是否已结束.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 等待线程结束并取得结果. 线程 panic 时返回 `Err`.
    pub fn join(self) -> thread::Result<FrozenReport> {
        self.join.join()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;
    use crate::catalog::Task;
    use crate::config::SegConfig;
    use crate::dispatch::RunStatus;
    use crate::provider::{ScriptedProvider, Spacing};

    #[test]
    fn test_worker_runs_and_reports_progress() {
        let catalog = Arc::new(TaskCatalog::bundled());
        let liver = catalog.table(Task::Total).unwrap().class_of("liver").unwrap();
        let mut labels = Array3::<u16>::zeros((4, 4, 4));
        labels[(1, 1, 1)] = liver;
        let provider = ScriptedProvider::new()
            .without_download()
            .with_output(Task::Total, labels, Spacing::default());
        let worker = SegmentationWorker::new(Arc::new(provider), catalog)
            .with_cache(Arc::new(ModelCache::new()));
        let request = SegmentationRequest::from_config(&SegConfig::default(), ["liver"]);
        let handle = worker
            .spawn(VolumeSource::Nifti("ct.nii.gz".into()), request)
            .unwrap();

        let events: Vec<Progress> = handle.progress().iter().collect();
        assert!(matches!(events.first(), Some(Progress::Planned { .. })));
        assert!(matches!(
            events.last(),
            Some(Progress::Finished { masks: 1, status: RunStatus::Completed })
        ));

        let report = handle.join().unwrap();
        assert_eq!(report.masks.names(), vec!["liver".to_string()]);
    }
}
