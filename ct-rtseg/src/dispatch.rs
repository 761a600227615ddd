//! 任务调度.
//!
//! 按规划顺序依次运行任务, 每个任务的状态为
//! `Pending -> Running -> {Complete | Failed | Skipped}`.
//! 单个任务的失败只会被记录, 运行继续. 取消是协作式的, 在每个任务开始前
//! 和逐器官提取的循环中检查; 被打断的任务不贡献任何掩码.

use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use ndarray::{Array3, Axis};
use tokio_util::sync::CancellationToken;

use crate::catalog::{OrganIndex, Task, TaskCatalog};
use crate::config::{FlipConfig, SegConfig};
use crate::consts::organ;
use crate::masks::{FrozenMaskSet, MaskSet, OrganMask, Provenance};
use crate::morph::Refinement;
use crate::planner::{compute_required_tasks, plan_for_task, OrganSubset, TaskPlan};
use crate::post::{ensure_body_related_masks, merge_lung_lobes};
use crate::provider::{Device, InferenceProvider, ModelCache, Mode, ProviderOutput, Spacing, VolumeSource};

/// 一次分割请求.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentationRequest {
    /// 请求的器官. 为空时运行通用任务的全部类别.
    pub organs: Vec<String>,

    /// 用户指定的任务. `None` 时由规划器选择.
    pub task: Option<Task>,

    /// 设备.
    pub device: Device,

    /// 推理模式.
    pub mode: Mode,

    /// 按轴翻转.
    pub flip: FlipConfig,

    /// 掩码精修.
    pub refinement: Refinement,

    /// 是否总是融合肺叶.
    pub fuse_lung_lobes: bool,

    /// 任务开关. 未列出的任务默认启用.
    pub tasks: BTreeMap<String, bool>,
}

impl Default for SegmentationRequest {
    fn default() -> Self {
        Self::from_config::<_, String>(&SegConfig::default(), [])
    }
}

impl SegmentationRequest {
    /// 由配置与器官选择构建.
    pub fn from_config<I, S>(cfg: &SegConfig, organs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            organs: organs.into_iter().map(Into::into).collect(),
            task: None,
            device: cfg.device,
            mode: cfg.mode(),
            flip: cfg.flip,
            refinement: cfg.refinement(),
            fuse_lung_lobes: cfg.fuse_lung_lobes,
            tasks: cfg.tasks.clone(),
        }
    }

    /// 指定任务.
    #[inline]
    pub fn with_task(mut self, task: Task) -> Self {
        self.task = Some(task);
        self
    }

    /// 任务是否启用.
    #[inline]
    pub fn task_enabled(&self, task: Task) -> bool {
        self.tasks.get(task.id()).copied().unwrap_or(true)
    }

    /// 计算任务规划.
    pub fn plan(&self, index: &OrganIndex, catalog: &TaskCatalog) -> TaskPlan {
        match self.task {
            Some(task) => plan_for_task(task, &self.organs, index, catalog),
            None => compute_required_tasks(&self.organs, index, catalog),
        }
    }
}

/// 单个任务的状态.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// 尚未开始.
    Pending,

    /// 正在运行.
    Running,

    /// 成功.
    Complete,

    /// 失败, 附带原因.
    Failed(String),

    /// 未运行 (被禁用或被取消打断).
    Skipped,
}

impl TaskState {
    /// 是否为终态.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }
}

/// 运行结束方式.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// 全部任务都已处理.
    Completed,

    /// 收到取消请求后提前结束.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
        })
    }
}

/// 进度事件.
#[derive(Clone, Debug, PartialEq)]
pub enum Progress {
    /// 规划完成.
    Planned {
        /// 将要调度的任务.
        tasks: Vec<Task>,
    },

    /// 开始下载模型.
    DownloadStarted,

    /// 模型下载结束 (不论成败).
    DownloadFinished,

    /// 任务开始.
    TaskStarted {
        /// 任务.
        task: Task,
        /// 序号, 从 0 开始.
        index: usize,
        /// 任务总数.
        total: usize,
    },

    /// 提取到一个器官.
    OrganExtracted {
        /// 任务.
        task: Task,
        /// 器官.
        organ: String,
        /// 体素数.
        voxels: usize,
    },

    /// 任务到达终态.
    TaskFinished {
        /// 任务.
        task: Task,
        /// 状态.
        state: TaskState,
    },

    /// 运行结束.
    Finished {
        /// 掩码个数.
        masks: usize,
        /// 结束方式.
        status: RunStatus,
    },
}

/// 一次运行的结果.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// 每个任务的最终状态, 按调度顺序.
    pub states: Vec<(Task, TaskState)>,

    /// 掩码集合.
    pub masks: MaskSet,

    /// 第一个成功任务的体素间距.
    pub spacing: Option<Spacing>,

    /// 结束方式.
    pub status: RunStatus,

    /// 未能满足的器官 (规划阶段与派生阶段).
    pub unmet: Vec<String>,
}

impl RunReport {
    /// 任务的最终状态.
    pub fn state(&self, task: Task) -> Option<&TaskState> {
        self.states.iter().find(|(t, _)| *t == task).map(|(_, s)| s)
    }

    /// 成功的任务.
    pub fn completed_tasks(&self) -> Vec<Task> {
        self.states
            .iter()
            .filter(|(_, s)| *s == TaskState::Complete)
            .map(|(t, _)| *t)
            .collect()
    }

    /// 冻结掩码集合, 供其它线程只读访问.
    pub fn freeze(self) -> FrozenReport {
        FrozenReport {
            states: self.states,
            masks: self.masks.freeze(),
            spacing: self.spacing,
            status: self.status,
            unmet: self.unmet,
        }
    }
}

/// 冻结后的运行结果.
#[derive(Clone, Debug)]
pub struct FrozenReport {
    /// 每个任务的最终状态, 按调度顺序.
    pub states: Vec<(Task, TaskState)>,

    /// 只读掩码集合.
    pub masks: FrozenMaskSet,

    /// 第一个成功任务的体素间距.
    pub spacing: Option<Spacing>,

    /// 结束方式.
    pub status: RunStatus,

    /// 未能满足的器官.
    pub unmet: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum IndicatorState {
    Idle,
    Active,
    Done,
}

/// 模型下载提示. 至多开启一次; 一旦开启, 必定恰好关闭一次 (含出错与取消路径).
struct DownloadIndicator<'a> {
    tx: Option<&'a Sender<Progress>>,
    state: IndicatorState,
}

impl<'a> DownloadIndicator<'a> {
    fn new(tx: Option<&'a Sender<Progress>>) -> Self {
        Self {
            tx,
            state: IndicatorState::Idle,
        }
    }

    fn start(&mut self) {
        if self.state != IndicatorState::Idle {
            return;
        }
        self.state = IndicatorState::Active;
        tracing::info!("downloading model weights, the first run may take a while");
        if let Some(tx) = self.tx {
            let _ = tx.send(Progress::DownloadStarted);
        }
    }

    fn stop(&mut self) {
        if self.state != IndicatorState::Active {
            return;
        }
        self.state = IndicatorState::Done;
        tracing::info!("model download finished");
        if let Some(tx) = self.tx {
            let _ = tx.send(Progress::DownloadFinished);
        }
    }
}

impl Drop for DownloadIndicator<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 完整的错误链.
fn error_chain(e: &dyn Error) -> String {
    let mut ans = e.to_string();
    let mut cur = e.source();
    while let Some(c) = cur {
        let s = c.to_string();
        if !ans.contains(&s) {
            ans.push_str(": ");
            ans.push_str(&s);
        }
        cur = c.source();
    }
    ans
}

/// 单个任务的提取结果.
enum Extraction {
    Done(MaskSet),
    Interrupted,
}

/// 任务调度器.
pub struct Dispatcher {
    provider: Arc<dyn InferenceProvider>,
    catalog: Arc<TaskCatalog>,
    source: VolumeSource,
    request: SegmentationRequest,
    cache: Arc<ModelCache>,
    cancel: CancellationToken,
    progress: Option<Sender<Progress>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("source", &self.source.describe())
            .field("request", &self.request)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Dispatcher {
    /// 创建. 默认使用进程内共享的模型缓存状态, 且不可取消.
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        catalog: Arc<TaskCatalog>,
        source: VolumeSource,
        request: SegmentationRequest,
    ) -> Self {
        Self {
            provider,
            catalog,
            source,
            request,
            cache: ModelCache::shared(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// 使用指定的模型缓存状态.
    pub fn with_cache(mut self, cache: Arc<ModelCache>) -> Self {
        self.cache = cache;
        self
    }

    /// 使用指定的取消令牌.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 发送进度事件.
    pub fn with_progress(mut self, tx: Sender<Progress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// 请求.
    #[inline]
    pub fn request(&self) -> &SegmentationRequest {
        &self.request
    }

    /// 任务目录.
    #[inline]
    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    fn emit(&self, ev: Progress) {
        if let Some(tx) = &self.progress {
            // 接收端已关闭时忽略.
            let _ = tx.send(ev);
        }
    }

    /// 规划并运行.
    pub fn run_request(&self) -> RunReport {
        let index = OrganIndex::build(&self.catalog);
        let plan = self.request.plan(&index, &self.catalog);
        self.run(&plan)
    }

    /// 按规划运行全部任务, 然后执行结构派生与肺叶融合.
    pub fn run(&self, plan: &TaskPlan) -> RunReport {
        let tasks: Vec<(Task, &OrganSubset)> = plan.assignment.iter().collect();
        let total = tasks.len();
        let mut states: Vec<(Task, TaskState)> =
            tasks.iter().map(|(t, _)| (*t, TaskState::Pending)).collect();
        let mut masks = MaskSet::new();
        let mut spacing = None;
        let mut status = RunStatus::Completed;
        let mut indicator = DownloadIndicator::new(self.progress.as_ref());

        tracing::info!(tasks = ?plan.assignment.tasks(), source = %self.source.describe(), "segmentation started");
        self.emit(Progress::Planned {
            tasks: plan.assignment.tasks(),
        });

        for (i, (task, subset)) in tasks.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::info!(%task, remaining = total - i, "cancelled, remaining tasks not launched");
                status = RunStatus::Cancelled;
                break;
            }
            let state = &mut states[i].1;
            if !self.request.task_enabled(task) {
                tracing::info!(%task, "task disabled by configuration, skipped");
                *state = TaskState::Skipped;
                self.emit(Progress::TaskFinished {
                    task,
                    state: state.clone(),
                });
                continue;
            }

            let mode = if task.requires_accurate_mode() && self.request.mode.is_fast() {
                tracing::info!(%task, "task has no fast model, running in accurate mode");
                Mode::Accurate
            } else {
                self.request.mode
            };

            if !self.cache.is_downloaded() && self.provider.needs_download(task) {
                indicator.start();
            }
            *state = TaskState::Running;
            self.emit(Progress::TaskStarted {
                task,
                index: i,
                total,
            });
            tracing::info!(%task, index = i + 1, total, ?mode, device = %self.request.device, "task started");

            let organs = subset.to_request();
            let res = self.provider.run(
                &self.source,
                task,
                organs.as_deref(),
                mode,
                self.request.device,
            );
            indicator.stop();

            *state = match res {
                Err(e) => {
                    tracing::error!(%task, error = %error_chain(&e), "inference failed");
                    TaskState::Failed(e.to_string())
                }
                Ok(out) => {
                    self.cache.mark_downloaded();
                    let out_spacing = out.spacing;
                    match self.extract(task, subset, out) {
                        Err(reason) => {
                            tracing::error!(%task, error = %reason, "inference output unusable");
                            TaskState::Failed(reason)
                        }
                        Ok(Extraction::Interrupted) => {
                            tracing::info!(%task, "cancelled during extraction, task discarded");
                            status = RunStatus::Cancelled;
                            TaskState::Skipped
                        }
                        Ok(Extraction::Done(found)) => {
                            spacing.get_or_insert(out_spacing);
                            let added = masks.merge_from(found);
                            tracing::info!(%task, added, "task complete");
                            TaskState::Complete
                        }
                    }
                }
            };
            self.emit(Progress::TaskFinished {
                task,
                state: state.clone(),
            });
            if status == RunStatus::Cancelled {
                break;
            }
        }
        drop(indicator);

        if self.cancel.is_cancelled() {
            status = RunStatus::Cancelled;
        }

        let mut unmet: Vec<String> = plan.unmet.iter().map(|e| e.organ().to_string()).collect();
        if status == RunStatus::Completed {
            unmet.extend(self.post_process(plan, &mut masks, spacing.unwrap_or_default()));
        }
        drop_intermediates(plan, &mut masks);

        if masks.is_empty() {
            tracing::warn!(%status, "no masks produced");
        } else {
            tracing::info!(masks = masks.len(), %status, "segmentation finished");
        }
        self.emit(Progress::Finished {
            masks: masks.len(),
            status,
        });
        RunReport {
            states,
            masks,
            spacing,
            status,
            unmet,
        }
    }

    /// 将一个任务的输出拆分为逐器官掩码.
    fn extract(
        &self,
        task: Task,
        subset: &OrganSubset,
        out: ProviderOutput,
    ) -> Result<Extraction, String> {
        let table = self
            .catalog
            .table(task)
            .ok_or_else(|| format!("no label table for `{task}`"))?;
        let mut labels = match self.source.manual() {
            Some(v) => v.conform(&out.labels).map_err(|e| e.to_string())?,
            None => out.labels,
        };
        apply_flips(&mut labels, &self.request.flip);

        let mut found = MaskSet::new();
        for (name, class) in table.iter().filter(|(n, _)| subset.wants(n)) {
            if self.cancel.is_cancelled() {
                return Ok(Extraction::Interrupted);
            }
            let raw = labels.mapv(|v| v == class);
            if !raw.iter().any(|&p| p) {
                tracing::debug!(%task, organ = name, "organ absent from output");
                continue;
            }
            let mask = self.request.refinement.apply(raw, &out.spacing);
            let voxels = mask.iter().filter(|&&p| p).count();
            if voxels == 0 {
                tracing::debug!(%task, organ = name, "organ empty after refinement");
                continue;
            }
            tracing::info!(%task, organ = name, shape = ?mask.dim(), voxels, "organ mask extracted");
            found.insert_first(name, OrganMask::new(mask, Provenance::Task(task)));
            self.emit(Progress::OrganExtracted {
                task,
                organ: name.to_string(),
                voxels,
            });
        }
        Ok(Extraction::Done(found))
    }

    /// 结构派生与肺叶融合.
    fn post_process(&self, plan: &TaskPlan, masks: &mut MaskSet, spacing: Spacing) -> Vec<String> {
        let refine = &self.request.refinement;
        let requested: BTreeSet<String> = plan.requested.union(&plan.derived).cloned().collect();
        let unmet = ensure_body_related_masks(masks, &requested, refine, &spacing, &self.cancel);

        let fuse = self.request.fuse_lung_lobes
            || plan.derived.iter().any(|d| organ::lobes_of(d).is_some());
        if fuse {
            merge_lung_lobes(masks, refine, &spacing, &self.cancel);
        }
        unmet
    }
}

/// 删除仅为派生而额外请求的器官. 取消时同样执行.
fn drop_intermediates(plan: &TaskPlan, masks: &mut MaskSet) {
    for extra in plan.fallback.iter().filter(|f| !plan.requested(f)) {
        if masks.remove(extra).is_some() {
            tracing::debug!(organ = %extra, "intermediate mask removed");
        }
    }
}

/// 按轴翻转: `si` -> 轴 0, `ap` -> 轴 1, `lr` -> 轴 2.
pub fn apply_flips<T>(labels: &mut Array3<T>, flip: &FlipConfig) {
    if !flip.any() {
        return;
    }
    tracing::debug!(?flip, "flipping label axes");
    for (on, axis) in [(flip.si, 0), (flip.ap, 1), (flip.lr, 2)] {
        if on {
            labels.invert_axis(Axis(axis));
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;

    use super::*;
    use crate::provider::ScriptedProvider;

    fn source() -> VolumeSource {
        VolumeSource::Nifti("ct.nii.gz".into())
    }

    fn request(organs: &[&str]) -> SegmentationRequest {
        let mut r = SegmentationRequest::from_config(&SegConfig::default(), organs.iter().copied());
        r.flip = FlipConfig {
            lr: false,
            ap: false,
            si: false,
        };
        r.refinement = Refinement::default();
        r
    }

    /// 按 `(类别, 体素)` 写入的标签体积.
    fn labels(shape: (usize, usize, usize), marks: &[(u16, (usize, usize, usize))]) -> Array3<u16> {
        let mut a = Array3::zeros(shape);
        for (c, p) in marks {
            a[*p] = *c;
        }
        a
    }

    #[test]
    fn test_flip_axes() {
        let mut a = labels((2, 3, 4), &[(1, (0, 0, 0))]);
        apply_flips(&mut a, &FlipConfig::default());
        assert_eq!(a[(0, 2, 0)], 1);
        let mut a = labels((2, 3, 4), &[(1, (0, 0, 0))]);
        apply_flips(&mut a, &FlipConfig { lr: true, ap: false, si: true });
        assert_eq!(a[(1, 0, 3)], 1);
        let none = FlipConfig { lr: false, ap: false, si: false };
        assert!(!none.any());
        let mut a = labels((2, 3, 4), &[(1, (0, 0, 0))]);
        apply_flips(&mut a, &none);
        assert_eq!(a[(0, 0, 0)], 1);
    }

    #[test]
    fn test_failed_task_does_not_stop_run() {
        let catalog = Arc::new(TaskCatalog::bundled());
        let spleen = catalog.table(Task::Total).unwrap().class_of("spleen").unwrap();
        let provider = ScriptedProvider::new()
            .with_failure(Task::Body, "out of memory")
            .with_output(Task::Total, labels((4, 4, 4), &[(spleen, (1, 1, 1))]), Spacing::default());
        let (tx, rx) = unbounded();
        let d = Dispatcher::new(Arc::new(provider), catalog, source(), request(&["skin", "spleen"]))
            .with_cache(Arc::new(ModelCache::new()))
            .with_progress(tx);
        let report = d.run_request();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.state(Task::Total), Some(&TaskState::Complete));
        assert!(matches!(report.state(Task::Body), Some(TaskState::Failed(_))));
        assert!(report.masks.contains("spleen"));
        // 下载提示恰好开关一次.
        let events: Vec<Progress> = rx.try_iter().collect();
        let started = events.iter().filter(|e| **e == Progress::DownloadStarted).count();
        let finished = events.iter().filter(|e| **e == Progress::DownloadFinished).count();
        assert_eq!((started, finished), (1, 1));
    }

    #[test]
    fn test_disabled_task_skipped_and_mode_override() {
        let catalog = Arc::new(TaskCatalog::bundled());
        let vessels = catalog
            .table(Task::LungVessels)
            .unwrap()
            .class_of("lung_vessels")
            .unwrap();
        let provider = Arc::new(
            ScriptedProvider::new()
                .without_download()
                .with_output(Task::LungVessels, labels((3, 3, 3), &[(vessels, (0, 0, 0))]), Spacing::default()),
        );
        let mut req = request(&["liver", "lung_vessels"]);
        req.mode = Mode::Fast;
        req.tasks.insert("total".into(), false);
        let d = Dispatcher::new(provider.clone(), catalog, source(), req);
        let report = d.run_request();

        assert_eq!(report.state(Task::Total), Some(&TaskState::Skipped));
        assert_eq!(report.completed_tasks(), vec![Task::LungVessels]);
        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].mode, Mode::Accurate);
        assert_eq!(calls[0].organs, Some(vec!["lung_vessels".to_string()]));
    }

    #[test]
    fn test_cancel_before_start() {
        let catalog = Arc::new(TaskCatalog::bundled());
        let provider = Arc::new(ScriptedProvider::new());
        let token = CancellationToken::new();
        token.cancel();
        let d = Dispatcher::new(provider.clone(), catalog, source(), request(&["liver"]))
            .with_cancel(token);
        let report = d.run_request();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.state(Task::Total), Some(&TaskState::Pending));
        assert!(provider.calls().is_empty());
        assert!(report.masks.is_empty());
    }

    #[test]
    fn test_cancelled_run_drops_intermediates() {
        let catalog = Arc::new(TaskCatalog::bundled());
        let total = catalog.table(Task::Total).unwrap();
        let upper = total.class_of("lung_upper_lobe_left").unwrap();
        let liver = total.class_of("liver").unwrap();
        let token = CancellationToken::new();
        let trigger = token.clone();
        let provider = ScriptedProvider::new()
            .without_download()
            .with_output(
                Task::Total,
                labels((4, 4, 4), &[(upper, (1, 1, 1)), (liver, (2, 2, 2))]),
                Spacing::default(),
            )
            .with_hook(move |task| {
                if task == Task::Body {
                    trigger.cancel();
                }
            });
        let d = Dispatcher::new(
            Arc::new(provider),
            catalog,
            source(),
            request(&["lung_left", "liver", "skin"]),
        )
        .with_cancel(token);
        let report = d.run_request();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.state(Task::Total), Some(&TaskState::Complete));
        assert!(report.state(Task::Body).unwrap().is_terminal());
        // 肺叶只为融合而请求, 融合未执行时也不出现在结果中.
        assert_eq!(report.masks.names(), vec!["liver".to_string()]);
    }

    #[test]
    fn test_error_chain_dedup() {
        let e = crate::error::ProviderError::Launch {
            command: "seg".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(error_chain(&e), e.to_string());
    }
}
