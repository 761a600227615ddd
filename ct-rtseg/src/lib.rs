#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 面向 CT 扫描的多任务器官分割编排, 以及分割结果到结构集 (RTSTRUCT) 网格的协调.
//!
//! 实际的神经网络推理由外部推理服务 ([`provider::InferenceProvider`]) 完成,
//! 结构集文件的写出由 [`export::StructureSetWriter`] 完成. 本 crate 负责二者之间的所有逻辑.
//!
//! # 流程
//!
//! 1. [`catalog`]: 构建任务目录 (每个任务能输出哪些器官及其类别索引) 与器官索引.
//! 2. [`planner`]: 给定请求的器官集合, 计算需要运行哪些任务, 以及每个任务请求哪些器官.
//! 3. [`dispatch`]: 依次调度任务, 处理取消, 进度, 任务级失败隔离;
//!   提取每个器官的二值掩码并按 "先写入者胜出" 合并进 [`masks::MaskSet`].
//! 4. [`post`] / [`morph`]: 掩码清理 (填洞, 最大连通域), 平滑,
//!   派生 body / skin, 融合肺叶.
//! 5. [`reconcile`]: 将推理空间的三维掩码对齐到导出目标形状 `(rows, cols, slices)`.
//! 6. [`export`]: 生成 DICOM 安全名称与显示颜色, 交给结构集写出器.
//!
//! 整个请求由 [`worker::SegmentationWorker`] 在独立线程上执行,
//! 控制线程可观察进度并随时请求取消.
//!
//! # 注意
//!
//! 1. 推理空间的数组一律按 `(z, y, x)` 组织, 即 `(slices, rows, cols)`.
//! 2. 取消是协作式的: 正在进行中的推理调用无法被打断,
//!   取消只在下一个检查点生效.
//! 3. 任何单个任务或单个器官的失败都只会被记录, 不会中止整个运行.

/// 三维索引, 按 `(z, y, x)` 组织.
pub type Idx3d = (usize, usize, usize);

/// 三维形状. 语义依上下文而定, 推理空间为 `(z, y, x)`,
/// 导出目标为 `(rows, cols, slices)`.
pub type Shape3d = (usize, usize, usize);

pub mod catalog;
pub mod config;
pub mod consts;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod masks;
pub mod morph;
pub mod planner;
pub mod post;
pub mod prelude;
pub mod provider;
pub mod reconcile;
pub mod volume;
pub mod worker;

pub use catalog::{OrganIndex, Task, TaskCatalog, TaskLabelTable};
pub use config::SegConfig;
pub use dispatch::{Dispatcher, FrozenReport, Progress, RunReport, RunStatus, SegmentationRequest, TaskState};
pub use masks::{FrozenMaskSet, MaskSet, OrganMask, Provenance};
pub use planner::{compute_required_tasks, get_optimal_task_for_organ, plan_for_task, TaskAssignment, TaskPlan};
pub use provider::{Device, InferenceProvider, Mode, ProviderOutput, Spacing, VolumeSource};
pub use reconcile::{ReconciliationTarget, Reconciler};
pub use worker::{SegmentationWorker, WorkerHandle};
