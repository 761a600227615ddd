//! 常用类型一览.
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Shape3d};

pub use crate::catalog::{OrganIndex, Task, TaskCatalog, TaskLabelTable};
pub use crate::config::SegConfig;
pub use crate::consts::organ;

pub use crate::planner::{compute_required_tasks, get_optimal_task_for_organ, plan_for_task};
pub use crate::planner::{OrganSubset, TaskAssignment, TaskPlan};

pub use crate::provider::{CommandProvider, CommandProviderConfig, ScriptedProvider};
pub use crate::provider::{Device, InferenceProvider, Mode, ProviderOutput, Spacing, VolumeSource};

pub use crate::dispatch::{Dispatcher, FrozenReport, Progress, RunReport, RunStatus};
pub use crate::dispatch::{SegmentationRequest, TaskState};
pub use crate::worker::{SegmentationWorker, WorkerHandle};

pub use crate::masks::{FrozenMaskSet, MaskSet, OrganMask, Provenance};
pub use crate::morph::{Connectivity, Refinement, SmoothMethod, SmoothOptions};
pub use crate::post::{ensure_body_related_masks, merge_lung_lobes};

pub use crate::reconcile::{ReconciliationTarget, Reconciler, Strategy};
pub use crate::volume::{ManualVolume, SliceRecord};

pub use crate::export::{prepare_export, ExportOptions, ExportSet};
pub use crate::export::{NpzStructureWriter, StructureSetWriter};
