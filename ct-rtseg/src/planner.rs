//! 任务规划.
//!
//! 给定请求的器官集合, 计算需要运行哪些任务, 以及每个任务请求哪些器官.
//! 规划是纯函数: 相同输入总得到相同输出, 不做任何 I/O (日志除外).

use std::collections::{BTreeMap, BTreeSet};

use crate::catalog::{OrganIndex, Task, TaskCatalog};
use crate::consts::organ;
use crate::error::PlanningError;

/// 一个任务请求的器官范围.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrganSubset {
    /// 请求该任务支持的全部器官.
    All,

    /// 仅请求这些器官. 保证非空.
    Only(BTreeSet<String>),
}

impl OrganSubset {
    /// 转换为推理服务接受的器官列表. `All` 返回 `None`.
    pub fn to_request(&self) -> Option<Vec<String>> {
        match self {
            OrganSubset::All => None,
            OrganSubset::Only(s) => Some(s.iter().cloned().collect()),
        }
    }

    /// 是否请求了 `organ`.
    #[inline]
    pub fn wants(&self, organ: &str) -> bool {
        match self {
            OrganSubset::All => true,
            OrganSubset::Only(s) => s.contains(organ),
        }
    }
}

/// 任务分配: 任务 -> 器官范围. 按调度顺序迭代.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskAssignment {
    entries: BTreeMap<Task, OrganSubset>,
}

impl TaskAssignment {
    /// 把 `organ` 加入 `task` 的请求. 若该任务已是 `All` 则无操作.
    pub fn add(&mut self, task: Task, organ: &str) {
        debug_assert!(!task.is_pseudo());
        match self
            .entries
            .entry(task)
            .or_insert_with(|| OrganSubset::Only(BTreeSet::new()))
        {
            OrganSubset::All => {}
            OrganSubset::Only(s) => {
                s.insert(organ.to_string());
            }
        }
    }

    /// 请求 `task` 的全部器官.
    pub fn add_whole(&mut self, task: Task) {
        debug_assert!(!task.is_pseudo());
        self.entries.insert(task, OrganSubset::All);
    }

    /// 获取任务的器官范围.
    #[inline]
    pub fn get(&self, task: Task) -> Option<&OrganSubset> {
        self.entries.get(&task)
    }

    /// 按调度顺序迭代.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (Task, &OrganSubset)> + '_ {
        self.entries.iter().map(|(t, s)| (*t, s))
    }

    /// 按调度顺序列出任务.
    #[inline]
    pub fn tasks(&self) -> Vec<Task> {
        self.entries.keys().copied().collect()
    }

    /// 任务个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否没有任何任务.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 所有被明确请求的 `(任务, 器官)` 对.
    pub fn pairs(&self) -> impl Iterator<Item = (Task, &str)> + '_ {
        self.entries.iter().flat_map(|(t, s)| match s {
            OrganSubset::All => Vec::new(),
            OrganSubset::Only(o) => o.iter().map(|n| (*t, n.as_str())).collect(),
        })
    }
}

/// 规划结果.
#[derive(Clone, Debug, Default)]
pub struct TaskPlan {
    /// 任务分配.
    pub assignment: TaskAssignment,

    /// 无法满足的器官.
    pub unmet: Vec<PlanningError>,

    /// 需要由后处理派生的结构 (不由任何任务直接输出).
    pub derived: BTreeSet<String>,

    /// 为派生结构额外请求的器官. 它们不在原请求中.
    pub fallback: BTreeSet<String>,

    /// 原始请求的器官集合.
    pub requested: BTreeSet<String>,
}

impl TaskPlan {
    /// 不指定器官时的规划: 运行通用任务的全部类别.
    pub fn whole(task: Task) -> Self {
        let mut ans = Self::default();
        ans.assignment.add_whole(task);
        ans
    }

    /// 请求中是否包含 body 家族的名称.
    #[inline]
    pub fn wants_body_family(&self) -> bool {
        self.requested.iter().any(|o| organ::is_body_family(o))
    }

    /// 请求中是否明确要求了 `organ`.
    #[inline]
    pub fn requested(&self, organ: &str) -> bool {
        self.requested.contains(organ)
    }
}

/// 为器官挑选最合适的任务.
///
/// 候选任务中包含通用任务时选通用任务; 否则按专用任务优先级选第一个命中的;
/// 再否则选第一个候选. 没有候选时返回 [`PlanningError::Unmapped`].
pub fn get_optimal_task_for_organ(organ: &str, index: &OrganIndex) -> Result<Task, PlanningError> {
    let candidates = index.candidates(organ);
    if candidates.contains(&Task::GENERIC) {
        return Ok(Task::GENERIC);
    }
    Task::SPECIALIZED_PRIORITY
        .into_iter()
        .find(|t| candidates.contains(t))
        .or_else(|| candidates.first().copied())
        .ok_or_else(|| PlanningError::Unmapped(organ.to_string()))
}

/// 计算满足 `selected` 所需的任务分配.
///
/// 1. `selected` 为空时运行通用任务的全部类别.
/// 2. `body` 是派生结构, 不分配给任何任务; 为保证有掩码可供合并,
///   会额外从 body 任务请求躯干和四肢.
/// 3. 目录中没有的 `lung_left` / `lung_right` 由对应肺叶融合得到, 肺叶作为额外请求加入;
/// 4. 无法映射的器官记录在 [`TaskPlan::unmet`] 中并以 `warn` 级别输出日志,
///   不会为其添加任何任务.
pub fn compute_required_tasks<S: AsRef<str>>(
    selected: &[S],
    index: &OrganIndex,
    catalog: &TaskCatalog,
) -> TaskPlan {
    if selected.is_empty() {
        tracing::info!(task = %Task::GENERIC, "no organ selected, running the generic task in full");
        return TaskPlan::whole(Task::GENERIC);
    }

    let mut plan = TaskPlan {
        requested: selected.iter().map(|s| s.as_ref().to_string()).collect(),
        ..Default::default()
    };
    let requested = plan.requested.clone();

    for name in requested.iter() {
        if name == organ::BODY {
            plan.derived.insert(name.clone());
            continue;
        }
        if let Some(lobes) = organ::lobes_of(name).filter(|_| index.candidates(name).is_empty()) {
            plan.derived.insert(name.clone());
            for lobe in lobes.iter().filter(|l| !requested.contains(**l)) {
                match assign_one(lobe, index, catalog) {
                    Ok(task) => {
                        plan.assignment.add(task, lobe);
                        plan.fallback.insert(lobe.to_string());
                    }
                    Err(e) => tracing::debug!(organ = lobe, error = %e, "lung lobe unavailable"),
                }
            }
            continue;
        }
        match assign_one(name, index, catalog) {
            Ok(task) => plan.assignment.add(task, name),
            Err(e) => {
                tracing::warn!(organ = %name, error = %e, "organ cannot be planned");
                plan.unmet.push(e);
            }
        }
    }

    if plan.derived.contains(organ::BODY) {
        for part in [organ::BODY_TRUNC, organ::BODY_EXTREMITIES] {
            if requested.contains(part) {
                continue;
            }
            match assign_one(part, index, catalog) {
                Ok(task) => {
                    plan.assignment.add(task, part);
                    plan.fallback.insert(part.to_string());
                }
                Err(e) => tracing::debug!(organ = part, error = %e, "body fallback unavailable"),
            }
        }
    }

    tracing::debug!(
        tasks = ?plan.assignment.tasks(),
        unmet = plan.unmet.len(),
        derived = ?plan.derived,
        "task plan computed"
    );
    plan
}

/// 选择任务并确认该任务的标签表确实包含此器官.
fn assign_one(name: &str, index: &OrganIndex, catalog: &TaskCatalog) -> Result<Task, PlanningError> {
    let task = get_optimal_task_for_organ(name, index)?;
    match catalog.table(task) {
        Some(t) if t.contains(name) => Ok(task),
        _ => Err(PlanningError::NotInTable {
            organ: name.to_string(),
            task,
        }),
    }
}

/// 按用户指定的任务规划.
///
/// 伪任务 [`Task::Everything`] 展开为覆盖 `selected` 所需的全部真实任务;
/// `selected` 为空时展开为每个真实任务的全部类别.
/// 真实任务只接收它能输出的器官, 其余器官记为 [`PlanningError::NotCoveredByTask`].
pub fn plan_for_task<S: AsRef<str>>(
    task: Task,
    selected: &[S],
    index: &OrganIndex,
    catalog: &TaskCatalog,
) -> TaskPlan {
    if task.is_pseudo() {
        if selected.is_empty() {
            let mut plan = TaskPlan::default();
            catalog.iter().for_each(|(t, _)| plan.assignment.add_whole(t));
            return plan;
        }
        return compute_required_tasks(selected, index, catalog);
    }

    if selected.is_empty() {
        return TaskPlan::whole(task);
    }
    let mut plan = TaskPlan {
        requested: selected.iter().map(|s| s.as_ref().to_string()).collect(),
        ..Default::default()
    };
    let table = catalog.table(task);
    for name in plan.requested.clone() {
        if table.is_some_and(|t| t.contains(&name)) {
            plan.assignment.add(task, &name);
        } else if name == organ::BODY {
            plan.derived.insert(name);
        } else {
            let e = PlanningError::NotCoveredByTask { organ: name, task };
            tracing::warn!(error = %e, "organ dropped from request");
            plan.unmet.push(e);
        }
    }
    plan
}
