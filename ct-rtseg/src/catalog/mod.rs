//! 任务目录与器官索引.
//!
//! 任务目录 ([`TaskCatalog`]) 描述每个推理任务能输出哪些器官,
//! 以及每个器官在该任务输出体积中的类别索引. 器官索引 ([`OrganIndex`])
//! 是它的反向映射, 在启动时构建一次, 之后只读.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::CatalogError;

mod bundled;

/// 推理任务. 枚举的声明顺序即调度顺序.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Task {
    /// 通用任务, 覆盖绝大多数常见器官.
    Total,

    /// 全身轮廓: 躯干, 四肢, 皮肤.
    Body,

    /// 肺血管与气管支气管.
    LungVessels,

    /// 高分辨率心腔.
    HeartChambersHighres,

    /// 头部腺体与腔道.
    HeadGlandsCavities,

    /// 四肢骨.
    AppendicularBones,

    /// 组织类型 (脂肪, 肌肉).
    TissueTypes,

    /// 伪任务 "全部". 从不被直接调度, 请求它等价于请求覆盖所需的所有真实任务.
    Everything,
}

impl Task {
    /// 所有真实任务, 按调度顺序排列.
    pub const REAL: [Task; 7] = [
        Task::Total,
        Task::Body,
        Task::LungVessels,
        Task::HeartChambersHighres,
        Task::HeadGlandsCavities,
        Task::AppendicularBones,
        Task::TissueTypes,
    ];

    /// 通用任务.
    pub const GENERIC: Task = Task::Total;

    /// 专用任务优先级. 当通用任务不含某器官时, 按此顺序挑选.
    pub const SPECIALIZED_PRIORITY: [Task; 6] = [
        Task::Body,
        Task::LungVessels,
        Task::HeartChambersHighres,
        Task::HeadGlandsCavities,
        Task::AppendicularBones,
        Task::TissueTypes,
    ];

    /// 推理服务识别的任务标识.
    pub const fn id(&self) -> &'static str {
        match self {
            Task::Total => "total",
            Task::Body => "body",
            Task::LungVessels => "lung_vessels",
            Task::HeartChambersHighres => "heartchambers_highres",
            Task::HeadGlandsCavities => "head_glands_cavities",
            Task::AppendicularBones => "appendicular_bones",
            Task::TissueTypes => "tissue_types",
            Task::Everything => "total_all",
        }
    }

    /// 是否为伪任务.
    #[inline]
    pub const fn is_pseudo(&self) -> bool {
        matches!(self, Task::Everything)
    }

    /// 该任务在加速 (fast) 模式下结果不可靠, 必须以精确模式运行.
    #[inline]
    pub const fn requires_accurate_mode(&self) -> bool {
        matches!(
            self,
            Task::LungVessels
                | Task::HeartChambersHighres
                | Task::HeadGlandsCavities
                | Task::AppendicularBones
                | Task::TissueTypes
        )
    }

    /// 随应用发布的后备标签表. 伪任务返回空表.
    pub fn bundled_table(&self) -> &'static [(&'static str, u16)] {
        match self {
            Task::Total => bundled::TOTAL,
            Task::Body => bundled::BODY,
            Task::LungVessels => bundled::LUNG_VESSELS,
            Task::HeartChambersHighres => bundled::HEART_CHAMBERS_HIGHRES,
            Task::HeadGlandsCavities => bundled::HEAD_GLANDS_CAVITIES,
            Task::AppendicularBones => bundled::APPENDICULAR_BONES,
            Task::TissueTypes => bundled::TISSUE_TYPES,
            Task::Everything => &[],
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// 未知任务标识.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown task `{0}`")]
pub struct UnknownTask(pub String);

impl FromStr for Task {
    type Err = UnknownTask;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Task::REAL
            .into_iter()
            .chain([Task::Everything])
            .find(|t| t.id() == s)
            .ok_or_else(|| UnknownTask(s.to_string()))
    }
}

/// 单个任务的标签表: 器官名 -> 类别索引.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskLabelTable {
    labels: BTreeMap<String, u16>,
}

impl TaskLabelTable {
    /// 从 `(器官名, 类别索引)` 序列创建.
    pub fn from_pairs<'a, I: IntoIterator<Item = (&'a str, u16)>>(it: I) -> Self {
        Self {
            labels: it.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    /// 获取器官的类别索引.
    #[inline]
    pub fn class_of(&self, organ: &str) -> Option<u16> {
        self.labels.get(organ).copied()
    }

    /// 是否包含该器官.
    #[inline]
    pub fn contains(&self, organ: &str) -> bool {
        self.labels.contains_key(organ)
    }

    /// 器官个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// 是否为空表.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// 按器官名升序迭代 `(器官名, 类别索引)`.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&str, u16)> + '_ {
        self.labels.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// 推理服务元数据中单个任务的表. 两种写法都接受:
/// `{"spleen": 1}` 或 `{"1": "spleen"}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTable {
    ByName(BTreeMap<String, u16>),
    ByIndex(BTreeMap<String, String>),
}

impl From<RawTable> for TaskLabelTable {
    fn from(raw: RawTable) -> Self {
        let labels = match raw {
            RawTable::ByName(m) => m,
            // untagged 枚举无法直接把字符串键解析成整数, 这里手动解析.
            RawTable::ByIndex(m) => m
                .into_iter()
                .filter_map(|(k, v)| match k.parse::<u16>() {
                    Ok(idx) => Some((v, idx)),
                    Err(_) => {
                        tracing::warn!(key = %k, organ = %v, "non-numeric class index in metadata");
                        None
                    }
                })
                .collect(),
        };
        Self { labels }
    }
}

/// 标签表的来源.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TableSource {
    /// 来自推理服务自身的元数据.
    Provider,

    /// 来自随应用发布的后备表.
    Bundled,
}

/// 任务目录: 每个真实任务一张标签表. 构建后只读.
#[derive(Clone, Debug, Default)]
pub struct TaskCatalog {
    tables: BTreeMap<Task, TaskLabelTable>,
    sources: BTreeMap<Task, TableSource>,
}

impl TaskCatalog {
    /// 完全由后备表构成的目录.
    pub fn bundled() -> Self {
        let mut ans = Self::default();
        for task in Task::REAL {
            ans.insert(task, TaskLabelTable::from_pairs(task.bundled_table().iter().copied()));
            ans.sources.insert(task, TableSource::Bundled);
        }
        ans
    }

    /// 从推理服务元数据 JSON 解析目录. 结构为 `{task_id: {organ: index}}`.
    ///
    /// 未知的任务标识和伪任务会被忽略. 若没有任何可识别的任务, 返回 `Err`.
    pub fn from_metadata_json(json: &str) -> Result<Self, CatalogError> {
        let raw: BTreeMap<String, RawTable> = serde_json::from_str(json)?;
        let mut ans = Self::default();
        for (id, table) in raw {
            match id.parse::<Task>() {
                Ok(task) if !task.is_pseudo() => {
                    ans.insert(task, table.into());
                    ans.sources.insert(task, TableSource::Provider);
                }
                Ok(_) => tracing::debug!(task = %id, "ignoring pseudo-task in provider metadata"),
                Err(e) => tracing::debug!(error = %e, "ignoring task in provider metadata"),
            }
        }
        if ans.tables.is_empty() {
            return Err(CatalogError::NoKnownTask);
        }
        Ok(ans)
    }

    /// 构建最终目录: 优先使用推理服务元数据, 缺失的任务由后备表补齐.
    ///
    /// 元数据不可用或无法解析时完全回退到后备表. 两个来源是否一致不做校验,
    /// 仅在日志中报告差异.
    pub fn resolve(metadata: Option<&str>) -> Self {
        let bundled = Self::bundled();
        let Some(json) = metadata else {
            tracing::info!("provider metadata unavailable, using bundled label tables");
            return bundled;
        };
        let mut ans = match Self::from_metadata_json(json) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "provider metadata unusable, using bundled label tables");
                return bundled;
            }
        };
        for drift in ans.drift_from(&bundled) {
            tracing::warn!(%drift, "provider label table differs from bundled table");
        }
        for task in Task::REAL {
            if !ans.tables.contains_key(&task) {
                tracing::info!(%task, "task missing from provider metadata, using bundled table");
                ans.insert(task, TaskLabelTable::from_pairs(task.bundled_table().iter().copied()));
                ans.sources.insert(task, TableSource::Bundled);
            }
        }
        ans
    }

    /// 插入或替换一个任务的标签表. 伪任务会被忽略.
    pub fn insert(&mut self, task: Task, table: TaskLabelTable) {
        if task.is_pseudo() {
            return;
        }
        self.tables.insert(task, table);
    }

    /// 获取任务的标签表.
    #[inline]
    pub fn table(&self, task: Task) -> Option<&TaskLabelTable> {
        self.tables.get(&task)
    }

    /// 该任务标签表的来源.
    #[inline]
    pub fn source(&self, task: Task) -> Option<TableSource> {
        self.sources.get(&task).copied()
    }

    /// 按调度顺序迭代 `(任务, 标签表)`.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (Task, &TaskLabelTable)> + '_ {
        self.tables.iter().map(|(t, l)| (*t, l))
    }

    /// 列出 `self` 与 `other` 中同名任务的标签差异, 仅用于诊断.
    pub fn drift_from(&self, other: &TaskCatalog) -> Vec<String> {
        let mut ans = vec![];
        for (task, mine) in self.iter() {
            let Some(theirs) = other.table(task) else {
                continue;
            };
            for (organ, idx) in mine.iter() {
                match theirs.class_of(organ) {
                    Some(j) if j == idx => {}
                    Some(j) => ans.push(format!("{task}: `{organ}` is {idx}, bundled has {j}")),
                    None => ans.push(format!("{task}: `{organ}` is not in bundled table")),
                }
            }
            for (organ, _) in theirs.iter().filter(|(o, _)| !mine.contains(o)) {
                ans.push(format!("{task}: bundled `{organ}` is missing"));
            }
        }
        ans
    }
}

/// 器官索引: 器官名 -> 能输出它的任务列表 (按调度顺序).
#[derive(Clone, Debug, Default)]
pub struct OrganIndex {
    index: BTreeMap<String, Vec<Task>>,
}

impl OrganIndex {
    /// 从任务目录构建. 伪任务不参与.
    pub fn build(catalog: &TaskCatalog) -> Self {
        let mut index: BTreeMap<String, Vec<Task>> = BTreeMap::new();
        for (task, table) in catalog.iter().filter(|(t, _)| !t.is_pseudo()) {
            for (organ, _) in table.iter() {
                index.entry(organ.to_string()).or_default().push(task);
            }
        }
        Self { index }
    }

    /// 能输出 `organ` 的候选任务. 未知器官返回空切片.
    #[inline]
    pub fn candidates(&self, organ: &str) -> &[Task] {
        self.index.get(organ).map_or(&[], Vec::as_slice)
    }

    /// 已知器官个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// 按名称升序迭代所有已知器官.
    #[inline]
    pub fn organs(&self) -> impl Iterator<Item = &str> + '_ {
        self.index.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_round_trip() {
        for task in Task::REAL.into_iter().chain([Task::Everything]) {
            assert_eq!(task.id().parse::<Task>().unwrap(), task);
        }
        let err = "nope".parse::<Task>().unwrap_err();
        assert_eq!(err, UnknownTask("nope".into()));
        assert_eq!(err.to_string(), "unknown task `nope`");
        let _: &dyn std::error::Error = &err;
    }

    #[test]
    fn test_bundled_total_consistent() {
        let c = TaskCatalog::bundled();
        let total = c.table(Task::Total).unwrap();
        assert_eq!(total.len(), 117);
        assert_eq!(total.class_of("liver"), Some(5));
        assert_eq!(total.class_of("costal_cartilages"), Some(117));
        assert!(c.table(Task::Everything).is_none());
    }

    #[test]
    fn test_organ_index_candidates() {
        let c = TaskCatalog::bundled();
        let idx = OrganIndex::build(&c);
        // aorta 同时出现在通用任务和心腔任务中, 且按调度顺序排列.
        assert_eq!(idx.candidates("aorta"), &[Task::Total, Task::HeartChambersHighres]);
        assert_eq!(idx.candidates("skin"), &[Task::Body]);
        assert!(idx.candidates("unicorn_horn").is_empty());
    }

    #[test]
    fn test_metadata_both_layouts() {
        let json = r#"{
            "total": {"spleen": 1, "liver": 5},
            "body": {"1": "body_trunc", "2": "body_extremities"},
            "total_all": {"spleen": 1},
            "future_task": {"x": 1}
        }"#;
        let c = TaskCatalog::from_metadata_json(json).unwrap();
        assert_eq!(c.table(Task::Total).unwrap().class_of("liver"), Some(5));
        assert_eq!(c.table(Task::Body).unwrap().class_of("body_extremities"), Some(2));
        assert!(c.table(Task::Everything).is_none());
        assert_eq!(c.source(Task::Total), Some(TableSource::Provider));
    }

    #[test]
    fn test_resolve_prefers_provider_and_fills_gaps() {
        let json = r#"{"total": {"spleen": 7}}"#;
        let c = TaskCatalog::resolve(Some(json));
        assert_eq!(c.table(Task::Total).unwrap().class_of("spleen"), Some(7));
        assert_eq!(c.table(Task::Total).unwrap().len(), 1);
        assert_eq!(c.source(Task::Total), Some(TableSource::Provider));
        assert_eq!(c.source(Task::Body), Some(TableSource::Bundled));

        let c = TaskCatalog::resolve(Some("not json"));
        assert_eq!(c.table(Task::Total).unwrap().len(), 117);
        let c = TaskCatalog::resolve(None);
        assert_eq!(c.source(Task::Total), Some(TableSource::Bundled));
    }

    #[test]
    fn test_drift_reported() {
        let c = TaskCatalog::from_metadata_json(r#"{"lung_vessels": {"lung_vessels": 2}}"#).unwrap();
        let drift = c.drift_from(&TaskCatalog::bundled());
        assert_eq!(drift.len(), 2);
        assert!(drift.iter().any(|d| d.contains("lung_trachea_bronchia")));
    }
}
