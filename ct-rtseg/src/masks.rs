//! 器官掩码与掩码集合.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::Array3;

use crate::catalog::Task;
use crate::Shape3d;

/// 掩码来源.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Provenance {
    /// 由某个推理任务直接输出.
    Task(Task),

    /// 由其它掩码派生 (body, skin).
    Derived,

    /// 由多个掩码融合 (左右肺).
    Fused,
}

/// 单个器官的三维二值掩码, 按 `(z, y, x)` 组织.
#[derive(Clone, Debug)]
pub struct OrganMask {
    /// 掩码数据.
    pub data: Array3<bool>,

    /// 来源.
    pub provenance: Provenance,
}

impl OrganMask {
    /// 创建掩码.
    #[inline]
    pub fn new(data: Array3<bool>, provenance: Provenance) -> Self {
        Self { data, provenance }
    }

    /// 前景体素个数.
    #[inline]
    pub fn voxels(&self) -> usize {
        self.data.iter().filter(|&&p| p).count()
    }

    /// 形状.
    #[inline]
    pub fn shape(&self) -> Shape3d {
        self.data.dim()
    }

    /// 是否不含任何前景体素.
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|&p| p)
    }
}

/// 运行期间的掩码集合: 器官名 -> 掩码.
///
/// 同一器官只保留第一次成功写入的掩码. 运行期间只有 worker 线程持有它,
/// 运行结束后通过 [`MaskSet::freeze`] 冻结为只读快照.
#[derive(Clone, Debug, Default)]
pub struct MaskSet {
    masks: BTreeMap<String, OrganMask>,
}

impl MaskSet {
    /// 空集合.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 先写入者胜出. 若 `organ` 已存在, 丢弃 `mask` 并返回 `false`.
    pub fn insert_first(&mut self, organ: &str, mask: OrganMask) -> bool {
        if self.masks.contains_key(organ) {
            tracing::debug!(organ, "mask already present, keeping first writer");
            return false;
        }
        self.masks.insert(organ.to_string(), mask);
        true
    }

    /// 替换 (或插入) 掩码. 仅供后处理阶段对已有掩码的重写使用.
    #[inline]
    pub fn replace(&mut self, organ: &str, mask: OrganMask) -> Option<OrganMask> {
        self.masks.insert(organ.to_string(), mask)
    }

    /// 将 `other` 中的掩码按先写入者胜出的规则合并进来. 返回实际新增的个数.
    pub fn merge_from(&mut self, other: MaskSet) -> usize {
        let mut added = 0;
        for (name, mask) in other.masks {
            match self.masks.entry(name) {
                Entry::Vacant(e) => {
                    e.insert(mask);
                    added += 1;
                }
                Entry::Occupied(e) => {
                    tracing::debug!(organ = %e.key(), "mask already present, keeping first writer");
                }
            }
        }
        added
    }

    /// 删除器官.
    #[inline]
    pub fn remove(&mut self, organ: &str) -> Option<OrganMask> {
        self.masks.remove(organ)
    }

    /// 获取器官掩码.
    #[inline]
    pub fn get(&self, organ: &str) -> Option<&OrganMask> {
        self.masks.get(organ)
    }

    /// 是否包含器官.
    #[inline]
    pub fn contains(&self, organ: &str) -> bool {
        self.masks.contains_key(organ)
    }

    /// 器官个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// 按器官名升序迭代.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OrganMask)> + '_ {
        self.masks.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// 按器官名升序列出所有器官.
    #[inline]
    pub fn names(&self) -> Vec<String> {
        self.masks.keys().cloned().collect()
    }

    /// 冻结为只读快照.
    #[inline]
    pub fn freeze(self) -> FrozenMaskSet {
        FrozenMaskSet {
            inner: Arc::new(self),
        }
    }
}

/// 只读的掩码集合, 可在线程间廉价共享.
#[derive(Clone, Debug, Default)]
pub struct FrozenMaskSet {
    inner: Arc<MaskSet>,
}

impl FrozenMaskSet {
    /// 获取器官掩码.
    #[inline]
    pub fn get(&self, organ: &str) -> Option<&OrganMask> {
        self.inner.get(organ)
    }

    /// 器官个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 按器官名升序迭代.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OrganMask)> + '_ {
        self.inner.iter()
    }

    /// 按器官名升序列出所有器官.
    #[inline]
    pub fn names(&self) -> Vec<String> {
        self.inner.names()
    }
}
