//! 几何协调: 将推理空间的三维数组对齐到导出目标形状.
//!
//! 推理空间按 `(z, y, x)` 组织, 结构集写出器则要求 `(rows, cols, slices)`.
//! 二者之间可能差一个轴置换, 也可能因重采样而差几个体素.
//! [`Reconciler`] 按固定顺序尝试以下策略, 第一个成功的胜出:
//!
//! 1. [`Strategy::Exact`]: 形状已经一致.
//! 2. [`Strategy::ExpectedTranspose`]: 预期的轴置换 (默认 `(z, y, x) -> (y, x, z)`).
//! 3. [`Strategy::PermutationSearch`]: 六种轴置换逐一尝试.
//! 4. [`Strategy::BoundedResize`]: 不做置换, 在畸变上限内直接做最近邻重采样.
//!    缩放系数为 `to[i] / from[i]`, 按输入数组原本的轴序计算.
//!
//! 所有策略都不修改输入; 全部失败时调用方的数组原样保留.

use std::fmt;

use itertools::Itertools;
use ndarray::Array3;

use crate::consts::DEFAULT_MAX_DISTORTION;
use crate::error::ReconciliationError;
use crate::Shape3d;

mod resize;

pub use resize::{distortion, smart_resize, Label, ResizeBackend};

/// 推理空间 `(z, y, x)` 到导出空间 `(rows, cols, slices)` 的轴置换.
pub const EXPORT_PERMUTATION: [usize; 3] = [1, 2, 0];

/// 恒等置换.
pub const IDENTITY_PERMUTATION: [usize; 3] = [0, 1, 2];

/// 导出目标形状, 由 DICOM 序列提供.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReconciliationTarget {
    /// 行数.
    pub rows: usize,

    /// 列数.
    pub cols: usize,

    /// 切片数.
    pub slices: usize,
}

impl ReconciliationTarget {
    /// 创建.
    #[inline]
    pub const fn new(rows: usize, cols: usize, slices: usize) -> Self {
        Self { rows, cols, slices }
    }

    /// `(rows, cols, slices)`.
    #[inline]
    pub const fn shape(&self) -> Shape3d {
        (self.rows, self.cols, self.slices)
    }
}

impl fmt::Display for ReconciliationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.rows, self.cols, self.slices)
    }
}

/// 协调策略.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// 形状已一致.
    Exact,

    /// 预期的轴置换.
    ExpectedTranspose,

    /// 六种轴置换搜索.
    PermutationSearch,

    /// 有界重采样.
    BoundedResize,
}

impl Strategy {
    /// 全部策略, 按尝试顺序排列.
    pub const ORDER: [Strategy; 4] = [
        Strategy::Exact,
        Strategy::ExpectedTranspose,
        Strategy::PermutationSearch,
        Strategy::BoundedResize,
    ];

    /// 名称.
    pub const fn name(&self) -> &'static str {
        match self {
            Strategy::Exact => "exact",
            Strategy::ExpectedTranspose => "expected_transpose",
            Strategy::PermutationSearch => "permutation_search",
            Strategy::BoundedResize => "bounded_resize",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 按轴置换后的形状.
#[inline]
fn permuted_shape((a, b, c): Shape3d, p: [usize; 3]) -> Shape3d {
    let s = [a, b, c];
    (s[p[0]], s[p[1]], s[p[2]])
}

/// 轴置换并整理为标准内存布局.
#[inline]
fn permute<T: Label>(data: &Array3<T>, p: [usize; 3]) -> Array3<T> {
    data.view()
        .permuted_axes(p)
        .as_standard_layout()
        .into_owned()
}

/// 几何协调器.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Reconciler {
    max_distortion: f64,
    expected: [usize; 3],
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DISTORTION)
    }
}

impl Reconciler {
    /// 面向结构集导出的协调器, 畸变上限为 `max_distortion`.
    #[inline]
    pub const fn new(max_distortion: f64) -> Self {
        Self {
            max_distortion,
            expected: EXPORT_PERMUTATION,
        }
    }

    /// 目标与源处于同一轴序时使用 (如推理输出对齐到手动体积).
    #[inline]
    pub const fn same_space(max_distortion: f64) -> Self {
        Self {
            max_distortion,
            expected: IDENTITY_PERMUTATION,
        }
    }

    /// 畸变上限.
    #[inline]
    pub const fn max_distortion(&self) -> f64 {
        self.max_distortion
    }

    /// 尝试单个策略. 失败时返回原因, 不修改输入.
    pub fn attempt<T: Label>(
        &self,
        strategy: Strategy,
        data: &Array3<T>,
        to: Shape3d,
    ) -> Result<Array3<T>, ReconciliationError> {
        let from = data.dim();
        let inapplicable = |reason: String| ReconciliationError::Inapplicable {
            strategy: strategy.name(),
            reason,
        };
        match strategy {
            Strategy::Exact if from == to => Ok(data.clone()),
            Strategy::Exact => Err(inapplicable(format!("{from:?} != {to:?}"))),

            Strategy::ExpectedTranspose => {
                let s = permuted_shape(from, self.expected);
                if s == to {
                    Ok(permute(data, self.expected))
                } else {
                    Err(inapplicable(format!("{from:?} permuted is {s:?}")))
                }
            }

            Strategy::PermutationSearch => (0..3)
                .permutations(3)
                .map(|p| [p[0], p[1], p[2]])
                .find(|p| permuted_shape(from, *p) == to)
                .map(|p| {
                    tracing::debug!(?p, "axis permutation found");
                    permute(data, p)
                })
                .ok_or_else(|| inapplicable(format!("no axis permutation of {from:?}"))),

            Strategy::BoundedResize => smart_resize(data, to, self.max_distortion).map(|(out, _)| out),
        }
    }

    /// 按顺序尝试所有策略.
    ///
    /// 重采样被拒绝 (畸变过大或形状退化) 时返回该具体错误;
    /// 其它情况下返回 [`ReconciliationError::Exhausted`], 内含每个策略的原因.
    pub fn reconcile<T: Label>(
        &self,
        data: &Array3<T>,
        to: Shape3d,
    ) -> Result<(Array3<T>, Strategy), ReconciliationError> {
        let mut reasons = vec![];
        for strategy in Strategy::ORDER {
            match self.attempt(strategy, data, to) {
                Ok(out) => {
                    tracing::debug!(%strategy, from = ?data.dim(), ?to, "shape reconciled");
                    return Ok((out, strategy));
                }
                Err(
                    e @ (ReconciliationError::ExcessiveDistortion { .. }
                    | ReconciliationError::Degenerate(_)),
                ) => return Err(e),
                Err(e) => reasons.push(e.to_string()),
            }
        }
        Err(ReconciliationError::Exhausted {
            from: data.dim(),
            to,
            reasons,
        })
    }
}
