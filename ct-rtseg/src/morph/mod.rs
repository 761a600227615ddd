//! 3D 二值形态学操作.
//!
//! 所有数组按 `(z, y, x)` 组织. 越界的邻居一律视为背景:
//! 膨胀时忽略越界邻居, 腐蚀时越界邻居会使表面体素被腐蚀.

use ndarray::{s, Array3};

use crate::provider::Spacing;
use crate::Idx3d;

mod components;
mod smooth;

pub use components::{clean_mask, fill_holes, label_components, largest_component};
pub use smooth::{gaussian_smooth, morph_smooth, smooth_mask, SmoothMethod, SmoothOptions};

/// 三维偏移量.
type Offset3d = (isize, isize, isize);

/// 面邻接的 6 个偏移.
const FACE6: [Offset3d; 6] = [
    (-1, 0, 0),
    (1, 0, 0),
    (0, -1, 0),
    (0, 1, 0),
    (0, 0, -1),
    (0, 0, 1),
];

/// 3x3x3 立方体内除中心外的 26 个偏移.
const FULL26: [Offset3d; 26] = full26();

const fn full26() -> [Offset3d; 26] {
    let mut ans = [(0, 0, 0); 26];
    let mut i = 0;
    let mut dz = -1;
    while dz <= 1 {
        let mut dy = -1;
        while dy <= 1 {
            let mut dx = -1;
            while dx <= 1 {
                if !(dz == 0 && dy == 0 && dx == 0) {
                    ans[i] = (dz, dy, dx);
                    i += 1;
                }
                dx += 1;
            }
            dy += 1;
        }
        dz += 1;
    }
    ans
}

/// 结构元素的连通方式.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Connectivity {
    /// 仅面相邻 (十字形结构元素).
    #[default]
    Face6,

    /// 面, 边, 顶点相邻 (3x3x3 立方体).
    Full26,
}

impl Connectivity {
    /// 邻居偏移表.
    #[inline]
    pub(crate) fn offsets(&self) -> &'static [Offset3d] {
        match self {
            Connectivity::Face6 => &FACE6,
            Connectivity::Full26 => &FULL26,
        }
    }
}

/// 计算 `pos + d`. 越界时返回 `None`.
#[inline]
pub(crate) fn shift((z, y, x): Idx3d, (dz, dy, dx): Offset3d, shape: Idx3d) -> Option<Idx3d> {
    let z = z.checked_add_signed(dz).filter(|v| *v < shape.0)?;
    let y = y.checked_add_signed(dy).filter(|v| *v < shape.1)?;
    let x = x.checked_add_signed(dx).filter(|v| *v < shape.2)?;
    Some((z, y, x))
}

/// 获取 `pos` 在数据范围内的邻居.
#[inline]
pub(crate) fn neighbours(
    pos: Idx3d,
    conn: Connectivity,
    shape: Idx3d,
) -> impl Iterator<Item = Idx3d> {
    conn.offsets()
        .iter()
        .filter_map(move |d| shift(pos, *d, shape))
}

/// 二值膨胀 `iterations` 次.
pub fn dilate(mask: &Array3<bool>, conn: Connectivity, iterations: usize) -> Array3<bool> {
    let shape = mask.dim();
    let mut cur = mask.clone();
    for _ in 0..iterations {
        let mut next = cur.clone();
        for (pos, _) in cur.indexed_iter().filter(|(_, p)| **p) {
            for n in neighbours(pos, conn, shape) {
                next[n] = true;
            }
        }
        if next == cur {
            break;
        }
        cur = next;
    }
    cur
}

/// 二值腐蚀 `iterations` 次. 越界邻居视为背景.
pub fn erode(mask: &Array3<bool>, conn: Connectivity, iterations: usize) -> Array3<bool> {
    let shape = mask.dim();
    let mut cur = mask.clone();
    for _ in 0..iterations {
        let mut next = cur.clone();
        for (pos, p) in next.indexed_iter_mut().filter(|(_, p)| **p) {
            let survives = conn
                .offsets()
                .iter()
                .all(|d| shift(pos, *d, shape).is_some_and(|n| cur[n]));
            *p = survives;
        }
        if next == cur {
            break;
        }
        cur = next;
    }
    cur
}

/// 闭运算: 先膨胀后腐蚀.
#[inline]
pub fn closing(mask: &Array3<bool>, conn: Connectivity, iterations: usize) -> Array3<bool> {
    erode(&dilate(mask, conn, iterations), conn, iterations)
}

/// 开运算: 先腐蚀后膨胀.
#[inline]
pub fn opening(mask: &Array3<bool>, conn: Connectivity, iterations: usize) -> Array3<bool> {
    dilate(&erode(mask, conn, iterations), conn, iterations)
}

/// 前景的包围盒 `[start, end)`. 没有前景时返回 `None`.
pub fn bounding_box(mask: &Array3<bool>) -> Option<(Idx3d, Idx3d)> {
    let mut it = mask.indexed_iter().filter(|(_, p)| **p).map(|(i, _)| i);
    let first = it.next()?;
    let (mut lo, mut hi) = (first, first);
    for (z, y, x) in it {
        lo = (lo.0.min(z), lo.1.min(y), lo.2.min(x));
        hi = (hi.0.max(z), hi.1.max(y), hi.2.max(x));
    }
    Some((lo, (hi.0 + 1, hi.1 + 1, hi.2 + 1)))
}

/// 在前景包围盒 (向外扩展 `margin` 个体素) 内运行 `op`, 结果贴回原尺寸.
///
/// 包围盒外的结果一律为背景. 没有前景时直接返回全背景数组.
pub fn with_crop<F>(mask: &Array3<bool>, margin: usize, op: F) -> Array3<bool>
where
    F: FnOnce(&Array3<bool>) -> Array3<bool>,
{
    let shape = mask.dim();
    let Some((lo, hi)) = bounding_box(mask) else {
        return Array3::from_elem(shape, false);
    };
    let lo = (
        lo.0.saturating_sub(margin),
        lo.1.saturating_sub(margin),
        lo.2.saturating_sub(margin),
    );
    let hi = (
        (hi.0 + margin).min(shape.0),
        (hi.1 + margin).min(shape.1),
        (hi.2 + margin).min(shape.2),
    );
    let region = s![lo.0..hi.0, lo.1..hi.1, lo.2..hi.2];
    let sub = op(&mask.slice(region).to_owned());
    debug_assert_eq!(sub.dim(), (hi.0 - lo.0, hi.1 - lo.1, hi.2 - lo.2));

    let mut ans = Array3::from_elem(shape, false);
    ans.slice_mut(region).assign(&sub);
    ans
}

/// 单个掩码的精修流程: 可选的清理, 可选的平滑, 可选的裁剪加速.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Refinement {
    /// 填洞并保留最大连通域.
    pub clean: bool,

    /// 平滑参数. `None` 表示不平滑.
    pub smoothing: Option<SmoothOptions>,

    /// 若为 `Some(margin)`, 在扩展后的前景包围盒内运算.
    pub crop_margin: Option<usize>,
}

impl Refinement {
    /// 是否什么也不做.
    #[inline]
    pub fn is_noop(&self) -> bool {
        !self.clean && self.smoothing.is_none()
    }

    /// 对掩码执行精修.
    pub fn apply(&self, mask: Array3<bool>, spacing: &Spacing) -> Array3<bool> {
        if self.is_noop() {
            return mask;
        }
        let run = |m: &Array3<bool>| {
            let m = if self.clean { clean_mask(m) } else { m.clone() };
            match &self.smoothing {
                Some(opts) => smooth_mask(&m, spacing, opts),
                None => m,
            }
        };
        match self.crop_margin {
            Some(margin) => with_crop(&mask, margin, run),
            None => run(&mask),
        }
    }

    /// 仅执行平滑部分.
    pub fn smooth_only(&self, mask: Array3<bool>, spacing: &Spacing) -> Array3<bool> {
        Refinement {
            clean: false,
            ..self.clone()
        }
        .apply(mask, spacing)
    }
}
