//! 填洞与连通域.

use std::collections::VecDeque;

use ndarray::Array3;

use super::{neighbours, Connectivity};

/// 填充被前景完全包围的背景空洞.
///
/// 从数组六个表面上的背景体素出发, 按 6 连通洪泛背景;
/// 洪泛不到的背景即为空洞, 填为前景.
pub fn fill_holes(mask: &Array3<bool>) -> Array3<bool> {
    let shape = mask.dim();
    let (z, y, x) = shape;
    if z == 0 || y == 0 || x == 0 {
        return mask.clone();
    }

    // `true` 表示与外界连通的背景.
    let mut outside = Array3::from_elem(shape, false);
    let mut queue = VecDeque::new();
    for (pos, _) in mask.indexed_iter().filter(|(p, v)| !**v && is_surface(*p, shape)) {
        outside[pos] = true;
        queue.push_back(pos);
    }
    while let Some(pos) = queue.pop_front() {
        for n in neighbours(pos, Connectivity::Face6, shape) {
            if !mask[n] && !outside[n] {
                outside[n] = true;
                queue.push_back(n);
            }
        }
    }
    outside.mapv(|o| !o)
}

#[inline]
fn is_surface((z, y, x): (usize, usize, usize), (d, h, w): (usize, usize, usize)) -> bool {
    z == 0 || y == 0 || x == 0 || z + 1 == d || y + 1 == h || x + 1 == w
}

/// 连通域标记. 背景为 0, 连通域从 1 开始按光栅扫描顺序编号.
///
/// 返回标记数组和每个连通域的体素数 (`sizes[i]` 对应标记 `i + 1`).
pub fn label_components(mask: &Array3<bool>, conn: Connectivity) -> (Array3<u32>, Vec<usize>) {
    let shape = mask.dim();
    let mut labels = Array3::<u32>::zeros(shape);
    let mut sizes = vec![];
    let mut queue = VecDeque::new();

    for (seed, _) in mask.indexed_iter().filter(|(_, v)| **v) {
        if labels[seed] != 0 {
            continue;
        }
        let id = sizes.len() as u32 + 1;
        let mut size = 0usize;
        labels[seed] = id;
        queue.push_back(seed);
        while let Some(pos) = queue.pop_front() {
            size += 1;
            for n in neighbours(pos, conn, shape) {
                if mask[n] && labels[n] == 0 {
                    labels[n] = id;
                    queue.push_back(n);
                }
            }
        }
        sizes.push(size);
    }
    (labels, sizes)
}

/// 只保留最大的 26 连通域. 若有多个同样大的, 保留扫描顺序上最先出现的.
pub fn largest_component(mask: &Array3<bool>) -> Array3<bool> {
    let (labels, sizes) = label_components(mask, Connectivity::Full26);
    let Some(best) = sizes
        .iter()
        .enumerate()
        .rev()
        .max_by_key(|(_, s)| **s)
        .map(|(i, _)| i as u32 + 1)
    else {
        return mask.clone();
    };
    labels.mapv(|l| l == best)
}

/// 掩码清理: 先填洞, 再保留最大 26 连通域.
#[inline]
pub fn clean_mask(mask: &Array3<bool>) -> Array3<bool> {
    largest_component(&fill_holes(mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(a: &Array3<bool>) -> usize {
        a.iter().filter(|&&p| p).count()
    }

    /// 5x5x5 空心立方壳, 位于 7x7x7 数组中心.
    fn hollow_shell() -> Array3<bool> {
        Array3::from_shape_fn((7, 7, 7), |(z, y, x)| {
            let inside = |v: usize| (1..6).contains(&v);
            let edge = |v: usize| v == 1 || v == 5;
            inside(z) && inside(y) && inside(x) && (edge(z) || edge(y) || edge(x))
        })
    }

    #[test]
    fn test_fill_holes() {
        let shell = hollow_shell();
        assert_eq!(count(&shell), 125 - 27);
        let filled = fill_holes(&shell);
        assert_eq!(count(&filled), 125);

        // 开口的壳不是空洞.
        let mut open = shell.clone();
        open[(1, 3, 3)] = false;
        assert_eq!(count(&fill_holes(&open)), count(&open));
    }

    #[test]
    fn test_diagonal_is_one_component() {
        let mut m = Array3::from_elem((3, 3, 3), false);
        m[(0, 0, 0)] = true;
        m[(1, 1, 1)] = true;
        assert_eq!(label_components(&m, Connectivity::Full26).1, vec![2]);
        assert_eq!(label_components(&m, Connectivity::Face6).1, vec![1, 1]);
    }

    #[test]
    fn test_largest_component_tie_keeps_first() {
        let mut m = Array3::from_elem((1, 1, 7), false);
        m[(0, 0, 0)] = true;
        m[(0, 0, 1)] = true;
        m[(0, 0, 4)] = true;
        m[(0, 0, 5)] = true;
        let l = largest_component(&m);
        assert!(l[(0, 0, 0)] && l[(0, 0, 1)]);
        assert!(!l[(0, 0, 4)]);

        m[(0, 0, 6)] = true;
        let l = largest_component(&m);
        assert_eq!(count(&l), 3);
        assert!(l[(0, 0, 6)]);
    }

    #[test]
    fn test_clean_mask_empty() {
        let m = Array3::from_elem((2, 3, 4), false);
        assert_eq!(clean_mask(&m), m);
    }
}
