//! 结构派生与融合: body / skin, 左右肺.
//!
//! 二者都在全部任务完成之后, 由唯一的写入者在 [`MaskSet`] 上原地执行.
//! 收到取消请求时直接返回, 不修改掩码集合.

use std::collections::BTreeSet;

use ndarray::{Array3, Zip};
use tokio_util::sync::CancellationToken;

use crate::consts::organ;
use crate::masks::{MaskSet, OrganMask, Provenance};
use crate::morph::{dilate, erode, Connectivity, Refinement};
use crate::provider::Spacing;

/// 取并集. 与第一个掩码形状不同的掩码被跳过.
fn union<'a, I>(it: I) -> Option<Array3<bool>>
where
    I: IntoIterator<Item = (&'a str, &'a OrganMask)>,
{
    let mut it = it.into_iter();
    let (_, first) = it.next()?;
    let mut acc = first.data.clone();
    for (name, m) in it {
        if acc.dim() == m.data.dim() {
            Zip::from(&mut acc).and(&m.data).for_each(|a, &b| *a |= b);
        } else {
            tracing::warn!(
                organ = name,
                shape = ?m.data.dim(),
                expected = ?acc.dim(),
                "mask shape mismatch, excluded from union"
            );
        }
    }
    Some(acc)
}

/// 皮肤: 一个体素的膨胀减去一个体素的腐蚀 (6 邻域结构元).
pub fn skin_shell(body: &Array3<bool>) -> Array3<bool> {
    let outer = dilate(body, Connectivity::Face6, 1);
    let inner = erode(body, Connectivity::Face6, 1);
    Zip::from(&outer)
        .and(&inner)
        .map_collect(|&o, &i| o && !i)
}

/// 按请求补齐 body 家族的结构. 返回无法满足的名称.
///
/// 1. 请求中包含 body 家族名称且集合中没有 `body` 时, 以当前全部掩码的并集作为 `body`,
///   按 `refine` 的平滑参数平滑;
/// 2. 请求了 `skin` 而集合中没有时, 由 `body` 派生; 结果为空则不加入;
/// 3. `body_trunc` / `body_extremities` 无法从并集中区分, 缺失时只记录, 不猜测.
pub fn ensure_body_related_masks(
    masks: &mut MaskSet,
    requested: &BTreeSet<String>,
    refine: &Refinement,
    spacing: &Spacing,
    cancel: &CancellationToken,
) -> Vec<String> {
    let mut unmet = vec![];
    if cancel.is_cancelled() || !requested.iter().any(|o| organ::is_body_family(o)) {
        return unmet;
    }

    if !masks.contains(organ::BODY) {
        match union(masks.iter()) {
            Some(body) => {
                let body = refine.smooth_only(body, spacing);
                let voxels = body.iter().filter(|&&p| p).count();
                tracing::info!(organ = organ::BODY, shape = ?body.dim(), voxels, "structure derived");
                masks.insert_first(organ::BODY, OrganMask::new(body, Provenance::Derived));
            }
            None => tracing::warn!("no masks present, body cannot be derived"),
        }
    }

    if cancel.is_cancelled() {
        return unmet;
    }

    if requested.contains(organ::SKIN) && !masks.contains(organ::SKIN) {
        match masks.get(organ::BODY) {
            Some(body) => {
                let skin = skin_shell(&body.data);
                let voxels = skin.iter().filter(|&&p| p).count();
                if voxels == 0 {
                    tracing::warn!(organ = organ::SKIN, "derived skin is empty, not added");
                } else {
                    tracing::info!(organ = organ::SKIN, shape = ?skin.dim(), voxels, "structure derived");
                    masks.insert_first(organ::SKIN, OrganMask::new(skin, Provenance::Derived));
                }
            }
            None => unmet.push(organ::SKIN.to_string()),
        }
    }

    for alias in [organ::BODY_TRUNC, organ::BODY_EXTREMITIES] {
        if requested.contains(alias) && !masks.contains(alias) {
            tracing::warn!(organ = alias, "cannot be reconstructed from the body union, left unmet");
            unmet.push(alias.to_string());
        }
    }
    unmet
}

/// 将肺叶融合为左右肺, 并删除肺叶条目. 返回新生成的结构名.
///
/// 只融合实际存在的肺叶; 已有的 `lung_left` / `lung_right` 一并计入并集.
pub fn merge_lung_lobes(
    masks: &mut MaskSet,
    refine: &Refinement,
    spacing: &Spacing,
    cancel: &CancellationToken,
) -> Vec<String> {
    let groups: [(&str, &[&str]); 2] = [
        (organ::LUNG_LEFT, &organ::LEFT_LOBES),
        (organ::LUNG_RIGHT, &organ::RIGHT_LOBES),
    ];

    let mut ans = vec![];
    for (target, lobes) in groups {
        if cancel.is_cancelled() {
            break;
        }
        let present: Vec<&str> = lobes.iter().copied().filter(|l| masks.contains(l)).collect();
        if present.is_empty() {
            continue;
        }
        let parts = present
            .iter()
            .chain([&target])
            .filter_map(|n| masks.get(n).map(|m| (*n, m)));
        let Some(fused) = union(parts) else {
            continue;
        };
        let fused = refine.smooth_only(fused, spacing);
        tracing::info!(
            organ = target,
            lobes = ?present,
            voxels = fused.iter().filter(|&&p| p).count(),
            "lung lobes fused"
        );
        masks.replace(target, OrganMask::new(fused, Provenance::Fused));
        present.iter().for_each(|l| {
            masks.remove(l);
        });
        ans.push(target.to_string());
    }
    ans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Task;

    fn cube(n: usize, lo: usize, hi: usize) -> Array3<bool> {
        Array3::from_shape_fn((n, n, n), |(z, y, x)| {
            [z, y, x].iter().all(|&i| (lo..hi).contains(&i))
        })
    }

    fn req(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_skin_of_solid_cube() {
        let body = cube(24, 2, 22);
        let skin = skin_shell(&body);
        let n = skin.iter().filter(|&&p| p).count();
        // 20^3 + 6 * 20^2 - 18^3
        assert_eq!(n, 4568);
        assert!(n < body.iter().filter(|&&p| p).count());
        assert!(!skin[(12, 12, 12)]);
        assert!(skin[(2, 5, 5)] && skin[(1, 5, 5)]);
    }

    #[test]
    fn test_empty_body_gives_no_skin() {
        let mut masks = MaskSet::new();
        masks.insert_first(
            organ::BODY,
            OrganMask::new(Array3::from_elem((6, 6, 6), false), Provenance::Task(Task::Body)),
        );
        let unmet = ensure_body_related_masks(
            &mut masks,
            &req(&["skin"]),
            &Refinement::default(),
            &Spacing::default(),
            &CancellationToken::new(),
        );
        assert!(unmet.is_empty());
        assert!(!masks.contains(organ::SKIN));
    }

    #[test]
    fn test_body_is_union() {
        let mut masks = MaskSet::new();
        let mut a = Array3::from_elem((4, 4, 4), false);
        a[(0, 0, 0)] = true;
        let mut b = Array3::from_elem((4, 4, 4), false);
        b[(3, 3, 3)] = true;
        masks.insert_first("liver", OrganMask::new(a, Provenance::Task(Task::Total)));
        masks.insert_first("spleen", OrganMask::new(b, Provenance::Task(Task::Total)));

        let unmet = ensure_body_related_masks(
            &mut masks,
            &req(&["body", "body_trunc"]),
            &Refinement::default(),
            &Spacing::default(),
            &CancellationToken::new(),
        );
        let body = masks.get(organ::BODY).unwrap();
        assert_eq!(body.provenance, Provenance::Derived);
        assert_eq!(body.voxels(), 2);
        assert_eq!(unmet, vec!["body_trunc".to_string()]);
    }

    #[test]
    fn test_cancelled_is_noop() {
        let mut masks = MaskSet::new();
        masks.insert_first("liver", OrganMask::new(cube(4, 1, 3), Provenance::Task(Task::Total)));
        let token = CancellationToken::new();
        token.cancel();
        ensure_body_related_masks(
            &mut masks,
            &req(&["body"]),
            &Refinement::default(),
            &Spacing::default(),
            &token,
        );
        assert_eq!(masks.names(), vec!["liver".to_string()]);
    }

    #[test]
    fn test_merge_left_lobes_only() {
        let mut masks = MaskSet::new();
        let mut up = Array3::from_elem((4, 4, 4), false);
        up[(0, 1, 1)] = true;
        let mut low = Array3::from_elem((4, 4, 4), false);
        low[(3, 1, 1)] = true;
        let t = Provenance::Task(Task::Total);
        masks.insert_first("lung_upper_lobe_left", OrganMask::new(up.clone(), t));
        masks.insert_first("lung_lower_lobe_left", OrganMask::new(low.clone(), t));

        let fused = merge_lung_lobes(
            &mut masks,
            &Refinement::default(),
            &Spacing::default(),
            &CancellationToken::new(),
        );
        assert_eq!(fused, vec!["lung_left".to_string()]);
        assert_eq!(masks.names(), vec!["lung_left".to_string()]);
        let expected = Zip::from(&up).and(&low).map_collect(|&a, &b| a || b);
        let left = masks.get("lung_left").unwrap();
        assert_eq!(left.data, expected);
        assert_eq!(left.provenance, Provenance::Fused);
    }
}
