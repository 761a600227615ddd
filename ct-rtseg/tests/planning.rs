//! 规划器在完整目录上的性质.

use std::collections::BTreeSet;

use ct_rtseg::error::PlanningError;
use ct_rtseg::planner::OrganSubset;
use ct_rtseg::prelude::*;

fn fixture() -> (OrganIndex, TaskCatalog) {
    let catalog = TaskCatalog::bundled();
    (OrganIndex::build(&catalog), catalog)
}

/// 检查规划的基本性质.
fn check_plan(plan: &TaskPlan, selected: &[&str], catalog: &TaskCatalog) {
    let selected: BTreeSet<&str> = selected.iter().copied().collect();

    // 每个 (任务, 器官) 对都在该任务的标签表中.
    for (task, organ) in plan.assignment.pairs() {
        assert!(!task.is_pseudo());
        assert!(
            catalog.table(task).unwrap().contains(organ),
            "{organ} not in {task}"
        );
        // 请求的器官都来自选择, 或是为派生结构额外加入的.
        assert!(selected.contains(organ) || plan.fallback.contains(organ), "{organ}");
    }

    // 可覆盖的器官恰好出现在一个任务中.
    let unmet: BTreeSet<&str> = plan.unmet.iter().map(PlanningError::organ).collect();
    for organ in selected.iter().filter(|o| !plan.derived.contains(**o)) {
        let hits = plan
            .assignment
            .iter()
            .filter(|(_, s)| matches!(s, OrganSubset::Only(set) if set.contains(*organ)))
            .count();
        if unmet.contains(organ) {
            assert_eq!(hits, 0, "{organ}");
        } else {
            assert_eq!(hits, 1, "{organ}");
        }
    }
}

#[test]
fn every_indexed_organ_is_plannable() {
    let (index, catalog) = fixture();
    let organs: Vec<&str> = index.organs().collect();
    assert!(organs.len() > 100);

    for organ in &organs {
        let plan = compute_required_tasks(&[*organ], &index, &catalog);
        assert!(plan.unmet.is_empty(), "{organ}");
        assert_eq!(plan.assignment.len(), 1, "{organ}");
        check_plan(&plan, &[*organ], &catalog);
    }

    let plan = compute_required_tasks(&organs, &index, &catalog);
    assert!(plan.unmet.is_empty());
    check_plan(&plan, &organs, &catalog);
}

#[test]
fn mixed_selection_properties() {
    let (index, catalog) = fixture();
    let selected = [
        "liver",
        "aorta",
        "body",
        "skin",
        "lung_left",
        "eye_lens_left",
        "tibia",
        "no_such_organ",
        "skeletal_muscle",
    ];
    let plan = compute_required_tasks(&selected, &index, &catalog);
    check_plan(&plan, &selected, &catalog);

    assert_eq!(
        plan.unmet,
        vec![PlanningError::Unmapped("no_such_organ".into())]
    );
    assert_eq!(
        plan.assignment.tasks(),
        vec![
            Task::Total,
            Task::Body,
            Task::HeadGlandsCavities,
            Task::AppendicularBones,
            Task::TissueTypes,
        ]
    );
    // aorta 同时在两个任务中, 选择通用任务.
    assert!(plan.assignment.get(Task::Total).unwrap().wants("aorta"));
    assert!(plan.assignment.get(Task::HeartChambersHighres).is_none());
}

#[test]
fn planning_is_deterministic() {
    let (index, catalog) = fixture();
    let a = compute_required_tasks(&["spleen", "body", "lung_vessels"], &index, &catalog);
    let b = compute_required_tasks(&["lung_vessels", "spleen", "body"], &index, &catalog);
    assert_eq!(a.assignment, b.assignment);
    assert_eq!(a.derived, b.derived);
    assert_eq!(a.fallback, b.fallback);
}

#[test]
fn request_with_explicit_task() {
    let (index, catalog) = fixture();
    let req = SegmentationRequest::from_config(&SegConfig::default(), ["skin", "liver"])
        .with_task(Task::Body);
    let plan = req.plan(&index, &catalog);
    assert_eq!(plan.assignment.tasks(), vec![Task::Body]);
    assert_eq!(plan.unmet.len(), 1);
    assert!(matches!(
        &plan.unmet[0],
        PlanningError::NotCoveredByTask { organ, task: Task::Body } if organ == "liver"
    ));

    let req = SegmentationRequest::from_config(&SegConfig::default(), ["liver", "tibia"])
        .with_task(Task::Everything);
    let plan = req.plan(&index, &catalog);
    assert_eq!(
        plan.assignment.tasks(),
        vec![Task::Total, Task::AppendicularBones]
    );
}
