//! 端到端: 规划, 调度, 后处理, 导出准备. 推理由脚本化服务代替.

use std::sync::Arc;

use ct_rtseg::config::FlipConfig;
use ct_rtseg::error::ExportError;
use ct_rtseg::export::NpzStructureWriter;
use ct_rtseg::prelude::*;
use ct_rtseg::provider::ModelCache;
use ndarray::{Array2, Array3};
use ndarray_npy::NpzReader;
use tokio_util::sync::CancellationToken;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn request(organs: &[&str]) -> SegmentationRequest {
    let mut r = SegmentationRequest::from_config(&SegConfig::default(), organs.iter().copied());
    r.flip = FlipConfig {
        lr: false,
        ap: false,
        si: false,
    };
    r
}

fn class(catalog: &TaskCatalog, task: Task, organ: &str) -> u16 {
    catalog.table(task).unwrap().class_of(organ).unwrap()
}

/// 在 `[lo, hi)^3` 内填入 `value`.
fn fill(a: &mut Array3<u16>, lo: usize, hi: usize, value: u16) {
    for z in lo..hi {
        for y in lo..hi {
            for x in lo..hi {
                a[(z, y, x)] = value;
            }
        }
    }
}

fn dispatcher(provider: Arc<ScriptedProvider>, catalog: Arc<TaskCatalog>, req: SegmentationRequest) -> Dispatcher {
    Dispatcher::new(provider, catalog, VolumeSource::Nifti("ct.nii.gz".into()), req)
        .with_cache(Arc::new(ModelCache::new()))
}

#[test]
fn cancellation_after_first_of_three_tasks() {
    init_logging();
    let catalog = Arc::new(TaskCatalog::bundled());
    let mut total = Array3::zeros((6, 6, 6));
    fill(&mut total, 1, 3, class(&catalog, Task::Total, "liver"));
    let mut body = Array3::zeros((6, 6, 6));
    fill(&mut body, 0, 6, class(&catalog, Task::Body, "skin"));
    let mut vessels = Array3::zeros((6, 6, 6));
    fill(&mut vessels, 2, 4, class(&catalog, Task::LungVessels, "lung_vessels"));

    let token = CancellationToken::new();
    let trigger = token.clone();
    let provider = Arc::new(
        ScriptedProvider::new()
            .without_download()
            .with_output(Task::Total, total, Spacing::default())
            .with_output(Task::Body, body, Spacing::default())
            .with_output(Task::LungVessels, vessels, Spacing::default())
            // 第二个任务运行期间收到取消请求.
            .with_hook(move |task| {
                if task == Task::Body {
                    trigger.cancel();
                }
            }),
    );

    let d = dispatcher(provider.clone(), catalog, request(&["liver", "skin", "lung_vessels"]))
        .with_cancel(token);
    let report = d.run_request();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.masks.names(), vec!["liver".to_string()]);
    assert_eq!(report.state(Task::Total), Some(&TaskState::Complete));
    assert_eq!(report.state(Task::Body), Some(&TaskState::Skipped));
    assert_eq!(report.state(Task::LungVessels), Some(&TaskState::Pending));
    assert_eq!(provider.called_tasks(), vec![Task::Total, Task::Body]);
}

#[test]
fn first_writer_wins_across_tasks() {
    init_logging();
    let catalog = Arc::new(TaskCatalog::bundled());
    let mut total = Array3::zeros((5, 5, 5));
    total[(1, 1, 1)] = class(&catalog, Task::Total, "aorta");
    let mut heart = Array3::zeros((5, 5, 5));
    fill(&mut heart, 2, 5, class(&catalog, Task::HeartChambersHighres, "aorta"));
    let provider = Arc::new(
        ScriptedProvider::new()
            .without_download()
            .with_output(Task::Total, total, Spacing::default())
            .with_output(Task::HeartChambersHighres, heart, Spacing::default()),
    );

    let mut plan = TaskPlan::default();
    plan.assignment.add(Task::HeartChambersHighres, "aorta");
    plan.assignment.add(Task::Total, "aorta");
    plan.requested.insert("aorta".into());

    let report = dispatcher(provider, catalog, request(&[])).run(&plan);
    let aorta = report.masks.get("aorta").unwrap();
    assert_eq!(aorta.provenance, Provenance::Task(Task::Total));
    assert_eq!(aorta.voxels(), 1);
    assert_eq!(report.completed_tasks(), vec![Task::Total, Task::HeartChambersHighres]);
}

#[test]
fn unmapped_organ_is_reported_not_planned() {
    init_logging();
    let catalog = Arc::new(TaskCatalog::bundled());
    let mut total = Array3::zeros((4, 4, 4));
    total[(2, 2, 2)] = class(&catalog, Task::Total, "liver");
    let provider = Arc::new(
        ScriptedProvider::new()
            .without_download()
            .with_output(Task::Total, total, Spacing::default()),
    );

    let report = dispatcher(provider.clone(), catalog, request(&["liver", "unobtainium"])).run_request();
    assert_eq!(report.unmet, vec!["unobtainium".to_string()]);
    assert_eq!(provider.called_tasks(), vec![Task::Total]);
    assert_eq!(
        provider.calls()[0].organs,
        Some(vec!["liver".to_string()])
    );
    assert_eq!(report.masks.names(), vec!["liver".to_string()]);
}

#[test]
fn body_and_skin_are_derived() {
    init_logging();
    let catalog = Arc::new(TaskCatalog::bundled());
    let mut body = Array3::zeros((12, 12, 12));
    fill(&mut body, 2, 10, class(&catalog, Task::Body, "body_trunc"));
    let provider = Arc::new(
        ScriptedProvider::new()
            .without_download()
            .with_output(Task::Body, body, Spacing::default()),
    );

    let report = dispatcher(provider.clone(), catalog, request(&["body", "skin"])).run_request();
    assert_eq!(report.status, RunStatus::Completed);
    // body_trunc 只为派生 body 而请求, 不出现在结果中.
    assert_eq!(report.masks.names(), vec!["body".to_string(), "skin".to_string()]);
    let body = report.masks.get("body").unwrap();
    let skin = report.masks.get("skin").unwrap();
    assert_eq!(body.provenance, Provenance::Derived);
    assert_eq!(body.voxels(), 8 * 8 * 8);
    assert!(!skin.is_empty());
    assert!(!skin.data[(6, 6, 6)]);

    let requested = provider.calls()[0].organs.clone().unwrap();
    assert!(requested.contains(&"body_trunc".to_string()));
    assert!(requested.contains(&"skin".to_string()));
}

#[test]
fn lung_request_fuses_lobes() {
    init_logging();
    let catalog = Arc::new(TaskCatalog::bundled());
    let mut total = Array3::zeros((8, 8, 8));
    fill(&mut total, 1, 3, class(&catalog, Task::Total, "lung_upper_lobe_right"));
    fill(&mut total, 4, 7, class(&catalog, Task::Total, "lung_lower_lobe_right"));
    let provider = Arc::new(
        ScriptedProvider::new()
            .without_download()
            .with_output(Task::Total, total, Spacing::default()),
    );

    let report = dispatcher(provider, catalog, request(&["lung_right"])).run_request();
    assert_eq!(report.masks.names(), vec!["lung_right".to_string()]);
    let lung = report.masks.get("lung_right").unwrap();
    assert_eq!(lung.provenance, Provenance::Fused);
    assert_eq!(lung.voxels(), 8 + 27);
}

#[test]
fn manual_volume_outputs_are_conformed() {
    init_logging();
    let slices: Vec<SliceRecord> = (0..10)
        .map(|i| SliceRecord {
            pixels: Some(Array2::from_elem((4, 6), 0)),
            pixel_spacing: Some([1.0, 1.0]),
            image_position: Some([0.0, 0.0, 2.0 * i as f64]),
            image_orientation: Some([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
            ..Default::default()
        })
        .collect();
    let volume = ManualVolume::build(&slices).unwrap();
    let catalog = Arc::new(TaskCatalog::bundled());
    // 推理输出的面内两轴与手动体积相反.
    let mut labels = Array3::zeros((10, 6, 4));
    fill(&mut labels, 1, 4, class(&catalog, Task::Total, "spleen"));
    let provider = Arc::new(
        ScriptedProvider::new()
            .without_download()
            .with_output(Task::Total, labels, Spacing::default()),
    );

    let d = Dispatcher::new(
        provider,
        catalog,
        VolumeSource::Manual(Arc::new(volume)),
        request(&["spleen"]),
    )
    .with_cache(Arc::new(ModelCache::new()));
    let report = d.run_request();
    assert_eq!(report.masks.get("spleen").unwrap().shape(), (10, 4, 6));
}

#[test]
fn export_drops_distorted_and_writes_survivors() {
    init_logging();
    let catalog = Arc::new(TaskCatalog::bundled());
    let mut total = Array3::zeros((8, 10, 12));
    fill(&mut total, 1, 6, class(&catalog, Task::Total, "liver"));
    total[(7, 9, 11)] = class(&catalog, Task::Total, "spleen");
    let provider = Arc::new(
        ScriptedProvider::new()
            .without_download()
            .with_output(Task::Total, total, Spacing::default()),
    );
    let report = dispatcher(provider, catalog, request(&["liver", "spleen"]))
        .run_request()
        .freeze();
    assert_eq!(report.masks.len(), 2);

    // (z, y, x) = (8, 10, 12) -> (rows, cols, slices) = (10, 12, 8)
    let set = prepare_export(
        &report.masks,
        ReconciliationTarget::new(10, 12, 8),
        &ExportOptions::default(),
    )
    .unwrap();
    assert_eq!(set.rois.len(), 1);
    assert_eq!(set.rois[0].name, "liver");
    assert_eq!(set.rois[0].mask.dim(), (10, 12, 8));
    assert_eq!(set.dropped[0].0, "spleen");

    // 畸变过大: 全部被丢弃.
    assert!(matches!(
        prepare_export(
            &report.masks,
            ReconciliationTarget::new(10, 12, 4),
            &ExportOptions::default()
        ),
        Err(ExportError::NoMasks)
    ));

    let dir = tempfile::tempdir().unwrap();
    let path = NpzStructureWriter::new(dir.path()).write(&set, "Doe^Jane").unwrap();
    let mut npz = NpzReader::new(std::fs::File::open(&path).unwrap()).unwrap();
    let roi: Array3<bool> = npz.by_name("roi_000.npy").unwrap();
    assert_eq!(roi.dim(), (10, 12, 8));
}

#[test]
fn worker_cancel_is_observed() {
    init_logging();
    let catalog = Arc::new(TaskCatalog::bundled());
    let provider = ScriptedProvider::new().without_download();
    let worker = SegmentationWorker::new(Arc::new(provider), catalog)
        .with_cache(Arc::new(ModelCache::new()));
    let handle = worker
        .spawn(
            VolumeSource::Nifti("ct.nii.gz".into()),
            request(&["liver", "skin"]),
        )
        .unwrap();
    handle.cancel();
    let report = handle.join().unwrap();
    // 取消可能发生在任意检查点, 但结果总是一致的.
    assert!(report.masks.is_empty());
    assert!(report
        .states
        .iter()
        .all(|(_, s)| !matches!(s, TaskState::Complete)));
}
