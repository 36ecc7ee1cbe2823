#![forbid(unsafe_code)]

use jobq_core::JobStatus;
use jobq_storage::{ClaimNextRequest, EnqueueRequest, JobSnapshot, SqliteStore, StoreError};
use serde_json::json;
use tempfile::TempDir;

fn setup() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = SqliteStore::open(dir.path()).expect("open store");
    (dir, store)
}

fn enqueue(store: &mut SqliteStore, job_type: &str, priority: i64) -> JobSnapshot {
    store
        .enqueue(EnqueueRequest {
            priority,
            ..EnqueueRequest::new(job_type, json!({ "priority": priority }))
        })
        .expect("enqueue")
}

fn claim(store: &mut SqliteStore, types: Option<&[&str]>) -> Option<JobSnapshot> {
    store
        .claim_next(ClaimNextRequest {
            worker_id: "w1".to_string(),
            allowed_job_types: types.map(|t| t.iter().map(|s| s.to_string()).collect()),
        })
        .expect("claim_next")
}

#[test]
fn lower_priority_value_is_claimed_first() {
    let (_dir, mut store) = setup();
    let low = enqueue(&mut store, "export", 200);
    let high = enqueue(&mut store, "export", 10);
    let mid = enqueue(&mut store, "export", 100);

    let order: Vec<i64> = std::iter::from_fn(|| claim(&mut store, None))
        .map(|job| job.id)
        .collect();
    assert_eq!(order, vec![high.id, mid.id, low.id]);
}

#[test]
fn equal_priority_is_first_in_first_out() {
    let (_dir, mut store) = setup();
    let ids: Vec<i64> = (0..5).map(|_| enqueue(&mut store, "export", 100).id).collect();

    let order: Vec<i64> = std::iter::from_fn(|| claim(&mut store, None))
        .map(|job| job.id)
        .collect();
    assert_eq!(order, ids);
}

#[test]
fn type_filter_skips_other_job_types() {
    let (_dir, mut store) = setup();
    let export = enqueue(&mut store, "export", 1);
    let index = enqueue(&mut store, "index", 100);

    let claimed = claim(&mut store, Some(&["INDEX", "thumbnail"][..])).expect("index job");
    assert_eq!(claimed.id, index.id);
    assert!(claim(&mut store, Some(&["index"][..])).is_none());

    let remaining = store.get_job(export.id).expect("get").expect("exists");
    assert_eq!(remaining.status, JobStatus::Queued);

    let claimed = claim(&mut store, Some(&[][..])).expect("empty filter claims anything");
    assert_eq!(claimed.id, export.id);
}

#[test]
fn empty_queue_returns_none() {
    let (_dir, mut store) = setup();
    assert!(claim(&mut store, None).is_none());
}

#[test]
fn invalid_type_filter_is_rejected() {
    let (_dir, mut store) = setup();
    enqueue(&mut store, "export", 100);

    let err = store
        .claim_next(ClaimNextRequest {
            worker_id: "w1".to_string(),
            allowed_job_types: Some(vec!["  ".to_string()]),
        })
        .expect_err("blank job type");
    assert!(matches!(err, StoreError::InvalidInput(_)));
    assert_eq!(store.counts().expect("counts").get(JobStatus::Queued), 1);
}
