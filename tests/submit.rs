//! tests/submit.rs
//! Submission, idempotency and ownership-scoped queries.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use crate::common::{build_service, build_service_with, setup_tracing};
use jobkeeper::{
  ConcurrencyLimits, InMemoryJobRepository, JobRepository, JobStatus, OrchestratorError,
  SqliteJobRepository,
};
use serde_json::json;
use uuid::Uuid;

#[test]
fn test_fresh_submission_is_queued() {
  setup_tracing();
  let service = build_service();

  let job = service
    .submit_job("u-1", "backtest_run", json!({ "strategyId": "s-1" }), Some("k-1"))
    .unwrap();

  assert_eq!(job.status, JobStatus::Queued);
  assert_eq!(job.created_at, job.updated_at);
  assert_eq!(job.idempotency_key.as_deref(), Some("k-1"));
  assert!(job.executor_name.is_none());
  assert!(job.dispatch_id.is_none());
  assert!(job.started_at.is_none());
  assert!(job.finished_at.is_none());
  assert_eq!(service.get_job("u-1", job.id).unwrap(), job);
}

#[test]
fn test_alias_is_stored_as_canonical_name() {
  setup_tracing();
  let service = build_service();

  let job = service.submit_job("u-1", "backtest", json!({}), None).unwrap();
  assert_eq!(job.task_type, "backtest_run");

  let listed = service.list_jobs("u-1", Some("backtest"), None).unwrap();
  assert_eq!(listed.len(), 1, "alias filter should resolve to the canonical type");
}

#[test]
fn test_unknown_task_type_is_rejected() {
  setup_tracing();
  let service = build_service();

  let err = service
    .submit_job("u-1", "mine_bitcoin", json!({}), None)
    .unwrap_err();
  assert!(matches!(err, OrchestratorError::UnknownTaskType(ref name) if name == "mine_bitcoin"));
  assert_eq!(err.code(), "UNKNOWN_TASK_TYPE");
  assert!(service.list_jobs("u-1", None, None).unwrap().is_empty());
}

#[test]
fn test_reused_key_is_a_conflict() {
  setup_tracing();
  let service = build_service();
  let payload = json!({ "strategyId": "s-1" });

  let first = service
    .submit_job("u-1", "backtest_run", payload.clone(), Some("k-1"))
    .unwrap();
  let err = service
    .submit_job("u-1", "backtest_run", payload, Some("k-1"))
    .unwrap_err();

  match err {
    OrchestratorError::IdempotencyConflict {
      ref key,
      existing_job_id,
    } => {
      assert_eq!(key, "k-1");
      assert_eq!(existing_job_id, Some(first.id));
    }
    other => panic!("Expected IdempotencyConflict, got {:?}", other),
  }
  assert_eq!(err.code(), "IDEMPOTENCY_CONFLICT");
  assert_eq!(service.list_jobs("u-1", None, None).unwrap().len(), 1);
}

#[test]
fn test_same_key_for_different_users_is_independent() {
  setup_tracing();
  let service = build_service();

  let a = service.submit_job("u-1", "backtest_run", json!({}), Some("k-1")).unwrap();
  let b = service.submit_job("u-2", "backtest_run", json!({}), Some("k-1")).unwrap();
  assert_ne!(a.id, b.id);
}

#[test]
fn test_concurrent_submissions_with_one_key_create_one_job() {
  setup_tracing();
  let repository: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
  let service = build_service_with(repository.clone(), ConcurrencyLimits::default());
  let submitters = 8;
  let barrier = Arc::new(Barrier::new(submitters));

  let handles: Vec<_> = (0..submitters)
    .map(|_| {
      let service = service.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        barrier.wait();
        service.submit_job("u-1", "backtest_run", json!({}), Some("race"))
      })
    })
    .collect();

  let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
  let created = outcomes.iter().filter(|r| r.is_ok()).count();
  let conflicts = outcomes
    .iter()
    .filter(|r| matches!(r, Err(OrchestratorError::IdempotencyConflict { .. })))
    .count();

  assert_eq!(created, 1);
  assert_eq!(conflicts, submitters - 1);
  assert_eq!(repository.list_all(None).unwrap().len(), 1);
}

#[test]
fn test_conflict_detection_on_sqlite_store() {
  setup_tracing();
  let repository = Arc::new(SqliteJobRepository::open_in_memory().unwrap());
  let service = build_service_with(repository, ConcurrencyLimits::default());

  service.submit_job("u-1", "risk_check", json!({}), Some("k-9")).unwrap();
  let err = service
    .submit_job("u-1", "risk_check", json!({}), Some("k-9"))
    .unwrap_err();
  assert!(matches!(err, OrchestratorError::IdempotencyConflict { .. }));
}

#[test]
fn test_get_job_is_scoped_to_owner() {
  setup_tracing();
  let service = build_service();
  let job = service.submit_job("u-1", "backtest_run", json!({}), None).unwrap();

  let err = service.get_job("u-2", job.id).unwrap_err();
  assert!(matches!(err, OrchestratorError::JobNotFound(id) if id == job.id));
  assert_eq!(err.code(), "NOT_FOUND");

  let missing = Uuid::new_v4();
  assert!(matches!(
    service.get_job("u-1", missing),
    Err(OrchestratorError::JobNotFound(_))
  ));
}

#[test]
fn test_list_jobs_filters_by_type_and_status() {
  setup_tracing();
  let service = build_service();
  let backtest = service.submit_job("u-1", "backtest_run", json!({}), None).unwrap();
  service.submit_job("u-1", "strategy_validate", json!({}), None).unwrap();
  service.submit_job("u-2", "backtest_run", json!({}), None).unwrap();
  service.cancel_job("u-1", backtest.id).unwrap();

  assert_eq!(service.list_jobs("u-1", None, None).unwrap().len(), 2);
  assert_eq!(service.list_jobs("u-1", Some("backtest_run"), None).unwrap().len(), 1);

  let cancelled = service
    .list_jobs("u-1", None, Some(JobStatus::Cancelled))
    .unwrap();
  assert_eq!(cancelled.len(), 1);
  assert_eq!(cancelled[0].id, backtest.id);

  assert!(service
    .list_jobs("u-1", Some("strategy_validate"), Some(JobStatus::Running))
    .unwrap()
    .is_empty());
}
