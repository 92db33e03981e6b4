//! tests/dispatch.rs
//! Dispatch through the in-process executor and through caller-supplied runners.

mod common;

use crate::common::{build_service, setup_tracing};
use jobkeeper::{
  codes, job_handler, ExecutionError, HandlerRegistry, InMemoryJobRepository, InProcessExecutor,
  JobService, JobStatus, OrchestratorError,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_backtest_dispatch_succeeds() {
  setup_tracing();
  let service = build_service();

  let job = service
    .submit_job("u-1", "backtest_run", json!({ "strategyId": "s-1" }), Some("k-1"))
    .unwrap();
  assert_eq!(job.status, JobStatus::Queued);

  let done = service.dispatch_job("u-1", job.id).unwrap();

  assert_eq!(done.status, JobStatus::Succeeded);
  assert_eq!(done.result, Some(json!({ "accepted": "s-1" })));
  assert_eq!(done.executor_name.as_deref(), Some("inprocess"));
  assert!(done.dispatch_id.as_deref().map_or(false, |d| !d.is_empty()));
  assert!(done.started_at.is_some());
  assert!(done.finished_at.is_some());
  assert!(done.finished_at >= done.started_at);
  assert!(done.error_code.is_none());
  assert_eq!(service.get_job("u-1", job.id).unwrap(), done);
}

#[test]
fn test_structured_handler_failure_is_recorded() {
  setup_tracing();
  let service = build_service();
  let job = service.submit_job("u-1", "risk_check", json!({}), None).unwrap();

  let done = service.dispatch_job("u-1", job.id).unwrap();

  assert_eq!(done.status, JobStatus::Failed);
  assert_eq!(done.error_code.as_deref(), Some("RISK_LIMIT_BREACHED"));
  assert_eq!(done.error_message.as_deref(), Some("exposure above 2x"));
  assert_eq!(done.result, Some(json!({ "exposure": 2.4 })));
  assert!(done.finished_at.is_some());
}

#[test]
fn test_handler_panic_becomes_generic_failure() {
  setup_tracing();
  let service = build_service();
  let job = service.submit_job("u-1", "signal_generate", json!({}), None).unwrap();

  let done = service.dispatch_job("u-1", job.id).unwrap();

  assert_eq!(done.status, JobStatus::Failed);
  assert_eq!(done.error_code.as_deref(), Some(codes::EXECUTION_FAILED));
  assert!(done
    .error_message
    .as_deref()
    .map_or(false, |m| m.contains("signal source offline")));
  assert!(done.result.is_none());
}

#[test]
fn test_missing_handler_fails_the_job() {
  setup_tracing();
  let service = build_service();
  let job = service.submit_job("u-1", "strategy_validate", json!({}), None).unwrap();

  let done = service.dispatch_job("u-1", job.id).unwrap();

  assert_eq!(done.status, JobStatus::Failed);
  assert_eq!(done.error_code.as_deref(), Some(codes::HANDLER_NOT_FOUND));
}

#[test]
fn test_dispatching_a_finished_job_is_invalid() {
  setup_tracing();
  let service = build_service();
  let job = service.submit_job("u-1", "backtest_run", json!({}), None).unwrap();
  service.dispatch_job("u-1", job.id).unwrap();

  let err = service.dispatch_job("u-1", job.id).unwrap_err();
  match err {
    OrchestratorError::InvalidTransition { job_id, from, to } => {
      assert_eq!(job_id, job.id);
      assert_eq!(from, JobStatus::Succeeded);
      assert_eq!(to, JobStatus::Running);
    }
    other => panic!("Expected InvalidTransition, got {:?}", other),
  }

  let cancelled = service.submit_job("u-1", "backtest_run", json!({}), None).unwrap();
  service.cancel_job("u-1", cancelled.id).unwrap();
  assert!(matches!(
    service.dispatch_job("u-1", cancelled.id),
    Err(OrchestratorError::InvalidTransition { .. })
  ));
}

#[test]
fn test_dispatching_another_users_job_is_not_found() {
  setup_tracing();
  let service = build_service();
  let job = service.submit_job("u-1", "backtest_run", json!({}), None).unwrap();

  assert!(matches!(
    service.dispatch_job("u-2", job.id),
    Err(OrchestratorError::JobNotFound(_))
  ));
  assert_eq!(service.get_job("u-1", job.id).unwrap().status, JobStatus::Queued);
}

#[test]
fn test_callable_dispatch_succeeds_as_inprocess() {
  setup_tracing();
  let service = build_service();
  // No handler is registered for backtest_batch.
  let job = service
    .submit_job("u-1", "backtest_batch", json!({ "runs": 3 }), None)
    .unwrap();

  let done = service
    .dispatch_job_with_callable("u-1", job.id, |payload| {
      Ok(json!({ "completed": payload["runs"] }))
    })
    .unwrap();

  assert_eq!(done.status, JobStatus::Succeeded);
  assert_eq!(done.result, Some(json!({ "completed": 3 })));
  assert_eq!(done.executor_name.as_deref(), Some("inprocess"));
  assert!(done.dispatch_id.is_some());
}

#[test]
fn test_callable_structured_failure_is_recorded() {
  setup_tracing();
  let service = build_service();
  let job = service.submit_job("u-1", "backtest_batch", json!({}), None).unwrap();

  let done = service
    .dispatch_job_with_callable("u-1", job.id, |_| {
      Err(
        ExecutionError::structured("BATCH_PARTIAL", "2 of 3 runs failed")
          .with_result(json!({ "completed": 1 })),
      )
    })
    .unwrap();

  assert_eq!(done.status, JobStatus::Failed);
  assert_eq!(done.error_code.as_deref(), Some("BATCH_PARTIAL"));
  assert_eq!(done.error_message.as_deref(), Some("2 of 3 runs failed"));
  assert_eq!(done.result, Some(json!({ "completed": 1 })));
  assert_eq!(done.executor_name.as_deref(), Some("inprocess"));
}

#[test]
fn test_callable_unexpected_failure_uses_generic_code() {
  setup_tracing();
  let service = build_service();
  let job = service.submit_job("u-1", "backtest_batch", json!({}), None).unwrap();

  let done = service
    .dispatch_job_with_callable("u-1", job.id, |_| {
      Err(ExecutionError::unexpected("connection reset by peer"))
    })
    .unwrap();

  assert_eq!(done.status, JobStatus::Failed);
  assert_eq!(done.error_code.as_deref(), Some(codes::EXECUTION_FAILED));
  assert_eq!(done.error_message.as_deref(), Some("connection reset by peer"));
}

#[test]
fn test_callable_dispatch_of_running_job_is_invalid() {
  setup_tracing();
  let service = build_service();
  let job = service.submit_job("u-1", "backtest_batch", json!({}), None).unwrap();
  service.start_job("u-1", job.id).unwrap();

  let ran = AtomicUsize::new(0);
  let err = service
    .dispatch_job_with_callable("u-1", job.id, |_| {
      ran.fetch_add(1, Ordering::SeqCst);
      Ok(json!({}))
    })
    .unwrap_err();

  assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
  assert_eq!(ran.load(Ordering::SeqCst), 0, "runner must not run");
}

#[cfg(feature = "job_context")]
#[test]
fn test_handler_sees_job_context() {
  use jobkeeper::try_get_current_job_context;

  setup_tracing();
  let mut handlers = HandlerRegistry::new();
  handlers.register("backtest_run", |_payload| {
    let ctx = try_get_current_job_context().expect("context inside handler");
    Ok(json!({
      "jobId": ctx.job_id,
      "userId": ctx.user_id,
      "taskType": ctx.task_type,
      "dispatchId": ctx.dispatch_id,
    }))
  });
  let service = JobService::builder()
    .repository(Arc::new(InMemoryJobRepository::new()))
    .executor(Arc::new(InProcessExecutor::new(handlers)))
    .build()
    .unwrap();

  let job = service.submit_job("u-7", "backtest_run", json!({}), None).unwrap();
  let done = service.dispatch_job("u-7", job.id).unwrap();

  let result = done.result.clone().unwrap();
  assert_eq!(result["jobId"], json!(job.id));
  assert_eq!(result["userId"], json!("u-7"));
  assert_eq!(result["taskType"], json!("backtest_run"));
  assert_eq!(result["dispatchId"], json!(done.dispatch_id));
  assert!(try_get_current_job_context().is_none(), "context must not leak");
}

#[test]
fn test_job_handler_macro_registers_shared_handler() {
  setup_tracing();
  let runs = Arc::new(AtomicUsize::new(0));
  let counting = job_handler! {
    { let runs = runs.clone() }
    |payload| {
      runs.fetch_add(1, Ordering::SeqCst);
      Ok(json!({ "seen": payload["n"] }))
    }
  };

  let mut handlers = HandlerRegistry::new();
  handlers.register_shared("backtest_run", counting);
  let service = JobService::builder()
    .repository(Arc::new(InMemoryJobRepository::new()))
    .executor(Arc::new(InProcessExecutor::new(handlers)))
    .build()
    .unwrap();

  for n in 0..2 {
    let job = service.submit_job("u-1", "backtest_run", json!({ "n": n }), None).unwrap();
    let done = service.dispatch_job("u-1", job.id).unwrap();
    assert_eq!(done.result, Some(json!({ "seen": n })));
  }
  assert_eq!(runs.load(Ordering::SeqCst), 2);
}
