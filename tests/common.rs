//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use jobkeeper::{
  CompletionCallback, ConcurrencyLimits, DispatchId, Executor, ExecutionError, HandlerRegistry,
  HandlerResult, InMemoryJobRepository, InProcessExecutor, Job, JobRepository, JobService,
  JobStatus, Payload,
};
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_test_writer()
    .try_init();
}

// Handlers for the task types most tests use.
// - backtest_run: echoes `strategyId` as `accepted`.
// - risk_check: structured failure with a partial result.
// - signal_generate: panics.
pub fn default_handlers() -> HandlerRegistry {
  let mut handlers = HandlerRegistry::new();
  handlers
    .register("backtest_run", |payload| {
      Ok(json!({ "accepted": payload["strategyId"] }))
    })
    .register("risk_check", |_payload| {
      Err(
        ExecutionError::structured("RISK_LIMIT_BREACHED", "exposure above 2x")
          .with_result(json!({ "exposure": 2.4 })),
      )
    })
    .register("signal_generate", |_payload| -> HandlerResult {
      panic!("signal source offline");
    });
  handlers
}

// In-memory service over `default_handlers`, default limits.
pub fn build_service() -> JobService {
  build_service_with(Arc::new(InMemoryJobRepository::new()), ConcurrencyLimits::default())
}

pub fn build_service_with(repository: Arc<dyn JobRepository>, limits: ConcurrencyLimits) -> JobService {
  JobService::builder()
    .repository(repository)
    .executor(Arc::new(InProcessExecutor::new(default_handlers())))
    .concurrency_limits(limits)
    .build()
    .expect("Failed to build service")
}

// Service over an arbitrary executor, recovery disabled.
pub fn build_service_on(
  repository: Arc<dyn JobRepository>,
  executor: Arc<dyn Executor>,
  limits: ConcurrencyLimits,
) -> JobService {
  JobService::builder()
    .repository(repository)
    .executor(executor)
    .concurrency_limits(limits)
    .recover_on_start(false)
    .build()
    .expect("Failed to build service")
}

// A fully populated queued job, for seeding repositories directly.
pub fn queued_job(user_id: &str, task_type: &str, key: Option<&str>) -> Job {
  let now = Utc::now();
  Job {
    id: Uuid::new_v4(),
    user_id: user_id.to_string(),
    task_type: task_type.to_string(),
    payload: json!({}),
    idempotency_key: key.map(str::to_string),
    status: JobStatus::Queued,
    result: None,
    error_code: None,
    error_message: None,
    executor_name: None,
    dispatch_id: None,
    started_at: None,
    finished_at: None,
    created_at: now,
    updated_at: now,
  }
}

pub fn running_job(user_id: &str, task_type: &str) -> Job {
  let mut job = queued_job(user_id, task_type, None);
  let now = Utc::now();
  job.status = JobStatus::Running;
  job.executor_name = Some("inprocess".to_string());
  job.dispatch_id = Some(Uuid::new_v4().to_string());
  job.started_at = Some(now);
  job.updated_at = now;
  job
}

// --- Executor Test Doubles ---

/// Accepts dispatches and never calls back, simulating a job stuck `running`
/// (or a process that died mid-execution).
#[derive(Debug, Default)]
pub struct NoCallbackExecutor {
  pub dispatched: AtomicUsize,
}

impl Executor for NoCallbackExecutor {
  fn name(&self) -> &str {
    "no-callback"
  }

  fn submit(&self, _job: &Job) -> DispatchId {
    Uuid::new_v4().to_string()
  }

  fn dispatch(&self, job: Job, dispatch_id: DispatchId, _callback: CompletionCallback) {
    tracing::debug!(job_id = %job.id, %dispatch_id, "Dropping callback on purpose.");
    self.dispatched.fetch_add(1, Ordering::SeqCst);
  }
}

/// Holds callbacks until the test releases them, keeping jobs `running`.
#[derive(Default)]
pub struct DeferredExecutor {
  pending: Mutex<Vec<(Job, DispatchId, CompletionCallback)>>,
}

impl DeferredExecutor {
  pub fn pending(&self) -> usize {
    self.pending.lock().len()
  }

  /// Completes every held job with `outcome(payload)`, in dispatch order.
  pub fn release_all(&self, outcome: impl Fn(&Payload) -> HandlerResult) -> usize {
    let held = std::mem::take(&mut *self.pending.lock());
    let count = held.len();
    for (job, _dispatch_id, callback) in held {
      callback(outcome(&job.payload));
    }
    count
  }
}

impl Executor for DeferredExecutor {
  fn name(&self) -> &str {
    "deferred"
  }

  fn submit(&self, _job: &Job) -> DispatchId {
    format!("deferred-{}", Uuid::new_v4())
  }

  fn dispatch(&self, job: Job, dispatch_id: DispatchId, callback: CompletionCallback) {
    self.pending.lock().push((job, dispatch_id, callback));
  }
}
