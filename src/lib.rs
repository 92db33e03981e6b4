//! JobKeeper: A Durable Job Orchestrator
//!
//! Provides the job orchestration core of a trading platform backend: a
//! per-user job state machine with idempotent submission, pluggable executors,
//! admission control under per-task-type concurrency limits, crash recovery of
//! in-flight work, and a persisted registry of recurring interval schedules.
//!
//! # Features
//!
//! - Job lifecycle `queued -> running -> {succeeded | failed}` or `queued -> cancelled`,
//!   validated by one transition routine shared by every call path.
//! - Idempotent submission keyed on `(user, idempotency key)`, race-free through
//!   the repository's insert-if-absent primitive.
//! - Admission control: a dispatch over the concurrency limit leaves the job
//!   `queued` with `CONCURRENCY_LIMIT_EXCEEDED`.
//! - Executors:
//!   - [`InProcessExecutor`]: runs handlers on the calling thread.
//!   - [`TokioExecutor`]: runs handlers on tokio's blocking pool and calls back asynchronously.
//! - Callable dispatch ([`JobService::dispatch_job_with_callable`]) for one-off runners.
//! - Crash recovery: jobs left `running` by a previous process are failed with `RUNTIME_RECOVERY`.
//! - In-memory and SQLite backends for jobs and schedules, chosen by configuration.
//! - Interval [`Scheduler`] with namespace ownership, stop, and restart recovery.
//! - System schedule templates registered idempotently at boot.
//! - [`ScheduleTicker`] that turns due schedules into submitted jobs.
//! - Runtime status snapshot ([`RuntimeStatus`]).
//! - Optional thread-local job context for handlers (requires `job_context` feature).
//!
//! # Usage
//!
//! ```
//! use jobkeeper::{HandlerRegistry, JobStatus, Orchestrator, OrchestratorConfig};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut handlers = HandlerRegistry::new();
//! handlers.register("backtest_run", |payload| {
//!     Ok(json!({ "accepted": payload["strategyId"] }))
//! });
//!
//! let orchestrator = Orchestrator::bootstrap(&OrchestratorConfig::default(), handlers)?;
//! let service = orchestrator.service();
//!
//! let job = service.submit_job("u-1", "backtest_run", json!({ "strategyId": "s-1" }), Some("k-1"))?;
//! assert_eq!(job.status, JobStatus::Queued);
//!
//! let job = service.dispatch_job("u-1", job.id)?;
//! assert_eq!(job.status, JobStatus::Succeeded);
//! assert_eq!(job.result, Some(json!({ "accepted": "s-1" })));
//!
//! let status = service.runtime_status();
//! assert_eq!(status.execution.succeeded, 1);
//! assert_eq!(status.system_schedules.total, 3);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! Use [`JobService::builder`] to assemble a service by hand, or
//! [`Orchestrator::bootstrap`] with an [`OrchestratorConfig`] to select:
//! - `executor`: `inprocess` or `tokio`.
//! - `storage`: `memory` or `sqlite { path }`.
//! - `recover_on_start`, `concurrency` limits, ticker settings.
//!
//! # Errors
//!
//! Service operations return [`OrchestratorError`]; adapters map it through
//! [`OrchestratorError::code`]. Handler failures ([`ExecutionError`]) never
//! escape dispatch: they become the job's persisted `failed` state.
//!
//! # Observability
//!
//! - [`JobService::runtime_status`] returns executor mode, execution counters,
//!   the last recovery count and system schedule counts.
//! - Integrate with the `tracing` crate for detailed logs. Each handler run is
//!   wrapped in a `job_exec` span.

// --- Feature-gated Documentation ---

// This empty module attaches the documentation block below only when
// the `job_context` feature is enabled during doc generation.
#[cfg(all(doc, feature = "job_context"))]
pub mod job_context_docs {
    //! # Accessing Job Context (`job_context` feature)
    //!
    //! While an executor runs a handler, information about the job is
    //! installed in a thread-local.
    //!
    //! 1.  **`try_get_current_job_context() -> Option<JobContext>`**: Returns
    //!     `None` when called outside a handler.
    //! 2.  **`job_context!() -> JobContext`**: **Panics** outside a handler.
    //!
    //! ```
    //! use jobkeeper::{try_get_current_job_context, HandlerRegistry};
    //! use serde_json::json;
    //!
    //! let mut handlers = HandlerRegistry::new();
    //! handlers.register("risk_check", |_payload| {
    //!     let ctx = try_get_current_job_context();
    //!     Ok(json!({ "dispatchId": ctx.map(|c| c.dispatch_id) }))
    //! });
    //! ```
}

pub mod config;
pub mod error;
pub mod executor;
pub mod job;
mod macros;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod templates;
pub mod ticker;

// --- Public Re-exports ---

// Composition root & configuration
pub use config::{ExecutorMode, OrchestratorConfig, StorageBackend};
pub use orchestrator::Orchestrator;

// Service
pub use service::{ConcurrencyLimits, JobService, JobServiceBuilder, MANUAL_EXECUTOR_NAME};

// Error types
pub use error::{
  BuildError, ExecutionError, OrchestratorError, ScheduleError, ShutdownError, StoreError,
};

// Job related types
pub use job::{codes, DispatchId, Job, JobId, JobStatus, Payload};
#[cfg(feature = "job_context")]
pub use job::context::{try_get_current_job_context, JobContext};

// Executors
pub use executor::{
  CompletionCallback, Executor, HandlerRegistry, HandlerResult, InProcessExecutor, JobHandler,
  TokioExecutor, IN_PROCESS_EXECUTOR_NAME, TOKIO_EXECUTOR_NAME,
};

// Schedules
pub use schedule::{user_namespace, Schedule, ScheduleId, ScheduleStatus, SYSTEM_NAMESPACE, SYSTEM_OWNER};
pub use scheduler::Scheduler;
pub use templates::{
  ScheduleTemplate, ScheduleTemplateRegistrar, TemplateRegistration, SYSTEM_SCHEDULE_TEMPLATES,
};
pub use ticker::{ScheduleTicker, ScheduleTickerBuilder, TickerHandle};

// Persistence
pub use store::{
  InMemoryJobRepository, InMemoryScheduleStore, JobRepository, ScheduleStore, SqliteJobRepository,
  SqliteScheduleStore,
};

// Registry & status
pub use metrics::{ExecutionCounters, RuntimeStatus, SystemScheduleCounts};
pub use registry::{TaskDomain, TaskType, TaskTypeRegistry};

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a global subscriber was already set.
#[cfg(feature = "subscriber")]
pub fn init_tracing() -> bool {
  use tracing_subscriber::EnvFilter;

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .try_init()
    .is_ok()
}
