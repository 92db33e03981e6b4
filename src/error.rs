use crate::job::{JobId, JobStatus, Payload};
use crate::schedule::ScheduleId;

use thiserror::Error;

// --- Storage Errors ---

/// Errors raised by the persistence backends (`store::memory`, `store::sqlite`).
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
  /// A persisted row could not be mapped back onto the domain type
  /// (unknown status string, malformed timestamp or id).
  #[error("Corrupt row: {0}")]
  Corrupt(String),
}

// --- Orchestration Errors ---

/// Typed conditions surfaced by [`JobService`](crate::JobService) operations.
///
/// Adapters (HTTP, CLI) are expected to branch on the variant, or on
/// [`OrchestratorError::code`], rather than on the message text.
#[derive(Error, Debug)]
pub enum OrchestratorError {
  /// A job already exists for `(user, idempotency key)`. Never merged silently.
  #[error("Idempotency key '{key}' was already used for job {existing_job_id:?}.")]
  IdempotencyConflict {
    key: String,
    /// `None` only if the conflicting row vanished between insert and lookup.
    existing_job_id: Option<JobId>,
  },
  #[error("Invalid transition for job {job_id}: {from} -> {to}.")]
  InvalidTransition {
    job_id: JobId,
    from: JobStatus,
    to: JobStatus,
  },
  /// Also returned when the job exists but belongs to another user.
  #[error("Job {0} not found.")]
  JobNotFound(JobId),
  #[error("Unknown task type '{0}'.")]
  UnknownTaskType(String),
  #[error(transparent)]
  Store(#[from] StoreError),
}

impl OrchestratorError {
  /// Stable machine-readable code for this condition.
  pub fn code(&self) -> &'static str {
    match self {
      OrchestratorError::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
      OrchestratorError::InvalidTransition { .. } => "INVALID_TRANSITION",
      OrchestratorError::JobNotFound(_) => "NOT_FOUND",
      OrchestratorError::UnknownTaskType(_) => "UNKNOWN_TASK_TYPE",
      OrchestratorError::Store(_) => "STORAGE_ERROR",
    }
  }
}

// --- Execution Errors ---

/// Failure reported by a job handler (or a callable passed to
/// `dispatch_job_with_callable`).
///
/// These never propagate past the dispatch machinery: they are converted into
/// the job's persisted `failed` state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
  /// A known failure with an explicit code, message and optional partial result.
  /// Mapped 1:1 onto the job's `error_code`, `error_message` and `result`.
  #[error("{code}: {message}")]
  Structured {
    code: String,
    message: String,
    result: Option<Payload>,
  },
  /// Anything else. Stored with the generic `EXECUTION_FAILED` code.
  #[error("{0}")]
  Unexpected(String),
}

impl ExecutionError {
  pub fn structured(code: impl Into<String>, message: impl Into<String>) -> Self {
    ExecutionError::Structured {
      code: code.into(),
      message: message.into(),
      result: None,
    }
  }

  /// Attaches a partial result. No effect on `Unexpected`.
  pub fn with_result(self, partial: Payload) -> Self {
    match self {
      ExecutionError::Structured { code, message, .. } => ExecutionError::Structured {
        code,
        message,
        result: Some(partial),
      },
      other => other,
    }
  }

  pub fn unexpected(message: impl Into<String>) -> Self {
    ExecutionError::Unexpected(message.into())
  }
}

// --- Schedule Errors ---

#[derive(Error, Debug)]
pub enum ScheduleError {
  /// Also returned when the schedule lives in a namespace the caller does not own.
  #[error("Schedule {0} not found.")]
  NotFound(ScheduleId),
  #[error("Interval must be at least one second (got {0}).")]
  InvalidInterval(u64),
  #[error("User '{user_id}' may not register schedules in namespace '{namespace}'.")]
  NamespaceForbidden { user_id: String, namespace: String },
  #[error(transparent)]
  Store(#[from] StoreError),
}

// --- Build Errors ---

/// Errors that can occur while building a service or bootstrapping an orchestrator.
#[derive(Error, Debug)]
pub enum BuildError {
  #[error("A job repository must be provided.")]
  MissingRepository,
  #[error("An executor must be provided.")]
  MissingExecutor,
  #[error("The tokio executor requires a running tokio runtime.")]
  NoRuntime,
  #[error("Invalid configuration: {0}")]
  Config(String),
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  Schedule(#[from] ScheduleError),
  #[error("Startup recovery failed: {0}")]
  Recovery(#[source] OrchestratorError),
}

// --- Shutdown Errors ---

/// Errors related to stopping a running [`ScheduleTicker`](crate::ScheduleTicker).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (ticker already stopped).")]
  SignalFailed,
  #[error("Timed out waiting for the ticker task to stop.")]
  Timeout,
  #[error("The ticker task panicked.")]
  TaskPanic,
  #[error("Shutdown already in progress or completed.")]
  AlreadyShutDown,
}
