//! How a job's payload actually runs.
//!
//! An [`Executor`] reserves a dispatch handle (`submit`) and then runs the job
//! (`dispatch`), reporting the outcome exactly once through a
//! [`CompletionCallback`]. The service never learns whether that happens on the
//! calling thread or elsewhere.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[cfg(feature = "job_context")]
use crate::job::context::{self, JobContext};

use crate::error::{BuildError, ExecutionError};
use crate::job::{codes, DispatchId, Job, Payload};

/// Name reported by [`InProcessExecutor`], and by `dispatch_job_with_callable`.
pub const IN_PROCESS_EXECUTOR_NAME: &str = "inprocess";
/// Name reported by [`TokioExecutor`].
pub const TOKIO_EXECUTOR_NAME: &str = "tokio";

/// What a handler returns: a result document, or a failure.
pub type HandlerResult = Result<Payload, ExecutionError>;

/// The function type registered per task type.
///
/// Handlers receive the job payload and must be `Send + Sync + 'static`.
/// Panics are caught by the executor and reported as [`ExecutionError::Unexpected`].
pub type JobHandler = Arc<dyn Fn(&Payload) -> HandlerResult + Send + Sync + 'static>;

/// Invoked by an executor once the job finishes, successfully or not.
pub type CompletionCallback = Box<dyn FnOnce(HandlerResult) + Send + 'static>;

/// Abstraction over "how a job's payload actually runs".
pub trait Executor: Send + Sync {
  /// Stamped onto jobs as `executor_name`.
  fn name(&self) -> &str;

  /// Reserves a dispatch handle. Must be cheap and must not run the job.
  fn submit(&self, job: &Job) -> DispatchId;

  /// Runs the job and eventually calls `callback` exactly once.
  fn dispatch(&self, job: Job, dispatch_id: DispatchId, callback: CompletionCallback);
}

// --- Handler Registry ---

/// Task type -> handler map shared by the concrete executors.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
  handlers: HashMap<String, JobHandler>,
}

impl fmt::Debug for HandlerRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names: Vec<_> = self.handlers.keys().collect();
    names.sort();
    f.debug_struct("HandlerRegistry")
      .field("task_types", &names)
      .finish()
  }
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers `handler` for `task_type`, replacing any previous handler.
  pub fn register<F>(&mut self, task_type: &str, handler: F) -> &mut Self
  where
    F: Fn(&Payload) -> HandlerResult + Send + Sync + 'static,
  {
    self.handlers.insert(task_type.to_string(), Arc::new(handler));
    self
  }

  /// Registers an already-shared handler (e.g. one built with `job_handler!`).
  pub fn register_shared(&mut self, task_type: &str, handler: JobHandler) -> &mut Self {
    self.handlers.insert(task_type.to_string(), handler);
    self
  }

  pub fn get(&self, task_type: &str) -> Option<JobHandler> {
    self.handlers.get(task_type).cloned()
  }

  pub fn contains(&self, task_type: &str) -> bool {
    self.handlers.contains_key(task_type)
  }

  /// Resolves the job's handler and runs it, catching panics.
  pub(crate) fn run(&self, job: &Job, dispatch_id: &str) -> HandlerResult {
    match self.get(&job.task_type) {
      Some(handler) => run_guarded(job, dispatch_id, |payload| handler(payload)),
      None => {
        warn!(job_id = %job.id, task_type = %job.task_type, "No handler registered for task type.");
        Err(ExecutionError::structured(
          codes::HANDLER_NOT_FOUND,
          format!("no handler registered for task type '{}'", job.task_type),
        ))
      }
    }
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "handler panicked".to_string()
  }
}

/// Runs `f` against the job payload inside a `job_exec` span, with the job
/// context installed, converting a panic into [`ExecutionError::Unexpected`].
pub(crate) fn run_guarded<F>(job: &Job, dispatch_id: &str, f: F) -> HandlerResult
where
  F: FnOnce(&Payload) -> HandlerResult,
{
  let span = tracing::span!(
    tracing::Level::INFO,
    "job_exec",
    job_id = %job.id,
    task_type = job.task_type.as_str(),
    dispatch_id = dispatch_id
  );
  let _entered = span.enter();

  debug!("Starting job execution.");
  let started = Instant::now();

  #[cfg(feature = "job_context")]
  let outcome = {
    let ctx = JobContext {
      job_id: job.id,
      user_id: job.user_id.clone(),
      task_type: job.task_type.clone(),
      dispatch_id: dispatch_id.to_string(),
    };
    context::scope(ctx, || panic::catch_unwind(AssertUnwindSafe(|| f(&job.payload))))
  };
  #[cfg(not(feature = "job_context"))]
  let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&job.payload)));

  let result = match outcome {
    Ok(result) => result,
    Err(panic_payload) => {
      let message = panic_message(panic_payload);
      error!(%message, "Job handler panicked!");
      Err(ExecutionError::Unexpected(format!("handler panicked: {}", message)))
    }
  };

  let outcome_str = match &result {
    Ok(_) => "Success",
    Err(ExecutionError::Structured { .. }) => "Fail",
    Err(ExecutionError::Unexpected(_)) => "Error",
  };
  info!(
    duration_ms = started.elapsed().as_millis(),
    outcome = outcome_str,
    "Finished job execution."
  );
  result
}

fn new_dispatch_id() -> DispatchId {
  Uuid::new_v4().to_string()
}

// --- In-Process Executor ---

/// Runs handlers on the calling thread and calls back before `dispatch` returns.
#[derive(Debug, Clone, Default)]
pub struct InProcessExecutor {
  handlers: HandlerRegistry,
}

impl InProcessExecutor {
  pub fn new(handlers: HandlerRegistry) -> Self {
    Self { handlers }
  }

  pub fn handlers(&self) -> &HandlerRegistry {
    &self.handlers
  }
}

impl Executor for InProcessExecutor {
  fn name(&self) -> &str {
    IN_PROCESS_EXECUTOR_NAME
  }

  fn submit(&self, _job: &Job) -> DispatchId {
    new_dispatch_id()
  }

  fn dispatch(&self, job: Job, dispatch_id: DispatchId, callback: CompletionCallback) {
    let result = self.handlers.run(&job, &dispatch_id);
    callback(result);
  }
}

// --- Tokio Executor ---

/// Hands each job, and its completion callback, to tokio's blocking pool, so
/// `dispatch` returns as soon as the work is handed off.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
  handlers: HandlerRegistry,
  runtime: Handle,
}

impl TokioExecutor {
  /// Binds to the runtime the caller is running on.
  ///
  /// # Errors
  ///
  /// Returns [`BuildError::NoRuntime`] outside a tokio runtime.
  pub fn new(handlers: HandlerRegistry) -> Result<Self, BuildError> {
    let runtime = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;
    Ok(Self::with_handle(handlers, runtime))
  }

  pub fn with_handle(handlers: HandlerRegistry, runtime: Handle) -> Self {
    Self { handlers, runtime }
  }
}

impl Executor for TokioExecutor {
  fn name(&self) -> &str {
    TOKIO_EXECUTOR_NAME
  }

  fn submit(&self, _job: &Job) -> DispatchId {
    new_dispatch_id()
  }

  fn dispatch(&self, job: Job, dispatch_id: DispatchId, callback: CompletionCallback) {
    let handlers = self.handlers.clone();
    let job_id = job.id;
    // Completion takes the service's transition lock and writes to the store,
    // so it runs on the blocking pool along with the handler.
    let pending = Arc::new(Mutex::new(Some(callback)));
    let task = {
      let pending = pending.clone();
      self.runtime.spawn_blocking(move || {
        let result = handlers.run(&job, &dispatch_id);
        let callback = pending.lock().take();
        if let Some(callback) = callback {
          callback(result);
        }
      })
    };
    let runtime = self.runtime.clone();
    self.runtime.spawn(async move {
      // `run` already catches handler panics; a JoinError here means the
      // blocking task was cancelled or panicked outside the handler.
      let Err(join_error) = task.await else {
        return;
      };
      error!(%job_id, "Blocking job task did not complete: {:?}", join_error);
      let Some(callback) = pending.lock().take() else {
        return;
      };
      let failure: HandlerResult = Err(ExecutionError::Unexpected(format!(
        "job task did not complete: {}",
        join_error
      )));
      if runtime.spawn_blocking(move || callback(failure)).await.is_err() {
        error!(%job_id, "Failed to record the outcome of an aborted job task.");
      }
    });
  }
}
