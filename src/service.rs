use crate::error::{BuildError, ExecutionError, OrchestratorError, StoreError};
use crate::executor::{self, CompletionCallback, Executor, HandlerResult, IN_PROCESS_EXECUTOR_NAME};
use crate::job::{codes, DispatchId, Job, JobId, JobStatus, Payload};
use crate::metrics::{ExecutionMetrics, ExecutorStatus, RecoveryStatus, RuntimeStatus};
use crate::registry::TaskTypeRegistry;
use crate::scheduler::Scheduler;
use crate::store::JobRepository;
use crate::templates::ScheduleTemplateRegistrar;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Executor name stamped by [`JobService::start_job`], where the caller runs the work.
pub const MANUAL_EXECUTOR_NAME: &str = "manual";

const DEFAULT_CONCURRENCY_LIMIT: usize = 1;

// --- Concurrency Limits ---

/// Maximum number of `running` jobs per task type, counted across all users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyLimits {
  pub default_limit: usize,
  pub per_task_type: HashMap<String, usize>,
}

impl Default for ConcurrencyLimits {
  fn default() -> Self {
    Self {
      default_limit: DEFAULT_CONCURRENCY_LIMIT,
      per_task_type: HashMap::new(),
    }
  }
}

impl ConcurrencyLimits {
  pub fn new(default_limit: usize) -> Self {
    Self {
      default_limit,
      per_task_type: HashMap::new(),
    }
  }

  /// Overrides the limit for one task type.
  pub fn with_limit(mut self, task_type: &str, limit: usize) -> Self {
    self.per_task_type.insert(task_type.to_string(), limit);
    self
  }

  pub fn limit_for(&self, task_type: &str) -> usize {
    self
      .per_task_type
      .get(task_type)
      .copied()
      .unwrap_or(self.default_limit)
  }
}

// --- Builder ---

/// Builder for [`JobService`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use jobkeeper::{HandlerRegistry, InMemoryJobRepository, InProcessExecutor, JobService};
///
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut handlers = HandlerRegistry::new();
/// handlers.register("backtest_run", |payload| Ok(payload.clone()));
///
/// let service = JobService::builder()
///     .repository(Arc::new(InMemoryJobRepository::new()))
///     .executor(Arc::new(InProcessExecutor::new(handlers)))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct JobServiceBuilder {
  repository: Option<Arc<dyn JobRepository>>,
  executor: Option<Arc<dyn Executor>>,
  scheduler: Option<Arc<Scheduler>>,
  templates: Option<ScheduleTemplateRegistrar>,
  registry: TaskTypeRegistry,
  limits: ConcurrencyLimits,
  recover_on_start: bool,
}

impl Default for JobServiceBuilder {
  fn default() -> Self {
    Self {
      repository: None,
      executor: None,
      scheduler: None,
      templates: None,
      registry: TaskTypeRegistry::builtin(),
      limits: ConcurrencyLimits::default(),
      recover_on_start: true,
    }
  }
}

impl JobServiceBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the job store (required).
  pub fn repository(mut self, repository: Arc<dyn JobRepository>) -> Self {
    self.repository = Some(repository);
    self
  }

  /// Sets the executor used by [`JobService::dispatch_job`] (required).
  pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
    self.executor = Some(executor);
    self
  }

  /// Attaches the schedule registry. System schedule counts in
  /// [`JobService::runtime_status`] come from it.
  pub fn scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
    self.scheduler = Some(scheduler);
    self
  }

  /// Overrides the registrar used for system schedule counts. Defaults to one
  /// over [`SYSTEM_SCHEDULE_TEMPLATES`](crate::SYSTEM_SCHEDULE_TEMPLATES) when a scheduler is set.
  pub fn schedule_templates(mut self, templates: ScheduleTemplateRegistrar) -> Self {
    self.templates = Some(templates);
    self
  }

  /// Replaces the builtin task type catalog.
  pub fn task_types(mut self, registry: TaskTypeRegistry) -> Self {
    self.registry = registry;
    self
  }

  pub fn concurrency_limits(mut self, limits: ConcurrencyLimits) -> Self {
    self.limits = limits;
    self
  }

  /// Whether `build` fails jobs left `running` by a previous process. Default `true`.
  pub fn recover_on_start(mut self, enabled: bool) -> Self {
    self.recover_on_start = enabled;
    self
  }

  /// Builds the service, running crash recovery first when enabled.
  ///
  /// # Errors
  ///
  /// - [`BuildError::MissingRepository`] / [`BuildError::MissingExecutor`].
  /// - [`BuildError::Recovery`] if the recovery pass could not persist its changes.
  pub fn build(self) -> Result<JobService, BuildError> {
    let repository = self.repository.ok_or(BuildError::MissingRepository)?;
    let executor = self.executor.ok_or(BuildError::MissingExecutor)?;
    let templates = match (self.templates, &self.scheduler) {
      (Some(templates), _) => Some(templates),
      (None, Some(scheduler)) => Some(ScheduleTemplateRegistrar::new(scheduler.clone())),
      (None, None) => None,
    };

    let service = JobService {
      inner: Arc::new(ServiceInner {
        repository,
        executor,
        scheduler: self.scheduler,
        templates,
        registry: self.registry,
        limits: self.limits,
        metrics: ExecutionMetrics::new(),
        recovered_running_jobs: AtomicUsize::new(0),
        transitions: Mutex::new(()),
      }),
    };
    info!(
      executor = service.inner.executor.name(),
      recover_on_start = self.recover_on_start,
      "Job service built."
    );

    if self.recover_on_start {
      service
        .recover_running_jobs()
        .map_err(BuildError::Recovery)?;
    }
    Ok(service)
  }
}

// --- Service ---

struct ServiceInner {
  repository: Arc<dyn JobRepository>,
  executor: Arc<dyn Executor>,
  scheduler: Option<Arc<Scheduler>>,
  templates: Option<ScheduleTemplateRegistrar>,
  registry: TaskTypeRegistry,
  limits: ConcurrencyLimits,
  metrics: ExecutionMetrics,
  recovered_running_jobs: AtomicUsize,
  // Serializes every state transition (and the admission count that precedes it).
  transitions: Mutex<()>,
}

/// The job state machine: idempotent submission, admission control, dispatch
/// and crash recovery.
///
/// Cheap to clone; clones share the same state. All operations are
/// synchronous and scoped to the owning user.
#[derive(Clone)]
pub struct JobService {
  inner: Arc<ServiceInner>,
}

impl fmt::Debug for JobService {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobService")
      .field("executor", &self.inner.executor.name())
      .field("limits", &self.inner.limits)
      .finish_non_exhaustive()
  }
}

/// Result of the `queued -> running` step shared by every start path.
enum Admission {
  Started(Job, DispatchId),
  Refused(Job),
}

impl JobService {
  pub fn builder() -> JobServiceBuilder {
    JobServiceBuilder::new()
  }

  pub fn task_types(&self) -> &TaskTypeRegistry {
    &self.inner.registry
  }

  pub fn scheduler(&self) -> Option<&Arc<Scheduler>> {
    self.inner.scheduler.as_ref()
  }

  pub fn executor_name(&self) -> &str {
    self.inner.executor.name()
  }

  // --- Submission & Queries ---

  /// Creates a `queued` job.
  ///
  /// `task_type` may be a legacy alias; the canonical name is stored.
  ///
  /// # Errors
  ///
  /// - [`OrchestratorError::UnknownTaskType`] if the registry does not know `task_type`.
  /// - [`OrchestratorError::IdempotencyConflict`] if `(user_id, idempotency_key)` was already used.
  pub fn submit_job(
    &self,
    user_id: &str,
    task_type: &str,
    payload: Payload,
    idempotency_key: Option<&str>,
  ) -> Result<Job, OrchestratorError> {
    let canonical = self
      .inner
      .registry
      .resolve(task_type)
      .ok_or_else(|| OrchestratorError::UnknownTaskType(task_type.to_string()))?
      .name
      .clone();

    if let Some(key) = idempotency_key {
      if let Some(existing) = self.inner.repository.find_by_idempotency_key(user_id, key)? {
        return Err(self.conflict(key, Some(existing.id)));
      }
    }

    let job = Job::queued(user_id, &canonical, payload, idempotency_key, Utc::now());
    if !self.inner.repository.save_if_absent(&job)? {
      // Lost a race against a concurrent submission with the same key.
      return match idempotency_key {
        Some(key) => {
          let existing = self.inner.repository.find_by_idempotency_key(user_id, key)?;
          Err(self.conflict(key, existing.map(|j| j.id)))
        }
        None => Err(OrchestratorError::Store(StoreError::Corrupt(format!(
          "job id {} already present",
          job.id
        )))),
      };
    }

    debug!(job_id = %job.id, %user_id, task_type = %job.task_type, "Job submitted.");
    Ok(job)
  }

  fn conflict(&self, key: &str, existing_job_id: Option<JobId>) -> OrchestratorError {
    warn!(idempotency_key = %key, ?existing_job_id, "Idempotency key reused.");
    OrchestratorError::IdempotencyConflict {
      key: key.to_string(),
      existing_job_id,
    }
  }

  /// Ownership-scoped lookup. Another user's job is reported as not found.
  pub fn get_job(&self, user_id: &str, job_id: JobId) -> Result<Job, OrchestratorError> {
    self
      .inner
      .repository
      .get(user_id, job_id)?
      .ok_or(OrchestratorError::JobNotFound(job_id))
  }

  /// Lists a user's jobs, oldest first. `task_type` may be an alias.
  pub fn list_jobs(
    &self,
    user_id: &str,
    task_type: Option<&str>,
    status: Option<JobStatus>,
  ) -> Result<Vec<Job>, OrchestratorError> {
    let canonical = task_type.map(|name| {
      self
        .inner
        .registry
        .resolve(name)
        .map_or(name, |t| t.name.as_str())
    });
    Ok(self.inner.repository.list(user_id, canonical, status)?)
  }

  // --- Low-Level Transitions ---

  /// `queued -> running` for callers that run the work themselves.
  ///
  /// Stamps `executor_name = "manual"` and a fresh dispatch id. When admission
  /// control refuses, the returned job is still `queued` and carries
  /// `CONCURRENCY_LIMIT_EXCEEDED`.
  pub fn start_job(&self, user_id: &str, job_id: JobId) -> Result<Job, OrchestratorError> {
    match self.begin_running(user_id, job_id, MANUAL_EXECUTOR_NAME, |_| new_dispatch_id())? {
      Admission::Started(job, _) | Admission::Refused(job) => Ok(job),
    }
  }

  /// `running -> succeeded`.
  pub fn succeed_job(
    &self,
    user_id: &str,
    job_id: JobId,
    result: Payload,
  ) -> Result<Job, OrchestratorError> {
    let _guard = self.inner.transitions.lock();
    let mut job = self.load_for_transition(user_id, job_id, JobStatus::Succeeded)?;
    self.finish(&mut job, Ok(result), Utc::now())?;
    Ok(job)
  }

  /// `running -> failed` with an explicit code, message and optional partial result.
  pub fn fail_job(
    &self,
    user_id: &str,
    job_id: JobId,
    error_code: &str,
    error_message: &str,
    result: Option<Payload>,
  ) -> Result<Job, OrchestratorError> {
    let _guard = self.inner.transitions.lock();
    let mut job = self.load_for_transition(user_id, job_id, JobStatus::Failed)?;
    let failure = ExecutionError::Structured {
      code: error_code.to_string(),
      message: error_message.to_string(),
      result,
    };
    self.finish(&mut job, Err(failure), Utc::now())?;
    Ok(job)
  }

  /// `queued -> cancelled`. Running jobs cannot be cancelled.
  pub fn cancel_job(&self, user_id: &str, job_id: JobId) -> Result<Job, OrchestratorError> {
    let _guard = self.inner.transitions.lock();
    let mut job = self.load_for_transition(user_id, job_id, JobStatus::Cancelled)?;
    job.mark_cancelled(Utc::now());
    self.inner.repository.save(&job)?;
    debug!(%job_id, "Job cancelled.");
    Ok(job)
  }

  // --- Dispatch ---

  /// Admits the job, hands it to the configured executor and returns the job
  /// as persisted once `dispatch` returns.
  ///
  /// With a synchronous executor the returned job is already terminal. Handler
  /// failures never surface as `Err`; they are recorded on the job. If the
  /// outcome itself cannot be persisted, the error is logged and the job stays
  /// `running` until [`JobService::recover_running_jobs`] resolves it.
  pub fn dispatch_job(&self, user_id: &str, job_id: JobId) -> Result<Job, OrchestratorError> {
    let executor = self.inner.executor.clone();
    let (job, dispatch_id) =
      match self.begin_running(user_id, job_id, executor.name(), |job| executor.submit(job))? {
        Admission::Started(job, dispatch_id) => (job, dispatch_id),
        Admission::Refused(job) => return Ok(job),
      };

    let callback = self.completion_callback(&job, dispatch_id.clone());
    // The transition lock is not held here: synchronous executors call back
    // before `dispatch` returns.
    executor.dispatch(job, dispatch_id, callback);
    self.get_job(user_id, job_id)
  }

  /// Same admission and state semantics as [`JobService::dispatch_job`], but
  /// runs `runner` in place of a registered handler. Always reports
  /// `executor_name = "inprocess"`.
  pub fn dispatch_job_with_callable<F>(
    &self,
    user_id: &str,
    job_id: JobId,
    runner: F,
  ) -> Result<Job, OrchestratorError>
  where
    F: FnOnce(&Payload) -> HandlerResult,
  {
    let (job, dispatch_id) =
      match self.begin_running(user_id, job_id, IN_PROCESS_EXECUTOR_NAME, |_| new_dispatch_id())? {
        Admission::Started(job, dispatch_id) => (job, dispatch_id),
        Admission::Refused(job) => return Ok(job),
      };

    let outcome = executor::run_guarded(&job, &dispatch_id, runner);
    match self.complete(user_id, job_id, &dispatch_id, outcome)? {
      Some(job) => Ok(job),
      None => self.get_job(user_id, job_id),
    }
  }

  /// Validation, admission and the `running` stamp, under the transition lock.
  fn begin_running<R>(
    &self,
    user_id: &str,
    job_id: JobId,
    executor_name: &str,
    reserve: R,
  ) -> Result<Admission, OrchestratorError>
  where
    R: FnOnce(&Job) -> DispatchId,
  {
    let _guard = self.inner.transitions.lock();
    // Invalid transitions are reported before admission is even considered.
    let mut job = self.load_for_transition(user_id, job_id, JobStatus::Running)?;
    let now = Utc::now();

    let limit = self.inner.limits.limit_for(&job.task_type);
    let running = self.inner.repository.count_running(&job.task_type)?;
    if running >= limit {
      let message = format!(
        "{} running '{}' job(s) already at the concurrency limit of {}; retry later",
        running, job.task_type, limit
      );
      warn!(%job_id, task_type = %job.task_type, running, limit, "Admission refused.");
      job.annotate_refusal(message, now);
      self.inner.repository.save(&job)?;
      self.inner.metrics.refused.fetch_add(1, Ordering::Relaxed);
      return Ok(Admission::Refused(job));
    }

    let dispatch_id = reserve(&job);
    job.mark_running(executor_name, dispatch_id.clone(), now);
    self.inner.repository.save(&job)?;
    self.inner.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
    debug!(%job_id, %executor_name, %dispatch_id, "Job running.");
    Ok(Admission::Started(job, dispatch_id))
  }

  fn completion_callback(&self, job: &Job, dispatch_id: DispatchId) -> CompletionCallback {
    let service = self.clone();
    let user_id = job.user_id.clone();
    let job_id = job.id;
    Box::new(move |outcome: HandlerResult| {
      if let Err(e) = service.complete(&user_id, job_id, &dispatch_id, outcome) {
        error!(%job_id, %dispatch_id, error = %e, "Failed to record job completion.");
      }
    })
  }

  /// Guarded finalize: only a job still `running` under the same dispatch id
  /// is finalized. Anything else (a second callback, a job recovered or
  /// finished out-of-band) is logged and ignored.
  fn complete(
    &self,
    user_id: &str,
    job_id: JobId,
    dispatch_id: &str,
    outcome: HandlerResult,
  ) -> Result<Option<Job>, OrchestratorError> {
    let _guard = self.inner.transitions.lock();
    let Some(mut job) = self.inner.repository.get(user_id, job_id)? else {
      warn!(%job_id, "Completion for a job that no longer exists.");
      return Ok(None);
    };
    if job.status != JobStatus::Running || job.dispatch_id.as_deref() != Some(dispatch_id) {
      warn!(
        %job_id,
        %dispatch_id,
        status = %job.status,
        current_dispatch = ?job.dispatch_id,
        "Ignoring stale or duplicate completion."
      );
      return Ok(None);
    }
    self.finish(&mut job, outcome, Utc::now())?;
    Ok(Some(job))
  }

  /// Applies a terminal outcome to a `running` job and persists it.
  fn finish(&self, job: &mut Job, outcome: HandlerResult, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
    match outcome {
      Ok(result) => {
        job.mark_succeeded(result, now);
        self.inner.repository.save(job)?;
        self.inner.metrics.succeeded.fetch_add(1, Ordering::Relaxed);
        debug!(job_id = %job.id, "Job succeeded.");
      }
      Err(ExecutionError::Structured {
        code,
        message,
        result,
      }) => {
        job.mark_failed(&code, &message, result, now);
        self.inner.repository.save(job)?;
        self.inner.metrics.failed.fetch_add(1, Ordering::Relaxed);
        debug!(job_id = %job.id, error_code = %code, "Job failed.");
      }
      Err(ExecutionError::Unexpected(message)) => {
        job.mark_failed(codes::EXECUTION_FAILED, &message, None, now);
        self.inner.repository.save(job)?;
        self.inner.metrics.failed.fetch_add(1, Ordering::Relaxed);
        debug!(job_id = %job.id, error = %message, "Job failed unexpectedly.");
      }
    }
    Ok(())
  }

  /// Loads an owned job and checks the edge against the status graph.
  /// Every transition path goes through here.
  fn load_for_transition(
    &self,
    user_id: &str,
    job_id: JobId,
    to: JobStatus,
  ) -> Result<Job, OrchestratorError> {
    let job = self.get_job(user_id, job_id)?;
    if !job.status.can_transition_to(to) {
      debug!(%job_id, from = %job.status, %to, "Rejected invalid transition.");
      return Err(OrchestratorError::InvalidTransition {
        job_id,
        from: job.status,
        to,
      });
    }
    Ok(job)
  }

  // --- Recovery & Observability ---

  /// Fails every job left `running` with `RUNTIME_RECOVERY`. `queued` jobs are
  /// untouched. Returns the number of recovered jobs, which is also kept for
  /// [`JobService::runtime_status`].
  pub fn recover_running_jobs(&self) -> Result<usize, OrchestratorError> {
    let _guard = self.inner.transitions.lock();
    let stranded = self.inner.repository.list_all(Some(JobStatus::Running))?;
    let now = Utc::now();
    for mut job in stranded.iter().cloned() {
      let message = format!(
        "job was running under executor '{}' when the process stopped; outcome unknown",
        job.executor_name.as_deref().unwrap_or("unknown")
      );
      job.mark_failed(codes::RUNTIME_RECOVERY, &message, job.result.clone(), now);
      self.inner.repository.save(&job)?;
      debug!(job_id = %job.id, user_id = %job.user_id, "Recovered stranded running job.");
    }
    self
      .inner
      .recovered_running_jobs
      .store(stranded.len(), Ordering::Relaxed);
    if stranded.is_empty() {
      debug!("No running jobs to recover.");
    } else {
      warn!(recovered = stranded.len(), "Failed running jobs left by a previous process.");
    }
    Ok(stranded.len())
  }

  /// Executor mode, execution counters, last recovery outcome and system schedule counts.
  pub fn runtime_status(&self) -> RuntimeStatus {
    RuntimeStatus {
      executor: ExecutorStatus {
        mode: self.inner.executor.name().to_string(),
      },
      execution: self.inner.metrics.snapshot(),
      recovery: RecoveryStatus {
        recovered_running_jobs: self.inner.recovered_running_jobs.load(Ordering::Relaxed),
      },
      system_schedules: self
        .inner
        .templates
        .as_ref()
        .map(ScheduleTemplateRegistrar::counts)
        .unwrap_or_default(),
    }
  }
}

fn new_dispatch_id() -> DispatchId {
  Uuid::new_v4().to_string()
}
