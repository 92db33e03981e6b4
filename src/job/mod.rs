#[cfg(feature = "job_context")]
pub mod context;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Public Type Aliases ---

/// Type alias for the unique identifier of a job. Uses UUID v4.
pub type JobId = Uuid;

/// Opaque handle returned by an executor when a job is submitted to it.
pub type DispatchId = String;

/// Schema-less structured data. Only handlers interpret payloads and results.
pub type Payload = serde_json::Value;

/// Well-known values for [`Job::error_code`].
pub mod codes {
  /// Admission refused; the job stays `queued`.
  pub const CONCURRENCY_LIMIT_EXCEEDED: &str = "CONCURRENCY_LIMIT_EXCEEDED";
  /// The job was `running` when the process restarted; outcome unknown.
  pub const RUNTIME_RECOVERY: &str = "RUNTIME_RECOVERY";
  /// A handler failed without declaring a structured failure.
  pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";
  /// No handler is registered for the job's task type.
  pub const HANDLER_NOT_FOUND: &str = "HANDLER_NOT_FOUND";
}

// --- Status ---

/// Lifecycle state of a [`Job`].
///
/// ```text
/// queued ──► running ──► succeeded
///   │           └──────► failed
///   └──────► cancelled
/// ```
///
/// Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Queued,
  Running,
  Succeeded,
  Failed,
  Cancelled,
}

impl JobStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Queued => "queued",
      JobStatus::Running => "running",
      JobStatus::Succeeded => "succeeded",
      JobStatus::Failed => "failed",
      JobStatus::Cancelled => "cancelled",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "queued" => Some(JobStatus::Queued),
      "running" => Some(JobStatus::Running),
      "succeeded" => Some(JobStatus::Succeeded),
      "failed" => Some(JobStatus::Failed),
      "cancelled" => Some(JobStatus::Cancelled),
      _ => None,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
    )
  }

  /// The single source of truth for legal edges, shared by every call path.
  pub fn can_transition_to(&self, next: JobStatus) -> bool {
    matches!(
      (self, next),
      (JobStatus::Queued, JobStatus::Running)
        | (JobStatus::Queued, JobStatus::Cancelled)
        | (JobStatus::Running, JobStatus::Succeeded)
        | (JobStatus::Running, JobStatus::Failed)
    )
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// --- Core Job Structure ---

/// A unit of asynchronous work, scoped to its owning user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
  pub id: JobId,
  pub user_id: String,
  /// Canonical task type name (aliases are resolved at submission).
  pub task_type: String,
  pub payload: Payload,
  pub idempotency_key: Option<String>,
  pub status: JobStatus,
  /// Present for `succeeded`, and for `failed` when a partial result was reported.
  pub result: Option<Payload>,
  /// Present for `failed`, and transiently on `queued` jobs refused by admission control.
  pub error_code: Option<String>,
  pub error_message: Option<String>,
  // --- Dispatch stamp (set together on queued -> running) ---
  pub executor_name: Option<String>,
  pub dispatch_id: Option<DispatchId>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Job {
  /// Creates a fresh `queued` job with `created_at == updated_at`.
  pub(crate) fn queued(
    user_id: &str,
    task_type: &str,
    payload: Payload,
    idempotency_key: Option<&str>,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      id: Uuid::new_v4(),
      user_id: user_id.to_string(),
      task_type: task_type.to_string(),
      payload,
      idempotency_key: idempotency_key.map(str::to_string),
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

  /// Records an admission refusal. Status is left untouched.
  pub(crate) fn annotate_refusal(&mut self, message: String, now: DateTime<Utc>) {
    self.error_code = Some(codes::CONCURRENCY_LIMIT_EXCEEDED.to_string());
    self.error_message = Some(message);
    self.updated_at = now;
  }

  /// Stamps the dispatch triple. Callers must have validated the transition.
  pub(crate) fn mark_running(
    &mut self,
    executor_name: &str,
    dispatch_id: DispatchId,
    now: DateTime<Utc>,
  ) {
    self.status = JobStatus::Running;
    self.executor_name = Some(executor_name.to_string());
    self.dispatch_id = Some(dispatch_id);
    self.started_at = Some(now);
    // A previous admission refusal no longer applies.
    self.error_code = None;
    self.error_message = None;
    self.updated_at = now;
  }

  pub(crate) fn mark_succeeded(&mut self, result: Payload, now: DateTime<Utc>) {
    self.status = JobStatus::Succeeded;
    self.result = Some(result);
    self.finished_at = Some(now);
    self.updated_at = now;
  }

  pub(crate) fn mark_failed(
    &mut self,
    code: &str,
    message: &str,
    result: Option<Payload>,
    now: DateTime<Utc>,
  ) {
    self.status = JobStatus::Failed;
    self.error_code = Some(code.to_string());
    self.error_message = Some(message.to_string());
    self.result = result;
    self.finished_at = Some(now);
    self.updated_at = now;
  }

  pub(crate) fn mark_cancelled(&mut self, now: DateTime<Utc>) {
    self.status = JobStatus::Cancelled;
    self.finished_at = Some(now);
    self.updated_at = now;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const ALL: [JobStatus; 5] = [
    JobStatus::Queued,
    JobStatus::Running,
    JobStatus::Succeeded,
    JobStatus::Failed,
    JobStatus::Cancelled,
  ];

  #[test]
  fn terminal_states_are_absorbing() {
    for from in ALL.iter().filter(|s| s.is_terminal()) {
      for to in ALL {
        assert!(!from.can_transition_to(to), "{} -> {} must be illegal", from, to);
      }
    }
  }

  #[test]
  fn only_four_edges_exist() {
    let legal: Vec<_> = ALL
      .iter()
      .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
      .filter(|(from, to)| from.can_transition_to(*to))
      .collect();
    assert_eq!(legal.len(), 4);
    assert!(!JobStatus::Running.can_transition_to(JobStatus::Cancelled));
    assert!(!JobStatus::Queued.can_transition_to(JobStatus::Succeeded));
  }

  #[test]
  fn status_strings_round_trip() {
    for status in ALL {
      assert_eq!(JobStatus::parse(status.as_str()), Some(status));
    }
    assert_eq!(JobStatus::parse("paused"), None);
  }

  #[test]
  fn running_clears_refusal_annotation() {
    let now = Utc::now();
    let mut job = Job::queued("u-1", "backtest_run", serde_json::json!({}), None, now);
    job.annotate_refusal("busy".to_string(), now);
    assert_eq!(job.error_code.as_deref(), Some(codes::CONCURRENCY_LIMIT_EXCEEDED));
    job.mark_running("inprocess", "d-1".to_string(), now);
    assert!(job.error_code.is_none());
    assert!(job.error_message.is_none());
    assert_eq!(job.dispatch_id.as_deref(), Some("d-1"));
  }
}
