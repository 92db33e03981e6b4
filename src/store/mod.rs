//! Persistence contracts and their backends.
//!
//! The orchestrator only talks to [`JobRepository`] and [`ScheduleStore`];
//! which backend sits behind them is decided by configuration.

pub mod memory;
pub mod sqlite;

use crate::error::StoreError;
use crate::job::{Job, JobId, JobStatus};
use crate::schedule::{Schedule, ScheduleId};

pub use memory::{InMemoryJobRepository, InMemoryScheduleStore};
pub use sqlite::{SqliteJobRepository, SqliteScheduleStore};

/// Durable store for [`Job`] records.
pub trait JobRepository: Send + Sync {
  /// Inserts or replaces the job with the same id.
  fn save(&self, job: &Job) -> Result<(), StoreError>;

  /// Inserts the job only if neither its id nor its `(user_id, idempotency_key)`
  /// pair is already present. Returns `true` if the row was inserted.
  ///
  /// This is the primitive that makes idempotent submission race-free.
  fn save_if_absent(&self, job: &Job) -> Result<bool, StoreError>;

  /// Point lookup scoped to the owning user.
  fn get(&self, user_id: &str, job_id: JobId) -> Result<Option<Job>, StoreError>;

  /// Lists a user's jobs, oldest first, optionally filtered.
  fn list(
    &self,
    user_id: &str,
    task_type: Option<&str>,
    status: Option<JobStatus>,
  ) -> Result<Vec<Job>, StoreError>;

  /// Unscoped scan across all users. Used by recovery and admission control.
  fn list_all(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError>;

  fn find_by_idempotency_key(&self, user_id: &str, key: &str) -> Result<Option<Job>, StoreError>;

  /// Number of `running` jobs of `task_type` across all users.
  fn count_running(&self, task_type: &str) -> Result<usize, StoreError> {
    Ok(
      self
        .list_all(Some(JobStatus::Running))?
        .iter()
        .filter(|job| job.task_type == task_type)
        .count(),
    )
  }
}

/// Durable store for [`Schedule`] rows.
pub trait ScheduleStore: Send + Sync {
  /// Inserts or replaces the schedule with the same id.
  fn save(&self, schedule: &Schedule) -> Result<(), StoreError>;

  fn get(&self, schedule_id: ScheduleId) -> Result<Option<Schedule>, StoreError>;

  fn list(&self, user_id: &str, namespace: &str) -> Result<Vec<Schedule>, StoreError>;

  /// Full scan, used by [`Scheduler::recover`](crate::Scheduler::recover).
  fn list_all(&self) -> Result<Vec<Schedule>, StoreError>;
}
