use std::collections::HashMap;

use parking_lot::RwLock;

use super::{JobRepository, ScheduleStore};
use crate::error::StoreError;
use crate::job::{Job, JobId, JobStatus};
use crate::schedule::{Schedule, ScheduleId};

/// Process-local job repository. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
  jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobRepository {
  pub fn new() -> Self {
    Self::default()
  }
}

fn oldest_first(mut jobs: Vec<Job>) -> Vec<Job> {
  jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
  jobs
}

impl JobRepository for InMemoryJobRepository {
  fn save(&self, job: &Job) -> Result<(), StoreError> {
    self.jobs.write().insert(job.id, job.clone());
    Ok(())
  }

  fn save_if_absent(&self, job: &Job) -> Result<bool, StoreError> {
    // Check and insert under one write guard.
    let mut jobs = self.jobs.write();
    if jobs.contains_key(&job.id) {
      return Ok(false);
    }
    if let Some(key) = job.idempotency_key.as_deref() {
      let taken = jobs
        .values()
        .any(|j| j.user_id == job.user_id && j.idempotency_key.as_deref() == Some(key));
      if taken {
        return Ok(false);
      }
    }
    jobs.insert(job.id, job.clone());
    Ok(true)
  }

  fn get(&self, user_id: &str, job_id: JobId) -> Result<Option<Job>, StoreError> {
    Ok(
      self
        .jobs
        .read()
        .get(&job_id)
        .filter(|job| job.user_id == user_id)
        .cloned(),
    )
  }

  fn list(
    &self,
    user_id: &str,
    task_type: Option<&str>,
    status: Option<JobStatus>,
  ) -> Result<Vec<Job>, StoreError> {
    let jobs = self
      .jobs
      .read()
      .values()
      .filter(|job| job.user_id == user_id)
      .filter(|job| task_type.map_or(true, |t| job.task_type == t))
      .filter(|job| status.map_or(true, |s| job.status == s))
      .cloned()
      .collect();
    Ok(oldest_first(jobs))
  }

  fn list_all(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
    let jobs = self
      .jobs
      .read()
      .values()
      .filter(|job| status.map_or(true, |s| job.status == s))
      .cloned()
      .collect();
    Ok(oldest_first(jobs))
  }

  fn find_by_idempotency_key(&self, user_id: &str, key: &str) -> Result<Option<Job>, StoreError> {
    Ok(
      self
        .jobs
        .read()
        .values()
        .find(|job| job.user_id == user_id && job.idempotency_key.as_deref() == Some(key))
        .cloned(),
    )
  }

  fn count_running(&self, task_type: &str) -> Result<usize, StoreError> {
    Ok(
      self
        .jobs
        .read()
        .values()
        .filter(|job| job.status == JobStatus::Running && job.task_type == task_type)
        .count(),
    )
  }
}

/// Process-local schedule store.
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
  schedules: RwLock<HashMap<ScheduleId, Schedule>>,
}

impl InMemoryScheduleStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl ScheduleStore for InMemoryScheduleStore {
  fn save(&self, schedule: &Schedule) -> Result<(), StoreError> {
    self.schedules.write().insert(schedule.id, schedule.clone());
    Ok(())
  }

  fn get(&self, schedule_id: ScheduleId) -> Result<Option<Schedule>, StoreError> {
    Ok(self.schedules.read().get(&schedule_id).cloned())
  }

  fn list(&self, user_id: &str, namespace: &str) -> Result<Vec<Schedule>, StoreError> {
    let mut rows: Vec<Schedule> = self
      .schedules
      .read()
      .values()
      .filter(|s| s.user_id == user_id && s.namespace == namespace)
      .cloned()
      .collect();
    rows.sort_by_key(|s| (s.created_at, s.id));
    Ok(rows)
  }

  fn list_all(&self) -> Result<Vec<Schedule>, StoreError> {
    let mut rows: Vec<Schedule> = self.schedules.read().values().cloned().collect();
    rows.sort_by_key(|s| (s.created_at, s.id));
    Ok(rows)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use serde_json::json;

  #[test]
  fn save_if_absent_rejects_reused_key_per_user() {
    let repo = InMemoryJobRepository::new();
    let now = Utc::now();
    let first = Job::queued("u-1", "backtest_run", json!({}), Some("k-1"), now);
    let second = Job::queued("u-1", "risk_check", json!({}), Some("k-1"), now);
    let other_user = Job::queued("u-2", "backtest_run", json!({}), Some("k-1"), now);

    assert!(repo.save_if_absent(&first).unwrap());
    assert!(!repo.save_if_absent(&second).unwrap());
    assert!(repo.save_if_absent(&other_user).unwrap());
    assert!(!repo.save_if_absent(&first).unwrap(), "same id must not insert twice");
  }

  #[test]
  fn get_is_scoped_to_owner() {
    let repo = InMemoryJobRepository::new();
    let job = Job::queued("u-1", "backtest_run", json!({}), None, Utc::now());
    repo.save(&job).unwrap();
    assert!(repo.get("u-1", job.id).unwrap().is_some());
    assert!(repo.get("u-2", job.id).unwrap().is_none());
  }
}
