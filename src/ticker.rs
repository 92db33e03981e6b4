//! Turns active interval schedules into submitted jobs.

use crate::error::{BuildError, OrchestratorError, ShutdownError};
use crate::schedule::{Schedule, ScheduleId};
use crate::scheduler::Scheduler;
use crate::service::JobService;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Builder for [`ScheduleTicker`].
#[derive(Debug)]
pub struct ScheduleTickerBuilder {
  service: JobService,
  scheduler: Arc<Scheduler>,
  poll_interval: Duration,
  dispatch: bool,
}

impl ScheduleTickerBuilder {
  /// How often the spawned loop checks for due schedules. Default 1s.
  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval.max(Duration::from_millis(1));
    self
  }

  /// Whether fired jobs are dispatched immediately (default: only submitted).
  pub fn dispatch(mut self, enabled: bool) -> Self {
    self.dispatch = enabled;
    self
  }

  pub fn build(self) -> ScheduleTicker {
    ScheduleTicker {
      service: self.service,
      scheduler: self.scheduler,
      poll_interval: self.poll_interval,
      dispatch: self.dispatch,
      next_due: Mutex::new(HashMap::new()),
    }
  }
}

/// Fires each active schedule every `every_seconds`, starting one interval
/// after its `created_at`.
///
/// Each fire submits a job of the schedule's `job_type` for the schedule's
/// owner, with idempotency key `schedule:<id>:<due unix seconds>`, so the same
/// due time can never enqueue twice.
#[derive(Debug)]
pub struct ScheduleTicker {
  service: JobService,
  scheduler: Arc<Scheduler>,
  poll_interval: Duration,
  dispatch: bool,
  next_due: Mutex<HashMap<ScheduleId, DateTime<Utc>>>,
}

impl ScheduleTicker {
  pub fn builder(service: JobService, scheduler: Arc<Scheduler>) -> ScheduleTickerBuilder {
    ScheduleTickerBuilder {
      service,
      scheduler,
      poll_interval: DEFAULT_POLL_INTERVAL,
      dispatch: false,
    }
  }

  /// Idempotency key used for the fire of `schedule_id` due at `due`.
  pub fn fire_key(schedule_id: ScheduleId, due: DateTime<Utc>) -> String {
    format!("schedule:{}:{}", schedule_id, due.timestamp())
  }

  /// Runs one pass as of `now` and returns the number of jobs submitted.
  pub fn tick_at(&self, now: DateTime<Utc>) -> usize {
    let schedules = self.scheduler.active_schedules();
    let fires = self.collect_due(&schedules, now);

    let mut submitted = 0;
    for (schedule, due) in fires {
      if self.fire(schedule, due) {
        submitted += 1;
      }
    }
    if submitted > 0 {
      debug!(submitted, "Ticker pass submitted scheduled jobs.");
    }
    submitted
  }

  /// Decides which schedules are due and advances their next fire time past `now`.
  fn collect_due<'a>(
    &self,
    schedules: &'a [Schedule],
    now: DateTime<Utc>,
  ) -> Vec<(&'a Schedule, DateTime<Utc>)> {
    let mut next_due = self.next_due.lock();
    // Stopped (or unknown) schedules drop out of the fire table.
    next_due.retain(|id, _| schedules.iter().any(|s| s.id == *id));

    let mut fires = Vec::new();
    for schedule in schedules {
      let due = match next_due.get(&schedule.id) {
        Some(due) => *due,
        None => match first_due(schedule.created_at, now, schedule.every_seconds) {
          Some(first) => first,
          None => {
            warn!(schedule_id = %schedule.id, every_seconds = schedule.every_seconds, "Cannot compute first fire time; schedule skipped.");
            continue;
          }
        },
      };
      if due > now {
        next_due.insert(schedule.id, due);
        continue;
      }
      fires.push((schedule, due));
      match advance_past(due, now, schedule.every_seconds) {
        Some(next) => {
          next_due.insert(schedule.id, next);
        }
        None => {
          warn!(schedule_id = %schedule.id, "Next fire time overflowed; schedule parked.");
          next_due.insert(schedule.id, DateTime::<Utc>::MAX_UTC);
        }
      }
    }
    fires
  }

  fn fire(&self, schedule: &Schedule, due: DateTime<Utc>) -> bool {
    if let Some(task_type) = self.service.task_types().resolve(&schedule.job_type) {
      if !task_type.schedulable {
        warn!(schedule_id = %schedule.id, job_type = %schedule.job_type, "Task type is not schedulable; skipping fire.");
        return false;
      }
    }

    let payload = json!({
      "scheduleId": schedule.id,
      "namespace": schedule.namespace,
      "firedAt": due.to_rfc3339(),
    });
    let key = Self::fire_key(schedule.id, due);

    let job = match self
      .service
      .submit_job(&schedule.user_id, &schedule.job_type, payload, Some(&key))
    {
      Ok(job) => job,
      Err(OrchestratorError::IdempotencyConflict { .. }) => {
        debug!(schedule_id = %schedule.id, %key, "Fire already submitted.");
        return false;
      }
      Err(e) => {
        warn!(schedule_id = %schedule.id, job_type = %schedule.job_type, error = %e, "Failed to submit scheduled job.");
        return false;
      }
    };
    info!(schedule_id = %schedule.id, job_id = %job.id, job_type = %job.task_type, "Scheduled job submitted.");

    if self.dispatch {
      match self.service.dispatch_job(&job.user_id, job.id) {
        Ok(dispatched) => {
          debug!(job_id = %dispatched.id, status = %dispatched.status, "Scheduled job dispatched.")
        }
        Err(e) => warn!(job_id = %job.id, error = %e, "Failed to dispatch scheduled job."),
      }
    }
    true
  }

  /// Starts the polling loop on the current tokio runtime.
  ///
  /// Each pass runs on the blocking pool since service calls are synchronous.
  ///
  /// # Errors
  ///
  /// Returns [`BuildError::NoRuntime`] outside a tokio runtime.
  pub fn spawn(self) -> Result<TickerHandle, BuildError> {
    let runtime = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let poll_interval = self.poll_interval;
    let ticker = Arc::new(self);

    let task = runtime.spawn(async move {
      info!(?poll_interval, "Schedule ticker started.");
      let mut interval = tokio::time::interval(poll_interval);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          biased;

          changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
              break;
            }
          }

          _ = interval.tick() => {
            let pass = ticker.clone();
            match tokio::task::spawn_blocking(move || pass.tick_at(Utc::now())).await {
              Ok(_) => {}
              Err(e) if e.is_panic() => error!("Ticker pass panicked: {:?}", e),
              Err(e) => warn!("Ticker pass did not complete: {:?}", e),
            }
          }
        }
      }
      info!("Schedule ticker stopped.");
    });

    Ok(TickerHandle {
      shutdown_tx,
      task: Mutex::new(Some(task)),
    })
  }
}

/// Due time adopted for a schedule the ticker has not tracked yet: the latest
/// `created_at + k * every` at or before `now`, or the first interval when none
/// has elapsed. A restarted ticker thus fires the most recent missed interval
/// instead of replaying the first one.
fn first_due(created_at: DateTime<Utc>, now: DateTime<Utc>, every_seconds: u64) -> Option<DateTime<Utc>> {
  let step = i64::try_from(every_seconds).ok().filter(|s| *s > 0)?;
  let steps = ((now - created_at).num_seconds() / step).max(1);
  created_at.checked_add_signed(ChronoDuration::seconds(steps.checked_mul(step)?))
}

/// First due time strictly after `now`, stepping from `due` in whole intervals.
/// Missed intervals are skipped rather than replayed.
fn advance_past(due: DateTime<Utc>, now: DateTime<Utc>, every_seconds: u64) -> Option<DateTime<Utc>> {
  let step = i64::try_from(every_seconds).ok().filter(|s| *s > 0)?;
  let behind = (now - due).num_seconds().max(0);
  let steps = behind / step + 1;
  due.checked_add_signed(ChronoDuration::seconds(steps.checked_mul(step)?))
}

/// Handle to a spawned [`ScheduleTicker`] loop.
#[derive(Debug)]
pub struct TickerHandle {
  shutdown_tx: watch::Sender<bool>,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl TickerHandle {
  /// Signals the loop to stop and waits for it, up to `timeout` if given.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::AlreadyShutDown`] on a second call.
  /// - [`ShutdownError::SignalFailed`] if the loop already exited.
  /// - [`ShutdownError::Timeout`] / [`ShutdownError::TaskPanic`].
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let task = self
      .task
      .lock()
      .take()
      .ok_or(ShutdownError::AlreadyShutDown)?;
    info!("Stopping schedule ticker...");
    self
      .shutdown_tx
      .send(true)
      .map_err(|_| ShutdownError::SignalFailed)?;

    let joined = match timeout {
      Some(limit) => match tokio::time::timeout(limit, task).await {
        Ok(joined) => joined,
        Err(_) => {
          error!("Ticker shutdown timed out after {:?}", limit);
          return Err(ShutdownError::Timeout);
        }
      },
      None => task.await,
    };
    joined.map_err(|e| {
      error!("Ticker task panicked: {:?}", e);
      ShutdownError::TaskPanic
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn advance_skips_missed_intervals() {
    let due = Utc::now();
    let now = due + ChronoDuration::seconds(250);
    assert_eq!(advance_past(due, now, 100), Some(due + ChronoDuration::seconds(300)));
    assert_eq!(advance_past(due, due, 100), Some(due + ChronoDuration::seconds(100)));
  }

  #[test]
  fn first_due_picks_latest_elapsed_interval() {
    let created = Utc::now();
    let at = |secs| created + ChronoDuration::seconds(secs);
    assert_eq!(first_due(created, at(5), 10), Some(at(10)));
    assert_eq!(first_due(created, at(10), 10), Some(at(10)));
    assert_eq!(first_due(created, at(55), 10), Some(at(50)));
    assert_eq!(first_due(created, created - ChronoDuration::seconds(30), 10), Some(at(10)));
    assert_eq!(first_due(created, at(55), 0), None);
  }
}
