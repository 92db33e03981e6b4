use crate::error::{ScheduleError, StoreError};
use crate::schedule::{namespace_permits, Schedule, ScheduleId, ScheduleStatus};
use crate::store::{InMemoryScheduleStore, ScheduleStore, SqliteScheduleStore};

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Persisted registry of recurring interval schedules.
///
/// Every mutation is written through to the backing [`ScheduleStore`] before
/// the in-memory live view is updated, so the store stays the source of truth.
/// A scheduler backed by durable storage must call [`Scheduler::recover`] after
/// construction to pick up schedules registered by a previous process.
///
/// # Example
///
/// ```no_run
/// use jobkeeper::Scheduler;
///
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = Scheduler::sqlite("/var/lib/jobs/schedules.db")?;
/// let recovered = scheduler.recover()?;
/// println!("recovered {} schedules", recovered);
/// # Ok(())
/// # }
/// ```
pub struct Scheduler {
  store: Arc<dyn ScheduleStore>,
  live: RwLock<HashMap<ScheduleId, Schedule>>,
}

impl fmt::Debug for Scheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Scheduler")
      .field("live_schedules", &self.live.read().len())
      .finish_non_exhaustive()
  }
}

impl Scheduler {
  pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
    Self {
      store,
      live: RwLock::new(HashMap::new()),
    }
  }

  /// A process-local scheduler. Nothing survives a restart.
  pub fn in_memory() -> Self {
    Self::new(Arc::new(InMemoryScheduleStore::new()))
  }

  /// A scheduler backed by an SQLite file. Call [`Scheduler::recover`] next.
  pub fn sqlite(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    Ok(Self::new(Arc::new(SqliteScheduleStore::open(path)?)))
  }

  // --- Registration ---

  /// Registers a new active interval schedule and returns it.
  ///
  /// # Errors
  ///
  /// - [`ScheduleError::InvalidInterval`] if `every_seconds` is zero.
  /// - [`ScheduleError::NamespaceForbidden`] if `user_id` does not own `namespace`.
  pub fn register_interval(
    &self,
    user_id: &str,
    namespace: &str,
    job_type: &str,
    every_seconds: u64,
  ) -> Result<Schedule, ScheduleError> {
    validate_registration(user_id, namespace, every_seconds)?;
    let mut live = self.live.write();
    let schedule = Schedule::new(user_id, namespace, job_type, every_seconds, Utc::now());
    self.store.save(&schedule)?;
    live.insert(schedule.id, schedule.clone());
    info!(schedule_id = %schedule.id, %namespace, %job_type, every_seconds, "Registered interval schedule.");
    Ok(schedule)
  }

  /// Like [`Scheduler::register_interval`], but returns the existing row when
  /// `namespace` already holds a schedule for `job_type` (active or stopped).
  ///
  /// The boolean is `true` when a new row was created.
  pub fn ensure_interval(
    &self,
    user_id: &str,
    namespace: &str,
    job_type: &str,
    every_seconds: u64,
  ) -> Result<(Schedule, bool), ScheduleError> {
    validate_registration(user_id, namespace, every_seconds)?;
    // The write guard serializes the lookup and the insert.
    let mut live = self.live.write();

    let existing = match live
      .values()
      .find(|s| s.namespace == namespace && s.job_type == job_type)
    {
      Some(found) => Some(found.clone()),
      None => self
        .store
        .list(user_id, namespace)?
        .into_iter()
        .find(|s| s.job_type == job_type),
    };

    if let Some(schedule) = existing {
      debug!(schedule_id = %schedule.id, %namespace, %job_type, "Schedule already registered.");
      live.entry(schedule.id).or_insert_with(|| schedule.clone());
      return Ok((schedule, false));
    }

    let schedule = Schedule::new(user_id, namespace, job_type, every_seconds, Utc::now());
    self.store.save(&schedule)?;
    live.insert(schedule.id, schedule.clone());
    info!(schedule_id = %schedule.id, %namespace, %job_type, every_seconds, "Registered interval schedule.");
    Ok((schedule, true))
  }

  // --- Queries ---

  /// Lists the schedules `user_id` owns in `namespace`, oldest first.
  pub fn list_schedules(&self, user_id: &str, namespace: &str) -> Result<Vec<Schedule>, ScheduleError> {
    if !namespace_permits(user_id, namespace) {
      return Err(ScheduleError::NamespaceForbidden {
        user_id: user_id.to_string(),
        namespace: namespace.to_string(),
      });
    }
    Ok(self.store.list(user_id, namespace)?)
  }

  /// Unscoped lookup by id.
  pub fn get(&self, schedule_id: ScheduleId) -> Result<Schedule, ScheduleError> {
    if let Some(schedule) = self.live.read().get(&schedule_id) {
      return Ok(schedule.clone());
    }
    self
      .store
      .get(schedule_id)?
      .ok_or(ScheduleError::NotFound(schedule_id))
  }

  /// Lookup scoped to the owning namespace. A schedule that exists elsewhere
  /// is reported as not found.
  pub fn get_in_namespace(
    &self,
    user_id: &str,
    namespace: &str,
    schedule_id: ScheduleId,
  ) -> Result<Schedule, ScheduleError> {
    let schedule = self.get(schedule_id)?;
    if schedule.namespace != namespace
      || schedule.user_id != user_id
      || !namespace_permits(user_id, namespace)
    {
      debug!(%schedule_id, %user_id, %namespace, "Schedule requested outside its namespace.");
      return Err(ScheduleError::NotFound(schedule_id));
    }
    Ok(schedule)
  }

  /// Active schedules in the live view, oldest first.
  pub fn active_schedules(&self) -> Vec<Schedule> {
    let mut rows: Vec<Schedule> = self
      .live
      .read()
      .values()
      .filter(|s| s.is_active())
      .cloned()
      .collect();
    rows.sort_by_key(|s| (s.created_at, s.id));
    rows
  }

  /// Every schedule in the live view for `namespace`, regardless of owner or status.
  pub fn namespace_snapshot(&self, namespace: &str) -> Vec<Schedule> {
    let mut rows: Vec<Schedule> = self
      .live
      .read()
      .values()
      .filter(|s| s.namespace == namespace)
      .cloned()
      .collect();
    rows.sort_by_key(|s| (s.created_at, s.id));
    rows
  }

  // --- Lifecycle ---

  /// Marks a schedule `stopped`. Rows are never deleted. Stopping an already
  /// stopped schedule returns it unchanged.
  pub fn stop(&self, schedule_id: ScheduleId) -> Result<Schedule, ScheduleError> {
    let mut live = self.live.write();
    let mut schedule = match live.get(&schedule_id) {
      Some(found) => found.clone(),
      None => self
        .store
        .get(schedule_id)?
        .ok_or(ScheduleError::NotFound(schedule_id))?,
    };
    if schedule.status == ScheduleStatus::Stopped {
      debug!(%schedule_id, "Schedule already stopped.");
      return Ok(schedule);
    }
    schedule.status = ScheduleStatus::Stopped;
    self.store.save(&schedule)?;
    live.insert(schedule_id, schedule.clone());
    info!(%schedule_id, job_type = %schedule.job_type, "Stopped schedule.");
    Ok(schedule)
  }

  /// [`Scheduler::stop`] restricted to the owning namespace.
  pub fn stop_in_namespace(
    &self,
    user_id: &str,
    namespace: &str,
    schedule_id: ScheduleId,
  ) -> Result<Schedule, ScheduleError> {
    self.get_in_namespace(user_id, namespace, schedule_id)?;
    self.stop(schedule_id)
  }

  /// Rebuilds the live view from every persisted row and returns the number
  /// of schedules recovered (active and stopped).
  pub fn recover(&self) -> Result<usize, ScheduleError> {
    let rows = self.store.list_all()?;
    let mut live = self.live.write();
    live.clear();
    for schedule in rows {
      live.insert(schedule.id, schedule);
    }
    let active = live.values().filter(|s| s.is_active()).count();
    info!(recovered = live.len(), active, "Recovered persisted schedules.");
    Ok(live.len())
  }
}

fn validate_registration(user_id: &str, namespace: &str, every_seconds: u64) -> Result<(), ScheduleError> {
  if every_seconds == 0 {
    warn!(%namespace, "Rejected schedule with zero interval.");
    return Err(ScheduleError::InvalidInterval(every_seconds));
  }
  if !namespace_permits(user_id, namespace) {
    warn!(%user_id, %namespace, "Rejected schedule outside the caller's namespace.");
    return Err(ScheduleError::NamespaceForbidden {
      user_id: user_id.to_string(),
      namespace: namespace.to_string(),
    });
  }
  Ok(())
}
