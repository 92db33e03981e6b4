//! SQLite-backed stores. Both open their own connection, so a job repository
//! and a schedule store may share one database file.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use super::{JobRepository, ScheduleStore};
use crate::error::StoreError;
use crate::job::{Job, JobId, JobStatus};
use crate::schedule::{Schedule, ScheduleId, ScheduleStatus};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, user_id, task_type, payload, idempotency_key, status, result, \
  error_code, error_message, executor_name, dispatch_id, started_at, finished_at, created_at, updated_at";

const SCHEDULE_COLUMNS: &str = "id, user_id, namespace, job_type, every_seconds, status, created_at";

// --- Connection helpers ---

fn open_file(path: &Path) -> Result<Connection, StoreError> {
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() {
      std::fs::create_dir_all(parent)?;
    }
  }
  let conn = Connection::open(path)?;
  // WAL so a job repository and schedule store can share the file.
  let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
  conn.busy_timeout(BUSY_TIMEOUT)?;
  debug!(path = %path.display(), journal_mode = %mode, "Opened SQLite store.");
  Ok(conn)
}

fn format_ts(ts: &DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(raw)
    .map(|ts| ts.with_timezone(&Utc))
    .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
  raw.as_deref().map(parse_ts).transpose()
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
  Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("id '{}': {}", raw, e)))
}

// --- Jobs ---

/// Raw column values, converted to a [`Job`] outside the rusqlite row callback.
struct JobRow {
  id: String,
  user_id: String,
  task_type: String,
  payload: String,
  idempotency_key: Option<String>,
  status: String,
  result: Option<String>,
  error_code: Option<String>,
  error_message: Option<String>,
  executor_name: Option<String>,
  dispatch_id: Option<String>,
  started_at: Option<String>,
  finished_at: Option<String>,
  created_at: String,
  updated_at: String,
}

impl JobRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      user_id: row.get(1)?,
      task_type: row.get(2)?,
      payload: row.get(3)?,
      idempotency_key: row.get(4)?,
      status: row.get(5)?,
      result: row.get(6)?,
      error_code: row.get(7)?,
      error_message: row.get(8)?,
      executor_name: row.get(9)?,
      dispatch_id: row.get(10)?,
      started_at: row.get(11)?,
      finished_at: row.get(12)?,
      created_at: row.get(13)?,
      updated_at: row.get(14)?,
    })
  }

  fn into_job(self) -> Result<Job, StoreError> {
    let status = JobStatus::parse(&self.status)
      .ok_or_else(|| StoreError::Corrupt(format!("job status '{}'", self.status)))?;
    Ok(Job {
      id: parse_uuid(&self.id)?,
      user_id: self.user_id,
      task_type: self.task_type,
      payload: serde_json::from_str(&self.payload)?,
      idempotency_key: self.idempotency_key,
      status,
      result: self.result.as_deref().map(serde_json::from_str).transpose()?,
      error_code: self.error_code,
      error_message: self.error_message,
      executor_name: self.executor_name,
      dispatch_id: self.dispatch_id,
      started_at: parse_opt_ts(self.started_at)?,
      finished_at: parse_opt_ts(self.finished_at)?,
      created_at: parse_ts(&self.created_at)?,
      updated_at: parse_ts(&self.updated_at)?,
    })
  }
}

/// Column values in `JOB_COLUMNS` order.
fn job_values(job: &Job) -> Result<Vec<Option<String>>, StoreError> {
  Ok(vec![
    Some(job.id.to_string()),
    Some(job.user_id.clone()),
    Some(job.task_type.clone()),
    Some(serde_json::to_string(&job.payload)?),
    job.idempotency_key.clone(),
    Some(job.status.as_str().to_string()),
    job.result.as_ref().map(serde_json::to_string).transpose()?,
    job.error_code.clone(),
    job.error_message.clone(),
    job.executor_name.clone(),
    job.dispatch_id.clone(),
    job.started_at.as_ref().map(format_ts),
    job.finished_at.as_ref().map(format_ts),
    Some(format_ts(&job.created_at)),
    Some(format_ts(&job.updated_at)),
  ])
}

fn collect_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
  rows.into_iter().map(JobRow::into_job).collect()
}

/// Job repository persisted in SQLite.
///
/// `(user_id, idempotency_key)` is protected by a unique index, and
/// [`JobRepository::save_if_absent`] is an `INSERT OR IGNORE` against it.
pub struct SqliteJobRepository {
  conn: Mutex<Connection>,
}

impl SqliteJobRepository {
  /// Opens (or creates) the repository at `path`.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let conn = open_file(path.as_ref())?;
    Self::init_schema(&conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Opens a private in-memory database (useful for tests).
  pub fn open_in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory()?;
    Self::init_schema(&conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
      "CREATE TABLE IF NOT EXISTS jobs (
          id              TEXT PRIMARY KEY,
          user_id         TEXT NOT NULL,
          task_type       TEXT NOT NULL,
          payload         TEXT NOT NULL,
          idempotency_key TEXT,
          status          TEXT NOT NULL,
          result          TEXT,
          error_code      TEXT,
          error_message   TEXT,
          executor_name   TEXT,
          dispatch_id     TEXT,
          started_at      TEXT,
          finished_at     TEXT,
          created_at      TEXT NOT NULL,
          updated_at      TEXT NOT NULL
      );

      CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_user_idempotency
          ON jobs(user_id, idempotency_key);
      CREATE INDEX IF NOT EXISTS idx_jobs_status_task_type
          ON jobs(status, task_type);
      CREATE INDEX IF NOT EXISTS idx_jobs_user_created
          ON jobs(user_id, created_at);",
    )?;
    Ok(())
  }

  fn query_jobs(&self, sql: &str, args: &[String]) -> Result<Vec<Job>, StoreError> {
    let conn = self.conn.lock();
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
      .query_map(params_from_iter(args.iter()), JobRow::from_row)?
      .collect::<Result<Vec<_>, _>>()?;
    collect_jobs(rows)
  }
}

impl JobRepository for SqliteJobRepository {
  fn save(&self, job: &Job) -> Result<(), StoreError> {
    let values = job_values(job)?;
    let sql = format!(
      "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
       ON CONFLICT(id) DO UPDATE SET
         user_id = excluded.user_id,
         task_type = excluded.task_type,
         payload = excluded.payload,
         idempotency_key = excluded.idempotency_key,
         status = excluded.status,
         result = excluded.result,
         error_code = excluded.error_code,
         error_message = excluded.error_message,
         executor_name = excluded.executor_name,
         dispatch_id = excluded.dispatch_id,
         started_at = excluded.started_at,
         finished_at = excluded.finished_at,
         created_at = excluded.created_at,
         updated_at = excluded.updated_at"
    );
    self
      .conn
      .lock()
      .execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
  }

  fn save_if_absent(&self, job: &Job) -> Result<bool, StoreError> {
    let values = job_values(job)?;
    let sql = format!(
      "INSERT OR IGNORE INTO jobs ({JOB_COLUMNS})
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
    );
    let inserted = self
      .conn
      .lock()
      .execute(&sql, params_from_iter(values.iter()))?;
    Ok(inserted == 1)
  }

  fn get(&self, user_id: &str, job_id: JobId) -> Result<Option<Job>, StoreError> {
    let conn = self.conn.lock();
    let row = conn
      .query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1 AND user_id = ?2"),
        params![job_id.to_string(), user_id],
        JobRow::from_row,
      )
      .optional()?;
    row.map(JobRow::into_job).transpose()
  }

  fn list(
    &self,
    user_id: &str,
    task_type: Option<&str>,
    status: Option<JobStatus>,
  ) -> Result<Vec<Job>, StoreError> {
    let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = ?1");
    let mut args = vec![user_id.to_string()];
    if let Some(task_type) = task_type {
      args.push(task_type.to_string());
      sql.push_str(&format!(" AND task_type = ?{}", args.len()));
    }
    if let Some(status) = status {
      args.push(status.as_str().to_string());
      sql.push_str(&format!(" AND status = ?{}", args.len()));
    }
    sql.push_str(" ORDER BY created_at ASC, id ASC");
    self.query_jobs(&sql, &args)
  }

  fn list_all(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
    match status {
      Some(status) => self.query_jobs(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC"),
        &[status.as_str().to_string()],
      ),
      None => self.query_jobs(
        &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC, id ASC"),
        &[],
      ),
    }
  }

  fn find_by_idempotency_key(&self, user_id: &str, key: &str) -> Result<Option<Job>, StoreError> {
    let conn = self.conn.lock();
    let row = conn
      .query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = ?1 AND idempotency_key = ?2"),
        params![user_id, key],
        JobRow::from_row,
      )
      .optional()?;
    row.map(JobRow::into_job).transpose()
  }

  fn count_running(&self, task_type: &str) -> Result<usize, StoreError> {
    let count: i64 = self.conn.lock().query_row(
      "SELECT COUNT(*) FROM jobs WHERE status = ?1 AND task_type = ?2",
      params![JobStatus::Running.as_str(), task_type],
      |row| row.get(0),
    )?;
    usize::try_from(count).map_err(|_| StoreError::Corrupt(format!("negative count {}", count)))
  }
}

// --- Schedules ---

struct ScheduleRow {
  id: String,
  user_id: String,
  namespace: String,
  job_type: String,
  every_seconds: i64,
  status: String,
  created_at: String,
}

impl ScheduleRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      user_id: row.get(1)?,
      namespace: row.get(2)?,
      job_type: row.get(3)?,
      every_seconds: row.get(4)?,
      status: row.get(5)?,
      created_at: row.get(6)?,
    })
  }

  fn into_schedule(self) -> Result<Schedule, StoreError> {
    let status = ScheduleStatus::parse(&self.status)
      .ok_or_else(|| StoreError::Corrupt(format!("schedule status '{}'", self.status)))?;
    let every_seconds = u64::try_from(self.every_seconds)
      .map_err(|_| StoreError::Corrupt(format!("every_seconds {}", self.every_seconds)))?;
    Ok(Schedule {
      id: parse_uuid(&self.id)?,
      user_id: self.user_id,
      namespace: self.namespace,
      job_type: self.job_type,
      every_seconds,
      status,
      created_at: parse_ts(&self.created_at)?,
    })
  }
}

/// Schedule store persisted in SQLite. Rows are never deleted, only stopped.
pub struct SqliteScheduleStore {
  conn: Mutex<Connection>,
}

impl SqliteScheduleStore {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let conn = open_file(path.as_ref())?;
    Self::init_schema(&conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn open_in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory()?;
    Self::init_schema(&conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
      "CREATE TABLE IF NOT EXISTS schedules (
          id            TEXT PRIMARY KEY,
          user_id       TEXT NOT NULL,
          namespace     TEXT NOT NULL,
          job_type      TEXT NOT NULL,
          every_seconds INTEGER NOT NULL,
          status        TEXT NOT NULL,
          created_at    TEXT NOT NULL
      );

      CREATE INDEX IF NOT EXISTS idx_schedules_owner
          ON schedules(user_id, namespace);",
    )?;
    Ok(())
  }

  fn query_schedules(&self, sql: &str, args: &[String]) -> Result<Vec<Schedule>, StoreError> {
    let conn = self.conn.lock();
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
      .query_map(params_from_iter(args.iter()), ScheduleRow::from_row)?
      .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(ScheduleRow::into_schedule).collect()
  }
}

impl ScheduleStore for SqliteScheduleStore {
  fn save(&self, schedule: &Schedule) -> Result<(), StoreError> {
    let every_seconds = i64::try_from(schedule.every_seconds)
      .map_err(|_| StoreError::Corrupt(format!("every_seconds {}", schedule.every_seconds)))?;
    self.conn.lock().execute(
      &format!(
        "INSERT INTO schedules ({SCHEDULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
           user_id = excluded.user_id,
           namespace = excluded.namespace,
           job_type = excluded.job_type,
           every_seconds = excluded.every_seconds,
           status = excluded.status"
      ),
      params![
        schedule.id.to_string(),
        schedule.user_id,
        schedule.namespace,
        schedule.job_type,
        every_seconds,
        schedule.status.as_str(),
        format_ts(&schedule.created_at),
      ],
    )?;
    Ok(())
  }

  fn get(&self, schedule_id: ScheduleId) -> Result<Option<Schedule>, StoreError> {
    let conn = self.conn.lock();
    let row = conn
      .query_row(
        &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
        params![schedule_id.to_string()],
        ScheduleRow::from_row,
      )
      .optional()?;
    row.map(ScheduleRow::into_schedule).transpose()
  }

  fn list(&self, user_id: &str, namespace: &str) -> Result<Vec<Schedule>, StoreError> {
    self.query_schedules(
      &format!(
        "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE user_id = ?1 AND namespace = ?2
         ORDER BY created_at ASC, id ASC"
      ),
      &[user_id.to_string(), namespace.to_string()],
    )
  }

  fn list_all(&self) -> Result<Vec<Schedule>, StoreError> {
    self.query_schedules(
      &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at ASC, id ASC"),
      &[],
    )
  }
}
