use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type alias for the unique identifier of a recurring schedule. Uses UUID v4.
pub type ScheduleId = Uuid;

/// Owner sentinel for schedules registered by the system itself.
pub const SYSTEM_OWNER: &str = "system";
/// Namespace holding system-level schedules.
pub const SYSTEM_NAMESPACE: &str = "system";

const USER_NAMESPACE_PREFIX: &str = "user:";

/// The namespace a user's own schedules live in (`user:<id>`).
pub fn user_namespace(user_id: &str) -> String {
  format!("{}{}", USER_NAMESPACE_PREFIX, user_id)
}

/// Whether `user_id` may register or access schedules in `namespace`.
///
/// `user:*` namespaces belong to exactly one user and `system` belongs to
/// [`SYSTEM_OWNER`]. Any other namespace is a free-form partition.
pub fn namespace_permits(user_id: &str, namespace: &str) -> bool {
  if let Some(owner) = namespace.strip_prefix(USER_NAMESPACE_PREFIX) {
    owner == user_id
  } else if namespace == SYSTEM_NAMESPACE {
    user_id == SYSTEM_OWNER
  } else {
    true
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
  Active,
  Stopped,
}

impl ScheduleStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ScheduleStatus::Active => "active",
      ScheduleStatus::Stopped => "stopped",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "active" => Some(ScheduleStatus::Active),
      "stopped" => Some(ScheduleStatus::Stopped),
      _ => None,
    }
  }
}

impl fmt::Display for ScheduleStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A recurring interval trigger that enqueues `job_type` every `every_seconds`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
  pub id: ScheduleId,
  pub user_id: String,
  pub namespace: String,
  pub job_type: String,
  pub every_seconds: u64,
  pub status: ScheduleStatus,
  pub created_at: DateTime<Utc>,
}

impl Schedule {
  pub(crate) fn new(
    user_id: &str,
    namespace: &str,
    job_type: &str,
    every_seconds: u64,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      id: Uuid::new_v4(),
      user_id: user_id.to_string(),
      namespace: namespace.to_string(),
      job_type: job_type.to_string(),
      every_seconds,
      status: ScheduleStatus::Active,
      created_at: now,
    }
  }

  pub fn is_active(&self) -> bool {
    self.status == ScheduleStatus::Active
  }

}
