use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::service::ConcurrencyLimits;

const DEFAULT_TICKER_POLL_INTERVAL_MS: u64 = 1_000;

/// Which [`Executor`](crate::Executor) the orchestrator runs jobs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorMode {
  /// Handlers run on the dispatching thread.
  #[default]
  InProcess,
  /// Handlers run on tokio's blocking pool. Needs a running runtime at bootstrap.
  Tokio,
}

/// Where jobs and schedules are persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageBackend {
  #[default]
  Memory,
  /// One SQLite file holding both the jobs and the schedules tables.
  Sqlite { path: PathBuf },
}

/// Deployment settings for [`Orchestrator::bootstrap`](crate::Orchestrator::bootstrap).
///
/// Every field has a default, so `{}` is a valid configuration.
///
/// ```
/// use jobkeeper::{OrchestratorConfig, StorageBackend};
///
/// let config = OrchestratorConfig::from_json_str(r#"{
///   "executor": "tokio",
///   "storage": { "kind": "sqlite", "path": "/tmp/jobs.db" },
///   "concurrency": { "default_limit": 2, "per_task_type": { "backtest_run": 4 } }
/// }"#).unwrap();
/// assert!(matches!(config.storage, StorageBackend::Sqlite { .. }));
/// assert_eq!(config.concurrency.limit_for("backtest_run"), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
  pub executor: ExecutorMode,
  pub storage: StorageBackend,
  /// Fail jobs left `running` by a previous process when the service is built.
  pub recover_on_start: bool,
  pub concurrency: ConcurrencyLimits,
  pub ticker_poll_interval_ms: u64,
  /// Whether jobs fired by the schedule ticker are dispatched right away.
  pub dispatch_scheduled_jobs: bool,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      executor: ExecutorMode::default(),
      storage: StorageBackend::default(),
      recover_on_start: true,
      concurrency: ConcurrencyLimits::default(),
      ticker_poll_interval_ms: DEFAULT_TICKER_POLL_INTERVAL_MS,
      dispatch_scheduled_jobs: false,
    }
  }
}

impl OrchestratorConfig {
  /// Parses and validates a JSON document.
  pub fn from_json_str(raw: &str) -> Result<Self, BuildError> {
    let config: Self = serde_json::from_str(raw).map_err(|e| BuildError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), BuildError> {
    if self.ticker_poll_interval_ms == 0 {
      return Err(BuildError::Config(
        "ticker_poll_interval_ms must be greater than zero".to_string(),
      ));
    }
    if let StorageBackend::Sqlite { path } = &self.storage {
      if path.as_os_str().is_empty() {
        return Err(BuildError::Config("sqlite storage needs a path".to_string()));
      }
    }
    Ok(())
  }

  pub fn ticker_poll_interval(&self) -> Duration {
    Duration::from_millis(self.ticker_poll_interval_ms)
  }
}
