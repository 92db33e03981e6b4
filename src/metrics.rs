use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// --- Execution Counters (Internal State) ---

/// Cumulative execution counters since process start.
///
/// Cloning only clones the `Arc`s, so executors' callbacks and the service
/// share the same underlying atomics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
  /// Admitted `queued -> running` transitions.
  pub dispatched: Arc<AtomicUsize>,
  /// `running -> succeeded` transitions.
  pub succeeded: Arc<AtomicUsize>,
  /// `running -> failed` transitions, excluding crash recovery.
  pub failed: Arc<AtomicUsize>,
  /// Dispatch attempts refused by admission control.
  pub refused: Arc<AtomicUsize>,
}

impl ExecutionMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn snapshot(&self) -> ExecutionCounters {
    let order = Ordering::Relaxed;
    ExecutionCounters {
      dispatched: self.dispatched.load(order),
      succeeded: self.succeeded.load(order),
      failed: self.failed.load(order),
      refused: self.refused.load(order),
    }
  }
}

// --- Runtime Status Snapshot (Public) ---

/// Point-in-time view returned by [`JobService::runtime_status`](crate::JobService::runtime_status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
  pub executor: ExecutorStatus,
  pub execution: ExecutionCounters,
  pub recovery: RecoveryStatus,
  pub system_schedules: SystemScheduleCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStatus {
  /// The configured executor's name.
  pub mode: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounters {
  pub dispatched: usize,
  pub succeeded: usize,
  pub failed: usize,
  pub refused: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatus {
  /// Jobs failed with `RUNTIME_RECOVERY` by the last recovery pass.
  pub recovered_running_jobs: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemScheduleCounts {
  pub total: usize,
  pub active: usize,
}
