//! Static catalog of task types the orchestrator accepts.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The platform area that owns a task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskDomain {
  Backtest,
  Strategy,
  Trading,
  Risk,
  Signal,
  System,
}

impl TaskDomain {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskDomain::Backtest => "backtest",
      TaskDomain::Strategy => "strategy",
      TaskDomain::Trading => "trading",
      TaskDomain::Risk => "risk",
      TaskDomain::Signal => "signal",
      TaskDomain::System => "system",
    }
  }
}

impl fmt::Display for TaskDomain {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A declared task type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskType {
  pub name: String,
  pub domain: TaskDomain,
  /// Whether interval schedules may enqueue this type.
  pub schedulable: bool,
  /// Legacy names still accepted at submission.
  pub aliases: Vec<String>,
}

impl TaskType {
  pub fn new(name: &str, domain: TaskDomain, schedulable: bool) -> Self {
    Self {
      name: name.to_string(),
      domain,
      schedulable,
      aliases: Vec::new(),
    }
  }

  pub fn with_alias(mut self, alias: &str) -> Self {
    self.aliases.push(alias.to_string());
    self
  }
}

/// Lookup table over [`TaskType`]s, keyed by canonical name and alias.
#[derive(Debug, Clone, Default)]
pub struct TaskTypeRegistry {
  types: Vec<TaskType>,
  // name or alias -> index into `types`
  index: HashMap<String, usize>,
}

impl TaskTypeRegistry {
  /// An empty registry. Every submission will be rejected until types are registered.
  pub fn new() -> Self {
    Self::default()
  }

  /// The trading platform's catalog.
  pub fn builtin() -> Self {
    let mut registry = Self::new();
    for task_type in [
      TaskType::new("backtest_run", TaskDomain::Backtest, false).with_alias("backtest"),
      TaskType::new("backtest_batch", TaskDomain::Backtest, false),
      TaskType::new("strategy_validate", TaskDomain::Strategy, false),
      TaskType::new("trading_account_sync", TaskDomain::Trading, true).with_alias("account_sync"),
      TaskType::new("risk_check", TaskDomain::Risk, true).with_alias("risk_evaluate"),
      TaskType::new("signal_generate", TaskDomain::Signal, true).with_alias("signal_run"),
      TaskType::new("system_data_retention", TaskDomain::System, true),
      TaskType::new("system_health_check", TaskDomain::System, true),
      TaskType::new("system_market_calendar_sync", TaskDomain::System, true),
    ] {
      registry.register(task_type);
    }
    registry
  }

  /// Adds (or replaces) a task type. Its name and aliases shadow earlier entries.
  pub fn register(&mut self, task_type: TaskType) {
    let slot = match self.types.iter().position(|t| t.name == task_type.name) {
      Some(existing) => {
        let stale = std::mem::replace(&mut self.types[existing], task_type);
        for alias in &stale.aliases {
          self.index.remove(alias);
        }
        existing
      }
      None => {
        self.types.push(task_type);
        self.types.len() - 1
      }
    };
    let entry = &self.types[slot];
    self.index.insert(entry.name.clone(), slot);
    for alias in &entry.aliases {
      self.index.insert(alias.clone(), slot);
    }
  }

  /// Resolves a canonical name or legacy alias.
  pub fn resolve(&self, name: &str) -> Option<&TaskType> {
    self.index.get(name).map(|&slot| &self.types[slot])
  }

  pub fn contains(&self, name: &str) -> bool {
    self.index.contains_key(name)
  }

  pub fn list(&self) -> &[TaskType] {
    &self.types
  }

  pub fn schedulable(&self) -> impl Iterator<Item = &TaskType> {
    self.types.iter().filter(|t| t.schedulable)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn aliases_resolve_to_canonical_type() {
    let registry = TaskTypeRegistry::builtin();
    assert_eq!(registry.resolve("backtest").map(|t| t.name.as_str()), Some("backtest_run"));
    assert_eq!(registry.resolve("risk_evaluate").map(|t| t.domain), Some(TaskDomain::Risk));
    assert!(registry.resolve("nope").is_none());
  }

  #[test]
  fn system_types_are_schedulable() {
    let registry = TaskTypeRegistry::builtin();
    let names: Vec<_> = registry.schedulable().map(|t| t.name.as_str()).collect();
    assert!(names.contains(&"system_health_check"));
    assert!(!names.contains(&"backtest_run"));
  }

  #[test]
  fn re_registering_replaces_aliases() {
    let mut registry = TaskTypeRegistry::builtin();
    registry.register(TaskType::new("backtest_run", TaskDomain::Backtest, true).with_alias("bt"));
    assert!(registry.resolve("backtest").is_none());
    assert!(registry.resolve("bt").map_or(false, |t| t.schedulable));
    assert_eq!(registry.list().iter().filter(|t| t.name == "backtest_run").count(), 1);
  }
}
