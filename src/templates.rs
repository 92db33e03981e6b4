//! Code-defined system schedules, registered idempotently at boot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ScheduleError;
use crate::metrics::SystemScheduleCounts;
use crate::schedule::{SYSTEM_NAMESPACE, SYSTEM_OWNER};
use crate::scheduler::Scheduler;

/// One system-level interval schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTemplate {
  pub job_type: &'static str,
  pub every_seconds: u64,
}

/// The fixed set registered in the `system` namespace.
pub const SYSTEM_SCHEDULE_TEMPLATES: &[ScheduleTemplate] = &[
  ScheduleTemplate {
    job_type: "system_data_retention",
    every_seconds: 24 * 60 * 60,
  },
  ScheduleTemplate {
    job_type: "system_health_check",
    every_seconds: 5 * 60,
  },
  ScheduleTemplate {
    job_type: "system_market_calendar_sync",
    every_seconds: 60 * 60,
  },
];

/// Outcome of a registration pass. `created + deduplicated == total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRegistration {
  pub total: usize,
  pub created: usize,
  pub deduplicated: usize,
}

/// Registers [`ScheduleTemplate`]s through a [`Scheduler`], keyed on
/// `(namespace, job_type)` so repeated boots never duplicate rows.
#[derive(Debug, Clone)]
pub struct ScheduleTemplateRegistrar {
  scheduler: Arc<Scheduler>,
  templates: Vec<ScheduleTemplate>,
}

impl ScheduleTemplateRegistrar {
  /// A registrar over [`SYSTEM_SCHEDULE_TEMPLATES`].
  pub fn new(scheduler: Arc<Scheduler>) -> Self {
    Self::with_templates(scheduler, SYSTEM_SCHEDULE_TEMPLATES.to_vec())
  }

  pub fn with_templates(scheduler: Arc<Scheduler>, templates: Vec<ScheduleTemplate>) -> Self {
    Self {
      scheduler,
      templates,
    }
  }

  pub fn templates(&self) -> &[ScheduleTemplate] {
    &self.templates
  }

  /// Registers every template that is not yet present.
  ///
  /// A second call reports `created == 0` and `deduplicated == total`.
  pub fn register_system_schedule_templates(&self) -> Result<TemplateRegistration, ScheduleError> {
    let outcome = self.reconcile()?;
    info!(
      total = outcome.total,
      created = outcome.created,
      deduplicated = outcome.deduplicated,
      "Registered system schedule templates."
    );
    Ok(outcome)
  }

  /// Boot-time reconciliation against what [`Scheduler::recover`] restored.
  /// Only templates missing from the store are created.
  pub fn recover_system_schedule_templates(&self) -> Result<TemplateRegistration, ScheduleError> {
    let outcome = self.reconcile()?;
    if outcome.created > 0 {
      info!(
        created = outcome.created,
        total = outcome.total,
        "Recreated missing system schedule templates."
      );
    } else {
      debug!(total = outcome.total, "All system schedule templates already present.");
    }
    Ok(outcome)
  }

  /// Schedules currently in the `system` namespace.
  pub fn counts(&self) -> SystemScheduleCounts {
    let rows = self.scheduler.namespace_snapshot(SYSTEM_NAMESPACE);
    SystemScheduleCounts {
      total: rows.len(),
      active: rows.iter().filter(|s| s.is_active()).count(),
    }
  }

  fn reconcile(&self) -> Result<TemplateRegistration, ScheduleError> {
    let mut outcome = TemplateRegistration {
      total: self.templates.len(),
      ..TemplateRegistration::default()
    };
    for template in &self.templates {
      let (_, created) = self.scheduler.ensure_interval(
        SYSTEM_OWNER,
        SYSTEM_NAMESPACE,
        template.job_type,
        template.every_seconds,
      )?;
      if created {
        outcome.created += 1;
      } else {
        outcome.deduplicated += 1;
      }
    }
    Ok(outcome)
  }
}
