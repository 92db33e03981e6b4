//! Composition root: wires stores, scheduler, templates, executor and service
//! from an [`OrchestratorConfig`].

use std::sync::Arc;

use tracing::info;

use crate::config::{ExecutorMode, OrchestratorConfig, StorageBackend};
use crate::error::BuildError;
use crate::executor::{Executor, HandlerRegistry, InProcessExecutor, TokioExecutor};
use crate::scheduler::Scheduler;
use crate::service::JobService;
use crate::store::{
  InMemoryJobRepository, InMemoryScheduleStore, JobRepository, ScheduleStore, SqliteJobRepository,
  SqliteScheduleStore,
};
use crate::templates::ScheduleTemplateRegistrar;
use crate::ticker::ScheduleTicker;

/// One fully wired orchestrator instance. Instances share nothing, so several
/// can coexist in one process.
#[derive(Debug)]
pub struct Orchestrator {
  service: JobService,
  scheduler: Arc<Scheduler>,
  templates: ScheduleTemplateRegistrar,
  config: OrchestratorConfig,
}

impl Orchestrator {
  /// Builds every component in dependency order:
  /// stores, scheduler recovery, system template reconciliation, executor,
  /// then the service (which runs job recovery when enabled).
  ///
  /// # Errors
  ///
  /// Any [`BuildError`]; [`BuildError::NoRuntime`] when the tokio executor is
  /// configured outside a runtime.
  pub fn bootstrap(config: &OrchestratorConfig, handlers: HandlerRegistry) -> Result<Self, BuildError> {
    config.validate()?;

    let (repository, schedule_store): (Arc<dyn JobRepository>, Arc<dyn ScheduleStore>) =
      match &config.storage {
        StorageBackend::Memory => (
          Arc::new(InMemoryJobRepository::new()),
          Arc::new(InMemoryScheduleStore::new()),
        ),
        StorageBackend::Sqlite { path } => (
          Arc::new(SqliteJobRepository::open(path)?),
          Arc::new(SqliteScheduleStore::open(path)?),
        ),
      };

    let scheduler = Arc::new(Scheduler::new(schedule_store));
    let recovered_schedules = scheduler.recover()?;
    let templates = ScheduleTemplateRegistrar::new(scheduler.clone());
    let reconciled = templates.recover_system_schedule_templates()?;

    let executor: Arc<dyn Executor> = match config.executor {
      ExecutorMode::InProcess => Arc::new(InProcessExecutor::new(handlers)),
      ExecutorMode::Tokio => Arc::new(TokioExecutor::new(handlers)?),
    };

    let service = JobService::builder()
      .repository(repository)
      .executor(executor)
      .scheduler(scheduler.clone())
      .schedule_templates(templates.clone())
      .concurrency_limits(config.concurrency.clone())
      .recover_on_start(config.recover_on_start)
      .build()?;

    info!(
      executor = service.executor_name(),
      storage = ?config.storage,
      recovered_schedules,
      templates_created = reconciled.created,
      "Orchestrator bootstrapped."
    );

    Ok(Self {
      service,
      scheduler,
      templates,
      config: config.clone(),
    })
  }

  pub fn service(&self) -> &JobService {
    &self.service
  }

  pub fn scheduler(&self) -> &Arc<Scheduler> {
    &self.scheduler
  }

  pub fn templates(&self) -> &ScheduleTemplateRegistrar {
    &self.templates
  }

  pub fn config(&self) -> &OrchestratorConfig {
    &self.config
  }

  /// A ticker over this instance's scheduler, using the configured poll
  /// interval and dispatch setting.
  pub fn ticker(&self) -> ScheduleTicker {
    ScheduleTicker::builder(self.service.clone(), self.scheduler.clone())
      .poll_interval(self.config.ticker_poll_interval())
      .dispatch(self.config.dispatch_scheduled_jobs)
      .build()
  }
}
