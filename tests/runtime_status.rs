//! tests/runtime_status.rs
//! Runtime status snapshot.

mod common;

use std::sync::Arc;

use crate::common::{default_handlers, running_job, setup_tracing};
use jobkeeper::{
  InMemoryJobRepository, InProcessExecutor, JobRepository, JobService, ScheduleTemplateRegistrar,
  Scheduler, SYSTEM_SCHEDULE_TEMPLATES,
};
use serde_json::json;

#[test]
fn test_counters_track_outcomes() {
  setup_tracing();
  let repository: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
  repository.save(&running_job("u-9", "backtest_batch")).unwrap();

  let scheduler = Arc::new(Scheduler::in_memory());
  ScheduleTemplateRegistrar::new(scheduler.clone())
    .register_system_schedule_templates()
    .unwrap();

  let service = JobService::builder()
    .repository(repository)
    .executor(Arc::new(InProcessExecutor::new(default_handlers())))
    .scheduler(scheduler)
    .build()
    .unwrap();

  for task_type in ["backtest_run", "risk_check", "signal_generate"] {
    let job = service.submit_job("u-1", task_type, json!({}), None).unwrap();
    service.dispatch_job("u-1", job.id).unwrap();
  }
  let cancelled = service.submit_job("u-1", "backtest_run", json!({}), None).unwrap();
  service.cancel_job("u-1", cancelled.id).unwrap();

  let status = service.runtime_status();
  assert_eq!(status.executor.mode, "inprocess");
  assert_eq!(status.execution.dispatched, 3);
  assert_eq!(status.execution.succeeded, 1);
  assert_eq!(status.execution.failed, 2);
  assert_eq!(status.recovery.recovered_running_jobs, 1);
  assert_eq!(status.system_schedules.total, SYSTEM_SCHEDULE_TEMPLATES.len());
  assert_eq!(status.system_schedules.active, SYSTEM_SCHEDULE_TEMPLATES.len());
}

#[test]
fn test_status_without_scheduler_reports_zero_schedules() {
  setup_tracing();
  let service = common::build_service();
  let status = service.runtime_status();
  assert_eq!(status.system_schedules.total, 0);
  assert_eq!(status.execution.dispatched, 0);
}

#[test]
fn test_status_serializes_with_camel_case_sections() {
  setup_tracing();
  let service = common::build_service();
  let value = serde_json::to_value(service.runtime_status()).unwrap();

  assert_eq!(value["executor"]["mode"], json!("inprocess"));
  assert_eq!(value["execution"]["dispatched"], json!(0));
  assert_eq!(value["recovery"]["recoveredRunningJobs"], json!(0));
  assert_eq!(value["systemSchedules"]["active"], json!(0));
}
