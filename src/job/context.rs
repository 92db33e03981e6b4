use std::cell::RefCell;

use super::{DispatchId, JobId};

/// Contextual information available to a running handler via a thread-local.
/// Accessible within a [`JobHandler`](crate::executor::JobHandler) using
/// `try_get_current_job_context()` or the `job_context!()` macro when the
/// `job_context` feature is enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobContext {
  pub job_id: JobId,
  pub user_id: String,
  pub task_type: String,
  pub dispatch_id: DispatchId,
}

thread_local! {
  #[doc(hidden)]
  pub static CURRENT_JOB_CONTEXT: RefCell<Option<JobContext>> = const { RefCell::new(None) };
}

/// Runs `f` with `context` installed as the current job context.
/// The previous context (if any) is restored afterwards, even if `f` panics.
pub(crate) fn scope<R>(context: JobContext, f: impl FnOnce() -> R) -> R {
  struct Restore(Option<JobContext>);

  impl Drop for Restore {
    fn drop(&mut self) {
      let previous = self.0.take();
      CURRENT_JOB_CONTEXT.with(|slot| *slot.borrow_mut() = previous);
    }
  }

  let previous = CURRENT_JOB_CONTEXT.with(|slot| slot.borrow_mut().replace(context));
  let _restore = Restore(previous);
  f()
}

/// Attempts to retrieve the context of the job currently executing on this thread.
///
/// Returns `None` if called outside a handler invoked by an executor.
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.with(|slot| slot.borrow().clone())
}

/// Retrieves the current `JobContext`, panicking if called outside a handler.
///
/// Use `try_get_current_job_context()` for safe, optional access.
///
/// # Panics
/// Panics if no job context is installed on the current thread.
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::job::context::try_get_current_job_context()
      .expect("job_context!() called outside of a job handler")
  };
}
