/// Macro to build a [`JobHandler`](crate::JobHandler) from a closure body.
///
/// Takes an optional setup block, run once when the handler is created, and a
/// body that receives the payload by reference. The body must evaluate to a
/// [`HandlerResult`](crate::HandlerResult).
///
/// # Usage
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use jobkeeper::{job_handler, HandlerRegistry};
///
/// let runs = Arc::new(AtomicUsize::new(0));
///
/// // With setup block:
/// let counting = job_handler! {
///     { let runs = runs.clone() }
///     |payload| {
///         runs.fetch_add(1, Ordering::SeqCst);
///         Ok(serde_json::json!({ "echo": payload.clone() }))
///     }
/// };
///
/// // Without setup block:
/// let echo = job_handler!(|payload| { Ok(payload.clone()) });
///
/// let mut handlers = HandlerRegistry::new();
/// handlers.register_shared("backtest_run", counting);
/// handlers.register_shared("risk_check", echo);
/// assert!(handlers.contains("risk_check"));
/// ```
#[macro_export]
macro_rules! job_handler {
    // Matcher 1: setup block `{...}` followed by the handler closure
    (
        { $($setup_stmts:stmt);* $(;)? }
        |$payload:ident| $body:block
    ) => {{
        $($setup_stmts;)*

        std::sync::Arc::new(
            move |$payload: &$crate::Payload| -> $crate::HandlerResult { $body }
        ) as $crate::JobHandler
    }};

    // Matcher 2: only the handler closure
    (
        |$payload:ident| $body:block
    ) => {
        std::sync::Arc::new(
            move |$payload: &$crate::Payload| -> $crate::HandlerResult { $body }
        ) as $crate::JobHandler
    };
}
