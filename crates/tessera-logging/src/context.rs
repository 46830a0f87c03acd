//! Ambient execution context
//!
//! The context travels implicitly with every event emitted from the same
//! thread of control. Two carriers exist:
//!
//! - a thread-local slot managed by [`ExecutionContextGuard`], for
//!   synchronous scopes
//! - a tokio task-local set by [`scope`], for async units of work that may
//!   hop between worker threads
//!
//! Lookup checks the thread-local slot first, so a synchronous scope opened
//! inside a task overrides the task's context for its duration.

use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;

use tessera_core::ExecutionContext;

thread_local! {
    static EXECUTION_CONTEXT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

tokio::task_local! {
    static TASK_CONTEXT: ExecutionContext;
}

/// RAII guard for the thread's execution context
///
/// Creating the guard installs a context for the current thread. Dropping
/// it restores whatever was there before, including on panic unwinding.
/// The guard is `!Send`, so it cannot be held across an `.await` in a
/// spawned task; use [`scope`] there.
///
/// # Example
///
/// ```ignore
/// use tessera_core::ExecutionContext;
/// use tessera_logging::context;
///
/// let _guard = context::set_context(ExecutionContext::new("pipeline-42"));
///
/// // Captured events in this scope are attributed to pipeline-42
/// tracing::info!("Step started");
/// ```
pub struct ExecutionContextGuard {
    previous: Option<ExecutionContext>,
    _not_send: PhantomData<*const ()>,
}

impl ExecutionContextGuard {
    /// Install `context` for the current thread
    pub fn new(context: ExecutionContext) -> Self {
        let previous = EXECUTION_CONTEXT.with(|slot| slot.borrow_mut().replace(context));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ExecutionContextGuard {
    fn drop(&mut self) {
        EXECUTION_CONTEXT.with(|slot| *slot.borrow_mut() = self.previous.take());
    }
}

/// Install a context for the current thread until the guard drops
pub fn set_context(context: ExecutionContext) -> ExecutionContextGuard {
    ExecutionContextGuard::new(context)
}

/// Remove the current thread's context, returning it
///
/// An outstanding guard still restores its saved context when it drops.
pub fn clear_context() -> Option<ExecutionContext> {
    EXECUTION_CONTEXT.with(|slot| slot.borrow_mut().take())
}

/// The active context, if any
pub fn current() -> Option<ExecutionContext> {
    EXECUTION_CONTEXT
        .with(|slot| slot.borrow().clone())
        .or_else(|| TASK_CONTEXT.try_with(|ctx| ctx.clone()).ok())
}

/// Run a closure with `context` installed
pub fn with_context<R>(context: ExecutionContext, f: impl FnOnce() -> R) -> R {
    let _guard = set_context(context);
    f()
}

/// Run a future with `context` attached to its task
///
/// The context is visible on whichever thread polls the future and is
/// gone once the future completes or is dropped.
pub async fn scope<F: Future>(context: ExecutionContext, future: F) -> F::Output {
    TASK_CONTEXT.scope(context, future).await
}

/// Run a block with an execution context installed
///
/// # Example
///
/// ```ignore
/// with_execution_context!(ExecutionContext::new("pipeline-7"), {
///     tracing::info!("Processing step");
/// });
/// ```
#[macro_export]
macro_rules! with_execution_context {
    ($context:expr, $body:block) => {{
        let _guard = $crate::context::set_context($context);
        $body
    }};
}
