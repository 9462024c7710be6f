//! Lifecycle callbacks for agent runs.
//!
//! - [`RunHooks`]: async observer trait with no-op defaults
//! - [`LoggingRunHooks`]: emits `tracing` events for every lifecycle event
//! - [`NoopRunHooks`]: used when a run has no hooks
//! - [`RunContext`]: per-run data passed to hooks and middleware

mod context;
mod hooks;
mod logging;
mod noop;

pub use context::RunContext;
pub use hooks::{BoxedRunHooks, RunHooks, SharedRunHooks};
pub use logging::{LogLevel, LoggingRunHooks};
pub use noop::NoopRunHooks;
