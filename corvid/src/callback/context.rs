//! Per-run context shared by lifecycle hooks and middleware.
//!
//! [`RunContext`] carries what every observer of a run may need: the agent
//! name, the current step, the remaining budget and the run's cancellation
//! signal. Data that should survive the run belongs in
//! [`ConversationState::middleware_state`](crate::state::ConversationState::middleware_state).

use tokio_util::sync::CancellationToken;

/// Context passed to hooks and middleware during an agent run.
///
/// Hooks receive `&RunContext`; they observe the run but do not steer it.
/// Steering happens through middleware return values.
///
/// # Example
///
/// ```rust
/// use corvid::callback::RunContext;
///
/// let ctx = RunContext::new()
///     .with_agent_name("researcher")
///     .with_step(3);
///
/// assert_eq!(ctx.agent_name(), Some("researcher"));
/// assert_eq!(ctx.step(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Number of model calls started so far.
    step: usize,
    /// Model calls left before the run is forced to stop.
    remaining_steps: usize,
    /// Name of the running agent.
    agent_name: Option<String>,
    /// Cancellation signal of the run.
    signal: CancellationToken,
}

impl RunContext {
    /// Create a new empty run context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent name.
    #[must_use]
    pub fn with_agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    /// Set the current step number.
    #[must_use]
    pub const fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    /// Set the remaining step budget.
    #[must_use]
    pub const fn with_remaining_steps(mut self, remaining: usize) -> Self {
        self.remaining_steps = remaining;
        self
    }

    /// Attach the run's cancellation signal.
    #[must_use]
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    /// Get the current step number.
    #[must_use]
    pub const fn step(&self) -> usize {
        self.step
    }

    /// Get the remaining step budget.
    #[must_use]
    pub const fn remaining_steps(&self) -> usize {
        self.remaining_steps
    }

    /// Get the agent name, if set.
    #[must_use]
    pub fn agent_name(&self) -> Option<&str> {
        self.agent_name.as_deref()
    }

    /// The run's cancellation signal.
    #[must_use]
    pub const fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    /// Returns `true` once the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Record the start of another model call.
    pub const fn advance_step(&mut self) {
        self.step += 1;
    }

    /// Update the remaining step budget.
    pub const fn set_remaining_steps(&mut self, remaining: usize) {
        self.remaining_steps = remaining;
    }
}
