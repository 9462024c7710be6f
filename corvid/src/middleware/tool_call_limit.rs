//! Built-in middleware capping how many tool calls an agent may make.
//!
//! Three counters are available, each optional:
//!
//! - **turn**: calls within a single model response
//! - **run**: calls within one invoke (reset by `before_agent`)
//! - **thread**: calls across invokes, persisted in the state
//!
//! Counting happens in `after_model`. Calls over a limit are pre-empted by
//! writing error tool messages with their ids, so the tool stage never
//! dispatches them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::callback::RunContext;
use crate::error::{Error, Result};
use crate::message::{AiMessage, Message, ToolCall, ToolMessage};
use crate::state::{ConversationState, StatePatch};

use super::{HookUpdate, JumpTo, Middleware, StateHook};

/// What happens when a call exceeds a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExitBehavior {
    /// Block the offending calls and let the model carry on.
    #[default]
    Continue,
    /// Block every pending call and end the run with an explanation.
    End,
    /// Fail the run.
    Error,
}

/// Builder for the tool call limit middleware.
///
/// # Example
///
/// ```rust
/// use corvid::middleware::{ExitBehavior, ToolCallLimit};
///
/// let limit = ToolCallLimit::new()
///     .tool_name("search")
///     .turn_limit(1)
///     .run_limit(5)
///     .exit_behavior(ExitBehavior::Continue)
///     .build()
///     .unwrap();
/// assert_eq!(limit.name(), "tool_call_limit[search]");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ToolCallLimit {
    tool_name: Option<String>,
    turn_limit: Option<usize>,
    run_limit: Option<usize>,
    thread_limit: Option<usize>,
    exit_behavior: ExitBehavior,
}

impl ToolCallLimit {
    /// Create a builder with no limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only count calls to this tool.
    #[must_use]
    pub fn tool_name(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    /// Maximum calls per model response.
    #[must_use]
    pub const fn turn_limit(mut self, limit: usize) -> Self {
        self.turn_limit = Some(limit);
        self
    }

    /// Maximum calls per invoke.
    #[must_use]
    pub const fn run_limit(mut self, limit: usize) -> Self {
        self.run_limit = Some(limit);
        self
    }

    /// Maximum calls across invokes sharing the same state.
    #[must_use]
    pub const fn thread_limit(mut self, limit: usize) -> Self {
        self.thread_limit = Some(limit);
        self
    }

    /// Set what happens when a limit is exceeded.
    #[must_use]
    pub const fn exit_behavior(mut self, behavior: ExitBehavior) -> Self {
        self.exit_behavior = behavior;
        self
    }

    /// Build the middleware.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no limit was set.
    pub fn build(self) -> Result<Middleware> {
        if self.turn_limit.is_none() && self.run_limit.is_none() && self.thread_limit.is_none() {
            return Err(Error::config(
                "tool call limit needs at least one of turn, run or thread limit",
            ));
        }
        let name = match &self.tool_name {
            Some(tool) => format!("tool_call_limit[{tool}]"),
            None => "tool_call_limit".to_owned(),
        };
        let limits = Arc::new(Limits {
            run_key: format!("{name}.run_count"),
            thread_key: format!("{name}.thread_count"),
            name: name.clone(),
            config: self,
        });

        Ok(Middleware::new(name)
            .state_default(limits.run_key.clone(), Value::from(0))
            .state_default(limits.thread_key.clone(), Value::from(0))
            .before_agent(ResetRunCount(Arc::clone(&limits)))
            .after_model(Enforce(limits)))
    }
}

struct Limits {
    name: String,
    run_key: String,
    thread_key: String,
    config: ToolCallLimit,
}

impl Limits {
    fn counts(&self, call: &ToolCall) -> bool {
        self.config
            .tool_name
            .as_deref()
            .is_none_or(|name| name == call.name)
    }

    fn read(state: &ConversationState, key: &str) -> usize {
        state
            .middleware_state
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0)
    }

    fn subject(&self) -> String {
        match &self.config.tool_name {
            Some(tool) => format!("'{tool}' tool call limit exceeded"),
            None => "Tool call limit exceeded".to_owned(),
        }
    }

    /// Describe every limit the attempted totals overrun.
    fn describe(&self, turn: usize, run: usize, thread: usize) -> String {
        let mut parts = Vec::new();
        for (label, attempted, limit) in [
            ("turn", turn, self.config.turn_limit),
            ("run", run, self.config.run_limit),
            ("thread", thread, self.config.thread_limit),
        ] {
            if let Some(limit) = limit
                && attempted > limit
            {
                parts.push(format!("{label} limit reached ({attempted}/{limit})"));
            }
        }
        format!("{}: {}", self.subject(), parts.join(", "))
    }
}

struct ResetRunCount(Arc<Limits>);

#[async_trait]
impl StateHook for ResetRunCount {
    async fn run(
        &self,
        _state: &ConversationState,
        _ctx: &RunContext,
    ) -> Result<Option<HookUpdate>> {
        Ok(Some(HookUpdate::patch(
            StatePatch::new().state(self.0.run_key.clone(), Value::from(0)),
        )))
    }
}

struct Enforce(Arc<Limits>);

#[async_trait]
impl StateHook for Enforce {
    async fn run(
        &self,
        state: &ConversationState,
        _ctx: &RunContext,
    ) -> Result<Option<HookUpdate>> {
        let limits = &self.0;
        let pending = state.pending_tool_calls();
        let counted: Vec<&ToolCall> = pending.iter().copied().filter(|c| limits.counts(c)).collect();
        if counted.is_empty() {
            return Ok(None);
        }

        let run_before = Limits::read(state, &limits.run_key);
        let thread_before = Limits::read(state, &limits.thread_key);
        let (mut turn, mut run, mut thread) = (0, run_before, thread_before);
        let mut blocked = Vec::new();

        for call in &counted {
            let within = |count: usize, limit: Option<usize>| limit.is_none_or(|l| count < l);
            if within(turn, limits.config.turn_limit)
                && within(run, limits.config.run_limit)
                && within(thread, limits.config.thread_limit)
            {
                turn += 1;
                run += 1;
                thread += 1;
            } else {
                blocked.push(*call);
            }
        }

        let counts = StatePatch::new()
            .state(limits.run_key.clone(), Value::from(run))
            .state(limits.thread_key.clone(), Value::from(thread));
        if blocked.is_empty() {
            return Ok(Some(HookUpdate::patch(counts)));
        }

        let attempted = counted.len();
        let description = limits.describe(
            attempted,
            run_before + attempted,
            thread_before + attempted,
        );
        tracing::debug!(
            middleware = %limits.name,
            blocked = blocked.len(),
            "Tool call limit exceeded"
        );

        match limits.config.exit_behavior {
            ExitBehavior::Continue => {
                let mut patch = counts;
                for call in blocked {
                    patch.push(Message::Tool(
                        ToolMessage::error(
                            call.id.clone(),
                            format!("{description}. Do not call '{}' again.", call.name),
                        )
                        .with_name(call.name.clone()),
                    ));
                }
                Ok(Some(HookUpdate::patch(patch)))
            }
            ExitBehavior::End => {
                let mut patch = counts;
                for call in pending {
                    patch.push(Message::Tool(
                        ToolMessage::error(call.id.clone(), description.clone())
                            .with_name(call.name.clone()),
                    ));
                }
                patch.push(Message::Ai(AiMessage::new(description)));
                Ok(Some(HookUpdate::patch(patch).with_jump(JumpTo::End)))
            }
            ExitBehavior::Error => Err(Error::middleware(limits.name.clone(), description)),
        }
    }
}

impl fmt::Debug for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limits")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
