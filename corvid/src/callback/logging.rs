//! Tracing-based logging implementation of [`RunHooks`].
//!
//! # Example
//!
//! ```rust
//! use corvid::callback::{LogLevel, LoggingRunHooks};
//!
//! // Default: logs at INFO level
//! let hooks = LoggingRunHooks::new();
//!
//! // Custom: logs at DEBUG level
//! let verbose = LoggingRunHooks::with_level(LogLevel::Debug);
//! ```

use async_trait::async_trait;

use crate::error::{Error, Interrupt};
use crate::message::{AiMessage, Message, ToolCall};
use crate::state::ConversationState;
use crate::tool::ToolOutput;

use super::context::RunContext;
use super::hooks::RunHooks;

/// Log verbosity level for hook events.
///
/// Maps directly to `tracing` levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace-level logging (most verbose).
    Trace,
    /// Debug-level logging.
    Debug,
    /// Info-level logging (default).
    #[default]
    Info,
    /// Warn-level logging.
    Warn,
}

/// Emit a log event at the specified level using `tracing` macros.
macro_rules! log_at_level {
    ($level:expr, $($arg:tt)*) => {
        match $level {
            LogLevel::Trace => tracing::trace!($($arg)*),
            LogLevel::Debug => tracing::debug!($($arg)*),
            LogLevel::Info  => tracing::info!($($arg)*),
            LogLevel::Warn  => tracing::warn!($($arg)*),
        }
    };
}

/// A [`RunHooks`] implementation that logs lifecycle events via `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingRunHooks {
    level: LogLevel,
}

impl LoggingRunHooks {
    /// Create logging hooks with the default level (INFO).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create logging hooks with a custom level.
    #[must_use]
    pub const fn with_level(level: LogLevel) -> Self {
        Self { level }
    }
}

fn output_kind(output: &ToolOutput) -> &'static str {
    match output {
        ToolOutput::Value(_) => "value",
        ToolOutput::Message(m) if m.is_error() => "error",
        ToolOutput::Message(_) => "message",
        ToolOutput::Command(_) => "command",
    }
}

#[async_trait]
impl RunHooks for LoggingRunHooks {
    async fn on_agent_start(&self, ctx: &RunContext, agent_name: &str) {
        log_at_level!(
            self.level,
            agent = agent_name,
            remaining_steps = ctx.remaining_steps(),
            "Agent started"
        );
    }

    async fn on_agent_end(&self, ctx: &RunContext, agent_name: &str, state: &ConversationState) {
        log_at_level!(
            self.level,
            agent = agent_name,
            step = ctx.step(),
            messages = state.messages.len(),
            structured = state.structured_response.is_some(),
            "Agent completed"
        );
    }

    async fn on_model_start(&self, ctx: &RunContext, agent_name: &str, messages: &[Message]) {
        log_at_level!(
            self.level,
            agent = agent_name,
            step = ctx.step(),
            message_count = messages.len(),
            "Model call started"
        );
    }

    async fn on_model_end(&self, ctx: &RunContext, agent_name: &str, response: &AiMessage) {
        log_at_level!(
            self.level,
            agent = agent_name,
            step = ctx.step(),
            tool_calls = response.tool_calls.len(),
            "Model call completed"
        );
    }

    async fn on_tool_start(&self, ctx: &RunContext, agent_name: &str, call: &ToolCall) {
        log_at_level!(
            self.level,
            agent = agent_name,
            step = ctx.step(),
            tool = %call.name,
            tool_call_id = %call.id,
            "Tool execution started"
        );
    }

    async fn on_tool_end(
        &self,
        ctx: &RunContext,
        agent_name: &str,
        call: &ToolCall,
        output: &ToolOutput,
    ) {
        log_at_level!(
            self.level,
            agent = agent_name,
            step = ctx.step(),
            tool = %call.name,
            tool_call_id = %call.id,
            outcome = output_kind(output),
            "Tool execution completed"
        );
    }

    async fn on_tool_error(&self, ctx: &RunContext, agent_name: &str, call: &ToolCall, error: &Error) {
        log_at_level!(
            self.level,
            agent = agent_name,
            step = ctx.step(),
            tool = %call.name,
            tool_call_id = %call.id,
            error = %error,
            "Tool execution aborted"
        );
    }

    async fn on_interrupt(&self, ctx: &RunContext, agent_name: &str, interrupt: &Interrupt) {
        log_at_level!(
            self.level,
            agent = agent_name,
            step = ctx.step(),
            interrupt = %interrupt,
            "Agent interrupted"
        );
    }

    async fn on_error(&self, ctx: &RunContext, agent_name: &str, error: &Error) {
        // Errors always log at WARN regardless of configured level.
        tracing::warn!(
            agent = agent_name,
            step = ctx.step(),
            error = %error,
            "Agent error"
        );
    }
}
