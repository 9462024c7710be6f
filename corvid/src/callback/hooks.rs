//! Lifecycle hook trait for agent runs.
//!
//! [`RunHooks`] observes a run without steering it. Every method has a
//! default no-op body, so implementors override only what they need.
//!
//! # Lifecycle Events
//!
//! 1. `on_agent_start`
//! 2. Step loop, repeated until the run stops:
//!    - `on_model_start`, model call, `on_model_end`
//!    - `on_tool_start`, tool execution, then `on_tool_end` or
//!      `on_tool_error` (per call, concurrently)
//! 3. `on_agent_end`, or `on_interrupt` / `on_error` when the run stops early

use async_trait::async_trait;

use crate::error::{Error, Interrupt};
use crate::message::{AiMessage, Message, ToolCall};
use crate::state::ConversationState;
use crate::tool::ToolOutput;

use super::context::RunContext;

/// A boxed, thread-safe [`RunHooks`] trait object.
pub type BoxedRunHooks = Box<dyn RunHooks>;

/// A shared, thread-safe [`RunHooks`] trait object.
pub type SharedRunHooks = std::sync::Arc<dyn RunHooks>;

/// Run-level lifecycle hooks.
///
/// This trait is object-safe and can be used as `Box<dyn RunHooks>` or
/// `Arc<dyn RunHooks>`. Tool hooks may be called concurrently from
/// several in-flight tool calls.
#[async_trait]
pub trait RunHooks: Send + Sync {
    /// Called before the first node of a run executes.
    async fn on_agent_start(&self, _ctx: &RunContext, _agent_name: &str) {}

    /// Called when the run reaches its terminal node.
    async fn on_agent_end(&self, _ctx: &RunContext, _agent_name: &str, _state: &ConversationState) {
    }

    /// Called just before the model handler runs, with the final model input.
    async fn on_model_start(&self, _ctx: &RunContext, _agent_name: &str, _messages: &[Message]) {}

    /// Called after the model produced its response.
    async fn on_model_end(&self, _ctx: &RunContext, _agent_name: &str, _response: &AiMessage) {}

    /// Called immediately before a tool call is dispatched.
    async fn on_tool_start(&self, _ctx: &RunContext, _agent_name: &str, _call: &ToolCall) {}

    /// Called after a tool call produced an outcome.
    ///
    /// Failed calls arrive as error tool messages.
    async fn on_tool_end(
        &self,
        _ctx: &RunContext,
        _agent_name: &str,
        _call: &ToolCall,
        _output: &ToolOutput,
    ) {
    }

    /// Called instead of `on_tool_end` when a dispatch fails outright:
    /// an interrupt, cancellation, or an error that was not recovered.
    async fn on_tool_error(
        &self,
        _ctx: &RunContext,
        _agent_name: &str,
        _call: &ToolCall,
        _error: &Error,
    ) {
    }

    /// Called when a tool suspends the run for outside input.
    async fn on_interrupt(&self, _ctx: &RunContext, _agent_name: &str, _interrupt: &Interrupt) {}

    /// Called when the run fails.
    async fn on_error(&self, _ctx: &RunContext, _agent_name: &str, _error: &Error) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        starts: AtomicUsize,
        tools: AtomicUsize,
    }

    #[async_trait]
    impl RunHooks for Counting {
        async fn on_agent_start(&self, _ctx: &RunContext, _agent_name: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tool_start(&self, _ctx: &RunContext, _agent_name: &str, _call: &ToolCall) {
            self.tools.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn overridden_methods_run_and_defaults_are_noops() {
        let hooks = Arc::new(Counting::default());
        let shared: SharedRunHooks = hooks.clone();
        let ctx = RunContext::new();
        let call = ToolCall::new("1", "search", serde_json::json!({}));

        shared.on_agent_start(&ctx, "agent").await;
        shared.on_tool_start(&ctx, "agent", &call).await;
        shared.on_tool_start(&ctx, "agent", &call).await;
        shared
            .on_model_end(&ctx, "agent", &AiMessage::new("done"))
            .await;
        shared.on_error(&ctx, "agent", &Error::agent("boom")).await;

        assert_eq!(hooks.starts.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.tools.load(Ordering::SeqCst), 2);
    }
}
