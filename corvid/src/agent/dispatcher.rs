//! Single tool-call dispatch with error isolation.
//!
//! A call is resolved against the registered tools, sent through the
//! `wrap_tool_call` chain, and its outcome normalized into a [`ToolOutput`].
//! Ordinary tool failures become advisory error messages the model can
//! react to; interrupts and cancellation always propagate.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span, warn};

use crate::error::{Error, Result, ToolError};
use crate::message::{ToolCall, ToolMessage};
use crate::middleware::{MiddlewarePipeline, ToolCallRequest, ToolHandler};
use crate::state::ConversationState;
use crate::tool::{ToolBox, ToolConfig, ToolOutput};

/// What a [`ToolErrorHandler`] sees about a failed call.
#[derive(Debug, Clone, Copy)]
pub struct ToolErrorContext<'a> {
    /// Id of the failed call.
    pub id: &'a str,
    /// Name of the tool.
    pub name: &'a str,
    /// Arguments the tool received.
    pub args: &'a Map<String, Value>,
    /// The failure.
    pub error: &'a ToolError,
    /// State snapshot of the tool stage.
    pub state: &'a ConversationState,
}

/// Turns a tool failure into a result for the model.
///
/// Returning `Ok(None)` falls back to the standard advisory message.
/// Returning an error makes the failure fatal.
#[async_trait]
pub trait ToolErrorHandler: Send + Sync {
    /// Handle one failure.
    async fn handle(&self, ctx: ToolErrorContext<'_>) -> Result<Option<ToolOutput>>;
}

#[async_trait]
impl<F> ToolErrorHandler for F
where
    F: Fn(&ToolErrorContext<'_>) -> Option<ToolOutput> + Send + Sync,
{
    async fn handle(&self, ctx: ToolErrorContext<'_>) -> Result<Option<ToolOutput>> {
        Ok(self(&ctx))
    }
}

/// Advisory text for a recovered tool failure.
fn advisory(error: &ToolError) -> String {
    format!("Error: {}\n Please fix your mistakes.", error.message())
}

/// Resolves, runs and normalizes individual tool calls.
#[derive(Clone)]
pub struct ToolDispatcher {
    tools: ToolBox,
    error_handler: Option<Arc<dyn ToolErrorHandler>>,
    handle_errors: bool,
}

impl ToolDispatcher {
    /// Create a dispatcher over the given tools. Failures are recovered
    /// into advisory messages.
    #[must_use]
    pub fn new(tools: ToolBox) -> Self {
        Self {
            tools,
            error_handler: None,
            handle_errors: true,
        }
    }

    /// Install a custom failure handler.
    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn ToolErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// When `false`, every tool failure aborts the run.
    #[must_use]
    pub const fn with_handle_errors(mut self, handle_errors: bool) -> Self {
        self.handle_errors = handle_errors;
        self
    }

    /// The registered tools.
    #[must_use]
    pub const fn tools(&self) -> &ToolBox {
        &self.tools
    }

    /// Dispatch one call without middleware.
    ///
    /// `signal` is the run's token; `narrower`, when given, cancels only this
    /// call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] when the tool raises an interrupt,
    /// [`Error::Cancelled`] when either token fires, and the underlying error
    /// when the failure is not recoverable.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        state: Arc<ConversationState>,
        signal: &CancellationToken,
        narrower: Option<&CancellationToken>,
    ) -> Result<ToolOutput> {
        self.dispatch_with(call, state, signal, narrower, None).await
    }

    pub(crate) async fn dispatch_with(
        &self,
        call: &ToolCall,
        state: Arc<ConversationState>,
        signal: &CancellationToken,
        narrower: Option<&CancellationToken>,
        pipeline: Option<&MiddlewarePipeline>,
    ) -> Result<ToolOutput> {
        let span = info_span!(
            "tool",
            tool.name = %call.name,
            tool.id = %call.id,
            tool.input = %call.args_value(),
            tool.success = tracing::field::Empty,
            error = tracing::field::Empty,
        );

        async {
            let merged = signal.child_token();
            let request = ToolCallRequest {
                call: call.clone(),
                tool: self.tools.get(&call.name).cloned(),
                state: Arc::clone(&state),
                config: ToolConfig::new(merged.clone()).with_tool_call_id(call.id.clone()),
            };

            let base = Base { tools: &self.tools };
            let run = async {
                match pipeline {
                    Some(pipeline) => pipeline.call_tool(request, &base).await,
                    None => base.call(request).await,
                }
            };
            let narrowed = async {
                match narrower {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            let outcome = tokio::select! {
                biased;
                () = merged.cancelled() => Err(Error::Cancelled),
                () = narrowed => {
                    merged.cancel();
                    Err(Error::Cancelled)
                }
                result = run => result,
            };

            let result = self
                .settle(call, &state, &merged, outcome)
                .await
                .map(|output| normalize(call, output));
            let current = tracing::Span::current();
            match &result {
                Ok(output) => {
                    current.record("tool.success", !is_error_output(output));
                }
                Err(e) => {
                    current.record("tool.success", false);
                    current.record("error", tracing::field::display(e));
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn settle(
        &self,
        call: &ToolCall,
        state: &ConversationState,
        merged: &CancellationToken,
        outcome: Result<ToolOutput>,
    ) -> Result<ToolOutput> {
        let error = match outcome {
            Ok(output) => return Ok(output),
            Err(Error::Tool(ToolError::Interrupt(mut interrupt))) => {
                if interrupt.tool_call_id.is_none() {
                    interrupt.tool_call_id = Some(call.id.clone());
                }
                return Err(Error::Interrupted {
                    interrupt,
                    state: Box::new(state.clone()),
                });
            }
            Err(e) if e.is_cancelled() || merged.is_cancelled() => return Err(Error::Cancelled),
            Err(Error::Tool(e)) if self.handle_errors => e,
            Err(e) => return Err(e),
        };

        warn!(tool = %call.name, error = %error, "Tool failed");
        if let Some(handler) = &self.error_handler {
            let ctx = ToolErrorContext {
                id: &call.id,
                name: &call.name,
                args: &call.args,
                error: &error,
                state,
            };
            if let Some(output) = handler.handle(ctx).await? {
                return Ok(output);
            }
        }
        Ok(ToolOutput::Message(
            ToolMessage::error(call.id.clone(), advisory(&error)).with_name(call.name.clone()),
        ))
    }
}

impl fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("tools", &self.tools)
            .field("handle_errors", &self.handle_errors)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

/// Wrap a raw tool value into the message answering `call`.
pub(crate) fn value_message(call: &ToolCall, value: Value) -> ToolMessage {
    let content = match value {
        Value::String(text) => text,
        other => other.to_string(),
    };
    ToolMessage::new(call.id.clone(), content).with_name(call.name.clone())
}

fn normalize(call: &ToolCall, output: ToolOutput) -> ToolOutput {
    match output {
        ToolOutput::Value(value) => ToolOutput::Message(value_message(call, value)),
        other => other,
    }
}

fn is_error_output(output: &ToolOutput) -> bool {
    matches!(output, ToolOutput::Message(m) if m.is_error())
}

/// Innermost handler: resolve and run the tool.
struct Base<'a> {
    tools: &'a ToolBox,
}

#[async_trait]
impl ToolHandler for Base<'_> {
    async fn call(&self, request: ToolCallRequest) -> Result<ToolOutput> {
        let ToolCallRequest {
            call, tool, config, ..
        } = request;
        let Some(tool) = tool else {
            warn!(tool = %call.name, "Tool not found");
            let content = format!(
                "Error: {} is not a valid tool, try one of [{}].",
                call.name,
                self.tools.names().join(", ")
            );
            return Ok(ToolOutput::Message(
                ToolMessage::error(call.id, content).with_name(call.name),
            ));
        };
        tool.invoke(call.args_value(), config)
            .await
            .map_err(Error::Tool)
    }
}
