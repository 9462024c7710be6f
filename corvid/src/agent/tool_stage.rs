//! One turn of tool execution: pre-emption, bounded fan-out, barrier, merge.

use std::sync::Arc;

use futures::future::join_all;

use crate::callback::{RunContext, RunHooks};
use crate::command::{Command, CommandGraph, Goto};
use crate::error::{Error, Result};
use crate::message::{Message, ToolCall};
use crate::middleware::MiddlewarePipeline;
use crate::state::{ConversationState, StatePatch};
use crate::tool::ToolOutput;

use super::dispatcher::{ToolDispatcher, value_message};

/// One merged item of a tool stage, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum StageUpdate {
    /// A plain tool message.
    Message(Message),
    /// A control signal.
    Command(Command),
}

/// What one tool stage produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolStageOutput {
    /// Every call answered with a plain message.
    Messages(Vec<Message>),
    /// At least one call answered with a command. Parent fan-outs are
    /// coalesced into one command placed last.
    Mixed(Vec<StageUpdate>),
}

impl ToolStageOutput {
    /// Returns `true` if no call was dispatched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Messages(messages) => messages.is_empty(),
            Self::Mixed(updates) => updates.is_empty(),
        }
    }

    /// Plain messages, in call order.
    #[must_use]
    pub fn messages(&self) -> Vec<&Message> {
        match self {
            Self::Messages(messages) => messages.iter().collect(),
            Self::Mixed(updates) => updates
                .iter()
                .filter_map(|u| match u {
                    StageUpdate::Message(m) => Some(m),
                    StageUpdate::Command(_) => None,
                })
                .collect(),
        }
    }

    /// Commands, in call order.
    #[must_use]
    pub fn commands(&self) -> Vec<&Command> {
        match self {
            Self::Messages(_) => Vec::new(),
            Self::Mixed(updates) => updates
                .iter()
                .filter_map(|u| match u {
                    StageUpdate::Command(c) => Some(c),
                    StageUpdate::Message(_) => None,
                })
                .collect(),
        }
    }

    /// Flatten into updates, in call order.
    #[must_use]
    pub fn into_updates(self) -> Vec<StageUpdate> {
        match self {
            Self::Messages(messages) => messages.into_iter().map(StageUpdate::Message).collect(),
            Self::Mixed(updates) => updates,
        }
    }
}

/// Executes every unanswered tool call of the latest AI message.
#[derive(Debug, Clone, Copy)]
pub struct ToolExecutionStage<'a> {
    dispatcher: &'a ToolDispatcher,
    pipeline: Option<&'a MiddlewarePipeline>,
    max_concurrency: Option<usize>,
}

impl<'a> ToolExecutionStage<'a> {
    /// Create a stage over a dispatcher.
    #[must_use]
    pub const fn new(dispatcher: &'a ToolDispatcher) -> Self {
        Self {
            dispatcher,
            pipeline: None,
            max_concurrency: None,
        }
    }

    /// Bound how many calls run at once. `None` runs all calls together.
    #[must_use]
    pub const fn with_max_concurrency(mut self, max: Option<usize>) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Route every dispatch through the `wrap_tool_call` chain.
    #[must_use]
    pub const fn with_pipeline(mut self, pipeline: &'a MiddlewarePipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Run the stage against a state snapshot.
    ///
    /// Calls already answered by a tool message are skipped. The remaining
    /// calls run concurrently; the stage returns only once all of them have
    /// settled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the run's signal fires, and otherwise
    /// the first fatal dispatch error in call order.
    pub async fn run(
        &self,
        state: &ConversationState,
        ctx: &RunContext,
        hooks: &dyn RunHooks,
    ) -> Result<ToolStageOutput> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let calls: Vec<ToolCall> = state.pending_tool_calls().into_iter().cloned().collect();
        if calls.is_empty() {
            return Ok(ToolStageOutput::Messages(Vec::new()));
        }

        let snapshot = Arc::new(state.clone());
        let agent = ctx.agent_name().unwrap_or("agent");
        let concurrency = self.max_concurrency.unwrap_or(calls.len()).max(1);
        let mut results = Vec::with_capacity(calls.len());

        for chunk in calls.chunks(concurrency) {
            let futs = chunk
                .iter()
                .map(|call| self.run_one(call, Arc::clone(&snapshot), ctx, hooks, agent));
            results.extend(join_all(futs).await);
            if results.iter().any(Result::is_err) {
                break;
            }
        }
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let updates = results.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(merge(updates))
    }

    async fn run_one(
        &self,
        call: &ToolCall,
        snapshot: Arc<ConversationState>,
        ctx: &RunContext,
        hooks: &dyn RunHooks,
        agent: &str,
    ) -> Result<StageUpdate> {
        hooks.on_tool_start(ctx, agent, call).await;
        let output = match self
            .dispatcher
            .dispatch_with(call, snapshot, ctx.signal(), None, self.pipeline)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                hooks.on_tool_error(ctx, agent, call, &e).await;
                return Err(e);
            }
        };
        hooks.on_tool_end(ctx, agent, call, &output).await;
        Ok(match output {
            ToolOutput::Message(message) => StageUpdate::Message(message.into()),
            ToolOutput::Command(command) => StageUpdate::Command(command),
            ToolOutput::Value(value) => StageUpdate::Message(value_message(call, value).into()),
        })
    }
}

fn merge(updates: Vec<StageUpdate>) -> ToolStageOutput {
    if updates.iter().all(|u| matches!(u, StageUpdate::Message(_))) {
        return ToolStageOutput::Messages(
            updates
                .into_iter()
                .filter_map(|u| match u {
                    StageUpdate::Message(m) => Some(m),
                    StageUpdate::Command(_) => None,
                })
                .collect(),
        );
    }

    let mut merged = Vec::with_capacity(updates.len());
    let mut sends = Vec::new();
    let mut send_update: Option<StatePatch> = None;
    for update in updates {
        match update {
            StageUpdate::Command(command) if command.is_parent_send() => {
                if let Some(Goto::Send(targets)) = command.goto {
                    sends.extend(targets);
                }
                if let Some(patch) = command.update {
                    send_update.get_or_insert_with(StatePatch::new).merge(patch);
                }
            }
            other => merged.push(other),
        }
    }
    if !sends.is_empty() {
        merged.push(StageUpdate::Command(Command {
            update: send_update,
            goto: Some(Goto::Send(sends)),
            graph: CommandGraph::Parent,
        }));
    }
    ToolStageOutput::Mixed(merged)
}
