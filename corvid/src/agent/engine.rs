//! The agent engine: drives a conversation through the node graph until it
//! reaches [`Node::Terminal`].
//!
//! All per-run mutable data lives in a private `Run`, created once per
//! invoke and driven node by node. Both [`AgentEngine::invoke`] and
//! [`AgentEngine::stream`] run the same loop; streaming only attaches an
//! event channel.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt as _;
use futures::stream::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

use crate::callback::{NoopRunHooks, RunContext, SharedRunHooks};
use crate::chat::{ModelOptions, SharedChatModel, SharedModelFactory, ToolChoice};
use crate::command::{Command, CommandGraph, Goto};
use crate::error::{Error, Result};
use crate::message::{AiMessage, Message, ToolCall};
use crate::middleware::{
    HookUpdate, JumpTo, MiddlewarePipeline, ModelHandler, ModelRequest, NamedHook,
};
use crate::state::{ConversationState, MessagesUpdate, StatePatch};
use crate::stream::{MessageChunk, StreamAggregator};
use crate::tool::{ToolBox, ToolDefinition};

use super::builder::AgentBuilder;
use super::dispatcher::ToolDispatcher;
use super::graph::{Graph, Node};
use super::structured::{Extraction, Strategy, StructuredErrorPolicy, StructuredOutput, extract};
use super::tool_stage::{StageUpdate, ToolExecutionStage};

/// Content of the synthetic reply used when the step budget runs out.
pub const INSUFFICIENT_STEPS_MESSAGE: &str = "Sorry, need more steps to process this request.";

/// A stream of [`AgentEvent`]s.
pub type AgentEventStream<'a> = Pin<Box<dyn Stream<Item = Result<AgentEvent>> + Send + 'a>>;

/// Progress reported by [`AgentEngine::stream`].
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A fragment of the model response being generated.
    ModelChunk(MessageChunk),
    /// A message appended to the conversation.
    Message(Message),
    /// The run finished; carries the final state.
    Done(Box<ConversationState>),
}

/// Per-invoke configuration.
#[derive(Clone, Default)]
pub struct RunConfig {
    /// Cancellation signal for the whole run.
    pub signal: Option<CancellationToken>,
    /// Lifecycle observer.
    pub hooks: Option<SharedRunHooks>,
}

impl RunConfig {
    /// Create an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cancellation signal.
    #[must_use]
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Set the lifecycle observer.
    #[must_use]
    pub fn with_hooks(mut self, hooks: SharedRunHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("signal", &self.signal)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

/// Where the model for a run comes from.
#[derive(Clone)]
pub(crate) enum ModelSource {
    Fixed(SharedChatModel),
    Factory(SharedModelFactory),
}

/// A configured agent. Build one with [`AgentEngine::builder`].
pub struct AgentEngine {
    pub(crate) name: String,
    pub(crate) model: ModelSource,
    pub(crate) dispatcher: ToolDispatcher,
    pub(crate) pipeline: MiddlewarePipeline,
    pub(crate) graph: Graph,
    pub(crate) structured: Option<StructuredOutput>,
    pub(crate) error_policy: StructuredErrorPolicy,
    pub(crate) system_prompt: Option<String>,
    pub(crate) max_tool_concurrency: Option<usize>,
}

impl AgentEngine {
    /// Start configuring an agent.
    #[must_use]
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Agent name, used in logs and hooks.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every tool the agent can dispatch, middleware tools included.
    #[must_use]
    pub const fn tools(&self) -> &ToolBox {
        self.dispatcher.tools()
    }

    /// The composed middleware.
    #[must_use]
    pub const fn pipeline(&self) -> &MiddlewarePipeline {
        &self.pipeline
    }

    /// The node topology.
    #[must_use]
    pub const fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Run a conversation to completion.
    ///
    /// Middleware state keys missing from `state` are filled from the
    /// declared defaults. If the latest AI message still waits on tool
    /// calls, the run resumes at tool execution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] when a tool suspends the run,
    /// [`Error::Cancelled`] when the signal fires, and any fatal model,
    /// middleware, structured-output or configuration error.
    pub fn invoke<'a>(
        &'a self,
        state: ConversationState,
        config: RunConfig,
    ) -> Pin<Box<dyn Future<Output = Result<ConversationState>> + Send + 'a>> {
        Box::pin(self.execute(state, config, None).instrument(self.span()))
    }

    /// Run a conversation, reporting progress as it happens.
    ///
    /// Model chunks are forwarded when the model supports streaming. The
    /// last event is [`AgentEvent::Done`].
    pub fn stream<'a>(&'a self, state: ConversationState, config: RunConfig) -> AgentEventStream<'a> {
        Box::pin(self.stream_inner(state, config))
    }

    // The `tail_expr_drop_order` warning originates inside the `try_stream!`
    // macro expansion and is a known upstream issue in `async-stream`.
    #[allow(tail_expr_drop_order)]
    fn stream_inner(
        &self,
        state: ConversationState,
        config: RunConfig,
    ) -> impl Stream<Item = Result<AgentEvent>> + Send + '_ {
        async_stream::try_stream! {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let run = self.execute(state, config, Some(tx)).instrument(self.span());
            tokio::pin!(run);

            let final_state = loop {
                let step = tokio::select! {
                    biased;
                    Some(event) = rx.recv() => Step::Event(event),
                    result = &mut run => Step::Finished(result),
                };
                match step {
                    Step::Event(event) => yield event,
                    Step::Finished(result) => break result?,
                }
            };
            while let Ok(event) = rx.try_recv() {
                yield event;
            }
            yield AgentEvent::Done(Box::new(final_state));
        }
    }

    fn span(&self) -> tracing::Span {
        info_span!(
            "agent",
            agent.name = %self.name,
            agent.tools = tracing::field::Empty,
            agent.steps = tracing::field::Empty,
            error = tracing::field::Empty,
        )
    }

    async fn resolve_model(&self) -> Result<SharedChatModel> {
        match &self.model {
            ModelSource::Fixed(model) => Ok(Arc::clone(model)),
            ModelSource::Factory(factory) => factory.create().await,
        }
    }

    async fn execute(
        &self,
        mut state: ConversationState,
        config: RunConfig,
        events: Option<mpsc::UnboundedSender<AgentEvent>>,
    ) -> Result<ConversationState> {
        let hooks: SharedRunHooks = config.hooks.unwrap_or_else(|| Arc::new(NoopRunHooks));
        let signal = config.signal.unwrap_or_default();

        let model = self.resolve_model().await?;
        let strategy = self
            .structured
            .as_ref()
            .map(|s| s.resolve(model.as_ref()))
            .transpose()?;

        // Outputs of an earlier invoke never carry over.
        state.structured_response = None;
        state.parent_command = None;
        state.fill_defaults(self.pipeline.state_defaults());
        let ctx = RunContext::new()
            .with_agent_name(&self.name)
            .with_signal(signal)
            .with_remaining_steps(state.remaining_steps);

        let tool_names = self.tools().names();
        tracing::Span::current().record("agent.tools", tracing::field::debug(&tool_names));
        info!(
            agent = %self.name,
            model = %model.model_name(),
            tools = ?tool_names,
            structured = strategy.is_some(),
            "Agent run started",
        );

        let mut run = Run {
            engine: self,
            model,
            strategy,
            state,
            ctx,
            hooks: Arc::clone(&hooks),
            events,
            model_input: None,
            request: None,
            jump: None,
            retry: false,
        };

        hooks.on_agent_start(&run.ctx, &self.name).await;
        match run.drive().await {
            Ok(()) => {
                tracing::Span::current().record("agent.steps", run.ctx.step());
                info!(agent = %self.name, steps = run.ctx.step(), "Agent run completed");
                hooks.on_agent_end(&run.ctx, &self.name, &run.state).await;
                Ok(run.state)
            }
            Err(e) => {
                tracing::Span::current().record("error", tracing::field::display(&e));
                match &e {
                    Error::Interrupted { interrupt, .. } => {
                        info!(agent = %self.name, interrupt = %interrupt, "Agent run interrupted");
                        hooks.on_interrupt(&run.ctx, &self.name, interrupt).await;
                    }
                    Error::Cancelled => {
                        info!(agent = %self.name, step = run.ctx.step(), "Agent run cancelled");
                        hooks.on_error(&run.ctx, &self.name, &e).await;
                    }
                    _ => {
                        error!(error = %e, agent = %self.name, step = run.ctx.step(), "Agent run failed");
                        hooks.on_error(&run.ctx, &self.name, &e).await;
                    }
                }
                Err(e)
            }
        }
    }
}

impl fmt::Debug for AgentEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentEngine")
            .field("name", &self.name)
            .field("tools", self.tools())
            .field("pipeline", &self.pipeline)
            .field("structured", &self.structured)
            .field("max_tool_concurrency", &self.max_tool_concurrency)
            .finish_non_exhaustive()
    }
}

enum Step {
    Event(AgentEvent),
    Finished(Result<ConversationState>),
}

/// Which kind of hook is running; decides how a jump is honored.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    BeforeAgent,
    BeforeModel,
    AfterModel,
    AfterAgent,
}

struct Run<'a> {
    engine: &'a AgentEngine,
    model: SharedChatModel,
    strategy: Option<Strategy>,
    state: ConversationState,
    ctx: RunContext,
    hooks: SharedRunHooks,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
    /// Input override for the next model call only.
    model_input: Option<Vec<Message>>,
    request: Option<ModelRequest>,
    /// Jump requested by the last `after_model` hook.
    jump: Option<JumpTo>,
    /// The last model turn failed structured extraction.
    retry: bool,
}

impl Run<'_> {
    async fn drive(&mut self) -> Result<()> {
        let engine = self.engine;
        let graph = engine.graph;
        let pipeline = &engine.pipeline;
        let mut node = graph.resume(&self.state);

        while node != Node::Terminal {
            if self.ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            debug!(agent = %engine.name, node = %node, "Entering node");
            node = match node {
                Node::BeforeAgent(i) => {
                    self.run_hook(pipeline.before_agent(), i, Phase::BeforeAgent, graph.next(node))
                        .await?
                }
                Node::BeforeModel(i) => {
                    self.run_hook(pipeline.before_model(), i, Phase::BeforeModel, graph.next(node))
                        .await?
                }
                Node::PrepareRequest => {
                    self.request = Some(self.build_request());
                    graph.next(node)
                }
                Node::ModelCall => {
                    self.call_model().await?;
                    graph.next(node)
                }
                Node::AfterModel(i) => {
                    self.run_hook(pipeline.after_model(), i, Phase::AfterModel, graph.next(node))
                        .await?
                }
                Node::RouteDecision => self.route(),
                Node::ToolExecution => self.execute_tools().await?,
                Node::AfterAgent(i) => {
                    self.run_hook(pipeline.after_agent(), i, Phase::AfterAgent, graph.next(node))
                        .await?
                }
                Node::Terminal => Node::Terminal,
            };
        }
        Ok(())
    }

    fn apply(&mut self, patch: StatePatch) {
        if let (Some(events), Some(MessagesUpdate::Append(messages))) = (&self.events, &patch.messages)
        {
            for message in messages {
                let _ = events.send(AgentEvent::Message(message.clone()));
            }
        }
        self.state.apply(patch);
    }

    fn append(&mut self, message: impl Into<Message>) {
        self.apply(StatePatch::new().message(message));
    }

    async fn run_hook(
        &mut self,
        hooks: &[NamedHook],
        index: usize,
        phase: Phase,
        next: Node,
    ) -> Result<Node> {
        let Some(named) = hooks.get(index) else {
            return Ok(next);
        };
        let update = named.hook.run(&self.state, &self.ctx).await.inspect_err(|e| {
            if !e.is_interrupt() {
                error!(error = %e, middleware = %named.name, "Middleware hook failed");
            }
        })?;
        let Some(HookUpdate {
            patch,
            model_input,
            jump_to,
        }) = update
        else {
            return Ok(next);
        };

        self.apply(patch);
        if model_input.is_some() {
            self.model_input = model_input;
        }
        let Some(to) = jump_to else {
            return Ok(next);
        };
        debug!(middleware = %named.name, jump = ?to, "Hook requested a jump");
        let graph = self.engine.graph;
        Ok(match phase {
            Phase::AfterAgent => next,
            Phase::AfterModel if next == Node::RouteDecision => {
                self.jump = Some(to);
                next
            }
            Phase::BeforeAgent | Phase::BeforeModel | Phase::AfterModel => graph.jump(to),
        })
    }

    fn structured_pending(&self) -> bool {
        self.strategy.is_some() && self.state.structured_response.is_none()
    }

    fn is_extraction_call(&self, call: &ToolCall) -> bool {
        self.strategy
            .as_ref()
            .is_some_and(|s| s.is_extraction_tool(&call.name))
    }

    fn build_request(&mut self) -> ModelRequest {
        let mut tools: Vec<ToolDefinition> = self.engine.tools().definitions();
        if let Some(strategy) = &self.strategy {
            tools.extend(strategy.tool_definitions());
        }
        ModelRequest {
            model: Arc::clone(&self.model),
            messages: self
                .model_input
                .take()
                .unwrap_or_else(|| self.state.messages.clone()),
            system_prompt: self.engine.system_prompt.clone(),
            tools,
            tool_choice: None,
            state: Arc::new(self.state.clone()),
            signal: self.ctx.signal().clone(),
        }
    }

    async fn call_model(&mut self) -> Result<()> {
        let request = match self.request.take() {
            Some(request) => request,
            None => self.build_request(),
        };

        if self.state.remaining_steps == 0 {
            info!(agent = %self.engine.name, "Step budget exhausted before model call");
            self.append(AiMessage::new(INSUFFICIENT_STEPS_MESSAGE));
            return Ok(());
        }

        self.ctx.advance_step();
        let step = self.ctx.step();
        debug!(agent = %self.engine.name, step, model = %request.model.model_name(), "Calling model");
        self.hooks
            .on_model_start(&self.ctx, &self.engine.name, &request.input_messages())
            .await;

        let base = ModelBase {
            tools: self.engine.tools(),
            strategy: self.strategy.as_ref(),
            signal: self.ctx.signal(),
            events: self.events.as_ref(),
        };
        let response = self
            .engine
            .pipeline
            .call_model(request, &base)
            .await
            .inspect_err(|e| {
                error!(error = %e, agent = %self.engine.name, step, "Model call failed");
            })?;

        self.state.remaining_steps = self.state.remaining_steps.saturating_sub(1);
        self.ctx.set_remaining_steps(self.state.remaining_steps);
        self.hooks
            .on_model_end(&self.ctx, &self.engine.name, &response)
            .await;

        if self.exceeds_budget(&response) {
            info!(
                agent = %self.engine.name,
                tool_calls = response.tool_calls.len(),
                "Not enough steps left for requested tool calls",
            );
            let mut synthetic = AiMessage::new(INSUFFICIENT_STEPS_MESSAGE);
            synthetic.id = response.id;
            self.append(synthetic);
            return Ok(());
        }

        let Some(strategy) = &self.strategy else {
            self.append(response);
            return Ok(());
        };
        match extract(strategy, &self.engine.error_policy, &response).await? {
            Extraction::None => self.append(response),
            Extraction::Done { patch, .. } => {
                debug!(agent = %self.engine.name, "Structured response recorded");
                self.apply(patch);
            }
            Extraction::Retry(patch) => {
                self.apply(patch);
                self.retry = true;
            }
        }
        Ok(())
    }

    /// Tool calls requested with no budget left for the turn that would
    /// consume their results.
    ///
    /// A response whose calls are all return-direct or extraction calls is
    /// kept: answering them ends the run without another model turn, so no
    /// step is needed.
    fn exceeds_budget(&self, response: &AiMessage) -> bool {
        if !response.has_tool_calls() || self.state.remaining_steps > 0 {
            return false;
        }
        let tools = self.engine.tools();
        let finishing = response
            .tool_calls
            .iter()
            .all(|c| tools.is_return_direct(&c.name) || self.is_extraction_call(c));
        let extracting = response.tool_calls.iter().any(|c| self.is_extraction_call(c));
        !(finishing && (extracting || !self.structured_pending()))
    }

    fn route(&mut self) -> Node {
        let graph = self.engine.graph;
        let jump = self.jump.take();

        if std::mem::take(&mut self.retry) {
            return if self.state.pending_tool_calls().is_empty() {
                Node::PrepareRequest
            } else {
                Node::ToolExecution
            };
        }
        if let Some(Message::Ai(ai)) = self.state.last_message()
            && !ai.has_tool_calls()
        {
            return graph.finish();
        }
        if let Some(to) = jump {
            if to == JumpTo::Tools && self.engine.tools().is_empty() {
                return graph.finish();
            }
            return graph.jump(to);
        }
        if !self.state.pending_tool_calls().is_empty() {
            return Node::ToolExecution;
        }
        let extracted = self
            .state
            .last_ai()
            .is_some_and(|(_, ai)| ai.tool_calls.iter().any(|c| self.is_extraction_call(c)));
        if self.structured_pending() && !extracted {
            return Node::PrepareRequest;
        }
        // Every call was answered by an after-model hook.
        if !extracted && matches!(self.state.last_message(), Some(Message::Tool(_))) {
            return graph.loop_entry();
        }
        graph.finish()
    }

    async fn execute_tools(&mut self) -> Result<Node> {
        let engine = self.engine;
        let graph = engine.graph;
        if self.state.pending_tool_calls().is_empty() {
            // An empty stage goes straight to the model, which spends a step.
            debug!(agent = %engine.name, "No pending tool calls, returning to the model");
            return Ok(Node::PrepareRequest);
        }
        let mut stage = ToolExecutionStage::new(&engine.dispatcher)
            .with_max_concurrency(engine.max_tool_concurrency);
        if engine.pipeline.wraps_tool_calls() {
            stage = stage.with_pipeline(&engine.pipeline);
        }
        let output = stage
            .run(&self.state, &self.ctx, self.hooks.as_ref())
            .await?;

        let mut redirect = None;
        for update in output.into_updates() {
            match update {
                StageUpdate::Message(message) => self.append(message),
                StageUpdate::Command(command) => {
                    if let Some(target) = self.apply_command(command)? {
                        redirect.get_or_insert(target);
                    }
                }
            }
        }

        if self.state.parent_command.is_some() {
            debug!(agent = %engine.name, "Handing control to the parent graph");
            return Ok(graph.finish());
        }
        if let Some(target) = redirect {
            return Ok(target);
        }
        if self.strategy.is_some() && self.state.structured_response.is_some() {
            return Ok(graph.finish());
        }
        if self.answered_by_return_direct() {
            return Ok(if self.structured_pending() {
                Node::PrepareRequest
            } else {
                graph.finish()
            });
        }
        Ok(graph.loop_entry())
    }

    fn apply_command(&mut self, command: Command) -> Result<Option<Node>> {
        if command.graph == CommandGraph::Parent {
            if self.state.parent_command.is_none() {
                self.state.parent_command = Some(command);
            }
            return Ok(None);
        }
        let Command { update, goto, .. } = command;
        if let Some(patch) = update {
            self.apply(patch);
        }
        let graph = self.engine.graph;
        match goto {
            None => Ok(None),
            Some(Goto::Node(name)) => match name.as_str() {
                "model" | "model_request" => Ok(Some(Node::PrepareRequest)),
                "tools" => Ok(Some(Node::ToolExecution)),
                "end" | "__end__" => Ok(Some(graph.finish())),
                other => Err(Error::agent(format!(
                    "tool command targets unknown node '{other}'"
                ))),
            },
            Some(Goto::Send(_)) => Err(Error::agent(
                "fan-out commands must target the parent graph",
            )),
        }
    }

    /// Returns `true` if the latest tool message answers a return-direct tool.
    fn answered_by_return_direct(&self) -> bool {
        let Some((index, ai)) = self.state.last_ai() else {
            return false;
        };
        let Some(answer) = self.state.messages[index + 1..]
            .iter()
            .rev()
            .find_map(Message::as_tool)
        else {
            return false;
        };
        let name = ai
            .tool_calls
            .iter()
            .find(|c| c.id == answer.tool_call_id)
            .map(|c| c.name.as_str())
            .or(answer.name.as_deref());
        name.is_some_and(|n| self.engine.tools().is_return_direct(n))
    }
}

/// Innermost model handler: binds options and calls the model.
struct ModelBase<'a> {
    tools: &'a ToolBox,
    strategy: Option<&'a Strategy>,
    signal: &'a CancellationToken,
    events: Option<&'a mpsc::UnboundedSender<AgentEvent>>,
}

#[async_trait]
impl ModelHandler for ModelBase<'_> {
    fn is_registered(&self, name: &str) -> bool {
        self.tools.contains(name) || self.strategy.is_some_and(|s| s.is_extraction_tool(name))
    }

    async fn call(&self, request: ModelRequest) -> Result<AiMessage> {
        let messages = request.input_messages();
        let ModelRequest {
            model,
            tools,
            tool_choice,
            ..
        } = request;
        let tool_choice = match (tool_choice, self.strategy) {
            (None, Some(Strategy::Tool(_))) => Some(ToolChoice::Any),
            (choice, _) => choice,
        };
        let options = ModelOptions {
            tools,
            tool_choice,
            response_format: self.strategy.and_then(Strategy::response_format),
            signal: self.signal.clone(),
        };

        let call = async {
            match self.events {
                Some(events) if model.supports_streaming() => {
                    let mut chunks = model.stream(&messages, &options).await?;
                    let mut aggregator = StreamAggregator::new();
                    while let Some(chunk) = chunks.next().await {
                        let chunk = chunk?;
                        let _ = events.send(AgentEvent::ModelChunk(chunk.clone()));
                        aggregator.apply(chunk);
                    }
                    debug!(chunks = aggregator.chunk_count(), "Model stream finished");
                    aggregator.into_ai_message()
                }
                _ => model.invoke(&messages, &options).await,
            }
        };

        tokio::select! {
            biased;
            () = self.signal.cancelled() => Err(Error::Cancelled),
            response = call => response,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt as _;
    use serde_json::{Value, json};

    use crate::chat::ChatModel;
    use crate::error::ToolError;
    use crate::middleware::{Middleware, hook_fn};
    use crate::stream::MessageChunkStream;
    use crate::tool::{FnTool, ToolConfig, ToolOutput};

    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<AiMessage>>,
        seen: Mutex<Vec<Vec<Message>>>,
        streaming: bool,
    }

    impl Scripted {
        fn new(replies: Vec<AiMessage>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                ..Self::default()
            })
        }

        fn streaming(replies: Vec<AiMessage>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                streaming: true,
                ..Self::default()
            })
        }

        fn next(&self, messages: &[Message]) -> Result<AiMessage> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::agent("script exhausted"))
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatModel for Scripted {
        async fn invoke(&self, messages: &[Message], _options: &ModelOptions) -> Result<AiMessage> {
            self.next(messages)
        }

        async fn stream(
            &self,
            messages: &[Message],
            _options: &ModelOptions,
        ) -> Result<MessageChunkStream> {
            let reply = self.next(messages)?;
            let (head, tail) = reply.content.split_at(reply.content.len() / 2);
            let chunks: Vec<Result<MessageChunk>> = vec![
                Ok(MessageChunk {
                    id: reply.id.clone(),
                    ..MessageChunk::text(head)
                }),
                Ok(MessageChunk::text(tail)),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        fn supports_streaming(&self) -> bool {
            self.streaming
        }
    }

    fn call(id: &str, name: &str) -> AiMessage {
        AiMessage::with_tool_calls(vec![ToolCall::new(id, name, json!({}))])
    }

    fn tool_returning(
        name: &'static str,
        output: impl Fn() -> std::result::Result<ToolOutput, ToolError> + Send + Sync + 'static,
    ) -> impl crate::tool::DynTool + 'static {
        let output = Arc::new(output);
        FnTool::new(name, "Test tool", json!({"type": "object"}), move |_args: Value, _cfg: ToolConfig| {
            let output = Arc::clone(&output);
            async move { output() }
        })
    }

    fn engine(model: &Arc<Scripted>) -> AgentBuilder {
        let shared: SharedChatModel = Arc::<Scripted>::clone(model);
        AgentEngine::builder().shared_model(shared)
    }

    mod loop_basics {
        use super::*;

        #[tokio::test]
        async fn plain_answer_finishes() {
            let model = Scripted::new(vec![AiMessage::new("hi")]);
            let agent = engine(&model).build().unwrap();
            let state = agent
                .invoke(ConversationState::from_user("hello"), RunConfig::new())
                .await
                .unwrap();
            assert_eq!(state.messages.len(), 2);
            assert_eq!(state.messages[1].text(), "hi");
            assert_eq!(state.remaining_steps, 24);
        }

        #[tokio::test]
        async fn tool_turn_loops_back_to_the_model() {
            let model = Scripted::new(vec![call("c1", "echo"), AiMessage::new("done")]);
            let agent = engine(&model)
                .tool(tool_returning("echo", || Ok("pong".into())))
                .build()
                .unwrap();
            let state = agent
                .invoke(ConversationState::from_user("ping"), RunConfig::new())
                .await
                .unwrap();
            let roles: Vec<_> = state.messages.iter().map(Message::role).collect();
            assert_eq!(roles, vec!["user", "ai", "tool", "ai"]);
            assert_eq!(state.messages[2].text(), "pong");
            assert_eq!(model.calls(), 2);
        }

        #[tokio::test]
        async fn missing_state_keys_get_defaults() {
            let model = Scripted::new(vec![AiMessage::new("ok")]);
            let agent = engine(&model)
                .middleware(
                    Middleware::new("counter")
                        .state_default("count", json!(0))
                        .state_default("label", json!("none")),
                )
                .build()
                .unwrap();
            let state = ConversationState::from_user("hi").with_state("count", json!(7));
            let state = agent.invoke(state, RunConfig::new()).await.unwrap();
            assert_eq!(state.middleware_state["count"], json!(7));
            assert_eq!(state.middleware_state["label"], json!("none"));
        }

        #[tokio::test]
        async fn factory_runs_once_per_invoke() {
            let created = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&created);
            let factory = move || -> Result<SharedChatModel> {
                counter.fetch_add(1, Ordering::SeqCst);
                let model: SharedChatModel = Scripted::new(vec![AiMessage::new("ok")]);
                Ok(model)
            };
            let agent = AgentEngine::builder().model_factory(factory).build().unwrap();
            for _ in 0..2 {
                agent
                    .invoke(ConversationState::from_user("hi"), RunConfig::new())
                    .await
                    .unwrap();
            }
            assert_eq!(created.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn cancelled_signal_stops_before_the_model() {
            let model = Scripted::new(vec![AiMessage::new("never")]);
            let agent = engine(&model).build().unwrap();
            let signal = CancellationToken::new();
            signal.cancel();
            let result = agent
                .invoke(
                    ConversationState::from_user("hi"),
                    RunConfig::new().with_signal(signal),
                )
                .await;
            assert!(matches!(result, Err(Error::Cancelled)));
            assert_eq!(model.calls(), 0);
        }
    }

    mod budget {
        use super::*;

        #[tokio::test]
        async fn zero_budget_answers_without_calling_the_model() {
            let model = Scripted::new(vec![AiMessage::new("never")]);
            let agent = engine(&model).build().unwrap();
            let state = ConversationState::from_user("hi").with_remaining_steps(0);
            let state = agent.invoke(state, RunConfig::new()).await.unwrap();
            assert_eq!(state.messages.last().unwrap().text(), INSUFFICIENT_STEPS_MESSAGE);
            assert_eq!(model.calls(), 0);
        }

        #[tokio::test]
        async fn last_step_tool_calls_are_replaced() {
            let model = Scripted::new(vec![call("c1", "echo").id("m1")]);
            let agent = engine(&model)
                .tool(tool_returning("echo", || Ok("pong".into())))
                .build()
                .unwrap();
            let state = ConversationState::from_user("hi").with_remaining_steps(1);
            let state = agent.invoke(state, RunConfig::new()).await.unwrap();
            let last = state.messages.last().and_then(Message::as_ai).unwrap();
            assert_eq!(last.content, INSUFFICIENT_STEPS_MESSAGE);
            assert_eq!(last.id.as_deref(), Some("m1"));
            assert!(!last.has_tool_calls());
            assert_eq!(state.remaining_steps, 0);
        }

        #[tokio::test]
        async fn last_step_return_direct_calls_still_run() {
            let model = Scripted::new(vec![call("c1", "finish")]);
            let finish = FnTool::new(
                "finish",
                "Ends the run",
                json!({"type": "object"}),
                |_args: Value, _cfg: ToolConfig| async { Ok(ToolOutput::from("finished")) },
            )
            .with_return_direct(true);
            let agent = engine(&model).tool(finish).build().unwrap();
            let state = ConversationState::from_user("hi").with_remaining_steps(1);
            let state = agent.invoke(state, RunConfig::new()).await.unwrap();
            let last = state.messages.last().and_then(Message::as_tool).unwrap();
            assert_eq!(last.content, "finished");
            assert_eq!(model.calls(), 1);
        }
    }

    mod hooks {
        use super::*;

        #[tokio::test]
        async fn model_input_override_is_not_persisted() {
            let model = Scripted::new(vec![call("c1", "echo"), AiMessage::new("done")]);
            let agent = engine(&model)
                .tool(tool_returning("echo", || Ok("pong".into())))
                .middleware(Middleware::new("summarize").before_model(hook_fn(|state, _| {
                    Ok((state.messages.len() == 1)
                        .then(|| HookUpdate::model_input(vec![Message::user("summary")])))
                })))
                .build()
                .unwrap();
            let state = agent
                .invoke(ConversationState::from_user("original"), RunConfig::new())
                .await
                .unwrap();

            let seen = model.seen.lock().unwrap();
            assert_eq!(seen[0].len(), 1);
            assert_eq!(seen[0][0].text(), "summary");
            assert_eq!(seen[1].len(), 3);
            assert_eq!(seen[1][0].text(), "original");
            assert_eq!(state.messages[0].text(), "original");
        }

        #[tokio::test]
        async fn jump_to_end_skips_the_model() {
            let model = Scripted::new(vec![AiMessage::new("never")]);
            let agent = engine(&model)
                .middleware(
                    Middleware::new("gate")
                        .before_model(hook_fn(|_, _| Ok(Some(HookUpdate::jump(JumpTo::End))))),
                )
                .build()
                .unwrap();
            let state = agent
                .invoke(ConversationState::from_user("hi"), RunConfig::new())
                .await
                .unwrap();
            assert_eq!(state.messages.len(), 1);
            assert_eq!(model.calls(), 0);
        }

        #[tokio::test]
        async fn after_agent_runs_once_at_the_end() {
            let model = Scripted::new(vec![AiMessage::new("ok")]);
            let agent = engine(&model)
                .middleware(Middleware::new("audit").after_agent(hook_fn(|_, _| {
                    Ok(Some(StatePatch::new().state("audited", json!(true)).into()))
                })))
                .build()
                .unwrap();
            let state = agent
                .invoke(ConversationState::from_user("hi"), RunConfig::new())
                .await
                .unwrap();
            assert_eq!(state.middleware_state["audited"], json!(true));
        }
    }

    mod commands {
        use super::*;

        #[tokio::test]
        async fn goto_end_applies_update_and_stops() {
            let model = Scripted::new(vec![call("c1", "finish")]);
            let agent = engine(&model)
                .tool(tool_returning("finish", || {
                    Ok(Command::new()
                        .update(
                            StatePatch::new()
                                .message(Message::tool("c1", "finished"))
                                .state("flag", json!(true)),
                        )
                        .goto("end")
                        .into())
                }))
                .build()
                .unwrap();
            let state = agent
                .invoke(ConversationState::from_user("hi"), RunConfig::new())
                .await
                .unwrap();
            assert_eq!(state.middleware_state["flag"], json!(true));
            assert_eq!(state.messages.last().unwrap().text(), "finished");
            assert_eq!(model.calls(), 1);
        }

        #[tokio::test]
        async fn parent_command_is_surfaced() {
            let model = Scripted::new(vec![call("c1", "handoff")]);
            let agent = engine(&model)
                .tool(tool_returning("handoff", || {
                    Ok(Command::new().goto("billing").to_parent().into())
                }))
                .build()
                .unwrap();
            let state = agent
                .invoke(ConversationState::from_user("hi"), RunConfig::new())
                .await
                .unwrap();
            let command = state.parent_command.unwrap();
            assert_eq!(command.graph, CommandGraph::Parent);
            assert_eq!(command.goto, Some(Goto::Node("billing".into())));
            assert_eq!(model.calls(), 1);
        }

        #[tokio::test]
        async fn unknown_goto_is_an_error() {
            let model = Scripted::new(vec![call("c1", "lost")]);
            let agent = engine(&model)
                .tool(tool_returning("lost", || Ok(Command::new().goto("nowhere").into())))
                .build()
                .unwrap();
            let result = agent
                .invoke(ConversationState::from_user("hi"), RunConfig::new())
                .await;
            match result {
                Err(Error::Agent(message)) => assert!(message.contains("nowhere")),
                other => panic!("expected an agent error, got {other:?}"),
            }
        }
    }

    mod interrupts {
        use super::*;

        #[tokio::test]
        async fn interrupt_suspends_and_resume_continues() {
            let model = Scripted::new(vec![call("c1", "approve"), AiMessage::new("approved")]);
            let agent = engine(&model)
                .tool(tool_returning("approve", || {
                    Err(ToolError::interrupt(json!({"question": "ship it?"})))
                }))
                .build()
                .unwrap();
            let result = agent
                .invoke(ConversationState::from_user("deploy"), RunConfig::new())
                .await;
            let Err(Error::Interrupted { interrupt, state }) = result else {
                panic!("expected an interrupt");
            };
            assert_eq!(interrupt.tool_call_id.as_deref(), Some("c1"));
            assert!(state.awaits_tools());

            let mut state = *state;
            state.messages.push(Message::tool("c1", "yes"));
            let state = agent.invoke(state, RunConfig::new()).await.unwrap();
            assert_eq!(state.messages.last().unwrap().text(), "approved");
            assert_eq!(model.calls(), 2);
        }
    }

    mod streaming {
        use super::*;

        #[tokio::test]
        async fn stream_forwards_chunks_and_ends_with_done() {
            let model = Scripted::streaming(vec![AiMessage::new("hello there").id("m1")]);
            let agent = engine(&model).build().unwrap();
            let events: Vec<AgentEvent> = agent
                .stream(ConversationState::from_user("hi"), RunConfig::new())
                .map(|e| e.unwrap())
                .collect()
                .await;

            let chunks = events
                .iter()
                .filter(|e| matches!(e, AgentEvent::ModelChunk(_)))
                .count();
            assert_eq!(chunks, 2);
            assert!(events.iter().any(
                |e| matches!(e, AgentEvent::Message(Message::Ai(ai)) if ai.content == "hello there")
            ));
            let Some(AgentEvent::Done(state)) = events.last() else {
                panic!("stream must end with Done");
            };
            assert_eq!(state.messages.len(), 2);
        }

        #[tokio::test]
        async fn stream_surfaces_errors() {
            let model = Scripted::new(vec![]);
            let agent = engine(&model).build().unwrap();
            let events: Vec<Result<AgentEvent>> = agent
                .stream(ConversationState::from_user("hi"), RunConfig::new())
                .collect()
                .await;
            assert!(matches!(events.last(), Some(Err(Error::Agent(_)))));
        }
    }
}
