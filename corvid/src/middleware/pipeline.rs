//! Composition of the registered middleware into ordered hook lists and
//! nested call chains.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::chat::{SharedChatModel, ToolChoice};
use crate::error::{Error, Result};
use crate::message::{AiMessage, Message, ToolCall};
use crate::state::ConversationState;
use crate::tool::{SharedTool, ToolConfig, ToolDefinition, ToolOutput};

use super::{Middleware, StateHook, WrapModelCall, WrapToolCall};

/// A state hook tagged with the middleware that registered it.
#[derive(Clone)]
pub struct NamedHook {
    /// Owning middleware.
    pub name: String,
    /// The hook.
    pub hook: Arc<dyn StateHook>,
}

impl fmt::Debug for NamedHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedHook")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct Named<T: ?Sized> {
    name: String,
    inner: Arc<T>,
}

impl<T: ?Sized> Clone for Named<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

/// The request flowing through the `wrap_model_call` chain.
#[derive(Clone)]
pub struct ModelRequest {
    /// Model that will answer.
    pub model: SharedChatModel,
    /// Conversation sent to the model, without the system prompt.
    pub messages: Vec<Message>,
    /// System instructions prepended to `messages`.
    pub system_prompt: Option<String>,
    /// Tools bound to the call. Must stay a subset of the registered tools.
    pub tools: Vec<ToolDefinition>,
    /// Tool usage constraint.
    pub tool_choice: Option<ToolChoice>,
    /// Snapshot of the state the request was built from.
    pub state: Arc<ConversationState>,
    /// Cancellation signal of the run.
    pub signal: CancellationToken,
}

impl ModelRequest {
    /// Final message list: system prompt first, then the conversation.
    #[must_use]
    pub fn input_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(Message::system(prompt.clone()));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }
}

impl fmt::Debug for ModelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRequest")
            .field("model", &self.model.model_name())
            .field("messages", &self.messages.len())
            .field("system_prompt", &self.system_prompt)
            .field(
                "tools",
                &self.tools.iter().map(ToolDefinition::name).collect::<Vec<_>>(),
            )
            .field("tool_choice", &self.tool_choice)
            .finish_non_exhaustive()
    }
}

/// The request flowing through the `wrap_tool_call` chain.
#[derive(Clone)]
pub struct ToolCallRequest {
    /// The call being answered.
    pub call: ToolCall,
    /// The resolved tool, `None` when no tool has that name.
    pub tool: Option<SharedTool>,
    /// Snapshot shared by every dispatch of the turn.
    pub state: Arc<ConversationState>,
    /// Signal and call id handed to the tool.
    pub config: ToolConfig,
}

impl fmt::Debug for ToolCallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCallRequest")
            .field("call", &self.call)
            .field("resolved", &self.tool.is_some())
            .finish_non_exhaustive()
    }
}

/// The innermost model handler, supplied by the engine.
#[async_trait]
pub(crate) trait ModelHandler: Send + Sync {
    /// Returns `true` if `name` may be bound to a model call.
    fn is_registered(&self, name: &str) -> bool;

    async fn call(&self, request: ModelRequest) -> Result<AiMessage>;
}

/// The innermost tool handler, supplied by the dispatcher.
#[async_trait]
pub(crate) trait ToolHandler: Send + Sync {
    async fn call(&self, request: ToolCallRequest) -> Result<ToolOutput>;
}

/// The rest of the `wrap_model_call` chain.
///
/// `Copy`, so a wrapper may delegate more than once.
#[derive(Clone, Copy)]
pub struct ModelNext<'a> {
    caller: &'a str,
    wrappers: &'a [Named<dyn WrapModelCall>],
    base: &'a dyn ModelHandler,
}

impl ModelNext<'_> {
    /// Delegate to the next wrapper, or to the model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Middleware`] naming the calling middleware if the
    /// request binds a tool that was never registered, and otherwise
    /// whatever the rest of the chain returns.
    pub async fn run(self, request: ModelRequest) -> Result<AiMessage> {
        if let Some(unknown) = request
            .tools
            .iter()
            .find(|t| !self.base.is_registered(&t.name))
        {
            return Err(Error::middleware(
                self.caller,
                format!(
                    "request binds tool '{}' which is not registered with the agent",
                    unknown.name
                ),
            ));
        }
        match self.wrappers.split_first() {
            Some((first, rest)) => {
                let next = ModelNext {
                    caller: &first.name,
                    wrappers: rest,
                    base: self.base,
                };
                first.inner.wrap_model_call(request, next).await
            }
            None => self.base.call(request).await,
        }
    }
}

impl fmt::Debug for ModelNext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelNext")
            .field("caller", &self.caller)
            .field("remaining", &self.wrappers.len())
            .finish_non_exhaustive()
    }
}

/// The rest of the `wrap_tool_call` chain.
#[derive(Clone, Copy)]
pub struct ToolNext<'a> {
    wrappers: &'a [Named<dyn WrapToolCall>],
    base: &'a dyn ToolHandler,
}

impl ToolNext<'_> {
    /// Delegate to the next wrapper, or to the dispatcher.
    ///
    /// # Errors
    ///
    /// Propagates interrupts, cancellation and fatal tool errors.
    pub async fn run(self, request: ToolCallRequest) -> Result<ToolOutput> {
        match self.wrappers.split_first() {
            Some((first, rest)) => {
                let next = ToolNext {
                    wrappers: rest,
                    base: self.base,
                };
                first.inner.wrap_tool_call(request, next).await
            }
            None => self.base.call(request).await,
        }
    }
}

impl fmt::Debug for ToolNext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolNext")
            .field("remaining", &self.wrappers.len())
            .finish_non_exhaustive()
    }
}

/// The registered middleware, flattened into the sequences the engine runs.
///
/// Before hooks keep registration order; after hooks are stored already
/// reversed, so `m[i].before` and `m[i].after` bracket everything
/// registered after `m[i]`.
#[derive(Clone, Default)]
pub struct MiddlewarePipeline {
    names: Vec<String>,
    before_agent: Vec<NamedHook>,
    before_model: Vec<NamedHook>,
    after_model: Vec<NamedHook>,
    after_agent: Vec<NamedHook>,
    model_wrappers: Vec<Named<dyn WrapModelCall>>,
    tool_wrappers: Vec<Named<dyn WrapToolCall>>,
    tools: Vec<SharedTool>,
    state_defaults: Map<String, Value>,
}

impl MiddlewarePipeline {
    /// Flatten an ordered middleware list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if two middleware share a name.
    pub fn new(middleware: Vec<Middleware>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut pipeline = Self::default();

        for mw in middleware {
            if !seen.insert(mw.name.clone()) {
                return Err(Error::config(format!(
                    "duplicate middleware name '{}'",
                    mw.name
                )));
            }
            let named = |hook: Arc<dyn StateHook>| NamedHook {
                name: mw.name.clone(),
                hook,
            };
            pipeline.before_agent.extend(mw.before_agent.clone().map(named));
            pipeline.before_model.extend(mw.before_model.clone().map(named));
            pipeline.after_model.extend(mw.after_model.clone().map(named));
            pipeline.after_agent.extend(mw.after_agent.clone().map(named));
            if let Some(inner) = mw.wrap_model_call.clone() {
                pipeline.model_wrappers.push(Named {
                    name: mw.name.clone(),
                    inner,
                });
            }
            if let Some(inner) = mw.wrap_tool_call.clone() {
                pipeline.tool_wrappers.push(Named {
                    name: mw.name.clone(),
                    inner,
                });
            }
            pipeline.tools.extend(mw.tools.iter().cloned());
            for (key, value) in &mw.state_defaults {
                pipeline
                    .state_defaults
                    .insert(key.clone(), value.clone());
            }
            pipeline.names.push(mw.name);
        }

        pipeline.after_model.reverse();
        pipeline.after_agent.reverse();
        Ok(pipeline)
    }

    /// Returns `true` if no middleware is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Middleware names in registration order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// `before_agent` hooks in registration order.
    #[must_use]
    pub fn before_agent(&self) -> &[NamedHook] {
        &self.before_agent
    }

    /// `before_model` hooks in registration order.
    #[must_use]
    pub fn before_model(&self) -> &[NamedHook] {
        &self.before_model
    }

    /// `after_model` hooks in reverse registration order.
    #[must_use]
    pub fn after_model(&self) -> &[NamedHook] {
        &self.after_model
    }

    /// `after_agent` hooks in reverse registration order.
    #[must_use]
    pub fn after_agent(&self) -> &[NamedHook] {
        &self.after_agent
    }

    /// Tools contributed by all middleware.
    #[must_use]
    pub fn tools(&self) -> &[SharedTool] {
        &self.tools
    }

    /// Union of all declared state defaults; later middleware win on conflict.
    #[must_use]
    pub const fn state_defaults(&self) -> &Map<String, Value> {
        &self.state_defaults
    }

    /// Returns `true` if any middleware wraps tool dispatch.
    #[must_use]
    pub fn wraps_tool_calls(&self) -> bool {
        !self.tool_wrappers.is_empty()
    }

    /// Run the model call through every `wrap_model_call`, first registered
    /// outermost.
    pub(crate) async fn call_model(
        &self,
        request: ModelRequest,
        base: &dyn ModelHandler,
    ) -> Result<AiMessage> {
        ModelNext {
            caller: "agent",
            wrappers: &self.model_wrappers,
            base,
        }
        .run(request)
        .await
    }

    /// Run one tool dispatch through every `wrap_tool_call`, first
    /// registered outermost.
    pub(crate) async fn call_tool(
        &self,
        request: ToolCallRequest,
        base: &dyn ToolHandler,
    ) -> Result<ToolOutput> {
        ToolNext {
            wrappers: &self.tool_wrappers,
            base,
        }
        .run(request)
        .await
    }
}

impl fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("middleware", &self.names)
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}
