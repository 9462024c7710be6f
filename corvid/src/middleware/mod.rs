//! Middleware: ordered hook sets wrapped around the agent loop.
//!
//! A [`Middleware`] bundles optional lifecycle hooks with the tools and
//! state defaults it contributes. The engine composes the registered list
//! with onion nesting (see [`MiddlewarePipeline`]):
//!
//! ```text
//! m0.before_model -> m1.before_model -> [ m0.wrap( m1.wrap( model ) ) ]
//!                                    -> m1.after_model -> m0.after_model
//! ```
//!
//! Hooks never mutate the conversation directly. They read an immutable
//! [`ConversationState`] and answer with an optional [`HookUpdate`].
//!
//! # Example
//!
//! ```rust
//! use corvid::middleware::{HookUpdate, Middleware, hook_fn};
//! use corvid::state::StatePatch;
//!
//! let audit = Middleware::new("audit")
//!     .state_default("audit.turns", serde_json::json!(0))
//!     .after_model(hook_fn(|state, _ctx| {
//!         let turns = state.middleware_state["audit.turns"].as_u64().unwrap_or(0);
//!         Ok(Some(HookUpdate::patch(
//!             StatePatch::new().state("audit.turns", serde_json::json!(turns + 1)),
//!         )))
//!     }));
//! assert_eq!(audit.name(), "audit");
//! ```

mod human_in_the_loop;
mod pipeline;
mod retry;
mod system_prompt;
mod tool_call_limit;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::callback::RunContext;
use crate::error::Result;
use crate::message::{AiMessage, Message};
use crate::state::{ConversationState, StatePatch};
use crate::tool::{DynTool, SharedTool, ToolOutput};

pub(crate) use pipeline::{ModelHandler, ToolHandler};
pub use pipeline::{
    MiddlewarePipeline, ModelNext, ModelRequest, NamedHook, ToolCallRequest, ToolNext,
};
pub use human_in_the_loop::{
    ActionRequest, Decision, DecisionKind, HumanInTheLoop, ReviewPolicy, ReviewRequest,
};
pub use retry::{Backoff, FailureFormatter, ModelRetry, OnFailure, RetryPredicate, ToolRetry};
pub use system_prompt::SystemPrompt;
pub use tool_call_limit::{ExitBehavior, ToolCallLimit};

/// Where a hook asks the engine to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTo {
    /// Skip to request assembly and call the model.
    Model,
    /// Skip to tool execution.
    Tools,
    /// Stop the loop.
    End,
}

/// The outcome of a state hook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookUpdate {
    /// Changes persisted into the conversation state.
    pub patch: StatePatch,
    /// Messages shown to the next model call instead of the history.
    ///
    /// Never persisted. When several hooks set it in one turn the last
    /// one wins.
    pub model_input: Option<Vec<Message>>,
    /// Control redirect.
    pub jump_to: Option<JumpTo>,
}

impl HookUpdate {
    /// An update carrying only a state patch.
    #[must_use]
    pub fn patch(patch: StatePatch) -> Self {
        Self {
            patch,
            ..Self::default()
        }
    }

    /// An update overriding the next model input.
    #[must_use]
    pub fn model_input(messages: Vec<Message>) -> Self {
        Self {
            model_input: Some(messages),
            ..Self::default()
        }
    }

    /// An update redirecting control.
    #[must_use]
    pub fn jump(to: JumpTo) -> Self {
        Self {
            jump_to: Some(to),
            ..Self::default()
        }
    }

    /// Add a redirect to this update.
    #[must_use]
    pub const fn with_jump(mut self, to: JumpTo) -> Self {
        self.jump_to = Some(to);
        self
    }
}

impl From<StatePatch> for HookUpdate {
    fn from(patch: StatePatch) -> Self {
        Self::patch(patch)
    }
}

/// A hook that observes the state at a fixed point of the loop.
///
/// Used for `before_agent`, `before_model`, `after_model` and `after_agent`.
/// Returning `Ok(None)` means "no change".
#[async_trait]
pub trait StateHook: Send + Sync {
    /// Run the hook.
    async fn run(&self, state: &ConversationState, ctx: &RunContext)
    -> Result<Option<HookUpdate>>;
}

/// A [`StateHook`] backed by a synchronous closure. Built by [`hook_fn`].
pub struct FnHook<F>(F);

impl<F> fmt::Debug for FnHook<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FnHook").finish_non_exhaustive()
    }
}

/// Wrap a closure as a [`StateHook`].
pub fn hook_fn<F>(f: F) -> FnHook<F>
where
    F: Fn(&ConversationState, &RunContext) -> Result<Option<HookUpdate>> + Send + Sync,
{
    FnHook(f)
}

#[async_trait]
impl<F> StateHook for FnHook<F>
where
    F: Fn(&ConversationState, &RunContext) -> Result<Option<HookUpdate>> + Send + Sync,
{
    async fn run(
        &self,
        state: &ConversationState,
        ctx: &RunContext,
    ) -> Result<Option<HookUpdate>> {
        (self.0)(state, ctx)
    }
}

/// Wraps the model call.
///
/// Implementations may rewrite the [`ModelRequest`] before delegating to
/// `next`, inspect or replace the response, or answer without delegating.
#[async_trait]
pub trait WrapModelCall: Send + Sync {
    /// Handle the request.
    async fn wrap_model_call(&self, request: ModelRequest, next: ModelNext<'_>)
    -> Result<AiMessage>;
}

/// Wraps each tool dispatch.
#[async_trait]
pub trait WrapToolCall: Send + Sync {
    /// Handle the tool call.
    async fn wrap_tool_call(&self, request: ToolCallRequest, next: ToolNext<'_>)
    -> Result<ToolOutput>;
}

/// A named set of hooks, tools and state defaults.
#[derive(Clone)]
pub struct Middleware {
    name: String,
    before_agent: Option<Arc<dyn StateHook>>,
    before_model: Option<Arc<dyn StateHook>>,
    after_model: Option<Arc<dyn StateHook>>,
    after_agent: Option<Arc<dyn StateHook>>,
    wrap_model_call: Option<Arc<dyn WrapModelCall>>,
    wrap_tool_call: Option<Arc<dyn WrapToolCall>>,
    tools: Vec<SharedTool>,
    state_defaults: Map<String, Value>,
}

impl Middleware {
    /// Create an empty middleware.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            before_agent: None,
            before_model: None,
            after_model: None,
            after_agent: None,
            wrap_model_call: None,
            wrap_tool_call: None,
            tools: Vec::new(),
            state_defaults: Map::new(),
        }
    }

    /// Run once when an invoke starts.
    #[must_use]
    pub fn before_agent(mut self, hook: impl StateHook + 'static) -> Self {
        self.before_agent = Some(Arc::new(hook));
        self
    }

    /// Run before every model call, in registration order.
    #[must_use]
    pub fn before_model(mut self, hook: impl StateHook + 'static) -> Self {
        self.before_model = Some(Arc::new(hook));
        self
    }

    /// Run after every model call, in reverse registration order.
    #[must_use]
    pub fn after_model(mut self, hook: impl StateHook + 'static) -> Self {
        self.after_model = Some(Arc::new(hook));
        self
    }

    /// Run once when an invoke reaches its end.
    #[must_use]
    pub fn after_agent(mut self, hook: impl StateHook + 'static) -> Self {
        self.after_agent = Some(Arc::new(hook));
        self
    }

    /// Wrap the model call.
    #[must_use]
    pub fn wrap_model_call(mut self, wrapper: impl WrapModelCall + 'static) -> Self {
        self.wrap_model_call = Some(Arc::new(wrapper));
        self
    }

    /// Wrap every tool dispatch.
    #[must_use]
    pub fn wrap_tool_call(mut self, wrapper: impl WrapToolCall + 'static) -> Self {
        self.wrap_tool_call = Some(Arc::new(wrapper));
        self
    }

    /// Contribute a tool to the agent.
    #[must_use]
    pub fn tool(mut self, tool: impl DynTool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// Contribute a shared tool to the agent.
    #[must_use]
    pub fn tool_shared(mut self, tool: SharedTool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Declare a state key and the value it takes when the caller omits it.
    #[must_use]
    pub fn state_default(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state_defaults.insert(key.into(), value);
        self
    }

    /// Returns the middleware name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tools contributed by this middleware.
    #[must_use]
    pub fn tools(&self) -> &[SharedTool] {
        &self.tools
    }

    /// Declared state keys with their defaults.
    #[must_use]
    pub const fn state_defaults(&self) -> &Map<String, Value> {
        &self.state_defaults
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("name", &self.name)
            .field("before_agent", &self.before_agent.is_some())
            .field("before_model", &self.before_model.is_some())
            .field("after_model", &self.after_model.is_some())
            .field("after_agent", &self.after_agent.is_some())
            .field("wrap_model_call", &self.wrap_model_call.is_some())
            .field("wrap_tool_call", &self.wrap_tool_call.is_some())
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}
