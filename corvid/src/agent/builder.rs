//! Agent builder for constructing engines with a fluent API.

use std::sync::Arc;

use crate::chat::{ChatModel, ModelFactory, SharedChatModel, SharedModelFactory};
use crate::error::{Error, Result};
use crate::middleware::{Middleware, MiddlewarePipeline};
use crate::tool::{DynTool, SharedTool, ToolBox};

use super::dispatcher::{ToolDispatcher, ToolErrorHandler};
use super::engine::{AgentEngine, ModelSource};
use super::graph::Graph;
use super::structured::{StructuredErrorPolicy, StructuredOutput};

/// Builder for [`AgentEngine`].
///
/// # Example
///
/// ```rust,ignore
/// let agent = AgentEngine::builder()
///     .model(my_model)
///     .tool(SearchTool)
///     .middleware(SystemPrompt::new("Be brief.").into_middleware())
///     .build()?;
/// ```
#[derive(Default)]
pub struct AgentBuilder {
    name: Option<String>,
    model: Option<SharedChatModel>,
    model_factory: Option<SharedModelFactory>,
    tools: Vec<SharedTool>,
    middleware: Vec<Middleware>,
    structured: Option<StructuredOutput>,
    error_policy: StructuredErrorPolicy,
    system_prompt: Option<String>,
    tool_error_handler: Option<Arc<dyn ToolErrorHandler>>,
    handle_tool_errors: bool,
    max_tool_concurrency: Option<usize>,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("name", &self.name)
            .field("has_model", &self.model.is_some())
            .field("has_model_factory", &self.model_factory.is_some())
            .field("tools", &self.tools.len())
            .field("middleware", &self.middleware.len())
            .field("structured", &self.structured)
            .finish_non_exhaustive()
    }
}

impl AgentBuilder {
    /// Create a new builder with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            handle_tool_errors: true,
            ..Self::default()
        }
    }

    /// Set the agent name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the language model.
    #[must_use]
    pub fn model(mut self, model: impl ChatModel + 'static) -> Self {
        self.model = Some(Arc::new(model));
        self
    }

    /// Set a shared language model.
    #[must_use]
    pub fn shared_model(mut self, model: SharedChatModel) -> Self {
        self.model = Some(model);
        self
    }

    /// Resolve the model at the start of every invoke instead.
    #[must_use]
    pub fn model_factory(mut self, factory: impl ModelFactory + 'static) -> Self {
        self.model_factory = Some(Arc::new(factory));
        self
    }

    /// Add a tool.
    #[must_use]
    pub fn tool(mut self, tool: impl DynTool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// Add several shared tools.
    #[must_use]
    pub fn tools(mut self, tools: impl IntoIterator<Item = SharedTool>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Register a middleware. Registration order defines nesting.
    #[must_use]
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Request a structured result.
    #[must_use]
    pub fn response_format(mut self, format: StructuredOutput) -> Self {
        self.structured = Some(format);
        self
    }

    /// What to do when tool-based extraction fails. Defaults to fatal.
    #[must_use]
    pub fn structured_error_policy(mut self, policy: StructuredErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// System instructions sent before the conversation.
    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Handle tool failures before the default advisory message.
    #[must_use]
    pub fn tool_error_handler(mut self, handler: impl ToolErrorHandler + 'static) -> Self {
        self.tool_error_handler = Some(Arc::new(handler));
        self
    }

    /// When `false`, tool failures abort the run. Defaults to `true`.
    #[must_use]
    pub const fn handle_tool_errors(mut self, handle: bool) -> Self {
        self.handle_tool_errors = handle;
        self
    }

    /// Bound how many tool calls of one turn run at once.
    #[must_use]
    pub const fn max_tool_concurrency(mut self, max: usize) -> Self {
        self.max_tool_concurrency = Some(max);
        self
    }

    /// Validate the configuration and build the engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when both or neither of a model and a model
    /// factory are supplied, when tool or middleware names collide, when an
    /// extraction tool would shadow a registered tool, or when native
    /// structured output is requested from a model that cannot produce it.
    pub fn build(self) -> Result<AgentEngine> {
        let model = match (self.model, self.model_factory) {
            (Some(_), Some(_)) => {
                return Err(Error::config(
                    "supply either a model or a model factory, not both",
                ));
            }
            (None, None) => return Err(Error::config("a model or a model factory is required")),
            (Some(model), None) => ModelSource::Fixed(model),
            (None, Some(factory)) => ModelSource::Factory(factory),
        };

        let pipeline = MiddlewarePipeline::new(self.middleware)?;

        let mut tools = ToolBox::new();
        for tool in self.tools.into_iter().chain(pipeline.tools().iter().cloned()) {
            tools.add_shared(tool)?;
        }

        if let Some(structured) = &self.structured {
            if let Some(name) = structured
                .schema_names()
                .into_iter()
                .find(|name| tools.contains(name))
            {
                return Err(Error::config(format!(
                    "structured output schema '{name}' collides with a registered tool"
                )));
            }
            if let ModelSource::Fixed(model) = &model {
                structured.resolve(model.as_ref())?;
            }
        }

        if self.max_tool_concurrency == Some(0) {
            return Err(Error::config("max_tool_concurrency must be at least 1"));
        }

        let mut dispatcher = ToolDispatcher::new(tools).with_handle_errors(self.handle_tool_errors);
        if let Some(handler) = self.tool_error_handler {
            dispatcher = dispatcher.with_error_handler(handler);
        }

        Ok(AgentEngine {
            name: self.name.unwrap_or_else(|| "agent".to_owned()),
            model,
            dispatcher,
            graph: Graph::new(&pipeline),
            pipeline,
            structured: self.structured,
            error_policy: self.error_policy,
            system_prompt: self.system_prompt,
            max_tool_concurrency: self.max_tool_concurrency,
        })
    }
}
