//! Unified error types for the corvid engine.
//!
//! The hierarchy mirrors how failures travel through a run:
//! - [`ModelError`] for failures raised by the model collaborator
//! - [`ToolError`] for failures raised by tools (most become advisory messages)
//! - [`StructuredOutputError`] for structured-output extraction failures
//! - [`Error`] for everything that reaches the caller of an invoke

use std::fmt;

use serde_json::Value;

use crate::state::ConversationState;

/// Result type alias for corvid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the corvid engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Contradictory or incomplete engine configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model collaborator error.
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Tool error that was not converted into an advisory message.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Agent runtime error (invalid control flow, malformed state).
    #[error("Agent error: {0}")]
    Agent(String),

    /// A tool raised a human-in-the-loop interrupt.
    ///
    /// `state` is the conversation as it stood when the tool stage began; it
    /// can be extended with answering tool messages and passed back to
    /// [`AgentEngine::invoke`](crate::agent::AgentEngine::invoke) to resume.
    #[error("Run interrupted: {interrupt}")]
    Interrupted {
        /// The interrupt raised by the tool.
        interrupt: Interrupt,
        /// Snapshot of the state at the point of suspension.
        state: Box<ConversationState>,
    },

    /// The run was cancelled through its cancellation token.
    #[error("Run was cancelled")]
    Cancelled,

    /// Structured output could not be produced.
    #[error("Structured output error: {0}")]
    StructuredOutput(#[from] StructuredOutputError),

    /// A middleware hook failed or violated the pipeline contract.
    #[error("Middleware '{name}' failed: {message}")]
    Middleware {
        /// Name of the offending middleware.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an agent runtime error.
    #[must_use]
    pub fn agent(msg: impl Into<String>) -> Self {
        Self::Agent(msg.into())
    }

    /// Create a middleware error.
    #[must_use]
    pub fn middleware(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Middleware {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if this error is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Tool(ToolError::Cancelled))
    }

    /// Returns `true` if this error is a human-in-the-loop interrupt.
    #[must_use]
    pub const fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// A human-in-the-loop breakpoint raised by a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct Interrupt {
    /// Payload describing what the run is waiting for.
    pub value: Value,
    /// Id of the tool call that raised the interrupt, when known.
    pub tool_call_id: Option<String>,
}

impl Interrupt {
    /// Create an interrupt carrying the given payload.
    #[must_use]
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            tool_call_id: None,
        }
    }

    /// Attach the id of the originating tool call.
    #[must_use]
    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tool_call_id {
            Some(id) => write!(f, "{} (tool call {id})", self.value),
            None => write!(f, "{}", self.value),
        }
    }
}

/// Error type for model collaborator operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ModelError {
    /// The error kind.
    pub kind: ModelErrorKind,
    /// The model or provider name, when known.
    pub model: Option<String>,
    /// Additional error message.
    pub message: String,
}

/// Categories of model errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ModelErrorKind {
    /// Rate limit exceeded.
    RateLimited,
    /// The response did not have the expected shape.
    ResponseFormat,
    /// Network or connection error.
    Network,
    /// Streaming error.
    Stream,
    /// Feature not supported by the model.
    NotSupported,
    /// Provider-specific error.
    Provider,
}

impl ModelError {
    fn with_kind(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            model: None,
            message: message.into(),
        }
    }

    /// Create a rate limit error.
    #[must_use]
    pub fn rate_limited(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::with_kind(
                ModelErrorKind::RateLimited,
                "Rate limit exceeded. Please retry after some time.",
            )
        }
    }

    /// Create a response format error.
    #[must_use]
    pub fn response_format(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::with_kind(
            ModelErrorKind::ResponseFormat,
            format!("Expected {}, got {}", expected.into(), got.into()),
        )
    }

    /// Create a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::with_kind(ModelErrorKind::Network, message)
    }

    /// Create a streaming error.
    #[must_use]
    pub fn stream(message: impl Into<String>) -> Self {
        Self::with_kind(ModelErrorKind::Stream, message)
    }

    /// Create a not supported error.
    #[must_use]
    pub fn not_supported(feature: impl Into<String>) -> Self {
        Self::with_kind(
            ModelErrorKind::NotSupported,
            format!("Feature not supported: {}", feature.into()),
        )
    }

    /// Create a provider-specific error.
    #[must_use]
    pub fn provider(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::with_kind(ModelErrorKind::Provider, message)
        }
    }

    /// Check if this is a transient failure worth retrying.
    ///
    /// [`ModelRetry`](crate::middleware::ModelRetry) retries these by default.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind, ModelErrorKind::RateLimited | ModelErrorKind::Network)
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(model) = &self.model {
            write!(f, "[{model}] ")?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ModelError {}

/// Error type for tool execution failures.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ToolError {
    /// Error during tool execution.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Invalid arguments provided to the tool.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Tool not found.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// Human-in-the-loop breakpoint. Never converted into a tool message.
    #[error("Interrupt: {0}")]
    Interrupt(Interrupt),

    /// The tool observed cancellation and gave up.
    #[error("Tool execution was cancelled")]
    Cancelled,
}

impl ToolError {
    /// Create an execution error.
    #[must_use]
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create an invalid arguments error.
    #[must_use]
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    /// Create a not found error.
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create an interrupt carrying the given payload.
    #[must_use]
    pub fn interrupt(value: impl Into<Value>) -> Self {
        Self::Interrupt(Interrupt::new(value))
    }

    /// Returns the message shown to the model when this error is recovered.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Execution(msg) | Self::InvalidArguments(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<String> for ToolError {
    fn from(s: String) -> Self {
        Self::Execution(s)
    }
}

impl From<&str> for ToolError {
    fn from(s: &str) -> Self {
        Self::Execution(s.to_owned())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArguments(err.to_string())
    }
}

/// Failures of structured-output extraction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum StructuredOutputError {
    /// The model emitted more than one structured answer in a single turn.
    #[error(
        "Model returned multiple structured outputs ({}) when exactly one was expected",
        names.join(", ")
    )]
    MultipleStructuredOutputs {
        /// Names of every extraction tool called.
        names: Vec<String>,
    },

    /// Extraction tool arguments did not validate against the schema.
    #[error("Failed to parse structured output for tool '{tool}': {}", errors.join("; "))]
    Parsing {
        /// Name of the extraction tool.
        tool: String,
        /// Validation error messages.
        errors: Vec<String>,
    },

    /// A native structured response could not be parsed or validated.
    #[error("Native structured output could not be parsed: {0}")]
    NativeParse(String),
}

impl StructuredOutputError {
    /// Create a multiple structured outputs error.
    #[must_use]
    pub fn multiple<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::MultipleStructuredOutputs {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a parsing error.
    #[must_use]
    pub fn parsing(tool: impl Into<String>, errors: Vec<String>) -> Self {
        Self::Parsing {
            tool: tool.into(),
            errors,
        }
    }
}
