//! The model collaborator interface.
//!
//! The engine never talks to a vendor API. It drives any [`ChatModel`]:
//! given the conversation and the bound tool/schema declarations, produce
//! one [`AiMessage`], optionally as a stream of concatenable chunks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ModelError, Result};
use crate::message::{AiMessage, Message};
use crate::stream::MessageChunkStream;
use crate::tool::ToolDefinition;

/// Controls how the model uses tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolChoice {
    /// Model decides whether to use tools.
    #[default]
    Auto,
    /// Model must call at least one tool.
    Any,
    /// Model cannot use any tools.
    None,
    /// Model must call the named tool.
    Named(String),
}

impl ToolChoice {
    /// Converts to the conventional JSON representation.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Auto => Value::String("auto".to_owned()),
            Self::Any => Value::String("required".to_owned()),
            Self::None => Value::String("none".to_owned()),
            Self::Named(name) => serde_json::json!({
                "type": "function",
                "function": {"name": name}
            }),
        }
    }
}

impl From<&str> for ToolChoice {
    fn from(s: &str) -> Self {
        match s {
            "auto" => Self::Auto,
            "any" | "required" => Self::Any,
            "none" => Self::None,
            name => Self::Named(name.to_owned()),
        }
    }
}

/// Response format requested from the model itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Plain text response.
    Text,
    /// JSON response with schema (native structured output).
    JsonSchema {
        /// Schema definition.
        json_schema: JsonSchemaSpec,
    },
}

impl ResponseFormat {
    /// Creates a JSON schema format.
    #[must_use]
    pub fn json_schema(name: impl Into<String>, schema: Value) -> Self {
        Self::JsonSchema {
            json_schema: JsonSchemaSpec {
                name: name.into(),
                schema,
                strict: Some(true),
            },
        }
    }
}

/// JSON schema definition for structured outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchemaSpec {
    /// Schema name.
    pub name: String,
    /// JSON Schema definition.
    pub schema: Value,
    /// Whether to enforce strict validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

/// Options bound to a single model call.
#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    /// Tools the model may call.
    pub tools: Vec<ToolDefinition>,
    /// Tool usage constraint.
    pub tool_choice: Option<ToolChoice>,
    /// Native response format.
    pub response_format: Option<ResponseFormat>,
    /// Cancellation signal for the call.
    pub signal: CancellationToken,
}

/// A language model the engine can drive.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Name of the model, used in logs and errors.
    fn model_name(&self) -> &str {
        "unknown"
    }

    /// Produce one response message.
    async fn invoke(&self, messages: &[Message], options: &ModelOptions) -> Result<AiMessage>;

    /// Produce the response as a stream of chunks.
    ///
    /// The default implementation reports that streaming is unsupported.
    async fn stream(
        &self,
        messages: &[Message],
        options: &ModelOptions,
    ) -> Result<MessageChunkStream> {
        let _ = (messages, options);
        Err(ModelError::not_supported("streaming").into())
    }

    /// Check if this model supports [`ChatModel::stream`].
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Check if this model can be asked for schema-constrained output.
    fn supports_native_structured_output(&self) -> bool {
        false
    }
}

/// Type alias for an Arc-wrapped `ChatModel`.
pub type SharedChatModel = Arc<dyn ChatModel>;

/// Produces the model used by a run, resolved once per invoke.
#[async_trait]
pub trait ModelFactory: Send + Sync {
    /// Create or select the model.
    async fn create(&self) -> Result<SharedChatModel>;
}

#[async_trait]
impl<F> ModelFactory for F
where
    F: Fn() -> Result<SharedChatModel> + Send + Sync,
{
    async fn create(&self) -> Result<SharedChatModel> {
        self()
    }
}

/// Type alias for an Arc-wrapped `ModelFactory`.
pub type SharedModelFactory = Arc<dyn ModelFactory>;
