//! Structured output: schemas, strategies, and extraction from model turns.
//!
//! Two strategies exist:
//!
//! - **Native**: the model is asked for schema-constrained output through
//!   its own response-format facility and the reply text is parsed. Failures
//!   are capability mismatches and always fatal.
//! - **Tool**: one synthetic extraction tool per schema is bound with tool
//!   choice forced to "any"; the arguments of the extraction call are the
//!   result. Failures go through a [`StructuredErrorPolicy`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde_json::Value;

use crate::chat::{ChatModel, ResponseFormat};
use crate::error::{Error, Result, StructuredOutputError};
use crate::message::{AiMessage, Message, ToolCall, ToolMessage};
use crate::state::StatePatch;
use crate::tool::ToolDefinition;

/// A named JSON schema the structured result must satisfy.
#[derive(Clone)]
pub struct OutputSchema {
    name: String,
    description: String,
    schema: Value,
    validator: Arc<jsonschema::Validator>,
}

impl OutputSchema {
    /// Compile a schema.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the schema itself is invalid.
    pub fn new(name: impl Into<String>, schema: Value) -> Result<Self> {
        let name = name.into();
        let validator = jsonschema::options()
            .with_draft(jsonschema::Draft::Draft202012)
            .build(&schema)
            .map_err(|e| Error::config(format!("invalid output schema '{name}': {e}")))?;
        let description = schema
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Ok(Self {
            name,
            description,
            schema,
            validator: Arc::new(validator),
        })
    }

    /// Derive the schema from a Rust type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the generated schema does not compile.
    pub fn from_type<T: JsonSchema>() -> Result<Self> {
        let schema = serde_json::to_value(schemars::schema_for!(T))?;
        Self::new(T::schema_name(), schema)
    }

    /// Set the description shown to the model.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Schema name; also the name of its extraction tool.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw JSON schema.
    #[must_use]
    pub const fn schema(&self) -> &Value {
        &self.schema
    }

    /// Validate a candidate value.
    ///
    /// # Errors
    ///
    /// Returns every validation message when the value does not conform.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), Vec<String>> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(value)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Declaration of the extraction tool for this schema.
    #[must_use]
    pub fn tool_definition(&self) -> ToolDefinition {
        let description = if self.description.is_empty() {
            format!("Return the final answer as a {} object.", self.name)
        } else {
            self.description.clone()
        };
        ToolDefinition::new(self.name.clone(), description, self.schema.clone())
    }

    /// Native response format for this schema.
    #[must_use]
    pub fn response_format(&self) -> ResponseFormat {
        ResponseFormat::json_schema(self.name.clone(), self.schema.clone())
    }
}

impl fmt::Debug for OutputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSchema")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// How the agent obtains a structured result.
#[derive(Debug, Clone)]
pub enum StructuredOutput {
    /// Use the model's own schema facility.
    Native(OutputSchema),
    /// Use extraction tools, one per allowed shape.
    Tool(Vec<OutputSchema>),
    /// Native when the model supports it, tool otherwise.
    Auto(OutputSchema),
}

impl StructuredOutput {
    /// Tool strategy with a single schema.
    #[must_use]
    pub fn tool(schema: OutputSchema) -> Self {
        Self::Tool(vec![schema])
    }

    /// Names of every schema involved.
    #[must_use]
    pub fn schema_names(&self) -> Vec<&str> {
        match self {
            Self::Native(s) | Self::Auto(s) => vec![s.name()],
            Self::Tool(schemas) => schemas.iter().map(OutputSchema::name).collect(),
        }
    }

    /// Fix the strategy for a concrete model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a native request against a model that
    /// cannot produce schema-constrained output, or an empty tool list.
    pub fn resolve(&self, model: &dyn ChatModel) -> Result<Strategy> {
        match self {
            Self::Native(schema) => {
                if model.supports_native_structured_output() {
                    Ok(Strategy::Native(schema.clone()))
                } else {
                    Err(Error::config(format!(
                        "model '{}' does not support native structured output",
                        model.model_name()
                    )))
                }
            }
            Self::Tool(schemas) if schemas.is_empty() => Err(Error::config(
                "tool structured output needs at least one schema",
            )),
            Self::Tool(schemas) => Ok(Strategy::Tool(schemas.clone())),
            Self::Auto(schema) if model.supports_native_structured_output() => {
                Ok(Strategy::Native(schema.clone()))
            }
            Self::Auto(schema) => Ok(Strategy::Tool(vec![schema.clone()])),
        }
    }
}

/// A strategy bound to a model.
#[derive(Debug, Clone)]
pub enum Strategy {
    /// Parse the model's text.
    Native(OutputSchema),
    /// Read the arguments of an extraction tool call.
    Tool(Vec<OutputSchema>),
}

impl Strategy {
    /// Extraction tool declarations (empty for native).
    #[must_use]
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        match self {
            Self::Native(_) => Vec::new(),
            Self::Tool(schemas) => schemas.iter().map(OutputSchema::tool_definition).collect(),
        }
    }

    /// Native response format, if any.
    #[must_use]
    pub fn response_format(&self) -> Option<ResponseFormat> {
        match self {
            Self::Native(schema) => Some(schema.response_format()),
            Self::Tool(_) => None,
        }
    }

    /// Returns `true` if `name` is an extraction tool of this strategy.
    #[must_use]
    pub fn is_extraction_tool(&self, name: &str) -> bool {
        match self {
            Self::Native(_) => false,
            Self::Tool(schemas) => schemas.iter().any(|s| s.name() == name),
        }
    }

    fn schema(&self, name: &str) -> Option<&OutputSchema> {
        match self {
            Self::Native(schema) => Some(schema),
            Self::Tool(schemas) => schemas.iter().find(|s| s.name() == name),
        }
    }
}

/// Computes the retry message for a failed extraction.
#[async_trait]
pub trait StructuredErrorHandler: Send + Sync {
    /// Produce the text shown to the model.
    async fn handle(&self, error: &StructuredOutputError) -> Result<String>;
}

struct FnErrorHandler<F>(F);

#[async_trait]
impl<F> StructuredErrorHandler for FnErrorHandler<F>
where
    F: Fn(&StructuredOutputError) -> String + Send + Sync,
{
    async fn handle(&self, error: &StructuredOutputError) -> Result<String> {
        Ok((self.0)(error))
    }
}

/// What happens when tool-based extraction fails.
#[derive(Clone, Default)]
pub enum StructuredErrorPolicy {
    /// Feed the error text back to the model and call it again.
    Retry,
    /// Feed a fixed text back to the model and call it again.
    Message(String),
    /// Compute the text fed back to the model.
    Handler(Arc<dyn StructuredErrorHandler>),
    /// Fail the run.
    #[default]
    Fatal,
}

impl StructuredErrorPolicy {
    /// Build a [`StructuredErrorPolicy::Handler`] from a closure.
    #[must_use]
    pub fn handler_fn<F>(f: F) -> Self
    where
        F: Fn(&StructuredOutputError) -> String + Send + Sync + 'static,
    {
        Self::Handler(Arc::new(FnErrorHandler(f)))
    }

    async fn retry_text(&self, error: StructuredOutputError) -> Result<String> {
        match self {
            Self::Retry => Ok(error.to_string()),
            Self::Message(text) => Ok(text.clone()),
            Self::Handler(handler) => handler.handle(&error).await,
            Self::Fatal => Err(error.into()),
        }
    }
}

impl fmt::Debug for StructuredErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => f.write_str("Retry"),
            Self::Message(text) => f.debug_tuple("Message").field(text).finish(),
            Self::Handler(_) => f.debug_tuple("Handler").finish_non_exhaustive(),
            Self::Fatal => f.write_str("Fatal"),
        }
    }
}

/// Result of inspecting one model response.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// The response carries no structured answer; treat it as an ordinary turn.
    None,
    /// A structured answer was recorded.
    Done {
        /// Messages to append plus the structured response.
        patch: StatePatch,
        /// The response also requested ordinary tools.
        has_tool_calls: bool,
    },
    /// The extraction failed and the model gets another try.
    Retry(StatePatch),
}

/// Acknowledgement appended after a successful tool extraction.
fn acknowledgement(value: &Value) -> String {
    format!("Returning structured response: {value}")
}

/// Derive the structured result of a model response.
///
/// # Errors
///
/// Native parse failures are always returned. Tool extraction failures are
/// returned when the policy is [`StructuredErrorPolicy::Fatal`] or the
/// handler itself fails.
pub async fn extract(
    strategy: &Strategy,
    policy: &StructuredErrorPolicy,
    response: &AiMessage,
) -> Result<Extraction> {
    match strategy {
        Strategy::Native(schema) => extract_native(schema, response),
        Strategy::Tool(_) => extract_tool(strategy, policy, response).await,
    }
}

fn extract_native(schema: &OutputSchema, response: &AiMessage) -> Result<Extraction> {
    if response.has_tool_calls() {
        return Ok(Extraction::None);
    }
    let value: Value = serde_json::from_str(response.content.trim()).map_err(|e| {
        StructuredOutputError::NativeParse(format!("response is not valid JSON: {e}"))
    })?;
    schema.validate(&value).map_err(|errors| {
        StructuredOutputError::NativeParse(format!(
            "response does not match schema '{}': {}",
            schema.name(),
            errors.join("; ")
        ))
    })?;
    Ok(Extraction::Done {
        patch: StatePatch::new()
            .message(response.clone())
            .structured_response(value),
        has_tool_calls: false,
    })
}

async fn extract_tool(
    strategy: &Strategy,
    policy: &StructuredErrorPolicy,
    response: &AiMessage,
) -> Result<Extraction> {
    let calls: Vec<&ToolCall> = response
        .tool_calls
        .iter()
        .filter(|c| strategy.is_extraction_tool(&c.name))
        .collect();

    let (error, failed) = match calls.as_slice() {
        [] => return Ok(Extraction::None),
        [call] => {
            let value = call.args_value();
            let validation = strategy
                .schema(&call.name)
                .map_or(Ok(()), |schema| schema.validate(&value));
            match validation {
                Ok(()) => return Ok(accept(response, call, value)),
                Err(errors) => (StructuredOutputError::parsing(&call.name, errors), calls),
            }
        }
        _ => (
            StructuredOutputError::multiple(calls.iter().map(|c| c.name.as_str())),
            calls,
        ),
    };

    tracing::debug!(error = %error, "Structured output extraction failed");
    let text = policy.retry_text(error).await?;
    let mut patch = StatePatch::new().message(response.clone());
    for call in failed {
        patch.push(Message::Tool(
            ToolMessage::error(call.id.clone(), text.clone()).with_name(call.name.clone()),
        ));
    }
    Ok(Extraction::Retry(patch))
}

fn accept(response: &AiMessage, call: &ToolCall, value: Value) -> Extraction {
    let has_tool_calls = response.tool_calls.len() > 1;
    let mut patch = StatePatch::new().message(response.clone()).message(
        ToolMessage::new(call.id.clone(), value.to_string()).with_name(call.name.clone()),
    );
    if !has_tool_calls {
        patch.push(Message::Ai(AiMessage::new(acknowledgement(&value))));
    }
    Extraction::Done {
        patch: patch.structured_response(value),
        has_tool_calls,
    }
}
