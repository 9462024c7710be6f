//! Conversation messages exchanged between the engine, the model and tools.
//!
//! A [`Message`] is a tagged variant over the four conversation roles. AI
//! messages may request [`ToolCall`]s; tool messages answer exactly one of
//! them through `tool_call_id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Generate a fresh message identifier.
#[must_use]
pub fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    /// System instructions.
    System {
        /// Instruction text.
        content: String,
    },
    /// Human input.
    User {
        /// Input text.
        content: String,
    },
    /// Model output.
    Ai(AiMessage),
    /// Result of a tool call.
    Tool(ToolMessage),
}

impl Message {
    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Create an AI message with text content and no tool calls.
    #[must_use]
    pub fn ai(content: impl Into<String>) -> Self {
        Self::Ai(AiMessage::new(content))
    }

    /// Create a successful tool message.
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool(ToolMessage::new(tool_call_id, content))
    }

    /// Returns the role name of this message.
    #[must_use]
    pub const fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Ai(_) => "ai",
            Self::Tool(_) => "tool",
        }
    }

    /// Returns the text content of this message.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::System { content } | Self::User { content } => content,
            Self::Ai(ai) => &ai.content,
            Self::Tool(tool) => &tool.content,
        }
    }

    /// Returns the AI message if this is one.
    #[must_use]
    pub const fn as_ai(&self) -> Option<&AiMessage> {
        match self {
            Self::Ai(ai) => Some(ai),
            _ => None,
        }
    }

    /// Returns the tool message if this is one.
    #[must_use]
    pub const fn as_tool(&self) -> Option<&ToolMessage> {
        match self {
            Self::Tool(tool) => Some(tool),
            _ => None,
        }
    }
}

impl From<AiMessage> for Message {
    fn from(message: AiMessage) -> Self {
        Self::Ai(message)
    }
}

impl From<ToolMessage> for Message {
    fn from(message: ToolMessage) -> Self {
        Self::Tool(message)
    }
}

/// A message produced by the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiMessage {
    /// Message identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Name of the agent that produced the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Text content.
    #[serde(default)]
    pub content: String,
    /// Tool calls requested by the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Structured content blocks (provider specific).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Value>,
}

impl AiMessage {
    /// Create an AI message with text content.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Create an AI message that only requests tool calls.
    #[must_use]
    pub fn with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }

    /// Append a tool call.
    #[must_use]
    pub fn tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    /// Set the message id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the producing agent's name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns `true` if the model requested any tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Returns the names of all requested tools, in call order.
    #[must_use]
    pub fn tool_names(&self) -> Vec<&str> {
        self.tool_calls.iter().map(|c| c.name.as_str()).collect()
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique id within the requesting AI message.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Structured arguments.
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolCall {
    /// Create a tool call.
    ///
    /// Object arguments are used as-is, `null` becomes an empty map, and any
    /// other value is stored under the `input` key.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_owned(), other);
                map
            }
        };
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    /// Returns the arguments as a JSON value.
    #[must_use]
    pub fn args_value(&self) -> Value {
        Value::Object(self.args.clone())
    }

    /// Parse the arguments into a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the arguments do not match `T`.
    pub fn parse_arguments<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.args_value())
    }
}

/// Outcome flag carried by a tool message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// The tool succeeded.
    #[default]
    Success,
    /// The tool failed; the content describes the failure.
    Error,
}

/// The answer to a single tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMessage {
    /// Id of the tool call this message answers.
    pub tool_call_id: String,
    /// Name of the tool that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Result payload.
    pub content: String,
    /// Success or error.
    #[serde(default)]
    pub status: ToolStatus,
}

impl ToolMessage {
    /// Create a successful tool message.
    #[must_use]
    pub fn new(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: None,
            content: content.into(),
            status: ToolStatus::Success,
        }
    }

    /// Create an error tool message.
    #[must_use]
    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            ..Self::new(tool_call_id, content)
        }
    }

    /// Set the tool name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns `true` if this message reports a failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }
}
