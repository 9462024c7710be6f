//! Tool traits and the tool registry.
//!
//! Tools are the agent's capabilities. A tool receives structured arguments
//! plus a [`ToolConfig`] (cancellation signal, originating call id) and
//! answers with a [`ToolOutput`]: a raw value, a ready-made tool message, or
//! a [`Command`] that also steers control flow.
//!
//! # Function calling format
//!
//! [`ToolDefinition`] serializes to the common
//! `{"type": "function", "function": {...}}` shape understood by most model
//! APIs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::error::{Error, Result, ToolError};
use crate::message::ToolMessage;

/// A type alias for `Result<T, ToolError>`.
pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Definition of a tool for model function calling.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[non_exhaustive]
pub struct ToolDefinition {
    /// Name of the tool (e.g., `get_weather`).
    pub name: String,

    /// Description of what the tool does.
    pub description: String,

    /// JSON schema for the tool's parameters.
    pub parameters: Value,

    /// Whether to use strict schema validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            strict: None,
        }
    }

    /// Enable strict schema validation.
    ///
    /// Adds `"additionalProperties": false` to the top-level object schema
    /// unless the schema already decides it.
    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        if strict
            && let Some(obj) = self.parameters.as_object_mut()
            && !obj.contains_key("additionalProperties")
        {
            obj.insert("additionalProperties".to_owned(), Value::Bool(false));
        }
        self
    }

    /// Check if strict mode is enabled.
    #[must_use]
    pub const fn is_strict(&self) -> bool {
        matches!(self.strict, Some(true))
    }

    /// Returns the tool name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Serialize for ToolDefinition {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let mut function = serde_json::Map::new();
        function.insert("name".to_owned(), Value::String(self.name.clone()));
        function.insert(
            "description".to_owned(),
            Value::String(self.description.clone()),
        );
        function.insert("parameters".to_owned(), self.parameters.clone());
        if let Some(strict) = self.strict {
            function.insert("strict".to_owned(), Value::Bool(strict));
        }

        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &function)?;
        map.end()
    }
}

/// Per-invocation configuration handed to a tool.
#[derive(Debug, Clone, Default)]
pub struct ToolConfig {
    /// Cancellation signal; tools doing long work should observe it.
    pub signal: CancellationToken,
    /// Id of the tool call being answered.
    pub tool_call_id: Option<String>,
}

impl ToolConfig {
    /// Create a config with the given signal.
    #[must_use]
    pub const fn new(signal: CancellationToken) -> Self {
        Self {
            signal,
            tool_call_id: None,
        }
    }

    /// Set the tool call id.
    #[must_use]
    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }
}

/// What a tool produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// A raw value; the dispatcher wraps it into a tool message.
    Value(Value),
    /// A complete tool message, passed through unchanged.
    Message(ToolMessage),
    /// A control signal, passed through unchanged.
    Command(Command),
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<String> for ToolOutput {
    fn from(value: String) -> Self {
        Self::Value(Value::String(value))
    }
}

impl From<&str> for ToolOutput {
    fn from(value: &str) -> Self {
        Self::Value(Value::String(value.to_owned()))
    }
}

impl From<ToolMessage> for ToolOutput {
    fn from(message: ToolMessage) -> Self {
        Self::Message(message)
    }
}

impl From<Command> for ToolOutput {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

/// A strongly typed tool.
///
/// Implementors get [`DynTool`] for free: arguments are deserialized into
/// [`Tool::Args`] and the serialized [`Tool::Output`] becomes the result.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static name of the tool.
    const NAME: &'static str;

    /// Arguments type for the tool.
    type Args: for<'de> Deserialize<'de> + Send;

    /// Output type of the tool.
    type Output: Serialize + Send;

    /// Error type for tool execution.
    type Error: Into<ToolError> + Send;

    /// Get the name of the tool.
    fn name(&self) -> &'static str {
        Self::NAME
    }

    /// Get the description of the tool.
    fn description(&self) -> String;

    /// Get the JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Whether the tool's answer ends the run.
    fn return_direct(&self) -> bool {
        false
    }

    /// Execute the tool with the given arguments.
    async fn call(&self, args: Self::Args, config: &ToolConfig)
    -> std::result::Result<Self::Output, Self::Error>;

    /// Get the tool definition for model function calling.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters_schema())
    }

    /// Call the tool with JSON arguments and return JSON output.
    async fn call_json(&self, args: Value, config: &ToolConfig) -> ToolResult<Value>
    where
        Self::Output: 'static,
    {
        let typed_args: Self::Args = match &args {
            Value::String(s) => {
                serde_json::from_str(s).map_err(|e| ToolError::InvalidArguments(e.to_string()))?
            }
            _ => serde_json::from_value(args)
                .map_err(|e| ToolError::InvalidArguments(e.to_string()))?,
        };

        let result = self.call(typed_args, config).await.map_err(Into::into)?;
        serde_json::to_value(result).map_err(|e| ToolError::Execution(e.to_string()))
    }
}

/// A boxed dynamic tool.
pub type BoxedTool = Box<dyn DynTool>;

/// A shared dynamic tool.
pub type SharedTool = Arc<dyn DynTool>;

/// Object-safe tool interface used by the engine.
#[async_trait]
pub trait DynTool: Send + Sync {
    /// Get the name of the tool.
    fn name(&self) -> &str;

    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Whether the tool's answer ends the run.
    fn return_direct(&self) -> bool {
        false
    }

    /// Invoke the tool.
    async fn invoke(&self, args: Value, config: ToolConfig) -> ToolResult<ToolOutput>;
}

#[async_trait]
impl<T: Tool + 'static> DynTool for T
where
    T::Output: 'static,
{
    fn name(&self) -> &str {
        Tool::name(self)
    }

    fn definition(&self) -> ToolDefinition {
        Tool::definition(self)
    }

    fn return_direct(&self) -> bool {
        Tool::return_direct(self)
    }

    async fn invoke(&self, args: Value, config: ToolConfig) -> ToolResult<ToolOutput> {
        Tool::call_json(self, args, &config)
            .await
            .map(ToolOutput::Value)
    }
}

/// A tool backed by an async closure.
///
/// ```rust
/// use corvid::tool::{FnTool, ToolOutput};
/// use serde_json::json;
///
/// let echo = FnTool::new("echo", "Echo the input", json!({"type": "object"}), |args, _cfg| async move {
///     Ok(ToolOutput::Value(args))
/// });
/// ```
pub struct FnTool<F> {
    definition: ToolDefinition,
    return_direct: bool,
    f: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Value, ToolConfig) -> Fut + Send + Sync,
    Fut: Future<Output = ToolResult<ToolOutput>> + Send,
{
    /// Create a closure tool.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self {
        Self {
            definition: ToolDefinition::new(name, description, parameters),
            return_direct: false,
            f,
        }
    }

    /// Make the tool's answer end the run.
    #[must_use]
    pub const fn with_return_direct(mut self, return_direct: bool) -> Self {
        self.return_direct = return_direct;
        self
    }
}

#[async_trait]
impl<F, Fut> DynTool for FnTool<F>
where
    F: Fn(Value, ToolConfig) -> Fut + Send + Sync,
    Fut: Future<Output = ToolResult<ToolOutput>> + Send,
{
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    fn return_direct(&self) -> bool {
        self.return_direct
    }

    async fn invoke(&self, args: Value, config: ToolConfig) -> ToolResult<ToolOutput> {
        (self.f)(args, config).await
    }
}

impl<F> fmt::Debug for FnTool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.definition.name)
            .field("return_direct", &self.return_direct)
            .finish_non_exhaustive()
    }
}

/// An ordered collection of tools, looked up by name.
#[derive(Default, Clone)]
pub struct ToolBox {
    tools: Vec<SharedTool>,
    index: HashMap<String, usize>,
}

impl ToolBox {
    /// Create a new empty toolbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a typed tool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a tool with the same name is registered.
    pub fn add<T: Tool + 'static>(&mut self, tool: T) -> Result<()>
    where
        T::Output: 'static,
    {
        self.add_shared(Arc::new(tool))
    }

    /// Add a shared dynamic tool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a tool with the same name is registered.
    pub fn add_shared(&mut self, tool: SharedTool) -> Result<()> {
        let name = tool.name().to_owned();
        if self.index.contains_key(&name) {
            return Err(Error::config(format!("duplicate tool name '{name}'")));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Get a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SharedTool> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Get all tool definitions, in registration order.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Get the names of all tools, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Check if the toolbox contains a tool with the given name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Returns `true` if the named tool ends the run when it answers.
    #[must_use]
    pub fn is_return_direct(&self, name: &str) -> bool {
        self.get(name).is_some_and(|t| t.return_direct())
    }

    /// Get the number of tools in the toolbox.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the toolbox is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for ToolBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolBox")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Adder;

    #[derive(Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    #[async_trait]
    impl Tool for Adder {
        const NAME: &'static str = "add";
        type Args = AddArgs;
        type Output = i64;
        type Error = ToolError;

        fn description(&self) -> String {
            "Add two integers".to_owned()
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                "required": ["a", "b"]
            })
        }

        async fn call(&self, args: AddArgs, _config: &ToolConfig) -> ToolResult<i64> {
            Ok(args.a + args.b)
        }
    }

    struct Finish;

    #[async_trait]
    impl DynTool for Finish {
        fn name(&self) -> &str {
            "finish"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("finish", "Finish the run", json!({"type": "object"}))
        }

        fn return_direct(&self) -> bool {
            true
        }

        async fn invoke(&self, _args: Value, config: ToolConfig) -> ToolResult<ToolOutput> {
            let id = config.tool_call_id.unwrap_or_default();
            Ok(ToolMessage::new(id, "finished").into())
        }
    }

    mod tool_definition {
        use super::*;

        #[test]
        fn serialize_to_function_format() {
            let def = ToolDefinition::new("get_weather", "Get weather", json!({"type": "object"}));
            let json = serde_json::to_value(&def).unwrap();
            assert_eq!(json["type"], "function");
            assert_eq!(json["function"]["name"], "get_weather");
            assert!(json["function"].get("strict").is_none());
        }

        #[test]
        fn with_strict_adds_additional_properties() {
            let def = ToolDefinition::new("t", "d", json!({"type": "object"})).with_strict(true);
            assert!(def.is_strict());
            assert_eq!(def.parameters["additionalProperties"], json!(false));
        }

        #[test]
        fn with_strict_preserves_existing_value() {
            let def = ToolDefinition::new(
                "t",
                "d",
                json!({"type": "object", "additionalProperties": true}),
            )
            .with_strict(true);
            assert_eq!(def.parameters["additionalProperties"], json!(true));
        }
    }

    mod typed_tool {
        use super::*;

        #[tokio::test]
        async fn invoke_deserializes_and_serializes() {
            let out = DynTool::invoke(&Adder, json!({"a": 2, "b": 3}), ToolConfig::default())
                .await
                .unwrap();
            assert_eq!(out, ToolOutput::Value(json!(5)));
        }

        #[tokio::test]
        async fn string_arguments_are_parsed() {
            let out = DynTool::invoke(&Adder, json!(r#"{"a":1,"b":1}"#), ToolConfig::default())
                .await
                .unwrap();
            assert_eq!(out, ToolOutput::Value(json!(2)));
        }

        #[tokio::test]
        async fn bad_arguments_are_reported() {
            let err = DynTool::invoke(&Adder, json!({"a": "x"}), ToolConfig::default())
                .await
                .unwrap_err();
            assert!(matches!(err, ToolError::InvalidArguments(_)));
        }

        #[test]
        fn definition_uses_schema() {
            let def = DynTool::definition(&Adder);
            assert_eq!(def.name, "add");
            assert_eq!(def.parameters["required"], json!(["a", "b"]));
        }
    }

    mod toolbox {
        use super::*;

        #[test]
        fn keeps_registration_order() {
            let mut tools = ToolBox::new();
            tools.add_shared(Arc::new(Finish)).unwrap();
            tools.add(Adder).unwrap();
            assert_eq!(tools.names(), vec!["finish", "add"]);
            assert_eq!(tools.len(), 2);
        }

        #[test]
        fn rejects_duplicates() {
            let mut tools = ToolBox::new();
            tools.add(Adder).unwrap();
            let err = tools.add(Adder).unwrap_err();
            assert!(matches!(err, Error::Config(_)));
        }

        #[test]
        fn return_direct_lookup() {
            let mut tools = ToolBox::new();
            tools.add_shared(Arc::new(Finish)).unwrap();
            tools.add(Adder).unwrap();
            assert!(tools.is_return_direct("finish"));
            assert!(!tools.is_return_direct("add"));
            assert!(!tools.is_return_direct("missing"));
        }

        #[test]
        fn closure_tools_register() {
            let mut tools = ToolBox::new();
            let echo = FnTool::new("echo", "Echo", json!({"type": "object"}), |args, _cfg| async move {
                Ok(ToolOutput::Value(args))
            })
            .with_return_direct(true);
            tools.add_shared(Arc::new(echo)).unwrap();
            assert!(tools.is_return_direct("echo"));
        }

        #[tokio::test]
        async fn closure_tool_invokes() {
            let echo = FnTool::new("echo", "Echo", json!({"type": "object"}), |args, _cfg| async move {
                Ok(ToolOutput::Value(args))
            });
            let out = echo.invoke(json!({"x": 1}), ToolConfig::default()).await.unwrap();
            assert_eq!(out, ToolOutput::Value(json!({"x": 1})));
        }

        #[test]
        fn debug_lists_names() {
            let mut tools = ToolBox::new();
            tools.add(Adder).unwrap();
            assert!(format!("{tools:?}").contains("add"));
        }
    }
}
