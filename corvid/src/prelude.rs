//! Prelude module for convenient imports.
//!
//! This module re-exports commonly used types and traits for easy access.
//!
//! # Usage
//!
//! ```rust,ignore
//! use corvid::prelude::*;
//! ```

pub use crate::agent::{
    AgentBuilder, AgentEngine, AgentEvent, AgentEventStream, INSUFFICIENT_STEPS_MESSAGE,
    OutputSchema, RunConfig, StructuredErrorPolicy, StructuredOutput, ToolErrorContext,
    ToolErrorHandler,
};
pub use crate::callback::{
    BoxedRunHooks, LoggingRunHooks, NoopRunHooks, RunContext, RunHooks, SharedRunHooks,
};
pub use crate::chat::{
    ChatModel, ModelFactory, ModelOptions, ResponseFormat, SharedChatModel, SharedModelFactory,
    ToolChoice,
};
pub use crate::command::{Command, CommandGraph, Goto, SendTarget};
pub use crate::error::{
    Error, Interrupt, ModelError, Result, StructuredOutputError, ToolError,
};
pub use crate::message::{AiMessage, Message, ToolCall, ToolMessage, ToolStatus};
pub use crate::middleware::{
    Backoff, Decision, ExitBehavior, HookUpdate, HumanInTheLoop, JumpTo, Middleware, ModelNext,
    ModelRequest, ModelRetry, OnFailure, StateHook, SystemPrompt, ToolCallLimit, ToolCallRequest,
    ToolNext, ToolRetry, WrapModelCall, WrapToolCall, hook_fn,
};
pub use crate::state::{ConversationState, MessagesUpdate, StatePatch};
pub use crate::stream::{MessageChunk, MessageChunkStream, StreamAggregator};
pub use crate::tool::{
    DynTool, FnTool, SharedTool, Tool, ToolBox, ToolConfig, ToolDefinition, ToolOutput, ToolResult,
};
