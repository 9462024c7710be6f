//! The agent engine and the stages it drives.
//!
//! - **[`AgentEngine`]** runs the conversation loop: middleware hooks, the
//!   model call, routing, and tool execution, until the run terminates.
//! - **[`ToolExecutionStage`]** dispatches every pending tool call of a turn
//!   concurrently and merges the results in call order.
//! - **[`ToolDispatcher`]** runs a single call, turning failures into
//!   advisory tool messages unless they are interrupts or cancellation.
//! - **[`StructuredOutput`]** asks the model for a schema-validated result,
//!   either natively or through an extraction tool.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use corvid::agent::{AgentEngine, RunConfig};
//! use corvid::state::ConversationState;
//!
//! let agent = AgentEngine::builder()
//!     .name("assistant")
//!     .model(my_model)
//!     .tool(SearchTool)
//!     .build()?;
//!
//! let state = agent
//!     .invoke(ConversationState::from_user("Hello!"), RunConfig::new())
//!     .await?;
//! println!("{}", state.messages.last().map_or("", |m| m.text()));
//! ```

mod builder;
mod dispatcher;
mod engine;
mod graph;
mod structured;
mod tool_stage;

pub use builder::AgentBuilder;
pub use dispatcher::{ToolDispatcher, ToolErrorContext, ToolErrorHandler};
pub use engine::{AgentEngine, AgentEvent, AgentEventStream, INSUFFICIENT_STEPS_MESSAGE, RunConfig};
pub use graph::{Graph, Node};
pub use structured::{
    Extraction, OutputSchema, Strategy, StructuredErrorHandler, StructuredErrorPolicy,
    StructuredOutput, extract,
};
pub use tool_stage::{StageUpdate, ToolExecutionStage, ToolStageOutput};
