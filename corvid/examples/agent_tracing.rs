//! Tool loop with tracing output.
//!
//! Drives a canned model through one tool turn and prints the agent, model
//! and tool spans to stderr.
//!
//! ```bash
//! cargo run --example agent_tracing
//! ```

#![allow(clippy::print_stdout)]

use std::sync::Arc;

use async_trait::async_trait;
use corvid::prelude::*;
use serde_json::{Value, json};

/// Asks for the time once, then repeats what the tool said.
struct CannedModel;

#[async_trait]
impl ChatModel for CannedModel {
    fn model_name(&self) -> &str {
        "canned"
    }

    async fn invoke(&self, messages: &[Message], _options: &ModelOptions) -> Result<AiMessage> {
        Ok(match messages.last() {
            Some(Message::Tool(answer)) => AiMessage::new(format!("The time is {}.", answer.content)),
            _ => AiMessage::with_tool_calls(vec![ToolCall::new("call_1", "clock", json!({}))]),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter("debug")
        .init();

    let clock = FnTool::new(
        "clock",
        "Current wall-clock time",
        json!({"type": "object", "properties": {}}),
        |_args: Value, _cfg: ToolConfig| async { Ok(ToolOutput::from("12:00")) },
    );

    let agent = AgentEngine::builder()
        .name("assistant")
        .model(CannedModel)
        .tool(clock)
        .middleware(SystemPrompt::new("Answer in one sentence.").into_middleware())
        .build()?;

    let state = agent
        .invoke(
            ConversationState::from_user("What time is it?"),
            RunConfig::new().with_hooks(Arc::new(LoggingRunHooks::new())),
        )
        .await?;

    println!("{}", state.messages.last().map_or("", Message::text));
    Ok(())
}
