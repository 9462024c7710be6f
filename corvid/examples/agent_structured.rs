//! Structured output through an extraction tool, consumed as a stream.
//!
//! ```bash
//! cargo run --example agent_structured
//! ```

#![allow(clippy::print_stdout)]

use async_trait::async_trait;
use corvid::prelude::*;
use futures::StreamExt as _;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize, JsonSchema)]
struct Forecast {
    city: String,
    celsius: i64,
}

/// Answers every request through the `Forecast` extraction tool.
struct ForecastModel;

#[async_trait]
impl ChatModel for ForecastModel {
    async fn invoke(&self, _messages: &[Message], options: &ModelOptions) -> Result<AiMessage> {
        let tool = options
            .tools
            .first()
            .ok_or_else(|| Error::agent("no extraction tool bound"))?;
        Ok(AiMessage::with_tool_calls(vec![ToolCall::new(
            "call_1",
            tool.name.clone(),
            json!({"city": "Lisbon", "celsius": 21}),
        )]))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let agent = AgentEngine::builder()
        .model(ForecastModel)
        .response_format(StructuredOutput::tool(OutputSchema::from_type::<Forecast>()?))
        .structured_error_policy(StructuredErrorPolicy::Retry)
        .build()?;

    let mut events = agent.stream(ConversationState::from_user("Weather in Lisbon?"), RunConfig::new());
    while let Some(event) = events.next().await {
        match event? {
            AgentEvent::Message(message) => println!("[{}] {}", message.role(), message.text()),
            AgentEvent::ModelChunk(chunk) => print!("{}", chunk.content),
            AgentEvent::Done(state) => {
                if let Some(forecast) = state.structured_response_as::<Forecast>() {
                    let forecast = forecast?;
                    println!("{} is {}°C", forecast.city, forecast.celsius);
                }
            }
        }
    }
    Ok(())
}
