//! Streaming response types.
//!
//! A streaming model yields [`MessageChunk`]s. Chunks concatenate with an
//! associative merge ([`MessageChunk::concat`]), so any grouping of a chunk
//! sequence folds into the same [`AiMessage`].

use std::ops::Add;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream::Stream;
use serde_json::{Map, Value};

use crate::error::{ModelError, Result};
use crate::message::{AiMessage, ToolCall};

/// A stream of message chunks produced by a model.
pub type MessageChunkStream = Pin<Box<dyn Stream<Item = Result<MessageChunk>> + Send>>;

/// A fragment of a tool call; fragments with the same `index` belong together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallChunk {
    /// Position of the call in the final message.
    pub index: usize,
    /// Call id, usually sent with the first fragment.
    pub id: Option<String>,
    /// Tool name, usually sent with the first fragment.
    pub name: Option<String>,
    /// Partial JSON arguments.
    pub args: String,
}

/// A fragment of an AI message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageChunk {
    /// Message id, taken from the first chunk that carries one.
    pub id: Option<String>,
    /// Text delta.
    pub content: String,
    /// Tool call fragments.
    pub tool_call_chunks: Vec<ToolCallChunk>,
}

impl MessageChunk {
    /// Creates a text chunk.
    #[inline]
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Creates a chunk opening a tool call.
    #[must_use]
    pub fn tool_call_start(index: usize, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tool_call_chunks: vec![ToolCallChunk {
                index,
                id: Some(id.into()),
                name: Some(name.into()),
                args: String::new(),
            }],
            ..Self::default()
        }
    }

    /// Creates a chunk carrying partial tool call arguments.
    #[must_use]
    pub fn tool_call_delta(index: usize, args: impl Into<String>) -> Self {
        Self {
            tool_call_chunks: vec![ToolCallChunk {
                index,
                args: args.into(),
                ..ToolCallChunk::default()
            }],
            ..Self::default()
        }
    }

    /// Concatenate two chunks.
    ///
    /// Text is appended, the first known id wins, and tool call fragments
    /// are merged by index in order of first appearance.
    #[must_use]
    pub fn concat(mut self, other: Self) -> Self {
        self.content.push_str(&other.content);
        if self.id.is_none() {
            self.id = other.id;
        }
        for fragment in other.tool_call_chunks {
            match self
                .tool_call_chunks
                .iter_mut()
                .find(|c| c.index == fragment.index)
            {
                Some(existing) => {
                    if existing.id.is_none() {
                        existing.id = fragment.id;
                    }
                    if existing.name.is_none() {
                        existing.name = fragment.name;
                    }
                    existing.args.push_str(&fragment.args);
                }
                None => self.tool_call_chunks.push(fragment),
            }
        }
        self
    }

    /// Convert the accumulated chunk into a full message.
    ///
    /// # Errors
    ///
    /// Returns a stream error if a tool call has no name or its arguments
    /// are not a JSON object.
    pub fn into_ai_message(self) -> Result<AiMessage> {
        let mut fragments = self.tool_call_chunks;
        fragments.sort_by_key(|c| c.index);

        let mut tool_calls = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let name = fragment.name.ok_or_else(|| {
                ModelError::stream(format!("tool call {} has no name", fragment.index))
            })?;
            let args = if fragment.args.trim().is_empty() {
                Map::new()
            } else {
                match serde_json::from_str::<Value>(&fragment.args) {
                    Ok(Value::Object(map)) => map,
                    Ok(other) => {
                        return Err(ModelError::response_format("object arguments", other.to_string())
                            .into());
                    }
                    Err(e) => return Err(ModelError::stream(e.to_string()).into()),
                }
            };
            let id = fragment
                .id
                .unwrap_or_else(|| format!("call_{}", fragment.index));
            tool_calls.push(ToolCall {
                id,
                name,
                args,
            });
        }

        Ok(AiMessage {
            id: self.id,
            content: self.content,
            tool_calls,
            ..AiMessage::default()
        })
    }
}

impl Add for MessageChunk {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.concat(rhs)
    }
}

/// Aggregator for building a complete message from stream chunks.
#[derive(Debug, Clone, Default)]
pub struct StreamAggregator {
    acc: MessageChunk,
    chunks: usize,
}

impl StreamAggregator {
    /// Creates a new aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a stream chunk to the aggregator.
    pub fn apply(&mut self, chunk: MessageChunk) {
        self.acc = std::mem::take(&mut self.acc).concat(chunk);
        self.chunks += 1;
    }

    /// Returns the text accumulated so far.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.acc.content
    }

    /// Returns how many chunks were applied.
    #[must_use]
    pub const fn chunk_count(&self) -> usize {
        self.chunks
    }

    /// Converts the accumulated chunks into a message.
    ///
    /// # Errors
    ///
    /// See [`MessageChunk::into_ai_message`].
    pub fn into_ai_message(self) -> Result<AiMessage> {
        self.acc.into_ai_message()
    }
}

/// Drain a chunk stream into a full message.
///
/// # Errors
///
/// Propagates the first stream error, or a conversion error.
pub async fn collect_stream(mut stream: MessageChunkStream) -> Result<AiMessage> {
    let mut aggregator = StreamAggregator::new();
    while let Some(chunk) = stream.next().await {
        aggregator.apply(chunk?);
    }
    aggregator.into_ai_message()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Vec<MessageChunk> {
        vec![
            MessageChunk {
                id: Some("m1".into()),
                ..MessageChunk::text("Look")
            },
            MessageChunk::text("ing up"),
            MessageChunk::tool_call_start(0, "call_a", "search"),
            MessageChunk::tool_call_delta(0, r#"{"q":"#),
            MessageChunk::tool_call_start(1, "call_b", "clock"),
            MessageChunk::tool_call_delta(0, r#""rust"}"#),
        ]
    }

    mod concat {
        use super::*;

        #[test]
        fn folds_text_and_tool_calls() {
            let merged = sample()
                .into_iter()
                .reduce(MessageChunk::concat)
                .unwrap();
            let message = merged.into_ai_message().unwrap();
            assert_eq!(message.id.as_deref(), Some("m1"));
            assert_eq!(message.content, "Looking up");
            assert_eq!(message.tool_names(), vec!["search", "clock"]);
            assert_eq!(message.tool_calls[0].args_value(), json!({"q": "rust"}));
            assert!(message.tool_calls[1].args.is_empty());
        }

        #[test]
        fn grouping_does_not_matter() {
            let chunks = sample();
            let left = chunks
                .iter()
                .cloned()
                .reduce(|a, b| a + b)
                .unwrap();
            let (head, tail) = chunks.split_at(3);
            let right_head = head.iter().cloned().reduce(|a, b| a + b).unwrap();
            let right_tail = tail.iter().cloned().reduce(|a, b| a + b).unwrap();
            assert_eq!(left, right_head + right_tail);
        }

        #[test]
        fn first_id_wins() {
            let a = MessageChunk {
                id: Some("first".into()),
                ..MessageChunk::default()
            };
            let b = MessageChunk {
                id: Some("second".into()),
                ..MessageChunk::default()
            };
            assert_eq!((a + b).id.as_deref(), Some("first"));
        }
    }

    mod into_ai_message {
        use super::*;

        #[test]
        fn nameless_tool_call_is_an_error() {
            let chunk = MessageChunk::tool_call_delta(0, "{}");
            assert!(chunk.into_ai_message().is_err());
        }

        #[test]
        fn non_object_arguments_are_an_error() {
            let chunk = MessageChunk::tool_call_start(0, "c", "t") + MessageChunk::tool_call_delta(0, "[1]");
            assert!(chunk.into_ai_message().is_err());
        }
    }

    #[tokio::test]
    async fn collect_stream_aggregates() {
        let items: Vec<Result<MessageChunk>> = sample().into_iter().map(Ok).collect();
        let stream: MessageChunkStream = Box::pin(futures::stream::iter(items));
        let message = collect_stream(stream).await.unwrap();
        assert_eq!(message.tool_calls.len(), 2);
    }

    #[test]
    fn aggregator_counts_chunks() {
        let mut aggregator = StreamAggregator::new();
        for chunk in sample() {
            aggregator.apply(chunk);
        }
        assert_eq!(aggregator.chunk_count(), 6);
        assert_eq!(aggregator.text(), "Looking up");
    }
}
