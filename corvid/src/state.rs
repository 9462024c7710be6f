//! Conversation state threaded through every node of a run, and the patches
//! hooks and tools use to change it.
//!
//! The engine owns the [`ConversationState`] for the whole invoke. Middleware
//! and tools only ever see a shared reference and answer with a
//! [`StatePatch`], which the engine merges with [`ConversationState::apply`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::Command;
use crate::message::{AiMessage, Message, ToolCall};

/// Step budget used when a state does not specify one.
pub const DEFAULT_REMAINING_STEPS: usize = 25;

const fn default_remaining_steps() -> usize {
    DEFAULT_REMAINING_STEPS
}

/// The evolving state of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    /// Full message history, oldest first.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Model calls still allowed in this run.
    #[serde(default = "default_remaining_steps")]
    pub remaining_steps: usize,
    /// Validated structured result, when one was requested and produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_response: Option<Value>,
    /// Keys owned by middleware state slices.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub middleware_state: Map<String, Value>,
    /// Control signal a tool addressed to the parent orchestration.
    #[serde(skip)]
    pub parent_command: Option<Command>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            remaining_steps: DEFAULT_REMAINING_STEPS,
            structured_response: None,
            middleware_state: Map::new(),
            parent_command: None,
        }
    }
}

impl ConversationState {
    /// Create a state holding the given messages.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Create a state from a single user message.
    #[must_use]
    pub fn from_user(content: impl Into<String>) -> Self {
        Self::new(vec![Message::user(content)])
    }

    /// Set the step budget.
    #[must_use]
    pub const fn with_remaining_steps(mut self, steps: usize) -> Self {
        self.remaining_steps = steps;
        self
    }

    /// Set a middleware state key.
    #[must_use]
    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.middleware_state.insert(key.into(), value);
        self
    }

    /// Merge a patch: top-level keys are replaced shallowly, messages are
    /// appended unless the patch asks for a full replacement.
    pub fn apply(&mut self, patch: StatePatch) {
        match patch.messages {
            Some(MessagesUpdate::Append(messages)) => self.messages.extend(messages),
            Some(MessagesUpdate::Replace(messages)) => self.messages = messages,
            None => {}
        }
        if let Some(value) = patch.structured_response {
            self.structured_response = Some(value);
        }
        for (key, value) in patch.middleware_state {
            self.middleware_state.insert(key, value);
        }
    }

    /// Insert defaults for middleware state keys the caller left out.
    pub fn fill_defaults(&mut self, defaults: &Map<String, Value>) {
        for (key, value) in defaults {
            self.middleware_state
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Returns the most recent message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Returns the most recent AI message and its position.
    #[must_use]
    pub fn last_ai(&self) -> Option<(usize, &AiMessage)> {
        self.messages
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, m)| m.as_ai().map(|ai| (i, ai)))
    }

    /// Ids of every tool call that already has an answering tool message.
    #[must_use]
    pub fn answered_tool_call_ids(&self) -> HashSet<&str> {
        self.messages
            .iter()
            .filter_map(Message::as_tool)
            .map(|t| t.tool_call_id.as_str())
            .collect()
    }

    /// Tool calls of the latest AI message that have no answer yet.
    #[must_use]
    pub fn pending_tool_calls(&self) -> Vec<&ToolCall> {
        let Some((_, ai)) = self.last_ai() else {
            return Vec::new();
        };
        let answered = self.answered_tool_call_ids();
        ai.tool_calls
            .iter()
            .filter(|c| !answered.contains(c.id.as_str()))
            .collect()
    }

    /// Returns `true` when the latest AI message still waits on tool calls
    /// and only tool messages have been appended after it.
    #[must_use]
    pub fn awaits_tools(&self) -> bool {
        let Some((index, _)) = self.last_ai() else {
            return false;
        };
        self.messages[index + 1..]
            .iter()
            .all(|m| matches!(m, Message::Tool(_)))
            && !self.pending_tool_calls().is_empty()
    }

    /// Deserialize the structured response into a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored value does not match `T`.
    pub fn structured_response_as<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Option<Result<T, serde_json::Error>> {
        self.structured_response
            .clone()
            .map(serde_json::from_value)
    }
}

/// How a patch changes the message list.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagesUpdate {
    /// Append to the existing history.
    Append(Vec<Message>),
    /// Replace the whole history.
    Replace(Vec<Message>),
}

/// A partial update returned by a hook, a tool command or an engine node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    /// Message list change.
    pub messages: Option<MessagesUpdate>,
    /// New structured response.
    pub structured_response: Option<Value>,
    /// Middleware state keys to overwrite.
    pub middleware_state: Map<String, Value>,
}

impl StatePatch {
    /// Create an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Patch that appends the given messages.
    #[must_use]
    pub fn append(messages: Vec<Message>) -> Self {
        Self {
            messages: Some(MessagesUpdate::Append(messages)),
            ..Self::default()
        }
    }

    /// Patch that replaces the whole message history.
    #[must_use]
    pub fn replace(messages: Vec<Message>) -> Self {
        Self {
            messages: Some(MessagesUpdate::Replace(messages)),
            ..Self::default()
        }
    }

    /// Add one message to the patch.
    #[must_use]
    pub fn message(mut self, message: impl Into<Message>) -> Self {
        self.push(message.into());
        self
    }

    /// Set the structured response.
    #[must_use]
    pub fn structured_response(mut self, value: Value) -> Self {
        self.structured_response = Some(value);
        self
    }

    /// Set a middleware state key.
    #[must_use]
    pub fn state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.middleware_state.insert(key.into(), value);
        self
    }

    /// Push a message, appending when the patch has no message update yet.
    pub fn push(&mut self, message: Message) {
        match &mut self.messages {
            Some(MessagesUpdate::Append(list) | MessagesUpdate::Replace(list)) => {
                list.push(message);
            }
            None => self.messages = Some(MessagesUpdate::Append(vec![message])),
        }
    }

    /// Fold another patch into this one, as if both were applied in order.
    pub fn merge(&mut self, other: Self) {
        match (self.messages.take(), other.messages) {
            (current, None) => self.messages = current,
            (_, Some(MessagesUpdate::Replace(list))) => {
                self.messages = Some(MessagesUpdate::Replace(list));
            }
            (None, Some(append)) => self.messages = Some(append),
            (Some(MessagesUpdate::Append(mut list)), Some(MessagesUpdate::Append(more))) => {
                list.extend(more);
                self.messages = Some(MessagesUpdate::Append(list));
            }
            (Some(MessagesUpdate::Replace(mut list)), Some(MessagesUpdate::Append(more))) => {
                list.extend(more);
                self.messages = Some(MessagesUpdate::Replace(list));
            }
        }
        if other.structured_response.is_some() {
            self.structured_response = other.structured_response;
        }
        self.middleware_state.extend(other.middleware_state);
    }

    /// Returns `true` if the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_none()
            && self.structured_response.is_none()
            && self.middleware_state.is_empty()
    }

    /// Messages this patch adds or installs, in order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        match &self.messages {
            Some(MessagesUpdate::Append(list) | MessagesUpdate::Replace(list)) => list,
            None => &[],
        }
    }
}

impl From<Vec<Message>> for StatePatch {
    fn from(messages: Vec<Message>) -> Self {
        Self::append(messages)
    }
}
