//! Control signals returned by tools.
//!
//! A [`Command`] is the alternative to a plain tool result: besides (or
//! instead of) emitting a message it can patch state and redirect control,
//! possibly as a fan-out of [`SendTarget`]s meant for a parent orchestration.

use serde_json::Value;

use crate::message::Message;
use crate::state::StatePatch;

/// Which graph a command is addressed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandGraph {
    /// The graph the tool runs in.
    #[default]
    Current,
    /// The orchestration that invoked this agent.
    Parent,
}

/// A sub-invocation addressed to a node.
#[derive(Debug, Clone, PartialEq)]
pub struct SendTarget {
    /// Target node name.
    pub node: String,
    /// Input for the target.
    pub args: Value,
}

impl SendTarget {
    /// Create a send target.
    #[must_use]
    pub fn new(node: impl Into<String>, args: Value) -> Self {
        Self {
            node: node.into(),
            args,
        }
    }
}

/// Where control goes after the command is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Goto {
    /// A single named node.
    Node(String),
    /// A fan-out of sub-invocations.
    Send(Vec<SendTarget>),
}

/// A tool result that carries control-flow intent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    /// State changes to merge.
    pub update: Option<StatePatch>,
    /// Redirect target.
    pub goto: Option<Goto>,
    /// Graph the command targets.
    pub graph: CommandGraph,
}

impl Command {
    /// Create an empty command.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the state update.
    #[must_use]
    pub fn update(mut self, patch: impl Into<StatePatch>) -> Self {
        self.update = Some(patch.into());
        self
    }

    /// Redirect to a named node.
    #[must_use]
    pub fn goto(mut self, node: impl Into<String>) -> Self {
        self.goto = Some(Goto::Node(node.into()));
        self
    }

    /// Redirect to a fan-out of send targets.
    #[must_use]
    pub fn send(mut self, sends: Vec<SendTarget>) -> Self {
        self.goto = Some(Goto::Send(sends));
        self
    }

    /// Address the command to the parent orchestration.
    #[must_use]
    pub const fn to_parent(mut self) -> Self {
        self.graph = CommandGraph::Parent;
        self
    }

    /// Returns `true` for a parent-graph command carrying send targets.
    #[must_use]
    pub const fn is_parent_send(&self) -> bool {
        matches!(self.graph, CommandGraph::Parent) && matches!(self.goto, Some(Goto::Send(_)))
    }

    /// Messages carried by the update, if any.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        match &self.update {
            Some(patch) => patch.messages(),
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_sets_fields() {
        let cmd = Command::new()
            .update(vec![Message::tool("1", "ok")])
            .goto("model");
        assert_eq!(cmd.goto, Some(Goto::Node("model".into())));
        assert_eq!(cmd.messages().len(), 1);
        assert_eq!(cmd.graph, CommandGraph::Current);
    }

    #[test]
    fn parent_send_detection() {
        let send = Command::new()
            .send(vec![SendTarget::new("worker", json!({"task": 1}))])
            .to_parent();
        assert!(send.is_parent_send());

        let local_send = Command::new().send(vec![SendTarget::new("worker", json!(null))]);
        assert!(!local_send.is_parent_send());

        let parent_goto = Command::new().goto("review").to_parent();
        assert!(!parent_goto.is_parent_send());
    }

    #[test]
    fn messages_empty_without_update() {
        assert!(Command::new().messages().is_empty());
    }
}
