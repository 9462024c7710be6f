//! Node topology of the agent loop.
//!
//! ```text
//! BeforeAgent* -> [ BeforeModel* -> PrepareRequest -> ModelCall -> AfterModel* -> RouteDecision ]
//!                        ^                                                           |
//!                        +------------------------ ToolExecution <-------------------+
//!                                                                                    |
//!                                                       AfterAgent* -> Terminal <----+
//! ```
//!
//! `AfterModel(i)` and `AfterAgent(i)` index hooks in execution order, which
//! is the reverse of registration order.

use std::fmt;

use crate::middleware::{JumpTo, MiddlewarePipeline};
use crate::state::ConversationState;

/// A position in the agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    /// The i-th `before_agent` hook.
    BeforeAgent(usize),
    /// The i-th `before_model` hook.
    BeforeModel(usize),
    /// Model request assembly through the `wrap_model_call` chain.
    PrepareRequest,
    /// The model call itself.
    ModelCall,
    /// The i-th `after_model` hook, in execution order.
    AfterModel(usize),
    /// Choice between tools, another turn and the end.
    RouteDecision,
    /// Concurrent execution of pending tool calls.
    ToolExecution,
    /// The i-th `after_agent` hook, in execution order.
    AfterAgent(usize),
    /// The run is over.
    Terminal,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeAgent(i) => write!(f, "before_agent[{i}]"),
            Self::BeforeModel(i) => write!(f, "before_model[{i}]"),
            Self::PrepareRequest => f.write_str("prepare_request"),
            Self::ModelCall => f.write_str("model_call"),
            Self::AfterModel(i) => write!(f, "after_model[{i}]"),
            Self::RouteDecision => f.write_str("route_decision"),
            Self::ToolExecution => f.write_str("tool_execution"),
            Self::AfterAgent(i) => write!(f, "after_agent[{i}]"),
            Self::Terminal => f.write_str("terminal"),
        }
    }
}

/// Static successor function derived from the registered middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Graph {
    before_agent: usize,
    before_model: usize,
    after_model: usize,
    after_agent: usize,
    has_middleware: bool,
}

impl Graph {
    /// Derive the topology of a pipeline.
    #[must_use]
    pub fn new(pipeline: &MiddlewarePipeline) -> Self {
        Self {
            before_agent: pipeline.before_agent().len(),
            before_model: pipeline.before_model().len(),
            after_model: pipeline.after_model().len(),
            after_agent: pipeline.after_agent().len(),
            has_middleware: !pipeline.is_empty(),
        }
    }

    /// First node of a fresh run.
    #[must_use]
    pub const fn start(&self) -> Node {
        if self.before_agent > 0 {
            Node::BeforeAgent(0)
        } else {
            self.loop_entry()
        }
    }

    /// First node of a run over `state`.
    ///
    /// A state whose latest AI message still waits on tool calls resumes at
    /// [`Node::ToolExecution`].
    #[must_use]
    pub fn resume(&self, state: &ConversationState) -> Node {
        if state.awaits_tools() {
            Node::ToolExecution
        } else {
            self.start()
        }
    }

    /// Where each turn begins.
    #[must_use]
    pub const fn loop_entry(&self) -> Node {
        if self.before_model > 0 {
            Node::BeforeModel(0)
        } else if self.has_middleware {
            Node::PrepareRequest
        } else {
            Node::ModelCall
        }
    }

    /// Where the loop exits to.
    #[must_use]
    pub const fn finish(&self) -> Node {
        if self.after_agent > 0 {
            Node::AfterAgent(0)
        } else {
            Node::Terminal
        }
    }

    /// Target of a hook's jump.
    #[must_use]
    pub const fn jump(&self, to: JumpTo) -> Node {
        match to {
            JumpTo::Model => Node::PrepareRequest,
            JumpTo::Tools => Node::ToolExecution,
            JumpTo::End => self.finish(),
        }
    }

    /// Unconditional successor of a linear node.
    ///
    /// [`Node::RouteDecision`] and [`Node::ToolExecution`] branch on state
    /// and are resolved by the engine; for them this returns the loop exit.
    #[must_use]
    pub const fn next(&self, node: Node) -> Node {
        match node {
            Node::BeforeAgent(i) if i + 1 < self.before_agent => Node::BeforeAgent(i + 1),
            Node::BeforeAgent(_) => self.loop_entry(),
            Node::BeforeModel(i) if i + 1 < self.before_model => Node::BeforeModel(i + 1),
            Node::BeforeModel(_) => Node::PrepareRequest,
            Node::PrepareRequest => Node::ModelCall,
            Node::ModelCall if self.after_model > 0 => Node::AfterModel(0),
            Node::ModelCall => Node::RouteDecision,
            Node::AfterModel(i) if i + 1 < self.after_model => Node::AfterModel(i + 1),
            Node::AfterModel(_) => Node::RouteDecision,
            Node::RouteDecision | Node::ToolExecution => self.finish(),
            Node::AfterAgent(i) if i + 1 < self.after_agent => Node::AfterAgent(i + 1),
            Node::AfterAgent(_) | Node::Terminal => Node::Terminal,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::message::{AiMessage, Message, ToolCall};
    use crate::middleware::{Middleware, hook_fn};

    fn noop() -> impl crate::middleware::StateHook + 'static {
        hook_fn(|_, _| Ok(None))
    }

    fn graph(middleware: Vec<Middleware>) -> Graph {
        Graph::new(&MiddlewarePipeline::new(middleware).unwrap())
    }

    fn walk(graph: &Graph, from: Node, until: Node) -> Vec<Node> {
        let mut path = vec![from];
        let mut node = from;
        while node != until {
            node = graph.next(node);
            path.push(node);
        }
        path
    }

    mod entry {
        use super::*;

        #[test]
        fn bare_agent_calls_model_directly() {
            let g = graph(Vec::new());
            assert_eq!(g.start(), Node::ModelCall);
            assert_eq!(g.next(Node::ModelCall), Node::RouteDecision);
            assert_eq!(g.finish(), Node::Terminal);
        }

        #[test]
        fn middleware_without_before_hooks_enters_at_request() {
            let g = graph(vec![Middleware::new("m").after_model(noop())]);
            assert_eq!(g.loop_entry(), Node::PrepareRequest);
        }

        #[test]
        fn before_hooks_come_first() {
            let g = graph(vec![
                Middleware::new("a").before_agent(noop()).before_model(noop()),
                Middleware::new("b").before_model(noop()),
            ]);
            assert_eq!(g.start(), Node::BeforeAgent(0));
            assert_eq!(
                walk(&g, g.start(), Node::ModelCall),
                vec![
                    Node::BeforeAgent(0),
                    Node::BeforeModel(0),
                    Node::BeforeModel(1),
                    Node::PrepareRequest,
                    Node::ModelCall,
                ]
            );
        }
    }

    #[test]
    fn after_chain_reaches_route_then_terminal() {
        let g = graph(vec![
            Middleware::new("a").after_model(noop()).after_agent(noop()),
            Middleware::new("b").after_model(noop()),
        ]);
        assert_eq!(
            walk(&g, Node::ModelCall, Node::RouteDecision),
            vec![
                Node::ModelCall,
                Node::AfterModel(0),
                Node::AfterModel(1),
                Node::RouteDecision,
            ]
        );
        assert_eq!(g.finish(), Node::AfterAgent(0));
        assert_eq!(g.next(Node::AfterAgent(0)), Node::Terminal);
    }

    #[test]
    fn jumps() {
        let g = graph(vec![Middleware::new("a").before_model(noop())]);
        assert_eq!(g.jump(JumpTo::Model), Node::PrepareRequest);
        assert_eq!(g.jump(JumpTo::Tools), Node::ToolExecution);
        assert_eq!(g.jump(JumpTo::End), Node::Terminal);
    }

    #[test]
    fn pending_tool_calls_resume_at_tools() {
        let g = graph(vec![Middleware::new("a").before_agent(noop())]);
        let mut state = ConversationState::from_user("hi");
        state.messages.push(Message::Ai(AiMessage::with_tool_calls(vec![
            ToolCall::new("1", "search", json!({})),
            ToolCall::new("2", "search", json!({})),
        ])));
        state.messages.push(Message::tool("1", "done"));
        assert_eq!(g.resume(&state), Node::ToolExecution);

        state.messages.push(Message::tool("2", "done"));
        assert_eq!(g.resume(&state), Node::BeforeAgent(0));
    }

    #[test]
    fn display_names() {
        assert_eq!(Node::AfterModel(2).to_string(), "after_model[2]");
        assert_eq!(Node::PrepareRequest.to_string(), "prepare_request");
    }
}
