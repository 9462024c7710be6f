//! Built-in middleware pausing the run for human review of selected tool
//! calls.
//!
//! After each model call, the pending calls to reviewed tools are bundled
//! into one [`Interrupt`] and the run stops with [`Error::Interrupted`]
//! before any tool runs. The interrupt payload is a [`ReviewRequest`].
//!
//! To continue, apply one [`Decision`] per reviewed call with
//! [`HumanInTheLoop::resume`] and invoke the agent again with the returned
//! state. Approved and edited calls are still pending, so the run resumes at
//! tool execution without asking for review again.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::callback::RunContext;
use crate::error::{Error, Interrupt, Result};
use crate::message::{Message, ToolCall, ToolMessage};
use crate::state::ConversationState;

use super::{HookUpdate, Middleware, StateHook};

/// The kinds of answer a reviewer may give.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Run the call as requested.
    Approve,
    /// Run the call with different arguments.
    Edit,
    /// Answer the call with an error instead of running it.
    Reject,
}

/// A reviewer's answer to one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// Run the call as requested.
    Approve,
    /// Run the call with replaced arguments.
    Edit {
        /// Arguments the tool receives instead.
        args: Map<String, Value>,
    },
    /// Do not run the call.
    Reject {
        /// Text shown to the model in place of the tool result.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Decision {
    /// The kind of this decision.
    #[must_use]
    pub const fn kind(&self) -> DecisionKind {
        match self {
            Self::Approve => DecisionKind::Approve,
            Self::Edit { .. } => DecisionKind::Edit,
            Self::Reject { .. } => DecisionKind::Reject,
        }
    }
}

/// How calls to one tool are reviewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewPolicy {
    /// Answers the reviewer may give.
    pub allowed: Vec<DecisionKind>,
    /// Text shown to the reviewer. Defaults to the prefix plus the call.
    pub description: Option<String>,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self {
            allowed: vec![DecisionKind::Approve, DecisionKind::Edit, DecisionKind::Reject],
            description: None,
        }
    }
}

/// One call awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Id of the tool call.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments the model supplied.
    pub args: Map<String, Value>,
    /// Text shown to the reviewer.
    pub description: String,
    /// Answers the reviewer may give.
    pub allowed: Vec<DecisionKind>,
}

/// Payload of the interrupt raised by [`HumanInTheLoop`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    /// Calls awaiting review, in call order.
    pub actions: Vec<ActionRequest>,
}

/// Builder for the human-in-the-loop middleware.
///
/// # Example
///
/// ```rust,ignore
/// use corvid::middleware::{Decision, HumanInTheLoop};
///
/// let review = HumanInTheLoop::new().interrupt_on("send_email");
/// let agent = AgentEngine::builder()
///     .model(model)
///     .tool(send_email)
///     .middleware(review.build()?)
///     .build()?;
///
/// match agent.invoke(state, RunConfig::new()).await {
///     Err(Error::Interrupted { state, .. }) => {
///         let state = review.resume(*state, &[Decision::Approve])?;
///         agent.invoke(state, RunConfig::new()).await?;
///     }
///     other => { other?; }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct HumanInTheLoop {
    policies: Vec<(String, ReviewPolicy)>,
    description_prefix: String,
}

impl Default for HumanInTheLoop {
    fn default() -> Self {
        Self {
            policies: Vec::new(),
            description_prefix: "Tool execution requires approval".to_owned(),
        }
    }
}

impl HumanInTheLoop {
    /// Create a builder reviewing no tools.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Review every call to `tool`, allowing any decision.
    #[must_use]
    pub fn interrupt_on(self, tool: impl Into<String>) -> Self {
        self.interrupt_on_with(tool, ReviewPolicy::default())
    }

    /// Review every call to `tool` under `policy`.
    #[must_use]
    pub fn interrupt_on_with(mut self, tool: impl Into<String>, policy: ReviewPolicy) -> Self {
        let tool = tool.into();
        self.policies.retain(|(name, _)| *name != tool);
        self.policies.push((tool, policy));
        self
    }

    /// Set the first line of generated descriptions.
    #[must_use]
    pub fn description_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.description_prefix = prefix.into();
        self
    }

    /// Build the middleware, named `human_in_the_loop`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no tool is reviewed or a policy allows
    /// no decision.
    pub fn build(&self) -> Result<Middleware> {
        if self.policies.is_empty() {
            return Err(Error::config("human in the loop needs at least one reviewed tool"));
        }
        if let Some((tool, _)) = self.policies.iter().find(|(_, p)| p.allowed.is_empty()) {
            return Err(Error::config(format!(
                "review policy for '{tool}' allows no decision"
            )));
        }
        Ok(Middleware::new("human_in_the_loop").after_model(Review(Arc::new(self.clone()))))
    }

    fn policy(&self, tool: &str) -> Option<&ReviewPolicy> {
        self.policies
            .iter()
            .find(|(name, _)| name == tool)
            .map(|(_, policy)| policy)
    }

    /// Pending calls of the latest AI message that need review.
    fn reviewed<'a>(&self, state: &'a ConversationState) -> Vec<&'a ToolCall> {
        state
            .pending_tool_calls()
            .into_iter()
            .filter(|call| self.policy(&call.name).is_some())
            .collect()
    }

    /// Describe the calls of `state` awaiting review.
    #[must_use]
    pub fn request(&self, state: &ConversationState) -> ReviewRequest {
        let actions = self
            .reviewed(state)
            .into_iter()
            .filter_map(|call| {
                let policy = self.policy(&call.name)?;
                let description = policy.description.clone().unwrap_or_else(|| {
                    format!(
                        "{}\n\nTool: {}\nArgs: {}",
                        self.description_prefix,
                        call.name,
                        call.args_value()
                    )
                });
                Some(ActionRequest {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.args.clone(),
                    description,
                    allowed: policy.allowed.clone(),
                })
            })
            .collect();
        ReviewRequest { actions }
    }

    /// Apply one decision per reviewed call, in call order.
    ///
    /// Edits rewrite the call's arguments in the AI message; rejections
    /// answer the call with an error tool message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Agent`] if the number of decisions does not match
    /// the reviewed calls, or a decision is not allowed for its tool.
    pub fn resume(
        &self,
        mut state: ConversationState,
        decisions: &[Decision],
    ) -> Result<ConversationState> {
        let request = self.request(&state);
        if decisions.len() != request.actions.len() {
            return Err(Error::agent(format!(
                "{} decisions given for {} reviewed tool calls",
                decisions.len(),
                request.actions.len()
            )));
        }
        let Some((index, _)) = state.last_ai() else {
            return Ok(state);
        };

        let mut rejections = Vec::new();
        for (action, decision) in request.actions.iter().zip(decisions) {
            if !action.allowed.contains(&decision.kind()) {
                return Err(Error::agent(format!(
                    "decision {:?} is not allowed for tool '{}'; expected one of {:?}",
                    decision.kind(),
                    action.name,
                    action.allowed
                )));
            }
            match decision {
                Decision::Approve => {}
                Decision::Edit { args } => {
                    if let Some(Message::Ai(ai)) = state.messages.get_mut(index)
                        && let Some(call) = ai.tool_calls.iter_mut().find(|c| c.id == action.id)
                    {
                        call.args.clone_from(args);
                    }
                }
                Decision::Reject { message } => {
                    let content = message.clone().unwrap_or_else(|| {
                        format!(
                            "User rejected the tool call for `{}` with id {}",
                            action.name, action.id
                        )
                    });
                    rejections.push(Message::Tool(
                        ToolMessage::error(action.id.clone(), content).with_name(action.name.clone()),
                    ));
                }
            }
        }
        state.messages.extend(rejections);
        Ok(state)
    }
}

struct Review(Arc<HumanInTheLoop>);

impl fmt::Debug for Review {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Review").field(&self.0).finish()
    }
}

#[async_trait]
impl StateHook for Review {
    async fn run(
        &self,
        state: &ConversationState,
        _ctx: &RunContext,
    ) -> Result<Option<HookUpdate>> {
        let request = self.0.request(state);
        if request.actions.is_empty() {
            return Ok(None);
        }
        tracing::debug!(calls = request.actions.len(), "Tool calls await review");
        let mut interrupt = Interrupt::new(serde_json::to_value(&request)?);
        if let [only] = request.actions.as_slice() {
            interrupt = interrupt.with_tool_call_id(only.id.clone());
        }
        Err(Error::Interrupted {
            interrupt,
            state: Box::new(state.clone()),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::message::AiMessage;
    use crate::middleware::MiddlewarePipeline;

    fn state_with(calls: &[(&str, &str)]) -> ConversationState {
        let calls = calls
            .iter()
            .map(|(id, name)| ToolCall::new(*id, *name, json!({"to": "ops@example.com"})))
            .collect();
        ConversationState::new(vec![
            Message::user("go"),
            AiMessage::with_tool_calls(calls).into(),
        ])
    }

    async fn review(hitl: &HumanInTheLoop, state: &ConversationState) -> Result<Option<HookUpdate>> {
        let pipeline = MiddlewarePipeline::new(vec![hitl.build()?])?;
        pipeline.after_model()[0]
            .hook
            .run(state, &RunContext::new())
            .await
    }

    mod build {
        use super::*;

        #[test]
        fn requires_a_reviewed_tool() {
            assert!(matches!(HumanInTheLoop::new().build(), Err(Error::Config(_))));
        }

        #[test]
        fn rejects_empty_policies() {
            let hitl = HumanInTheLoop::new().interrupt_on_with(
                "send_email",
                ReviewPolicy {
                    allowed: Vec::new(),
                    description: None,
                },
            );
            assert!(matches!(hitl.build(), Err(Error::Config(_))));
        }
    }

    mod interrupt {
        use super::*;

        #[tokio::test]
        async fn bundles_reviewed_calls_into_one_interrupt() {
            let hitl = HumanInTheLoop::new()
                .interrupt_on("send_email")
                .interrupt_on_with(
                    "delete",
                    ReviewPolicy {
                        allowed: vec![DecisionKind::Approve, DecisionKind::Reject],
                        description: Some("Destructive".into()),
                    },
                );
            let state = state_with(&[("1", "send_email"), ("2", "search"), ("3", "delete")]);

            let err = review(&hitl, &state).await.unwrap_err();
            let Error::Interrupted { interrupt, state: saved } = err else {
                panic!("expected an interrupt");
            };
            assert_eq!(*saved, state);
            assert!(interrupt.tool_call_id.is_none());

            let request: ReviewRequest = serde_json::from_value(interrupt.value).unwrap();
            let ids: Vec<_> = request.actions.iter().map(|a| a.id.as_str()).collect();
            assert_eq!(ids, ["1", "3"]);
            assert!(request.actions[0].description.starts_with("Tool execution requires approval"));
            assert!(request.actions[0].description.contains("send_email"));
            assert_eq!(request.actions[1].description, "Destructive");
            assert_eq!(
                request.actions[1].allowed,
                [DecisionKind::Approve, DecisionKind::Reject]
            );
        }

        #[tokio::test]
        async fn single_call_names_its_id() {
            let hitl = HumanInTheLoop::new().interrupt_on("send_email");
            let err = review(&hitl, &state_with(&[("7", "send_email")]))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                Error::Interrupted { interrupt, .. } if interrupt.tool_call_id.as_deref() == Some("7")
            ));
        }

        #[tokio::test]
        async fn unreviewed_or_answered_calls_pass() {
            let hitl = HumanInTheLoop::new().interrupt_on("send_email");
            assert!(review(&hitl, &state_with(&[("1", "search")])).await.unwrap().is_none());

            let mut answered = state_with(&[("1", "send_email")]);
            answered.messages.push(Message::tool("1", "sent"));
            assert!(review(&hitl, &answered).await.unwrap().is_none());
        }
    }

    mod resume {
        use super::*;

        #[test]
        fn applies_edits_and_rejections() {
            let hitl = HumanInTheLoop::new()
                .interrupt_on("send_email")
                .interrupt_on("delete");
            let state = state_with(&[("1", "send_email"), ("2", "delete")]);
            let mut edited = Map::new();
            edited.insert("to".into(), json!("me@example.com"));

            let state = hitl
                .resume(
                    state,
                    &[
                        Decision::Edit { args: edited },
                        Decision::Reject { message: None },
                    ],
                )
                .unwrap();

            let pending = state.pending_tool_calls();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].args["to"], json!("me@example.com"));
            let rejection = state.messages.last().and_then(Message::as_tool).unwrap();
            assert_eq!(rejection.tool_call_id, "2");
            assert!(rejection.is_error());
            assert!(rejection.content.contains("`delete`"));
        }

        #[test]
        fn decision_count_must_match() {
            let hitl = HumanInTheLoop::new().interrupt_on("send_email");
            let err = hitl
                .resume(state_with(&[("1", "send_email")]), &[])
                .unwrap_err();
            assert!(err.to_string().contains("0 decisions given for 1"));
        }

        #[test]
        fn disallowed_decisions_fail() {
            let hitl = HumanInTheLoop::new().interrupt_on_with(
                "delete",
                ReviewPolicy {
                    allowed: vec![DecisionKind::Approve],
                    description: None,
                },
            );
            let err = hitl
                .resume(
                    state_with(&[("1", "delete")]),
                    &[Decision::Reject { message: Some("no".into()) }],
                )
                .unwrap_err();
            assert!(matches!(err, Error::Agent(_)));
            assert!(err.to_string().contains("'delete'"));
        }

        #[test]
        fn decisions_read_from_json() {
            let decisions: Vec<Decision> = serde_json::from_value(json!([
                {"type": "approve"},
                {"type": "reject", "message": "not today"},
                {"type": "edit", "args": {"to": "x"}}
            ]))
            .unwrap();
            assert_eq!(decisions[0], Decision::Approve);
            assert_eq!(decisions[1].kind(), DecisionKind::Reject);
            assert_eq!(decisions[2].kind(), DecisionKind::Edit);
        }
    }
}
