//! Built-in middleware appending fixed instructions to the system prompt.

use async_trait::async_trait;

use crate::error::Result;
use crate::message::AiMessage;

use super::{Middleware, ModelNext, ModelRequest, WrapModelCall};

/// Appends text to the system prompt of every model call.
///
/// Requests without a system prompt get one.
#[derive(Debug, Clone)]
pub struct SystemPrompt {
    text: String,
}

impl SystemPrompt {
    /// Create the wrapper.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Wrap into a middleware named `system_prompt`.
    #[must_use]
    pub fn into_middleware(self) -> Middleware {
        Middleware::new("system_prompt").wrap_model_call(self)
    }
}

#[async_trait]
impl WrapModelCall for SystemPrompt {
    async fn wrap_model_call(
        &self,
        mut request: ModelRequest,
        next: ModelNext<'_>,
    ) -> Result<AiMessage> {
        request.system_prompt = Some(match request.system_prompt.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n\n{}", self.text),
            _ => self.text.clone(),
        });
        next.run(request).await
    }
}
