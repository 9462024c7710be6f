//! Built-in middleware retrying failed model and tool calls with exponential
//! backoff.
//!
//! [`ModelRetry`] wraps the model call and by default retries the transient
//! failures a [`ChatModel`](crate::chat::ChatModel) reports through
//! [`ModelError::is_retryable`](crate::error::ModelError::is_retryable).
//! [`ToolRetry`] wraps tool dispatch and by default retries tool execution
//! errors. Interrupts and cancellation are never retried, and a backoff
//! pause ends as soon as the run is cancelled.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result, ToolError};
use crate::message::{AiMessage, ToolMessage};
use crate::tool::ToolOutput;

use super::{
    Middleware, ModelNext, ModelRequest, ToolCallRequest, ToolNext, WrapModelCall, WrapToolCall,
};

/// Decides whether a failure is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Turns the final failure into the text handed back to the agent.
pub type FailureFormatter = Arc<dyn Fn(&Error) -> String + Send + Sync>;

/// Delays between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied per retry. `0.0` keeps the delay constant.
    pub factor: f64,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Spread each delay by up to 25% either way.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry`, counted from zero.
    #[must_use]
    pub fn delay(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let factor = if self.factor > 0.0 { self.factor } else { 1.0 };
        let delay = Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor.powi(exponent))
            .map_or(self.max_delay, |d| d.min(self.max_delay));
        if self.jitter {
            delay.mul_f64(fastrand::f64().mul_add(0.5, 0.75))
        } else {
            delay
        }
    }

    fn validate(&self, middleware: &str) -> Result<()> {
        if !self.factor.is_finite() || self.factor < 0.0 {
            return Err(Error::config(format!(
                "{middleware}: backoff factor must be a finite number >= 0, got {}",
                self.factor
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::config(format!(
                "{middleware}: initial delay {:?} exceeds max delay {:?}",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// What happens once every attempt has failed.
#[derive(Clone)]
pub enum OnFailure {
    /// Return the last error unchanged.
    Raise,
    /// Answer with an error message naming the attempt count.
    Continue,
    /// Answer with a custom message built from the last error.
    Format(FailureFormatter),
}

impl OnFailure {
    /// Build [`OnFailure::Format`] from a closure.
    pub fn format<F>(f: F) -> Self
    where
        F: Fn(&Error) -> String + Send + Sync + 'static,
    {
        Self::Format(Arc::new(f))
    }

    fn text(&self, default: impl FnOnce() -> String, error: &Error) -> Option<String> {
        match self {
            Self::Raise => None,
            Self::Continue => Some(default()),
            Self::Format(f) => Some(f(error)),
        }
    }
}

impl fmt::Debug for OnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raise => f.write_str("Raise"),
            Self::Continue => f.write_str("Continue"),
            Self::Format(_) => f.write_str("Format(..)"),
        }
    }
}

const fn attempts_word(attempts: usize) -> &'static str {
    if attempts == 1 { "attempt" } else { "attempts" }
}

fn never_retried(error: &Error) -> bool {
    error.is_cancelled() || error.is_interrupt() || matches!(error, Error::Tool(ToolError::Interrupt(_)))
}

async fn pause(delay: Duration, signal: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        () = signal.cancelled() => Err(Error::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Builder for the model retry middleware.
///
/// # Example
///
/// ```rust,ignore
/// use corvid::middleware::{Backoff, ModelRetry, OnFailure};
///
/// let retry = ModelRetry::new()
///     .backoff(Backoff { max_retries: 3, ..Backoff::default() })
///     .on_failure(OnFailure::Continue)
///     .build()?;
/// ```
#[derive(Clone)]
pub struct ModelRetry {
    backoff: Backoff,
    retry_on: RetryPredicate,
    on_failure: OnFailure,
}

impl Default for ModelRetry {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            retry_on: Arc::new(|e| matches!(e, Error::Model(m) if m.is_retryable())),
            on_failure: OnFailure::Raise,
        }
    }
}

impl ModelRetry {
    /// Retry rate limits and network failures twice, then raise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delays between attempts.
    #[must_use]
    pub const fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set how many retries follow the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, retries: usize) -> Self {
        self.backoff.max_retries = retries;
        self
    }

    /// Decide which failures are retried.
    #[must_use]
    pub fn retry_on<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(f);
        self
    }

    /// Set what happens after the last failed attempt.
    #[must_use]
    pub fn on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    /// Build the middleware, named `model_retry`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a negative or non-finite backoff
    /// factor, or an initial delay above the maximum.
    pub fn build(self) -> Result<Middleware> {
        self.backoff.validate("model_retry")?;
        Ok(Middleware::new("model_retry").wrap_model_call(self))
    }
}

impl fmt::Debug for ModelRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRetry")
            .field("backoff", &self.backoff)
            .field("on_failure", &self.on_failure)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl WrapModelCall for ModelRetry {
    async fn wrap_model_call(&self, request: ModelRequest, next: ModelNext<'_>) -> Result<AiMessage> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match next.run(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if attempt <= self.backoff.max_retries && !never_retried(&error) && (self.retry_on)(&error) {
                let delay = self.backoff.delay(attempt - 1);
                warn!(attempt, delay = ?delay, error = %error, "Model call failed, retrying");
                pause(delay, &request.signal).await?;
                continue;
            }
            if never_retried(&error) {
                return Err(error);
            }
            let text = self.on_failure.text(
                || {
                    format!(
                        "Model call failed after {attempt} {}: {error}",
                        attempts_word(attempt)
                    )
                },
                &error,
            );
            return match text {
                Some(text) => Ok(AiMessage::new(text)),
                None => Err(error),
            };
        }
    }
}

/// Builder for the tool retry middleware.
///
/// [`OnFailure::Raise`] hands the last error back to the dispatcher, which
/// applies its usual error handling.
#[derive(Clone)]
pub struct ToolRetry {
    backoff: Backoff,
    tools: Option<Vec<String>>,
    retry_on: RetryPredicate,
    on_failure: OnFailure,
}

impl Default for ToolRetry {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            tools: None,
            retry_on: Arc::new(|e| matches!(e, Error::Tool(ToolError::Execution(_)))),
            on_failure: OnFailure::Continue,
        }
    }
}

impl ToolRetry {
    /// Retry execution errors of every tool twice, then answer with an
    /// error message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delays between attempts.
    #[must_use]
    pub const fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set how many retries follow the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, retries: usize) -> Self {
        self.backoff.max_retries = retries;
        self
    }

    /// Only retry these tools.
    #[must_use]
    pub fn tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Decide which failures are retried.
    #[must_use]
    pub fn retry_on<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(f);
        self
    }

    /// Set what happens after the last failed attempt.
    #[must_use]
    pub fn on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    /// Build the middleware, named `tool_retry`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a negative or non-finite backoff
    /// factor, or an initial delay above the maximum.
    pub fn build(self) -> Result<Middleware> {
        self.backoff.validate("tool_retry")?;
        Ok(Middleware::new("tool_retry").wrap_tool_call(self))
    }

    fn applies_to(&self, name: &str) -> bool {
        self.tools
            .as_ref()
            .is_none_or(|names| names.iter().any(|n| n == name))
    }
}

impl fmt::Debug for ToolRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRetry")
            .field("backoff", &self.backoff)
            .field("tools", &self.tools)
            .field("on_failure", &self.on_failure)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl WrapToolCall for ToolRetry {
    async fn wrap_tool_call(&self, request: ToolCallRequest, next: ToolNext<'_>) -> Result<ToolOutput> {
        if !self.applies_to(&request.call.name) {
            return next.run(request).await;
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match next.run(request.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };
            if attempt <= self.backoff.max_retries && !never_retried(&error) && (self.retry_on)(&error) {
                let delay = self.backoff.delay(attempt - 1);
                warn!(
                    tool = %request.call.name,
                    attempt,
                    delay = ?delay,
                    error = %error,
                    "Tool call failed, retrying"
                );
                pause(delay, &request.config.signal).await?;
                continue;
            }
            if never_retried(&error) {
                return Err(error);
            }
            let call = &request.call;
            let text = self.on_failure.text(
                || {
                    format!(
                        "Tool '{}' failed after {attempt} {}: {error}",
                        call.name,
                        attempts_word(attempt)
                    )
                },
                &error,
            );
            return match text {
                Some(text) => Ok(ToolOutput::Message(
                    ToolMessage::error(call.id.clone(), text).with_name(call.name.clone()),
                )),
                None => Err(error),
            };
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::chat::{ChatModel, ModelOptions};
    use crate::error::ModelError;
    use crate::message::{Message, ToolCall};
    use crate::middleware::pipeline::{ModelHandler, ToolHandler};
    use crate::middleware::MiddlewarePipeline;
    use crate::state::ConversationState;
    use crate::tool::ToolConfig;

    fn quick(max_retries: usize) -> Backoff {
        Backoff {
            max_retries,
            initial_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }

    struct Unused;

    #[async_trait]
    impl ChatModel for Unused {
        async fn invoke(&self, _m: &[Message], _o: &ModelOptions) -> Result<AiMessage> {
            Ok(AiMessage::default())
        }
    }

    fn model_request(signal: CancellationToken) -> ModelRequest {
        ModelRequest {
            model: Arc::new(Unused),
            messages: vec![Message::user("hi")],
            system_prompt: None,
            tools: Vec::new(),
            tool_choice: None,
            state: Arc::new(ConversationState::default()),
            signal,
        }
    }

    /// Fails with `error` for the first `failures` attempts.
    struct Flaky {
        failures: usize,
        error: ModelError,
        attempts: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: usize, error: ModelError) -> Self {
            Self {
                failures,
                error,
                attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelHandler for Flaky {
        fn is_registered(&self, _name: &str) -> bool {
            true
        }

        async fn call(&self, _request: ModelRequest) -> Result<AiMessage> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                return Err(self.error.clone().into());
            }
            Ok(AiMessage::new(format!("success after {attempt}")))
        }
    }

    /// Fails every call to `broken` with `error`; answers others.
    struct Tools {
        error: fn() -> ToolError,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ToolHandler for Tools {
        async fn call(&self, request: ToolCallRequest) -> Result<ToolOutput> {
            if request.call.name != "broken" {
                return Ok(ToolOutput::from("fine"));
            }
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err((self.error)().into())
        }
    }

    fn tool_request(name: &str) -> ToolCallRequest {
        ToolCallRequest {
            call: ToolCall::new("call_1", name, json!({})),
            tool: None,
            state: Arc::new(ConversationState::default()),
            config: ToolConfig::new(CancellationToken::new()),
        }
    }

    mod backoff {
        use super::*;

        #[test]
        fn grows_then_caps() {
            let backoff = Backoff {
                factor: 10.0,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(2),
                jitter: false,
                ..Backoff::default()
            };
            assert_eq!(backoff.delay(0), Duration::from_secs(1));
            assert_eq!(backoff.delay(1), Duration::from_secs(2));
            assert_eq!(backoff.delay(40), Duration::from_secs(2));
        }

        #[test]
        fn zero_factor_is_constant() {
            let backoff = Backoff {
                factor: 0.0,
                ..quick(3)
            };
            assert_eq!(backoff.delay(0), backoff.delay(2));
        }

        #[test]
        fn jitter_stays_within_a_quarter() {
            let backoff = Backoff {
                factor: 1.0,
                jitter: true,
                ..quick(1)
            };
            for _ in 0..20 {
                let delay = backoff.delay(0);
                assert!(delay >= Duration::from_millis(75));
                assert!(delay <= Duration::from_millis(125));
            }
        }

        #[test]
        fn invalid_settings_are_rejected() {
            let negative = ModelRetry::new().backoff(Backoff {
                factor: -1.0,
                ..quick(1)
            });
            assert!(matches!(negative.build(), Err(Error::Config(_))));

            let inverted = ToolRetry::new().backoff(Backoff {
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(1),
                ..quick(1)
            });
            assert!(matches!(inverted.build(), Err(Error::Config(_))));
        }
    }

    mod model {
        use super::*;

        async fn call(retry: ModelRetry, base: &Flaky, signal: CancellationToken) -> Result<AiMessage> {
            let pipeline = MiddlewarePipeline::new(vec![retry.build()?])?;
            pipeline.call_model(model_request(signal), base).await
        }

        #[tokio::test(start_paused = true)]
        async fn transient_failures_are_retried() {
            let base = Flaky::new(2, ModelError::rate_limited("mock"));
            let started = tokio::time::Instant::now();
            let response = call(ModelRetry::new().backoff(quick(2)), &base, CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(response.content, "success after 3");
            assert_eq!(base.attempts.load(Ordering::SeqCst), 3);
            // 100ms, then 200ms
            assert!(started.elapsed() >= Duration::from_millis(300));
        }

        #[tokio::test(start_paused = true)]
        async fn permanent_failures_raise_at_once() {
            let base = Flaky::new(5, ModelError::provider("mock", "bad request"));
            let err = call(ModelRetry::new().backoff(quick(3)), &base, CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Model(_)));
            assert_eq!(base.attempts.load(Ordering::SeqCst), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn exhausted_retries_can_continue_with_a_message() {
            let base = Flaky::new(5, ModelError::network("connection reset"));
            let response = call(
                ModelRetry::new()
                    .backoff(quick(2))
                    .on_failure(OnFailure::Continue),
                &base,
                CancellationToken::new(),
            )
            .await
            .unwrap();
            assert!(response.content.contains("3 attempts"));
            assert!(response.content.contains("connection reset"));
            assert!(!response.has_tool_calls());
        }

        #[tokio::test(start_paused = true)]
        async fn custom_formatter_and_predicate() {
            let base = Flaky::new(5, ModelError::provider("mock", "overloaded"));
            let response = call(
                ModelRetry::new()
                    .backoff(quick(1))
                    .retry_on(|e| e.to_string().contains("overloaded"))
                    .on_failure(OnFailure::format(|e| format!("Custom: {e}"))),
                &base,
                CancellationToken::new(),
            )
            .await
            .unwrap();
            assert_eq!(base.attempts.load(Ordering::SeqCst), 2);
            assert_eq!(response.content, "Custom: Model error: [mock] overloaded");
        }

        #[tokio::test(start_paused = true)]
        async fn cancellation_ends_the_backoff() {
            let base = Flaky::new(5, ModelError::rate_limited("mock"));
            let signal = CancellationToken::new();
            let trigger = signal.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                trigger.cancel();
            });
            let retry = ModelRetry::new().backoff(Backoff {
                initial_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(60),
                ..quick(3)
            });
            let err = call(retry, &base, signal).await.unwrap_err();
            assert!(matches!(err, Error::Cancelled));
            assert_eq!(base.attempts.load(Ordering::SeqCst), 1);
        }
    }

    mod tool {
        use super::*;

        async fn call(retry: ToolRetry, base: &Tools, name: &str) -> Result<ToolOutput> {
            let pipeline = MiddlewarePipeline::new(vec![retry.build()?])?;
            pipeline.call_tool(tool_request(name), base).await
        }

        fn failing(error: fn() -> ToolError) -> Tools {
            Tools {
                error,
                attempts: AtomicUsize::new(0),
            }
        }

        #[tokio::test(start_paused = true)]
        async fn exhausted_retries_answer_with_an_error_message() {
            let base = failing(|| ToolError::execution("disk full"));
            let output = call(ToolRetry::new().backoff(quick(2)), &base, "broken")
                .await
                .unwrap();
            let ToolOutput::Message(message) = output else {
                panic!("expected a tool message");
            };
            assert!(message.is_error());
            assert_eq!(message.tool_call_id, "call_1");
            assert!(message.content.contains("'broken'"));
            assert!(message.content.contains("3 attempts"));
            assert_eq!(base.attempts.load(Ordering::SeqCst), 3);
        }

        #[tokio::test(start_paused = true)]
        async fn zero_retries_reports_one_attempt() {
            let base = failing(|| ToolError::execution("disk full"));
            let output = call(ToolRetry::new().backoff(quick(0)), &base, "broken")
                .await
                .unwrap();
            let ToolOutput::Message(message) = output else {
                panic!("expected a tool message");
            };
            assert!(message.content.contains("1 attempt:"));
        }

        #[tokio::test(start_paused = true)]
        async fn raise_returns_the_last_error() {
            let base = failing(|| ToolError::execution("disk full"));
            let err = call(
                ToolRetry::new().backoff(quick(1)).on_failure(OnFailure::Raise),
                &base,
                "broken",
            )
            .await
            .unwrap_err();
            assert!(matches!(err, Error::Tool(ToolError::Execution(_))));
            assert_eq!(base.attempts.load(Ordering::SeqCst), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn unselected_tools_pass_through() {
            let base = failing(|| ToolError::execution("disk full"));
            let err = call(
                ToolRetry::new().backoff(quick(3)).tools(["other"]).on_failure(OnFailure::Raise),
                &base,
                "broken",
            )
            .await
            .unwrap_err();
            assert!(matches!(err, Error::Tool(_)));
            assert_eq!(base.attempts.load(Ordering::SeqCst), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn interrupts_are_never_retried() {
            let base = failing(|| ToolError::interrupt(json!("approve?")));
            let err = call(ToolRetry::new().backoff(quick(3)), &base, "broken")
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Tool(ToolError::Interrupt(_))));
            assert_eq!(base.attempts.load(Ordering::SeqCst), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn invalid_arguments_are_not_retried_by_default() {
            let base = failing(|| ToolError::invalid_args("missing q"));
            let output = call(ToolRetry::new().backoff(quick(3)), &base, "broken")
                .await
                .unwrap();
            assert_eq!(base.attempts.load(Ordering::SeqCst), 1);
            assert!(matches!(output, ToolOutput::Message(m) if m.content.contains("1 attempt:")));
        }

        #[tokio::test]
        async fn successful_calls_are_untouched() {
            let base = failing(|| ToolError::execution("unused"));
            let output = call(ToolRetry::new(), &base, "fine").await.unwrap();
            assert!(matches!(output, ToolOutput::Value(_)));
            assert_eq!(base.attempts.load(Ordering::SeqCst), 0);
        }
    }
}
