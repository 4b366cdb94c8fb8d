//! LLM transport adapter seam. `spec.md` §1 scopes the concrete wire format
//! out of this crate — the loop only needs one async call per turn through
//! this trait. Request/response shapes and the mock implementation are
//! grounded in `provider::traits::{StreamConfig, ToolDefinition}` and
//! `provider::mock::MockProvider`, flattened from their streaming-delta
//! design down to the single-call-per-turn contract the loop requires.

use crate::context::ContextConfig;
use crate::tool::ToolDefinition;
use crate::types::*;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub thinking_level: ThinkingLevel,
    pub cache_config: CacheConfig,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: Vec<Content>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub model: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("api error: {0}")]
    Api(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Retryable: rate limits and transient network errors. Not retryable:
    /// auth, bad-request style API errors, or cancellation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Network(_))
    }

    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::RateLimited { retry_after_ms: Some(ms) } => Some(std::time::Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

/// One model call per turn; no wire-format or streaming-delta concerns live
/// on this trait, only the request/response shape the loop needs.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        request: LlmRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<LlmResponse, LlmError>;
}

/// Wraps an `LlmClient` with the retry policy shared by `retry::RetryConfig`.
pub struct RetryingLlmClient<C: LlmClient> {
    inner: C,
    retry: crate::retry::RetryConfig,
}

impl<C: LlmClient> RetryingLlmClient<C> {
    pub fn new(inner: C, retry: crate::retry::RetryConfig) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for RetryingLlmClient<C> {
    async fn complete(
        &self,
        request: LlmRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let mut attempt = 0usize;
        loop {
            match self.inner.complete(request.clone(), cancel.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = e.retry_after().unwrap_or_else(|| self.retry.delay_for_attempt(attempt));
                    crate::retry::log_retry(attempt, self.retry.max_retries, &delay, &e);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Scripted responses for tests; no real network calls.
pub struct MockLlmClient {
    responses: std::sync::Mutex<Vec<Result<LlmResponse, LlmError>>>,
}

impl MockLlmClient {
    pub fn new(responses: Vec<Result<LlmResponse, LlmError>>) -> Self {
        Self { responses: std::sync::Mutex::new(responses) }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(LlmResponse {
            content: vec![Content::text(text)],
            stop_reason: StopReason::Stop,
            usage: Usage::default(),
            model: "mock".into(),
        })])
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        _request: LlmRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(LlmResponse {
                content: vec![Content::text("(no more mock responses)")],
                stop_reason: StopReason::Stop,
                usage: Usage::default(),
                model: "mock".into(),
            })
        } else {
            responses.remove(0)
        }
    }
}

/// Default token budget a `ContextConfig` reserves for the system prompt;
/// kept here so adapters and the compactor agree on the same baseline.
pub fn default_context_config() -> ContextConfig {
    ContextConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn req() -> LlmRequest {
        LlmRequest {
            model: "m".into(),
            system_prompt: "s".into(),
            messages: vec![],
            tools: vec![],
            thinking_level: ThinkingLevel::Off,
            cache_config: CacheConfig::default(),
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn mock_client_returns_scripted_text() {
        let client = MockLlmClient::text("hello");
        let resp = client.complete(req(), CancellationToken::new()).await.unwrap();
        assert_eq!(resp.content[0].as_text(), Some("hello"));
    }

    #[tokio::test]
    async fn retrying_client_retries_then_succeeds() {
        let client = MockLlmClient::new(vec![
            Err(LlmError::RateLimited { retry_after_ms: Some(1) }),
            Ok(LlmResponse {
                content: vec![Content::text("ok")],
                stop_reason: StopReason::Stop,
                usage: Usage::default(),
                model: "mock".into(),
            }),
        ]);
        let retrying = RetryingLlmClient::new(client, crate::retry::RetryConfig::default());
        let resp = retrying.complete(req(), CancellationToken::new()).await.unwrap();
        assert_eq!(resp.content[0].as_text(), Some("ok"));
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let client = MockLlmClient::new(vec![Err(LlmError::Auth("bad key".into()))]);
        let retrying = RetryingLlmClient::new(client, crate::retry::RetryConfig::default());
        let result = retrying.complete(req(), CancellationToken::new()).await;
        assert!(matches!(result, Err(LlmError::Auth(_))));
    }
}
