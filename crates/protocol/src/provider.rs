use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level failure of a model provider call. Retries and backoff are
/// the coordinator's responsibility; clients only classify.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider timeout")]
    Timeout,

    #[error("provider auth failed")]
    Auth,

    #[error("provider rate limited")]
    RateLimited,

    #[error("provider http error: status {status}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("provider invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::Network(_))
    }
}

/// Structured prompt sent to the provider. The prompt text always requests a
/// JSON body; `temperature` is low for planning, slightly higher for
/// synthesis.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

impl TokenUsage {
    pub fn absorb(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    #[must_use]
    pub fn total(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Raw completion: the model's text plus whatever usage accounting the
/// provider reported. The text is *untrusted* and may be arbitrary garbage;
/// parsing and validation happen in the planner.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Thin request/response boundary to an external language model.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<ModelResponse, ProviderError>;
}
