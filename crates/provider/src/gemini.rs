use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use docreason_protocol::{
    CompletionRequest, ModelProvider, ModelResponse, ProviderError, TokenUsage,
};

const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Thin client for the Gemini `generateContent` endpoint.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .map_err(|err| ProviderError::Network(err.to_string()))?;
        Ok(Self {
            http,
            model: model.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl ModelProvider for GeminiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<ModelResponse, ProviderError> {
        let endpoint = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let payload = serde_json::json!({
            "contents": [
                {
                    "role": "user",
                    "parts": [{"text": request.prompt}]
                }
            ],
            "generationConfig": {
                "temperature": request.temperature,
                "responseMimeType": "application/json"
            }
        });

        let response = self
            .http
            .post(endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Network(err.to_string())
                }
            })?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(ProviderError::Auth),
            StatusCode::TOO_MANY_REQUESTS => return Err(ProviderError::RateLimited),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Http {
                    status: status.as_u16(),
                    body,
                });
            }
            _ => {}
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;
        decode_envelope(&body)
    }
}

/// Pull the first candidate's text and the usage accounting out of a
/// `generateContent` response body.
fn decode_envelope(body: &Value) -> Result<ModelResponse, ProviderError> {
    let text = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| parts.first())
        .and_then(|part| part.get("text"))
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::InvalidResponse("missing text candidate".to_string()))?;

    let usage_meta = body.get("usageMetadata");
    let usage = TokenUsage {
        prompt_tokens: usage_meta
            .and_then(|meta| meta.get("promptTokenCount"))
            .and_then(Value::as_i64)
            .unwrap_or(0),
        completion_tokens: usage_meta
            .and_then(|meta| meta.get("candidatesTokenCount"))
            .and_then(Value::as_i64)
            .unwrap_or(0),
    };

    log::debug!(
        "gemini response: {} chars, {} prompt / {} completion tokens",
        text.len(),
        usage.prompt_tokens,
        usage.completion_tokens
    );

    Ok(ModelResponse {
        text: text.to_string(),
        usage,
    })
}
