use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use docreason_protocol::{
    CompletionRequest, ModelProvider, ModelResponse, ProviderError, TokenUsage,
};

/// Replays a fixed sequence of provider outcomes, one per `complete` call.
///
/// Used by tests and by `docreason ask --script`, which makes the whole agent
/// loop reproducible without network access. An exhausted script reads as a
/// transport failure so the coordinator exercises its fallback path instead
/// of hanging on missing data.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
}

impl ScriptedProvider {
    #[must_use]
    pub fn new(replies: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
        }
    }

    #[must_use]
    pub fn from_texts<T: Into<String>>(texts: Vec<T>) -> Self {
        Self::new(texts.into_iter().map(|text| Ok(text.into())).collect())
    }

    /// Load a script from a JSON array of raw response strings.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let texts: Vec<String> = serde_json::from_str(&raw).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("script must be a JSON array of strings: {err}"),
            )
        })?;
        Ok(Self::from_texts(texts))
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<ModelResponse, ProviderError> {
        let next = {
            let mut replies = self
                .replies
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            replies.pop_front()
        };
        match next {
            Some(Ok(text)) => Ok(ModelResponse {
                text,
                usage: TokenUsage::default(),
            }),
            Some(Err(err)) => Err(err),
            None => Err(ProviderError::Network("script exhausted".to_string())),
        }
    }
}
