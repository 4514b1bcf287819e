use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::StepKind;

/// Error taxonomy surfaced to event consumers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ProviderError,
    RetrievalEmpty,
    QualityRejected,
    Cancelled,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderError => "provider_error",
            Self::RetrievalEmpty => "retrieval_empty",
            Self::QualityRejected => "quality_rejected",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether re-submitting the same query could plausibly succeed.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::ProviderError)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    pub run_id: String,
    pub step_index: i64,
    pub kind: StepKind,
    pub objective: String,
    pub reasoning: String,
    pub action: Value,
    pub observation: String,
    pub node_refs: Vec<String>,
    pub confidence: f64,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteEvent {
    pub run_id: String,
    pub answer_id: String,
    pub final_confidence: f64,
    pub quality_score: f64,
    pub total_latency_ms: i64,
    pub token_usage: Value,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub run_id: String,
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

/// Multicast run notification. Every variant carries its run id so consumers
/// can filter; there is no server-side "active run" state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReasoningEvent {
    Step(StepEvent),
    Complete(CompleteEvent),
    Error(ErrorEvent),
}

impl ReasoningEvent {
    #[must_use]
    pub fn run_id(&self) -> &str {
        match self {
            Self::Step(event) => &event.run_id,
            Self::Complete(event) => &event.run_id,
            Self::Error(event) => &event.run_id,
        }
    }
}
