use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::StepKind;

/// Coarse-grained stage of a run. `phase` tracks how far the run got;
/// attempts that produced nothing do not advance it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    Retrieval,
    Synthesis,
    Validation,
    Completed,
    Failed,
}

impl RunPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Retrieval => "retrieval",
            Self::Synthesis => "synthesis",
            Self::Validation => "validation",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "planning" => Some(Self::Planning),
            "retrieval" => Some(Self::Retrieval),
            "synthesis" => Some(Self::Synthesis),
            "validation" => Some(Self::Validation),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Deterministic quality verdict for a synthesized answer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QualityMetrics {
    pub composite: f64,
    pub query_alignment: f64,
    pub citation_coverage: f64,
    pub cross_document_coverage: f64,
    pub grounding_failure: bool,
}

/// One query execution. Owned by the run coordinator; immutable once
/// `status` leaves `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningRun {
    pub id: String,
    pub project_id: String,
    pub focus_document_id: Option<String>,
    pub query: String,
    pub phase: RunPhase,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_latency_ms: Option<i64>,
    pub token_usage: Value,
    pub cost_usd: f64,
    pub quality: Option<QualityMetrics>,
    pub planner_trace: Value,
}

/// One executed planner action and its observation. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub run_id: String,
    pub idx: i64,
    pub kind: StepKind,
    pub objective: String,
    pub reasoning: String,
    pub params: Value,
    pub observation: String,
    pub node_refs: Vec<String>,
    pub confidence: f64,
    pub latency_ms: i64,
}

/// At most one per run; written only once the run reaches a terminal phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub run_id: String,
    pub answer_markdown: String,
    pub citations: Vec<String>,
    pub confidence: f64,
    pub grounded: bool,
    pub quality: Option<QualityMetrics>,
}

/// Synchronous snapshot returned by `get_run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: ReasoningRun,
    pub steps: Vec<ReasoningStep>,
    pub answer: Option<AnswerRecord>,
}
