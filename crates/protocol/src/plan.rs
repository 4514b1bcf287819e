use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::nodes::NeighborDirection;

/// Action vocabulary the planner is allowed to emit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Search,
    Inspect,
    ExpandNeighbors,
    Synthesize,
    SelfCheck,
    Finish,
}

impl StepKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Inspect => "inspect",
            Self::ExpandNeighbors => "expand_neighbors",
            Self::Synthesize => "synthesize",
            Self::SelfCheck => "self_check",
            Self::Finish => "finish",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "search" => Some(Self::Search),
            "inspect" => Some(Self::Inspect),
            "expand_neighbors" => Some(Self::ExpandNeighbors),
            "synthesize" => Some(Self::Synthesize),
            "self_check" => Some(Self::SelfCheck),
            "finish" => Some(Self::Finish),
            _ => None,
        }
    }
}

/// Closed, fully-populated form of a planned action. Model output is
/// validated into one of these variants or discarded; there is no
/// partially-populated state.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAction {
    Search { query: String },
    Inspect { node_id: String },
    ExpandNeighbors { node_id: String, direction: NeighborDirection },
    Synthesize,
    SelfCheck,
    Finish,
}

impl PlannedAction {
    #[must_use]
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Search { .. } => StepKind::Search,
            Self::Inspect { .. } => StepKind::Inspect,
            Self::ExpandNeighbors { .. } => StepKind::ExpandNeighbors,
            Self::Synthesize => StepKind::Synthesize,
            Self::SelfCheck => StepKind::SelfCheck,
            Self::Finish => StepKind::Finish,
        }
    }

    /// JSON form of the executed parameters, persisted on the step record.
    #[must_use]
    pub fn params_json(&self) -> Value {
        match self {
            Self::Search { query } => json!({ "query": query }),
            Self::Inspect { node_id } => json!({ "node_id": node_id }),
            Self::ExpandNeighbors { node_id, direction } => {
                json!({ "node_id": node_id, "direction": direction.as_str() })
            }
            Self::Synthesize | Self::SelfCheck | Self::Finish => json!({}),
        }
    }
}

/// Where a plan came from, kept for the planner trace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Model,
    Fallback,
}

impl PlanSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Fallback => "fallback",
        }
    }
}

/// Validated next step proposed by the planner. Transient: either executed
/// (becoming a step record) or replaced wholesale by the fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub action: PlannedAction,
    pub objective: String,
    pub reasoning: String,
    pub stop: bool,
    pub source: PlanSource,
}

impl PlannedStep {
    #[must_use]
    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }
}
