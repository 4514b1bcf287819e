use std::time::Duration;

/// Hard bounds on one run. Liveness depends on these being finite, so none of
/// them can be disabled, only tuned.
#[derive(Debug, Clone)]
pub struct RunLimits {
    /// Maximum executed steps before synthesis is forced.
    pub max_steps: usize,
    /// Extra steps granted when a rejected answer re-enters retrieval,
    /// including the revision's own synthesize step.
    pub revision_steps: usize,
    /// How many times a rejected answer may loop back into retrieval.
    pub max_revisions: usize,
    /// Applied to every provider call and every repository call.
    pub step_timeout: Duration,
    /// Pause after a provider transport failure before the next call.
    pub provider_backoff: Duration,
    /// Result cap per search action.
    pub search_limit: usize,
    /// How many recent observations are replayed into the planner prompt.
    pub observation_window: usize,
    /// Consecutive empty searches tolerated before the run fails as
    /// `retrieval_empty`.
    pub max_empty_searches: usize,
}

impl RunLimits {
    /// Upper bound on caller-requested step budgets.
    pub const MAX_STEPS_CAP: usize = 24;

    #[must_use]
    pub fn effective_max_steps(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.max_steps)
            .clamp(2, Self::MAX_STEPS_CAP)
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_steps: 6,
            revision_steps: 2,
            max_revisions: 1,
            step_timeout: Duration::from_secs(30),
            provider_backoff: Duration::from_millis(250),
            search_limit: 8,
            observation_window: 4,
            max_empty_searches: 2,
        }
    }
}

/// Quality-gate tuning. Product-tunable, so thresholds and weights are
/// configuration rather than constants.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub acceptance_threshold: f64,
    /// Stricter bar for relation-style queries that must draw on several
    /// documents.
    pub relation_threshold: f64,
    pub alignment_weight: f64,
    pub citation_weight: f64,
    pub cross_document_weight: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.6,
            relation_threshold: 0.7,
            alignment_weight: 0.5,
            citation_weight: 0.3,
            cross_document_weight: 0.2,
        }
    }
}

/// Per-token rates used for the surfaced cost estimate.
#[derive(Debug, Clone)]
pub struct CostRates {
    pub prompt_usd_per_token: f64,
    pub completion_usd_per_token: f64,
}

impl Default for CostRates {
    fn default() -> Self {
        Self {
            prompt_usd_per_token: 0.000_000_3,
            completion_usd_per_token: 0.000_001_2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub limits: RunLimits,
    pub evaluator: EvaluatorConfig,
    pub cost: CostRates,
}
