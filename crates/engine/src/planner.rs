use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;

use docreason_protocol::{
    CompletionRequest, ModelProvider, NeighborDirection, PlanSource, PlannedAction, PlannedStep,
    RunPhase, StepKind, TokenUsage,
};

use crate::prompts::{planner_prompt, synthesis_prompt};

const PLAN_TEMPERATURE: f32 = 0.1;
const SYNTHESIS_TEMPERATURE: f32 = 0.2;

/// Below this confidence the fallback ladder inserts a `self_check` before
/// concluding.
const LOW_CONFIDENCE: f64 = 0.6;

/// Bounded view of run state handed to the planner for each decision.
#[derive(Debug, Clone)]
pub(crate) struct PlannerContext {
    pub query: String,
    pub phase: RunPhase,
    pub step_index: usize,
    pub max_steps: usize,
    pub has_evidence: bool,
    pub evidence_count: usize,
    pub last_confidence: Option<f64>,
    pub self_check_done: bool,
    pub recent_observations: Vec<String>,
    pub explored_titles: Vec<String>,
    pub revision_gaps: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct PlanDecision {
    pub step: PlannedStep,
    pub usage: TokenUsage,
    pub provider_failed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SynthesisDraft {
    pub answer_markdown: String,
    pub citations: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug)]
pub(crate) struct SynthesisOutcome {
    pub draft: SynthesisDraft,
    pub usage: TokenUsage,
    pub source: PlanSource,
}

/// Turns run state into the next validated step. Never fails: every provider
/// or parsing problem degrades to the deterministic fallback ladder.
pub(crate) struct Planner {
    provider: Arc<dyn ModelProvider>,
    step_timeout: Duration,
}

impl Planner {
    pub fn new(provider: Arc<dyn ModelProvider>, step_timeout: Duration) -> Self {
        Self {
            provider,
            step_timeout,
        }
    }

    pub async fn next_step(&self, ctx: &PlannerContext) -> PlanDecision {
        let request = CompletionRequest {
            prompt: planner_prompt(ctx),
            temperature: PLAN_TEMPERATURE,
        };
        match timeout(self.step_timeout, self.provider.complete(request)).await {
            Ok(Ok(response)) => match parse_planned_step(&response.text, ctx) {
                Some(step) => PlanDecision {
                    step,
                    usage: response.usage,
                    provider_failed: false,
                },
                None => {
                    log::debug!("planner output rejected, falling back");
                    PlanDecision {
                        step: fallback_step(ctx),
                        usage: response.usage,
                        provider_failed: false,
                    }
                }
            },
            Ok(Err(err)) => {
                log::warn!("planner provider call failed: {err}");
                PlanDecision {
                    step: fallback_step(ctx),
                    usage: TokenUsage::default(),
                    provider_failed: true,
                }
            }
            Err(_) => {
                log::warn!(
                    "planner provider call exceeded {:?}, falling back",
                    self.step_timeout
                );
                PlanDecision {
                    step: fallback_step(ctx),
                    usage: TokenUsage::default(),
                    provider_failed: true,
                }
            }
        }
    }

    /// One provider call producing the answer draft. Malformed output or a
    /// dead provider yields the minimal insufficient-evidence draft instead
    /// of an error.
    pub async fn synthesize(
        &self,
        query: &str,
        evidence: &[String],
        gaps: &[String],
    ) -> SynthesisOutcome {
        let request = CompletionRequest {
            prompt: synthesis_prompt(query, evidence, gaps),
            temperature: SYNTHESIS_TEMPERATURE,
        };
        match timeout(self.step_timeout, self.provider.complete(request)).await {
            Ok(Ok(response)) => match parse_synthesis(&response.text) {
                Some(draft) => SynthesisOutcome {
                    draft,
                    usage: response.usage,
                    source: PlanSource::Model,
                },
                None => {
                    log::debug!("synthesis output rejected, using insufficient-evidence answer");
                    SynthesisOutcome {
                        draft: insufficient_evidence_draft(),
                        usage: response.usage,
                        source: PlanSource::Fallback,
                    }
                }
            },
            Ok(Err(err)) => {
                log::warn!("synthesis provider call failed: {err}");
                SynthesisOutcome {
                    draft: insufficient_evidence_draft(),
                    usage: TokenUsage::default(),
                    source: PlanSource::Fallback,
                }
            }
            Err(_) => {
                log::warn!("synthesis provider call timed out");
                SynthesisOutcome {
                    draft: insufficient_evidence_draft(),
                    usage: TokenUsage::default(),
                    source: PlanSource::Fallback,
                }
            }
        }
    }
}

/// Validate untrusted model output into a closed `PlannedStep`.
///
/// Anything off-contract returns `None`: unknown kinds, missing params,
/// `finish`/`synthesize` before any evidence exists. There is no partial
/// acceptance.
pub(crate) fn parse_planned_step(raw: &str, ctx: &PlannerContext) -> Option<PlannedStep> {
    let value: Value = serde_json::from_str(strip_code_fence(raw)).ok()?;
    let kind = StepKind::parse(value.get("kind")?.as_str()?)?;
    let objective = value.get("objective")?.as_str()?.trim().to_string();
    if objective.is_empty() {
        return None;
    }
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let stop = value.get("stop").and_then(Value::as_bool).unwrap_or(false);
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    let action = match kind {
        StepKind::Search => {
            let query = params.get("query")?.as_str()?.trim().to_string();
            if query.is_empty() {
                return None;
            }
            PlannedAction::Search { query }
        }
        StepKind::Inspect => {
            let node_id = params.get("node_id")?.as_str()?.trim().to_string();
            if node_id.is_empty() {
                return None;
            }
            PlannedAction::Inspect { node_id }
        }
        StepKind::ExpandNeighbors => {
            let node_id = params.get("node_id")?.as_str()?.trim().to_string();
            let direction = NeighborDirection::parse(params.get("direction")?.as_str()?)?;
            if node_id.is_empty() {
                return None;
            }
            PlannedAction::ExpandNeighbors { node_id, direction }
        }
        StepKind::Synthesize => {
            if !ctx.has_evidence {
                return None;
            }
            PlannedAction::Synthesize
        }
        StepKind::SelfCheck => PlannedAction::SelfCheck,
        StepKind::Finish => {
            // No-evidence termination is never accepted from the model.
            if ctx.step_index == 0 || !ctx.has_evidence {
                return None;
            }
            PlannedAction::Finish
        }
    };

    Some(PlannedStep {
        action,
        objective,
        reasoning,
        stop,
        source: PlanSource::Model,
    })
}

/// Deterministic plan when the model is unusable: gather evidence first,
/// check support once confidence is low, then conclude. Total by
/// construction; never proposes `finish` before evidence exists.
pub(crate) fn fallback_step(ctx: &PlannerContext) -> PlannedStep {
    if !ctx.has_evidence {
        return PlannedStep {
            action: PlannedAction::Search {
                query: ctx.query.clone(),
            },
            objective: "Find evidence nodes matching the query".to_string(),
            reasoning: "No evidence collected yet".to_string(),
            stop: false,
            source: PlanSource::Fallback,
        };
    }
    if ctx.last_confidence.unwrap_or(0.0) < LOW_CONFIDENCE && !ctx.self_check_done {
        return PlannedStep {
            action: PlannedAction::SelfCheck,
            objective: "Check whether the collected evidence supports an answer".to_string(),
            reasoning: "Confidence is low and support has not been verified".to_string(),
            stop: false,
            source: PlanSource::Fallback,
        };
    }
    PlannedStep {
        action: PlannedAction::Finish,
        objective: "Conclude with the collected evidence".to_string(),
        reasoning: "Evidence collected and checked".to_string(),
        stop: true,
        source: PlanSource::Fallback,
    }
}

pub(crate) fn parse_synthesis(raw: &str) -> Option<SynthesisDraft> {
    let value: Value = serde_json::from_str(strip_code_fence(raw)).ok()?;
    let answer_markdown = value
        .get("answer_markdown")?
        .as_str()?
        .trim()
        .to_string();
    if answer_markdown.is_empty() {
        return None;
    }
    let citations = value
        .get("citations")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);
    Some(SynthesisDraft {
        answer_markdown,
        citations,
        confidence,
    })
}

pub(crate) fn insufficient_evidence_draft() -> SynthesisDraft {
    SynthesisDraft {
        answer_markdown:
            "I could not produce a grounded answer from the available evidence.".to_string(),
        citations: Vec::new(),
        confidence: 0.2,
    }
}

/// Models occasionally wrap JSON in a markdown fence even when asked not to.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx(step_index: usize, has_evidence: bool) -> PlannerContext {
        PlannerContext {
            query: "what was the revenue growth?".to_string(),
            phase: RunPhase::Retrieval,
            step_index,
            max_steps: 6,
            has_evidence,
            evidence_count: usize::from(has_evidence),
            last_confidence: None,
            self_check_done: false,
            recent_observations: Vec::new(),
            explored_titles: Vec::new(),
            revision_gaps: Vec::new(),
        }
    }

    #[test]
    fn parses_a_valid_search_step() {
        let raw = r#"{"kind":"search","objective":"find revenue","reasoning":"start broad","params":{"query":"revenue growth"},"stop":false}"#;
        let step = parse_planned_step(raw, &ctx(0, false)).expect("valid step");
        assert_eq!(
            step.action,
            PlannedAction::Search {
                query: "revenue growth".to_string()
            }
        );
        assert_eq!(step.source, PlanSource::Model);
    }

    #[test]
    fn rejects_unknown_kinds_and_malformed_json() {
        assert!(parse_planned_step("not json at all", &ctx(0, false)).is_none());
        assert!(parse_planned_step(
            r#"{"kind":"teleport","objective":"x","params":{}}"#,
            &ctx(0, false)
        )
        .is_none());
        assert!(parse_planned_step(
            r#"{"kind":"search","objective":"x","params":{}}"#,
            &ctx(0, false)
        )
        .is_none());
    }

    #[test]
    fn rejects_finish_before_any_observation() {
        let raw = r#"{"kind":"finish","objective":"done","params":{}}"#;
        assert!(parse_planned_step(raw, &ctx(0, false)).is_none());
        assert!(parse_planned_step(raw, &ctx(0, true)).is_none());
        assert!(parse_planned_step(raw, &ctx(3, true)).is_some());
    }

    #[test]
    fn rejects_expand_with_invalid_direction() {
        let raw = r#"{"kind":"expand_neighbors","objective":"widen","params":{"node_id":"n-1","direction":"sideways"}}"#;
        assert!(parse_planned_step(raw, &ctx(1, true)).is_none());
    }

    #[test]
    fn accepts_fenced_json() {
        let raw = "```json\n{\"kind\":\"self_check\",\"objective\":\"verify\",\"params\":{}}\n```";
        let step = parse_planned_step(raw, &ctx(2, true)).expect("valid step");
        assert_eq!(step.action, PlannedAction::SelfCheck);
    }

    #[test]
    fn fallback_ladder_searches_then_checks_then_finishes() {
        let no_evidence = ctx(0, false);
        assert!(matches!(
            fallback_step(&no_evidence).action,
            PlannedAction::Search { .. }
        ));

        let mut low_confidence = ctx(2, true);
        low_confidence.last_confidence = Some(0.4);
        assert_eq!(fallback_step(&low_confidence).action, PlannedAction::SelfCheck);

        let mut checked = ctx(3, true);
        checked.last_confidence = Some(0.4);
        checked.self_check_done = true;
        assert_eq!(fallback_step(&checked).action, PlannedAction::Finish);

        let mut confident = ctx(3, true);
        confident.last_confidence = Some(0.8);
        assert_eq!(fallback_step(&confident).action, PlannedAction::Finish);
    }

    #[test]
    fn synthesis_parsing_degrades_to_insufficient_evidence() {
        let valid = r#"{"answer_markdown":"Revenue grew 15%.","confidence":0.8,"citations":["n-1"]}"#;
        let draft = parse_synthesis(valid).expect("valid draft");
        assert_eq!(draft.citations, vec!["n-1".to_string()]);

        assert!(parse_synthesis("garbage").is_none());
        assert!(parse_synthesis(r#"{"answer_markdown":""}"#).is_none());

        let fallback = insufficient_evidence_draft();
        assert!(fallback.citations.is_empty());
    }
}
