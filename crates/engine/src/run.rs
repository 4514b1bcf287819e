use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use docreason_protocol::{
    CompleteEvent, ErrorCode, ErrorEvent, NodeRepository, PlanSource, PlannedAction, PlannedStep,
    QualityMetrics, ReasoningEvent, RunPhase, RunStatus, SearchScope, StepEvent, TokenUsage,
};
use docreason_store::{NewAnswer, NewStep, RunTermination, SqliteStore};

use crate::config::EngineConfig;
use crate::evaluator;
use crate::evidence::EvidencePool;
use crate::executor::ActionExecutor;
use crate::planner::{Planner, PlannerContext};

const MAX_EXPLORED_TITLES: usize = 8;
const FALLBACK_CITATION_CAP: usize = 4;

/// Terminal outcome of the synthesis/validation stage.
struct Verdict {
    accepted: bool,
    metrics: QualityMetrics,
    answer_markdown: String,
    citations: Vec<String>,
    confidence: f64,
}

/// Terminal failure with the event-facing error code.
struct Failure {
    code: ErrorCode,
    message: String,
}

fn internal_failure(err: impl std::fmt::Display) -> Failure {
    Failure {
        code: ErrorCode::ProviderError,
        message: err.to_string(),
    }
}

/// One run's coordinator: owns the phase state machine, step numbering,
/// budgets, persistence ordering, and event emission. Runs as a single tokio
/// task; all run state lives here, partitioned per run id.
pub(crate) struct RunWorker {
    pub run_id: String,
    pub query: String,
    pub scope: SearchScope,
    pub relation_query: bool,
    pub max_steps: usize,
    pub store: Arc<SqliteStore>,
    pub repo: Arc<dyn NodeRepository>,
    pub planner: Planner,
    pub config: EngineConfig,
    pub events: broadcast::Sender<ReasoningEvent>,
    pub cancel: Arc<AtomicBool>,

    pub step_count: usize,
    pub phase: RunPhase,
    pub evidence: EvidencePool,
    pub recent_observations: Vec<String>,
    pub explored_titles: Vec<String>,
    pub last_confidence: Option<f64>,
    pub self_check_done: bool,
    pub revision_gaps: Vec<String>,
    pub revisions_used: usize,
    pub searches_executed: usize,
    pub empty_searches: usize,
    pub provider_failures: usize,
    pub usage: TokenUsage,
    pub trace: Vec<Value>,
}

impl RunWorker {
    pub async fn execute(mut self) {
        let started = Instant::now();
        let outcome = self.drive().await;
        let total_latency_ms = started.elapsed().as_millis() as i64;
        match outcome {
            Ok(verdict) => self.finalize_verdict(verdict, total_latency_ms),
            Err(failure) => self.finalize_failure(failure, total_latency_ms),
        }
    }

    /// The phase state machine:
    /// `planning → retrieval → synthesis → validation → completed | failed`,
    /// with at most `max_revisions` loops from validation back to retrieval.
    async fn drive(&mut self) -> Result<Verdict, Failure> {
        // One slot is always reserved for the synthesize step, so the total
        // step count stays within the budget.
        let mut allowed_steps = self.max_steps;

        loop {
            while self.step_count + 1 < allowed_steps {
                self.ensure_live()?;
                let decision = self.planner.next_step(&self.context(allowed_steps)).await;
                self.usage.absorb(decision.usage);
                if decision.provider_failed {
                    self.provider_failures += 1;
                    tokio::time::sleep(self.config.limits.provider_backoff).await;
                }
                let planned = decision.step;
                self.trace.push(json!({
                    "step": self.step_count,
                    "kind": planned.kind().as_str(),
                    "objective": planned.objective.as_str(),
                    "source": planned.source.as_str(),
                }));

                match &planned.action {
                    PlannedAction::Synthesize | PlannedAction::Finish => break,
                    PlannedAction::SelfCheck => {
                        let step_started = Instant::now();
                        let confidence =
                            evaluator::evidence_confidence(&self.query, &self.evidence);
                        let observation = format!(
                            "Support check: {} evidence nodes across {} documents, confidence {confidence:.2}",
                            self.evidence.len(),
                            self.evidence.document_ids().len(),
                        );
                        let refs = self.evidence.ids();
                        let latency_ms = step_started.elapsed().as_millis() as i64;
                        self.record_step(&planned, &observation, refs, confidence, latency_ms)?;
                        self.self_check_done = true;
                        self.last_confidence = Some(confidence);
                    }
                    PlannedAction::Search { .. }
                    | PlannedAction::Inspect { .. }
                    | PlannedAction::ExpandNeighbors { .. } => {
                        self.ensure_live()?;
                        let step_started = Instant::now();
                        let executor = ActionExecutor {
                            repo: self.repo.as_ref(),
                            scope: &self.scope,
                            search_limit: self.config.limits.search_limit,
                            call_timeout: self.config.limits.step_timeout,
                        };
                        let outcome = executor.execute(&planned.action).await;
                        let latency_ms = step_started.elapsed().as_millis() as i64;

                        if matches!(planned.action, PlannedAction::Search { .. }) {
                            self.searches_executed += 1;
                            if outcome.result_count == 0 {
                                self.empty_searches += 1;
                            } else {
                                self.empty_searches = 0;
                            }
                        }

                        for item in &outcome.evidence {
                            if !item.title.is_empty()
                                && self.explored_titles.len() < MAX_EXPLORED_TITLES
                                && !self.explored_titles.contains(&item.title)
                            {
                                self.explored_titles.push(item.title.clone());
                            }
                        }
                        let refs = outcome.node_refs.clone();
                        let confidence = outcome.confidence;
                        self.record_step(
                            &planned,
                            &outcome.observation,
                            refs,
                            confidence,
                            latency_ms,
                        )?;
                        for item in outcome.evidence {
                            self.evidence.add(item);
                        }
                        self.last_confidence = Some(confidence);

                        // The run only advances out of planning once it has
                        // something to reason over.
                        if self.phase == RunPhase::Planning && !self.evidence.is_empty() {
                            self.advance_phase(RunPhase::Retrieval)?;
                        }

                        if self.evidence.is_empty()
                            && self.empty_searches >= self.config.limits.max_empty_searches
                        {
                            return Err(Failure {
                                code: ErrorCode::RetrievalEmpty,
                                message: "search never returned any evidence in scope".to_string(),
                            });
                        }
                    }
                }

                if planned.stop
                    && !self.evidence.is_empty()
                    && !matches!(
                        planned.action,
                        PlannedAction::Synthesize | PlannedAction::Finish
                    )
                {
                    break;
                }
            }

            if self.evidence.is_empty() {
                let code = if self.searches_executed == 0 {
                    ErrorCode::ProviderError
                } else {
                    ErrorCode::RetrievalEmpty
                };
                return Err(Failure {
                    code,
                    message: format!(
                        "no evidence collected within the step budget ({} provider failures)",
                        self.provider_failures
                    ),
                });
            }

            // Synthesis: one provider call over the citation-tagged evidence.
            self.ensure_live()?;
            self.advance_phase(RunPhase::Synthesis)?;
            let step_started = Instant::now();
            let synthesis = self
                .planner
                .synthesize(&self.query, &self.evidence.snippets(), &self.revision_gaps)
                .await;
            self.usage.absorb(synthesis.usage);
            // A cancellation that landed while the call was in flight
            // discards the draft.
            self.ensure_live()?;
            let latency_ms = step_started.elapsed().as_millis() as i64;
            let draft = synthesis.draft;
            let citations = match synthesis.source {
                PlanSource::Model => self.normalize_citations(&draft.citations),
                // The insufficient-evidence answer deliberately cites nothing.
                PlanSource::Fallback => Vec::new(),
            };
            self.trace.push(json!({
                "step": self.step_count,
                "kind": "synthesize",
                "source": synthesis.source.as_str(),
            }));
            let planned = PlannedStep {
                action: PlannedAction::Synthesize,
                objective: "Synthesize a grounded answer from the evidence".to_string(),
                reasoning: String::new(),
                stop: false,
                source: synthesis.source,
            };
            let observation = format!(
                "Generated answer draft with {} citation(s)",
                citations.len()
            );
            self.record_step(
                &planned,
                &observation,
                citations.clone(),
                draft.confidence,
                latency_ms,
            )?;
            self.last_confidence = Some(draft.confidence);

            // Validation: deterministic quality gate.
            self.advance_phase(RunPhase::Validation)?;
            let metrics = evaluator::evaluate(
                &self.query,
                &draft.answer_markdown,
                &citations,
                &self.evidence,
                &self.config.evaluator,
            );
            let threshold = if self.relation_query {
                self.config.evaluator.relation_threshold
            } else {
                self.config.evaluator.acceptance_threshold
            };

            if !metrics.grounding_failure && metrics.composite >= threshold {
                return Ok(Verdict {
                    accepted: true,
                    metrics,
                    answer_markdown: draft.answer_markdown,
                    citations,
                    confidence: draft.confidence,
                });
            }

            if self.revisions_used < self.config.limits.max_revisions {
                self.revisions_used += 1;
                self.revision_gaps =
                    evaluator::describe_gaps(&self.query, &draft.answer_markdown, &metrics);
                self.self_check_done = false;
                // The revision grant covers its own synthesize step, so the
                // run never exceeds max_steps + revision_steps per loop.
                allowed_steps = self.step_count + self.config.limits.revision_steps;
                log::info!(
                    "run {}: answer below threshold ({:.2} < {threshold:.2}), revising",
                    self.run_id,
                    metrics.composite
                );
                self.advance_phase(RunPhase::Retrieval)?;
                continue;
            }

            return Ok(Verdict {
                accepted: false,
                metrics,
                answer_markdown: draft.answer_markdown,
                citations,
                confidence: draft.confidence,
            });
        }
    }

    fn context(&self, allowed_steps: usize) -> PlannerContext {
        let window = self.config.limits.observation_window;
        let recent = self
            .recent_observations
            .iter()
            .rev()
            .take(window)
            .rev()
            .cloned()
            .collect();
        PlannerContext {
            query: self.query.clone(),
            phase: self.phase,
            step_index: self.step_count,
            max_steps: allowed_steps,
            has_evidence: !self.evidence.is_empty(),
            evidence_count: self.evidence.len(),
            last_confidence: self.last_confidence,
            self_check_done: self.self_check_done,
            recent_observations: recent,
            explored_titles: self.explored_titles.clone(),
            revision_gaps: self.revision_gaps.clone(),
        }
    }

    fn ensure_live(&self) -> Result<(), Failure> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(Failure {
                code: ErrorCode::Cancelled,
                message: "run cancelled".to_string(),
            });
        }
        Ok(())
    }

    /// Durable write first, event second: a consumer that misses the event
    /// can always reconstruct the run by reading the store.
    fn record_step(
        &mut self,
        planned: &PlannedStep,
        observation: &str,
        node_refs: Vec<String>,
        confidence: f64,
        latency_ms: i64,
    ) -> Result<(), Failure> {
        let idx = self.step_count as i64;
        let params = planned.action.params_json();
        self.store
            .append_step(NewStep {
                run_id: &self.run_id,
                idx,
                kind: planned.kind(),
                objective: &planned.objective,
                reasoning: &planned.reasoning,
                params: &params,
                observation,
                node_refs: &node_refs,
                confidence,
                latency_ms,
            })
            .map_err(internal_failure)?;
        self.step_count += 1;
        self.recent_observations.push(observation.to_string());

        self.publish(ReasoningEvent::Step(StepEvent {
            run_id: self.run_id.clone(),
            step_index: idx,
            kind: planned.kind(),
            objective: planned.objective.clone(),
            reasoning: planned.reasoning.clone(),
            action: params,
            observation: observation.to_string(),
            node_refs,
            confidence,
            latency_ms,
        }));
        Ok(())
    }

    fn advance_phase(&mut self, phase: RunPhase) -> Result<(), Failure> {
        if self.phase == phase {
            return Ok(());
        }
        self.store
            .set_phase(&self.run_id, phase)
            .map_err(internal_failure)?;
        self.phase = phase;
        Ok(())
    }

    /// Keep only citations that resolve to observed evidence. A model answer
    /// whose citations all failed validation falls back to the strongest
    /// evidence ids rather than surfacing bogus references.
    fn normalize_citations(&self, raw: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let valid: Vec<String> = raw
            .iter()
            .filter(|citation| self.evidence.contains(citation))
            .filter(|citation| seen.insert(citation.as_str()))
            .cloned()
            .collect();
        if valid.is_empty() {
            self.evidence
                .ids()
                .into_iter()
                .take(FALLBACK_CITATION_CAP)
                .collect()
        } else {
            valid
        }
    }

    fn token_usage_json(&self) -> Value {
        json!({
            "prompt_tokens": self.usage.prompt_tokens,
            "completion_tokens": self.usage.completion_tokens,
            "total_tokens": self.usage.total(),
        })
    }

    fn cost_usd(&self) -> f64 {
        self.usage.prompt_tokens as f64 * self.config.cost.prompt_usd_per_token
            + self.usage.completion_tokens as f64 * self.config.cost.completion_usd_per_token
    }

    fn finalize_verdict(&mut self, verdict: Verdict, total_latency_ms: i64) {
        let (status, final_confidence, grounded) = if verdict.accepted {
            (
                RunStatus::Completed,
                verdict.confidence.max(verdict.metrics.composite),
                true,
            )
        } else {
            // Best-effort answer, explicitly ungrounded: never a disguised
            // success.
            (RunStatus::Failed, verdict.confidence.min(0.4), false)
        };
        let termination = RunTermination {
            status,
            phase: RunPhase::Completed,
            total_latency_ms,
            token_usage: self.token_usage_json(),
            cost_usd: self.cost_usd(),
            quality: Some(verdict.metrics),
            planner_trace: Value::Array(std::mem::take(&mut self.trace)),
            answer: Some(NewAnswer {
                answer_markdown: &verdict.answer_markdown,
                citations: &verdict.citations,
                confidence: final_confidence,
                grounded,
                quality: Some(verdict.metrics),
            }),
        };
        if let Err(err) = self.store.finish_run(&self.run_id, termination) {
            log::error!("run {}: terminal write failed: {err}", self.run_id);
            self.publish(ReasoningEvent::Error(ErrorEvent {
                run_id: self.run_id.clone(),
                code: ErrorCode::ProviderError,
                message: err.to_string(),
                retryable: false,
            }));
            return;
        }

        if verdict.accepted {
            self.publish(ReasoningEvent::Complete(CompleteEvent {
                run_id: self.run_id.clone(),
                answer_id: self.run_id.clone(),
                final_confidence,
                quality_score: verdict.metrics.composite,
                total_latency_ms,
                token_usage: self.token_usage_json(),
                cost_usd: self.cost_usd(),
            }));
        } else {
            self.publish(ReasoningEvent::Error(ErrorEvent {
                run_id: self.run_id.clone(),
                code: ErrorCode::QualityRejected,
                message: format!(
                    "answer quality {:.2} below threshold after revision",
                    verdict.metrics.composite
                ),
                retryable: ErrorCode::QualityRejected.retryable(),
            }));
        }
    }

    fn finalize_failure(&mut self, failure: Failure, total_latency_ms: i64) {
        let termination = RunTermination {
            status: RunStatus::Failed,
            phase: RunPhase::Failed,
            total_latency_ms,
            token_usage: self.token_usage_json(),
            cost_usd: self.cost_usd(),
            quality: None,
            planner_trace: Value::Array(std::mem::take(&mut self.trace)),
            answer: None,
        };
        if let Err(err) = self.store.finish_run(&self.run_id, termination) {
            log::error!("run {}: terminal write failed: {err}", self.run_id);
        }
        log::warn!(
            "run {} failed: {} ({})",
            self.run_id,
            failure.message,
            failure.code.as_str()
        );
        self.publish(ReasoningEvent::Error(ErrorEvent {
            run_id: self.run_id.clone(),
            code: failure.code,
            message: failure.message,
            retryable: failure.code.retryable(),
        }));
    }

    fn publish(&self, event: ReasoningEvent) {
        // Fire-and-forget: no subscribers is not an error.
        let _ = self.events.send(event);
    }
}
