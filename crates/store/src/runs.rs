use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use docreason_protocol::{
    AnswerRecord, QualityMetrics, ReasoningRun, ReasoningStep, RunPhase, RunSnapshot, RunStatus,
    StepKind,
};

use crate::error::{Result, StoreError};
use crate::SqliteStore;

#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub id: &'a str,
    pub project_id: &'a str,
    pub focus_document_id: Option<&'a str>,
    pub query: &'a str,
}

#[derive(Debug, Clone)]
pub struct NewStep<'a> {
    pub run_id: &'a str,
    pub idx: i64,
    pub kind: StepKind,
    pub objective: &'a str,
    pub reasoning: &'a str,
    pub params: &'a Value,
    pub observation: &'a str,
    pub node_refs: &'a [String],
    pub confidence: f64,
    pub latency_ms: i64,
}

#[derive(Debug, Clone)]
pub struct NewAnswer<'a> {
    pub answer_markdown: &'a str,
    pub citations: &'a [String],
    pub confidence: f64,
    pub grounded: bool,
    pub quality: Option<QualityMetrics>,
}

/// Terminal write for a run: run columns and the optional answer commit in
/// one transaction, so consumers never observe a finished run without its
/// answer.
#[derive(Debug, Clone)]
pub struct RunTermination<'a> {
    pub status: RunStatus,
    pub phase: RunPhase,
    pub total_latency_ms: i64,
    pub token_usage: Value,
    pub cost_usd: f64,
    pub quality: Option<QualityMetrics>,
    pub planner_trace: Value,
    pub answer: Option<NewAnswer<'a>>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| StoreError::InvalidInput(format!("invalid timestamp {raw}: {err}")))
}

fn quality_to_json(quality: Option<QualityMetrics>) -> Result<Option<String>> {
    quality
        .map(|value| serde_json::to_string(&value).map_err(StoreError::from))
        .transpose()
}

impl SqliteStore {
    /// Insert a fresh run row in `planning`/`running` state.
    pub fn create_run(&self, run: NewRun<'_>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO runs (id, project_id, focus_document_id, query, phase, status, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                run.id,
                run.project_id,
                run.focus_document_id,
                run.query,
                RunPhase::Planning.as_str(),
                RunStatus::Running.as_str(),
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Advance the phase of a still-running run. Closed runs are immutable.
    pub fn set_phase(&self, run_id: &str, phase: RunPhase) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE runs SET phase = ?2 WHERE id = ?1 AND status = 'running'",
            params![run_id, phase.as_str()],
        )?;
        if changed == 0 {
            return Err(self.run_write_rejected(&conn, run_id));
        }
        Ok(())
    }

    /// Append the next step of a run. The index must equal the current step
    /// count; anything else means the caller lost ordering and is rejected.
    pub fn append_step(&self, step: NewStep<'_>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let expected: i64 = tx.query_row(
            "SELECT COUNT(*) FROM steps WHERE run_id = ?1",
            params![step.run_id],
            |row| row.get(0),
        )?;
        if expected != step.idx {
            return Err(StoreError::StepIndexGap {
                run_id: step.run_id.to_string(),
                expected,
                got: step.idx,
            });
        }
        tx.execute(
            r#"
            INSERT INTO steps (
              run_id, idx, kind, objective, reasoning, params_json,
              observation, node_refs_json, confidence, latency_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                step.run_id,
                step.idx,
                step.kind.as_str(),
                step.objective,
                step.reasoning,
                step.params.to_string(),
                step.observation,
                serde_json::to_string(step.node_refs)?,
                step.confidence,
                step.latency_ms,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Close a run. The run row and the optional answer are committed
    /// atomically; a second close attempt fails with `RunClosed`.
    pub fn finish_run(&self, run_id: &str, termination: RunTermination<'_>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            r#"
            UPDATE runs
            SET phase = ?2,
                status = ?3,
                ended_at = ?4,
                total_latency_ms = ?5,
                token_usage_json = ?6,
                cost_usd = ?7,
                quality_json = ?8,
                planner_trace_json = ?9
            WHERE id = ?1 AND status = 'running'
            "#,
            params![
                run_id,
                termination.phase.as_str(),
                termination.status.as_str(),
                now_rfc3339(),
                termination.total_latency_ms,
                termination.token_usage.to_string(),
                termination.cost_usd,
                quality_to_json(termination.quality)?,
                termination.planner_trace.to_string(),
            ],
        )?;
        if changed == 0 {
            drop(tx);
            return Err(self.run_write_rejected(&conn, run_id));
        }
        if let Some(answer) = &termination.answer {
            tx.execute(
                r#"
                INSERT OR REPLACE INTO answers (
                  run_id, answer_markdown, citations_json, confidence, grounded, quality_json
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    run_id,
                    answer.answer_markdown,
                    serde_json::to_string(answer.citations)?,
                    answer.confidence,
                    answer.grounded as i64,
                    quality_to_json(answer.quality)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Snapshot read of a run, its steps in index order, and the answer if
    /// one was persisted.
    pub fn get_run(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        let conn = self.lock();
        let run = conn
            .query_row(
                r#"
                SELECT id, project_id, focus_document_id, query, phase, status,
                       started_at, ended_at, total_latency_ms, token_usage_json,
                       cost_usd, quality_json, planner_trace_json
                FROM runs WHERE id = ?1
                "#,
                params![run_id],
                map_run,
            )
            .optional()?;
        let Some(run) = run else {
            return Ok(None);
        };
        let run = finish_run_row(run)?;

        let mut statement = conn.prepare(
            r#"
            SELECT run_id, idx, kind, objective, reasoning, params_json,
                   observation, node_refs_json, confidence, latency_ms
            FROM steps WHERE run_id = ?1 ORDER BY idx ASC
            "#,
        )?;
        let steps = statement
            .query_map(params![run_id], map_step)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let answer = conn
            .query_row(
                r#"
                SELECT run_id, answer_markdown, citations_json, confidence, grounded, quality_json
                FROM answers WHERE run_id = ?1
                "#,
                params![run_id],
                map_answer,
            )
            .optional()?;

        Ok(Some(RunSnapshot { run, steps, answer }))
    }

    fn run_write_rejected(
        &self,
        conn: &std::sync::MutexGuard<'_, rusqlite::Connection>,
        run_id: &str,
    ) -> StoreError {
        let exists = conn
            .query_row(
                "SELECT 1 FROM runs WHERE id = ?1",
                params![run_id],
                |_row| Ok(()),
            )
            .optional()
            .unwrap_or(None)
            .is_some();
        if exists {
            StoreError::RunClosed(run_id.to_string())
        } else {
            StoreError::RunNotFound(run_id.to_string())
        }
    }
}

/// Run columns as stored, before timestamp parsing (which can fail outside
/// the rusqlite mapping closure).
struct RawRun {
    id: String,
    project_id: String,
    focus_document_id: Option<String>,
    query: String,
    phase: String,
    status: String,
    started_at: String,
    ended_at: Option<String>,
    total_latency_ms: Option<i64>,
    token_usage_json: String,
    cost_usd: f64,
    quality_json: Option<String>,
    planner_trace_json: String,
}

fn map_run(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        focus_document_id: row.get("focus_document_id")?,
        query: row.get("query")?,
        phase: row.get("phase")?,
        status: row.get("status")?,
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
        total_latency_ms: row.get("total_latency_ms")?,
        token_usage_json: row.get("token_usage_json")?,
        cost_usd: row.get("cost_usd")?,
        quality_json: row.get("quality_json")?,
        planner_trace_json: row.get("planner_trace_json")?,
    })
}

fn finish_run_row(raw: RawRun) -> Result<ReasoningRun> {
    Ok(ReasoningRun {
        started_at: parse_timestamp(&raw.started_at)?,
        ended_at: raw.ended_at.as_deref().map(parse_timestamp).transpose()?,
        id: raw.id,
        project_id: raw.project_id,
        focus_document_id: raw.focus_document_id,
        query: raw.query,
        phase: RunPhase::parse(&raw.phase).unwrap_or(RunPhase::Failed),
        status: RunStatus::parse(&raw.status).unwrap_or(RunStatus::Failed),
        total_latency_ms: raw.total_latency_ms,
        token_usage: serde_json::from_str(&raw.token_usage_json)
            .unwrap_or_else(|_| serde_json::json!({})),
        cost_usd: raw.cost_usd,
        quality: raw
            .quality_json
            .and_then(|quality| serde_json::from_str(&quality).ok()),
        planner_trace: serde_json::from_str(&raw.planner_trace_json)
            .unwrap_or_else(|_| serde_json::json!([])),
    })
}

fn map_step(row: &Row<'_>) -> rusqlite::Result<ReasoningStep> {
    let kind_raw: String = row.get("kind")?;
    let params_raw: String = row.get("params_json")?;
    let node_refs_raw: String = row.get("node_refs_json")?;
    Ok(ReasoningStep {
        run_id: row.get("run_id")?,
        idx: row.get("idx")?,
        kind: StepKind::parse(&kind_raw).unwrap_or(StepKind::Finish),
        objective: row.get("objective")?,
        reasoning: row.get("reasoning")?,
        params: serde_json::from_str(&params_raw).unwrap_or_else(|_| serde_json::json!({})),
        observation: row.get("observation")?,
        node_refs: serde_json::from_str(&node_refs_raw).unwrap_or_default(),
        confidence: row.get("confidence")?,
        latency_ms: row.get("latency_ms")?,
    })
}

fn map_answer(row: &Row<'_>) -> rusqlite::Result<AnswerRecord> {
    let citations_raw: String = row.get("citations_json")?;
    let quality_raw: Option<String> = row.get("quality_json")?;
    Ok(AnswerRecord {
        run_id: row.get("run_id")?,
        answer_markdown: row.get("answer_markdown")?,
        citations: serde_json::from_str(&citations_raw).unwrap_or_default(),
        confidence: row.get("confidence")?,
        grounded: row.get::<_, i64>("grounded")? != 0,
        quality: quality_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store_with_run(run_id: &str) -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("open store");
        store
            .create_run(NewRun {
                id: run_id,
                project_id: "proj-1",
                focus_document_id: None,
                query: "what is the revenue growth?",
            })
            .expect("create run");
        store
    }

    fn step(run_id: &str, idx: i64) -> NewStep<'_> {
        NewStep {
            run_id,
            idx,
            kind: StepKind::Search,
            objective: "find evidence",
            reasoning: "",
            params: &Value::Null,
            observation: "Search returned 2 nodes",
            node_refs: &[],
            confidence: 0.45,
            latency_ms: 3,
        }
    }

    #[test]
    fn steps_must_be_appended_contiguously() {
        let store = store_with_run("run-1");
        let params = json!({"query": "revenue"});
        store
            .append_step(NewStep {
                params: &params,
                ..step("run-1", 0)
            })
            .expect("first step");

        let err = store
            .append_step(NewStep {
                params: &params,
                ..step("run-1", 2)
            })
            .expect_err("gap must be rejected");
        assert!(matches!(
            err,
            StoreError::StepIndexGap {
                expected: 1,
                got: 2,
                ..
            }
        ));
    }

    #[test]
    fn finish_run_persists_answer_atomically_and_freezes_the_run() {
        let store = store_with_run("run-2");
        let citations = vec!["n-1".to_string()];
        store
            .finish_run(
                "run-2",
                RunTermination {
                    status: RunStatus::Completed,
                    phase: RunPhase::Completed,
                    total_latency_ms: 120,
                    token_usage: json!({"prompt_tokens": 10, "completion_tokens": 4}),
                    cost_usd: 0.0001,
                    quality: Some(QualityMetrics {
                        composite: 0.8,
                        query_alignment: 0.9,
                        citation_coverage: 0.7,
                        cross_document_coverage: 1.0,
                        grounding_failure: false,
                    }),
                    planner_trace: json!([{"kind": "search"}]),
                    answer: Some(NewAnswer {
                        answer_markdown: "Revenue grew 15%.",
                        citations: &citations,
                        confidence: 0.8,
                        grounded: true,
                        quality: None,
                    }),
                },
            )
            .expect("finish run");

        let snapshot = store.get_run("run-2").expect("get run").expect("exists");
        assert_eq!(snapshot.run.status, RunStatus::Completed);
        assert_eq!(snapshot.run.phase, RunPhase::Completed);
        let answer = snapshot.answer.expect("answer persisted");
        assert!(answer.grounded);
        assert_eq!(answer.citations, citations);

        // Closed runs reject further mutation.
        let err = store
            .set_phase("run-2", RunPhase::Retrieval)
            .expect_err("closed run is immutable");
        assert!(matches!(err, StoreError::RunClosed(_)));
    }

    #[test]
    fn get_run_is_idempotent_after_completion() {
        let store = store_with_run("run-3");
        let params = json!({"query": "growth"});
        for idx in 0..3 {
            store
                .append_step(NewStep {
                    params: &params,
                    ..step("run-3", idx)
                })
                .expect("append step");
        }
        store
            .finish_run(
                "run-3",
                RunTermination {
                    status: RunStatus::Failed,
                    phase: RunPhase::Failed,
                    total_latency_ms: 50,
                    token_usage: json!({}),
                    cost_usd: 0.0,
                    quality: None,
                    planner_trace: json!([]),
                    answer: None,
                },
            )
            .expect("finish run");

        let first = store.get_run("run-3").expect("get run").expect("exists");
        let second = store.get_run("run-3").expect("get run").expect("exists");
        assert_eq!(
            serde_json::to_value(&first).expect("serialize"),
            serde_json::to_value(&second).expect("serialize"),
        );
        assert_eq!(first.steps.len(), 3);
        assert!(first.answer.is_none());
    }

    #[test]
    fn missing_run_reads_as_none() {
        let store = SqliteStore::open_in_memory().expect("open store");
        assert!(store.get_run("nope").expect("query ok").is_none());
    }

    #[test]
    fn runs_survive_reopening_the_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runs.db");
        {
            let store = SqliteStore::open(&path).expect("open store");
            store
                .create_run(NewRun {
                    id: "run-persist",
                    project_id: "proj-1",
                    focus_document_id: Some("doc-a"),
                    query: "what changed?",
                })
                .expect("create run");
        }

        let store = SqliteStore::open(&path).expect("reopen store");
        let snapshot = store
            .get_run("run-persist")
            .expect("get run")
            .expect("survives reopen");
        assert_eq!(snapshot.run.status, RunStatus::Running);
        assert_eq!(snapshot.run.focus_document_id.as_deref(), Some("doc-a"));
    }
}
