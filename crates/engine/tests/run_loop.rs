//! End-to-end runs through the coordinator state machine with a scripted
//! provider and an in-memory SQLite store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use docreason_engine::{Engine, EngineConfig, RunRequest};
use docreason_protocol::{
    CompletionRequest, ErrorCode, ModelProvider, ModelResponse, NodeType, ProviderError,
    ReasoningEvent, RunPhase, RunSnapshot, RunStatus, StepKind, TokenUsage,
};
use docreason_provider::ScriptedProvider;
use docreason_store::{NewDocument, NewNode, SqliteStore};

fn seeded_store() -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().expect("open store");
    store
        .insert_document(NewDocument {
            id: "doc-a",
            project_id: "proj-1",
            name: "Annual Report",
        })
        .expect("insert document");
    store
        .insert_nodes(
            "doc-a",
            &[
                NewNode {
                    id: "sec-1",
                    parent_id: None,
                    node_type: NodeType::Section,
                    title: "Financial Results",
                    text: "Overview of the fiscal year.",
                    ordinal_path: "1",
                },
                NewNode {
                    id: "n-rev",
                    parent_id: Some("sec-1"),
                    node_type: NodeType::Paragraph,
                    title: "Revenue",
                    text: "Revenue grew 15% year-over-year.",
                    ordinal_path: "1.1",
                },
                NewNode {
                    id: "n-cost",
                    parent_id: Some("sec-1"),
                    node_type: NodeType::Paragraph,
                    title: "Costs",
                    text: "Costs were flat compared to last year.",
                    ordinal_path: "1.2",
                },
            ],
        )
        .expect("insert nodes");
    Arc::new(store)
}

fn engine_with(store: Arc<SqliteStore>, provider: Arc<dyn ModelProvider>) -> Engine {
    Engine::new(
        Arc::clone(&store),
        store,
        provider,
        EngineConfig::default(),
    )
}

/// Drain the event stream until the given run reaches a terminal event.
async fn wait_for_terminal(
    receiver: &mut tokio::sync::broadcast::Receiver<ReasoningEvent>,
    run_id: &str,
) -> ReasoningEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = receiver.recv().await.expect("event stream open");
            if event.run_id() != run_id {
                continue;
            }
            match event {
                ReasoningEvent::Step(_) => continue,
                terminal => return terminal,
            }
        }
    })
    .await
    .expect("run must terminate")
}

fn assert_contiguous_steps(snapshot: &RunSnapshot) {
    for (expected, step) in snapshot.steps.iter().enumerate() {
        assert_eq!(step.idx, expected as i64, "step indices must be contiguous");
    }
}

#[tokio::test]
async fn grounded_answer_over_a_single_document() {
    let store = seeded_store();
    let provider = Arc::new(ScriptedProvider::from_texts(vec![
        r#"{"kind":"search","objective":"Find revenue figures","reasoning":"Start broad","params":{"query":"revenue growth"},"stop":false}"#,
        r#"{"kind":"inspect","objective":"Read the revenue paragraph","reasoning":"Best hit","params":{"node_id":"n-rev"},"stop":false}"#,
        r#"{"kind":"synthesize","objective":"Answer from the evidence","reasoning":"Enough support","params":{},"stop":true}"#,
        r#"{"answer_markdown":"Revenue grew 15% year-over-year.","confidence":0.82,"citations":["n-rev"]}"#,
    ]));
    let engine = engine_with(Arc::clone(&store), provider);
    let mut events = engine.subscribe();

    let started = engine
        .run_query(RunRequest {
            project_id: "proj-1".to_string(),
            query: "What was the revenue growth?".to_string(),
            max_steps: None,
            focus_document_id: None,
        })
        .expect("run starts");

    let terminal = wait_for_terminal(&mut events, &started.run_id).await;
    let ReasoningEvent::Complete(complete) = terminal else {
        panic!("expected completion, got {terminal:?}");
    };
    assert_eq!(complete.run_id, started.run_id);
    assert!(complete.quality_score >= 0.6);

    let snapshot = engine.get_run(&started.run_id).expect("snapshot");
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    assert_eq!(snapshot.run.phase, RunPhase::Completed);
    assert_contiguous_steps(&snapshot);

    let kinds: Vec<StepKind> = snapshot.steps.iter().map(|step| step.kind).collect();
    assert!(kinds.contains(&StepKind::Search));
    assert!(kinds.contains(&StepKind::Inspect));
    let inspect = snapshot
        .steps
        .iter()
        .find(|step| step.kind == StepKind::Inspect)
        .expect("inspect step");
    assert!(inspect.node_refs.contains(&"n-rev".to_string()));

    let answer = snapshot.answer.as_ref().expect("answer persisted");
    assert!(answer.answer_markdown.contains("15%"));
    assert!(answer.citations.contains(&"n-rev".to_string()));
    assert!(answer.grounded);

    // Snapshot reads are idempotent after completion.
    let again = engine.get_run(&started.run_id).expect("snapshot again");
    assert_eq!(
        serde_json::to_value(&snapshot).expect("serialize"),
        serde_json::to_value(&again).expect("serialize"),
    );
}

#[tokio::test]
async fn empty_project_fails_directly_from_planning() {
    let store = Arc::new(SqliteStore::open_in_memory().expect("open store"));
    // Provider output is irrelevant: no search can return evidence.
    let provider = Arc::new(ScriptedProvider::from_texts(vec!["not json"; 6]));
    let engine = engine_with(Arc::clone(&store), provider);
    let mut events = engine.subscribe();

    let started = engine
        .run_query(RunRequest {
            project_id: "proj-empty".to_string(),
            query: "What was the revenue growth?".to_string(),
            max_steps: None,
            focus_document_id: None,
        })
        .expect("run starts");

    let terminal = wait_for_terminal(&mut events, &started.run_id).await;
    let ReasoningEvent::Error(error) = terminal else {
        panic!("expected error, got {terminal:?}");
    };
    assert_eq!(error.code, ErrorCode::RetrievalEmpty);

    let snapshot = engine.get_run(&started.run_id).expect("snapshot");
    assert_eq!(snapshot.run.status, RunStatus::Failed);
    assert_eq!(snapshot.run.phase, RunPhase::Failed);
    assert!(snapshot.answer.is_none(), "no answer may be persisted");
    // The run never got past planning: every step was a fruitless search.
    assert!(snapshot
        .steps
        .iter()
        .all(|step| step.kind == StepKind::Search));
}

#[tokio::test]
async fn fallback_drives_the_run_when_the_model_only_returns_garbage() {
    let store = seeded_store();
    let provider = Arc::new(ScriptedProvider::from_texts(vec!["{ not json ]"; 12]));
    let engine = engine_with(Arc::clone(&store), provider);
    let mut events = engine.subscribe();

    let started = engine
        .run_query(RunRequest {
            project_id: "proj-1".to_string(),
            query: "What was the revenue growth?".to_string(),
            max_steps: None,
            focus_document_id: None,
        })
        .expect("run starts");

    let terminal = wait_for_terminal(&mut events, &started.run_id).await;
    let ReasoningEvent::Error(error) = terminal else {
        panic!("expected quality rejection, got {terminal:?}");
    };
    assert_eq!(error.code, ErrorCode::QualityRejected);
    assert!(!error.retryable);

    let snapshot = engine.get_run(&started.run_id).expect("snapshot");
    assert_eq!(snapshot.run.status, RunStatus::Failed);
    assert_contiguous_steps(&snapshot);
    // Default budgets: max_steps plus the single revision grant.
    assert!(snapshot.steps.len() <= 6 + 2);

    // The fallback ladder never terminates without evidence.
    assert_eq!(snapshot.steps[0].kind, StepKind::Search);
    // The fallback only ever plans search / self_check / synthesize.
    assert!(snapshot.steps.iter().all(|step| matches!(
        step.kind,
        StepKind::Search | StepKind::SelfCheck | StepKind::Synthesize
    )));
    // Exactly one revision loop: two synthesize attempts.
    let synth_count = snapshot
        .steps
        .iter()
        .filter(|step| step.kind == StepKind::Synthesize)
        .count();
    assert_eq!(synth_count, 2);

    // Best-effort answer persisted, explicitly ungrounded.
    let answer = snapshot.answer.expect("best-effort answer persisted");
    assert!(!answer.grounded);
    assert!(answer.citations.is_empty());
}

#[tokio::test]
async fn rejected_answer_gets_exactly_one_revision_loop() {
    let store = seeded_store();
    let provider = Arc::new(ScriptedProvider::from_texts(vec![
        r#"{"kind":"search","objective":"Find revenue figures","params":{"query":"revenue growth"}}"#,
        r#"{"kind":"inspect","objective":"Read the revenue paragraph","params":{"node_id":"n-rev"}}"#,
        r#"{"kind":"synthesize","objective":"Answer","params":{}}"#,
        // First draft is grounded but ignores the question -> rejected.
        r#"{"answer_markdown":"The document discusses several topics.","confidence":0.9,"citations":["n-rev"]}"#,
        // Revision planning output is garbage; the fallback concludes.
        "garbage",
        r#"{"answer_markdown":"Revenue grew 15% year-over-year.","confidence":0.8,"citations":["n-rev"]}"#,
    ]));
    let engine = engine_with(Arc::clone(&store), provider);
    let mut events = engine.subscribe();

    let started = engine
        .run_query(RunRequest {
            project_id: "proj-1".to_string(),
            query: "What was the revenue growth?".to_string(),
            max_steps: None,
            focus_document_id: None,
        })
        .expect("run starts");

    let terminal = wait_for_terminal(&mut events, &started.run_id).await;
    assert!(
        matches!(terminal, ReasoningEvent::Complete(_)),
        "second draft must pass: {terminal:?}"
    );

    let snapshot = engine.get_run(&started.run_id).expect("snapshot");
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    assert_contiguous_steps(&snapshot);

    let synth_count = snapshot
        .steps
        .iter()
        .filter(|step| step.kind == StepKind::Synthesize)
        .count();
    assert_eq!(synth_count, 2, "exactly one validation→retrieval transition");

    let answer = snapshot.answer.expect("answer persisted");
    assert!(answer.answer_markdown.contains("15%"));
    assert!(answer.grounded);
    let quality = snapshot.run.quality.expect("quality metrics persisted");
    assert!(quality.composite >= 0.6);
}

struct SlowProvider;

#[async_trait]
impl ModelProvider for SlowProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<ModelResponse, ProviderError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(ModelResponse {
            text: "not json".to_string(),
            usage: TokenUsage::default(),
        })
    }
}

#[tokio::test]
async fn cancellation_is_observed_at_the_next_suspension_point() {
    let store = seeded_store();
    let engine = engine_with(Arc::clone(&store), Arc::new(SlowProvider));
    let mut events = engine.subscribe();

    let started = engine
        .run_query(RunRequest {
            project_id: "proj-1".to_string(),
            query: "What was the revenue growth?".to_string(),
            max_steps: None,
            focus_document_id: None,
        })
        .expect("run starts");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.cancel(&started.run_id));

    let terminal = wait_for_terminal(&mut events, &started.run_id).await;
    let ReasoningEvent::Error(error) = terminal else {
        panic!("expected cancellation, got {terminal:?}");
    };
    assert_eq!(error.code, ErrorCode::Cancelled);
    assert!(!error.retryable);

    let snapshot = engine.get_run(&started.run_id).expect("snapshot");
    assert_eq!(snapshot.run.status, RunStatus::Failed);
    assert_eq!(snapshot.run.phase, RunPhase::Failed);

    // The registry entry is dropped once the task finishes, after which
    // cancelling is a no-op.
    timeout(Duration::from_secs(2), async {
        while engine.cancel(&started.run_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry entry cleared");
}

#[tokio::test]
async fn concurrent_runs_do_not_interleave_step_records() {
    let store = seeded_store();
    let provider = Arc::new(ScriptedProvider::from_texts(vec!["not json"; 40]));
    let engine = engine_with(Arc::clone(&store), provider);
    let mut events = engine.subscribe();

    let first = engine
        .run_query(RunRequest {
            project_id: "proj-1".to_string(),
            query: "What was the revenue growth?".to_string(),
            max_steps: None,
            focus_document_id: None,
        })
        .expect("first run starts");
    let second = engine
        .run_query(RunRequest {
            project_id: "proj-1".to_string(),
            query: "How did costs develop?".to_string(),
            max_steps: None,
            focus_document_id: None,
        })
        .expect("second run starts");

    let mut remaining = vec![first.run_id.clone(), second.run_id.clone()];
    while !remaining.is_empty() {
        let event = timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("terminal events arrive")
            .expect("event stream open");
        if matches!(event, ReasoningEvent::Step(_)) {
            continue;
        }
        remaining.retain(|run_id| run_id != event.run_id());
    }

    for run_id in [&first.run_id, &second.run_id] {
        let snapshot = engine.get_run(run_id).expect("snapshot");
        assert_contiguous_steps(&snapshot);
        assert!(snapshot
            .steps
            .iter()
            .all(|step| step.run_id == *run_id));
    }
}
