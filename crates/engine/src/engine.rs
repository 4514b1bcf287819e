use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use uuid::Uuid;

use docreason_protocol::{
    ModelProvider, NodeRepository, ReasoningEvent, RunPhase, RunSnapshot, SearchScope, TokenUsage,
};
use docreason_store::{NewRun, SqliteStore};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::evidence::EvidencePool;
use crate::planner::Planner;
use crate::run::RunWorker;
use crate::scope::requires_project_scope;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub project_id: String,
    pub query: String,
    pub max_steps: Option<usize>,
    pub focus_document_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunStarted {
    pub run_id: String,
    pub status: String,
}

struct EngineInner {
    store: Arc<SqliteStore>,
    repo: Arc<dyn NodeRepository>,
    provider: Arc<dyn ModelProvider>,
    config: EngineConfig,
    events: broadcast::Sender<ReasoningEvent>,
    active: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

/// Entry point for submitting, observing, and cancelling runs. Cheap to
/// clone; all clones share the same store, event stream, and active-run
/// registry.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        store: Arc<SqliteStore>,
        repo: Arc<dyn NodeRepository>,
        provider: Arc<dyn ModelProvider>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                store,
                repo,
                provider,
                config,
                events,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the multicast event stream. Events are tagged with their
    /// run id; consumers filter for the runs they care about.
    pub fn subscribe(&self) -> broadcast::Receiver<ReasoningEvent> {
        self.inner.events.subscribe()
    }

    /// Start a run asynchronously. Returns as soon as the run record exists;
    /// progress is observable through `subscribe` and `get_run`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run_query(&self, request: RunRequest) -> Result<RunStarted> {
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(EngineError::InvalidInput("query cannot be empty".to_string()));
        }

        let run_id = Uuid::new_v4().to_string();
        let relation_query = requires_project_scope(&query);
        // Relation queries only make sense project-wide, so a pinned focus
        // document is released for them.
        let focus_document_id = if relation_query {
            None
        } else {
            request.focus_document_id
        };

        self.inner.store.create_run(NewRun {
            id: &run_id,
            project_id: &request.project_id,
            focus_document_id: focus_document_id.as_deref(),
            query: &query,
        })?;

        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut active = self.lock_active();
            active.insert(run_id.clone(), Arc::clone(&cancel));
        }

        let limits = &self.inner.config.limits;
        let worker = RunWorker {
            run_id: run_id.clone(),
            query,
            scope: SearchScope {
                project_id: request.project_id,
                focus_document_id,
            },
            relation_query,
            max_steps: limits.effective_max_steps(request.max_steps),
            store: Arc::clone(&self.inner.store),
            repo: Arc::clone(&self.inner.repo),
            planner: Planner::new(Arc::clone(&self.inner.provider), limits.step_timeout),
            config: self.inner.config.clone(),
            events: self.inner.events.clone(),
            cancel,
            step_count: 0,
            phase: RunPhase::Planning,
            evidence: EvidencePool::default(),
            recent_observations: Vec::new(),
            explored_titles: Vec::new(),
            last_confidence: None,
            self_check_done: false,
            revision_gaps: Vec::new(),
            revisions_used: 0,
            searches_executed: 0,
            empty_searches: 0,
            provider_failures: 0,
            usage: TokenUsage::default(),
            trace: Vec::new(),
        };

        let inner = Arc::clone(&self.inner);
        let worker_run_id = run_id.clone();
        tokio::spawn(async move {
            worker.execute().await;
            let mut active = inner
                .active
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            active.remove(&worker_run_id);
        });

        Ok(RunStarted {
            run_id,
            status: "started".to_string(),
        })
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunSnapshot> {
        self.inner
            .store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    /// Request cancellation. The run observes the flag at its next
    /// suspension point and fails with code `cancelled`. Returns whether a
    /// live run with this id existed.
    pub fn cancel(&self, run_id: &str) -> bool {
        let active = self.lock_active();
        match active.get(run_id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn lock_active(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
