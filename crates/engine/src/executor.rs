use std::time::Duration;

use tokio::time::timeout;

use docreason_protocol::{NodeRepository, NodeSummary, PlannedAction, SearchScope};

use crate::evidence::EvidenceItem;

const SEARCH_CONFIDENCE: f64 = 0.45;
const EMPTY_RESULT_CONFIDENCE: f64 = 0.25;
const INSPECT_CONFIDENCE: f64 = 0.65;
const EXPAND_CONFIDENCE: f64 = 0.5;
const OBSERVATION_EXCERPT_CHARS: usize = 200;

/// What one executed action produced. Infrastructure failures land in
/// `observation` like any other result; nothing escapes this boundary as an
/// error.
#[derive(Debug)]
pub(crate) struct ActionOutcome {
    pub observation: String,
    pub node_refs: Vec<String>,
    pub evidence: Vec<EvidenceItem>,
    pub confidence: f64,
    pub result_count: usize,
}

impl ActionOutcome {
    fn empty(observation: String, confidence: f64) -> Self {
        Self {
            observation,
            node_refs: Vec::new(),
            evidence: Vec::new(),
            confidence,
            result_count: 0,
        }
    }
}

/// Executes validated retrieval actions against the node repository, with a
/// timeout on every repository call.
pub(crate) struct ActionExecutor<'a> {
    pub repo: &'a dyn NodeRepository,
    pub scope: &'a SearchScope,
    pub search_limit: usize,
    pub call_timeout: Duration,
}

impl ActionExecutor<'_> {
    pub async fn execute(&self, action: &PlannedAction) -> ActionOutcome {
        match action {
            PlannedAction::Search { query } => self.search(query).await,
            PlannedAction::Inspect { node_id } => self.inspect(node_id).await,
            PlannedAction::ExpandNeighbors { node_id, direction } => {
                let direction = *direction;
                let lookup = timeout(
                    self.call_timeout,
                    self.repo.get_neighbors(node_id, direction),
                )
                .await;
                match lookup {
                    Ok(Ok(neighbors)) if neighbors.is_empty() => ActionOutcome::empty(
                        format!("No {} found for node {node_id}", direction.as_str()),
                        EMPTY_RESULT_CONFIDENCE,
                    ),
                    Ok(Ok(neighbors)) => ActionOutcome {
                        observation: format!(
                            "Neighbors ({}) of {node_id}: {}",
                            direction.as_str(),
                            summarize_nodes(&neighbors),
                        ),
                        node_refs: neighbors.iter().map(|node| node.id.clone()).collect(),
                        result_count: neighbors.len(),
                        evidence: neighbors.iter().map(EvidenceItem::from_summary).collect(),
                        confidence: EXPAND_CONFIDENCE,
                    },
                    Ok(Err(err)) => ActionOutcome::empty(
                        format!("Neighbor lookup for {node_id} failed: {err}"),
                        EMPTY_RESULT_CONFIDENCE,
                    ),
                    Err(_) => ActionOutcome::empty(
                        format!("Neighbor lookup for {node_id} timed out"),
                        EMPTY_RESULT_CONFIDENCE,
                    ),
                }
            }
            // Handled directly by the coordinator; nothing to execute here.
            PlannedAction::Synthesize | PlannedAction::SelfCheck | PlannedAction::Finish => {
                ActionOutcome::empty("No repository access required".to_string(), 0.0)
            }
        }
    }

    async fn search(&self, query: &str) -> ActionOutcome {
        let lookup = timeout(
            self.call_timeout,
            self.repo.search(self.scope, query, self.search_limit),
        )
        .await;
        match lookup {
            Ok(Ok(results)) if results.is_empty() => ActionOutcome::empty(
                format!("Search '{query}' returned no nodes"),
                EMPTY_RESULT_CONFIDENCE,
            ),
            Ok(Ok(results)) => ActionOutcome {
                observation: format!(
                    "Search '{query}' returned {} nodes: {}",
                    results.len(),
                    summarize_nodes(&results),
                ),
                node_refs: results.iter().map(|node| node.id.clone()).collect(),
                result_count: results.len(),
                evidence: results.iter().map(EvidenceItem::from_summary).collect(),
                confidence: SEARCH_CONFIDENCE,
            },
            Ok(Err(err)) => ActionOutcome::empty(
                format!("Search '{query}' failed: {err}"),
                EMPTY_RESULT_CONFIDENCE,
            ),
            Err(_) => ActionOutcome::empty(
                format!("Search '{query}' timed out"),
                EMPTY_RESULT_CONFIDENCE,
            ),
        }
    }

    async fn inspect(&self, node_id: &str) -> ActionOutcome {
        let lookup = timeout(self.call_timeout, self.repo.get_node(node_id)).await;
        match lookup {
            Ok(Ok(Some(detail))) => {
                let excerpt: String = detail
                    .text
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .chars()
                    .take(OBSERVATION_EXCERPT_CHARS)
                    .collect();
                ActionOutcome {
                    observation: format!("Inspected '{}' ({node_id}): {excerpt}", detail.title),
                    node_refs: vec![detail.id.clone()],
                    result_count: 1,
                    evidence: vec![EvidenceItem::from_detail(&detail)],
                    confidence: INSPECT_CONFIDENCE,
                }
            }
            Ok(Ok(None)) => ActionOutcome::empty(
                format!("Node {node_id} not found"),
                EMPTY_RESULT_CONFIDENCE,
            ),
            Ok(Err(err)) => ActionOutcome::empty(
                format!("Node lookup for {node_id} failed: {err}"),
                EMPTY_RESULT_CONFIDENCE,
            ),
            Err(_) => ActionOutcome::empty(
                format!("Node lookup for {node_id} timed out"),
                EMPTY_RESULT_CONFIDENCE,
            ),
        }
    }
}

fn summarize_nodes(nodes: &[NodeSummary]) -> String {
    let mut listed: Vec<String> = nodes
        .iter()
        .take(3)
        .map(|node| {
            let label = if node.title.is_empty() {
                node.node_type.as_str()
            } else {
                node.title.as_str()
            };
            format!("{label} ({})", node.id)
        })
        .collect();
    if nodes.len() > 3 {
        listed.push(format!("and {} more", nodes.len() - 3));
    }
    listed.join(", ")
}
