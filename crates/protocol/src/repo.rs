use anyhow::Result;
use async_trait::async_trait;

use crate::nodes::{NeighborDirection, NodeDetail, NodeSummary};

/// Scope a run retrieves within: a project, optionally narrowed to one
/// document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchScope {
    pub project_id: String,
    pub focus_document_id: Option<String>,
}

impl SearchScope {
    #[must_use]
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            focus_document_id: None,
        }
    }
}

/// Read-only query surface over the ingested document tree.
///
/// Implementations must be safe to call concurrently and must report missing
/// data as empty results / `None`, never as errors. Errors are reserved for
/// infrastructure failures and are captured by the caller as observations.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Full-text search within `scope`. Results are ranked; ties are broken
    /// by node ordinal path, then id, so repeated queries are deterministic.
    async fn search(
        &self,
        scope: &SearchScope,
        text: &str,
        limit: usize,
    ) -> Result<Vec<NodeSummary>>;

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeDetail>>;

    async fn get_neighbors(
        &self,
        node_id: &str,
        direction: NeighborDirection,
    ) -> Result<Vec<NodeSummary>>;
}
