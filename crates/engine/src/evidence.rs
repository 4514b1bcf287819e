use std::collections::{HashMap, HashSet};

use docreason_protocol::{NodeDetail, NodeSummary, NodeType};

const EXCERPT_CHARS: usize = 500;

/// One observed node held as potential citation material.
#[derive(Debug, Clone)]
pub struct EvidenceItem {
    pub node_id: String,
    pub document_id: String,
    pub node_type: NodeType,
    pub title: String,
    pub text: String,
    pub ordinal_path: String,
}

impl EvidenceItem {
    #[must_use]
    pub fn from_summary(summary: &NodeSummary) -> Self {
        Self {
            node_id: summary.id.clone(),
            document_id: summary.document_id.clone(),
            node_type: summary.node_type,
            title: summary.title.clone(),
            text: summary.snippet.clone(),
            ordinal_path: summary.ordinal_path.clone(),
        }
    }

    #[must_use]
    pub fn from_detail(detail: &NodeDetail) -> Self {
        Self {
            node_id: detail.id.clone(),
            document_id: detail.document_id.clone(),
            node_type: detail.node_type,
            title: detail.title.clone(),
            text: detail.text.clone(),
            ordinal_path: detail.ordinal_path.clone(),
        }
    }
}

/// Everything a run has observed so far, deduplicated by node id. Citations
/// are validated against this set, never against the repository, so an
/// answer can only cite what the run actually looked at.
#[derive(Debug, Default)]
pub struct EvidencePool {
    items: Vec<EvidenceItem>,
    index: HashMap<String, usize>,
}

impl EvidencePool {
    /// Insert or enrich. An `inspect` after a `search` carries fuller text
    /// for the same node; the longer text wins.
    pub fn add(&mut self, item: EvidenceItem) {
        match self.index.get(&item.node_id) {
            Some(&position) => {
                if item.text.len() > self.items[position].text.len() {
                    self.items[position] = item;
                }
            }
            None => {
                self.index.insert(item.node_id.clone(), self.items.len());
                self.items.push(item);
            }
        }
    }

    #[must_use]
    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<&EvidenceItem> {
        self.index.get(node_id).map(|&position| &self.items[position])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.node_id.clone()).collect()
    }

    #[must_use]
    pub fn document_ids(&self) -> HashSet<&str> {
        self.items
            .iter()
            .map(|item| item.document_id.as_str())
            .collect()
    }

    #[must_use]
    pub fn items(&self) -> &[EvidenceItem] {
        &self.items
    }

    /// Citation-tagged snippets fed into the synthesis prompt.
    #[must_use]
    pub fn snippets(&self) -> Vec<String> {
        self.items
            .iter()
            .map(|item| {
                let mut text = item.text.replace('\n', " ");
                if text.chars().count() > EXCERPT_CHARS {
                    text = text.chars().take(EXCERPT_CHARS).collect();
                }
                format!(
                    "[citation:{}] document={} path={} type={} title={} excerpt={}",
                    item.node_id,
                    item.document_id,
                    item.ordinal_path,
                    item.node_type.as_str(),
                    item.title,
                    text,
                )
            })
            .collect()
    }
}
