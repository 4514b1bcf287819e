use serde::Deserialize;
use uuid::Uuid;

use docreason_protocol::NodeType;

use crate::error::{Result, StoreError};
use crate::nodes::{NewDocument, NewNode};
use crate::SqliteStore;

/// Parsed document tree as produced by the ingestion sidecar: nested nodes
/// with a type, title, text, and children.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentTree {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeNode {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_node_type")]
    pub node_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

fn default_node_type() -> String {
    "section".to_string()
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub document_id: String,
    pub node_count: usize,
}

struct FlatNode {
    id: String,
    parent_id: Option<String>,
    node_type: NodeType,
    title: String,
    text: String,
    ordinal_path: String,
}

/// Load one parsed document tree into the store, assigning ids where the
/// tree does not carry them and ordinal paths from the tree position.
pub fn ingest_document(
    store: &SqliteStore,
    project_id: &str,
    tree: &DocumentTree,
) -> Result<IngestReport> {
    if tree.nodes.is_empty() {
        return Err(StoreError::InvalidInput(format!(
            "document '{}' has no nodes",
            tree.name
        )));
    }

    let document_id = tree
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut flat = Vec::new();
    flatten(&tree.nodes, None, "", &mut flat);

    store.insert_document(NewDocument {
        id: &document_id,
        project_id,
        name: &tree.name,
    })?;
    let rows: Vec<NewNode<'_>> = flat
        .iter()
        .map(|node| NewNode {
            id: &node.id,
            parent_id: node.parent_id.as_deref(),
            node_type: node.node_type,
            title: &node.title,
            text: &node.text,
            ordinal_path: &node.ordinal_path,
        })
        .collect();
    store.insert_nodes(&document_id, &rows)?;

    Ok(IngestReport {
        document_id,
        node_count: flat.len(),
    })
}

fn flatten(nodes: &[TreeNode], parent_id: Option<&str>, prefix: &str, out: &mut Vec<FlatNode>) {
    for (index, node) in nodes.iter().enumerate() {
        let ordinal_path = if prefix.is_empty() {
            format!("{}", index + 1)
        } else {
            format!("{prefix}.{}", index + 1)
        };
        let id = node
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        out.push(FlatNode {
            id: id.clone(),
            parent_id: parent_id.map(ToString::to_string),
            node_type: NodeType::parse(&node.node_type),
            title: node.title.clone(),
            text: node.text.clone(),
            ordinal_path: ordinal_path.clone(),
        });
        flatten(&node.children, Some(&id), &ordinal_path, out);
    }
}
