use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structural role of a node inside the ingested document tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Document,
    Section,
    Subsection,
    Paragraph,
    Claim,
    Table,
    Figure,
    Equation,
    Caption,
    Reference,
    Unknown,
}

impl NodeType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Section => "section",
            Self::Subsection => "subsection",
            Self::Paragraph => "paragraph",
            Self::Claim => "claim",
            Self::Table => "table",
            Self::Figure => "figure",
            Self::Equation => "equation",
            Self::Caption => "caption",
            Self::Reference => "reference",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "document" => Self::Document,
            "section" => Self::Section,
            "subsection" => Self::Subsection,
            "paragraph" => Self::Paragraph,
            "claim" => Self::Claim,
            "table" => Self::Table,
            "figure" => Self::Figure,
            "equation" => Self::Equation,
            "caption" => Self::Caption,
            "reference" => Self::Reference,
            _ => Self::Unknown,
        }
    }
}

/// Ranked search hit / listing entry. `snippet` is a flattened excerpt of the
/// node text, bounded by the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    pub document_id: String,
    pub parent_id: Option<String>,
    pub node_type: NodeType,
    pub title: String,
    pub snippet: String,
    pub ordinal_path: String,
}

/// Full node payload returned by `NodeRepository::get_node`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDetail {
    pub id: String,
    pub document_id: String,
    pub parent_id: Option<String>,
    pub node_type: NodeType,
    pub title: String,
    pub text: String,
    pub ordinal_path: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NeighborDirection {
    Parent,
    Children,
    Siblings,
}

impl NeighborDirection {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Children => "children",
            Self::Siblings => "siblings",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "parent" => Some(Self::Parent),
            "children" => Some(Self::Children),
            "siblings" => Some(Self::Siblings),
            _ => None,
        }
    }
}
