use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use docreason_protocol::{
    NeighborDirection, NodeDetail, NodeRepository, NodeSummary, NodeType, SearchScope,
};

use crate::error::Result;
use crate::SqliteStore;

const SNIPPET_CHARS: usize = 240;

#[derive(Debug, Clone)]
pub struct NewDocument<'a> {
    pub id: &'a str,
    pub project_id: &'a str,
    pub name: &'a str,
}

#[derive(Debug, Clone)]
pub struct NewNode<'a> {
    pub id: &'a str,
    pub parent_id: Option<&'a str>,
    pub node_type: NodeType,
    pub title: &'a str,
    pub text: &'a str,
    pub ordinal_path: &'a str,
}

impl SqliteStore {
    pub fn insert_document(&self, document: NewDocument<'_>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO documents (id, project_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                document.id,
                document.project_id,
                document.name,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ],
        )?;
        Ok(())
    }

    pub fn insert_nodes(&self, document_id: &str, nodes: &[NewNode<'_>]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for node in nodes {
            tx.execute(
                r#"
                INSERT INTO doc_nodes (id, document_id, parent_id, node_type, title, text, ordinal_path)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    node.id,
                    document_id,
                    node.parent_id,
                    node.node_type.as_str(),
                    node.title,
                    node.text,
                    node.ordinal_path,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Term-overlap search within a scope. Title hits weigh double; ties are
    /// broken by ordinal path, then id, so identical queries rank identically.
    /// Project-wide searches cap hits per document so one large document
    /// cannot crowd out the rest.
    pub fn search_nodes(
        &self,
        scope: &SearchScope,
        text: &str,
        limit: usize,
    ) -> Result<Vec<NodeSummary>> {
        let terms = search_terms(text);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            r#"
            SELECT n.id, n.document_id, n.parent_id, n.node_type, n.title, n.text, n.ordinal_path
            FROM doc_nodes n
            JOIN documents d ON d.id = n.document_id
            WHERE d.project_id = ?1
            "#,
        );
        let mut bindings: Vec<String> = vec![scope.project_id.clone()];
        if let Some(document_id) = &scope.focus_document_id {
            sql.push_str(" AND n.document_id = ?2");
            bindings.push(document_id.clone());
        }
        sql.push_str(" AND (");
        for (index, term) in terms.iter().enumerate() {
            if index > 0 {
                sql.push_str(" OR ");
            }
            let placeholder = bindings.len() + 1;
            sql.push_str(&format!(
                "instr(lower(n.title), ?{placeholder}) > 0 OR instr(lower(n.text), ?{placeholder}) > 0"
            ));
            bindings.push(term.clone());
        }
        sql.push(')');

        let conn = self.lock();
        let mut statement = conn.prepare(&sql)?;
        let rows = statement
            .query_map(params_from_iter(bindings.iter()), map_scored_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(statement);
        drop(conn);

        let mut scored: Vec<(u32, ScoredNode)> = rows
            .into_iter()
            .map(|node| (score_node(&node, &terms), node))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| a.1.ordinal_path.cmp(&b.1.ordinal_path))
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        // Per-document diversity cap, only when searching project-wide.
        let max_per_document = if scope.focus_document_id.is_some() {
            limit.max(1)
        } else {
            (limit / 2).max(2)
        };
        let matched = scored.len();
        let mut per_document: HashMap<String, usize> = HashMap::new();
        let mut selected = Vec::new();
        for (_, node) in scored {
            if selected.len() >= limit {
                break;
            }
            let seen = per_document.entry(node.document_id.clone()).or_insert(0);
            if scope.focus_document_id.is_none() && *seen >= max_per_document {
                continue;
            }
            *seen += 1;
            selected.push(node.into_summary());
        }
        log::debug!(
            "search_nodes: terms={terms:?} matched={matched} returned={}",
            selected.len()
        );
        Ok(selected)
    }

    pub fn get_node(&self, node_id: &str) -> Result<Option<NodeDetail>> {
        let conn = self.lock();
        let detail = conn
            .query_row(
                r#"
                SELECT id, document_id, parent_id, node_type, title, text, ordinal_path
                FROM doc_nodes WHERE id = ?1
                "#,
                params![node_id],
                map_detail,
            )
            .optional()?;
        Ok(detail)
    }

    pub fn get_neighbors(
        &self,
        node_id: &str,
        direction: NeighborDirection,
    ) -> Result<Vec<NodeSummary>> {
        let conn = self.lock();
        let anchor = conn
            .query_row(
                "SELECT document_id, parent_id FROM doc_nodes WHERE id = ?1",
                params![node_id],
                |row| {
                    Ok((
                        row.get::<_, String>("document_id")?,
                        row.get::<_, Option<String>>("parent_id")?,
                    ))
                },
            )
            .optional()?;
        let Some((document_id, parent_id)) = anchor else {
            return Ok(Vec::new());
        };

        let base = r#"
            SELECT id, document_id, parent_id, node_type, title, text, ordinal_path
            FROM doc_nodes
        "#;
        let mut statement;
        let rows = match direction {
            NeighborDirection::Parent => {
                let Some(parent_id) = parent_id else {
                    return Ok(Vec::new());
                };
                statement = conn.prepare(&format!("{base} WHERE id = ?1"))?;
                statement.query_map(params![parent_id], map_scored_row)?
            }
            NeighborDirection::Children => {
                statement = conn
                    .prepare(&format!("{base} WHERE parent_id = ?1 ORDER BY ordinal_path, id"))?;
                statement.query_map(params![node_id], map_scored_row)?
            }
            NeighborDirection::Siblings => match parent_id {
                Some(parent_id) => {
                    statement = conn.prepare(&format!(
                        "{base} WHERE parent_id = ?1 AND id != ?2 ORDER BY ordinal_path, id"
                    ))?;
                    statement.query_map(params![parent_id, node_id], map_scored_row)?
                }
                None => {
                    statement = conn.prepare(&format!(
                        "{base} WHERE document_id = ?1 AND parent_id IS NULL AND id != ?2 \
                         ORDER BY ordinal_path, id"
                    ))?;
                    statement.query_map(params![document_id, node_id], map_scored_row)?
                }
            },
        };
        let summaries = rows
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(ScoredNode::into_summary)
            .collect();
        Ok(summaries)
    }
}

#[async_trait]
impl NodeRepository for SqliteStore {
    async fn search(
        &self,
        scope: &SearchScope,
        text: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<NodeSummary>> {
        Ok(self.search_nodes(scope, text, limit)?)
    }

    async fn get_node(&self, node_id: &str) -> anyhow::Result<Option<NodeDetail>> {
        Ok(SqliteStore::get_node(self, node_id)?)
    }

    async fn get_neighbors(
        &self,
        node_id: &str,
        direction: NeighborDirection,
    ) -> anyhow::Result<Vec<NodeSummary>> {
        Ok(SqliteStore::get_neighbors(self, node_id, direction)?)
    }
}

struct ScoredNode {
    id: String,
    document_id: String,
    parent_id: Option<String>,
    node_type: NodeType,
    title: String,
    text: String,
    ordinal_path: String,
}

impl ScoredNode {
    fn into_summary(self) -> NodeSummary {
        NodeSummary {
            id: self.id,
            document_id: self.document_id,
            parent_id: self.parent_id,
            node_type: self.node_type,
            title: self.title,
            snippet: snippet(&self.text),
            ordinal_path: self.ordinal_path,
        }
    }
}

fn map_scored_row(row: &Row<'_>) -> rusqlite::Result<ScoredNode> {
    let node_type: String = row.get("node_type")?;
    Ok(ScoredNode {
        id: row.get("id")?,
        document_id: row.get("document_id")?,
        parent_id: row.get("parent_id")?,
        node_type: NodeType::parse(&node_type),
        title: row.get("title")?,
        text: row.get("text")?,
        ordinal_path: row.get("ordinal_path")?,
    })
}

fn map_detail(row: &Row<'_>) -> rusqlite::Result<NodeDetail> {
    let node_type: String = row.get("node_type")?;
    Ok(NodeDetail {
        id: row.get("id")?,
        document_id: row.get("document_id")?,
        parent_id: row.get("parent_id")?,
        node_type: NodeType::parse(&node_type),
        title: row.get("title")?,
        text: row.get("text")?,
        ordinal_path: row.get("ordinal_path")?,
        metadata: serde_json::json!({}),
    })
}

fn score_node(node: &ScoredNode, terms: &[String]) -> u32 {
    let title = node.title.to_lowercase();
    let text = node.text.to_lowercase();
    let mut score = 0;
    for term in terms {
        if title.contains(term.as_str()) {
            score += 2;
        }
        if text.contains(term.as_str()) {
            score += 1;
        }
    }
    score
}

fn search_terms(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    for token in text.split(|c: char| !c.is_alphanumeric()) {
        let token = token.trim().to_lowercase();
        if token.len() > 2 && !terms.contains(&token) {
            terms.push(token);
        }
    }
    terms
}

fn snippet(text: &str) -> String {
    let flattened = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flattened.chars().count() <= SNIPPET_CHARS {
        return flattened;
    }
    flattened.chars().take(SNIPPET_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn seeded_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("open store");
        store
            .insert_document(NewDocument {
                id: "doc-a",
                project_id: "proj-1",
                name: "Annual Report",
            })
            .expect("insert doc-a");
        store
            .insert_document(NewDocument {
                id: "doc-b",
                project_id: "proj-1",
                name: "Quarterly Update",
            })
            .expect("insert doc-b");
        store
            .insert_nodes(
                "doc-a",
                &[
                    NewNode {
                        id: "a-1",
                        parent_id: None,
                        node_type: NodeType::Section,
                        title: "Financial Results",
                        text: "Overview of yearly financial performance.",
                        ordinal_path: "1",
                    },
                    NewNode {
                        id: "a-1-1",
                        parent_id: Some("a-1"),
                        node_type: NodeType::Paragraph,
                        title: "Revenue",
                        text: "Revenue grew 15% year-over-year.",
                        ordinal_path: "1.1",
                    },
                    NewNode {
                        id: "a-1-2",
                        parent_id: Some("a-1"),
                        node_type: NodeType::Paragraph,
                        title: "Costs",
                        text: "Costs were flat compared to last year.",
                        ordinal_path: "1.2",
                    },
                ],
            )
            .expect("insert doc-a nodes");
        store
            .insert_nodes(
                "doc-b",
                &[NewNode {
                    id: "b-1",
                    parent_id: None,
                    node_type: NodeType::Section,
                    title: "Revenue Outlook",
                    text: "Projected revenue growth for next quarter.",
                    ordinal_path: "1",
                }],
            )
            .expect("insert doc-b nodes");
        store
    }

    #[test]
    fn search_ranks_title_hits_first_and_breaks_ties_deterministically() {
        let store = seeded_store();
        let scope = SearchScope::project("proj-1");
        let hits = store
            .search_nodes(&scope, "revenue growth", 10)
            .expect("search");
        assert!(!hits.is_empty());
        // Title+text hits outrank text-only hits; equal scores fall back to
        // ordinal path then id.
        assert_eq!(hits[0].id, "a-1-1");
        let again = store
            .search_nodes(&scope, "revenue growth", 10)
            .expect("search again");
        let ids: Vec<_> = hits.iter().map(|hit| hit.id.as_str()).collect();
        let again_ids: Vec<_> = again.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, again_ids);
    }

    #[test]
    fn focus_document_scope_excludes_other_documents() {
        let store = seeded_store();
        let scope = SearchScope {
            project_id: "proj-1".to_string(),
            focus_document_id: Some("doc-b".to_string()),
        };
        let hits = store.search_nodes(&scope, "revenue", 10).expect("search");
        assert!(hits.iter().all(|hit| hit.document_id == "doc-b"));
    }

    #[test]
    fn neighbors_cover_parent_children_and_siblings() {
        let store = seeded_store();
        let children = store
            .get_neighbors("a-1", NeighborDirection::Children)
            .expect("children");
        assert_eq!(
            children.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
            vec!["a-1-1", "a-1-2"],
        );

        let parent = store
            .get_neighbors("a-1-1", NeighborDirection::Parent)
            .expect("parent");
        assert_eq!(parent.len(), 1);
        assert_eq!(parent[0].id, "a-1");

        let siblings = store
            .get_neighbors("a-1-1", NeighborDirection::Siblings)
            .expect("siblings");
        assert_eq!(siblings.len(), 1);
        assert_eq!(siblings[0].id, "a-1-2");
    }

    #[test]
    fn unknown_node_yields_empty_results_not_errors() {
        let store = seeded_store();
        assert!(store.get_node("missing").expect("query ok").is_none());
        assert!(store
            .get_neighbors("missing", NeighborDirection::Children)
            .expect("query ok")
            .is_empty());
    }

    #[test]
    fn empty_project_search_returns_nothing() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let scope = SearchScope::project("proj-empty");
        assert!(store
            .search_nodes(&scope, "anything at all", 10)
            .expect("search")
            .is_empty());
    }
}
