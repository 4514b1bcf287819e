//! SQLite persistence for docreason: durable run/step/answer records plus the
//! document-node tables backing the default `NodeRepository` implementation.
//!
//! All access goes through one mutexed connection, so concurrent runs see a
//! serialized store; writes within a run commit in step order.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

mod error;
mod ingest;
mod nodes;
mod runs;

pub use error::{Result, StoreError};
pub use ingest::{ingest_document, DocumentTree, IngestReport, TreeNode};
pub use nodes::{NewDocument, NewNode};
pub use runs::{NewAnswer, NewRun, NewStep, RunTermination};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS documents (
              id TEXT PRIMARY KEY,
              project_id TEXT NOT NULL,
              name TEXT NOT NULL,
              created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_documents_project
              ON documents(project_id, created_at);

            CREATE TABLE IF NOT EXISTS doc_nodes (
              id TEXT PRIMARY KEY,
              document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
              parent_id TEXT,
              node_type TEXT NOT NULL,
              title TEXT NOT NULL,
              text TEXT NOT NULL,
              ordinal_path TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_doc_nodes_document
              ON doc_nodes(document_id, ordinal_path);
            CREATE INDEX IF NOT EXISTS idx_doc_nodes_parent
              ON doc_nodes(parent_id);

            CREATE TABLE IF NOT EXISTS runs (
              id TEXT PRIMARY KEY,
              project_id TEXT NOT NULL,
              focus_document_id TEXT,
              query TEXT NOT NULL,
              phase TEXT NOT NULL,
              status TEXT NOT NULL,
              started_at TEXT NOT NULL,
              ended_at TEXT,
              total_latency_ms INTEGER,
              token_usage_json TEXT NOT NULL DEFAULT '{}',
              cost_usd REAL NOT NULL DEFAULT 0,
              quality_json TEXT,
              planner_trace_json TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS steps (
              run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
              idx INTEGER NOT NULL,
              kind TEXT NOT NULL,
              objective TEXT NOT NULL,
              reasoning TEXT NOT NULL,
              params_json TEXT NOT NULL,
              observation TEXT NOT NULL,
              node_refs_json TEXT NOT NULL,
              confidence REAL NOT NULL,
              latency_ms INTEGER NOT NULL,
              PRIMARY KEY (run_id, idx)
            );

            CREATE TABLE IF NOT EXISTS answers (
              run_id TEXT PRIMARY KEY REFERENCES runs(id) ON DELETE CASCADE,
              answer_markdown TEXT NOT NULL,
              citations_json TEXT NOT NULL,
              confidence REAL NOT NULL,
              grounded INTEGER NOT NULL,
              quality_json TEXT
            );
            "#,
        )?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another store call panicked mid-write; the
        // data already committed is still consistent, so keep serving.
        self.conn.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}
