//! SQLite-backed orchestration history.
//!
//! The store holds workflow instances and their per-activity outcomes. It
//! contains no relationship data; replaying an instance against its history
//! reproduces the orchestration's decisions without repeating side effects.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("history serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A workflow instance that did not run to completion.
#[derive(Debug, Clone)]
pub struct PendingInstance {
    pub id: String,
    pub strategy: String,
    pub input: String,
}

/// One recorded history event: the activity (or timer) at a sequence number
/// and its serialized outcome.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub seq: u32,
    pub name: String,
    pub outcome: String,
}

/// Process-wide durable store. A single connection behind a mutex is
/// sufficient: history writes are small and serialized by design.
#[derive(Clone)]
pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl HistoryStore {
    /// Open the store at `path`. An empty path opens an in-memory store
    /// that lives as long as the process.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = if path.is_empty() {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS workflow_instances (
                id TEXT PRIMARY KEY,
                strategy TEXT NOT NULL,
                input TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                result TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS workflow_history (
                instance_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                name TEXT NOT NULL,
                outcome TEXT NOT NULL,
                PRIMARY KEY (instance_id, seq)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_workflow_instances_status
             ON workflow_instances(status)",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; continuing with the
        // connection is still sound for sqlite.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_instance(&self, id: &str, strategy: &str, input: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO workflow_instances (id, strategy, input) VALUES (?1, ?2, ?3)",
            params![id, strategy, input],
        )?;
        Ok(())
    }

    /// Record one completed activity or timer.
    pub fn record_event(
        &self,
        instance_id: &str,
        seq: u32,
        name: &str,
        outcome: &str,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT OR REPLACE INTO workflow_history (instance_id, seq, name, outcome)
             VALUES (?1, ?2, ?3, ?4)",
            params![instance_id, seq, name, outcome],
        )?;
        Ok(())
    }

    /// Load the recorded history of an instance in sequence order.
    pub fn history(&self, instance_id: &str) -> Result<Vec<RecordedEvent>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, name, outcome FROM workflow_history
             WHERE instance_id = ?1 ORDER BY seq ASC",
        )?;
        let events = stmt
            .query_map(params![instance_id], |row| {
                Ok(RecordedEvent {
                    seq: row.get(0)?,
                    name: row.get(1)?,
                    outcome: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn complete_instance(
        &self,
        instance_id: &str,
        status: &str,
        result: Option<&str>,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE workflow_instances SET status = ?2, result = ?3 WHERE id = ?1",
            params![instance_id, status, result],
        )?;
        Ok(())
    }

    /// Instances still marked running, e.g. after a crash.
    pub fn pending_instances(&self) -> Result<Vec<PendingInstance>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, strategy, input FROM workflow_instances WHERE status = 'running'",
        )?;
        let instances = stmt
            .query_map([], |row| {
                Ok(PendingInstance {
                    id: row.get(0)?,
                    strategy: row.get(1)?,
                    input: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(instances)
    }

    /// Completion status of an instance, if it exists.
    pub fn instance_status(&self, instance_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        let status = conn
            .query_row(
                "SELECT status FROM workflow_instances WHERE id = ?1",
                params![instance_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_round_trip() {
        let store = HistoryStore::open("").unwrap();
        store.create_instance("wf-1", "pessimistic-dual-write", "{}").unwrap();
        store.record_event("wf-1", 0, "write_to_spicedb", r#"{"ok":null}"#).unwrap();
        store.record_event("wf-1", 1, "write_to_kube", r#"{"ok":{"status":201}}"#).unwrap();

        let history = store.history("wf-1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].name, "write_to_spicedb");
        assert_eq!(history[1].seq, 1);
    }

    #[test]
    fn test_pending_excludes_completed() {
        let store = HistoryStore::open("").unwrap();
        store.create_instance("wf-1", "optimistic-dual-write", "{}").unwrap();
        store.create_instance("wf-2", "optimistic-dual-write", "{}").unwrap();
        store.complete_instance("wf-1", "completed", Some("{}")).unwrap();

        let pending = store.pending_instances().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "wf-2");
        assert_eq!(store.instance_status("wf-1").unwrap().as_deref(), Some("completed"));
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows.db");
        let path = path.to_str().unwrap();

        {
            let store = HistoryStore::open(path).unwrap();
            store.create_instance("wf-1", "pessimistic-dual-write", "{}").unwrap();
            store.record_event("wf-1", 0, "write_to_spicedb", r#"{"ok":null}"#).unwrap();
        }

        let store = HistoryStore::open(path).unwrap();
        assert_eq!(store.pending_instances().unwrap().len(), 1);
        assert_eq!(store.history("wf-1").unwrap().len(), 1);
    }
}
