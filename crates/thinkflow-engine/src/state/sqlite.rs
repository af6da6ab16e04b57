use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::traits::StateStore;
use thinkflow_core::types::{ExecutionSnapshot, ExecutionStatus, InstanceId};

/// Durable state store backed by SQLite.
///
/// One row per run instance holding the JSON snapshot; status is kept in
/// its own column for `list_by_status`.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> ThinkflowError {
    ThinkflowError::Store(e.to_string())
}

impl SqliteStateStore {
    /// Open or create the state database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS run_states (
                 instance_id TEXT PRIMARY KEY,
                 graph_id TEXT NOT NULL,
                 status TEXT NOT NULL,
                 start_time TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 state_json TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_run_states_status
                 ON run_states(status, start_time);",
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ThinkflowError::Store(e.to_string()))
    }
}

impl StateStore for SqliteStateStore {
    fn save(&self, state: &ExecutionSnapshot) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO run_states (instance_id, graph_id, status, start_time, updated_at, state_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(instance_id) DO UPDATE SET
                 status = excluded.status,
                 updated_at = excluded.updated_at,
                 state_json = excluded.state_json",
            params![
                state.instance_id.as_str(),
                state.graph_id,
                state.status.as_str(),
                state.start_time.to_rfc3339(),
                chrono::Utc::now().to_rfc3339(),
                json,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn get(&self, id: &InstanceId) -> Result<Option<ExecutionSnapshot>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM run_states WHERE instance_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, id: &InstanceId) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM run_states WHERE instance_id = ?1",
                params![id.as_str()],
            )
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<ExecutionSnapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT state_json FROM run_states WHERE status = ?1 ORDER BY start_time ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![status.as_str()], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut states = Vec::new();
        for row in rows {
            let json = row.map_err(db_err)?;
            states.push(serde_json::from_str(&json)?);
        }
        Ok(states)
    }
}
