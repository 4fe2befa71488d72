//! SQLite storage for connection attachments
//!
//! Lets the hibernating relay keep per-connection state outside the process
//! heap. Rows are keyed by connection id and hold the serialized attachment.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

use crate::connection::ConnectionId;
use crate::hibernation::{Attachment, AttachmentStore};

/// SQLite attachment store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database file.
    ///
    /// Connections never outlive the process, so rows left by a previous run
    /// are discarded.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        let stale = store.attachment_count()?;
        if stale > 0 {
            info!("Discarding {} attachments from a previous run", stale);
            store.clear()?;
        }
        Ok(store)
    }

    /// Create an in-memory database
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS attachments (
                connection_id INTEGER PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Attachment schema initialized");
        Ok(())
    }

    /// Number of stored attachments
    pub fn attachment_count(&self) -> Result<usize, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM attachments", [], |row| row.get(0))?;

        Ok(count as usize)
    }
}

impl AttachmentStore for SqliteStore {
    fn load(&self, id: ConnectionId) -> Result<Option<Attachment>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM attachments WHERE connection_id = ?1",
                params![row_key(id)],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(json) => Ok(Some(Attachment::from_json(&json)?)),
            None => Ok(None),
        }
    }

    fn save(&self, id: ConnectionId, attachment: &Attachment) -> Result<(), StorageError> {
        let json = attachment.to_json()?;
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        conn.execute(
            "INSERT OR REPLACE INTO attachments (connection_id, data, updated_at)
             VALUES (?1, ?2, ?3)",
            params![row_key(id), json, current_timestamp()],
        )?;

        Ok(())
    }

    fn remove(&self, id: ConnectionId) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        conn.execute(
            "DELETE FROM attachments WHERE connection_id = ?1",
            params![row_key(id)],
        )?;

        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        conn.execute("DELETE FROM attachments", [])?;
        Ok(())
    }
}

/// SQLite integers are signed
fn row_key(id: ConnectionId) -> i64 {
    id.as_u64() as i64
}

/// Get current Unix timestamp
fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Mutex lock was poisoned (a thread panicked while holding the lock)
    #[error("lock poisoned: a thread panicked while holding the lock")]
    LockPoisoned,

    #[error("corrupt attachment: {0}")]
    Corrupt(#[from] serde_json::Error),
}
