//! Persistent key-value storage shared by every instance on the machine.
//!
//! Holds the metadata cache and the key-rotation lock flag. There is no
//! transactional guarantee across keys.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// `None` removes the key.
    fn set(&self, key: &str, value: Option<&str>) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut values = self.values.lock();
        match value {
            Some(v) => {
                values.insert(key.to_string(), v.to_string());
            }
            None => {
                values.remove(key);
            }
        }
        Ok(())
    }
}

/// SQLite-backed store. Several processes may open the same file.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS app_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);";

impl SqliteKvStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("state.sqlite3"))?;
        // Other instances may hold a write lock briefly.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM app_state WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        match value {
            Some(v) => {
                conn.execute(
                    "INSERT INTO app_state (key, value)
                     VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![key, v],
                )?;
            }
            None => {
                conn.execute("DELETE FROM app_state WHERE key = ?1", [key])?;
            }
        }
        Ok(())
    }
}
