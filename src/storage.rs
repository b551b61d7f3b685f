//! Durable storage trait and backends for persisted cache entries.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Trait for durable key-value storage backends.
///
/// Values are JSON documents keyed by cache key. No transactionality is
/// assumed across keys; each `load`/`store` stands alone.
pub trait PersistentStorage: Send + Sync {
  /// Read the stored value for a key, if any.
  fn load(&self, key: &str) -> Result<Option<Value>>;

  /// Write the value for a key, replacing any previous value.
  fn store(&self, key: &str, value: &Value) -> Result<()>;
}

/// Storage implementation that doesn't persist anything.
/// Used when durability is disabled - all operations are no-ops.
pub struct NoopStorage;

impl PersistentStorage for NoopStorage {
  fn load(&self, _key: &str) -> Result<Option<Value>> {
    Ok(None) // Always miss
  }

  fn store(&self, _key: &str, _value: &Value) -> Result<()> {
    Ok(()) // Discard
  }
}

/// In-process storage backed by a plain map.
///
/// Durable only for the lifetime of the process; mainly useful in tests and
/// as a stand-in while wiring up a real backend.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of stored keys.
  pub fn len(&self) -> usize {
    self.entries.lock().map(|m| m.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl PersistentStorage for MemoryStorage {
  fn load(&self, key: &str) -> Result<Option<Value>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn store(&self, key: &str, value: &Value) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), value.clone());
    Ok(())
  }
}

/// SQLite-based durable storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open storage database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Create a SQLite storage at an explicit path.
  pub fn open_at(path: &std::path::Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open storage database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Create an in-memory SQLite storage (dropped with the process).
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("rescache").join("resources.db"))
  }

  /// Run database migrations for the storage table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORAGE_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the storage table.
const STORAGE_SCHEMA: &str = r#"
-- Persisted cache entries (serialized JSON)
CREATE TABLE IF NOT EXISTS resource_entries (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl PersistentStorage for SqliteStorage {
  fn load(&self, key: &str) -> Result<Option<Value>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT data FROM resource_entries WHERE key = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let data: Option<Vec<u8>> = stmt.query_row(params![key], |row| row.get(0)).ok();

    match data {
      Some(bytes) => {
        let value = serde_json::from_slice(&bytes)
          .map_err(|e| eyre!("Failed to deserialize entry '{}': {}", key, e))?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  fn store(&self, key: &str, value: &Value) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let data = serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO resource_entries (key, data, cached_at)
         VALUES (?, ?, datetime('now'))",
        params![key, data],
      )
      .map_err(|e| eyre!("Failed to store entry: {}", e))?;

    Ok(())
  }
}
