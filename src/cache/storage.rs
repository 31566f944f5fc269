//! Cache storage backends: in-memory and SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use super::request::{RequestKey, Response, StoredResponse};
use super::traits::CacheStorage;
use crate::error::StoreError;

type Entries = BTreeMap<RequestKey, StoredResponse>;

/// Storage that lives only as long as the process.
///
/// Each store is a sorted map, so key listings come back in URL order.
#[derive(Default)]
pub struct MemoryStorage {
  caches: RwLock<BTreeMap<String, Entries>>,
  #[cfg(test)]
  unavailable: std::sync::atomic::AtomicBool,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent operation fail until reset.
  #[cfg(test)]
  pub(crate) fn set_unavailable(&self, unavailable: bool) {
    self
      .unavailable
      .store(unavailable, std::sync::atomic::Ordering::SeqCst);
  }

  fn check(&self) -> Result<(), StoreError> {
    #[cfg(test)]
    if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
      return Err(StoreError("storage offline".to_string()));
    }
    Ok(())
  }

  fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Entries>>, StoreError> {
    self.check()?;
    self
      .caches
      .read()
      .map_err(|e| StoreError(format!("Lock poisoned: {}", e)))
  }

  fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Entries>>, StoreError> {
    self.check()?;
    self
      .caches
      .write()
      .map_err(|e| StoreError(format!("Lock poisoned: {}", e)))
  }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
  async fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<StoredResponse>, StoreError> {
    let caches = self.read()?;
    Ok(caches.get(cache).and_then(|entries| entries.get(key)).cloned())
  }

  async fn put(&self, cache: &str, key: &RequestKey, value: StoredResponse) -> Result<(), StoreError> {
    let mut caches = self.write()?;
    caches
      .entry(cache.to_string())
      .or_default()
      .insert(key.clone(), value);
    Ok(())
  }

  async fn put_all(
    &self,
    cache: &str,
    entries: Vec<(RequestKey, StoredResponse)>,
  ) -> Result<(), StoreError> {
    // Single write guard, so readers see all of the batch or none of it
    let mut caches = self.write()?;
    let store = caches.entry(cache.to_string()).or_default();
    store.extend(entries);
    Ok(())
  }

  async fn delete(&self, cache: &str, key: &RequestKey) -> Result<bool, StoreError> {
    let mut caches = self.write()?;
    Ok(
      caches
        .get_mut(cache)
        .map(|entries| entries.remove(key).is_some())
        .unwrap_or(false),
    )
  }

  async fn keys(&self, cache: &str) -> Result<Vec<RequestKey>, StoreError> {
    let caches = self.read()?;
    Ok(
      caches
        .get(cache)
        .map(|entries| entries.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn cache_names(&self) -> Result<Vec<String>, StoreError> {
    let caches = self.read()?;
    Ok(caches.keys().cloned().collect())
  }

  async fn delete_cache(&self, cache: &str) -> Result<bool, StoreError> {
    let mut caches = self.write()?;
    Ok(caches.remove(cache).is_some())
  }
}

/// SQLite-based cache storage, durable across restarts.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| StoreError(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(&path).map_err(|e| {
      StoreError(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StoreError(format!("Failed to open in-memory database: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("swcache").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| StoreError(format!("Failed to run cache migrations: {}", e)))?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per named store
CREATE TABLE IF NOT EXISTS cache_names (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, replaced whole on every write
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (cache_name, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_name ON cache_entries(cache_name);
"#;

/// SHA256 of the key text, for a stable fixed-length primary key.
fn key_hash(key: &RequestKey) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

fn ensure_cache(conn: &Connection, cache: &str) -> Result<(), StoreError> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
      params![cache],
    )
    .map_err(|e| StoreError(format!("Failed to create cache {}: {}", cache, e)))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  cache: &str,
  key: &RequestKey,
  value: &StoredResponse,
) -> Result<(), StoreError> {
  let response = value.response();
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| StoreError(format!("Failed to serialize headers: {}", e)))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, key_hash, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        cache,
        key_hash(key),
        key.url(),
        response.status,
        headers,
        response.body,
        value.stored_at().to_rfc3339(),
      ],
    )
    .map_err(|e| StoreError(format!("Failed to store {}: {}", key, e)))?;

  Ok(())
}

#[async_trait]
impl CacheStorage for SqliteStorage {
  async fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<StoredResponse>, StoreError> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE cache_name = ? AND key_hash = ?",
        params![cache, key_hash(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| StoreError(format!("Failed to read {}: {}", key, e)))?;

    let Some((status, headers, body, stored_at)) = row else {
      return Ok(None);
    };

    let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
      .map_err(|e| StoreError(format!("Corrupt headers for {}: {}", key, e)))?;
    let stored_at = parse_datetime(&stored_at)?;

    Ok(Some(StoredResponse::restore(
      Response {
        status,
        headers,
        body,
      },
      stored_at,
    )))
  }

  async fn put(&self, cache: &str, key: &RequestKey, value: StoredResponse) -> Result<(), StoreError> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| StoreError(format!("Failed to begin transaction: {}", e)))?;

    ensure_cache(&tx, cache)?;
    insert_entry(&tx, cache, key, &value)?;

    tx.commit()
      .map_err(|e| StoreError(format!("Failed to commit transaction: {}", e)))
  }

  async fn put_all(
    &self,
    cache: &str,
    entries: Vec<(RequestKey, StoredResponse)>,
  ) -> Result<(), StoreError> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| StoreError(format!("Failed to begin transaction: {}", e)))?;

    ensure_cache(&tx, cache)?;
    for (key, value) in &entries {
      insert_entry(&tx, cache, key, value)?;
    }

    tx.commit()
      .map_err(|e| StoreError(format!("Failed to commit transaction: {}", e)))
  }

  async fn delete(&self, cache: &str, key: &RequestKey) -> Result<bool, StoreError> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ? AND key_hash = ?",
        params![cache, key_hash(key)],
      )
      .map_err(|e| StoreError(format!("Failed to delete {}: {}", key, e)))?;
    Ok(removed > 0)
  }

  async fn keys(&self, cache: &str) -> Result<Vec<RequestKey>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_name = ? ORDER BY rowid")
      .map_err(|e| StoreError(format!("Failed to prepare key query: {}", e)))?;

    let urls: Vec<String> = stmt
      .query_map(params![cache], |row| row.get(0))
      .map_err(|e| StoreError(format!("Failed to list keys of {}: {}", cache, e)))?
      .collect::<Result<_, _>>()
      .map_err(|e| StoreError(format!("Failed to list keys of {}: {}", cache, e)))?;

    urls
      .iter()
      .map(|url| RequestKey::from_stored(url).map_err(|e| StoreError(e.to_string())))
      .collect()
  }

  async fn cache_names(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_names ORDER BY rowid")
      .map_err(|e| StoreError(format!("Failed to prepare cache query: {}", e)))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| StoreError(format!("Failed to list caches: {}", e)))?
      .collect::<Result<Vec<String>, _>>()
      .map_err(|e| StoreError(format!("Failed to list caches: {}", e)))?;

    Ok(names)
  }

  async fn delete_cache(&self, cache: &str) -> Result<bool, StoreError> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| StoreError(format!("Failed to begin transaction: {}", e)))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache],
    )
    .map_err(|e| StoreError(format!("Failed to delete entries of {}: {}", cache, e)))?;
    let removed = tx
      .execute("DELETE FROM cache_names WHERE name = ?", params![cache])
      .map_err(|e| StoreError(format!("Failed to delete cache {}: {}", cache, e)))?;

    tx.commit()
      .map_err(|e| StoreError(format!("Failed to commit transaction: {}", e)))?;

    Ok(removed > 0)
  }
}

/// Parse an RFC 3339 timestamp written by `insert_entry`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError(format!("Failed to parse datetime '{}': {}", s, e)))
}
