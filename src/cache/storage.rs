//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{body_digest, CachedEntry, StoredResponse};
use crate::lifecycle::WorkerState;
use crate::net::{RequestKey, Response, ResponseType};

/// Trait for cache storage backends.
///
/// A backend holds any number of named caches. Each cache maps a request
/// identity to one stored response; writing an existing key replaces the
/// whole entry.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist yet.
  fn open(&self, cache_name: &str) -> Result<()>;

  /// Whether the named cache exists.
  fn has(&self, cache_name: &str) -> Result<bool>;

  /// All cache names in creation order.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a cache and everything in it. Returns false if it did not exist.
  fn delete(&self, cache_name: &str) -> Result<bool>;

  /// Look up a request in one cache.
  fn match_in(&self, cache_name: &str, key: &RequestKey) -> Result<Option<StoredResponse>>;

  /// Look up a request across all caches, oldest cache first.
  fn match_any(&self, key: &RequestKey) -> Result<Option<StoredResponse>>;

  /// Store a response, creating the cache if needed.
  fn put(&self, cache_name: &str, key: &RequestKey, response: Response) -> Result<()>;

  /// Store a batch of responses: either all of them land or none do.
  fn put_all(&self, cache_name: &str, entries: Vec<(RequestKey, Response)>) -> Result<()>;

  /// Listing of a cache's entries in insertion order.
  fn entries(&self, cache_name: &str) -> Result<Vec<CachedEntry>>;

  /// Remove one entry. Returns false if it was not present.
  fn delete_entry(&self, cache_name: &str, key: &RequestKey) -> Result<bool>;

  /// Last settled lifecycle state recorded for a worker version.
  fn worker_state(&self, version: &str) -> Result<Option<WorkerState>>;

  /// Record the lifecycle state a worker version has settled in.
  fn set_worker_state(&self, version: &str, state: WorkerState) -> Result<()>;
}

/// Reject keys that can never be stored.
pub(super) fn ensure_cacheable(key: &RequestKey) -> Result<()> {
  if key.is_cacheable() {
    Ok(())
  } else {
    Err(eyre!("Request method '{}' is unsupported for caching", key.method))
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A private database that disappears with the process.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named caches; id doubles as creation order
CREATE TABLE IF NOT EXISTS caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by request identity hash
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_id INTEGER NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response_type TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    body_sha256 TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_id, key_hash),
    FOREIGN KEY (cache_id) REFERENCES caches(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(key_hash);

-- Host bookkeeping: where each worker version got to
CREATE TABLE IF NOT EXISTS worker_states (
    version TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

const RESPONSE_COLUMNS: &str =
  "e.response_type, e.response_url, e.status, e.status_text, e.headers, e.body, e.cached_at";

/// Create the cache if needed and return its id.
fn ensure_cache(conn: &Connection, cache_name: &str) -> Result<i64> {
  conn
    .execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", cache_name, e))?;

  conn
    .query_row(
      "SELECT id FROM caches WHERE name = ?",
      params![cache_name],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to look up cache {}: {}", cache_name, e))
}

fn insert_entry(conn: &Connection, cache_id: i64, key: &RequestKey, response: Response) -> Result<()> {
  ensure_cacheable(key)?;

  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
  let response_type = response.response_type.as_str();
  let response_url = response.url.clone();
  let status = response.status;
  let status_text = response.status_text.clone();
  let body = response.into_body();
  let digest = body_digest(&body);

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_id, key_hash, method, url, response_type, response_url, status, status_text,
          headers, body, body_sha256, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache_id,
        key.hash(),
        key.method,
        key.url,
        response_type,
        response_url,
        status,
        status_text,
        headers,
        body,
        digest
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

  Ok(())
}

type RawResponse = (String, String, u16, String, String, Vec<u8>, String);

fn read_raw_response(row: &Row<'_>) -> rusqlite::Result<RawResponse> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
  ))
}

fn decode_response(raw: RawResponse) -> Result<StoredResponse> {
  let (response_type, url, status, status_text, headers, body, cached_at) = raw;

  let response_type = ResponseType::parse(&response_type)
    .ok_or_else(|| eyre!("Unknown response type '{}' in cache", response_type))?;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

  Ok(StoredResponse {
    response_type,
    url,
    status,
    status_text,
    headers,
    body,
    cached_at: parse_datetime(&cached_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, cache_name: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_cache(&conn, cache_name)?;
    Ok(())
  }

  fn has(&self, cache_name: &str) -> Result<bool> {
    let conn = self.lock()?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT id FROM caches WHERE name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", cache_name, e))?;

    Ok(found.is_some())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, cache_name: &str) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute("DELETE FROM caches WHERE name = ?", params![cache_name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))?;

    Ok(removed > 0)
  }

  fn match_in(&self, cache_name: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    if !key.is_cacheable() {
      return Ok(None);
    }

    let conn = self.lock()?;

    let raw = conn
      .query_row(
        &format!(
          "SELECT {RESPONSE_COLUMNS} FROM cache_entries e
           INNER JOIN caches c ON c.id = e.cache_id
           WHERE c.name = ? AND e.key_hash = ?"
        ),
        params![cache_name, key.hash()],
        read_raw_response,
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {} in {}: {}", key, cache_name, e))?;

    raw.map(decode_response).transpose()
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<StoredResponse>> {
    if !key.is_cacheable() {
      return Ok(None);
    }

    let conn = self.lock()?;

    let raw = conn
      .query_row(
        &format!(
          "SELECT {RESPONSE_COLUMNS} FROM cache_entries e
           INNER JOIN caches c ON c.id = e.cache_id
           WHERE e.key_hash = ?
           ORDER BY c.id
           LIMIT 1"
        ),
        params![key.hash()],
        read_raw_response,
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {}: {}", key, e))?;

    raw.map(decode_response).transpose()
  }

  fn put(&self, cache_name: &str, key: &RequestKey, response: Response) -> Result<()> {
    ensure_cacheable(key)?;

    let conn = self.lock()?;
    let cache_id = ensure_cache(&conn, cache_name)?;
    insert_entry(&conn, cache_id, key, response)
  }

  fn put_all(&self, cache_name: &str, entries: Vec<(RequestKey, Response)>) -> Result<()> {
    let mut conn = self.lock()?;

    // Dropping the transaction without commit rolls everything back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let cache_id = ensure_cache(&tx, cache_name)?;
    for (key, response) in entries {
      insert_entry(&tx, cache_id, &key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entries(&self, cache_name: &str) -> Result<Vec<CachedEntry>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT e.method, e.url, e.status, e.response_type, length(e.body), e.body_sha256,
                e.cached_at
         FROM cache_entries e
         INNER JOIN caches c ON c.id = e.cache_id
         WHERE c.name = ?
         ORDER BY e.rowid",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows = stmt
      .query_map(params![cache_name], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, u16>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, i64>(4)?,
          row.get::<_, String>(5)?,
          row.get::<_, String>(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(
        |(method, url, status, response_type, size, digest, cached_at)| -> Result<CachedEntry> {
          Ok(CachedEntry {
            key: RequestKey { method, url },
            status,
            response_type: ResponseType::parse(&response_type)
              .ok_or_else(|| eyre!("Unknown response type '{}' in cache", response_type))?,
            size: usize::try_from(size).unwrap_or_default(),
            digest,
            cached_at: parse_datetime(&cached_at)?,
          })
        },
      )
      .collect()
  }

  fn delete_entry(&self, cache_name: &str, key: &RequestKey) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute(
        "DELETE FROM cache_entries
         WHERE key_hash = ? AND cache_id = (SELECT id FROM caches WHERE name = ?)",
        params![key.hash(), cache_name],
      )
      .map_err(|e| eyre!("Failed to delete entry {}: {}", key, e))?;

    Ok(removed > 0)
  }

  fn worker_state(&self, version: &str) -> Result<Option<WorkerState>> {
    let conn = self.lock()?;

    let state: Option<String> = conn
      .query_row(
        "SELECT state FROM worker_states WHERE version = ?",
        params![version],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read worker state for {}: {}", version, e))?;

    state
      .map(|s| {
        WorkerState::parse(&s).ok_or_else(|| eyre!("Unknown worker state '{}' for {}", s, version))
      })
      .transpose()
  }

  fn set_worker_state(&self, version: &str, state: WorkerState) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO worker_states (version, state, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![version, state.as_str()],
      )
      .map_err(|e| eyre!("Failed to record worker state for {}: {}", version, e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
