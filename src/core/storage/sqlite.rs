// src/core/storage/sqlite.rs

//! A durable cache store on SQLite.
//!
//! Several handles (or processes) may open the same file: the database runs
//! in WAL mode with a busy timeout. Slot locks are per handle; cross-handle
//! consistency comes from SQLite transactions. All database work runs on the
//! blocking thread pool.

use super::slot::{SlotGuard, SlotTable};
use super::{CacheStore, CacheWriter, CachedResponse, CachedValue};
use crate::core::clock::{SharedClock, system_clock};
use crate::core::errors::CacheError;
use crate::core::freshness::{VaryRecord, vary_matches};
use crate::core::headers::Headers;
use crate::core::key::CacheKey;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Bumped whenever the table layout changes; old tables are left alone.
pub const SCHEMA_VERSION: u32 = 3;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for a `PersistentStore`.
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Database file. `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
    /// Row count at which pruning kicks in.
    pub max_count: Option<usize>,
    /// Maximum body bytes of a single entry.
    pub max_entry_size: Option<usize>,
    pub clock: SharedClock,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_count: None,
            max_entry_size: None,
            clock: system_clock(),
        }
    }
}

impl SqliteStoreConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_count == Some(0) {
            return Err(CacheError::InvalidArgument(
                "sqlite store max_count must be greater than zero".into(),
            ));
        }
        if self.max_entry_size == Some(0) {
            return Err(CacheError::InvalidArgument(
                "sqlite store max_entry_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct SqliteInner {
    conn: Mutex<Connection>,
    config: SqliteStoreConfig,
    table: String,
    slots: Arc<SlotTable>,
}

/// A `CacheStore` persisted in a SQLite database. Cloning shares the handle.
#[derive(Debug, Clone)]
pub struct PersistentStore {
    inner: Arc<SqliteInner>,
}

struct StoredRow {
    value: CachedValue,
    body: Vec<u8>,
}

impl PersistentStore {
    pub fn open(config: SqliteStoreConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let conn = match &config.path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;
        if config.path.is_some() {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!("SQLite cache journal mode: {}", mode);
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let table = format!("cache_interceptor_v{SCHEMA_VERSION}");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                method TEXT NOT NULL,
                body BLOB NULL,
                deleteAt INTEGER NOT NULL,
                statusCode INTEGER NOT NULL,
                statusMessage TEXT NOT NULL,
                headers TEXT NULL,
                etag TEXT NULL,
                vary TEXT NULL,
                cachedAt INTEGER NOT NULL,
                staleAt INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_url ON {table}(url);
            CREATE INDEX IF NOT EXISTS idx_{table}_method ON {table}(method);
            CREATE INDEX IF NOT EXISTS idx_{table}_delete_at ON {table}(deleteAt);"
        ))?;

        match &config.path {
            Some(path) => info!("Opened SQLite cache store at {}", path.display()),
            None => info!("Opened in-memory SQLite cache store"),
        }

        Ok(Self {
            inner: Arc::new(SqliteInner {
                conn: Mutex::new(conn),
                config,
                table,
                slots: SlotTable::new(),
            }),
        })
    }

    /// Whether a row exists for the exact url and method, ignoring vary.
    pub async fn contains(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let inner = Arc::clone(&self.inner);
        let url = key.resource_id();
        let method = key.method().as_str().to_string();
        tokio::task::spawn_blocking(move || {
            let conn = inner.conn.lock();
            let found: Option<i64> = conn
                .query_row(
                    &format!(
                        "SELECT id FROM {} WHERE url = ?1 AND method = ?2 LIMIT 1",
                        inner.table
                    ),
                    params![url, method],
                    |row| row.get(0),
                )
                .optional()?;
            Ok::<_, CacheError>(found.is_some())
        })
        .await?
    }

    pub fn table_name(&self) -> &str {
        &self.inner.table
    }

    /// Slots currently held by readers or writers of this handle.
    pub fn held_slots(&self) -> usize {
        self.inner.slots.len()
    }

    fn now(&self) -> i64 {
        self.inner.config.clock.now_ms()
    }
}

fn slot_id(url: &str, method: &str, vary: Option<&VaryRecord>) -> Result<String, CacheError> {
    let vary = serde_json::to_string(&vary)?;
    Ok(format!("{url}\0{method}\0{vary}"))
}

fn decode_vary(raw: Option<String>) -> Result<Option<VaryRecord>, CacheError> {
    match raw {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(None),
    }
}

fn find_row(
    conn: &Connection,
    table: &str,
    url: &str,
    method: &str,
    request_headers: &Headers,
    now: i64,
) -> Result<Option<StoredRow>, CacheError> {
    conn.execute(
        &format!("DELETE FROM {table} WHERE url = ?1 AND deleteAt <= ?2"),
        params![url, now],
    )?;

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT body, deleteAt, statusCode, statusMessage, headers, etag, vary, cachedAt, staleAt
         FROM {table} WHERE url = ?1 AND method = ?2 ORDER BY deleteAt ASC"
    ))?;
    let mut rows = stmt.query(params![url, method])?;

    let mut best: Option<StoredRow> = None;
    while let Some(row) = rows.next()? {
        let vary = decode_vary(row.get(6)?)?;
        if !vary_matches(vary.as_ref(), request_headers) {
            continue;
        }
        let cached_at: i64 = row.get(7)?;
        if best.as_ref().is_some_and(|b| b.value.cached_at >= cached_at) {
            continue;
        }
        let headers: Option<String> = row.get(4)?;
        let headers = match headers {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Headers::new(),
        };
        let body: Option<Vec<u8>> = row.get(0)?;
        best = Some(StoredRow {
            value: CachedValue {
                status_code: row.get(2)?,
                status_message: row.get(3)?,
                headers,
                vary,
                etag: row.get(5)?,
                cached_at,
                stale_at: row.get(8)?,
                delete_at: row.get(1)?,
            },
            body: body.unwrap_or_default(),
        });
    }
    Ok(best)
}

/// Makes room once the table holds `max_count` rows: first drop expired rows,
/// and if there were none, the oldest tenth by `cachedAt`.
fn prune(conn: &Connection, table: &str, max_count: usize, now: i64) -> Result<usize, CacheError> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    if (count as usize) < max_count {
        return Ok(0);
    }

    let removed = conn.execute(
        &format!("DELETE FROM {table} WHERE deleteAt <= ?1"),
        params![now],
    )?;
    if removed > 0 {
        debug!("Pruned {} expired cache rows", removed);
        return Ok(removed);
    }

    let limit = (max_count / 10).max(1) as i64;
    let removed = conn.execute(
        &format!(
            "DELETE FROM {table} WHERE id IN (SELECT id FROM {table} ORDER BY cachedAt ASC LIMIT ?1)"
        ),
        params![limit],
    )?;
    debug!("Pruned {} oldest cache rows", removed);
    Ok(removed)
}

/// Updates the row of the writer's variant in place, or inserts a new one
/// after making room.
fn upsert(conn: &mut Connection, writer: &SqliteWriter, now: i64) -> Result<(), CacheError> {
    let SqliteWriter {
        inner,
        url,
        method,
        value,
        body,
        ..
    } = writer;
    let table = inner.table.as_str();
    let headers = serde_json::to_string(&value.headers)?;
    let vary = value.vary.as_ref().map(serde_json::to_string).transpose()?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let existing = {
        let mut stmt = tx.prepare_cached(&format!(
            "SELECT id, vary FROM {table} WHERE url = ?1 AND method = ?2"
        ))?;
        let mut rows = stmt.query(params![url, method])?;
        let mut found = None;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            if decode_vary(row.get(1)?)? == value.vary {
                found = Some(id);
                break;
            }
        }
        found
    };

    match existing {
        Some(id) => {
            tx.execute(
                &format!(
                    "UPDATE {table} SET body = ?1, deleteAt = ?2, statusCode = ?3, statusMessage = ?4,
                     headers = ?5, etag = ?6, cachedAt = ?7, staleAt = ?8 WHERE id = ?9"
                ),
                params![
                    body,
                    value.delete_at,
                    value.status_code,
                    value.status_message,
                    headers,
                    value.etag,
                    value.cached_at,
                    value.stale_at,
                    id
                ],
            )?;
        }
        None => {
            if let Some(max_count) = inner.config.max_count {
                prune(&tx, table, max_count, now)?;
            }
            tx.execute(
                &format!(
                    "INSERT INTO {table} (url, method, body, deleteAt, statusCode, statusMessage,
                     headers, etag, vary, cachedAt, staleAt)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    url,
                    method,
                    body,
                    value.delete_at,
                    value.status_code,
                    value.status_message,
                    headers,
                    value.etag,
                    vary,
                    value.cached_at,
                    value.stale_at
                ],
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[async_trait]
impl CacheStore for PersistentStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        let inner = Arc::clone(&self.inner);
        let url = key.resource_id();
        let method = key.method().as_str().to_string();
        let headers = key.headers().clone();
        let now = self.now();

        let row = {
            let url = url.clone();
            let method = method.clone();
            tokio::task::spawn_blocking(move || {
                let conn = inner.conn.lock();
                find_row(&conn, &inner.table, &url, &method, &headers, now)
            })
            .await??
        };
        let Some(row) = row else {
            return Ok(None);
        };

        let id = slot_id(&url, &method, row.value.vary.as_ref())?;
        let Some(guard) = self.inner.slots.try_read(id) else {
            debug!("Cache slot for '{}' is being written; skipping", url);
            return Ok(None);
        };

        let chunks = if row.body.is_empty() {
            Vec::new()
        } else {
            vec![Bytes::from(row.body)]
        };
        Ok(Some(CachedResponse::new(row.value, chunks, Some(guard))))
    }

    async fn create_write_stream(
        &self,
        key: &CacheKey,
        value: CachedValue,
    ) -> Result<Option<Box<dyn CacheWriter>>, CacheError> {
        value.validate()?;
        let url = key.resource_id();
        let method = key.method().as_str().to_string();
        let id = slot_id(&url, &method, value.vary.as_ref())?;
        let Some(guard) = self.inner.slots.try_write(id) else {
            debug!("Refusing cache write for '{}': slot is busy", url);
            return Ok(None);
        };
        Ok(Some(Box::new(SqliteWriter {
            inner: Arc::clone(&self.inner),
            url,
            method,
            value,
            body: Vec::new(),
            overflowed: false,
            _guard: guard,
        })))
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let inner = Arc::clone(&self.inner);
        let url = key.resource_id();
        tokio::task::spawn_blocking(move || {
            let conn = inner.conn.lock();
            conn.execute(
                &format!("DELETE FROM {} WHERE url = ?1", inner.table),
                params![url],
            )?;
            Ok::<_, CacheError>(())
        })
        .await??;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let inner = Arc::clone(&self.inner);
        let now = self.now();
        let removed = tokio::task::spawn_blocking(move || {
            let conn = inner.conn.lock();
            let removed = conn.execute(
                &format!("DELETE FROM {} WHERE deleteAt <= ?1", inner.table),
                params![now],
            )?;
            Ok::<_, CacheError>(removed)
        })
        .await??;
        Ok(removed)
    }

    async fn len(&self) -> Result<usize, CacheError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let conn = inner.conn.lock();
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", inner.table),
                [],
                |row| row.get(0),
            )?;
            Ok::<_, CacheError>(count as usize)
        })
        .await?
    }
}

struct SqliteWriter {
    inner: Arc<SqliteInner>,
    url: String,
    method: String,
    value: CachedValue,
    body: Vec<u8>,
    overflowed: bool,
    _guard: SlotGuard,
}

impl SqliteWriter {
    fn too_large(&self) -> CacheError {
        CacheError::EntryTooLarge {
            limit: self.inner.config.max_entry_size.unwrap_or(usize::MAX),
        }
    }
}

#[async_trait]
impl CacheWriter for SqliteWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<(), CacheError> {
        if self.overflowed {
            return Err(self.too_large());
        }
        if self
            .inner
            .config
            .max_entry_size
            .is_some_and(|max| self.body.len() + chunk.len() > max)
        {
            self.overflowed = true;
            self.body = Vec::new();
            return Err(self.too_large());
        }
        self.body.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), CacheError> {
        if self.overflowed {
            return Err(self.too_large());
        }
        let now = self.inner.config.clock.now_ms();
        // The write guard travels into the blocking task and is released once
        // the row is committed.
        tokio::task::spawn_blocking(move || {
            let inner = Arc::clone(&self.inner);
            let mut conn = inner.conn.lock();
            upsert(&mut conn, &self, now)
        })
        .await?
    }
}
