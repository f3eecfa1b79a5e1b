// src/core/storage/mod.rs

//! The cache store abstraction and its two implementations.
//!
//! A store keeps, per resource (`origin + path`), a set of variants that
//! differ by method and vary record. Reads and writes go through per-slot
//! locks (`slot`) so a reader never observes a half-written body.

pub mod memory;
pub mod slot;
pub mod sqlite;

use crate::core::errors::CacheError;
use crate::core::freshness::VaryRecord;
use crate::core::headers::Headers;
use crate::core::key::CacheKey;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pub use memory::{MemoryStore, MemoryStoreConfig};
pub use slot::{SlotGuard, SlotLock, SlotTable};
pub use sqlite::{PersistentStore, SqliteStoreConfig};

/// The metadata of a stored response. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedValue {
    pub status_code: u16,
    pub status_message: String,
    pub headers: Headers,
    pub vary: Option<VaryRecord>,
    pub etag: Option<String>,
    pub cached_at: i64,
    pub stale_at: i64,
    pub delete_at: i64,
}

impl CachedValue {
    pub fn validate(&self) -> Result<(), CacheError> {
        if !(100..=999).contains(&self.status_code) {
            return Err(CacheError::InvalidArgument(format!(
                "invalid status code {}",
                self.status_code
            )));
        }
        if self.stale_at > self.delete_at {
            return Err(CacheError::InvalidArgument(format!(
                "staleAt ({}) is after deleteAt ({})",
                self.stale_at, self.delete_at
            )));
        }
        Ok(())
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.delete_at
    }

    pub fn is_stale(&self, now: i64) -> bool {
        now >= self.stale_at
    }
}

/// A stored response returned by `CacheStore::get`.
///
/// Holds a read guard on its slot until dropped, detached, or fully streamed.
#[derive(Debug)]
pub struct CachedResponse {
    value: CachedValue,
    chunks: Vec<Bytes>,
    guard: Option<SlotGuard>,
}

impl CachedResponse {
    pub fn new(value: CachedValue, chunks: Vec<Bytes>, guard: Option<SlotGuard>) -> Self {
        Self {
            value,
            chunks,
            guard,
        }
    }

    pub fn value(&self) -> &CachedValue {
        &self.value
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    pub fn body_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn is_locked(&self) -> bool {
        self.guard.is_some()
    }

    /// Releases the read guard while keeping the data.
    pub fn detach(mut self) -> Self {
        self.guard = None;
        self
    }

    pub fn into_parts(self) -> (CachedValue, Vec<Bytes>) {
        (self.value, self.chunks)
    }

    /// Turns the response into a body stream that keeps the read guard until
    /// the last chunk has been taken or the stream is dropped.
    pub fn into_body(self) -> (CachedValue, CachedBody) {
        let body = CachedBody {
            chunks: self.chunks.into(),
            guard: self.guard,
        };
        (self.value, body)
    }
}

/// The chunks of a cached body, in order.
#[derive(Debug)]
pub struct CachedBody {
    chunks: VecDeque<Bytes>,
    guard: Option<SlotGuard>,
}

impl CachedBody {
    /// A body that holds no slot lock.
    pub fn detached(chunks: Vec<Bytes>) -> Self {
        Self {
            chunks: chunks.into(),
            guard: None,
        }
    }

    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }

    fn next_chunk(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front();
        if chunk.is_none() {
            self.guard = None;
        }
        chunk
    }
}

impl Stream for CachedBody {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.next_chunk())
    }
}

/// A streaming write into one slot. Nothing is visible to readers until
/// `finish` succeeds; dropping an unfinished writer discards it.
#[async_trait]
pub trait CacheWriter: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<(), CacheError>;

    async fn finish(self: Box<Self>) -> Result<(), CacheError>;
}

/// Storage for cached responses.
#[async_trait]
pub trait CacheStore: Send + Sync + Debug {
    /// The freshest unexpired variant matching the key's method and vary
    /// headers. Expired variants met along the way are purged.
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError>;

    /// Opens a write stream for the variant `value` describes. `Ok(None)`
    /// means the store refused: it is full and nothing can be evicted, or the
    /// slot is busy.
    async fn create_write_stream(
        &self,
        key: &CacheKey,
        value: CachedValue,
    ) -> Result<Option<Box<dyn CacheWriter>>, CacheError>;

    /// Removes every method and variant stored for the key's resource.
    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;

    /// Drops every entry past its `deleteAt`. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, CacheError>;

    /// The number of stored entries.
    async fn len(&self) -> Result<usize, CacheError>;
}

pub type SharedStore = Arc<dyn CacheStore>;

/// Writes a complete entry in one go. Returns `false` if the store refused it.
pub async fn write_entry(
    store: &dyn CacheStore,
    key: &CacheKey,
    value: CachedValue,
    chunks: &[Bytes],
) -> Result<bool, CacheError> {
    let Some(mut writer) = store.create_write_stream(key, value).await? else {
        return Ok(false);
    };
    for chunk in chunks {
        writer.write(chunk.clone()).await?;
    }
    writer.finish().await?;
    Ok(true)
}
