// src/core/storage/memory.rs

//! An in-process cache store.
//!
//! Variants are grouped by resource and kept sorted by ascending `deleteAt`,
//! so expired variants always form a prefix and the eviction candidate of a
//! resource is its first idle variant. Bodies are buffered by the writer and
//! published in one step on `finish`.

use super::slot::{SlotGuard, SlotLock};
use super::{CacheStore, CacheWriter, CachedResponse, CachedValue};
use crate::core::clock::{SharedClock, system_clock};
use crate::core::errors::CacheError;
use crate::core::freshness::{VaryRecord, vary_matches};
use crate::core::key::CacheKey;
use crate::core::metrics;
use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Limits for a `MemoryStore`. `None` means unbounded.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Maximum number of stored variants.
    pub max_count: Option<usize>,
    /// Maximum total body bytes.
    pub max_size: Option<usize>,
    /// Maximum body bytes of a single variant.
    pub max_entry_size: Option<usize>,
    pub clock: SharedClock,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_count: None,
            max_size: None,
            max_entry_size: None,
            clock: system_clock(),
        }
    }
}

impl MemoryStoreConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        let limits = [
            ("max_count", self.max_count),
            ("max_size", self.max_size),
            ("max_entry_size", self.max_entry_size),
        ];
        for (name, limit) in limits {
            if limit == Some(0) {
                return Err(CacheError::InvalidArgument(format!(
                    "memory store {name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Published {
    value: CachedValue,
    chunks: Vec<Bytes>,
    size: usize,
}

#[derive(Debug)]
struct Slot {
    id: u64,
    method: Method,
    vary: Option<VaryRecord>,
    delete_at: i64,
    lock: Arc<SlotLock>,
    /// `None` while the first write into a new slot is still in progress.
    published: Option<Published>,
}

impl Slot {
    fn is_evictable(&self) -> bool {
        self.published.is_some() && self.lock.is_idle()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    resources: HashMap<String, Vec<Slot>>,
    /// Slots held, including ones reserved by in-flight writes.
    count: usize,
    /// Published body bytes.
    size: usize,
}

impl MemoryState {
    fn is_full(&self, config: &MemoryStoreConfig) -> bool {
        config.max_count.is_some_and(|max| self.count >= max)
            || config.max_size.is_some_and(|max| self.size >= max)
    }

    fn forget(&mut self, slot: &Slot) {
        self.count = self.count.saturating_sub(1);
        if let Some(published) = &slot.published {
            self.size = self.size.saturating_sub(published.size);
        }
    }

    /// Drops the idle expired prefix of one resource.
    fn sweep_resource(&mut self, resource: &str, now: i64) -> usize {
        let Some(slots) = self.resources.get_mut(resource) else {
            return 0;
        };
        let expired = slots.partition_point(|s| s.delete_at <= now);
        if expired == 0 {
            return 0;
        }
        let mut removed = Vec::new();
        let mut index = 0;
        slots.retain_mut(|slot| {
            let in_prefix = index < expired;
            index += 1;
            if in_prefix && slot.is_evictable() {
                removed.push(slot.published.as_ref().map_or(0, |p| p.size));
                false
            } else {
                true
            }
        });
        if slots.is_empty() {
            self.resources.remove(resource);
        }
        for size in &removed {
            self.count = self.count.saturating_sub(1);
            self.size = self.size.saturating_sub(*size);
        }
        removed.len()
    }

    fn sweep_all(&mut self, now: i64) -> usize {
        let resources: Vec<String> = self.resources.keys().cloned().collect();
        resources
            .iter()
            .map(|resource| self.sweep_resource(resource, now))
            .sum()
    }

    /// Removes the idle variant with the earliest `deleteAt` across all
    /// resources.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .resources
            .iter()
            .filter_map(|(resource, slots)| {
                slots
                    .iter()
                    .position(Slot::is_evictable)
                    .map(|index| (slots[index].delete_at, resource.clone(), index))
            })
            .min_by_key(|(delete_at, _, _)| *delete_at);

        let Some((_, resource, index)) = victim else {
            return false;
        };
        let Some(slots) = self.resources.get_mut(&resource) else {
            return false;
        };
        let slot = slots.remove(index);
        if slots.is_empty() {
            self.resources.remove(&resource);
        }
        self.forget(&slot);
        debug!("Evicted cached variant of '{}' to make room", resource);
        true
    }
}

#[derive(Debug)]
struct MemoryInner {
    config: MemoryStoreConfig,
    state: Mutex<MemoryState>,
    next_id: AtomicU64,
    evictions: AtomicU64,
}

/// A bounded in-memory `CacheStore`. Cloning shares the same storage.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(MemoryInner {
                config,
                state: Mutex::new(MemoryState::default()),
                next_id: AtomicU64::new(1),
                evictions: AtomicU64::new(0),
            }),
        })
    }

    /// An unbounded store on the system clock.
    pub fn unbounded() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                config: MemoryStoreConfig::default(),
                state: Mutex::new(MemoryState::default()),
                next_id: AtomicU64::new(1),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_full(&self) -> bool {
        self.inner.state.lock().is_full(&self.inner.config)
    }

    /// Total published body bytes.
    pub fn size(&self) -> usize {
        self.inner.state.lock().size
    }

    pub fn evictions(&self) -> u64 {
        self.inner.evictions.load(Ordering::Relaxed)
    }

    fn now(&self) -> i64 {
        self.inner.config.clock.now_ms()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        let now = self.now();
        let resource = key.resource_id();
        let mut state = self.inner.state.lock();
        state.sweep_resource(&resource, now);

        let Some(slots) = state.resources.get(&resource) else {
            return Ok(None);
        };
        let best = slots
            .iter()
            .filter(|slot| slot.method == *key.method() && !slot.lock.is_writing())
            .filter_map(|slot| slot.published.as_ref().map(|p| (slot, p)))
            .filter(|(_, p)| !p.value.is_expired(now))
            .filter(|(slot, _)| vary_matches(slot.vary.as_ref(), key.headers()))
            .max_by_key(|(_, p)| p.value.cached_at);

        let Some((slot, published)) = best else {
            return Ok(None);
        };
        let Some(guard) = slot.lock.try_read() else {
            return Ok(None);
        };
        Ok(Some(CachedResponse::new(
            published.value.clone(),
            published.chunks.clone(),
            Some(guard),
        )))
    }

    async fn create_write_stream(
        &self,
        key: &CacheKey,
        value: CachedValue,
    ) -> Result<Option<Box<dyn CacheWriter>>, CacheError> {
        value.validate()?;
        let now = self.now();
        let resource = key.resource_id();
        let config = &self.inner.config;
        let mut state = self.inner.state.lock();

        // Rewriting an existing variant replaces it in place.
        if let Some(slot) = state.resources.get(&resource).and_then(|slots| {
            slots
                .iter()
                .find(|s| s.method == *key.method() && s.vary == value.vary)
        }) {
            let Some(guard) = slot.lock.try_write() else {
                debug!("Refusing cache write for '{}': slot is busy", resource);
                return Ok(None);
            };
            return Ok(Some(Box::new(MemoryWriter::new(
                Arc::clone(&self.inner),
                resource,
                slot.id,
                false,
                value,
                guard,
            ))));
        }

        if state.is_full(config) {
            state.sweep_all(now);
            while state.is_full(config) {
                if !state.evict_one() {
                    debug!("Refusing cache write for '{}': store is full", resource);
                    return Ok(None);
                }
                self.inner.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::CACHE_EVICTIONS_TOTAL.inc();
            }
        }

        let lock = SlotLock::new();
        let Some(guard) = lock.try_write() else {
            return Err(CacheError::Internal("fresh slot lock is busy".into()));
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Slot {
            id,
            method: key.method().clone(),
            vary: value.vary.clone(),
            delete_at: value.delete_at,
            lock,
            published: None,
        };
        let slots = state.resources.entry(resource.clone()).or_default();
        let position = slots.partition_point(|s| s.delete_at <= slot.delete_at);
        slots.insert(position, slot);
        state.count += 1;

        Ok(Some(Box::new(MemoryWriter::new(
            Arc::clone(&self.inner),
            resource,
            id,
            true,
            value,
            guard,
        ))))
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut state = self.inner.state.lock();
        if let Some(slots) = state.resources.remove(&key.resource_id()) {
            for slot in &slots {
                state.forget(slot);
            }
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = self.now();
        Ok(self.inner.state.lock().sweep_all(now))
    }

    async fn len(&self) -> Result<usize, CacheError> {
        let state = self.inner.state.lock();
        Ok(state
            .resources
            .values()
            .flatten()
            .filter(|slot| slot.published.is_some())
            .count())
    }
}

/// Buffers a body and publishes it on `finish`.
struct MemoryWriter {
    inner: Arc<MemoryInner>,
    resource: String,
    slot_id: u64,
    /// The writer reserved a new slot, which it removes again if abandoned.
    is_new: bool,
    value: Option<CachedValue>,
    chunks: Vec<Bytes>,
    size: usize,
    overflowed: bool,
    finished: bool,
    _guard: SlotGuard,
}

impl MemoryWriter {
    fn new(
        inner: Arc<MemoryInner>,
        resource: String,
        slot_id: u64,
        is_new: bool,
        value: CachedValue,
        guard: SlotGuard,
    ) -> Self {
        Self {
            inner,
            resource,
            slot_id,
            is_new,
            value: Some(value),
            chunks: Vec::new(),
            size: 0,
            overflowed: false,
            finished: false,
            _guard: guard,
        }
    }

    fn too_large(&self) -> CacheError {
        CacheError::EntryTooLarge {
            limit: self.inner.config.max_entry_size.unwrap_or(usize::MAX),
        }
    }
}

#[async_trait]
impl CacheWriter for MemoryWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<(), CacheError> {
        if self.overflowed {
            return Err(self.too_large());
        }
        self.size += chunk.len();
        if self
            .inner
            .config
            .max_entry_size
            .is_some_and(|max| self.size > max)
        {
            self.overflowed = true;
            self.chunks.clear();
            return Err(self.too_large());
        }
        self.chunks.push(chunk);
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<(), CacheError> {
        if self.overflowed {
            return Err(self.too_large());
        }
        let Some(value) = self.value.take() else {
            return Err(CacheError::Internal("cache writer finished twice".into()));
        };
        let chunks = std::mem::take(&mut self.chunks);
        let size = self.size;

        let inner = Arc::clone(&self.inner);
        let mut state = inner.state.lock();
        let MemoryState {
            resources,
            size: total_size,
            ..
        } = &mut *state;
        let Some(slots) = resources.get_mut(&self.resource) else {
            // The resource was deleted while we were writing.
            self.finished = true;
            return Ok(());
        };
        let Some(index) = slots.iter().position(|s| s.id == self.slot_id) else {
            self.finished = true;
            return Ok(());
        };

        let mut slot = slots.remove(index);
        if let Some(old) = slot.published.take() {
            *total_size = total_size.saturating_sub(old.size);
        }
        *total_size += size;
        slot.delete_at = value.delete_at;
        slot.published = Some(Published {
            value,
            chunks,
            size,
        });
        let position = slots.partition_point(|s| s.delete_at <= slot.delete_at);
        slots.insert(position, slot);

        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if self.finished || !self.is_new {
            return;
        }
        let mut state = self.inner.state.lock();
        let Some(slots) = state.resources.get_mut(&self.resource) else {
            return;
        };
        let Some(index) = slots.iter().position(|s| s.id == self.slot_id) else {
            return;
        };
        slots.remove(index);
        if slots.is_empty() {
            state.resources.remove(&self.resource);
        }
        state.count = state.count.saturating_sub(1);
    }
}
