// src/core/storage/slot.rs

//! Per-slot read/write exclusion for cache stores.
//!
//! A slot may have many readers or one writer, never both. Access is held by
//! a `SlotGuard` and released when the guard is dropped, so a stream that
//! errors or is abandoned still gives the slot back.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writing: bool,
}

/// The lock for one cached variant.
#[derive(Debug, Default)]
pub struct SlotLock {
    state: Mutex<LockState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAccess {
    Read,
    Write,
}

impl SlotLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Takes a read guard unless the slot is being written.
    pub fn try_read(self: &Arc<Self>) -> Option<SlotGuard> {
        let mut state = self.state.lock();
        if state.writing {
            return None;
        }
        state.readers += 1;
        Some(SlotGuard {
            lock: Arc::clone(self),
            access: SlotAccess::Read,
            table: None,
        })
    }

    /// Takes the write guard if nobody is reading or writing the slot.
    pub fn try_write(self: &Arc<Self>) -> Option<SlotGuard> {
        let mut state = self.state.lock();
        if state.writing || state.readers > 0 {
            return None;
        }
        state.writing = true;
        Some(SlotGuard {
            lock: Arc::clone(self),
            access: SlotAccess::Write,
            table: None,
        })
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        !state.writing && state.readers == 0
    }

    pub fn is_writing(&self) -> bool {
        self.state.lock().writing
    }

    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }
}

/// Slot locks keyed by id. A lock lives in the table only while a guard
/// holds it.
#[derive(Debug, Default)]
pub struct SlotTable {
    locks: DashMap<String, Arc<SlotLock>>,
}

impl SlotTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_read(self: &Arc<Self>, id: String) -> Option<SlotGuard> {
        self.acquire(id, SlotAccess::Read)
    }

    pub fn try_write(self: &Arc<Self>, id: String) -> Option<SlotGuard> {
        self.acquire(id, SlotAccess::Write)
    }

    /// Number of slots currently held.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn acquire(self: &Arc<Self>, id: String, access: SlotAccess) -> Option<SlotGuard> {
        let lock = self.locks.entry(id.clone()).or_insert_with(SlotLock::new);
        let guard = match access {
            SlotAccess::Read => lock.try_read(),
            SlotAccess::Write => lock.try_write(),
        };
        guard.map(|mut guard| {
            guard.table = Some((Arc::clone(self), id));
            guard
        })
    }

    fn release(&self, id: &str) {
        self.locks.remove_if(id, |_, lock| lock.is_idle());
    }
}

/// Scoped access to a slot.
#[derive(Debug)]
pub struct SlotGuard {
    lock: Arc<SlotLock>,
    access: SlotAccess,
    table: Option<(Arc<SlotTable>, String)>,
}

impl SlotGuard {
    pub fn access(&self) -> SlotAccess {
        self.access
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        {
            let mut state = self.lock.state.lock();
            match self.access {
                SlotAccess::Read => state.readers = state.readers.saturating_sub(1),
                SlotAccess::Write => state.writing = false,
            }
        }
        if let Some((table, id)) = self.table.take() {
            table.release(&id);
        }
    }
}
