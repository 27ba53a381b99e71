//! # Write Cache
//!
//! Bounded in-memory staging area for entries that have been accepted but
//! not yet appended to the entry log.
//!
//! Payloads are copied into a single byte arena allocated up front; an
//! ordered index maps `(ledger_id, entry_id)` to a slice of that arena. The
//! cache never evicts: once the arena is full, [`WriteCache::put`] fails with
//! [`WriteCacheError::Full`] and the owner is expected to flush and clear it.
//!
//! All methods take `&self` and are safe to call from many threads. `clear`
//! is the exception in spirit: it is safe, but the owner should only call it
//! once the cached entries have been persisted elsewhere.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors returned by [`WriteCache::put`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteCacheError {
    /// Not enough arena space left for the payload.
    #[error("write cache full: need {requested} bytes, {available} available")]
    Full { requested: usize, available: usize },

    /// The cache has been closed and its arena released.
    #[error("write cache closed")]
    Closed,
}

/// A payload's position inside the arena.
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: usize,
    len: usize,
}

#[derive(Debug)]
struct Inner {
    arena: Vec<u8>,
    index: BTreeMap<(u64, u64), Slot>,
    closed: bool,
}

/// Fixed-capacity, thread-safe cache of entry payloads.
#[derive(Debug)]
pub struct WriteCache {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl WriteCache {
    /// Creates a cache whose arena holds `capacity` bytes of payload.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(Inner {
                arena: Vec::with_capacity(capacity),
                index: BTreeMap::new(),
                closed: false,
            }),
        }
    }

    /// Copies `payload` into the arena under `(ledger_id, entry_id)`.
    ///
    /// Re-putting an address replaces the visible payload; the space taken by
    /// the old copy is only reclaimed by [`clear`](Self::clear).
    pub fn put(&self, ledger_id: u64, entry_id: u64, payload: &[u8]) -> Result<(), WriteCacheError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(WriteCacheError::Closed);
        }

        let available = self.capacity - inner.arena.len();
        if payload.len() > available {
            return Err(WriteCacheError::Full {
                requested: payload.len(),
                available,
            });
        }

        let offset = inner.arena.len();
        // never reallocates: the arena was reserved at full capacity
        inner.arena.extend_from_slice(payload);
        inner.index.insert(
            (ledger_id, entry_id),
            Slot {
                offset,
                len: payload.len(),
            },
        );
        Ok(())
    }

    /// Returns a copy of the payload stored at exactly `(ledger_id, entry_id)`.
    pub fn get(&self, ledger_id: u64, entry_id: u64) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        inner
            .index
            .get(&(ledger_id, entry_id))
            .map(|slot| inner.arena[slot.offset..slot.offset + slot.len].to_vec())
    }

    /// Visits every cached entry in `(ledger_id, entry_id)` order.
    ///
    /// Stops at the first error returned by `visit` and hands it back.
    pub fn for_each<F, E>(&self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(u64, u64, &[u8]) -> Result<(), E>,
    {
        let inner = self.inner.read();
        for (&(ledger_id, entry_id), slot) in &inner.index {
            visit(
                ledger_id,
                entry_id,
                &inner.arena[slot.offset..slot.offset + slot.len],
            )?;
        }
        Ok(())
    }

    /// Number of cached entries.
    pub fn count(&self) -> usize {
        self.inner.read().index.len()
    }

    /// Arena bytes in use.
    pub fn size(&self) -> usize {
        self.inner.read().arena.len()
    }

    /// Total arena size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().index.is_empty()
    }

    /// Drops every entry but keeps the arena allocation for reuse.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.arena.clear();
        inner.index.clear();
    }

    /// Releases the arena. Later puts fail with [`WriteCacheError::Closed`]
    /// and gets miss.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        inner.closed = true;
        inner.index.clear();
        inner.arena = Vec::new();
    }
}
