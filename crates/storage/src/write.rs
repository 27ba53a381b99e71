/// Write path: adds, header changes, deletion, flush and checkpoint.
///
/// Entries are only copied into the active write cache here. A flush swaps
/// the caches, appends everything in the now-flushing cache to the entry log,
/// records the locations in the ledgers' indexes and fsyncs log and indexes
/// before clearing the flushed cache.
use entrylog::EntryLog;
use index::{index_path, IndexFile};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};
use writecache::{WriteCache, WriteCacheError};

use crate::{
    parse_entry_header, stats, Checkpoint, InterleavedLedgerStorage, LedgerHandle, StorageError,
};

/// Ledger directory an index file lives in: `{dir}/{b1}/{b0}/{id}.idx`.
pub(crate) fn ledger_dir_of(index_file: &Path) -> Option<PathBuf> {
    index_file.ancestors().nth(3).map(Path::to_path_buf)
}

impl<L: EntryLog> InterleavedLedgerStorage<L> {
    pub(crate) fn add(&self, entry: &[u8], recovery: bool) -> Result<u64, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let (ledger_id, entry_id) = parse_entry_header(entry)?;
        let handle = self.ledger_or_create(ledger_id)?;

        let mut flushed = false;
        let over_half = loop {
            // the fence may not change between the check and the put
            let result = {
                let mut index = handle.lock();
                if index.is_deleted() {
                    return Err(StorageError::LedgerDeleted(ledger_id));
                }
                if !recovery && index.is_fenced()? {
                    return Err(StorageError::LedgerFenced(ledger_id));
                }
                self.put_cached(ledger_id, entry_id, entry)
            };
            match result {
                Ok(over_half) => break over_half,
                Err(WriteCacheError::Full { .. }) if !flushed => {
                    debug!(ledger_id, entry_id, "write cache full, flushing");
                    self.flush()?;
                    flushed = true;
                }
                Err(e) => return Err(e.into()),
            }
        };
        if over_half {
            self.request_checkpoint();
        }

        self.stats.incr(stats::ADD_ENTRY, 1);
        Ok(entry_id)
    }

    /// Puts into the active cache. Returns whether the cache is now more
    /// than half full.
    fn put_cached(&self, ledger_id: u64, entry_id: u64, entry: &[u8]) -> Result<bool, WriteCacheError> {
        let caches = self.caches.read();
        caches.active.put(ledger_id, entry_id, entry)?;
        self.stats
            .gauge(stats::WRITE_CACHE_BYTES, caches.active.size() as u64);
        Ok(caches.active.size() > caches.active.capacity() / 2)
    }

    /// Asks the checkpointer for one checkpoint per filling cache.
    fn request_checkpoint(&self) {
        if self.checkpoint_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(checkpointer) = self.checkpointer.read().clone() {
            let mark = self.checkpoint_source.new_checkpoint();
            debug!(checkpoint = mark.0, "write cache over half full, requesting checkpoint");
            checkpointer.start_checkpoint(mark);
        }
    }

    /// Returns the ledger's handle, creating a lazy index for a new ledger.
    pub(crate) fn ledger_or_create(&self, ledger_id: u64) -> Result<LedgerHandle, StorageError> {
        if let Some(handle) = self.ledger(ledger_id) {
            return Ok(handle);
        }
        if self.deleted.lock().contains(&ledger_id) {
            return Err(StorageError::LedgerDeleted(ledger_id));
        }
        let dir = self
            .dirs
            .pick_writable_dir()
            .ok_or(StorageError::NoWritableDir)?;

        // deletion marks the id under the same write lock
        let mut ledgers = self.ledgers.write();
        if let Some(handle) = ledgers.get(&ledger_id) {
            return Ok(handle.clone());
        }
        if self.deleted.lock().contains(&ledger_id) {
            return Err(StorageError::LedgerDeleted(ledger_id));
        }
        debug!(ledger_id, dir = %dir.display(), "new ledger");
        let handle = Arc::new(Mutex::new(IndexFile::new(index_path(&dir, ledger_id), b"")));
        ledgers.insert(ledger_id, handle.clone());
        Ok(handle)
    }

    pub fn set_master_key(&self, ledger_id: u64, key: &[u8]) -> Result<(), StorageError> {
        let handle = self.ledger_or_create(ledger_id)?;
        handle.lock().set_master_key(key)?;
        self.dirty.lock().insert(ledger_id);
        Ok(())
    }

    /// Fences the ledger; the fence reaches the index file right away.
    pub fn set_fenced(&self, ledger_id: u64) -> Result<bool, StorageError> {
        let handle = self.ledger_or_create(ledger_id)?;
        let changed = {
            let mut index = handle.lock();
            let changed = index.set_fenced()?;
            if changed {
                index.flush_header()?;
            }
            changed
        };
        if changed {
            self.dirty.lock().insert(ledger_id);
            info!(ledger_id, "ledger fenced");
        }
        Ok(changed)
    }

    /// Drops the ledger and deletes its index. Entries of the ledger still in
    /// a write cache are discarded at the next flush.
    pub fn delete_ledger(&self, ledger_id: u64) -> Result<(), StorageError> {
        let handle = {
            let mut ledgers = self.ledgers.write();
            let handle = ledgers
                .remove(&ledger_id)
                .ok_or(StorageError::NoLedger(ledger_id))?;
            self.deleted.lock().insert(ledger_id);
            handle
        };
        self.dirty.lock().remove(&ledger_id);

        let removed = handle.lock().delete();
        info!(ledger_id, removed, "ledger deleted");
        Ok(())
    }

    /// Persists every entry accepted before the call.
    ///
    /// # Steps
    ///
    /// 1. Move indexes out of directories reported full.
    /// 2. Finish the flushing cache if an earlier flush failed halfway.
    /// 3. Swap caches under the cache write lock, so in-flight puts land
    ///    before the swap and later puts go to the fresh cache.
    /// 4. Drain the flushing cache into log and indexes, fsync, clear it.
    /// 5. Fsync indexes with pending header changes.
    pub fn flush(&self) -> Result<(), StorageError> {
        let _guard = self.flush_lock.lock();

        self.relocate_full_indexes()?;

        let pending = self.caches.read().flushing.clone();
        if !pending.is_empty() {
            warn!(entries = pending.count(), "finishing earlier interrupted flush");
            self.drain(&pending)?;
        }

        let flushing = {
            let mut caches = self.caches.write();
            let pair = &mut *caches;
            std::mem::swap(&mut pair.active, &mut pair.flushing);
            pair.flushing.clone()
        };
        self.checkpoint_requested.store(false, Ordering::Release);
        self.stats.gauge(stats::WRITE_CACHE_BYTES, 0);

        self.drain(&flushing)?;
        self.sync_dirty_indexes()?;
        self.stats.incr(stats::FLUSH, 1);
        Ok(())
    }

    /// Flushes for `checkpoint` and reports it durable.
    ///
    /// Any write accepted before the mark was taken is in one of the caches
    /// by now, and a flush drains both.
    pub fn checkpoint(&self, checkpoint: Checkpoint) -> Result<Checkpoint, StorageError> {
        self.flush()?;
        debug!(checkpoint = checkpoint.0, "checkpoint complete");
        Ok(checkpoint)
    }

    /// Flushes, closes the caches and detaches the checkpointer.
    pub fn shutdown(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.flush();
        {
            let caches = self.caches.read();
            caches.active.close();
            caches.flushing.close();
        }
        self.checkpointer.write().take();
        info!("ledger storage shut down");
        result
    }

    fn drain(&self, cache: &WriteCache) -> Result<(), StorageError> {
        let mut flushed = 0u64;
        cache.for_each(|ledger_id, entry_id, payload| -> Result<(), StorageError> {
            let Some(handle) = self.ledger(ledger_id) else {
                debug!(ledger_id, entry_id, "dropping cached entry of deleted ledger");
                return Ok(());
            };
            let location = self.entry_log.append(ledger_id, entry_id, payload)?;
            let mut index = handle.lock();
            if index.is_deleted() {
                return Ok(());
            }
            index.write(entry_id, location)?;
            self.dirty.lock().insert(ledger_id);
            flushed += 1;
            Ok(())
        })?;

        self.entry_log.flush()?;
        self.sync_dirty_indexes()?;
        cache.clear();
        self.stats.incr(stats::FLUSHED_ENTRIES, flushed);
        debug!(entries = flushed, "write cache flushed");
        Ok(())
    }

    /// Writes headers and fsyncs every dirty index.
    fn sync_dirty_indexes(&self) -> Result<(), StorageError> {
        let dirty: Vec<u64> = self.dirty.lock().drain().collect();
        for (i, ledger_id) in dirty.iter().enumerate() {
            let Some(handle) = self.ledger(*ledger_id) else {
                continue;
            };
            let result = {
                let mut index = handle.lock();
                if index.is_deleted() {
                    Ok(())
                } else {
                    index.flush()
                }
            };
            if let Err(e) = result {
                self.dirty.lock().extend(&dirty[i..]);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Moves every index living in a full directory into a writable one,
    /// including indexes whose file does not exist yet.
    ///
    /// The index mutex is held for the whole move, so nothing reads or
    /// writes that index meanwhile.
    fn relocate_full_indexes(&self) -> Result<(), StorageError> {
        for (ledger_id, handle) in self.ledger_snapshot() {
            let mut index = handle.lock();
            if index.is_deleted() {
                continue;
            }
            let Some(dir) = ledger_dir_of(index.path()) else {
                continue;
            };
            if !self.dirs.is_dir_full(&dir) {
                continue;
            }
            let new_dir = self
                .dirs
                .pick_writable_dir()
                .ok_or(StorageError::NoWritableDir)?;
            let target = index_path(&new_dir, ledger_id);
            // never written: point it at the new dir before the drain creates it
            if !index.retarget(&target)? {
                index.move_to_new_location(&target, u64::MAX)?;
            }
        }
        Ok(())
    }
}
