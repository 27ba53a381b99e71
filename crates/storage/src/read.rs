/// Read path and accessors.
///
/// Point reads check the active write cache first, then the cache being
/// flushed, then the ledger's index and the entry log. Both cache lookups
/// happen under one read lock on the cache pair, so a swap cannot slip in
/// between them; an entry leaves the flushing cache only after it is indexed.
use entrylog::{EntryLocation, EntryLog};
use index::IndexError;
use std::path::PathBuf;

use crate::{stats, InterleavedLedgerStorage, StorageError};

impl<L: EntryLog> InterleavedLedgerStorage<L> {
    /// Returns the entry stored at `(ledger_id, entry_id)`.
    ///
    /// # Errors
    ///
    /// [`StorageError::NoLedger`] / [`StorageError::NoEntry`] when nothing is
    /// there (see [`StorageError::is_not_found`]), other variants on I/O
    /// failure or corruption.
    pub fn get(&self, ledger_id: u64, entry_id: u64) -> Result<Vec<u8>, StorageError> {
        let handle = self
            .ledger(ledger_id)
            .ok_or(StorageError::NoLedger(ledger_id))?;
        self.stats.incr(stats::READ_ENTRY, 1);

        {
            let caches = self.caches.read();
            if let Some(entry) = caches.active.get(ledger_id, entry_id) {
                return Ok(entry);
            }
            if let Some(entry) = caches.flushing.get(ledger_id, entry_id) {
                return Ok(entry);
            }
        }

        let location = handle
            .lock()
            .read(entry_id)
            .map_err(|e| not_found_or(e, ledger_id, entry_id))?;
        Ok(self.entry_log.read(location)?)
    }

    /// Where the index says the entry lives. Cached entries have no location
    /// yet.
    pub fn entry_location(
        &self,
        ledger_id: u64,
        entry_id: u64,
    ) -> Result<EntryLocation, StorageError> {
        let handle = self
            .ledger(ledger_id)
            .ok_or(StorageError::NoLedger(ledger_id))?;
        let mut index = handle.lock();
        index
            .read(entry_id)
            .map_err(|e| not_found_or(e, ledger_id, entry_id))
    }

    pub fn ledger_exists(&self, ledger_id: u64) -> bool {
        self.ledgers.read().contains_key(&ledger_id)
    }

    pub fn is_fenced(&self, ledger_id: u64) -> Result<bool, StorageError> {
        let handle = self
            .ledger(ledger_id)
            .ok_or(StorageError::NoLedger(ledger_id))?;
        let fenced = handle.lock().is_fenced()?;
        Ok(fenced)
    }

    pub fn read_master_key(&self, ledger_id: u64) -> Result<Vec<u8>, StorageError> {
        let handle = self
            .ledger(ledger_id)
            .ok_or(StorageError::NoLedger(ledger_id))?;
        let key = handle.lock().master_key()?;
        Ok(key)
    }

    /// File currently backing the ledger's index. It may not exist yet.
    pub fn index_file_path(&self, ledger_id: u64) -> Option<PathBuf> {
        let handle = self.ledger(ledger_id)?;
        let path = handle.lock().path().to_path_buf();
        Some(path)
    }

    /// Ids of every ledger not deleted, ascending.
    pub fn active_ledgers(&self) -> Vec<u64> {
        self.ledgers.read().keys().copied().collect()
    }

    /// Entries waiting in the write caches.
    pub fn cached_entries(&self) -> usize {
        let caches = self.caches.read();
        caches.active.count() + caches.flushing.count()
    }
}

fn not_found_or(e: IndexError, ledger_id: u64, entry_id: u64) -> StorageError {
    if e.is_not_found() {
        StorageError::NoEntry {
            ledger_id,
            entry_id,
        }
    } else {
        e.into()
    }
}
