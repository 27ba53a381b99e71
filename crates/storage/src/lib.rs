//! # Storage - Bookie Ledger Storage
//!
//! The coordinator that ties the [`entrylog`], [`index`] and [`writecache`]
//! crates into the interleaved ledger storage of a bookie.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌───────────────────────────────────────────────┐
//! │              LEDGER STORAGE                   │
//! │                                               │
//! │ write.rs → active WriteCache.put              │
//! │              |                                │
//! │              |  (half full? ask for checkpoint│
//! │              |   full?     flush and retry)   │
//! │              v                                │
//! │           flush() → swap caches               │
//! │              |                                │
//! │              v                                │
//! │        EntryLog.append → IndexFile.write      │
//! │              |                                │
//! │              v                                │
//! │     fsync log, fsync indexes, clear cache     │
//! │                                               │
//! │ read.rs → active → flushing → index → log     │
//! │            (first match wins)                 │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                              |
//! |-----------------|------------------------------------------------------|
//! | [`lib.rs`]      | `LedgerStorage` trait, storage struct, errors         |
//! | [`recovery`]    | loading index files, staging file cleanup            |
//! | [`write`]       | add, fence, master key, delete, flush, checkpoint    |
//! | [`read`]        | reads and accessors                                  |
//! | [`consistency`] | rate limited scan of every index against the log     |
//! | [`checkpoint`]  | checkpoint marks, `SyncThread`                        |
//! | [`dirs`]        | ledger directory selection                           |
//! | [`stats`]       | statistics sink                                      |
//!
//! ## Durability
//!
//! An entry is acknowledged once it sits in the write cache. It becomes
//! durable at the next checkpoint: the log is fsynced before the indexes that
//! point into it, and a cache is only cleared after every entry in it is
//! indexed. There is no journal here; entries still in the cache when the
//! process dies are gone.
pub mod checkpoint;
pub mod consistency;
pub mod dirs;
mod read;
mod recovery;
pub mod stats;
mod write;

use config::{ConfigError, StorageConfig};
use entrylog::{EntryLog, EntryLogError, EntryLogger};
use index::{IndexError, IndexFile};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use writecache::{WriteCache, WriteCacheError};

pub use checkpoint::{
    Checkpoint, CheckpointSource, Checkpointer, SequentialCheckpointSource, SyncThread,
};
pub use consistency::{rate_limiter, DetectedInconsistency, RateLimit, Unthrottled};
pub use dirs::{LedgerDirs, StaticLedgerDirs};
pub use stats::{NullStats, StatsSink};

/// Bytes of ledger id + entry id every entry starts with.
pub const ENTRY_HEADER_BYTES: usize = 16;

/// Errors surfaced by the ledger storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    EntryLog(#[from] EntryLogError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("ledger {0} does not exist")]
    NoLedger(u64),

    #[error("entry {entry_id} of ledger {ledger_id} does not exist")]
    NoEntry { ledger_id: u64, entry_id: u64 },

    #[error("ledger {0} is fenced")]
    LedgerFenced(u64),

    #[error("ledger {0} has been deleted")]
    LedgerDeleted(u64),

    /// Entry shorter than its ledger id + entry id header.
    #[error("invalid entry: {0} bytes, need at least {ENTRY_HEADER_BYTES}")]
    InvalidEntry(usize),

    #[error("write cache full: need {requested} bytes, {available} available after flush")]
    CacheFull { requested: usize, available: usize },

    #[error("ledger storage is shut down")]
    Closed,

    #[error("no writable ledger directory")]
    NoWritableDir,
}

impl StorageError {
    /// True when the ledger or entry simply is not there.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::NoLedger(_) | StorageError::NoEntry { .. }
        ) || matches!(self, StorageError::Index(e) if e.is_not_found())
    }
}

impl From<WriteCacheError> for StorageError {
    fn from(e: WriteCacheError) -> Self {
        match e {
            WriteCacheError::Full {
                requested,
                available,
            } => StorageError::CacheFull {
                requested,
                available,
            },
            WriteCacheError::Closed => StorageError::Closed,
        }
    }
}

/// Splits an entry into its `(ledger_id, entry_id)` header.
///
/// Both ids are big-endian u64s at the start of the entry.
pub fn parse_entry_header(entry: &[u8]) -> Result<(u64, u64), StorageError> {
    if entry.len() < ENTRY_HEADER_BYTES {
        return Err(StorageError::InvalidEntry(entry.len()));
    }
    let mut ledger = [0u8; 8];
    let mut id = [0u8; 8];
    ledger.copy_from_slice(&entry[0..8]);
    id.copy_from_slice(&entry[8..16]);
    Ok((u64::from_be_bytes(ledger), u64::from_be_bytes(id)))
}

/// Builds an entry: the 16 byte header followed by `body`.
pub fn make_entry(ledger_id: u64, entry_id: u64, body: &[u8]) -> Vec<u8> {
    let mut entry = Vec::with_capacity(ENTRY_HEADER_BYTES + body.len());
    entry.extend_from_slice(&ledger_id.to_be_bytes());
    entry.extend_from_slice(&entry_id.to_be_bytes());
    entry.extend_from_slice(body);
    entry
}

/// What the rest of a bookie needs from a ledger storage.
///
/// [`InterleavedLedgerStorage`] is the implementation; callers hold a
/// `dyn LedgerStorage` so other layouts can be swapped in.
pub trait LedgerStorage: Send + Sync {
    /// Stores an entry and returns its entry id. Refused on fenced ledgers.
    fn add_entry(&self, entry: &[u8]) -> Result<u64, StorageError>;

    /// Stores an entry written by ledger recovery; allowed on fenced ledgers.
    fn add_recovery_entry(&self, entry: &[u8]) -> Result<u64, StorageError>;

    fn read_entry(&self, ledger_id: u64, entry_id: u64) -> Result<Vec<u8>, StorageError>;

    fn set_master_key(&self, ledger_id: u64, key: &[u8]) -> Result<(), StorageError>;

    fn read_master_key(&self, ledger_id: u64) -> Result<Vec<u8>, StorageError>;

    /// Fences the ledger. Returns true if it was not fenced before.
    fn set_fenced(&self, ledger_id: u64) -> Result<bool, StorageError>;

    fn is_fenced(&self, ledger_id: u64) -> Result<bool, StorageError>;

    fn ledger_exists(&self, ledger_id: u64) -> bool;

    fn delete_ledger(&self, ledger_id: u64) -> Result<(), StorageError>;

    /// Persists everything accepted so far.
    fn flush(&self) -> Result<(), StorageError>;

    /// Persists everything accepted before `checkpoint` was handed out and
    /// returns the mark that is now durable.
    fn checkpoint(&self, checkpoint: Checkpoint) -> Result<Checkpoint, StorageError>;

    /// Cross-checks every indexed entry against the entry log. Fails only
    /// when an index itself cannot be read.
    fn local_consistency_check(
        &self,
        limiter: Option<&dyn RateLimit>,
    ) -> Result<Vec<DetectedInconsistency>, StorageError>;

    /// Starts background checkpointing, if a checkpointer is attached.
    fn start(&self);

    /// Flushes and refuses further writes.
    fn shutdown(&self) -> Result<(), StorageError>;
}

pub(crate) type LedgerHandle = Arc<Mutex<IndexFile>>;

/// Active and flushing write caches. Writers only ever touch `active`.
#[derive(Debug)]
pub(crate) struct CachePair {
    pub(crate) active: Arc<WriteCache>,
    pub(crate) flushing: Arc<WriteCache>,
}

/// Ledger storage interleaving all ledgers' payloads in one entry log, with
/// one index file per ledger.
///
/// # Write Path
///
/// 1. Parse ledger and entry id from the entry header.
/// 2. Create the ledger's (lazy) index if needed, refuse fenced ledgers.
/// 3. Copy the entry into the active write cache; flush and retry once if
///    the cache is full.
///
/// # Read Path
///
/// 1. Active write cache, then the cache being flushed.
/// 2. The ledger's index, then the entry log.
///
/// # Locking
///
/// `flush_lock` serializes flushes. `caches` is read-locked by every put and
/// cache lookup and write-locked only to swap the caches. Each index has its
/// own mutex, taken for every index access and held across a relocation. An
/// add holds its ledger's index mutex from the fence check through the cache
/// put, so an index mutex is always taken before `caches`. A ledger id is
/// marked deleted only while `ledgers` is write-locked.
pub struct InterleavedLedgerStorage<L: EntryLog = EntryLogger> {
    pub(crate) config: StorageConfig,
    pub(crate) entry_log: L,
    pub(crate) ledgers: RwLock<BTreeMap<u64, LedgerHandle>>,
    pub(crate) deleted: Mutex<HashSet<u64>>,
    /// Ledgers with index writes or header changes not yet fsynced.
    pub(crate) dirty: Mutex<HashSet<u64>>,
    pub(crate) caches: RwLock<CachePair>,
    pub(crate) flush_lock: Mutex<()>,
    pub(crate) checkpoint_requested: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) dirs: Arc<dyn LedgerDirs>,
    pub(crate) checkpoint_source: Arc<dyn CheckpointSource>,
    pub(crate) checkpointer: RwLock<Option<Arc<dyn Checkpointer>>>,
    pub(crate) stats: Arc<dyn StatsSink>,
}

impl<L: EntryLog> std::fmt::Debug for InterleavedLedgerStorage<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let caches = self.caches.read();
        f.debug_struct("InterleavedLedgerStorage")
            .field("ledger_dirs", &self.config.ledger_dirs)
            .field("ledgers", &self.ledgers.read().len())
            .field("active_cache_entries", &caches.active.count())
            .field("active_cache_bytes", &caches.active.size())
            .field("flushing_cache_entries", &caches.flushing.count())
            .field("cache_capacity", &caches.active.capacity())
            .field("dirty_indexes", &self.dirty.lock().len())
            .finish()
    }
}

impl InterleavedLedgerStorage<EntryLogger> {
    /// Opens the storage with the file-backed entry log in the first ledger
    /// directory, static directory selection and no statistics.
    pub fn open(
        config: StorageConfig,
        checkpoint_source: Arc<dyn CheckpointSource>,
    ) -> Result<Self, StorageError> {
        let dirs = Arc::new(StaticLedgerDirs::new(config.ledger_dirs.clone()));
        Self::open_with(config, dirs, checkpoint_source, Arc::new(NullStats))
    }

    pub fn open_with(
        config: StorageConfig,
        dirs: Arc<dyn LedgerDirs>,
        checkpoint_source: Arc<dyn CheckpointSource>,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        let log_dir = Self::entry_log_dir(&config)?;
        let entry_log = EntryLogger::open(&log_dir, config.entry_log_size_limit)?;
        Self::with_entry_log(config, entry_log, dirs, checkpoint_source, stats)
    }

    fn entry_log_dir(config: &StorageConfig) -> Result<PathBuf, StorageError> {
        config
            .ledger_dirs
            .first()
            .cloned()
            .ok_or(StorageError::Config(ConfigError::NoLedgerDirs))
    }
}

impl<L: EntryLog> InterleavedLedgerStorage<L> {
    /// Builds the storage around an already opened entry log.
    ///
    /// # Recovery Steps
    ///
    /// 1. Validate the configuration and create the ledger directories.
    /// 2. Remove `.rloc` files left by interrupted relocations.
    /// 3. Load every `.idx` file below the ledger directories.
    pub fn with_entry_log(
        config: StorageConfig,
        entry_log: L,
        dirs: Arc<dyn LedgerDirs>,
        checkpoint_source: Arc<dyn CheckpointSource>,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        for dir in &config.ledger_dirs {
            std::fs::create_dir_all(dir)?;
        }
        let ledgers = recovery::load_indexes(&config.ledger_dirs)?;
        info!(
            ledgers = ledgers.len(),
            dirs = config.ledger_dirs.len(),
            "ledger storage opened"
        );

        let capacity = config.write_cache_capacity;
        Ok(Self {
            config,
            entry_log,
            ledgers: RwLock::new(ledgers),
            deleted: Mutex::new(HashSet::new()),
            dirty: Mutex::new(HashSet::new()),
            caches: RwLock::new(CachePair {
                active: Arc::new(WriteCache::new(capacity)),
                flushing: Arc::new(WriteCache::new(capacity)),
            }),
            flush_lock: Mutex::new(()),
            checkpoint_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dirs,
            checkpoint_source,
            checkpointer: RwLock::new(None),
            stats,
        })
    }

    /// Attaches the checkpointer asked for checkpoints under cache pressure
    /// and started by [`LedgerStorage::start`].
    pub fn set_checkpointer(&self, checkpointer: Arc<dyn Checkpointer>) {
        *self.checkpointer.write() = Some(checkpointer);
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn entry_log(&self) -> &L {
        &self.entry_log
    }

    pub(crate) fn ledger(&self, ledger_id: u64) -> Option<LedgerHandle> {
        self.ledgers.read().get(&ledger_id).cloned()
    }

    /// Ledger handles in ledger id order.
    pub(crate) fn ledger_snapshot(&self) -> Vec<(u64, LedgerHandle)> {
        self.ledgers
            .read()
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect()
    }
}

impl<L: EntryLog> LedgerStorage for InterleavedLedgerStorage<L> {
    fn add_entry(&self, entry: &[u8]) -> Result<u64, StorageError> {
        self.add(entry, false)
    }

    fn add_recovery_entry(&self, entry: &[u8]) -> Result<u64, StorageError> {
        self.add(entry, true)
    }

    fn read_entry(&self, ledger_id: u64, entry_id: u64) -> Result<Vec<u8>, StorageError> {
        self.get(ledger_id, entry_id)
    }

    fn set_master_key(&self, ledger_id: u64, key: &[u8]) -> Result<(), StorageError> {
        InterleavedLedgerStorage::set_master_key(self, ledger_id, key)
    }

    fn read_master_key(&self, ledger_id: u64) -> Result<Vec<u8>, StorageError> {
        InterleavedLedgerStorage::read_master_key(self, ledger_id)
    }

    fn set_fenced(&self, ledger_id: u64) -> Result<bool, StorageError> {
        InterleavedLedgerStorage::set_fenced(self, ledger_id)
    }

    fn is_fenced(&self, ledger_id: u64) -> Result<bool, StorageError> {
        InterleavedLedgerStorage::is_fenced(self, ledger_id)
    }

    fn ledger_exists(&self, ledger_id: u64) -> bool {
        InterleavedLedgerStorage::ledger_exists(self, ledger_id)
    }

    fn delete_ledger(&self, ledger_id: u64) -> Result<(), StorageError> {
        InterleavedLedgerStorage::delete_ledger(self, ledger_id)
    }

    fn flush(&self) -> Result<(), StorageError> {
        InterleavedLedgerStorage::flush(self)
    }

    fn checkpoint(&self, checkpoint: Checkpoint) -> Result<Checkpoint, StorageError> {
        InterleavedLedgerStorage::checkpoint(self, checkpoint)
    }

    fn local_consistency_check(
        &self,
        limiter: Option<&dyn RateLimit>,
    ) -> Result<Vec<DetectedInconsistency>, StorageError> {
        InterleavedLedgerStorage::local_consistency_check(self, limiter)
    }

    fn start(&self) {
        if let Some(checkpointer) = self.checkpointer.read().clone() {
            checkpointer.start();
        }
    }

    fn shutdown(&self) -> Result<(), StorageError> {
        InterleavedLedgerStorage::shutdown(self)
    }
}

/// Best-effort flush on drop.
///
/// Errors are logged and dropped: whatever is still cached was never promised
/// to be durable.
impl<L: EntryLog> Drop for InterleavedLedgerStorage<L> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "flush on drop failed");
        }
    }
}

#[cfg(test)]
mod tests;
