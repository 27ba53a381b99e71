use crate::*;
use anyhow::Result;
use config::StorageConfig;
use entrylog::{EntryLocation, EntryLog, EntryLogError, EntryLogger, EntryLookupError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub fn test_config(root: &Path) -> StorageConfig {
    StorageConfig {
        ledger_dirs: vec![root.join("ledgers")],
        entry_log_size_limit: 1024 * 1024,
        write_cache_capacity: 64 * 1024,
        flush_interval: Duration::from_secs(60),
        consistency_check_rate: 0,
    }
}

pub fn open(root: &Path) -> Result<InterleavedLedgerStorage> {
    open_config(test_config(root))
}

pub fn open_config(config: StorageConfig) -> Result<InterleavedLedgerStorage> {
    Ok(InterleavedLedgerStorage::open(
        config,
        Arc::new(SequentialCheckpointSource::new()),
    )?)
}

/// Entry `entry_id` of `ledger_id` with an "entry-N" body.
pub fn entry(ledger_id: u64, entry_id: u64) -> Vec<u8> {
    make_entry(ledger_id, entry_id, format!("entry-{entry_id}").as_bytes())
}

/// Adds entries `0..entries` to every ledger in `1..=ledgers`.
pub fn populate<S: LedgerStorage + ?Sized>(storage: &S, ledgers: u64, entries: u64) -> Result<()> {
    for l in 1..=ledgers {
        for e in 0..entries {
            storage.add_entry(&entry(l, e))?;
        }
    }
    Ok(())
}

pub fn count_files(dir: &Path, suffix: &str) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .map(|p| {
            if p.is_dir() {
                count_files(&p, suffix)
            } else if p.to_string_lossy().ends_with(suffix) {
                1
            } else {
                0
            }
        })
        .sum()
}

pub fn log_file(dir: &Path, log_id: u64) -> PathBuf {
    dir.join(format!("{log_id:x}.log"))
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Entry log whose lookups fail for a chosen set of addresses.
pub struct FaultyEntryLog {
    inner: EntryLogger,
    failing: Mutex<HashSet<(u64, u64)>>,
}

impl FaultyEntryLog {
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            inner: EntryLogger::open(dir, 1024 * 1024)?,
            failing: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail(&self, ledger_id: u64, entry_id: u64) {
        self.failing.lock().insert((ledger_id, entry_id));
    }
}

impl EntryLog for FaultyEntryLog {
    fn append(
        &self,
        ledger_id: u64,
        entry_id: u64,
        payload: &[u8],
    ) -> Result<EntryLocation, EntryLogError> {
        self.inner.append(ledger_id, entry_id, payload)
    }

    fn read(&self, location: EntryLocation) -> Result<Vec<u8>, EntryLogError> {
        self.inner.read(location)
    }

    fn check_entry(
        &self,
        ledger_id: u64,
        entry_id: u64,
        location: EntryLocation,
    ) -> Result<(), EntryLookupError> {
        if self.failing.lock().contains(&(ledger_id, entry_id)) {
            return Err(EntryLookupError {
                ledger_id,
                entry_id,
                source: EntryLogError::Io(io::Error::new(io::ErrorKind::Other, "injected")),
            });
        }
        self.inner.check_entry(ledger_id, entry_id, location)
    }

    fn flush(&self) -> Result<(), EntryLogError> {
        self.inner.flush()
    }
}

pub fn open_faulty(root: &Path) -> Result<InterleavedLedgerStorage<FaultyEntryLog>> {
    let config = test_config(root);
    let log = FaultyEntryLog::open(&config.ledger_dirs[0])?;
    let dirs = Arc::new(StaticLedgerDirs::new(config.ledger_dirs.clone()));
    Ok(InterleavedLedgerStorage::with_entry_log(
        config,
        log,
        dirs,
        Arc::new(SequentialCheckpointSource::new()),
        Arc::new(NullStats),
    )?)
}

/// Counts permits handed out.
#[derive(Default)]
pub struct CountingLimiter {
    pub permits: AtomicU64,
}

impl RateLimit for CountingLimiter {
    fn acquire(&self) {
        self.permits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Keeps the last value of every counter and gauge.
#[derive(Default)]
pub struct RecordingStats {
    values: Mutex<std::collections::HashMap<&'static str, u64>>,
}

impl RecordingStats {
    pub fn get(&self, name: &'static str) -> u64 {
        self.values.lock().get(name).copied().unwrap_or(0)
    }
}

impl StatsSink for RecordingStats {
    fn incr(&self, name: &'static str, delta: u64) {
        *self.values.lock().entry(name).or_insert(0) += delta;
    }

    fn gauge(&self, name: &'static str, value: u64) {
        self.values.lock().insert(name, value);
    }
}
