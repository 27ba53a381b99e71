/// Cold start: finding the index files of existing ledgers.
///
/// Index files sit two directory levels below a ledger directory. Staging
/// files of relocations that never completed are removed; the original index
/// they were copied from is still in place.
use index::{ledger_id_from_path, IndexFile, RLOC_SUFFIX};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::{LedgerHandle, StorageError};

/// Loads every index file below `dirs`, keyed by ledger id.
///
/// If a ledger has index files in several directories (an old copy survived
/// a relocation), the most recently modified one wins. Files whose header
/// says the ledger was deleted are removed again instead of loaded.
pub(crate) fn load_indexes(dirs: &[PathBuf]) -> Result<BTreeMap<u64, LedgerHandle>, StorageError> {
    let mut found: BTreeMap<u64, (SystemTime, PathBuf)> = BTreeMap::new();

    for dir in dirs {
        let mut files = Vec::new();
        collect_files(dir, 0, &mut files)?;
        for path in files {
            if path.to_string_lossy().ends_with(RLOC_SUFFIX) {
                match fs::remove_file(&path) {
                    Ok(()) => info!(path = %path.display(), "removed stale relocation file"),
                    Err(e) => warn!(path = %path.display(), error = %e, "cannot remove stale relocation file"),
                }
                continue;
            }
            let Some(ledger_id) = ledger_id_from_path(&path) else {
                continue;
            };
            let modified = fs::metadata(&path)?.modified()?;
            match found.get(&ledger_id) {
                Some((seen, other)) if *seen >= modified => {
                    warn!(ledger_id, kept = %other.display(), ignored = %path.display(), "duplicate index file");
                }
                _ => {
                    if let Some((_, other)) = found.insert(ledger_id, (modified, path.clone())) {
                        warn!(ledger_id, kept = %path.display(), ignored = %other.display(), "duplicate index file");
                    }
                }
            }
        }
    }

    let mut ledgers = BTreeMap::new();
    for (ledger_id, (_, path)) in found {
        let mut index = IndexFile::open(&path)?;
        if index.header()?.explicitly_deleted {
            debug!(ledger_id, path = %path.display(), "removing index of deleted ledger");
            index.delete();
            continue;
        }
        ledgers.insert(ledger_id, Arc::new(Mutex::new(index)));
    }
    Ok(ledgers)
}

/// Collects files at most two subdirectory levels below `dir`.
fn collect_files(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) -> Result<(), StorageError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if depth < 2 {
                collect_files(&path, depth + 1, out)?;
            }
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}
