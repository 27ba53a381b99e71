/// Ledger directory selection.
///
/// Deciding when a disk is full is somebody else's job; the storage only asks
/// where a new index file may go and whether the directory an index lives in
/// is still usable.
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

pub trait LedgerDirs: Send + Sync {
    /// Every configured ledger directory, full or not.
    fn all_dirs(&self) -> Vec<PathBuf>;

    /// A directory new index files may be created in, `None` if all are full.
    fn pick_writable_dir(&self) -> Option<PathBuf>;

    /// True if no new data should be written below `dir`.
    fn is_dir_full(&self, dir: &Path) -> bool;
}

/// A fixed set of directories whose fullness is set from the outside.
///
/// Writable directories are handed out round-robin.
#[derive(Debug)]
pub struct StaticLedgerDirs {
    dirs: Vec<PathBuf>,
    full: RwLock<HashSet<PathBuf>>,
    next: AtomicUsize,
}

impl StaticLedgerDirs {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            full: RwLock::new(HashSet::new()),
            next: AtomicUsize::new(0),
        }
    }

    pub fn mark_full(&self, dir: &Path) {
        if self.full.write().insert(dir.to_path_buf()) {
            info!(dir = %dir.display(), "ledger dir marked full");
        }
    }

    pub fn mark_writable(&self, dir: &Path) {
        if self.full.write().remove(dir) {
            info!(dir = %dir.display(), "ledger dir writable again");
        }
    }
}

impl LedgerDirs for StaticLedgerDirs {
    fn all_dirs(&self) -> Vec<PathBuf> {
        self.dirs.clone()
    }

    fn pick_writable_dir(&self) -> Option<PathBuf> {
        let full = self.full.read();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..self.dirs.len())
            .map(|i| &self.dirs[(start + i) % self.dirs.len()])
            .find(|d| !full.contains(*d))
            .cloned()
    }

    fn is_dir_full(&self, dir: &Path) -> bool {
        self.full.read().contains(dir)
    }
}
