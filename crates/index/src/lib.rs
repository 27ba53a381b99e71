//! # Index - Per-Ledger Index Files
//!
//! Every ledger owns one index file mapping its entry ids to the locations of
//! their payloads in the entry log.
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐ 0
//! │ HEADER (1024 bytes, see [`header`])          │
//! ├──────────────────────────────────────────────┤ 1024
//! │ slot 0: log_id u64 | offset u64 | length u32 │
//! │ slot 1                                       │
//! │ ...   (slot n at 1024 + n * 20)              │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The body is sparse: a slot that was never written reads back as zeros and
//! is reported as absent, never as a location.
//!
//! ## Relocation
//!
//! [`IndexFile::move_to_new_location`] moves the file into another directory
//! with the same temp-file + rename pattern the rest of the storage uses for
//! atomic file replacement: copy into `<target>.rloc`, fsync, remove any file
//! already at the target, rename, and only then switch over and drop the old
//! file.

pub mod header;

use entrylog::{EntryLocation, LOCATION_BYTES};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use header::{IndexHeader, CURRENT_HEADER_VERSION, HEADER_BYTES, MAX_MASTER_KEY_BYTES};

/// Size of one body slot.
pub const SLOT_BYTES: u64 = LOCATION_BYTES as u64;

/// Extension of index files.
pub const INDEX_EXTENSION: &str = "idx";

/// Suffix appended to the target name while a relocation is staged.
pub const RLOC_SUFFIX: &str = ".rloc";

/// Errors that can occur during index file operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// No location has been recorded for the entry.
    #[error("entry {entry_id} not found")]
    NoEntry { entry_id: u64 },

    /// A different, non-empty master key is already set.
    #[error("master key mismatch")]
    MasterKeyMismatch,

    /// The master key does not fit in the header.
    #[error("master key too long: {0} bytes (max {MAX_MASTER_KEY_BYTES})")]
    MasterKeyTooLong(usize),

    /// The entry id's slot lies beyond the addressable file size.
    #[error("entry id {0} out of range")]
    EntryIdOutOfRange(u64),

    /// The header could not be parsed.
    #[error("bad index header: {0}")]
    BadHeader(String),

    /// The relocation target is empty or names no file.
    #[error("invalid relocation target {0:?}")]
    InvalidTarget(PathBuf),

    /// The index has been deleted.
    #[error("index {0:?} has been deleted")]
    Deleted(PathBuf),

    /// A file already at the relocation target could not be removed.
    #[error("failed to remove existing file {path:?}: {source}")]
    RemoveTarget {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The staged copy could not be renamed onto the target.
    #[error("failed to rename {from:?} to {to:?}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl IndexError {
    /// True for "nothing recorded here", as opposed to a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexError::NoEntry { .. })
    }
}

/// Path of the index file for `ledger_id` under a ledger directory.
///
/// Files are spread over two levels of subdirectories keyed by the low two
/// bytes of the id: `{dir}/{b1:x}/{b0:x}/{ledger_id:x}.idx`.
pub fn index_path(dir: &Path, ledger_id: u64) -> PathBuf {
    dir.join(format!("{:x}", (ledger_id >> 8) & 0xff))
        .join(format!("{:x}", ledger_id & 0xff))
        .join(format!("{ledger_id:x}.{INDEX_EXTENSION}"))
}

/// Recovers the ledger id from an index file name.
pub fn ledger_id_from_path(path: &Path) -> Option<u64> {
    if path.extension()? != INDEX_EXTENSION {
        return None;
    }
    u64::from_str_radix(path.file_stem()?.to_str()?, 16).ok()
}

/// Path of the staging file used while relocating onto `target`.
pub fn rloc_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(RLOC_SUFFIX);
    target.with_file_name(name)
}

fn slot_position(entry_id: u64) -> Result<u64, IndexError> {
    entry_id
        .checked_mul(SLOT_BYTES)
        .and_then(|p| p.checked_add(HEADER_BYTES))
        .ok_or(IndexError::EntryIdOutOfRange(entry_id))
}

/// One ledger's index file.
///
/// Opening is lazy: nothing touches the disk until an operation needs the
/// file, and only writes create it. Header changes (master key, fence) are
/// kept in memory until [`flush_header`](Self::flush_header).
///
/// Not internally synchronized; the owner must serialize access (the ledger
/// storage keeps each index behind its own mutex).
#[derive(Debug)]
pub struct IndexFile {
    path: PathBuf,
    file: Option<File>,
    header: IndexHeader,
    header_dirty: bool,
    deleted: bool,
}

impl IndexFile {
    /// Creates an index object for `path` without touching the disk.
    ///
    /// If a file already exists there its header replaces `master_key` on
    /// first access.
    pub fn new<P: AsRef<Path>>(path: P, master_key: &[u8]) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            header: IndexHeader::new(master_key),
            header_dirty: false,
            deleted: false,
        }
    }

    /// Opens an existing index file and reads its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IndexError> {
        let mut index = Self::new(path, b"");
        if index.file(false)?.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("index file {} not found", index.path.display()),
            )
            .into());
        }
        Ok(index)
    }

    /// Returns the file currently backing this index.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the open file, opening or (with `create`) creating it first.
    ///
    /// `Ok(None)` means the file does not exist and `create` was false.
    fn file(&mut self, create: bool) -> Result<Option<&mut File>, IndexError> {
        if self.deleted {
            return Err(IndexError::Deleted(self.path.clone()));
        }
        if self.file.is_none() {
            match OpenOptions::new().read(true).write(true).open(&self.path) {
                Ok(mut f) => {
                    let mut block = vec![0u8; HEADER_BYTES as usize];
                    f.read_exact(&mut block).map_err(|e| {
                        if e.kind() == io::ErrorKind::UnexpectedEof {
                            IndexError::BadHeader("file shorter than header".to_string())
                        } else {
                            e.into()
                        }
                    })?;
                    self.header = IndexHeader::decode(&block)?;
                    self.header_dirty = false;
                    self.file = Some(f);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound && create => {
                    if let Some(parent) = self.path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let mut f = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create_new(true)
                        .open(&self.path)?;
                    f.write_all(&self.header.encode()?)?;
                    self.header_dirty = false;
                    debug!(path = %self.path.display(), "created index file");
                    self.file = Some(f);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.file.as_mut())
    }

    /// Loads the on-disk header, if any, so in-memory state is current.
    fn load(&mut self) -> Result<(), IndexError> {
        self.file(false).map(|_| ())
    }

    /// Records the log location of `entry_id`.
    pub fn write(&mut self, entry_id: u64, location: EntryLocation) -> Result<(), IndexError> {
        let pos = slot_position(entry_id)?;
        let file = self
            .file(true)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "index file vanished"))?;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(&location.to_bytes())?;
        Ok(())
    }

    /// Returns the log location recorded for `entry_id`.
    pub fn read(&mut self, entry_id: u64) -> Result<EntryLocation, IndexError> {
        let not_found = IndexError::NoEntry { entry_id };
        let pos = match slot_position(entry_id) {
            Ok(pos) => pos,
            Err(_) => return Err(not_found),
        };
        let Some(file) = self.file(false)? else {
            return Err(not_found);
        };
        if pos + SLOT_BYTES > file.metadata()?.len() {
            return Err(not_found);
        }
        let mut slot = [0u8; LOCATION_BYTES];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut slot)?;
        EntryLocation::from_bytes(&slot).ok_or(not_found)
    }

    /// Lists every recorded `(entry_id, location)` in entry id order.
    ///
    /// A partial slot at the end of the body is ignored.
    pub fn entries(&mut self) -> Result<Vec<(u64, EntryLocation)>, IndexError> {
        let Some(file) = self.file(false)? else {
            return Ok(Vec::new());
        };
        file.seek(SeekFrom::Start(HEADER_BYTES))?;
        let mut rdr = BufReader::new(file);
        let mut out = Vec::new();
        let mut slot = [0u8; LOCATION_BYTES];
        let mut entry_id = 0u64;
        loop {
            match rdr.read_exact(&mut slot) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if let Some(loc) = EntryLocation::from_bytes(&slot) {
                out.push((entry_id, loc));
            }
            entry_id += 1;
        }
        Ok(out)
    }

    /// Points an index whose file was never created at `path` instead.
    ///
    /// Returns `false`, changing nothing, once a backing file exists; such an
    /// index has to be moved with [`move_to_new_location`](Self::move_to_new_location).
    pub fn retarget<P: AsRef<Path>>(&mut self, path: P) -> Result<bool, IndexError> {
        if self.deleted {
            return Err(IndexError::Deleted(self.path.clone()));
        }
        if self.file.is_some() || self.path.try_exists()? {
            return Ok(false);
        }
        let path = path.as_ref();
        if path.as_os_str().is_empty() || path.file_name().is_none() {
            return Err(IndexError::InvalidTarget(path.to_path_buf()));
        }
        debug!(from = %self.path.display(), to = %path.display(), "retargeted unwritten index");
        self.path = path.to_path_buf();
        Ok(true)
    }

    /// Sets the master key.
    ///
    /// Succeeds if no key is set yet or `key` equals the current one; any
    /// other change is refused.
    pub fn set_master_key(&mut self, key: &[u8]) -> Result<(), IndexError> {
        if key.len() > MAX_MASTER_KEY_BYTES {
            return Err(IndexError::MasterKeyTooLong(key.len()));
        }
        self.load()?;
        if self.header.master_key.is_empty() {
            if !key.is_empty() {
                self.header.master_key = key.to_vec();
                self.header_dirty = true;
            }
            Ok(())
        } else if self.header.master_key == key {
            Ok(())
        } else {
            Err(IndexError::MasterKeyMismatch)
        }
    }

    pub fn master_key(&mut self) -> Result<Vec<u8>, IndexError> {
        self.load()?;
        Ok(self.header.master_key.clone())
    }

    /// Marks the ledger fenced. Returns true if this call changed the state.
    pub fn set_fenced(&mut self) -> Result<bool, IndexError> {
        self.load()?;
        if self.header.fenced {
            return Ok(false);
        }
        self.header.fenced = true;
        self.header_dirty = true;
        Ok(true)
    }

    pub fn is_fenced(&mut self) -> Result<bool, IndexError> {
        self.load()?;
        Ok(self.header.fenced)
    }

    /// Returns a copy of the in-memory header.
    pub fn header(&mut self) -> Result<IndexHeader, IndexError> {
        self.load()?;
        Ok(self.header.clone())
    }

    /// Writes pending header changes, creating the file if needed.
    pub fn flush_header(&mut self) -> Result<(), IndexError> {
        if !self.header_dirty {
            return Ok(());
        }
        let block = self.header.encode()?;
        let file = self
            .file(true)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "index file vanished"))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&block)?;
        self.header_dirty = false;
        Ok(())
    }

    /// Writes pending header changes and fsyncs the file.
    pub fn flush(&mut self) -> Result<(), IndexError> {
        self.flush_header()?;
        if let Some(file) = self.file(false)? {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Marks the index deleted and removes its file.
    ///
    /// Removal is best effort: a failure is logged and `false` returned, the
    /// index stays deleted either way. If the file survives, its header
    /// carries the explicit-deletion flag.
    pub fn delete(&mut self) -> bool {
        self.header.explicitly_deleted = true;
        if let Some(mut file) = self.file.take() {
            let persisted = self
                .header
                .encode()
                .and_then(|block| {
                    file.seek(SeekFrom::Start(0))?;
                    file.write_all(&block)?;
                    Ok(())
                });
            if let Err(e) = persisted {
                debug!(path = %self.path.display(), error = %e, "could not mark index deleted");
            }
        }
        self.deleted = true;
        self.header_dirty = false;

        match fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to remove deleted index file");
                false
            }
        }
    }

    /// Moves the index to `target`, carrying the header and at most
    /// `size_limit` bytes of body.
    ///
    /// # Steps
    ///
    /// 1. Reject an empty target or one without a file name.
    /// 2. Succeed without doing anything if the current file is gone or
    ///    `target` already is the current file.
    /// 3. Write the in-memory header plus `min(body, size_limit)` bytes of
    ///    body (rounded down to whole slots) to `<target>.rloc`, fsync it.
    /// 4. Remove any file already at `target`; abort if that fails.
    /// 5. Rename the staged file onto `target`; abort if that fails. A staged
    ///    file left behind is removed on the next storage startup.
    /// 6. Switch to `target`, then remove the old file (best effort).
    ///
    /// Any error leaves the index on its original file, fully usable.
    pub fn move_to_new_location(
        &mut self,
        target: &Path,
        size_limit: u64,
    ) -> Result<(), IndexError> {
        self.relocate_with(target, size_limit, |from, to| fs::rename(from, to))
    }

    /// [`move_to_new_location`](Self::move_to_new_location) with the final
    /// rename supplied by the caller.
    fn relocate_with<R>(
        &mut self,
        target: &Path,
        size_limit: u64,
        rename: R,
    ) -> Result<(), IndexError>
    where
        R: FnOnce(&Path, &Path) -> io::Result<()>,
    {
        if target.as_os_str().is_empty() || target.file_name().is_none() {
            return Err(IndexError::InvalidTarget(target.to_path_buf()));
        }
        if self.deleted {
            return Err(IndexError::Deleted(self.path.clone()));
        }

        let src_len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "index file gone, nothing to relocate");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if self.is_same_file(target) {
            debug!(path = %self.path.display(), "relocation target is the current file");
            return Ok(());
        }

        // make sure the header we stage reflects the file, not a stale default
        self.load()?;

        let staging = rloc_path(target);
        if let Err(e) = self.stage_copy(&staging, src_len, size_limit) {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }

        if target.exists() {
            fs::remove_file(target).map_err(|source| {
                warn!(target = %target.display(), error = %source, "cannot remove existing relocation target");
                let _ = fs::remove_file(&staging);
                IndexError::RemoveTarget {
                    path: target.to_path_buf(),
                    source,
                }
            })?;
        }

        rename(&staging, target).map_err(|source| IndexError::Rename {
            from: staging.clone(),
            to: target.to_path_buf(),
            source,
        })?;
        if let Some(parent) = target.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        let file = OpenOptions::new().read(true).write(true).open(target)?;
        let old_path = std::mem::replace(&mut self.path, target.to_path_buf());
        drop(self.file.replace(file));
        self.header_dirty = false;

        if let Err(e) = fs::remove_file(&old_path) {
            warn!(path = %old_path.display(), error = %e, "failed to remove relocated index file");
        }
        info!(from = %old_path.display(), to = %target.display(), "relocated index file");
        Ok(())
    }

    fn is_same_file(&self, target: &Path) -> bool {
        if target == self.path {
            return true;
        }
        match (fs::canonicalize(&self.path), fs::canonicalize(target)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    fn stage_copy(&self, staging: &Path, src_len: u64, size_limit: u64) -> Result<(), IndexError> {
        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent)?;
        }

        let body_len = src_len.saturating_sub(HEADER_BYTES);
        let mut copy_len = body_len.min(size_limit);
        copy_len -= copy_len % SLOT_BYTES;

        let mut src = File::open(&self.path)?;
        src.seek(SeekFrom::Start(HEADER_BYTES))?;
        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(staging)?;

        out.write_all(&self.header.encode()?)?;
        let copied = io::copy(&mut (&mut src).take(copy_len), &mut out)?;
        if copied != copy_len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("copied {copied} of {copy_len} body bytes to {}", staging.display()),
            )
            .into());
        }
        out.flush()?;
        out.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
