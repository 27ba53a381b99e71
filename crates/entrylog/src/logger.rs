use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::format::{
    self, decode_identity, decode_record, encode_record, IDENTITY_BYTES, LOG_HEADER_BYTES,
    MAX_PAYLOAD_SIZE,
};
use crate::{EntryLocation, EntryLog, EntryLogError, EntryLookupError};

/// The log file currently receiving appends.
struct ActiveLog {
    log_id: u64,
    file: File,
    /// Bytes known to be fully written; the next record goes here.
    size: u64,
    /// Reusable frame buffer.
    buf: Vec<u8>,
}

/// Append side of the logger. No file exists until the first append.
struct Writer {
    next_id: u64,
    active: Option<ActiveLog>,
}

/// File-backed [`EntryLog`].
///
/// Appends are serialized through the writer mutex and written with a
/// single `write_all`, so a record is visible to readers as soon as `append`
/// returns. Durability is deferred to [`flush`](EntryLog::flush), which the
/// storage calls at checkpoint time.
///
/// Reads go through a separate per-log handle so they never wait on the
/// writer, only on other reads of the same file.
pub struct EntryLogger {
    dir: PathBuf,
    size_limit: u64,
    writer: Mutex<Writer>,
    readers: RwLock<HashMap<u64, Arc<Mutex<File>>>>,
}

impl std::fmt::Debug for EntryLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let writer = self.writer.lock();
        f.debug_struct("EntryLogger")
            .field("dir", &self.dir)
            .field("size_limit", &self.size_limit)
            .field("active_log_id", &writer.active.as_ref().map(|a| a.log_id))
            .field("active_log_size", &writer.active.as_ref().map(|a| a.size))
            .finish()
    }
}

/// Path of log `log_id` inside `dir`.
pub fn log_path(dir: &Path, log_id: u64) -> PathBuf {
    dir.join(format!("{log_id:x}.log"))
}

impl EntryLogger {
    /// Opens the entry log directory.
    ///
    /// Existing log files are left untouched and nothing is written until
    /// the first append, which starts a log with the id after the highest
    /// one found. Records written by a previous run stay immutable, and a
    /// logger that is only read from leaves the directory as it found it.
    ///
    /// # Arguments
    ///
    /// * `dir` - directory holding the `*.log` files (created if missing).
    /// * `size_limit` - size in bytes after which the active log rolls over.
    pub fn open<P: AsRef<Path>>(dir: P, size_limit: u64) -> Result<Self, EntryLogError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let next_id = Self::list_log_ids(&dir)?
            .last()
            .map(|id| id + 1)
            .unwrap_or(0);
        info!(dir = %dir.display(), next_log_id = next_id, "opened entry logger");

        Ok(Self {
            dir,
            size_limit: size_limit.max(LOG_HEADER_BYTES + 1),
            writer: Mutex::new(Writer {
                next_id,
                active: None,
            }),
            readers: RwLock::new(HashMap::new()),
        })
    }

    fn list_log_ids(dir: &Path) -> Result<Vec<u64>, EntryLogError> {
        let mut ids: Vec<u64> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_str()?;
                let stem = name.strip_suffix(".log")?;
                u64::from_str_radix(stem, 16).ok()
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn create_log(dir: &Path, log_id: u64) -> Result<ActiveLog, EntryLogError> {
        let path = log_path(dir, log_id);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        format::write_header(&mut file, log_id)?;
        file.flush()?;
        debug!(log_id, "created entry log");
        Ok(ActiveLog {
            log_id,
            file,
            size: LOG_HEADER_BYTES,
            buf: Vec::with_capacity(1024),
        })
    }

    /// Returns the active log, sealing it first when `frame_len` more bytes
    /// would push a non-empty log past the size limit.
    fn active_for<'a>(
        &self,
        writer: &'a mut Writer,
        frame_len: u64,
    ) -> Result<&'a mut ActiveLog, EntryLogError> {
        if let Some(active) = writer.active.as_mut() {
            if active.size > LOG_HEADER_BYTES && active.size + frame_len > self.size_limit {
                active.file.sync_all()?;
                debug!(sealed = active.log_id, size = active.size, "rolled over entry log");
                writer.active = None;
            }
        }
        if writer.active.is_none() {
            let log = Self::create_log(&self.dir, writer.next_id)?;
            writer.next_id += 1;
            writer.active = Some(log);
        }
        writer
            .active
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no active entry log").into())
    }

    fn reader(&self, log_id: u64) -> Result<Arc<Mutex<File>>, EntryLogError> {
        if let Some(handle) = self.readers.read().get(&log_id) {
            return Ok(handle.clone());
        }
        let mut file = match File::open(log_path(&self.dir, log_id)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(EntryLogError::NoLog(log_id))
            }
            Err(e) => return Err(e.into()),
        };
        match format::read_header(&mut file) {
            Ok(id) if id == log_id => {}
            Ok(id) => {
                warn!(log_id, found = id, "entry log header names another log");
                return Err(EntryLogError::Corrupt { log_id, offset: 0 });
            }
            Err(e) => {
                warn!(log_id, error = %e, "unreadable entry log header");
                return Err(EntryLogError::Corrupt { log_id, offset: 0 });
            }
        }
        let handle = Arc::new(Mutex::new(file));
        Ok(self
            .readers
            .write()
            .entry(log_id)
            .or_insert(handle)
            .clone())
    }

    /// Reads `len` bytes at `location.offset`, refusing ranges outside the file.
    fn read_at(&self, location: EntryLocation, len: u64) -> Result<Vec<u8>, EntryLogError> {
        let handle = self.reader(location.log_id)?;
        let mut file = handle.lock();
        let file_len = file.metadata()?.len();
        let end = location.offset.checked_add(len);
        if location.offset < LOG_HEADER_BYTES || end.map_or(true, |end| end > file_len) {
            return Err(EntryLogError::OutOfRange {
                log_id: location.log_id,
                offset: location.offset,
            });
        }
        file.seek(SeekFrom::Start(location.offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn verify(
        &self,
        ledger_id: u64,
        entry_id: u64,
        location: EntryLocation,
    ) -> Result<(), EntryLogError> {
        let prefix = self.read_at(location, IDENTITY_BYTES as u64)?;
        let identity = decode_identity(&prefix)?;
        if identity.frame_len != location.length as u64 {
            return Err(EntryLogError::SizeMismatch {
                log_id: location.log_id,
                offset: location.offset,
                expected: location.length as u64,
                found: identity.frame_len,
            });
        }
        if identity.ledger_id != ledger_id || identity.entry_id != entry_id {
            return Err(EntryLogError::Mismatch {
                log_id: location.log_id,
                offset: location.offset,
                found_ledger: identity.ledger_id,
                found_entry: identity.entry_id,
            });
        }
        Ok(())
    }
}

impl EntryLog for EntryLogger {
    fn append(
        &self,
        ledger_id: u64,
        entry_id: u64,
        payload: &[u8],
    ) -> Result<EntryLocation, EntryLogError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EntryLogError::PayloadTooLarge(payload.len()));
        }

        let mut writer = self.writer.lock();
        let mut buf = writer
            .active
            .as_mut()
            .map(|a| std::mem::take(&mut a.buf))
            .unwrap_or_default();
        let frame_len = encode_record(&mut buf, ledger_id, entry_id, payload)? as u64;
        let active = self.active_for(&mut writer, frame_len)?;
        active.buf = buf;

        let offset = active.size;
        let written = active
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| active.file.write_all(&active.buf));
        if let Err(e) = written {
            // drop whatever part of the frame made it out
            if let Err(trunc) = active.file.set_len(offset) {
                warn!(log_id = active.log_id, offset, error = %trunc, "failed to truncate partial record");
            }
            return Err(e.into());
        }
        active.size += frame_len;

        Ok(EntryLocation {
            log_id: active.log_id,
            offset,
            length: frame_len as u32,
        })
    }

    fn read(&self, location: EntryLocation) -> Result<Vec<u8>, EntryLogError> {
        let frame = self.read_at(location, location.length as u64)?;
        decode_record(&frame)
            .map(|r| r.payload)
            .ok_or(EntryLogError::Corrupt {
                log_id: location.log_id,
                offset: location.offset,
            })
    }

    fn check_entry(
        &self,
        ledger_id: u64,
        entry_id: u64,
        location: EntryLocation,
    ) -> Result<(), EntryLookupError> {
        self.verify(ledger_id, entry_id, location)
            .map_err(|source| EntryLookupError {
                ledger_id,
                entry_id,
                source,
            })
    }

    fn flush(&self) -> Result<(), EntryLogError> {
        let mut writer = self.writer.lock();
        if let Some(active) = writer.active.as_mut() {
            active.file.flush()?;
            active.file.sync_all()?;
        }
        Ok(())
    }
}
