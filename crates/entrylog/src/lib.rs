//! # Entry Log
//!
//! Append-only storage for entry payloads of the bookie ledger storage.
//!
//! Payloads of all ledgers are interleaved into a sequence of log files. A log
//! file only ever grows while it is the active one; once it reaches the size
//! limit the logger rolls over to a fresh file and the old one becomes
//! immutable. The location of every appended record is handed back to the
//! caller as an [`EntryLocation`] and stored in the owning ledger's index.
//!
//! See [`format`] for the on-disk layout.
//!
//! ## Example
//!
//! ```rust,no_run
//! use entrylog::{EntryLog, EntryLogger};
//!
//! let log = EntryLogger::open("data/logs", 64 * 1024 * 1024).unwrap();
//! let loc = log.append(1, 0, b"payload").unwrap();
//! assert_eq!(log.read(loc).unwrap(), b"payload");
//! log.check_entry(1, 0, loc).unwrap();
//! ```

pub mod format;
mod logger;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;
use thiserror::Error;

pub use format::{LogRecord, LOG_HEADER_BYTES, MAX_PAYLOAD_SIZE};
pub use logger::EntryLogger;

/// Size of an encoded [`EntryLocation`]: 8 (`log_id`) + 8 (`offset`) + 4 (`length`).
pub const LOCATION_BYTES: usize = 8 + 8 + 4;

/// Where a record lives inside the entry log.
///
/// `length` is the full frame length of the record, so a read is a single
/// positioned `read_exact`. Opaque to everything outside this crate except as
/// a value to store and hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryLocation {
    pub log_id: u64,
    pub offset: u64,
    pub length: u32,
}

impl EntryLocation {
    /// Encodes the location as a fixed-size slot.
    pub fn to_bytes(&self) -> [u8; LOCATION_BYTES] {
        let mut out = [0u8; LOCATION_BYTES];
        let mut w = &mut out[..];
        // writing into a correctly sized slice cannot fail
        let _ = w.write_u64::<LittleEndian>(self.log_id);
        let _ = w.write_u64::<LittleEndian>(self.offset);
        let _ = w.write_u32::<LittleEndian>(self.length);
        out
    }

    /// Decodes a slot written by [`to_bytes`](Self::to_bytes).
    ///
    /// Returns `None` for an empty slot. Records always start after the log
    /// header, so an offset of zero never names a real record.
    pub fn from_bytes(slot: &[u8; LOCATION_BYTES]) -> Option<Self> {
        let mut r = &slot[..];
        let log_id = r.read_u64::<LittleEndian>().ok()?;
        let offset = r.read_u64::<LittleEndian>().ok()?;
        let length = r.read_u32::<LittleEndian>().ok()?;
        if offset == 0 {
            return None;
        }
        Some(Self {
            log_id,
            offset,
            length,
        })
    }
}

/// Errors that can occur during entry log operations.
#[derive(Debug, Error)]
pub enum EntryLogError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The log file named by a location does not exist (anymore).
    #[error("entry log {0:x} not found")]
    NoLog(u64),

    /// The location points outside the log file.
    #[error("offset {offset} is out of range for entry log {log_id:x}")]
    OutOfRange { log_id: u64, offset: u64 },

    /// The record at the location failed CRC or length validation.
    #[error("corrupt record in entry log {log_id:x} at offset {offset}")]
    Corrupt { log_id: u64, offset: u64 },

    /// The record at the location belongs to a different entry.
    #[error("record in entry log {log_id:x} at offset {offset} is {found_ledger}:{found_entry}")]
    Mismatch {
        log_id: u64,
        offset: u64,
        found_ledger: u64,
        found_entry: u64,
    },

    /// The record at the location has a different length than recorded.
    #[error("record in entry log {log_id:x} at offset {offset} is {found} bytes, expected {expected}")]
    SizeMismatch {
        log_id: u64,
        offset: u64,
        expected: u64,
        found: u64,
    },

    /// A payload larger than [`MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// A failed existence check, carrying the address that was looked up.
#[derive(Debug, Error)]
#[error("lookup of entry {ledger_id}:{entry_id} failed: {source}")]
pub struct EntryLookupError {
    pub ledger_id: u64,
    pub entry_id: u64,
    #[source]
    pub source: EntryLogError,
}

/// The operations the ledger storage needs from an entry log.
///
/// [`EntryLogger`] is the file-backed implementation; the trait is the seam
/// that lets the storage run against alternative or instrumented logs.
pub trait EntryLog: Send + Sync {
    /// Appends a record and returns where it landed. Never overwrites bytes.
    fn append(
        &self,
        ledger_id: u64,
        entry_id: u64,
        payload: &[u8],
    ) -> Result<EntryLocation, EntryLogError>;

    /// Reads the payload stored at `location`.
    fn read(&self, location: EntryLocation) -> Result<Vec<u8>, EntryLogError>;

    /// Verifies that the record at `location` is `ledger_id:entry_id`
    /// without reading its payload.
    fn check_entry(
        &self,
        ledger_id: u64,
        entry_id: u64,
        location: EntryLocation,
    ) -> Result<(), EntryLookupError>;

    /// Makes every appended record durable.
    fn flush(&self) -> Result<(), EntryLogError>;
}

#[cfg(test)]
mod tests;
