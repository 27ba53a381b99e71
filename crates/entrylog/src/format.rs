//! Entry log binary format constants and record framing helpers.
//!
//! ## File header (16 bytes)
//!
//! ```text
//! [magic: u32 LE = "BKLG"][version: u32 LE][log_id: u64 LE]
//! ```
//!
//! ## Record
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][ledger_id: u64 LE][entry_id: u64 LE][payload_len: u32 LE][payload]
//! ```
//!
//! `record_len` covers everything after itself (CRC included). The CRC covers
//! `ledger_id` through the end of the payload.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::io::{self, Read, Write};

/// Magic number identifying entry log files (ASCII "BKLG").
pub const LOG_MAGIC: u32 = 0x424B_4C47;

/// Current on-disk format version of entry log files.
pub const LOG_VERSION: u32 = 1;

/// Size of the file header: 4 (`magic`) + 4 (`version`) + 8 (`log_id`).
pub const LOG_HEADER_BYTES: u64 = 4 + 4 + 8;

/// Size of the framing in front of the ids: `record_len` + `crc32`.
pub const FRAME_PREFIX_BYTES: usize = 4 + 4;

/// Size of the record body before the payload: `ledger_id` + `entry_id` + `payload_len`.
pub const BODY_PREFIX_BYTES: usize = 8 + 8 + 4;

/// Bytes [`check_entry`](crate::EntryLog::check_entry) needs to identify a record.
pub const IDENTITY_BYTES: usize = FRAME_PREFIX_BYTES + 8 + 8;

/// Largest payload accepted by a single append (64 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Writes the entry log file header.
pub fn write_header<W: Write>(w: &mut W, log_id: u64) -> io::Result<()> {
    w.write_u32::<LittleEndian>(LOG_MAGIC)?;
    w.write_u32::<LittleEndian>(LOG_VERSION)?;
    w.write_u64::<LittleEndian>(log_id)?;
    Ok(())
}

/// Reads and validates the entry log file header, returning the embedded log id.
pub fn read_header<R: Read>(r: &mut R) -> io::Result<u64> {
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != LOG_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad entry log magic {magic:#010x}"),
        ));
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version > LOG_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported entry log version {version}"),
        ));
    }
    r.read_u64::<LittleEndian>()
}

/// Serializes one record into `buf` (cleared first). Returns the frame length.
pub fn encode_record(
    buf: &mut Vec<u8>,
    ledger_id: u64,
    entry_id: u64,
    payload: &[u8],
) -> io::Result<usize> {
    buf.clear();
    // frame prefix is filled in once the body is known
    buf.extend_from_slice(&[0u8; FRAME_PREFIX_BYTES]);
    buf.write_u64::<LittleEndian>(ledger_id)?;
    buf.write_u64::<LittleEndian>(entry_id)?;
    buf.write_u32::<LittleEndian>(payload.len() as u32)?;
    buf.extend_from_slice(payload);

    let mut hasher = Crc32::new();
    hasher.update(&buf[FRAME_PREFIX_BYTES..]);
    let crc = hasher.finalize();

    let record_len = (buf.len() - 4) as u32;
    buf[0..4].copy_from_slice(&record_len.to_le_bytes());
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
    Ok(buf.len())
}

/// The identifying prefix of a record, read without touching the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordIdentity {
    pub frame_len: u64,
    pub ledger_id: u64,
    pub entry_id: u64,
}

/// Parses the first [`IDENTITY_BYTES`] of a record.
pub fn decode_identity(mut prefix: &[u8]) -> io::Result<RecordIdentity> {
    let record_len = prefix.read_u32::<LittleEndian>()?;
    let _crc = prefix.read_u32::<LittleEndian>()?;
    let ledger_id = prefix.read_u64::<LittleEndian>()?;
    let entry_id = prefix.read_u64::<LittleEndian>()?;
    Ok(RecordIdentity {
        frame_len: record_len as u64 + 4,
        ledger_id,
        entry_id,
    })
}

/// A fully decoded and CRC-verified record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub payload: Vec<u8>,
}

/// Decodes a complete frame. Returns `None` if the CRC or lengths do not add up.
pub fn decode_record(frame: &[u8]) -> Option<LogRecord> {
    if frame.len() < FRAME_PREFIX_BYTES + BODY_PREFIX_BYTES {
        return None;
    }
    let mut r = frame;
    let record_len = r.read_u32::<LittleEndian>().ok()? as usize;
    if record_len + 4 != frame.len() {
        return None;
    }
    let crc = r.read_u32::<LittleEndian>().ok()?;

    let mut hasher = Crc32::new();
    hasher.update(r);
    if hasher.finalize() != crc {
        return None;
    }

    let ledger_id = r.read_u64::<LittleEndian>().ok()?;
    let entry_id = r.read_u64::<LittleEndian>().ok()?;
    let payload_len = r.read_u32::<LittleEndian>().ok()? as usize;
    if payload_len != r.len() {
        return None;
    }
    Some(LogRecord {
        ledger_id,
        entry_id,
        payload: r.to_vec(),
    })
}
