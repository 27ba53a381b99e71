//! Index file header.
//!
//! A fixed [`HEADER_BYTES`] block at offset 0 of every index file, readable
//! on its own even when the body behind it is truncated or damaged:
//!
//! ```text
//! [magic: u32 LE = "BKLF"][version: u32 LE][state: u32 LE][key_len: u32 LE][master_key][zero padding]
//! ```
//!
//! State bits: `0x1` fenced, `0x2` explicitly deleted.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::IndexError;

/// Magic number identifying index files (ASCII "BKLF").
pub const INDEX_MAGIC: u32 = 0x424B_4C46;

/// Header version written by this code.
pub const CURRENT_HEADER_VERSION: u32 = 1;

/// Size of the header block; the body starts right after it.
pub const HEADER_BYTES: u64 = 1024;

/// Room left for the master key after the fixed fields.
pub const MAX_MASTER_KEY_BYTES: usize = HEADER_BYTES as usize - 16;

const STATE_FENCED: u32 = 0x1;
const STATE_EXPLICITLY_DELETED: u32 = 0x2;

/// In-memory form of the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    pub version: u32,
    pub master_key: Vec<u8>,
    pub fenced: bool,
    pub explicitly_deleted: bool,
}

impl IndexHeader {
    pub fn new(master_key: &[u8]) -> Self {
        Self {
            version: CURRENT_HEADER_VERSION,
            master_key: master_key.to_vec(),
            fenced: false,
            explicitly_deleted: false,
        }
    }

    fn state_bits(&self) -> u32 {
        let mut bits = 0;
        if self.fenced {
            bits |= STATE_FENCED;
        }
        if self.explicitly_deleted {
            bits |= STATE_EXPLICITLY_DELETED;
        }
        bits
    }

    /// Serializes the header into a zero-padded [`HEADER_BYTES`] block.
    pub fn encode(&self) -> Result<Vec<u8>, IndexError> {
        if self.master_key.len() > MAX_MASTER_KEY_BYTES {
            return Err(IndexError::MasterKeyTooLong(self.master_key.len()));
        }
        let mut buf = Vec::with_capacity(HEADER_BYTES as usize);
        buf.write_u32::<LittleEndian>(INDEX_MAGIC)?;
        buf.write_u32::<LittleEndian>(self.version)?;
        buf.write_u32::<LittleEndian>(self.state_bits())?;
        buf.write_u32::<LittleEndian>(self.master_key.len() as u32)?;
        buf.extend_from_slice(&self.master_key);
        buf.resize(HEADER_BYTES as usize, 0);
        Ok(buf)
    }

    /// Parses a header block.
    pub fn decode(block: &[u8]) -> Result<Self, IndexError> {
        if block.len() < HEADER_BYTES as usize {
            return Err(IndexError::BadHeader(format!(
                "header is {} bytes, expected {}",
                block.len(),
                HEADER_BYTES
            )));
        }
        let mut r = block;
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != INDEX_MAGIC {
            return Err(IndexError::BadHeader(format!("bad magic {magic:#010x}")));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version == 0 || version > CURRENT_HEADER_VERSION {
            return Err(IndexError::BadHeader(format!(
                "unsupported version {version}"
            )));
        }
        let state = r.read_u32::<LittleEndian>()?;
        let key_len = r.read_u32::<LittleEndian>()? as usize;
        if key_len > MAX_MASTER_KEY_BYTES {
            return Err(IndexError::BadHeader(format!(
                "master key length {key_len} exceeds {MAX_MASTER_KEY_BYTES}"
            )));
        }
        Ok(Self {
            version,
            master_key: r[..key_len].to_vec(),
            fenced: state & STATE_FENCED != 0,
            explicitly_deleted: state & STATE_EXPLICITLY_DELETED != 0,
        })
    }
}
