//! # Redo log
//!
//! A durable, append-only, CRC-protected log of mutations that have not yet
//! reached an on-disk tier. The engine appends one record per accepted write
//! while holding the snapshot read-side, replays the log at open, and resets
//! it after every successful flush publish — at which point everything the
//! log held is covered by a disk tier.
//!
//! ## On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! Records are `bincode` (fixed-int, little-endian) payloads. Replay stops
//! at the first length/CRC violation and truncates the file there: a torn
//! tail write is indistinguishable from a crash mid-append and everything
//! before it is intact.
//!
//! ## Guarantees
//!
//! - Every `append()` is fsynced before returning.
//! - Replay never yields a corrupt record.
//! - `reset()` atomically forgets all records while keeping the header.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bincode::config::{Configuration, Fixint, LittleEndian};
use bincode::{decode_from_slice, encode_to_vec};
use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{info, warn};

const U32_SIZE: usize = std::mem::size_of::<u32>();

fn codec() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard().with_fixed_int_encoding()
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by redo-log operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error.
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Deserialization error.
    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Header failed integrity validation.
    #[error("invalid log header at {0}")]
    InvalidHeader(String),

    /// Record exceeds the configured maximum size.
    #[error("record size {0} exceeds limit")]
    RecordTooLarge(usize),

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Fixed metadata written at the start of the log file, CRC-protected.
#[derive(Debug, bincode::Encode, bincode::Decode)]
struct LogHeader {
    magic: [u8; 4],
    version: u32,
    max_record_size: u32,
}

impl LogHeader {
    const MAGIC: [u8; 4] = *b"TLOG";
    const VERSION: u32 = 1;
    const DEFAULT_MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;

    // magic + version + max_record_size, fixed-int encoded.
    const ENCODED_SIZE: usize = 12;
}

// ------------------------------------------------------------------------------------------------
// Record trait
// ------------------------------------------------------------------------------------------------

/// Marker for types the log can carry.
pub trait LogData: bincode::Encode + bincode::Decode<()> + Send + Sync {}
impl<T> LogData for T where T: bincode::Encode + bincode::Decode<()> + Send + Sync {}

// ------------------------------------------------------------------------------------------------
// Redo log core
// ------------------------------------------------------------------------------------------------

/// Append-only redo log carrying records of type `T`.
pub struct RedoLog<T: LogData> {
    file: Mutex<File>,
    path: PathBuf,
    max_record_size: u32,
    _marker: PhantomData<T>,
}

impl<T: LogData> RedoLog<T> {
    /// Open or create the log at `path`. An existing file has its header
    /// validated; an empty file gets a fresh header written and synced.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let max_record_size = if file.metadata()?.len() == 0 {
            let header = LogHeader {
                magic: LogHeader::MAGIC,
                version: LogHeader::VERSION,
                max_record_size: LogHeader::DEFAULT_MAX_RECORD_SIZE,
            };
            let bytes = encode_to_vec(&header, codec())?;
            let mut hasher = Crc32::new();
            hasher.update(&bytes);
            file.write_all(&bytes)?;
            file.write_all(&hasher.finalize().to_le_bytes())?;
            file.sync_all()?;
            info!(path = %path.display(), "created redo log");
            header.max_record_size
        } else {
            let mut bytes = vec![0u8; LogHeader::ENCODED_SIZE + U32_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut bytes)
                .map_err(|_| WalError::InvalidHeader(path.display().to_string()))?;

            let (header, _) =
                decode_from_slice::<LogHeader, _>(&bytes[..LogHeader::ENCODED_SIZE], codec())?;
            let stored = u32::from_le_bytes(
                bytes[LogHeader::ENCODED_SIZE..]
                    .try_into()
                    .map_err(|_| WalError::InvalidHeader(path.display().to_string()))?,
            );
            let mut hasher = Crc32::new();
            hasher.update(&bytes[..LogHeader::ENCODED_SIZE]);
            if header.magic != LogHeader::MAGIC
                || header.version != LogHeader::VERSION
                || hasher.finalize() != stored
            {
                return Err(WalError::InvalidHeader(path.display().to_string()));
            }
            header.max_record_size
        };

        Ok(Self {
            file: Mutex::new(file),
            path,
            max_record_size,
            _marker: PhantomData,
        })
    }

    /// Append one record and fsync.
    pub fn append(&self, record: &T) -> Result<(), WalError> {
        let bytes = encode_to_vec(record, codec())?;
        if bytes.len() > self.max_record_size as usize {
            return Err(WalError::RecordTooLarge(bytes.len()));
        }

        let len = (bytes.len() as u32).to_le_bytes();
        let mut hasher = Crc32::new();
        hasher.update(&len);
        hasher.update(&bytes);
        let crc = hasher.finalize().to_le_bytes();

        let mut file = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("log mutex poisoned".into()))?;
        file.write_all(&len)?;
        file.write_all(&bytes)?;
        file.write_all(&crc)?;
        file.sync_data()?;
        Ok(())
    }

    /// Read back every intact record. On the first torn or corrupt frame the
    /// file is truncated to the last intact boundary and replay stops.
    pub fn replay(&self) -> Result<Vec<T>, WalError> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("log mutex poisoned".into()))?;
        let end = file.metadata()?.len();
        let mut offset = (LogHeader::ENCODED_SIZE + U32_SIZE) as u64;
        let mut records = Vec::new();

        file.seek(SeekFrom::Start(offset))?;
        while offset < end {
            let mut len_bytes = [0u8; U32_SIZE];
            if file.read_exact(&mut len_bytes).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > self.max_record_size as usize || offset + (U32_SIZE + len + U32_SIZE) as u64 > end
            {
                break;
            }

            let mut payload = vec![0u8; len];
            if file.read_exact(&mut payload).is_err() {
                break;
            }
            let mut crc_bytes = [0u8; U32_SIZE];
            if file.read_exact(&mut crc_bytes).is_err() {
                break;
            }

            let mut hasher = Crc32::new();
            hasher.update(&len_bytes);
            hasher.update(&payload);
            if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
                break;
            }

            let (record, _) = decode_from_slice::<T, _>(&payload, codec())?;
            records.push(record);
            offset += (U32_SIZE + len + U32_SIZE) as u64;
        }

        if offset < end {
            warn!(
                path = %self.path.display(),
                keep = offset,
                total = end,
                "truncating redo log at corrupt frame"
            );
            file.set_len(offset)?;
            file.sync_all()?;
        }
        Ok(records)
    }

    /// Forget all records; the header stays. Called after a successful flush
    /// publish, when the log's contents are covered by a disk tier.
    pub fn reset(&self) -> Result<(), WalError> {
        let file = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("log mutex poisoned".into()))?;
        file.set_len((LogHeader::ENCODED_SIZE + U32_SIZE) as u64)?;
        file.sync_all()?;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
