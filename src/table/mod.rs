//! # Immutable disk tier
//!
//! Each on-disk level of the engine is one **table**: an immutable, sorted,
//! range-addressable directory built bottom-up by [`TableBuilder`] and read
//! back by [`TableSnapshot`]. A table directory holds:
//!
//! - `index.tr` — the table file proper,
//! - `value.log` — raw value bytes, present only when the builder ran with
//!   `vblocksize > 0`.
//!
//! ## `index.tr` layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [ZBLOCK_LEN_LE][ZBLOCK_BYTES][ZBLOCK_CRC32_LE]
//! ...
//! [BLOOM_LEN_LE][BLOOM_BYTES][BLOOM_CRC32_LE]
//! [METADATA_LEN_LE][METADATA_BYTES][METADATA_CRC32_LE]
//! [PROPERTIES_LEN_LE][PROPERTIES_BYTES][PROPERTIES_CRC32_LE]
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]
//! [FOOTER_BYTES]
//! ```
//!
//! - **z-blocks** hold the sorted leaf cells; a cell carries its value
//!   inline, or a `(position, length)` reference into `value.log`.
//! - The **index block** maps each z-block's first key to its handle; point
//!   lookups binary-search it, scans walk it in order. It plays the role of
//!   the m-block region and is sized by usage, not by `mblocksize`.
//! - The **metadata block** is an opaque byte blob owned by the engine
//!   (settings snapshot, seqno, flush timestamp).
//! - Every block is CRC32-protected; the footer is fixed-size and
//!   self-checksummed.
//!
//! ## Concurrency
//!
//! Tables are immutable after the builder's atomic `.tmp` → final rename.
//! Reads go through a memory map (`mmap: true`) or positioned file reads,
//! both safe for any number of concurrent readers.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod iterator;

pub use builder::{BuildStats, TableBuilder};
pub use iterator::EntryIter;

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bincode::config::{Configuration, Fixint, LittleEndian};
use bincode::{decode_from_slice, encode_to_vec};
use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

use crate::engine::Entry;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const TABLE_FILE: &str = "index.tr";
pub(crate) const VLOG_FILE: &str = "value.log";

const TABLE_MAGIC: [u8; 4] = *b"TER1";
const TABLE_VERSION: u32 = 1;
const BLOOM_FP_RATE: f64 = 0.01;

// header: magic(4) + version(4) + mblocksize(4) + zblocksize(4) + vblocksize(4), then crc(4).
const HEADER_SIZE: usize = 20;
// footer: four 16-byte handles + total_size u64 + crc u32.
const FOOTER_SIZE: usize = 76;

const LEN_SIZE: usize = 4;
const CRC_SIZE: usize = 4;

pub(crate) fn codec() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard().with_fixed_int_encoding()
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error.
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Deserialization error.
    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// A block or footer failed its CRC32 check.
    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(String),

    /// Structural damage beyond a bad checksum.
    #[error("corrupt table: {0}")]
    Corrupt(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// On-disk structures
// ------------------------------------------------------------------------------------------------

#[derive(Debug, bincode::Encode, bincode::Decode)]
struct TableHeader {
    magic: [u8; 4],
    version: u32,
    mblocksize: u32,
    zblocksize: u32,
    vblocksize: u32,
}

/// One leaf cell. `vpos == u64::MAX` means the value is inline; anything
/// else references `value.log`.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub(crate) struct TableCell {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub seqno: u64,
    pub deleted: bool,
    pub vpos: u64,
    pub vlen: u32,
}

pub(crate) const VPOS_INLINE: u64 = u64::MAX;

/// Offset and size of one block inside `index.tr`, including its length
/// prefix and trailing checksum.
#[derive(Debug, Clone, Copy, bincode::Encode, bincode::Decode)]
pub(crate) struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

/// Index entry: the first key of a z-block plus the block's handle.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub(crate) struct IndexEntry {
    pub first_key: Vec<u8>,
    pub handle: BlockHandle,
}

/// Table-level statistics, written by the builder and used by the engine's
/// flush/compaction ratios.
#[derive(Debug, Clone, Default, bincode::Encode, bincode::Decode)]
pub struct TableProperties {
    /// Entries in the table, tombstones included.
    pub count: u64,

    /// Point tombstones among `count`.
    pub tombstones: u64,

    /// Lowest seqno stored.
    pub seqno_min: u64,

    /// Highest seqno stored.
    pub seqno_max: u64,

    /// Smallest key stored.
    pub key_min: Vec<u8>,

    /// Largest key stored.
    pub key_max: Vec<u8>,

    /// Total key bytes.
    pub keymem: u64,

    /// Total value bytes (logical, whether inline or in the value log).
    pub valmem: u64,

    /// Number of z-blocks written.
    pub n_zblocks: u32,

    /// Unix seconds at build completion.
    pub built_unix: u64,
}

#[derive(Debug, bincode::Encode, bincode::Decode)]
struct TableFooter {
    bloom: BlockHandle,
    metadata: BlockHandle,
    properties: BlockHandle,
    index: BlockHandle,
    total_size: u64,
    crc: u32,
}

// ------------------------------------------------------------------------------------------------
// Read source — mmap or positioned reads
// ------------------------------------------------------------------------------------------------

enum Source {
    Mapped(Mmap),
    Direct { file: File, len: u64 },
}

impl Source {
    fn open(path: &Path, mmap: bool) -> Result<Self, TableError> {
        let file = File::open(path)?;
        if mmap {
            let map = unsafe { Mmap::map(&file)? };
            Ok(Source::Mapped(map))
        } else {
            let len = file.metadata()?.len();
            Ok(Source::Direct { file, len })
        }
    }

    fn len(&self) -> u64 {
        match self {
            Source::Mapped(map) => map.len() as u64,
            Source::Direct { len, .. } => *len,
        }
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, TableError> {
        if offset + len as u64 > self.len() {
            return Err(TableError::Corrupt(format!(
                "read past end of file: {} + {} > {}",
                offset,
                len,
                self.len()
            )));
        }
        match self {
            Source::Mapped(map) => {
                Ok(map[offset as usize..offset as usize + len].to_vec())
            }
            Source::Direct { file, .. } => {
                let mut buf = vec![0u8; len];
                file.read_exact_at(&mut buf, offset)?;
                Ok(buf)
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TableSnapshot — the reader
// ------------------------------------------------------------------------------------------------

/// Size breakdown of one table, for the engine's flush/compaction ratios.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Key bytes stored.
    pub keymem: u64,
    /// Value bytes stored.
    pub valmem: u64,
    /// Number of z-blocks.
    pub n_zblocks: u32,
    /// Raw bytes on disk across all files of the tier.
    pub footprint: u64,
}

/// An open, immutable disk tier.
pub struct TableSnapshot {
    id: String,
    dir: PathBuf,
    source: Source,
    vlog: Option<Source>,
    bloom: Vec<u8>,
    metadata: Vec<u8>,
    properties: TableProperties,
    index: Vec<IndexEntry>,
    footprint: u64,
}

impl TableSnapshot {
    /// Open the table under `dir`, verifying header, footer and the blocks
    /// needed to serve reads. `mmap` selects the read path.
    pub fn open(dir: impl AsRef<Path>, mmap: bool) -> Result<Self, TableError> {
        let dir = dir.as_ref().to_path_buf();
        let id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TableError::Corrupt("table directory has no name".into()))?
            .to_string();

        let source = Source::open(&dir.join(TABLE_FILE), mmap)?;
        let file_len = source.len();
        if file_len < (HEADER_SIZE + CRC_SIZE + FOOTER_SIZE) as u64 {
            return Err(TableError::Corrupt(format!("file too small: {file_len}")));
        }

        // Header.
        let header_bytes = source.read(0, HEADER_SIZE + CRC_SIZE)?;
        let (header, _) =
            decode_from_slice::<TableHeader, _>(&header_bytes[..HEADER_SIZE], codec())?;
        let stored = u32::from_le_bytes(
            header_bytes[HEADER_SIZE..]
                .try_into()
                .map_err(|_| TableError::Corrupt("short header".into()))?,
        );
        if crc32(&header_bytes[..HEADER_SIZE]) != stored {
            return Err(TableError::ChecksumMismatch("header".into()));
        }
        if header.magic != TABLE_MAGIC || header.version != TABLE_VERSION {
            return Err(TableError::Corrupt("bad magic or version".into()));
        }

        // Footer.
        let footer_bytes = source.read(file_len - FOOTER_SIZE as u64, FOOTER_SIZE)?;
        let (footer, _) = decode_from_slice::<TableFooter, _>(&footer_bytes, codec())?;
        if crc32(&footer_bytes[..FOOTER_SIZE - CRC_SIZE]) != footer.crc {
            return Err(TableError::ChecksumMismatch("footer".into()));
        }
        if footer.total_size != file_len {
            return Err(TableError::Corrupt(format!(
                "footer records {} bytes, file has {}",
                footer.total_size, file_len
            )));
        }

        // Trailing blocks.
        let bloom = read_block(&source, &footer.bloom, "bloom")?;
        let metadata = read_block(&source, &footer.metadata, "metadata")?;
        let props_bytes = read_block(&source, &footer.properties, "properties")?;
        let (properties, _) = decode_from_slice::<TableProperties, _>(&props_bytes, codec())?;
        let index_bytes = read_block(&source, &footer.index, "index")?;
        let (index, _) = decode_from_slice::<Vec<IndexEntry>, _>(&index_bytes, codec())?;

        // Value log, when the builder produced one.
        let vlog_path = dir.join(VLOG_FILE);
        let vlog = if vlog_path.exists() {
            Some(Source::open(&vlog_path, mmap)?)
        } else {
            None
        };

        let footprint = file_len + vlog.as_ref().map(|v| v.len()).unwrap_or(0);
        debug!(id = %id, count = properties.count, footprint, "opened table");

        Ok(Self {
            id,
            dir,
            source,
            vlog,
            bloom,
            metadata,
            properties,
            index,
            footprint,
        })
    }

    /// Directory name of this tier, e.g. `myindex-15-1-4f2a...`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory path of this tier.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Entries in the table, tombstones included.
    pub fn count(&self) -> u64 {
        self.properties.count
    }

    /// Raw bytes on disk across the tier's files.
    pub fn footprint(&self) -> u64 {
        self.footprint
    }

    /// Approximate logical size: key and value bytes plus per-entry
    /// bookkeeping.
    pub fn payload(&self) -> u64 {
        self.properties.keymem + self.properties.valmem + self.properties.count * 24
    }

    /// Highest seqno stored in this tier.
    pub fn seqno(&self) -> u64 {
        self.properties.seqno_max
    }

    /// Table-level statistics.
    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    /// Key/value byte counts and block counts.
    pub fn info(&self) -> TableInfo {
        TableInfo {
            keymem: self.properties.keymem,
            valmem: self.properties.valmem,
            n_zblocks: self.properties.n_zblocks,
            footprint: self.footprint,
        }
    }

    /// The opaque metadata blob the builder was handed.
    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    /// Paths of the tier's value-log files, empty when values are inline.
    pub fn valuelogs(&self) -> Vec<PathBuf> {
        if self.vlog.is_some() {
            vec![self.dir.join(VLOG_FILE)]
        } else {
            Vec::new()
        }
    }

    /// Point lookup. Returns the newest version stored here, tombstones
    /// included; `None` when this tier knows nothing about the key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>, TableError> {
        if self.properties.count == 0
            || key < self.properties.key_min.as_slice()
            || key > self.properties.key_max.as_slice()
        {
            return Ok(None);
        }

        if !self.bloom.is_empty() {
            match Bloom::<[u8]>::from_slice(&self.bloom) {
                Ok(bloom) => {
                    if !bloom.check(key) {
                        return Ok(None);
                    }
                }
                Err(_) => {} // unusable filter: fall through to block search
            }
        }

        let Some(block_at) = self.block_for(key) else {
            return Ok(None);
        };
        let cells = self.read_zblock(block_at)?;

        // Cells are sorted by (key asc, seqno desc); the first hit is the
        // newest version in this tier.
        for cell in &cells {
            match cell.key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(self.cell_to_entry(cell)?)),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Index position of the z-block that may contain `key`.
    fn block_for(&self, key: &[u8]) -> Option<usize> {
        let at = self
            .index
            .partition_point(|entry| entry.first_key.as_slice() <= key);
        at.checked_sub(1)
    }

    pub(crate) fn n_blocks(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn read_zblock(&self, at: usize) -> Result<Vec<TableCell>, TableError> {
        let handle = self
            .index
            .get(at)
            .ok_or_else(|| TableError::Internal(format!("z-block {at} out of range")))?
            .handle;
        let bytes = read_block(&self.source, &handle, "z-block")?;
        let (cells, _) = decode_from_slice::<Vec<TableCell>, _>(&bytes, codec())?;
        Ok(cells)
    }

    pub(crate) fn cell_to_entry(&self, cell: &TableCell) -> Result<Entry, TableError> {
        let value = if cell.vpos == VPOS_INLINE {
            cell.value.clone()
        } else {
            let vlog = self
                .vlog
                .as_ref()
                .ok_or_else(|| TableError::Corrupt("cell references missing value log".into()))?;
            vlog.read(cell.vpos, cell.vlen as usize)?
        };
        Ok(Entry {
            key: cell.key.clone(),
            value,
            seqno: cell.seqno,
            deleted: cell.deleted,
        })
    }

    /// Full-table ordered iterator over entries, tombstones included.
    pub fn scan_entries(table: &std::sync::Arc<Self>) -> EntryIter {
        EntryIter::new(std::sync::Arc::clone(table))
    }

    /// Walk every block, verifying checksums, key ordering across the whole
    /// table, and agreement with the stored properties.
    pub fn validate(&self) -> Result<(), TableError> {
        let mut count = 0u64;
        let mut tombstones = 0u64;
        let mut last_key: Option<Vec<u8>> = None;
        let mut seqno_max = 0u64;

        for at in 0..self.index.len() {
            let cells = self.read_zblock(at)?;
            for cell in &cells {
                if let Some(prev) = &last_key {
                    if cell.key < *prev {
                        return Err(TableError::Corrupt(format!(
                            "key order violation in z-block {at}"
                        )));
                    }
                }
                last_key = Some(cell.key.clone());
                count += 1;
                if cell.deleted {
                    tombstones += 1;
                }
                seqno_max = seqno_max.max(cell.seqno);
            }
        }

        if count != self.properties.count
            || tombstones != self.properties.tombstones
            || seqno_max != self.properties.seqno_max
        {
            return Err(TableError::Corrupt(format!(
                "properties disagree with data: count {count}/{}, tombstones {tombstones}/{}, \
                 seqno {seqno_max}/{}",
                self.properties.count, self.properties.tombstones, self.properties.seqno_max
            )));
        }
        Ok(())
    }

    /// Remove the tier's directory and everything in it.
    pub fn destroy(&self) -> Result<(), TableError> {
        debug!(id = %self.id, "destroying table");
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Block plumbing
// ------------------------------------------------------------------------------------------------

pub(crate) fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Read a `[len][bytes][crc]` framed block and verify its checksum.
fn read_block(source: &Source, handle: &BlockHandle, what: &str) -> Result<Vec<u8>, TableError> {
    if handle.size < (LEN_SIZE + CRC_SIZE) as u64 {
        return Err(TableError::Corrupt(format!("{what} block too small")));
    }
    let raw = source.read(handle.offset, handle.size as usize)?;
    let len = u32::from_le_bytes(
        raw[..LEN_SIZE]
            .try_into()
            .map_err(|_| TableError::Corrupt(format!("{what} length prefix")))?,
    ) as usize;
    if LEN_SIZE + len + CRC_SIZE != raw.len() {
        return Err(TableError::Corrupt(format!("{what} length disagrees")));
    }
    let payload = &raw[LEN_SIZE..LEN_SIZE + len];
    let stored = u32::from_le_bytes(
        raw[LEN_SIZE + len..]
            .try_into()
            .map_err(|_| TableError::Corrupt(format!("{what} checksum bytes")))?,
    );
    if crc32(payload) != stored {
        return Err(TableError::ChecksumMismatch(what.to_string()));
    }
    Ok(payload.to_vec())
}

pub(crate) fn encode_header(mblocksize: u32, zblocksize: u32, vblocksize: u32) -> Result<Vec<u8>, TableError> {
    let header = TableHeader {
        magic: TABLE_MAGIC,
        version: TABLE_VERSION,
        mblocksize,
        zblocksize,
        vblocksize,
    };
    let mut bytes = encode_to_vec(&header, codec())?;
    let crc = crc32(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    Ok(bytes)
}

pub(crate) fn encode_footer(
    bloom: BlockHandle,
    metadata: BlockHandle,
    properties: BlockHandle,
    index: BlockHandle,
    offset_so_far: u64,
) -> Result<Vec<u8>, TableError> {
    let mut footer = TableFooter {
        bloom,
        metadata,
        properties,
        index,
        total_size: offset_so_far + FOOTER_SIZE as u64,
        crc: 0,
    };
    let probe = encode_to_vec(&footer, codec())?;
    debug_assert_eq!(probe.len(), FOOTER_SIZE);
    footer.crc = crc32(&probe[..FOOTER_SIZE - CRC_SIZE]);
    Ok(encode_to_vec(&footer, codec())?)
}

pub(crate) const BLOOM_FP: f64 = BLOOM_FP_RATE;
