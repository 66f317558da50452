//! Bottom-up table builder.
//!
//! Consumes one sorted entry stream and writes a complete tier directory:
//! leaf z-blocks as they fill, then (at [`TableBuilder::finish`]) the bloom
//! filter, the engine's metadata blob, properties, the index block and the
//! footer. Both files are written to `.tmp` names and renamed into place, so
//! a crashed build never leaves a readable half-table — openers only ever
//! see fully renamed files.
//!
//! The input must be sorted by `(key asc, seqno desc)`. With
//! `tombstone_purge` enabled, deleted entries are dropped from the output
//! but still counted into the recorded seqno range, so the tier's seqno
//! stays truthful about what it has absorbed.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::encode_to_vec;
use bloomfilter::Bloom;
use tracing::{debug, info};

use super::{
    BLOOM_FP, BlockHandle, CRC_SIZE, LEN_SIZE, TABLE_FILE, TableCell, TableError, TableProperties,
    VLOG_FILE, VPOS_INLINE, codec, crc32, encode_footer, encode_header,
};
use crate::engine::Entry;

/// What a finished build produced, for the scheduler's bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildStats {
    /// Entries written to the table (after any tombstone purge).
    pub count: u64,

    /// Highest seqno observed in the input, purged tombstones included.
    pub seqno_max: u64,

    /// Bytes written across the tier's files.
    pub written: u64,
}

/// Streams sorted entries into a new immutable tier directory.
pub struct TableBuilder {
    dir: PathBuf,
    writer: BufWriter<File>,
    vlog: Option<BufWriter<File>>,
    zblocksize: usize,
    vblocksize: usize,
    tombstone_purge: bool,

    offset: u64,
    vpos: u64,
    cells: Vec<TableCell>,
    cell_bytes: usize,
    index: Vec<super::IndexEntry>,
    bloom_keys: Vec<Vec<u8>>,
    props: TableProperties,
    seqno_max_seen: u64,
    finished: bool,
}

impl TableBuilder {
    /// Create the tier directory and open its files for writing.
    /// `vblocksize > 0` routes values into a separate value log.
    pub fn new(
        dir: impl AsRef<Path>,
        mblocksize: usize,
        zblocksize: usize,
        vblocksize: usize,
    ) -> Result<Self, TableError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.join(format!("{TABLE_FILE}.tmp")))?;
        let mut writer = BufWriter::new(file);

        let header = encode_header(mblocksize as u32, zblocksize as u32, vblocksize as u32)?;
        writer.write_all(&header)?;

        let vlog = if vblocksize > 0 {
            let vfile = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(dir.join(format!("{VLOG_FILE}.tmp")))?;
            Some(BufWriter::new(vfile))
        } else {
            None
        };

        Ok(Self {
            dir,
            writer,
            vlog,
            zblocksize,
            vblocksize,
            tombstone_purge: false,
            offset: header.len() as u64,
            vpos: 0,
            cells: Vec::new(),
            cell_bytes: 0,
            index: Vec::new(),
            bloom_keys: Vec::new(),
            props: TableProperties::default(),
            seqno_max_seen: 0,
            finished: false,
        })
    }

    /// Drop tombstones from the output. Only valid for builds whose result
    /// lands in the last level, where nothing older can resurface a key.
    pub fn tombstone_purge(&mut self, yes: bool) {
        self.tombstone_purge = yes;
    }

    /// Consume the sorted entry stream, writing z-blocks as they fill.
    pub fn build<I>(&mut self, entries: &mut I) -> Result<BuildStats, TableError>
    where
        I: Iterator<Item = Entry>,
    {
        for entry in entries {
            self.seqno_max_seen = self.seqno_max_seen.max(entry.seqno);
            if self.tombstone_purge && entry.deleted {
                continue;
            }
            self.push(entry)?;
        }
        Ok(BuildStats {
            count: self.props.count,
            seqno_max: self.seqno_max_seen,
            written: self.offset + self.vpos,
        })
    }

    fn push(&mut self, entry: Entry) -> Result<(), TableError> {
        if self.props.count == 0 {
            self.props.key_min = entry.key.clone();
            self.props.seqno_min = entry.seqno;
        }
        self.props.key_max = entry.key.clone();
        self.props.seqno_min = self.props.seqno_min.min(entry.seqno);
        self.props.seqno_max = self.props.seqno_max.max(entry.seqno);
        self.props.keymem += entry.key.len() as u64;
        self.props.valmem += entry.value.len() as u64;
        self.props.count += 1;
        if entry.deleted {
            self.props.tombstones += 1;
        }
        self.bloom_keys.push(entry.key.clone());

        let cell = match &mut self.vlog {
            Some(vlog) if !entry.deleted && !entry.value.is_empty() => {
                let vpos = self.vpos;
                vlog.write_all(&entry.value)?;
                self.vpos += entry.value.len() as u64;
                TableCell {
                    key: entry.key,
                    value: Vec::new(),
                    seqno: entry.seqno,
                    deleted: entry.deleted,
                    vpos,
                    vlen: entry.value.len() as u32,
                }
            }
            _ => TableCell {
                vlen: entry.value.len() as u32,
                key: entry.key,
                value: entry.value,
                seqno: entry.seqno,
                deleted: entry.deleted,
                vpos: VPOS_INLINE,
            },
        };

        self.cell_bytes += cell.key.len() + cell.value.len() + 32;
        self.cells.push(cell);
        if self.cell_bytes >= self.zblocksize {
            self.flush_zblock()?;
        }
        Ok(())
    }

    fn flush_zblock(&mut self) -> Result<(), TableError> {
        if self.cells.is_empty() {
            return Ok(());
        }
        let first_key = self.cells[0].key.clone();
        let cells = std::mem::take(&mut self.cells);
        self.cell_bytes = 0;

        let bytes = encode_to_vec(&cells, codec())?;
        let handle = self.write_block(&bytes)?;
        self.index.push(super::IndexEntry { first_key, handle });
        self.props.n_zblocks += 1;
        Ok(())
    }

    fn write_block(&mut self, payload: &[u8]) -> Result<BlockHandle, TableError> {
        let len = (payload.len() as u32).to_le_bytes();
        let crc = crc32(payload).to_le_bytes();
        self.writer.write_all(&len)?;
        self.writer.write_all(payload)?;
        self.writer.write_all(&crc)?;
        let handle = BlockHandle {
            offset: self.offset,
            size: (LEN_SIZE + payload.len() + CRC_SIZE) as u64,
        };
        self.offset += handle.size;
        Ok(handle)
    }

    /// Write the trailing blocks and footer, fsync, and atomically rename
    /// the `.tmp` files into place. `metadata` is stored verbatim.
    pub fn finish(&mut self, metadata: &[u8]) -> Result<(), TableError> {
        if self.finished {
            return Err(TableError::Internal("finish called twice".into()));
        }
        self.flush_zblock()?;

        // Bloom filter over every key written, tombstones included.
        let bloom_bytes = if self.bloom_keys.is_empty() {
            Vec::new()
        } else {
            let mut bloom = Bloom::<[u8]>::new_for_fp_rate(self.bloom_keys.len(), BLOOM_FP)
                .map_err(|e| TableError::Internal(e.to_string()))?;
            for key in &self.bloom_keys {
                bloom.set(key);
            }
            bloom.as_slice().to_vec()
        };
        let bloom_handle = self.write_block(&bloom_bytes)?;

        let metadata_handle = self.write_block(metadata)?;

        self.props.built_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| TableError::Internal(e.to_string()))?
            .as_secs();
        let props_bytes = encode_to_vec(&self.props, codec())?;
        let props_handle = self.write_block(&props_bytes)?;

        let index_bytes = encode_to_vec(&self.index, codec())?;
        let index_handle = self.write_block(&index_bytes)?;

        let footer = encode_footer(
            bloom_handle,
            metadata_handle,
            props_handle,
            index_handle,
            self.offset,
        )?;
        self.writer.write_all(&footer)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        if let Some(vlog) = &mut self.vlog {
            vlog.flush()?;
            vlog.get_ref().sync_all()?;
            fs::rename(
                self.dir.join(format!("{VLOG_FILE}.tmp")),
                self.dir.join(VLOG_FILE),
            )?;
        }
        fs::rename(
            self.dir.join(format!("{TABLE_FILE}.tmp")),
            self.dir.join(TABLE_FILE),
        )?;
        if let Ok(dirf) = File::open(&self.dir) {
            let _ = dirf.sync_all();
        }
        self.finished = true;

        info!(
            dir = %self.dir.display(),
            count = self.props.count,
            zblocks = self.props.n_zblocks,
            "built table"
        );
        Ok(())
    }

    /// Abandon the build, removing whatever was written.
    pub fn abort(self) -> Result<(), TableError> {
        debug!(dir = %self.dir.display(), "aborting table build");
        drop(self.writer);
        drop(self.vlog);
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Target directory of this build.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configured value-block size; zero means inline values.
    pub fn vblocksize(&self) -> usize {
        self.vblocksize
    }
}
