//! Streaming entry iterator over a table, one z-block resident at a time.

use std::sync::Arc;

use super::{TableError, TableSnapshot};
use crate::engine::Entry;

/// Ordered, single-pass iterator over every entry of one table, tombstones
/// included. Holds its own reference to the table, so it stays valid while
/// the engine retires the snapshot that produced it.
///
/// The first error is terminal: it is yielded once and the iterator fuses.
pub struct EntryIter {
    table: Arc<TableSnapshot>,
    block_at: usize,
    cells: std::vec::IntoIter<super::TableCell>,
    done: bool,
}

impl EntryIter {
    pub(crate) fn new(table: Arc<TableSnapshot>) -> Self {
        Self {
            table,
            block_at: 0,
            cells: Vec::new().into_iter(),
            done: false,
        }
    }

    fn next_block(&mut self) -> Result<bool, TableError> {
        if self.block_at >= self.table.n_blocks() {
            return Ok(false);
        }
        let cells = self.table.read_zblock(self.block_at)?;
        self.block_at += 1;
        self.cells = cells.into_iter();
        Ok(true)
    }
}

impl Iterator for EntryIter {
    type Item = Result<Entry, TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(cell) = self.cells.next() {
                match self.table.cell_to_entry(&cell) {
                    Ok(entry) => return Some(Ok(entry)),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            match self.next_block() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
