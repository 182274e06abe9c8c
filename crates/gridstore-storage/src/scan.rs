//! Partition scan
//!
//! Lazy iteration over the entries of one partition, one page at a time.
//! Each page is read under the partition lock, so a scan sees a consistent
//! image of every page but not of the partition as a whole. The cursor can
//! be saved and handed back to the engine to resume.

use crate::engine::CacheRuntime;
use crate::page::DataPage;
use gridstore_common::{PartitionId, Result};
use std::collections::VecDeque;
use std::sync::Arc;

/// Position of the next entry a scan yields
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanCursor {
    /// Page position within the partition
    pub page: usize,
    /// Entry position within the page
    pub entry: usize,
}

/// Lazy `(key, value)` iterator over one partition
pub struct PartitionScan {
    runtime: Arc<CacheRuntime>,
    partition: PartitionId,
    cursor: ScanCursor,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    loaded: bool,
    done: bool,
}

impl PartitionScan {
    pub(crate) fn new(
        runtime: Arc<CacheRuntime>,
        partition: PartitionId,
        cursor: ScanCursor,
    ) -> Self {
        Self {
            runtime,
            partition,
            cursor,
            buffer: VecDeque::new(),
            loaded: false,
            done: false,
        }
    }

    /// Cursor of the next entry
    #[must_use]
    pub const fn cursor(&self) -> ScanCursor {
        self.cursor
    }

    #[must_use]
    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    fn step(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                self.cursor.entry += 1;
                return Ok(Some(entry));
            }
            if self.loaded {
                self.cursor.page += 1;
                self.cursor.entry = 0;
                self.loaded = false;
            }

            let image = {
                let state = self.runtime.partitions[self.partition as usize].read();
                if self.runtime.is_closing() {
                    return Err(self.runtime.not_found());
                }
                match state.pages.get(self.cursor.page) {
                    Some(&id) => self.runtime.region.memory.read(id)?,
                    None => return Ok(None),
                }
            };

            let page = DataPage::decode(&image)?;
            self.buffer = page.into_entries().into_iter().skip(self.cursor.entry).collect();
            self.loaded = true;
        }
    }
}

impl Iterator for PartitionScan {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
