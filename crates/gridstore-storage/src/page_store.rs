//! Page store
//!
//! One file per memory policy holding checkpointed page images in fixed-size
//! slots:
//! ```text
//! +-------+-------+-----------+-------+-----+--------+-----+-----------+
//! | Magic | Cache | Partition | Index | LSN | CRC32C | Pad | Page data |
//! | 4B    | 4B    | 4B        | 4B    | 8B  | 4B     | 4B  | page_size |
//! +-------+-------+-----------+-------+-----+--------+-----+-----------+
//! ```
//! The store is copy-on-write: a checkpoint only writes into slots that the
//! durable checkpoint header does not reference, so a crash in the middle of
//! a flush can never damage the image recovery will load. Which slots are
//! live is recorded in the header, not in the store.

use crate::wal::sync_dir;
use gridstore_common::codec::{checksum, read_u32, read_u64};
use gridstore_common::config::Durability;
use gridstore_common::{CacheId, Error, Lsn, PageId, Result};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Slot header magic
const SLOT_MAGIC: u32 = 0x4750_534C; // "GPSL"

/// Slot header size
pub const SLOT_HEADER_SIZE: usize = 32;

/// Checkpointed page images of one memory policy
pub struct PageStore {
    policy: String,
    path: PathBuf,
    file: File,
    page_size: usize,
    /// Slots present in the file
    slot_count: u64,
    /// Slots not referenced by the durable header
    free: BTreeSet<u64>,
    durability: Durability,
}

impl PageStore {
    /// Open (or create) the store of `policy` in `dir`
    ///
    /// Every slot starts out free; call [`PageStore::mark_used`] with the
    /// slots referenced by the checkpoint header before writing.
    pub fn open(
        dir: impl AsRef<Path>,
        policy: &str,
        page_size: usize,
        durability: Durability,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| Error::io("failed to create store directory", e))?;
        let path = dir.join(format!("{policy}.pages"));

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::io("failed to open page store", e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::io("failed to stat page store", e))?
            .len();

        // A partially appended last slot is never referenced
        let slot_size = (SLOT_HEADER_SIZE + page_size) as u64;
        let slot_count = len / slot_size;

        debug!(
            "Opened page store {:?}: {} slots of {} bytes",
            path, slot_count, slot_size
        );

        Ok(Self {
            policy: policy.to_string(),
            path,
            file,
            page_size,
            slot_count,
            free: (0..slot_count).collect(),
            durability,
        })
    }

    const fn slot_size(&self) -> u64 {
        (SLOT_HEADER_SIZE + self.page_size) as u64
    }

    /// Mark slots referenced by the durable header as in use
    pub fn mark_used(&mut self, slots: impl IntoIterator<Item = u64>) -> Result<()> {
        for slot in slots {
            if slot >= self.slot_count {
                return Err(Error::CorruptPageStore(format!(
                    "slot {slot} beyond end of {} ({} slots)",
                    self.policy, self.slot_count
                )));
            }
            self.free.remove(&slot);
        }
        Ok(())
    }

    /// Write a page image into a free slot; returns the slot
    pub fn write_page(&mut self, id: PageId, lsn: Lsn, data: &[u8]) -> Result<u64> {
        if data.len() != self.page_size {
            return Err(Error::internal(format!(
                "page {id} image has {} bytes, store page size is {}",
                data.len(),
                self.page_size
            )));
        }

        let slot = match self.free.pop_first() {
            Some(slot) => slot,
            None => {
                self.slot_count += 1;
                self.slot_count - 1
            }
        };

        let mut buf = Vec::with_capacity(SLOT_HEADER_SIZE + data.len());
        buf.extend_from_slice(&SLOT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&id.cache_id.get().to_le_bytes());
        buf.extend_from_slice(&id.partition.to_le_bytes());
        buf.extend_from_slice(&id.index.to_le_bytes());
        buf.extend_from_slice(&lsn.to_le_bytes());
        let crc = crc32c::crc32c_append(checksum(&buf), data);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(data);

        let mut file = &self.file;
        file.seek(SeekFrom::Start(slot * self.slot_size()))
            .and_then(|_| file.write_all(&buf))
            .map_err(|e| Error::io("page store write failed", e))?;
        Ok(slot)
    }

    /// Read the page image in `slot`, checking it belongs to `expected`
    pub fn read_page(&self, slot: u64, expected: PageId) -> Result<(Vec<u8>, Lsn)> {
        if slot >= self.slot_count {
            return Err(Error::CorruptPageStore(format!(
                "slot {slot} beyond end of {}",
                self.policy
            )));
        }

        let mut buf = vec![0u8; SLOT_HEADER_SIZE + self.page_size];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(slot * self.slot_size()))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| Error::io("page store read failed", e))?;

        let corrupt = |what: &str| {
            Error::CorruptPageStore(format!("{} slot {slot}: {what}", self.policy))
        };
        if read_u32(&buf, 0) != Some(SLOT_MAGIC) {
            return Err(corrupt("invalid magic"));
        }
        let id = PageId::new(
            CacheId::new(read_u32(&buf, 4).unwrap_or_default()),
            read_u32(&buf, 8).unwrap_or_default(),
            read_u32(&buf, 12).unwrap_or_default(),
        );
        let lsn = read_u64(&buf, 16).unwrap_or_default();
        let stored_crc = read_u32(&buf, 24).unwrap_or_default();

        let data = buf.split_off(SLOT_HEADER_SIZE);
        let crc = crc32c::crc32c_append(checksum(&buf[..24]), &data);
        if crc != stored_crc {
            return Err(corrupt("CRC mismatch"));
        }
        if id != expected {
            return Err(corrupt(&format!("holds page {id}, expected {expected}")));
        }
        Ok((data, lsn))
    }

    /// Return a slot to the free list
    pub fn release(&mut self, slot: u64) {
        if slot < self.slot_count {
            self.free.insert(slot);
        }
    }

    /// Force written slots to stable storage
    pub fn sync(&self) -> Result<()> {
        if !self.durability.sync() {
            return Ok(());
        }
        self.file
            .sync_all()
            .map_err(|e| Error::io("page store sync failed", e))?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }
        Ok(())
    }

    /// Slots in the file
    #[must_use]
    pub const fn slot_count(&self) -> u64 {
        self.slot_count
    }

    /// Slots available for writing
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn policy(&self) -> &str {
        &self.policy
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 512;

    fn page_id(index: u32) -> PageId {
        PageId::new(CacheId::new(1), 3, index)
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempdir().unwrap();
        let mut store = PageStore::open(dir.path(), "default", PAGE, Durability::Full).unwrap();

        let slot = store.write_page(page_id(0), 17, &[5u8; PAGE]).unwrap();
        store.sync().unwrap();

        let (data, lsn) = store.read_page(slot, page_id(0)).unwrap();
        assert_eq!(data, vec![5u8; PAGE]);
        assert_eq!(lsn, 17);
    }

    #[test]
    fn test_wrong_page_rejected() {
        let dir = tempdir().unwrap();
        let mut store = PageStore::open(dir.path(), "default", PAGE, Durability::Full).unwrap();
        let slot = store.write_page(page_id(0), 1, &[1u8; PAGE]).unwrap();

        assert!(matches!(
            store.read_page(slot, page_id(1)),
            Err(Error::CorruptPageStore(_))
        ));
        assert!(store.read_page(slot + 1, page_id(0)).is_err());
    }

    #[test]
    fn test_copy_on_write_slots() {
        let dir = tempdir().unwrap();
        let mut store = PageStore::open(dir.path(), "default", PAGE, Durability::Full).unwrap();

        let first = store.write_page(page_id(0), 1, &[1u8; PAGE]).unwrap();
        let second = store.write_page(page_id(0), 2, &[2u8; PAGE]).unwrap();
        assert_ne!(first, second);

        // The old slot stays readable until released
        assert_eq!(store.read_page(first, page_id(0)).unwrap().1, 1);
        store.release(first);
        let third = store.write_page(page_id(0), 3, &[3u8; PAGE]).unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn test_reopen_marks_used_slots() {
        let dir = tempdir().unwrap();
        let slot = {
            let mut store =
                PageStore::open(dir.path(), "default", PAGE, Durability::Full).unwrap();
            store.write_page(page_id(0), 1, &[1u8; PAGE]).unwrap();
            let slot = store.write_page(page_id(1), 1, &[2u8; PAGE]).unwrap();
            store.sync().unwrap();
            slot
        };

        let mut store = PageStore::open(dir.path(), "default", PAGE, Durability::Full).unwrap();
        assert_eq!(store.slot_count(), 2);
        assert_eq!(store.free_count(), 2);
        store.mark_used([slot]).unwrap();
        assert_eq!(store.free_count(), 1);
        assert!(store.mark_used([9]).is_err());

        // The referenced slot is never handed out
        let next = store.write_page(page_id(2), 2, &[3u8; PAGE]).unwrap();
        assert_ne!(next, slot);
        assert_eq!(store.read_page(slot, page_id(1)).unwrap().0, vec![2u8; PAGE]);
    }

    #[test]
    fn test_damaged_slot_detected() {
        let dir = tempdir().unwrap();
        let path = {
            let mut store =
                PageStore::open(dir.path(), "default", PAGE, Durability::Full).unwrap();
            store.write_page(page_id(0), 1, &[1u8; PAGE]).unwrap();
            store.path().to_path_buf()
        };

        let mut bytes = fs::read(&path).unwrap();
        bytes[SLOT_HEADER_SIZE + 10] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let store = PageStore::open(dir.path(), "default", PAGE, Durability::Full).unwrap();
        assert!(matches!(
            store.read_page(0, page_id(0)),
            Err(Error::CorruptPageStore(_))
        ));
    }
}
