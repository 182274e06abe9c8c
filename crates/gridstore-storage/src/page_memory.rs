//! Page memory
//!
//! Fixed-size page allocator for one memory policy. Pages are addressed by
//! [`PageId`] and guarded individually, so writers of unrelated pages never
//! contend. Writes are in-place and never touch disk; a page written since
//! the last checkpoint snapshot is tracked in the dirty set, which the
//! checkpointer swaps out in O(1).
//!
//! Page memory does not know about the WAL. Callers append the WAL record
//! first and pass its LSN to every write.

use bytes::Bytes;
use dashmap::DashMap;
use gridstore_common::{CacheId, Error, Lsn, PageId, PartitionId, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A single resident page
struct PageSlot {
    /// Page bytes
    data: RwLock<Box<[u8]>>,
    /// LSN of the last write applied to the page
    last_lsn: AtomicU64,
}

impl PageSlot {
    fn new(page_size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            last_lsn: AtomicU64::new(0),
        }
    }
}

/// Page memory region of one memory policy
pub struct PageMemory {
    /// Policy name
    policy: String,
    /// Page size in bytes
    page_size: usize,
    /// Byte budget
    budget: u64,
    /// Bytes currently allocated
    allocated: AtomicU64,
    /// Resident pages
    pages: DashMap<PageId, Arc<PageSlot>>,
    /// Next page index per partition
    next_index: DashMap<(CacheId, PartitionId), u32>,
    /// Pages written since the last dirty-set swap
    dirty: Mutex<HashSet<PageId>>,
}

impl PageMemory {
    /// Create an empty region
    #[must_use]
    pub fn new(policy: impl Into<String>, page_size: usize, budget: u64) -> Self {
        Self {
            policy: policy.into(),
            page_size,
            budget,
            allocated: AtomicU64::new(0),
            pages: DashMap::new(),
            next_index: DashMap::new(),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve one page worth of budget
    fn reserve(&self) -> Result<()> {
        let page = self.page_size as u64;
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + page <= self.budget).then_some(used + page)
            })
            .map(|_| ())
            .map_err(|used| Error::OutOfMemory {
                policy: self.policy.clone(),
                requested: used + page,
                budget: self.budget,
            })
    }

    fn release(&self, pages: usize) {
        self.allocated
            .fetch_sub((pages * self.page_size) as u64, Ordering::AcqRel);
    }

    /// Allocate a new zeroed page at the end of a partition
    pub fn allocate(&self, cache_id: CacheId, partition: PartitionId) -> Result<PageId> {
        self.reserve()?;

        let index = {
            let mut next = self.next_index.entry((cache_id, partition)).or_insert(0);
            let index = *next;
            *next += 1;
            index
        };

        let id = PageId::new(cache_id, partition, index);
        self.pages.insert(id, Arc::new(PageSlot::new(self.page_size)));
        debug!("Allocated page {} in policy {}", id, self.policy);
        Ok(id)
    }

    /// Make sure a specific page is resident, allocating it zeroed if needed
    pub fn ensure(&self, id: PageId) -> Result<()> {
        if self.pages.contains_key(&id) {
            return Ok(());
        }
        self.reserve()?;

        let mut next = self
            .next_index
            .entry((id.cache_id, id.partition))
            .or_insert(0);
        if *next <= id.index {
            *next = id.index + 1;
        }
        drop(next);

        let mut inserted = false;
        self.pages.entry(id).or_insert_with(|| {
            inserted = true;
            Arc::new(PageSlot::new(self.page_size))
        });
        if !inserted {
            self.release(1);
        }
        Ok(())
    }

    fn slot(&self, id: PageId) -> Result<Arc<PageSlot>> {
        self.pages
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::internal(format!("page {id} is not resident")))
    }

    /// Release a page that was allocated but never logged
    pub fn free(&self, id: PageId) {
        if self.pages.remove(&id).is_some() {
            self.release(1);
            self.dirty.lock().remove(&id);
        }
    }

    /// Whether a page is resident
    #[must_use]
    pub fn contains(&self, id: PageId) -> bool {
        self.pages.contains_key(&id)
    }

    /// Copy of the page bytes
    pub fn read(&self, id: PageId) -> Result<Bytes> {
        let slot = self.slot(id)?;
        let data = slot.data.read();
        Ok(Bytes::copy_from_slice(&data))
    }

    /// Copy of the page bytes together with the LSN of its last write
    pub fn read_with_lsn(&self, id: PageId) -> Result<(Bytes, Lsn)> {
        let slot = self.slot(id)?;
        let data = slot.data.read();
        Ok((
            Bytes::copy_from_slice(&data),
            slot.last_lsn.load(Ordering::Acquire),
        ))
    }

    /// Mutate a page in place and mark it dirty
    pub fn write<F>(&self, id: PageId, lsn: Lsn, mutation: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let slot = self.slot(id)?;
        {
            let mut data = slot.data.write();
            mutation(&mut data);
            slot.last_lsn.fetch_max(lsn, Ordering::AcqRel);
        }
        self.dirty.lock().insert(id);
        Ok(())
    }

    /// Overwrite `bytes.len()` bytes at `offset` and mark the page dirty
    pub fn apply_delta(&self, id: PageId, lsn: Lsn, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.page_size {
            return Err(Error::invalid_argument(format!(
                "delta {}..{} outside page {id}",
                offset,
                offset + bytes.len()
            )));
        }
        self.write(id, lsn, |data| {
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        })
    }

    /// Install a page image read from the page store (not dirty)
    pub fn load(&self, id: PageId, image: &[u8], lsn: Lsn) -> Result<()> {
        if image.len() != self.page_size {
            return Err(Error::CorruptPageStore(format!(
                "page {id} has {} bytes, expected {}",
                image.len(),
                self.page_size
            )));
        }
        self.ensure(id)?;
        let slot = self.slot(id)?;
        slot.data.write().copy_from_slice(image);
        slot.last_lsn.store(lsn, Ordering::Release);
        Ok(())
    }

    /// Dirty pages whose last write is newer than `marker`
    #[must_use]
    pub fn pages_dirty_since(&self, marker: Lsn) -> BTreeSet<PageId> {
        let dirty = self.dirty.lock().clone();
        dirty
            .into_iter()
            .filter(|id| {
                self.pages
                    .get(id)
                    .is_some_and(|s| s.last_lsn.load(Ordering::Acquire) > marker)
            })
            .collect()
    }

    /// Swap out the dirty set
    ///
    /// Bounded regardless of region size: the set is moved, not scanned.
    #[must_use]
    pub fn take_dirty(&self) -> HashSet<PageId> {
        std::mem::take(&mut *self.dirty.lock())
    }

    /// Put pages back into the dirty set (after a failed flush)
    pub fn restore_dirty(&self, pages: impl IntoIterator<Item = PageId>) {
        let mut dirty = self.dirty.lock();
        for id in pages {
            if self.pages.contains_key(&id) {
                dirty.insert(id);
            }
        }
    }

    /// Number of dirty pages
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Drop every page of a cache and return its budget
    pub fn reclaim_cache(&self, cache_id: CacheId) -> usize {
        let ids: Vec<PageId> = self
            .pages
            .iter()
            .filter(|e| e.key().cache_id == cache_id)
            .map(|e| *e.key())
            .collect();

        let mut removed = 0;
        for id in &ids {
            if self.pages.remove(id).is_some() {
                removed += 1;
            }
        }
        self.release(removed);
        self.next_index.retain(|(c, _), _| *c != cache_id);
        self.dirty.lock().retain(|id| id.cache_id != cache_id);

        debug!(
            "Reclaimed {} pages of cache {} in policy {}",
            removed, cache_id, self.policy
        );
        removed
    }

    /// Resident pages of one partition, in page index order
    #[must_use]
    pub fn partition_pages(&self, cache_id: CacheId, partition: PartitionId) -> Vec<PageId> {
        let next = self
            .next_index
            .get(&(cache_id, partition))
            .map_or(0, |n| *n);
        (0..next)
            .map(|index| PageId::new(cache_id, partition, index))
            .filter(|id| self.pages.contains_key(id))
            .collect()
    }

    /// Every resident page id, sorted
    #[must_use]
    pub fn page_ids(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self.pages.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Number of resident pages
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Number of resident pages belonging to a cache
    #[must_use]
    pub fn cache_page_count(&self, cache_id: CacheId) -> usize {
        self.pages
            .iter()
            .filter(|e| e.key().cache_id == cache_id)
            .count()
    }

    /// Bytes allocated
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Byte budget
    #[must_use]
    pub const fn budget(&self) -> u64 {
        self.budget
    }

    /// Page size
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Policy name
    #[must_use]
    pub fn policy(&self) -> &str {
        &self.policy
    }
}
