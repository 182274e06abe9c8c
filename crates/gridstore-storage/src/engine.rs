//! Persistent partitioned cache engine
//!
//! Ties the storage pieces together for one node. Every mutation follows
//! the same path:
//!
//! 1. take the checkpoint barrier (shared) and the partition lock
//! 2. stage the new page contents and diff them against page memory
//! 3. append one `page-update` record with the byte-range deltas
//! 4. apply the deltas to page memory
//!
//! A batch locks every partition it touches, is logged as one record and is
//! applied entirely or not at all.

use crate::checkpoint::{self, CheckpointReport, CheckpointSignal, CheckpointState, Checkpointer};
use crate::page::{DataPage, diff, entry_size, max_entry_size};
use crate::page_memory::PageMemory;
use crate::page_store::PageStore;
use crate::recovery::{self, RecoveryReport, RecoveryState, RecoveryStatus};
use crate::registry::{CacheConfig, CacheDescriptor, Registry};
use crate::scan::{PartitionScan, ScanCursor};
use crate::wal::{PageDelta, Wal, WalPayload};
use gridstore_affinity::{AffinityRouter, TopologyView};
use gridstore_common::config::Durability;
use gridstore_common::{CacheId, Config, Error, PageId, PartitionId, Result};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Page memory and page store of one memory policy
pub(crate) struct Region {
    pub memory: PageMemory,
    pub store: Mutex<PageStore>,
}

/// Pages and key index of one partition
#[derive(Debug, Default)]
pub(crate) struct PartitionState {
    /// Pages in allocation order
    pub pages: Vec<PageId>,
    /// Free bytes per page (parallel to `pages`)
    pub free: Vec<usize>,
    /// Key to position in `pages`
    pub index: HashMap<Vec<u8>, usize>,
}

/// Live state of one cache
pub(crate) struct CacheRuntime {
    pub descriptor: CacheDescriptor,
    pub region: Arc<Region>,
    pub partitions: Vec<RwLock<PartitionState>>,
    /// Set by destroy before draining; operations then see `CacheNotFound`
    closing: AtomicBool,
}

impl CacheRuntime {
    fn new(descriptor: CacheDescriptor, region: Arc<Region>) -> Self {
        let partitions = (0..descriptor.partitions())
            .map(|_| RwLock::new(PartitionState::default()))
            .collect();
        Self {
            descriptor,
            region,
            partitions,
            closing: AtomicBool::new(false),
        }
    }

    /// Rebuild partition indexes from the pages in memory
    pub fn rebuild(descriptor: CacheDescriptor, region: Arc<Region>) -> Result<Self> {
        let runtime = Self::new(descriptor, region);
        let memory = &runtime.region.memory;
        let page_size = memory.page_size();

        for (partition, lock) in runtime.partitions.iter().enumerate() {
            let mut state = lock.write();
            for id in memory.partition_pages(runtime.descriptor.id, partition as PartitionId) {
                let page = DataPage::decode(&memory.read(id)?)?;
                let position = state.pages.len();
                for (key, _) in page.iter() {
                    state.index.insert(key.to_vec(), position);
                }
                state.pages.push(id);
                state.free.push(page.free(page_size));
            }
        }
        Ok(runtime)
    }

    pub fn id(&self) -> CacheId {
        self.descriptor.id
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn not_found(&self) -> Error {
        Error::CacheNotFound(self.descriptor.name.clone())
    }

    fn partition(&self, partition: PartitionId) -> Result<&RwLock<PartitionState>> {
        self.partitions.get(partition as usize).ok_or_else(|| {
            Error::invalid_argument(format!(
                "partition {partition} out of range for cache {}",
                self.descriptor.name
            ))
        })
    }
}

/// State shared between the engine, the checkpointer and recovery
pub(crate) struct Shared {
    pub config: Config,
    pub wal: Wal,
    pub regions: BTreeMap<String, Arc<Region>>,
    pub registry: Registry,
    pub router: Arc<AffinityRouter>,
    pub caches: RwLock<HashMap<CacheId, Arc<CacheRuntime>>>,
    /// Held shared by mutations across append-plus-apply, exclusively by
    /// the checkpointer while it takes its snapshot
    pub barrier: RwLock<()>,
    pub checkpoint: Mutex<CheckpointState>,
    pub signal: CheckpointSignal,
    pub recovery: RecoveryStatus,
    failed: AtomicBool,
}

impl Shared {
    pub fn region(&self, policy: &str) -> Result<Arc<Region>> {
        self.regions
            .get(policy)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("unknown memory policy {policy}")))
    }

    pub fn install(&self, runtime: Arc<CacheRuntime>) {
        self.router
            .register(runtime.id(), runtime.descriptor.affinity);
        self.caches.write().insert(runtime.id(), runtime);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Stop accepting writes after a fatal error
    pub fn fail(&self, e: &Error) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            error!("Node failed, rejecting further writes: {}", e);
        }
    }

    pub fn check_ready(&self) -> Result<()> {
        if self.is_failed() {
            return Err(Error::NodeFailed);
        }
        match self.recovery.get() {
            RecoveryState::Ready => Ok(()),
            RecoveryState::Failed => Err(Error::NodeFailed),
            state => Err(Error::NotReady(state.to_string())),
        }
    }

    /// Dirty page count or WAL size past its threshold
    pub fn needs_checkpoint(&self) -> bool {
        let dirty: usize = self.regions.values().map(|r| r.memory.dirty_count()).sum();
        dirty >= self.config.checkpoint.dirty_page_threshold || self.wal.needs_compaction()
    }

    fn checkpointer_wanted(&self) -> bool {
        self.config.checkpoint.background && self.needs_checkpoint()
    }

    /// Anything logged after the end record of the last completed checkpoint
    pub fn has_changes(&self) -> bool {
        self.wal.current_lsn() > self.checkpoint.lock().last_end
    }

    fn runtime(&self, cache_id: CacheId) -> Result<Arc<CacheRuntime>> {
        self.check_ready()?;
        self.caches
            .read()
            .get(&cache_id)
            .cloned()
            .ok_or_else(|| Error::CacheNotFound(cache_id.to_string()))
    }

    /// Append a record; a failed append is fatal
    fn log(&self, payload: &WalPayload) -> Result<u64> {
        self.wal.append(payload).inspect_err(|e| self.fail(e))
    }
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Last assigned WAL LSN
    pub wal_lsn: u64,
    /// WAL size in bytes
    pub wal_size: u64,
    /// Marker of the last durable checkpoint
    pub last_checkpoint_lsn: u64,
    /// Checkpoints completed since open
    pub checkpoints: u64,
    /// Live caches
    pub caches: usize,
    /// Resident pages over all memory policies
    pub pages: usize,
    /// Dirty pages over all memory policies
    pub dirty_pages: usize,
    /// Bytes allocated over all memory policies
    pub allocated_bytes: u64,
    pub recovery_state: RecoveryState,
}

/// Persistent partitioned cache engine of one node
pub struct Engine {
    shared: Arc<Shared>,
    checkpointer: Option<Checkpointer>,
    report: RecoveryReport,
}

impl Engine {
    /// Open the engine, running recovery to completion
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        if config.durability == Durability::Relaxed {
            warn!(
                "Node {} runs with relaxed durability: acknowledged writes can be lost on power failure",
                config.node.name
            );
        }

        let wal = Wal::open(config.wal_dir(), &config.wal, config.durability)?;

        let store_dir = config.store_dir();
        let mut regions = BTreeMap::new();
        for policy in &config.memory.policies {
            let memory = PageMemory::new(&policy.name, config.memory.page_size, policy.max_size);
            let store = PageStore::open(
                &store_dir,
                &policy.name,
                config.memory.page_size,
                config.durability,
            )?;
            regions.insert(
                policy.name.clone(),
                Arc::new(Region {
                    memory,
                    store: Mutex::new(store),
                }),
            );
        }

        let shared = Arc::new(Shared {
            wal,
            regions,
            registry: Registry::new(),
            router: Arc::new(AffinityRouter::new(TopologyView::default())),
            caches: RwLock::new(HashMap::new()),
            barrier: RwLock::new(()),
            checkpoint: Mutex::new(CheckpointState::default()),
            signal: CheckpointSignal::default(),
            recovery: RecoveryStatus::default(),
            failed: AtomicBool::new(false),
            config,
        });

        let report = recovery::recover(&shared)?;

        let checkpointer = if shared.config.checkpoint.background {
            Some(Checkpointer::start(Arc::clone(&shared))?)
        } else {
            None
        };

        info!(
            "Engine {} open with {} caches at LSN {}",
            shared.config.node.name, report.caches, report.last_lsn
        );

        Ok(Self {
            shared,
            checkpointer,
            report,
        })
    }

    /// Configuration the engine was opened with
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Routing table of this node
    #[must_use]
    pub fn router(&self) -> &Arc<AffinityRouter> {
        &self.shared.router
    }

    #[must_use]
    pub fn recovery_state(&self) -> RecoveryState {
        self.shared.recovery.get()
    }

    /// What recovery did when the engine was opened
    #[must_use]
    pub const fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.shared.is_failed()
    }

    // Cache lifecycle

    /// Create a cache
    pub fn create_cache(&self, config: CacheConfig) -> Result<CacheDescriptor> {
        let shared = &self.shared;
        shared.check_ready()?;
        let _lifecycle = shared.registry.lock_lifecycle();
        self.create_locked(&config)
    }

    /// Return the cache named in `config`, creating it if absent
    pub fn get_or_create_cache(&self, config: CacheConfig) -> Result<CacheDescriptor> {
        let shared = &self.shared;
        shared.check_ready()?;
        let _lifecycle = shared.registry.lock_lifecycle();
        if let Some(existing) = shared.registry.get_by_name(&config.name) {
            return Ok(existing);
        }
        self.create_locked(&config)
    }

    fn create_locked(&self, config: &CacheConfig) -> Result<CacheDescriptor> {
        let shared = &self.shared;
        let policy = config
            .memory_policy
            .clone()
            .unwrap_or_else(|| shared.config.memory.default_policy.clone());
        let region = shared.region(&policy)?;

        let _barrier = shared.barrier.read();
        let descriptor = shared.registry.prepare(config, policy)?;
        let lsn = shared.log(&WalPayload::CacheCreate {
            descriptor: descriptor.clone(),
        })?;
        shared.registry.create(descriptor.clone())?;
        shared.install(Arc::new(CacheRuntime::new(descriptor.clone(), region)));

        info!(
            "Created cache {} (id {}, {} partitions) at LSN {}",
            descriptor.name,
            descriptor.id,
            descriptor.partitions(),
            lsn
        );
        Ok(descriptor)
    }

    /// Destroy a cache and reclaim its pages
    ///
    /// In-flight operations on the cache finish first; later ones fail with
    /// `CacheNotFound`.
    pub fn destroy_cache(&self, cache_id: CacheId) -> Result<()> {
        let shared = &self.shared;
        let _lifecycle = shared.registry.lock_lifecycle();
        let runtime = shared.runtime(cache_id)?;

        runtime.closing.store(true, Ordering::Release);
        let _barrier = shared.barrier.read();
        let _drained: Vec<RwLockWriteGuard<'_, PartitionState>> =
            runtime.partitions.iter().map(|p| p.write()).collect();

        let lsn = match shared.log(&WalPayload::CacheDestroy { cache_id }) {
            Ok(lsn) => lsn,
            Err(e) => {
                runtime.closing.store(false, Ordering::Release);
                return Err(e);
            }
        };
        shared.registry.destroy(cache_id)?;
        shared.caches.write().remove(&cache_id);
        shared.router.remove(cache_id);
        let pages = runtime.region.memory.reclaim_cache(cache_id);

        info!(
            "Destroyed cache {} (id {}) at LSN {}, reclaimed {} pages",
            runtime.descriptor.name, cache_id, lsn, pages
        );
        Ok(())
    }

    /// Destroy a cache by name
    pub fn destroy_cache_named(&self, name: &str) -> Result<()> {
        let descriptor = self
            .cache(name)
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))?;
        self.destroy_cache(descriptor.id)
    }

    /// Descriptor of a cache by name
    #[must_use]
    pub fn cache(&self, name: &str) -> Option<CacheDescriptor> {
        self.shared.registry.get_by_name(name)
    }

    /// Descriptor of a cache by id
    #[must_use]
    pub fn descriptor(&self, cache_id: CacheId) -> Option<CacheDescriptor> {
        self.shared.registry.get(cache_id)
    }

    /// All live caches
    #[must_use]
    pub fn caches(&self) -> Vec<CacheDescriptor> {
        self.shared.registry.list()
    }

    // Data operations

    /// Value of `key`
    pub fn get(&self, cache_id: CacheId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let runtime = self.shared.runtime(cache_id)?;
        let partition = runtime.descriptor.affinity.partition_for(key);
        let state = runtime.partition(partition)?.read();
        if runtime.is_closing() {
            return Err(runtime.not_found());
        }

        let Some(&position) = state.index.get(key) else {
            return Ok(None);
        };
        let page = DataPage::decode(&runtime.region.memory.read(state.pages[position])?)?;
        Ok(page.get(key).map(<[u8]>::to_vec))
    }

    /// Insert or replace one entry
    pub fn put(&self, cache_id: CacheId, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_all(cache_id, vec![(key.to_vec(), value.to_vec())])
    }

    /// Insert or replace many entries
    pub fn put_all(&self, cache_id: CacheId, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        self.apply_batch(cache_id, entries, |_, _, value| Ok(Some(value.to_vec())))
    }

    /// Remove one entry; returns whether it was present
    pub fn remove(&self, cache_id: CacheId, key: &[u8]) -> Result<bool> {
        let mut existed = false;
        self.apply_batch(cache_id, vec![(key.to_vec(), Vec::new())], |_, old, _| {
            existed = old.is_some();
            Ok(None)
        })?;
        Ok(existed)
    }

    /// Apply `transform` to every `(key, argument)` item
    ///
    /// `transform(key, current, argument)` returns the new value, or `None`
    /// to remove the entry. Each item is applied exactly once, in submission
    /// order for the same key. The batch is logged as one record and applied
    /// entirely or not at all: an error from `transform`, from page
    /// allocation or from the log leaves every partition untouched.
    pub fn apply_batch<F>(
        &self,
        cache_id: CacheId,
        items: Vec<(Vec<u8>, Vec<u8>)>,
        mut transform: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>, &[u8]) -> Result<Option<Vec<u8>>>,
    {
        let runtime = self.shared.runtime(cache_id)?;

        let mut groups: BTreeMap<PartitionId, Vec<(Vec<u8>, Vec<u8>)>> = BTreeMap::new();
        for (key, argument) in items {
            let partition = runtime.descriptor.affinity.partition_for(&key);
            groups.entry(partition).or_default().push((key, argument));
        }
        self.apply_groups(&runtime, groups, &mut transform)?;

        if self.shared.checkpointer_wanted() {
            self.shared.signal.request();
        }
        Ok(())
    }

    fn apply_groups<F>(
        &self,
        runtime: &CacheRuntime,
        groups: BTreeMap<PartitionId, Vec<(Vec<u8>, Vec<u8>)>>,
        transform: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>, &[u8]) -> Result<Option<Vec<u8>>>,
    {
        let shared = &self.shared;
        let _barrier = shared.barrier.read();
        // Ascending partition order, the same order destroy locks them in
        let mut locked = Vec::with_capacity(groups.len());
        for (partition, items) in groups {
            locked.push((partition, runtime.partition(partition)?.write(), items));
        }
        if runtime.is_closing() {
            return Err(runtime.not_found());
        }
        if shared.is_failed() {
            return Err(Error::NodeFailed);
        }

        let memory = &runtime.region.memory;
        let mut staged = Vec::with_capacity(locked.len());
        let mut deltas = Vec::new();
        let mut failure = None;
        for (partition, state, items) in &mut locked {
            let mut staging = Staging::new(state, memory, runtime.id(), *partition);
            let result = std::mem::take(items)
                .into_iter()
                .try_for_each(|(key, argument)| {
                    let current = staging.get(&key)?;
                    match transform(&key, current.as_deref(), &argument)? {
                        Some(value) => staging.put(&key, value),
                        None => staging.remove(&key).map(|_| ()),
                    }
                })
                .and_then(|()| staging.deltas());
            staged.push(staging.into_changes());
            match result {
                Ok(group) => deltas.extend(group),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            staged.into_iter().for_each(|changes| changes.abort(memory));
            return Err(e);
        }
        if deltas.is_empty() {
            staged.into_iter().for_each(|changes| changes.abort(memory));
            return Ok(());
        }

        let lsn = match shared.log(&WalPayload::PageUpdate {
            cache_id: runtime.id(),
            deltas: deltas.clone(),
        }) {
            Ok(lsn) => lsn,
            Err(e) => {
                staged.into_iter().for_each(|changes| changes.abort(memory));
                return Err(e);
            }
        };

        for delta in &deltas {
            memory
                .apply_delta(delta.page, lsn, delta.offset as usize, &delta.bytes)
                .inspect_err(|e| shared.fail(e))?;
        }
        for ((_, state, _), changes) in locked.iter_mut().zip(staged) {
            changes.commit(state, memory.page_size());
        }

        debug!(
            "Applied {} deltas to {} partitions of cache {} at LSN {}",
            deltas.len(),
            locked.len(),
            runtime.id(),
            lsn
        );
        Ok(())
    }

    /// Remove every entry of a cache through the WAL
    pub fn clear(&self, cache_id: CacheId) -> Result<()> {
        let runtime = self.shared.runtime(cache_id)?;
        for (partition, lock) in runtime.partitions.iter().enumerate() {
            let keys: Vec<(Vec<u8>, Vec<u8>)> = {
                let state = lock.read();
                state.index.keys().map(|k| (k.clone(), Vec::new())).collect()
            };
            if keys.is_empty() {
                continue;
            }
            let mut remove_all =
                |_: &[u8], _: Option<&[u8]>, _: &[u8]| -> Result<Option<Vec<u8>>> { Ok(None) };
            let group = BTreeMap::from([(partition as PartitionId, keys)]);
            self.apply_groups(&runtime, group, &mut remove_all)?;
        }
        info!("Cleared cache {}", runtime.descriptor.name);
        Ok(())
    }

    /// Number of entries in a cache
    pub fn len(&self, cache_id: CacheId) -> Result<usize> {
        let runtime = self.shared.runtime(cache_id)?;
        Ok(runtime.partitions.iter().map(|p| p.read().index.len()).sum())
    }

    /// Number of entries in one partition of a cache
    pub fn partition_len(&self, cache_id: CacheId, partition: PartitionId) -> Result<usize> {
        let runtime = self.shared.runtime(cache_id)?;
        let len = runtime.partition(partition)?.read().index.len();
        Ok(len)
    }

    /// Whether a cache holds no entry
    pub fn is_empty(&self, cache_id: CacheId) -> Result<bool> {
        Ok(self.len(cache_id)? == 0)
    }

    /// Lazy scan of one partition
    pub fn scan(&self, cache_id: CacheId, partition: PartitionId) -> Result<PartitionScan> {
        self.scan_from(cache_id, partition, ScanCursor::default())
    }

    /// Resume a scan at a cursor taken from an earlier scan
    pub fn scan_from(
        &self,
        cache_id: CacheId,
        partition: PartitionId,
        cursor: ScanCursor,
    ) -> Result<PartitionScan> {
        let runtime = self.shared.runtime(cache_id)?;
        runtime.partition(partition)?;
        Ok(PartitionScan::new(runtime, partition, cursor))
    }

    // Durability

    /// Run a checkpoint now
    pub fn checkpoint(&self) -> Result<CheckpointReport> {
        checkpoint::run(&self.shared).inspect_err(|e| {
            if e.is_fatal() {
                self.shared.fail(e);
            }
        })
    }

    /// Engine statistics
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let shared = &self.shared;
        let (last_checkpoint_lsn, checkpoints) = {
            let state = shared.checkpoint.lock();
            (state.last_lsn, state.count)
        };
        let regions = shared.regions.values();
        EngineStats {
            wal_lsn: shared.wal.current_lsn(),
            wal_size: shared.wal.size(),
            last_checkpoint_lsn,
            checkpoints,
            caches: shared.registry.len(),
            pages: regions.clone().map(|r| r.memory.page_count()).sum(),
            dirty_pages: regions.clone().map(|r| r.memory.dirty_count()).sum(),
            allocated_bytes: regions.map(|r| r.memory.allocated_bytes()).sum(),
            recovery_state: shared.recovery.get(),
        }
    }

    /// Stop background work, take a final checkpoint and close
    ///
    /// Dropping an engine without closing it behaves like a crash: nothing
    /// beyond the already durable WAL is written.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut checkpointer) = self.checkpointer.take() {
            checkpointer.stop();
        }
        if self.shared.is_failed() {
            return Err(Error::NodeFailed);
        }
        if self.shared.has_changes() {
            self.checkpoint()?;
        }
        self.shared.wal.sync()?;
        info!("Engine {} closed", self.shared.config.node.name);
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(mut checkpointer) = self.checkpointer.take() {
            checkpointer.stop();
        }
    }
}

/// Uncommitted changes of one partition of a batch
struct Staging<'a> {
    state: &'a PartitionState,
    memory: &'a PageMemory,
    cache_id: CacheId,
    partition: PartitionId,
    page_size: usize,
    /// Decoded (and possibly modified) pages by position
    pages: BTreeMap<usize, DataPage>,
    /// Pages allocated by this group
    new_pages: Vec<PageId>,
    /// Index changes: key to new position, `None` when removed
    moved: HashMap<Vec<u8>, Option<usize>>,
}

impl<'a> Staging<'a> {
    fn new(
        state: &'a PartitionState,
        memory: &'a PageMemory,
        cache_id: CacheId,
        partition: PartitionId,
    ) -> Self {
        Self {
            state,
            memory,
            cache_id,
            partition,
            page_size: memory.page_size(),
            pages: BTreeMap::new(),
            new_pages: Vec::new(),
            moved: HashMap::new(),
        }
    }

    fn page_count(&self) -> usize {
        self.state.pages.len() + self.new_pages.len()
    }

    fn page_id(&self, position: usize) -> PageId {
        let existing = self.state.pages.len();
        if position < existing {
            self.state.pages[position]
        } else {
            self.new_pages[position - existing]
        }
    }

    fn locate(&self, key: &[u8]) -> Option<usize> {
        match self.moved.get(key) {
            Some(position) => *position,
            None => self.state.index.get(key).copied(),
        }
    }

    fn page(&mut self, position: usize) -> Result<&mut DataPage> {
        if !self.pages.contains_key(&position) {
            let page = DataPage::decode(&self.memory.read(self.page_id(position))?)?;
            self.pages.insert(position, page);
        }
        self.pages
            .get_mut(&position)
            .ok_or_else(|| Error::internal("staged page vanished"))
    }

    fn free(&self, position: usize) -> usize {
        self.pages.get(&position).map_or_else(
            || self.state.free.get(position).copied().unwrap_or(0),
            |page| page.free(self.page_size),
        )
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.locate(key) {
            Some(position) => Ok(self.page(position)?.get(key).map(<[u8]>::to_vec)),
            None => Ok(None),
        }
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let size = entry_size(key.len(), value.len());
        let max = max_entry_size(self.page_size);
        if size > max {
            return Err(Error::EntryTooLarge { size, max });
        }

        let page_size = self.page_size;
        if let Some(position) = self.locate(key) {
            let page = self.page(position)?;
            if page.fits(key, value.len(), page_size) {
                page.upsert(key, value, page_size);
                return Ok(());
            }
            // Grown past its page: move it
            page.remove(key);
        }

        let target = self.find_space(size)?;
        if !self.page(target)?.upsert(key, value, page_size) {
            return Err(Error::internal("selected page has no room"));
        }
        self.moved.insert(key.to_vec(), Some(target));
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let Some(position) = self.locate(key) else {
            return Ok(false);
        };
        self.page(position)?.remove(key);
        self.moved.insert(key.to_vec(), None);
        Ok(true)
    }

    /// First page with room for `size` bytes, allocating one if needed
    fn find_space(&mut self, size: usize) -> Result<usize> {
        if let Some(position) = (0..self.page_count()).find(|&p| self.free(p) >= size) {
            return Ok(position);
        }
        let id = self.memory.allocate(self.cache_id, self.partition)?;
        self.new_pages.push(id);
        let position = self.page_count() - 1;
        self.pages.insert(position, DataPage::default());
        Ok(position)
    }

    /// Byte-range deltas of every staged page against page memory
    fn deltas(&self) -> Result<Vec<PageDelta>> {
        let mut deltas = Vec::new();
        for (&position, page) in &self.pages {
            let id = self.page_id(position);
            let old = self.memory.read(id)?;
            let new = page.encode(self.page_size);
            if let Some((offset, bytes)) = diff(&old, &new) {
                deltas.push(PageDelta {
                    page: id,
                    offset: offset as u32,
                    bytes: bytes.to_vec(),
                });
            }
        }
        Ok(deltas)
    }

    fn into_changes(self) -> Changes {
        Changes {
            free: self
                .pages
                .iter()
                .map(|(&position, page)| (position, page.free(self.page_size)))
                .collect(),
            new_pages: self.new_pages,
            moved: self.moved,
        }
    }
}

/// Staged changes detached from the partition borrow
struct Changes {
    free: Vec<(usize, usize)>,
    new_pages: Vec<PageId>,
    moved: HashMap<Vec<u8>, Option<usize>>,
}

impl Changes {
    /// Release pages allocated for a group that is not applied
    fn abort(self, memory: &PageMemory) {
        for id in self.new_pages {
            memory.free(id);
        }
    }

    fn commit(self, state: &mut PartitionState, page_size: usize) {
        for id in self.new_pages {
            state.pages.push(id);
            state.free.push(page_size);
        }
        for (position, free) in self.free {
            state.free[position] = free;
        }
        for (key, position) in self.moved {
            match position {
                Some(position) => {
                    state.index.insert(key, position);
                }
                None => {
                    state.index.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridstore_affinity::AffinityFunction;
    use gridstore_common::AtomicityMode;
    use gridstore_common::config::MemoryPolicyConfig;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::path::Path;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::with_data_dir(dir);
        config.memory.page_size = 1024;
        config.memory.policies = vec![MemoryPolicyConfig {
            name: "default".into(),
            max_size: 4 * 1024 * 1024,
        }];
        config.checkpoint.background = false;
        config.durability = Durability::Relaxed;
        config
    }

    fn cache1() -> CacheConfig {
        CacheConfig::new("cache1").with_affinity(AffinityFunction::rendezvous(32, 0))
    }

    fn key(i: u32) -> Vec<u8> {
        i.to_le_bytes().to_vec()
    }

    fn page_images(engine: &Engine) -> Vec<(PageId, Vec<u8>)> {
        let mut images = Vec::new();
        for region in engine.shared.regions.values() {
            for id in region.memory.page_ids() {
                images.push((id, region.memory.read(id).unwrap().to_vec()));
            }
        }
        images
    }

    #[test]
    fn test_put_get_remove() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let cache = engine.create_cache(cache1()).unwrap().id;

        engine.put(cache, b"a", b"1").unwrap();
        engine.put(cache, b"b", b"2").unwrap();
        engine.put(cache, b"a", b"3").unwrap();

        assert_eq!(engine.get(cache, b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(engine.get(cache, b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(engine.get(cache, b"zz").unwrap(), None);
        assert_eq!(engine.len(cache).unwrap(), 2);

        assert!(engine.remove(cache, b"a").unwrap());
        assert!(!engine.remove(cache, b"a").unwrap());
        assert_eq!(engine.get(cache, b"a").unwrap(), None);
    }

    #[test]
    fn test_values_spill_across_pages() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let cache = engine
            .create_cache(CacheConfig::new("big").with_affinity(AffinityFunction::rendezvous(1, 0)))
            .unwrap()
            .id;

        for i in 0..50u32 {
            engine.put(cache, &key(i), &vec![i as u8; 100]).unwrap();
        }
        // Grow one entry so it must move to another page
        engine.put(cache, &key(3), &vec![9u8; 900]).unwrap();

        assert!(engine.stats().pages > 1);
        assert_eq!(engine.get(cache, &key(3)).unwrap(), Some(vec![9u8; 900]));
        for i in (0..50u32).filter(|i| *i != 3) {
            assert_eq!(engine.get(cache, &key(i)).unwrap(), Some(vec![i as u8; 100]));
        }
    }

    #[test]
    fn test_entry_too_large() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let cache = engine.create_cache(cache1()).unwrap().id;

        let err = engine.put(cache, b"k", &vec![0u8; 2000]).unwrap_err();
        assert!(matches!(err, Error::EntryTooLarge { .. }));
        assert_eq!(engine.stats().pages, 0);
    }

    #[test]
    fn test_out_of_memory_aborts_batch() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.memory.policies[0].max_size = 2 * 1024;
        let engine = Engine::open(config).unwrap();
        let cache = engine
            .create_cache(CacheConfig::new("tiny").with_affinity(AffinityFunction::rendezvous(1, 0)))
            .unwrap()
            .id;

        let entries: Vec<_> = (0..10u32).map(|i| (key(i), vec![1u8; 500])).collect();
        let lsn = engine.stats().wal_lsn;
        let err = engine.put_all(cache, entries).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));

        // Nothing of the group was logged or applied
        assert_eq!(engine.stats().wal_lsn, lsn);
        assert_eq!(engine.len(cache).unwrap(), 0);
        assert_eq!(engine.stats().allocated_bytes, 0);
    }

    fn increment(_: &[u8], old: Option<&[u8]>, _: &[u8]) -> Result<Option<Vec<u8>>> {
        let n = old.map_or(0, |b| u64::from_le_bytes(b.try_into().unwrap()));
        Ok(Some((n + 1).to_le_bytes().to_vec()))
    }

    #[test]
    fn test_out_of_memory_leaves_whole_batch_unapplied() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.memory.policies[0].max_size = 8 * 1024;
        let engine = Engine::open(config).unwrap();
        let filler = engine
            .create_cache(CacheConfig::new("filler").with_affinity(AffinityFunction::rendezvous(4, 0)))
            .unwrap()
            .id;
        let counters = engine
            .create_cache(CacheConfig::new("counters").with_affinity(AffinityFunction::rendezvous(8, 0)))
            .unwrap()
            .id;
        let entries: Vec<_> = (0..64u32).map(|i| (key(i), vec![1u8])).collect();
        engine.put_all(filler, entries).unwrap();

        // Early partitions of the batch fit, a later one runs out of pages
        let batch: Vec<_> = (0..64u32).map(|i| (key(i), Vec::new())).collect();
        let lsn = engine.stats().wal_lsn;
        let allocated = engine.stats().allocated_bytes;
        let err = engine
            .apply_batch(counters, batch.clone(), increment)
            .unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
        assert_eq!(engine.stats().wal_lsn, lsn);
        assert_eq!(engine.stats().allocated_bytes, allocated);
        assert_eq!(engine.len(counters).unwrap(), 0);

        // Retrying once memory is back counts every key once
        engine.destroy_cache(filler).unwrap();
        engine.apply_batch(counters, batch, increment).unwrap();
        assert_eq!(engine.len(counters).unwrap(), 64);
        for i in 0..64u32 {
            assert_eq!(
                engine.get(counters, &key(i)).unwrap(),
                Some(1u64.to_le_bytes().to_vec())
            );
        }
    }

    #[test]
    fn test_apply_batch_in_order() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let cache = engine.create_cache(cache1()).unwrap().id;

        let items = vec![
            (b"n".to_vec(), 1u64.to_le_bytes().to_vec()),
            (b"n".to_vec(), 2u64.to_le_bytes().to_vec()),
            (b"n".to_vec(), 3u64.to_le_bytes().to_vec()),
        ];
        let mut seen = Vec::new();
        engine
            .apply_batch(cache, items, |_, old, arg| {
                let old = old.map_or(0, |b| u64::from_le_bytes(b.try_into().unwrap()));
                let add = u64::from_le_bytes(arg.try_into().unwrap());
                seen.push(old);
                Ok(Some((old * 10 + add).to_le_bytes().to_vec()))
            })
            .unwrap();

        assert_eq!(seen, vec![0, 1, 12]);
        assert_eq!(
            engine.get(cache, b"n").unwrap(),
            Some(123u64.to_le_bytes().to_vec())
        );
    }

    #[test]
    fn test_lifecycle_errors() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let d = engine.create_cache(cache1()).unwrap();

        assert!(matches!(
            engine.create_cache(cache1()),
            Err(Error::CacheAlreadyExists(_))
        ));
        assert_eq!(engine.get_or_create_cache(cache1()).unwrap(), d);

        engine.destroy_cache(d.id).unwrap();
        assert!(engine.destroy_cache(d.id).unwrap_err().is_not_found());
        assert!(engine.get(d.id, b"k").unwrap_err().is_not_found());
        assert!(!engine.router().contains(d.id));

        let unknown = CacheConfig::new("x").with_memory_policy("nope");
        assert!(matches!(
            engine.create_cache(unknown),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_destroy_races_writers() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(Engine::open(test_config(dir.path())).unwrap());
        let id = engine.create_cache(cache1()).unwrap().id;

        let writers: Vec<_> = (0..4u32)
            .map(|t| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    let mut gone = false;
                    for i in 0..500u32 {
                        let k = t * 1000 + i;
                        match engine.put(id, &key(k), &key(k)) {
                            Ok(()) => assert!(!gone, "put accepted after destroy"),
                            Err(e) => {
                                assert!(e.is_not_found(), "unexpected error: {e}");
                                gone = true;
                            }
                        }
                    }
                })
            })
            .collect();
        std::thread::sleep(std::time::Duration::from_millis(5));
        engine.destroy_cache(id).unwrap();
        for w in writers {
            w.join().unwrap();
        }

        assert!(engine.get(id, &key(0)).unwrap_err().is_not_found());
        assert_eq!(engine.stats().pages, 0);
        assert_eq!(engine.stats().allocated_bytes, 0);
        drop(engine);

        // Crash and recover: no update is logged after the destroy record
        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.recovery_state(), RecoveryState::Ready);
        assert!(engine.cache("cache1").is_none());
        assert_eq!(engine.stats().caches, 0);
        assert_eq!(engine.stats().pages, 0);
        assert_eq!(engine.stats().allocated_bytes, 0);
    }

    #[test]
    fn test_destroy_reclaims_pages() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let d = engine.create_cache(cache1()).unwrap();
        for i in 0..100 {
            engine.put(d.id, &key(i), b"1").unwrap();
        }
        assert!(engine.stats().pages > 0);

        engine.destroy_cache(d.id).unwrap();
        assert_eq!(engine.stats().pages, 0);
        assert_eq!(engine.stats().allocated_bytes, 0);
    }

    #[test]
    fn test_recover_without_checkpoint() {
        let dir = tempdir().unwrap();
        let id = {
            let engine = Engine::open(test_config(dir.path())).unwrap();
            let d = engine.create_cache(cache1()).unwrap();
            for i in 0..200 {
                engine.put(d.id, &key(i), &key(i * 2)).unwrap();
            }
            d.id
            // dropped without close: crash
        };

        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.recovery_state(), RecoveryState::Ready);
        assert_eq!(engine.recovery_report().checkpoint_lsn, 0);
        assert_eq!(engine.len(id).unwrap(), 200);
        for i in 0..200 {
            assert_eq!(engine.get(id, &key(i)).unwrap(), Some(key(i * 2)));
        }
    }

    #[test]
    fn test_recover_from_checkpoint_and_tail() {
        let dir = tempdir().unwrap();
        let id = {
            let engine = Engine::open(test_config(dir.path())).unwrap();
            let d = engine.create_cache(cache1()).unwrap();
            for i in 0..100 {
                engine.put(d.id, &key(i), b"old").unwrap();
            }
            let report = engine.checkpoint().unwrap();
            assert!(report.pages_flushed > 0);
            for i in 50..150 {
                engine.put(d.id, &key(i), b"new").unwrap();
            }
            d.id
        };

        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert!(engine.recovery_report().checkpoint_lsn > 0);
        assert!(engine.recovery_report().pages_loaded > 0);
        assert_eq!(engine.len(id).unwrap(), 150);
        assert_eq!(engine.get(id, &key(10)).unwrap(), Some(b"old".to_vec()));
        assert_eq!(engine.get(id, &key(120)).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_checkpoint_truncates_wal() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let d = engine.create_cache(cache1()).unwrap();
        for i in 0..100 {
            engine.put(d.id, &key(i), b"v").unwrap();
        }
        let before = engine.stats().wal_size;
        let report = engine.checkpoint().unwrap();

        assert!(report.records_truncated > 100);
        assert!(engine.stats().wal_size < before);
        assert_eq!(engine.stats().dirty_pages, 0);
        assert_eq!(engine.stats().last_checkpoint_lsn, report.lsn);
    }

    #[test]
    fn test_close_checkpoints() {
        let dir = tempdir().unwrap();
        let id = {
            let engine = Engine::open(test_config(dir.path())).unwrap();
            let d = engine.create_cache(cache1()).unwrap();
            engine.put(d.id, b"k", b"v").unwrap();
            engine.close().unwrap();
            d.id
        };

        let engine = Engine::open(test_config(dir.path())).unwrap();
        // Only the checkpoint-end record follows the marker
        assert_eq!(engine.recovery_report().records_replayed, 1);
        assert_eq!(engine.get(id, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_reopen_after_close_has_nothing_to_checkpoint() {
        let dir = tempdir().unwrap();
        let id = {
            let engine = Engine::open(test_config(dir.path())).unwrap();
            let d = engine.create_cache(cache1()).unwrap();
            engine.put(d.id, b"k", b"v").unwrap();
            engine.close().unwrap();
            d.id
        };

        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert!(!engine.shared.has_changes());
        let lsn = engine.stats().wal_lsn;
        engine.close().unwrap();

        // The second close logged nothing
        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.stats().wal_lsn, lsn);
        assert!(!engine.shared.has_changes());

        engine.put(id, b"k", b"w").unwrap();
        assert!(engine.shared.has_changes());
    }

    #[test]
    fn test_destroyed_cache_stays_destroyed() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(test_config(dir.path())).unwrap();
            let d = engine.create_cache(cache1()).unwrap();
            engine.put(d.id, b"k", b"v").unwrap();
            engine.checkpoint().unwrap();
            engine.destroy_cache(d.id).unwrap();
        }

        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert!(engine.cache("cache1").is_none());
        assert_eq!(engine.stats().pages, 0);

        // The destroyed id is not handed out again
        let again = engine.create_cache(cache1()).unwrap();
        assert!(again.id > CacheId::new(1));
        assert_eq!(engine.get(again.id, b"k").unwrap(), None);
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let d = engine.create_cache(cache1()).unwrap();
        for i in 0..64 {
            engine.put(d.id, &key(i), b"v").unwrap();
        }
        engine.clear(d.id).unwrap();
        assert!(engine.is_empty(d.id).unwrap());
        drop(engine);

        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert!(engine.is_empty(d.id).unwrap());
    }

    #[test]
    fn test_descriptor_modes_persist() {
        let dir = tempdir().unwrap();
        let config = cache1()
            .with_atomicity(AtomicityMode::Transactional)
            .with_write_sync(gridstore_common::WriteSyncMode::FullSync);
        let created = {
            let engine = Engine::open(test_config(dir.path())).unwrap();
            engine.create_cache(config).unwrap()
        };

        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.cache("cache1"), Some(created));
    }

    #[test]
    fn test_concurrent_writers_and_checkpoints() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(Engine::open(test_config(dir.path())).unwrap());
        let id = engine.create_cache(cache1()).unwrap().id;

        let writers: Vec<_> = (0..4u32)
            .map(|t| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for i in 0..250u32 {
                        let k = t * 1000 + i;
                        engine.put(id, &key(k), &key(k)).unwrap();
                    }
                })
            })
            .collect();
        for _ in 0..5 {
            engine.checkpoint().unwrap();
        }
        for w in writers {
            w.join().unwrap();
        }
        drop(engine);

        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.len(id).unwrap(), 1000);
        for t in 0..4u32 {
            for i in 0..250u32 {
                let k = t * 1000 + i;
                assert_eq!(engine.get(id, &key(k)).unwrap(), Some(key(k)));
            }
        }
    }

    #[test]
    fn test_background_checkpointer_runs() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.checkpoint.background = true;
        config.checkpoint.interval_ms = 20;
        let engine = Engine::open(config).unwrap();
        let d = engine.create_cache(cache1()).unwrap();
        engine.put(d.id, b"k", b"v").unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while engine.stats().checkpoints == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(engine.stats().checkpoints > 0);
        engine.close().unwrap();
    }

    #[test]
    fn test_recovery_matches_live_pages_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let live = {
            let engine = Engine::open(test_config(dir.path())).unwrap();
            let id = engine.create_cache(cache1()).unwrap().id;
            for step in 0..2000u32 {
                let k = key(rng.gen_range(0..300));
                if rng.gen_range(0..10) == 0 {
                    engine.remove(id, &k).unwrap();
                } else {
                    let len = rng.gen_range(1..200);
                    engine.put(id, &k, &vec![step as u8; len]).unwrap();
                }
                if step % 500 == 250 {
                    engine.checkpoint().unwrap();
                }
            }
            page_images(&engine)
        };

        let first = page_images(&Engine::open(test_config(dir.path())).unwrap());
        let second = page_images(&Engine::open(test_config(dir.path())).unwrap());
        assert!(!live.is_empty());
        assert_eq!(first, live);
        assert_eq!(second, first);
    }
}
