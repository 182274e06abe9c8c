//! Recovery manager
//!
//! Restores a node from durable state:
//! ```text
//! Cold -> LoadingSnapshot -> ReplayingWal -> Ready
//!   \___________\________________\________-> Failed
//! ```
//! The snapshot is whatever the checkpoint header references; the WAL is
//! replayed from the record after the checkpoint marker. Page deltas are
//! absolute byte ranges, so replaying a delta whose effect is already in a
//! loaded image rewrites identical bytes.

use crate::checkpoint::CheckpointHeader;
use crate::engine::{CacheRuntime, Shared};
use crate::wal::WalPayload;
use gridstore_common::{CacheId, Error, Lsn, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Recovery state of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    /// Nothing loaded yet
    Cold,
    /// Reading the checkpointed pages and registry
    LoadingSnapshot,
    /// Applying WAL records after the checkpoint marker
    ReplayingWal,
    /// Accepting operations
    Ready,
    /// Recovery hit an unrecoverable error; the node must not join
    Failed,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cold => "cold",
            Self::LoadingSnapshot => "loading-snapshot",
            Self::ReplayingWal => "replaying-wal",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Observable recovery state
pub struct RecoveryStatus {
    state: RwLock<RecoveryState>,
}

impl Default for RecoveryStatus {
    fn default() -> Self {
        Self {
            state: RwLock::new(RecoveryState::Cold),
        }
    }
}

impl RecoveryStatus {
    /// Current state
    #[must_use]
    pub fn get(&self) -> RecoveryState {
        *self.state.read()
    }

    /// Whether operations are accepted
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.get() == RecoveryState::Ready
    }

    fn transition(&self, to: RecoveryState) {
        let mut state = self.state.write();
        debug!("Recovery state {} -> {}", *state, to);
        *state = to;
    }
}

/// What recovery found and did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Marker of the checkpoint loaded (0 if none)
    pub checkpoint_lsn: Lsn,
    /// Pages loaded from the page stores
    pub pages_loaded: usize,
    /// WAL records applied
    pub records_replayed: u64,
    /// Last LSN in the log
    pub last_lsn: Lsn,
    /// Live caches after recovery
    pub caches: usize,
}

/// Run recovery to completion
pub(crate) fn recover(shared: &Shared) -> Result<RecoveryReport> {
    let started = Instant::now();
    match run(shared) {
        Ok(report) => {
            shared.recovery.transition(RecoveryState::Ready);
            info!(
                "Recovery complete in {:?}: checkpoint LSN {}, {} pages loaded, {} records replayed, {} caches",
                started.elapsed(),
                report.checkpoint_lsn,
                report.pages_loaded,
                report.records_replayed,
                report.caches
            );
            Ok(report)
        }
        Err(e) => {
            shared.recovery.transition(RecoveryState::Failed);
            error!("Recovery failed: {}", e);
            Err(e)
        }
    }
}

fn run(shared: &Shared) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    shared.recovery.transition(RecoveryState::LoadingSnapshot);
    if let Some(header) = CheckpointHeader::load(&shared.config.store_dir())? {
        report.checkpoint_lsn = header.lsn;
        report.pages_loaded = load_snapshot(shared, header)?;
    }

    shared.recovery.transition(RecoveryState::ReplayingWal);
    let (replayed, last_lsn) = replay(shared, report.checkpoint_lsn)?;
    report.records_replayed = replayed;
    report.last_lsn = last_lsn;

    // Rebuild partition indexes, then activate routing
    for descriptor in shared.registry.list() {
        let region = shared.region(&descriptor.memory_policy)?;
        let runtime = CacheRuntime::rebuild(descriptor, region)?;
        shared.install(Arc::new(runtime));
    }
    report.caches = shared.registry.len();
    Ok(report)
}

fn load_snapshot(shared: &Shared, header: CheckpointHeader) -> Result<usize> {
    let page_size = shared.config.memory.page_size;
    if header.page_size as usize != page_size {
        return Err(Error::Configuration(format!(
            "page store was written with page size {}, configured page size is {}",
            header.page_size, page_size
        )));
    }

    for descriptor in &header.caches {
        shared.region(&descriptor.memory_policy)?;
    }
    shared
        .registry
        .restore(header.caches, CacheId::new(header.next_cache_id));

    let mut loaded = 0;
    for (policy, table) in &header.slots {
        let region = shared.region(policy)?;
        let mut store = region.store.lock();
        store.mark_used(table.values().copied())?;
        for (&id, &slot) in table {
            let (image, lsn) = store.read_page(slot, id)?;
            region.memory.load(id, &image, lsn)?;
            loaded += 1;
        }
    }

    let mut state = shared.checkpoint.lock();
    state.slots = header.slots;
    state.last_lsn = header.lsn;
    Ok(loaded)
}

/// Apply every record after `checkpoint_lsn`; returns (records, last LSN)
fn replay(shared: &Shared, checkpoint_lsn: Lsn) -> Result<(u64, Lsn)> {
    let last_lsn = shared.wal.current_lsn();
    if last_lsn < checkpoint_lsn {
        return Err(Error::corrupt_log(
            last_lsn,
            format!("log ends before checkpoint marker {checkpoint_lsn}"),
        ));
    }

    let mut replayed = 0;
    for record in shared.wal.read_from(checkpoint_lsn + 1)? {
        let record = record?;
        let lsn = record.lsn;
        match record.payload {
            WalPayload::PageUpdate { cache_id, deltas } => {
                let descriptor = shared.registry.get(cache_id).ok_or_else(|| {
                    Error::corrupt_log(lsn, format!("update for unknown cache {cache_id}"))
                })?;
                let region = shared.region(&descriptor.memory_policy)?;
                for delta in deltas {
                    region.memory.ensure(delta.page)?;
                    region
                        .memory
                        .apply_delta(delta.page, lsn, delta.offset as usize, &delta.bytes)
                        .map_err(|e| Error::corrupt_log(lsn, e.to_string()))?;
                }
            }
            WalPayload::CacheCreate { descriptor } => {
                shared.region(&descriptor.memory_policy)?;
                debug!("Replay create of cache {} at LSN {}", descriptor.name, lsn);
                shared.registry.apply_create(descriptor);
            }
            WalPayload::CacheDestroy { cache_id } => {
                debug!("Replay destroy of cache {} at LSN {}", cache_id, lsn);
                if let Some(descriptor) = shared.registry.apply_destroy(cache_id) {
                    shared.region(&descriptor.memory_policy)?.memory.reclaim_cache(cache_id);
                }
            }
            WalPayload::CheckpointEnd { begin } if begin == checkpoint_lsn => {
                // Nothing after this record means nothing to checkpoint
                shared.checkpoint.lock().last_end = lsn;
            }
            WalPayload::CheckpointBegin | WalPayload::CheckpointEnd { .. } => {}
        }
        replayed += 1;
    }
    Ok((replayed, last_lsn))
}
