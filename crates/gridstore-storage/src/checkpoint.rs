//! Checkpointer
//!
//! Bounds WAL replay distance by making the dirty pages of every memory
//! policy durable in the page stores:
//!
//! 1. Under the write barrier (waits only for in-flight mutations to finish
//!    their append-plus-apply): append `checkpoint-begin`, swap out every
//!    dirty set, snapshot the registry.
//! 2. Copy each snapshotted page into a free page store slot and fsync.
//! 3. Append `checkpoint-end` referencing the begin LSN.
//! 4. Atomically replace the checkpoint header (temp file, fsync, rename).
//! 5. Free the slots the previous header referenced and drop WAL records
//!    older than the begin LSN.
//!
//! A crash anywhere before step 4 completes leaves the previous header, and
//! every slot it references, untouched.

use crate::engine::Shared;
use crate::registry::CacheDescriptor;
use crate::wal::{WalPayload, sync_dir};
use gridstore_common::codec::{checksum, read_u32};
use gridstore_common::config::Durability;
use gridstore_common::{CacheId, Error, Lsn, PageId, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Header file magic
const HEADER_MAGIC: u32 = 0x4743_4B50; // "GCKP"

/// Header format version
const HEADER_VERSION: u32 = 1;

/// Header file name inside the store directory
const HEADER_FILE: &str = "checkpoint.meta";

/// Page store slot of every checkpointed page, per memory policy
pub type SlotTable = BTreeMap<String, BTreeMap<PageId, u64>>;

/// Durable description of the last valid checkpoint
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// Checkpoint marker: LSN of the `checkpoint-begin` record
    pub lsn: Lsn,
    /// Page size the stores were written with
    pub page_size: u32,
    /// Next cache id to allocate
    pub next_cache_id: u32,
    /// Registry contents as of the marker
    pub caches: Vec<CacheDescriptor>,
    /// Slots holding the checkpointed pages
    pub slots: SlotTable,
}

impl CheckpointHeader {
    /// Load the header from `dir`; `None` if no checkpoint was ever taken
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(HEADER_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io("failed to read checkpoint header", e)),
        };

        let corrupt = |what: &str| Error::CorruptPageStore(format!("checkpoint header {what}"));
        if read_u32(&bytes, 0) != Some(HEADER_MAGIC) {
            return Err(corrupt("has invalid magic"));
        }
        if read_u32(&bytes, 4) != Some(HEADER_VERSION) {
            return Err(corrupt("has unsupported version"));
        }
        let len = read_u32(&bytes, 8).ok_or_else(|| corrupt("is truncated"))? as usize;
        let body = bytes.get(12..12 + len).ok_or_else(|| corrupt("is truncated"))?;
        let stored_crc = read_u32(&bytes, 12 + len).ok_or_else(|| corrupt("is truncated"))?;
        if checksum(&bytes[..12 + len]) != stored_crc {
            return Err(corrupt("CRC mismatch"));
        }

        bincode::deserialize(body)
            .map(Some)
            .map_err(|e| corrupt(&format!("is undecodable: {e}")))
    }

    /// Replace the header in `dir` atomically
    pub fn write(&self, dir: &Path, durability: Durability) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| Error::io("failed to create store directory", e))?;
        let body = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;

        let mut buf = Vec::with_capacity(16 + body.len());
        buf.extend_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf.extend_from_slice(&HEADER_VERSION.to_le_bytes());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        let crc = checksum(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        let temp_path = dir.join(format!("{HEADER_FILE}.tmp"));
        let path = dir.join(HEADER_FILE);
        {
            let mut file = File::create(&temp_path)
                .map_err(|e| Error::io("failed to create checkpoint header", e))?;
            file.write_all(&buf)
                .map_err(|e| Error::io("failed to write checkpoint header", e))?;
            if durability.sync() {
                file.sync_all()
                    .map_err(|e| Error::io("failed to sync checkpoint header", e))?;
            }
        }

        // Atomic rename
        fs::rename(&temp_path, &path)
            .map_err(|e| Error::io("failed to rename checkpoint header", e))?;
        if durability.sync() {
            sync_dir(dir)?;
        }
        Ok(())
    }
}

/// Checkpoint bookkeeping kept between runs
#[derive(Debug, Default)]
pub(crate) struct CheckpointState {
    /// Slot table of the durable header
    pub slots: SlotTable,
    /// Marker of the durable header
    pub last_lsn: Lsn,
    /// LSN of the `checkpoint-end` of the durable header (written or replayed)
    pub last_end: Lsn,
    /// Checkpoints completed by this process
    pub count: u64,
}

/// Outcome of one checkpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Checkpoint marker
    pub lsn: Lsn,
    /// Pages written to the page stores
    pub pages_flushed: usize,
    /// WAL records compacted away
    pub records_truncated: u64,
}

/// Run one checkpoint. Checkpoints are serialized.
pub(crate) fn run(shared: &Shared) -> Result<CheckpointReport> {
    shared.check_ready()?;
    let mut state = shared.checkpoint.lock();
    let started = Instant::now();

    // Brief critical section: no mutation is between its WAL append and
    // its page apply while the barrier is held
    let (begin, dirty, caches, next_id) = {
        let _barrier = shared.barrier.write();
        // The marker opens a fresh segment, so truncation drops whole files
        shared.wal.rotate()?;
        let begin = shared.wal.append(&WalPayload::CheckpointBegin)?;
        let dirty: Vec<(String, HashSet<PageId>)> = shared
            .regions
            .iter()
            .map(|(name, region)| (name.clone(), region.memory.take_dirty()))
            .collect();
        let (caches, next_id) = shared.registry.snapshot();
        (begin, dirty, caches, next_id)
    };
    info!("Checkpoint begin at LSN {}", begin);

    match complete(shared, &mut state, begin, &dirty, caches, next_id) {
        Ok(report) => {
            info!(
                "Checkpoint at LSN {} complete: {} pages, {} WAL records compacted in {:?}",
                report.lsn,
                report.pages_flushed,
                report.records_truncated,
                started.elapsed()
            );
            Ok(report)
        }
        Err(e) => {
            for (policy, pages) in dirty {
                if let Some(region) = shared.regions.get(&policy) {
                    region.memory.restore_dirty(pages);
                }
            }
            Err(e)
        }
    }
}

fn complete(
    shared: &Shared,
    state: &mut CheckpointState,
    begin: Lsn,
    dirty: &[(String, HashSet<PageId>)],
    caches: Vec<CacheDescriptor>,
    next_id: CacheId,
) -> Result<CheckpointReport> {
    let live: HashSet<CacheId> = caches.iter().map(|d| d.id).collect();
    let mut slots = state.slots.clone();
    let mut released: Vec<(String, u64)> = Vec::new();
    let mut pages_flushed = 0;

    for (policy, pages) in dirty {
        let Some(region) = shared.regions.get(policy) else {
            continue;
        };
        let table = slots.entry(policy.clone()).or_default();
        let mut store = region.store.lock();

        let mut sorted: Vec<PageId> = pages.iter().copied().collect();
        sorted.sort_unstable();
        for id in sorted {
            if !live.contains(&id.cache_id) {
                continue;
            }
            if !region.memory.contains(id) {
                if let Some(old) = table.remove(&id) {
                    released.push((policy.clone(), old));
                }
                continue;
            }
            let (image, lsn) = region.memory.read_with_lsn(id)?;
            let slot = store.write_page(id, lsn, &image)?;
            if let Some(old) = table.insert(id, slot) {
                released.push((policy.clone(), old));
            }
            pages_flushed += 1;
        }
        store.sync()?;
    }

    // Pages of destroyed caches leave the header
    for (policy, table) in &mut slots {
        table.retain(|id, slot| {
            let keep = live.contains(&id.cache_id);
            if !keep {
                released.push((policy.clone(), *slot));
            }
            keep
        });
    }
    slots.retain(|_, table| !table.is_empty());

    let end = shared.wal.append(&WalPayload::CheckpointEnd { begin })?;

    let header = CheckpointHeader {
        lsn: begin,
        page_size: shared.config.memory.page_size as u32,
        next_cache_id: next_id.get(),
        caches,
        slots,
    };
    header.write(&shared.config.store_dir(), shared.config.durability)?;
    debug!("Checkpoint header written for LSN {}", begin);

    for (policy, slot) in released {
        if let Some(region) = shared.regions.get(&policy) {
            region.store.lock().release(slot);
        }
    }
    state.slots = header.slots;
    state.last_lsn = begin;
    state.last_end = end;
    state.count += 1;

    let records_truncated = match shared.wal.truncate_before(begin) {
        Ok(n) => n,
        Err(e) => {
            // The header is durable; the longer log only costs replay time
            warn!("Failed to truncate WAL before LSN {}: {}", begin, e);
            0
        }
    };

    Ok(CheckpointReport {
        lsn: begin,
        pages_flushed,
        records_truncated,
    })
}

/// Wakes the background checkpointer early
#[derive(Default)]
pub(crate) struct CheckpointSignal {
    requested: Mutex<bool>,
    cond: Condvar,
}

impl CheckpointSignal {
    /// Ask for a checkpoint as soon as possible
    pub fn request(&self) {
        let mut requested = self.requested.lock();
        if !*requested {
            *requested = true;
            self.cond.notify_one();
        }
    }

    /// Wait until requested or `timeout` elapses; returns whether requested
    fn wait(&self, timeout: Duration) -> bool {
        let mut requested = self.requested.lock();
        if !*requested {
            let _ = self.cond.wait_for(&mut requested, timeout);
        }
        std::mem::take(&mut *requested)
    }
}

/// Background checkpoint thread
pub(crate) struct Checkpointer {
    shutdown: Arc<AtomicBool>,
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Checkpointer {
    /// Start the thread
    pub fn start(shared: Arc<Shared>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let interval = Duration::from_millis(shared.config.checkpoint.interval_ms.max(1));

        let handle = {
            let shared = Arc::clone(&shared);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("gridstore-checkpointer".into())
                .spawn(move || {
                    info!("Background checkpointer started (interval {:?})", interval);
                    let mut last = Instant::now();

                    while !shutdown.load(Ordering::Acquire) {
                        let requested = shared.signal.wait(interval);
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        if shared.is_failed() {
                            warn!("Node failed, background checkpointer exiting");
                            break;
                        }

                        let due = last.elapsed() >= interval;
                        if !(requested || due || shared.needs_checkpoint()) {
                            continue;
                        }
                        last = Instant::now();
                        if !shared.has_changes() {
                            continue;
                        }

                        if let Err(e) = run(&shared) {
                            error!("Background checkpoint failed: {}", e);
                            if e.is_fatal() {
                                shared.fail(&e);
                                break;
                            }
                        }
                    }

                    info!("Background checkpointer stopped");
                })
                .map_err(|e| Error::io("failed to spawn checkpointer", e))?
        };

        Ok(Self {
            shutdown,
            shared,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for a running checkpoint to finish
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.shared.signal.request();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.stop();
    }
}
