//! Cache descriptor registry
//!
//! An arena of cache descriptors indexed by [`CacheId`]. The registry itself
//! is purely in-memory; the engine logs every create and destroy to the WAL
//! before applying it here, and the checkpointer persists the whole arena in
//! the checkpoint header.
//!
//! Cache ids are allocated monotonically and never reused, so a WAL record
//! can never be attributed to a later cache that happens to share a name.

use gridstore_affinity::AffinityFunction;
use gridstore_common::{AtomicityMode, CacheId, Error, Result, WriteSyncMode};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Persisted description of a cache
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDescriptor {
    /// Stable id
    pub id: CacheId,
    /// Unique name
    pub name: String,
    /// Routing strategy (also fixes the partition count)
    pub affinity: AffinityFunction,
    /// Atomicity mode
    pub atomicity: AtomicityMode,
    /// Write synchronization mode
    pub write_sync: WriteSyncMode,
    /// Memory policy holding the cache's pages
    pub memory_policy: String,
}

impl CacheDescriptor {
    /// Number of partitions
    #[must_use]
    pub const fn partitions(&self) -> u32 {
        self.affinity.partitions()
    }
}

/// Parameters of a cache to create
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub name: String,
    pub affinity: AffinityFunction,
    pub atomicity: AtomicityMode,
    pub write_sync: WriteSyncMode,
    /// Memory policy; the node's default policy when unset
    pub memory_policy: Option<String>,
}

impl CacheConfig {
    /// Cache with default affinity and modes
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            affinity: AffinityFunction::default(),
            atomicity: AtomicityMode::default(),
            write_sync: WriteSyncMode::default(),
            memory_policy: None,
        }
    }

    #[must_use]
    pub const fn with_affinity(mut self, affinity: AffinityFunction) -> Self {
        self.affinity = affinity;
        self
    }

    #[must_use]
    pub const fn with_atomicity(mut self, atomicity: AtomicityMode) -> Self {
        self.atomicity = atomicity;
        self
    }

    #[must_use]
    pub const fn with_write_sync(mut self, write_sync: WriteSyncMode) -> Self {
        self.write_sync = write_sync;
        self
    }

    #[must_use]
    pub fn with_memory_policy(mut self, policy: impl Into<String>) -> Self {
        self.memory_policy = Some(policy.into());
        self
    }

    /// Check parameters
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_argument("cache name is empty"));
        }
        self.affinity.validate()
    }
}

impl From<&CacheDescriptor> for CacheConfig {
    fn from(descriptor: &CacheDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            affinity: descriptor.affinity,
            atomicity: descriptor.atomicity,
            write_sync: descriptor.write_sync,
            memory_policy: Some(descriptor.memory_policy.clone()),
        }
    }
}

struct RegistryState {
    caches: BTreeMap<CacheId, CacheDescriptor>,
    by_name: HashMap<String, CacheId>,
    next_id: CacheId,
}

/// Arena of live cache descriptors
pub struct Registry {
    state: RwLock<RegistryState>,
    /// Serializes create/destroy sequences (WAL append plus apply)
    lifecycle: Mutex<()>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry; the first allocated id is 1
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                caches: BTreeMap::new(),
                by_name: HashMap::new(),
                next_id: CacheId::new(1),
            }),
            lifecycle: Mutex::new(()),
        }
    }

    /// Replace the contents with a checkpointed arena
    pub fn restore(&self, descriptors: Vec<CacheDescriptor>, next_id: CacheId) {
        let mut state = self.state.write();
        state.caches.clear();
        state.by_name.clear();
        state.next_id = next_id.max(CacheId::new(1));
        for descriptor in descriptors {
            if descriptor.id >= state.next_id {
                state.next_id = descriptor.id.next();
            }
            state.by_name.insert(descriptor.name.clone(), descriptor.id);
            state.caches.insert(descriptor.id, descriptor);
        }
    }

    /// Take the lifecycle lock
    pub fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock()
    }

    /// Build a descriptor with a fresh id
    ///
    /// Fails with `CacheAlreadyExists` if the name is taken. The id is
    /// consumed even if the caller never applies the descriptor.
    pub fn prepare(&self, config: &CacheConfig, memory_policy: String) -> Result<CacheDescriptor> {
        config.validate()?;
        let mut state = self.state.write();
        if state.by_name.contains_key(&config.name) {
            return Err(Error::CacheAlreadyExists(config.name.clone()));
        }
        let id = state.next_id;
        state.next_id = id.next();
        Ok(CacheDescriptor {
            id,
            name: config.name.clone(),
            affinity: config.affinity,
            atomicity: config.atomicity,
            write_sync: config.write_sync,
            memory_policy,
        })
    }

    /// Add a descriptor
    pub fn create(&self, descriptor: CacheDescriptor) -> Result<()> {
        let mut state = self.state.write();
        if state.by_name.contains_key(&descriptor.name) || state.caches.contains_key(&descriptor.id)
        {
            return Err(Error::CacheAlreadyExists(descriptor.name));
        }
        Self::insert(&mut state, descriptor);
        Ok(())
    }

    /// Remove a descriptor
    pub fn destroy(&self, id: CacheId) -> Result<CacheDescriptor> {
        let mut state = self.state.write();
        Self::remove(&mut state, id).ok_or_else(|| Error::CacheNotFound(id.to_string()))
    }

    /// Replay a create record. Re-applying a present descriptor is a no-op.
    pub fn apply_create(&self, descriptor: CacheDescriptor) -> bool {
        let mut state = self.state.write();
        if state.caches.contains_key(&descriptor.id) {
            return false;
        }
        if let Some(old) = state.by_name.get(&descriptor.name).copied() {
            // Name reuse without a logged destroy cannot come from a healthy log
            debug!("Replacing cache {} registered under {}", old, descriptor.name);
            Self::remove(&mut state, old);
        }
        Self::insert(&mut state, descriptor);
        true
    }

    /// Replay a destroy record. Destroying an absent cache is a no-op.
    pub fn apply_destroy(&self, id: CacheId) -> Option<CacheDescriptor> {
        let mut state = self.state.write();
        let removed = Self::remove(&mut state, id);
        if id >= state.next_id {
            state.next_id = id.next();
        }
        removed
    }

    fn insert(state: &mut RegistryState, descriptor: CacheDescriptor) {
        if descriptor.id >= state.next_id {
            state.next_id = descriptor.id.next();
        }
        state.by_name.insert(descriptor.name.clone(), descriptor.id);
        state.caches.insert(descriptor.id, descriptor);
    }

    fn remove(state: &mut RegistryState, id: CacheId) -> Option<CacheDescriptor> {
        let descriptor = state.caches.remove(&id)?;
        if state.by_name.get(&descriptor.name) == Some(&id) {
            state.by_name.remove(&descriptor.name);
        }
        Some(descriptor)
    }

    /// Descriptor by id
    #[must_use]
    pub fn get(&self, id: CacheId) -> Option<CacheDescriptor> {
        self.state.read().caches.get(&id).cloned()
    }

    /// Descriptor by name
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<CacheDescriptor> {
        let state = self.state.read();
        let id = state.by_name.get(name)?;
        state.caches.get(id).cloned()
    }

    /// All descriptors, ordered by id
    #[must_use]
    pub fn list(&self) -> Vec<CacheDescriptor> {
        self.state.read().caches.values().cloned().collect()
    }

    /// Descriptors plus the next id, taken atomically
    #[must_use]
    pub fn snapshot(&self) -> (Vec<CacheDescriptor>, CacheId) {
        let state = self.state.read();
        (state.caches.values().cloned().collect(), state.next_id)
    }

    /// Id the next created cache will get
    #[must_use]
    pub fn next_id(&self) -> CacheId {
        self.state.read().next_id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().caches.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
