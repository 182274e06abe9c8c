//! Affinity router
//!
//! Holds the routing table of every live cache and the current membership
//! view. Partition assignments are computed lazily per cache and cached
//! until the topology epoch changes.

use crate::function::AffinityFunction;
use crate::topology::TopologyView;
use dashmap::DashMap;
use gridstore_common::{CacheId, Error, NodeId, PartitionId, Result, TopologyEpoch};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Owners of every partition of one cache at one epoch
#[derive(Clone, Debug)]
pub struct PartitionAssignment {
    /// Epoch the assignment was computed for
    pub epoch: TopologyEpoch,
    /// Owners per partition, primary first
    owners: Vec<Vec<NodeId>>,
}

impl PartitionAssignment {
    fn compute(function: &AffinityFunction, view: &TopologyView) -> Self {
        let owners = (0..function.partitions())
            .map(|p| function.assign(p, view.nodes()))
            .collect();
        Self {
            epoch: view.epoch,
            owners,
        }
    }

    /// Owners of a partition, primary first
    #[must_use]
    pub fn owners(&self, partition: PartitionId) -> &[NodeId] {
        self.owners
            .get(partition as usize)
            .map_or(&[], Vec::as_slice)
    }

    /// Primary owner of a partition
    #[must_use]
    pub fn primary(&self, partition: PartitionId) -> Option<NodeId> {
        self.owners(partition).first().copied()
    }

    /// Partitions whose primary is `node`
    #[must_use]
    pub fn primary_partitions(&self, node: NodeId) -> Vec<PartitionId> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.first() == Some(&node))
            .map(|(p, _)| p as PartitionId)
            .collect()
    }
}

/// Routing table for all caches known to this node
pub struct AffinityRouter {
    /// Current membership view
    topology: RwLock<TopologyView>,
    /// Affinity function per cache
    functions: DashMap<CacheId, AffinityFunction>,
    /// Cached assignments (invalidated on epoch change)
    assignments: DashMap<CacheId, Arc<PartitionAssignment>>,
}

impl AffinityRouter {
    /// Create a router over an initial view
    #[must_use]
    pub fn new(topology: TopologyView) -> Self {
        Self {
            topology: RwLock::new(topology),
            functions: DashMap::new(),
            assignments: DashMap::new(),
        }
    }

    /// Current membership view
    #[must_use]
    pub fn topology(&self) -> TopologyView {
        self.topology.read().clone()
    }

    /// Current topology epoch
    #[must_use]
    pub fn epoch(&self) -> TopologyEpoch {
        self.topology.read().epoch
    }

    /// Install a newer membership view
    ///
    /// Views that are not newer than the current one are ignored; returns
    /// whether the view was installed.
    pub fn update_topology(&self, view: TopologyView) -> bool {
        let mut current = self.topology.write();
        if view.epoch <= current.epoch && !current.is_empty() {
            return false;
        }
        info!(
            "Topology updated: epoch {} -> {} ({} nodes)",
            current.epoch,
            view.epoch,
            view.len()
        );
        *current = view;
        self.assignments.clear();
        true
    }

    /// Reject requests computed against another epoch
    pub fn check_epoch(&self, requested: TopologyEpoch) -> Result<()> {
        let current = self.epoch();
        if requested == current {
            Ok(())
        } else {
            Err(Error::StaleTopology { requested, current })
        }
    }

    /// Add a cache to the routing table
    pub fn register(&self, cache_id: CacheId, function: AffinityFunction) {
        debug!("Routing registered for cache {}", cache_id);
        self.functions.insert(cache_id, function);
        self.assignments.remove(&cache_id);
    }

    /// Remove a cache from the routing table
    pub fn remove(&self, cache_id: CacheId) {
        debug!("Routing removed for cache {}", cache_id);
        self.functions.remove(&cache_id);
        self.assignments.remove(&cache_id);
    }

    /// Whether a cache is routable
    #[must_use]
    pub fn contains(&self, cache_id: CacheId) -> bool {
        self.functions.contains_key(&cache_id)
    }

    fn function(&self, cache_id: CacheId) -> Result<AffinityFunction> {
        self.functions
            .get(&cache_id)
            .map(|f| *f)
            .ok_or_else(|| Error::CacheNotFound(cache_id.to_string()))
    }

    /// Partition owning `key` in a cache
    pub fn partition_for(&self, cache_id: CacheId, key: &[u8]) -> Result<PartitionId> {
        Ok(self.function(cache_id)?.partition_for(key))
    }

    /// Assignment of a cache at the current epoch
    pub fn assignment(&self, cache_id: CacheId) -> Result<Arc<PartitionAssignment>> {
        let function = self.function(cache_id)?;
        let view = self.topology.read();

        if let Some(cached) = self.assignments.get(&cache_id)
            && cached.epoch == view.epoch
        {
            return Ok(Arc::clone(cached.value()));
        }

        let assignment = Arc::new(PartitionAssignment::compute(&function, &view));
        self.assignments.insert(cache_id, Arc::clone(&assignment));
        Ok(assignment)
    }

    /// Primary owner of a partition at the given epoch
    pub fn owner(
        &self,
        cache_id: CacheId,
        partition: PartitionId,
        epoch: TopologyEpoch,
    ) -> Result<NodeId> {
        self.owners(cache_id, partition, epoch)?
            .first()
            .copied()
            .ok_or_else(|| Error::internal("no live nodes in topology"))
    }

    /// All owners of a partition at the given epoch, primary first
    pub fn owners(
        &self,
        cache_id: CacheId,
        partition: PartitionId,
        epoch: TopologyEpoch,
    ) -> Result<Vec<NodeId>> {
        self.check_epoch(epoch)?;
        let function = self.function(cache_id)?;
        if partition >= function.partitions() {
            return Err(Error::invalid_argument(format!(
                "partition {partition} out of range for cache {cache_id}"
            )));
        }
        Ok(self.assignment(cache_id)?.owners(partition).to_vec())
    }
}
