//! Affinity functions
//!
//! A closed set of routing strategies selected when a cache is created. Both
//! are pure functions of their parameters, the key and the membership view.

use gridstore_common::{Error, NodeId, PartitionId, Result};
use serde::{Deserialize, Serialize};

/// Default partition count for new caches
pub const DEFAULT_PARTITIONS: u32 = 1024;

/// Routing strategy of a cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AffinityFunction {
    /// Rendezvous (HRW) hashing: minimal movement on membership change
    Rendezvous {
        /// Number of partitions
        partitions: u32,
        /// Backup copies per partition
        backups: u32,
    },
    /// Fixed replica placement over the sorted node list
    FixedReplica {
        /// Number of partitions
        partitions: u32,
        /// Total copies per partition (primary included)
        replicas: u32,
    },
}

impl Default for AffinityFunction {
    fn default() -> Self {
        Self::rendezvous(DEFAULT_PARTITIONS, 0)
    }
}

impl AffinityFunction {
    /// Rendezvous function with the given partition and backup counts
    #[must_use]
    pub const fn rendezvous(partitions: u32, backups: u32) -> Self {
        Self::Rendezvous {
            partitions,
            backups,
        }
    }

    /// Fixed replica function
    #[must_use]
    pub const fn fixed_replica(partitions: u32, replicas: u32) -> Self {
        Self::FixedReplica {
            partitions,
            replicas,
        }
    }

    /// Check parameters
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Rendezvous { partitions: 0, .. } | Self::FixedReplica { partitions: 0, .. } => {
                Err(Error::invalid_argument("partition count must be positive"))
            }
            Self::FixedReplica { replicas: 0, .. } => {
                Err(Error::invalid_argument("replica count must be positive"))
            }
            _ => Ok(()),
        }
    }

    /// Number of partitions
    #[must_use]
    pub const fn partitions(&self) -> u32 {
        match *self {
            Self::Rendezvous { partitions, .. } | Self::FixedReplica { partitions, .. } => {
                partitions
            }
        }
    }

    /// Copies kept per partition (primary included)
    #[must_use]
    pub const fn copies(&self) -> u32 {
        match *self {
            Self::Rendezvous { backups, .. } => backups + 1,
            Self::FixedReplica { replicas, .. } => replicas,
        }
    }

    /// Partition of a key
    #[must_use]
    pub fn partition_for(&self, key: &[u8]) -> PartitionId {
        let hash = xxhash_rust::xxh64::xxh64(key, 0);
        (hash % u64::from(self.partitions().max(1))) as PartitionId
    }

    /// Owners of a partition, primary first
    ///
    /// `nodes` must be in canonical (sorted) order.
    #[must_use]
    pub fn assign(&self, partition: PartitionId, nodes: &[NodeId]) -> Vec<NodeId> {
        if nodes.is_empty() {
            return Vec::new();
        }
        let copies = (self.copies() as usize).min(nodes.len());

        match self {
            Self::Rendezvous { .. } => {
                let seed = xxhash_rust::xxh64::xxh64(&partition.to_le_bytes(), 0);
                let mut scored: Vec<(u64, NodeId)> = nodes
                    .iter()
                    .map(|node| (xxhash_rust::xxh64::xxh64(node.as_bytes(), seed), *node))
                    .collect();

                // Highest score wins; node id breaks ties
                scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                scored.into_iter().take(copies).map(|(_, n)| n).collect()
            }
            Self::FixedReplica { .. } => {
                let start = partition as usize % nodes.len();
                (0..copies)
                    .map(|i| nodes[(start + i) % nodes.len()])
                    .collect()
            }
        }
    }
}
