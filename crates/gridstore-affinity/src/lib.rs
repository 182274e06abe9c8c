//! GridStore Affinity - deterministic key routing
//!
//! Maps a key to a partition and a partition to its owning nodes for a
//! given topology epoch, without any network round-trip.
//!
//! # Algorithms
//!
//! ## Rendezvous (HRW)
//! `partition = hash(key) % partitions`, then every live node is scored with
//! `hash(partition, node_id)` and the highest scores own the partition.
//! A membership change only moves the partitions whose winner changed.
//!
//! ## Fixed replica
//! Nodes are sorted by id and partition `p` is owned by the `replicas`
//! consecutive nodes starting at `p % nodes`.
//!
//! # Example
//! ```ignore
//! use gridstore_affinity::{AffinityFunction, AffinityRouter, TopologyView};
//!
//! let router = AffinityRouter::new(TopologyView::new(1, nodes));
//! router.register(cache_id, AffinityFunction::rendezvous(32, 0));
//! let partition = router.partition_for(cache_id, b"key")?;
//! let owner = router.owner(cache_id, partition, 1)?;
//! ```

pub mod function;
pub mod router;
pub mod topology;

pub use function::AffinityFunction;
pub use router::{AffinityRouter, PartitionAssignment};
pub use topology::TopologyView;
