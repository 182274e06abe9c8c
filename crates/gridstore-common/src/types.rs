//! Core type definitions for GridStore
//!
//! This module defines the identifiers shared by the storage engine, the
//! affinity layer and the grid.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// WAL log sequence number. Strictly increasing and gap-free within one log.
pub type Lsn = u64;

/// Partition index within a cache (`0..partitions`)
pub type PartitionId = u32;

/// Version of the cluster membership view
pub type TopologyEpoch = u64;

/// Stable integer identifier of a cache
///
/// Allocated monotonically by the registry and never reused.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct CacheId(u32);

impl CacheId {
    /// Create from a raw id
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The id following this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheId({})", self.0)
    }
}

/// Identifier of a page: (cache, partition, page index within the partition)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId {
    /// Cache owning the page
    pub cache_id: CacheId,
    /// Partition owning the page
    pub partition: PartitionId,
    /// Page index within the partition
    pub index: u32,
}

impl PageId {
    /// Create a new page ID
    #[must_use]
    pub const fn new(cache_id: CacheId, partition: PartitionId, index: u32) -> Self {
        Self {
            cache_id,
            partition,
            index,
        }
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PageId({}:{}:{})",
            self.cache_id, self.partition, self.index
        )
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.cache_id, self.partition, self.index)
    }
}

/// Unique identifier for a grid node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a new random node ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parse from the hyphenated string form
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cache atomicity mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomicityMode {
    /// Single-entry atomic updates
    #[default]
    Atomic,
    /// Entries may take part in transactions
    Transactional,
}

/// Write synchronization mode reported for a cache
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteSyncMode {
    /// Wait for the primary only
    #[default]
    PrimarySync,
    /// Wait for primary and all backups
    FullSync,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_id_ordering() {
        let a = CacheId::new(1);
        let b = a.next();
        assert!(a < b);
        assert_eq!(b.get(), 2);
        assert_eq!(b.to_string(), "2");
    }

    #[test]
    fn test_page_id_ordering() {
        let c = CacheId::new(3);
        let p1 = PageId::new(c, 0, 5);
        let p2 = PageId::new(c, 1, 0);
        assert!(p1 < p2);
        assert_eq!(p1.to_string(), "3:0:5");
    }

    #[test]
    fn test_node_id_parse() {
        let id = NodeId::new();
        let parsed = NodeId::parse(&format!("{id}\n")).unwrap();
        assert_eq!(parsed, id);
        assert!(NodeId::parse("not-a-uuid").is_none());
    }
}
