//! Configuration types for GridStore
//!
//! This module defines configuration structures used across components.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest page size the page layout can address
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 512;

/// Root configuration for a GridStore node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Page memory configuration
    pub memory: MemoryConfig,
    /// Write-ahead log configuration
    pub wal: WalConfig,
    /// Checkpoint configuration
    pub checkpoint: CheckpointConfig,
    /// Durability mode
    pub durability: Durability,
}

impl Config {
    /// Configuration rooted at the given data directory
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node: NodeConfig {
                data_dir: data_dir.into(),
                ..NodeConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let page_size = self.memory.page_size;
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || page_size % MIN_PAGE_SIZE != 0
        {
            return Err(Error::Configuration(format!(
                "page size {page_size} must be a multiple of {MIN_PAGE_SIZE} between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}"
            )));
        }

        if self.memory.policies.is_empty() {
            return Err(Error::Configuration(
                "at least one memory policy is required".into(),
            ));
        }

        for policy in &self.memory.policies {
            if policy.name.is_empty() {
                return Err(Error::Configuration("memory policy name is empty".into()));
            }
            if policy.max_size < page_size as u64 {
                return Err(Error::Configuration(format!(
                    "memory policy {} is smaller than one page",
                    policy.name
                )));
            }
        }

        if self.memory.policy(&self.memory.default_policy).is_none() {
            return Err(Error::Configuration(format!(
                "default memory policy {} is not defined",
                self.memory.default_policy
            )));
        }

        Ok(())
    }

    /// Directory holding the WAL
    #[must_use]
    pub fn wal_dir(&self) -> PathBuf {
        self.node.data_dir.join("wal")
    }

    /// Directory holding page stores and the checkpoint header
    #[must_use]
    pub fn store_dir(&self) -> PathBuf {
        self.node.data_dir.join("store")
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
    /// Data directory for WAL, page stores and node identity
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "gridstore-node".to_string(),
            data_dir: PathBuf::from("./gridstore-data"),
        }
    }
}

/// Page memory configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Page size in bytes
    pub page_size: usize,
    /// Memory policies (regions)
    pub policies: Vec<MemoryPolicyConfig>,
    /// Policy used by caches that do not name one
    pub default_policy: String,
}

impl MemoryConfig {
    /// Look up a policy by name
    #[must_use]
    pub fn policy(&self, name: &str) -> Option<&MemoryPolicyConfig> {
        self.policies.iter().find(|p| p.name == name)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            policies: vec![MemoryPolicyConfig::default()],
            default_policy: "default".to_string(),
        }
    }
}

/// A named memory region with a fixed byte budget
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryPolicyConfig {
    /// Policy name
    pub name: String,
    /// Byte budget for pages of this policy
    pub max_size: u64,
}

impl Default for MemoryPolicyConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_size: 200 * 1024 * 1024, // 200 MB
        }
    }
}

/// Write-ahead log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Buffer size for writes
    pub write_buffer_size: usize,
    /// WAL size that triggers an early checkpoint
    pub max_size_bytes: u64,
    /// Where compacted segments are moved (deleted when unset)
    pub archive_dir: Option<PathBuf>,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 64 * 1024,     // 64 KB
            max_size_bytes: 64 * 1024 * 1024, // 64 MB
            archive_dir: None,
        }
    }
}

/// Checkpointer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Run the background checkpointer
    pub background: bool,
    /// Checkpoint period (milliseconds)
    pub interval_ms: u64,
    /// Dirty page count that triggers an early checkpoint
    pub dirty_page_threshold: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            background: true,
            interval_ms: 3000,
            dirty_page_threshold: 16 * 1024,
        }
    }
}

/// Durability mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// fsync every WAL append and every checkpoint (production)
    #[default]
    Full,
    /// Skip fsync. Test-only: acknowledged writes can be lost on power failure.
    Relaxed,
}

impl Durability {
    /// Whether writes must reach stable storage before returning
    #[must_use]
    pub const fn sync(self) -> bool {
        matches!(self, Self::Full)
    }
}
