//! GridStore Storage Engine - persistent page memory
//!
//! This crate implements the durable core of a GridStore node:
//! - Page memory regions, one per memory policy (no I/O on the write path)
//! - Write-ahead logging of physical page deltas and cache lifecycle records
//! - Copy-on-write page stores and background checkpointing
//! - The cache descriptor registry
//! - Crash recovery (checkpoint load + WAL replay)
//!
//! ```text
//!   put/remove/update
//!          |
//!          v
//!   +-------------+  append   +-----+
//!   |   Engine    |---------->| WAL |
//!   +-------------+           +-----+
//!          | apply deltas        ^ checkpoint-begin/end, truncate
//!          v                     |
//!   +-------------+  dirty   +--------------+  slots  +------------+
//!   | Page memory |--------->| Checkpointer |-------->| Page store |
//!   +-------------+          +--------------+         +------------+
//! ```

pub mod checkpoint;
pub mod engine;
pub mod page;
pub mod page_memory;
pub mod page_store;
pub mod recovery;
pub mod registry;
pub mod scan;
pub mod wal;

// Re-exports
pub use checkpoint::{CheckpointHeader, CheckpointReport};
pub use engine::{Engine, EngineStats};
pub use page::DataPage;
pub use page_memory::PageMemory;
pub use page_store::PageStore;
pub use recovery::{RecoveryReport, RecoveryState};
pub use registry::{CacheConfig, CacheDescriptor, Registry};
pub use scan::{PartitionScan, ScanCursor};
pub use wal::{PageDelta, Wal, WalIterator, WalPayload, WalRecord};
