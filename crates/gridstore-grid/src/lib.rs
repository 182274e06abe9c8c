//! GridStore Grid - a cluster of storage nodes in one process
//!
//! Client-facing layer over [`gridstore_storage::Engine`]:
//!
//! - [`Grid`]: starts and stops nodes, publishes topology epochs, creates and
//!   destroys caches on every node and broadcasts closures to all of them
//! - [`GridCache`]: typed (bincode) handle routed through the affinity
//!   function
//! - [`DataStreamer`]: per-node buffered ingestion with a server-side
//!   [`StreamUpdater`]
//! - [`TaskHandle`]: cancellable periodic task
//! - [`Grid::top_k`]: distributed top-K over partition scans
//!
//! # Example
//! ```ignore
//! let grid = Grid::start(configs)?;
//! grid.get_or_create_cache(CacheConfig::new("numbers"))?;
//!
//! let mut streamer = grid
//!     .streamer::<u32, u64>("numbers")?
//!     .with_updater(IncrementingUpdater);
//! streamer.add(&7, &1)?;
//! streamer.close()?;
//!
//! let top: Vec<(u32, u64)> = grid.top_k("numbers", 10)?;
//! ```

pub mod cache;
pub mod grid;
pub mod node;
pub mod query;
pub mod streamer;
pub mod task;

pub use cache::GridCache;
pub use grid::Grid;
pub use node::Node;
pub use query::local_top_k;
pub use streamer::{
    DEFAULT_PER_NODE_BUFFER_SIZE, DataStreamer, IncrementingUpdater, Overwrite, StreamUpdater,
};
pub use task::TaskHandle;
