//! Grid node
//!
//! A storage engine plus a stable identity. The node id is generated on the
//! first start and kept in `<data_dir>/node.id`, so a restarted node scores
//! the same in rendezvous hashing and owns the same partitions as before.

use gridstore_affinity::AffinityRouter;
use gridstore_common::{CacheId, Config, Error, NodeId, PartitionId, Result, TopologyEpoch};
use gridstore_storage::{CacheDescriptor, Engine};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// File holding the node id inside the data directory
pub const NODE_ID_FILE: &str = "node.id";

/// One member of the grid
pub struct Node {
    id: NodeId,
    engine: Engine,
}

impl Node {
    /// Start a node: load (or create) its identity and recover its engine
    pub fn start(config: Config) -> Result<Self> {
        let id = load_or_create_id(&config.node.data_dir)?;
        let engine = Engine::open(config)?;
        info!("Node {} started as {}", engine.config().node.name, id);
        Ok(Self { id, engine })
    }

    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.engine.config().node.name
    }

    /// Storage engine of this node
    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    #[must_use]
    pub fn router(&self) -> &Arc<AffinityRouter> {
        self.engine.router()
    }

    /// This node's descriptor of a cache
    pub fn descriptor(&self, cache: &str) -> Result<CacheDescriptor> {
        self.engine
            .cache(cache)
            .ok_or_else(|| Error::CacheNotFound(cache.to_string()))
    }

    /// Apply a batch routed to this node against topology `epoch`
    ///
    /// A batch computed against another epoch is rejected as a whole before
    /// any item is applied.
    pub fn apply<F>(
        &self,
        cache: &str,
        epoch: TopologyEpoch,
        items: Vec<(Vec<u8>, Vec<u8>)>,
        transform: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>, &[u8]) -> Result<Option<Vec<u8>>>,
    {
        self.router().check_epoch(epoch)?;
        let descriptor = self.descriptor(cache)?;
        debug!(
            "Node {} applying {} items to cache {}",
            self.id,
            items.len(),
            cache
        );
        self.engine.apply_batch(descriptor.id, items, transform)
    }

    /// Read a key routed to this node against topology `epoch`
    pub fn get(&self, cache: &str, epoch: TopologyEpoch, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.router().check_epoch(epoch)?;
        let descriptor = self.descriptor(cache)?;
        self.engine.get(descriptor.id, key)
    }

    /// Remove a key routed to this node against topology `epoch`
    pub fn remove(&self, cache: &str, epoch: TopologyEpoch, key: &[u8]) -> Result<bool> {
        self.router().check_epoch(epoch)?;
        let descriptor = self.descriptor(cache)?;
        self.engine.remove(descriptor.id, key)
    }

    /// Partitions of a cache whose primary copy lives on this node
    pub fn primary_partitions(&self, cache: &str) -> Result<(CacheId, Vec<PartitionId>)> {
        let descriptor = self.descriptor(cache)?;
        let assignment = self.router().assignment(descriptor.id)?;
        Ok((descriptor.id, assignment.primary_partitions(self.id)))
    }

    /// Graceful stop: final checkpoint, then close
    pub fn stop(self) -> Result<()> {
        info!("Stopping node {}", self.id);
        self.engine.close()
    }

    /// Stop without a checkpoint, as a crash would
    pub fn kill(self) {
        info!("Killing node {}", self.id);
        drop(self.engine);
    }
}

/// Read the node id from `dir`, creating one on first start
fn load_or_create_id(dir: &Path) -> Result<NodeId> {
    fs::create_dir_all(dir).map_err(|e| Error::io("failed to create data directory", e))?;
    let path = dir.join(NODE_ID_FILE);

    match fs::read_to_string(&path) {
        Ok(text) => NodeId::parse(&text).ok_or_else(|| {
            Error::Configuration(format!("invalid node id in {}", path.display()))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let id = NodeId::new();
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, id.to_string())
                .and_then(|()| File::open(&tmp)?.sync_all())
                .and_then(|()| fs::rename(&tmp, &path))
                .map_err(|e| Error::io("failed to write node id", e))?;
            info!("Generated node id {} in {:?}", id, path);
            Ok(id)
        }
        Err(e) => Err(Error::io("failed to read node id", e)),
    }
}
