//! In-process grid
//!
//! Stands in for cluster membership: it owns the live nodes, numbers each
//! membership change with a new topology epoch and pushes the view to every
//! node's router. Clients route against a snapshot of that view; a node that
//! has already moved to a newer epoch rejects the request and the client
//! re-routes.

use crate::cache::GridCache;
use crate::node::Node;
use crate::streamer::DataStreamer;
use gridstore_affinity::TopologyView;
use gridstore_common::{CacheId, Config, Error, NodeId, Result, TopologyEpoch};
use gridstore_storage::{CacheConfig, CacheDescriptor};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Routing attempts before a stale topology error reaches the caller
pub const MAX_ROUTE_ATTEMPTS: usize = 3;

struct GridInner {
    nodes: RwLock<BTreeMap<NodeId, Arc<Node>>>,
    topology: RwLock<TopologyView>,
    /// Serializes cluster-wide create/destroy
    lifecycle: Mutex<()>,
}

/// Handle to an in-process cluster of nodes
#[derive(Clone)]
pub struct Grid {
    inner: Arc<GridInner>,
}

/// Routing snapshot of one cache at one epoch
pub(crate) struct Routing {
    pub epoch: TopologyEpoch,
    cache_id: CacheId,
    coordinator: Arc<Node>,
    nodes: BTreeMap<NodeId, Arc<Node>>,
}

impl Routing {
    /// Owners of `key`, primary first
    pub fn owners(&self, key: &[u8]) -> Result<Vec<NodeId>> {
        let router = self.coordinator.router();
        let partition = router.partition_for(self.cache_id, key)?;
        router.owners(self.cache_id, partition, self.epoch)
    }

    pub fn node(&self, id: NodeId) -> Result<&Arc<Node>> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::internal(format!("node {id} missing from epoch {}", self.epoch)))
    }
}

impl Grid {
    /// Start one node per configuration and publish the first topology
    pub fn start(configs: impl IntoIterator<Item = Config>) -> Result<Self> {
        let grid = Self {
            inner: Arc::new(GridInner {
                nodes: RwLock::new(BTreeMap::new()),
                topology: RwLock::new(TopologyView::default()),
                lifecycle: Mutex::new(()),
            }),
        };

        let mut started = BTreeMap::new();
        for config in configs {
            let node = Node::start(config)?;
            if started.contains_key(&node.id()) {
                return Err(Error::Configuration(format!(
                    "node id {} started twice; data directories must differ",
                    node.id()
                )));
            }
            started.insert(node.id(), Arc::new(node));
        }

        {
            let mut nodes = grid.inner.nodes.write();
            *nodes = started;
            grid.publish(&nodes);
        }
        Ok(grid)
    }

    /// Start a node and add it to the grid
    ///
    /// The node creates every cache the grid already has.
    pub fn join(&self, config: Config) -> Result<NodeId> {
        let node = Arc::new(Node::start(config)?);
        let id = node.id();

        let _lifecycle = self.inner.lifecycle.lock();
        let mut nodes = self.inner.nodes.write();
        if nodes.contains_key(&id) {
            return Err(Error::Configuration(format!("node {id} is already a member")));
        }
        if let Some(existing) = nodes.values().next() {
            for descriptor in existing.engine().caches() {
                node.engine()
                    .get_or_create_cache(CacheConfig::from(&descriptor))?;
            }
        }
        nodes.insert(id, node);
        self.publish(&nodes);
        Ok(id)
    }

    /// Remove a node from the grid and stop it gracefully
    pub fn stop_node(&self, id: NodeId) -> Result<()> {
        let node = self.leave(id)?;
        Arc::try_unwrap(node)
            .map_err(|_| Error::internal(format!("node {id} still in use")))?
            .stop()
    }

    /// Remove a node from the grid without a final checkpoint
    pub fn kill_node(&self, id: NodeId) -> Result<()> {
        let node = self.leave(id)?;
        match Arc::try_unwrap(node) {
            Ok(node) => node.kill(),
            Err(_) => warn!("Node {} still referenced; it stops when released", id),
        }
        Ok(())
    }

    fn leave(&self, id: NodeId) -> Result<Arc<Node>> {
        let mut nodes = self.inner.nodes.write();
        let node = nodes
            .remove(&id)
            .ok_or_else(|| Error::invalid_argument(format!("node {id} is not a member")))?;
        self.publish(&nodes);
        self.retire(&node);
        Ok(node)
    }

    /// Move a departed node to the current epoch so it rejects stale routes
    fn retire(&self, node: &Node) {
        node.router().update_topology(self.topology());
    }

    /// Stop every node gracefully; the first failure is returned
    pub fn stop(&self) -> Result<()> {
        let nodes = std::mem::take(&mut *self.inner.nodes.write());
        self.publish(&BTreeMap::new());
        nodes.values().for_each(|node| self.retire(node));

        let mut result = Ok(());
        for (id, node) in nodes {
            let stopped = Arc::try_unwrap(node)
                .map_err(|_| Error::internal(format!("node {id} still in use")))
                .and_then(Node::stop);
            if let Err(e) = stopped {
                warn!("Failed to stop node {}: {}", id, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        info!("Grid stopped");
        result
    }

    /// Drop every node without a checkpoint, as a power loss would
    pub fn kill(&self) {
        let nodes = std::mem::take(&mut *self.inner.nodes.write());
        self.publish(&BTreeMap::new());
        nodes.values().for_each(|node| self.retire(node));
        for (_, node) in nodes {
            if let Ok(node) = Arc::try_unwrap(node) {
                node.kill();
            }
        }
        info!("Grid killed");
    }

    /// Install the next epoch for the given member set on every member
    fn publish(&self, nodes: &BTreeMap<NodeId, Arc<Node>>) {
        let mut topology = self.inner.topology.write();
        let view = TopologyView::new(topology.epoch + 1, nodes.keys().copied().collect());
        for node in nodes.values() {
            node.router().update_topology(view.clone());
        }
        debug!("Published topology epoch {} ({} nodes)", view.epoch, view.len());
        *topology = view;
    }

    /// Current membership view
    #[must_use]
    pub fn topology(&self) -> TopologyView {
        self.inner.topology.read().clone()
    }

    /// Live nodes in id order
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.inner.nodes.read().values().cloned().collect()
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.inner.nodes.read().get(&id).cloned()
    }

    fn live_nodes(&self) -> Result<Vec<Arc<Node>>> {
        let nodes = self.nodes();
        if nodes.is_empty() {
            return Err(Error::NotReady("grid has no live nodes".into()));
        }
        Ok(nodes)
    }

    // Cache lifecycle

    /// Create a cache on every node
    pub fn create_cache(&self, config: CacheConfig) -> Result<CacheDescriptor> {
        config.validate()?;
        let _lifecycle = self.inner.lifecycle.lock();
        let nodes = self.live_nodes()?;
        if nodes.iter().any(|n| n.engine().cache(&config.name).is_some()) {
            return Err(Error::CacheAlreadyExists(config.name));
        }
        Self::create_on(&nodes, &config)
    }

    /// Return the cache named in `config`, creating it where absent
    pub fn get_or_create_cache(&self, config: CacheConfig) -> Result<CacheDescriptor> {
        config.validate()?;
        let _lifecycle = self.inner.lifecycle.lock();
        let nodes = self.live_nodes()?;
        Self::create_on(&nodes, &config)
    }

    fn create_on(nodes: &[Arc<Node>], config: &CacheConfig) -> Result<CacheDescriptor> {
        let mut first = None;
        for node in nodes {
            let descriptor = node.engine().get_or_create_cache(config.clone())?;
            first.get_or_insert(descriptor);
        }
        first.ok_or_else(|| Error::NotReady("grid has no live nodes".into()))
    }

    /// Destroy a cache on every node that has it
    pub fn destroy_cache(&self, name: &str) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        let mut found = false;
        for node in self.live_nodes()? {
            match node.engine().destroy_cache_named(name) {
                Ok(()) => found = true,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if found {
            Ok(())
        } else {
            Err(Error::CacheNotFound(name.to_string()))
        }
    }

    /// Names of the caches known to the grid
    #[must_use]
    pub fn cache_names(&self) -> Vec<String> {
        self.nodes()
            .first()
            .map(|node| node.engine().caches().into_iter().map(|d| d.name).collect())
            .unwrap_or_default()
    }

    /// Typed handle to an existing cache
    pub fn cache<K, V>(&self, name: &str) -> Result<GridCache<K, V>>
    where
        K: Serialize + DeserializeOwned,
        V: Serialize + DeserializeOwned,
    {
        self.routing(name)?;
        Ok(GridCache::new(self.clone(), name))
    }

    /// Streamer into an existing cache
    pub fn streamer<K, V>(&self, name: &str) -> Result<DataStreamer<K, V>>
    where
        K: Serialize + DeserializeOwned + 'static,
        V: Serialize + DeserializeOwned + 'static,
    {
        self.routing(name)?;
        Ok(DataStreamer::new(self.clone(), name))
    }

    // Routing

    /// Snapshot of the routing of `cache` at the current epoch
    pub(crate) fn routing(&self, cache: &str) -> Result<Routing> {
        // Membership changes publish while holding the node map
        let (nodes, epoch) = {
            let nodes = self.inner.nodes.read();
            (nodes.clone(), self.inner.topology.read().epoch)
        };
        let coordinator = nodes
            .values()
            .next()
            .cloned()
            .ok_or_else(|| Error::NotReady("grid has no live nodes".into()))?;
        let cache_id = coordinator.descriptor(cache)?.id;
        Ok(Routing {
            epoch,
            cache_id,
            coordinator,
            nodes,
        })
    }

    /// Run `op` against a fresh routing snapshot, re-routing on stale
    /// topology
    ///
    /// Only idempotent operations may go through here.
    pub(crate) fn with_routing<T>(
        &self,
        cache: &str,
        mut op: impl FnMut(&Routing) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            let routing = self.routing(cache)?;
            match op(&routing) {
                Err(e) if e.is_retryable() && attempt < MAX_ROUTE_ATTEMPTS => {
                    debug!("Re-routing {} after attempt {}: {}", cache, attempt, e);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    // Compute

    /// Run `f` on every live node in parallel
    ///
    /// Results come back in node id order; the first error is returned.
    pub fn broadcast<R, F>(&self, f: F) -> Result<Vec<(NodeId, R)>>
    where
        F: Fn(&Node) -> Result<R> + Sync,
        R: Send,
    {
        let nodes = self.live_nodes()?;
        let f = &f;
        thread::scope(|scope| {
            let handles: Vec<_> = nodes
                .iter()
                .map(|node| (node.id(), scope.spawn(move || f(node.as_ref()))))
                .collect();
            handles
                .into_iter()
                .map(|(id, handle)| {
                    let result = handle
                        .join()
                        .map_err(|_| Error::internal(format!("broadcast task on node {id} panicked")))?;
                    result.map(|r| (id, r))
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridstore_affinity::AffinityFunction;
    use gridstore_common::config::Durability;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    fn config(dir: &Path, i: usize) -> Config {
        let mut config = Config::with_data_dir(dir.join(format!("node-{i}")));
        config.node.name = format!("node-{i}");
        config.checkpoint.background = false;
        config.durability = Durability::Relaxed;
        config
    }

    fn start(dir: &TempDir, n: usize) -> Grid {
        Grid::start((0..n).map(|i| config(dir.path(), i))).unwrap()
    }

    fn cache1() -> CacheConfig {
        CacheConfig::new("cache1").with_affinity(AffinityFunction::rendezvous(32, 0))
    }

    #[test]
    fn test_start_publishes_topology() {
        let dir = tempdir().unwrap();
        let grid = start(&dir, 3);
        let view = grid.topology();
        assert_eq!(view.len(), 3);
        for node in grid.nodes() {
            assert_eq!(node.router().epoch(), view.epoch);
            assert!(view.contains(node.id()));
        }
    }

    #[test]
    fn test_lifecycle_on_every_node() {
        let dir = tempdir().unwrap();
        let grid = start(&dir, 3);
        grid.create_cache(cache1()).unwrap();
        assert!(matches!(
            grid.create_cache(cache1()),
            Err(Error::CacheAlreadyExists(_))
        ));
        for node in grid.nodes() {
            assert!(node.engine().cache("cache1").is_some());
        }
        assert_eq!(grid.cache_names(), vec!["cache1".to_string()]);

        grid.destroy_cache("cache1").unwrap();
        assert!(grid.destroy_cache("cache1").unwrap_err().is_not_found());
        for node in grid.nodes() {
            assert!(node.engine().cache("cache1").is_none());
        }
    }

    #[test]
    fn test_join_bumps_epoch_and_copies_caches() {
        let dir = tempdir().unwrap();
        let grid = start(&dir, 2);
        grid.create_cache(cache1()).unwrap();
        let before = grid.topology().epoch;

        let id = grid.join(config(dir.path(), 9)).unwrap();
        assert_eq!(grid.topology().epoch, before + 1);
        let joined = grid.node(id).unwrap();
        assert_eq!(
            joined.engine().cache("cache1").unwrap().affinity,
            AffinityFunction::rendezvous(32, 0)
        );
        drop(joined);

        grid.stop_node(id).unwrap();
        assert_eq!(grid.topology().len(), 2);
        assert_eq!(grid.topology().epoch, before + 2);
    }

    #[test]
    fn test_same_data_dir_rejected() {
        let dir = tempdir().unwrap();
        let result = Grid::start(vec![config(dir.path(), 0), config(dir.path(), 0)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_broadcast_reaches_every_node() {
        let dir = tempdir().unwrap();
        let grid = start(&dir, 3);
        let results = grid.broadcast(|node| Ok(node.name().to_string())).unwrap();
        let names: Vec<_> = results.into_iter().map(|(_, name)| name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["node-0", "node-1", "node-2"]);

        let err = grid
            .broadcast(|_| -> Result<()> { Err(Error::internal("boom")) })
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_stopped_grid_has_no_nodes() {
        let dir = tempdir().unwrap();
        let grid = start(&dir, 2);
        grid.stop().unwrap();
        assert!(grid.nodes().is_empty());
        assert!(matches!(
            grid.create_cache(cache1()),
            Err(Error::NotReady(_))
        ));
    }
}
