//! Data streamer
//!
//! Buffers `(key, value)` pairs per owning node and ships each buffer as one
//! batch once it reaches `per_node_buffer_size`. The receiving node runs the
//! updater for every item, in submission order for the same key, inside its
//! normal WAL path.
//!
//! A node that has moved to a newer topology epoch rejects a batch before
//! applying any of it; the streamer then re-routes the rejected items and
//! sends them again, so each item is applied exactly once per owner copy.
//! Any other failure also leaves the whole node batch unapplied, and its
//! items stay buffered for the next flush.

use crate::cache::{decode, encode};
use crate::grid::{Grid, MAX_ROUTE_ATTEMPTS, Routing};
use gridstore_common::{Error, NodeId, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Items buffered per node before a batch is sent
pub const DEFAULT_PER_NODE_BUFFER_SIZE: usize = 2048;

/// Server-side merge of a streamed value into the stored one
pub trait StreamUpdater<K, V>: Send + Sync {
    /// New value for `key`, or `None` to remove it
    fn update(&self, key: &K, current: Option<V>, value: V) -> Option<V>;
}

/// Stores the streamed value as is
#[derive(Clone, Copy, Debug, Default)]
pub struct Overwrite;

impl<K, V> StreamUpdater<K, V> for Overwrite {
    fn update(&self, _key: &K, _current: Option<V>, value: V) -> Option<V> {
        Some(value)
    }
}

/// Adds the streamed amount to a counter, starting from zero
#[derive(Clone, Copy, Debug, Default)]
pub struct IncrementingUpdater;

impl<K> StreamUpdater<K, u64> for IncrementingUpdater {
    fn update(&self, _key: &K, current: Option<u64>, value: u64) -> Option<u64> {
        Some(current.map_or(value, |c| c.saturating_add(value)))
    }
}

/// Buffered item: encoded key, encoded value, owner copy index
type Item = (Vec<u8>, Vec<u8>, usize);

/// Streams entries into one cache
pub struct DataStreamer<K: 'static, V: 'static> {
    grid: Grid,
    cache: String,
    per_node_buffer_size: usize,
    updater: Arc<dyn StreamUpdater<K, V>>,
    buffers: HashMap<NodeId, Vec<Item>>,
    routing: Option<Routing>,
    added: u64,
}

impl<K, V> DataStreamer<K, V>
where
    K: Serialize + DeserializeOwned + 'static,
    V: Serialize + DeserializeOwned + 'static,
{
    pub(crate) fn new(grid: Grid, cache: &str) -> Self {
        Self {
            grid,
            cache: cache.to_string(),
            per_node_buffer_size: DEFAULT_PER_NODE_BUFFER_SIZE,
            updater: Arc::new(Overwrite),
            buffers: HashMap::new(),
            routing: None,
            added: 0,
        }
    }

    /// Items buffered per node before a batch is sent (at least 1)
    #[must_use]
    pub fn with_per_node_buffer_size(mut self, size: usize) -> Self {
        self.per_node_buffer_size = size.max(1);
        self
    }

    /// Updater run on the owning node for every item
    #[must_use]
    pub fn with_updater(mut self, updater: impl StreamUpdater<K, V> + 'static) -> Self {
        self.updater = Arc::new(updater);
        self
    }

    #[must_use]
    pub const fn per_node_buffer_size(&self) -> usize {
        self.per_node_buffer_size
    }

    /// Items added so far
    #[must_use]
    pub const fn added(&self) -> u64 {
        self.added
    }

    /// Items waiting in buffers
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }

    /// Routing snapshot, taken on first use and after a stale rejection
    fn routing(&mut self) -> Result<&Routing> {
        if self.routing.is_none() {
            self.routing = Some(self.grid.routing(&self.cache)?);
        }
        self.current_routing()
    }

    fn current_routing(&self) -> Result<&Routing> {
        self.routing
            .as_ref()
            .ok_or_else(|| Error::internal("routing not initialized"))
    }

    /// Queue one entry, sending its owners' buffers when they fill up
    pub fn add(&mut self, key: &K, value: &V) -> Result<()> {
        let key = encode(key)?;
        let value = encode(value)?;
        let owners = self.routing()?.owners(&key)?;

        let size = self.per_node_buffer_size;
        let mut full = Vec::new();
        for (copy, owner) in owners.into_iter().enumerate() {
            let buffer = self.buffers.entry(owner).or_default();
            buffer.push((key.clone(), value.clone(), copy));
            if buffer.len() >= size {
                full.push(owner);
            }
        }
        self.added += 1;

        for owner in full {
            self.flush_node(owner)?;
        }
        Ok(())
    }

    /// Send every buffer
    pub fn flush(&mut self) -> Result<()> {
        let owners: Vec<NodeId> = self.buffers.keys().copied().collect();
        for owner in owners {
            self.flush_node(owner)?;
        }
        Ok(())
    }

    /// Send the remaining buffers and release the streamer
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    fn flush_node(&mut self, owner: NodeId) -> Result<()> {
        let mut pending = vec![(owner, self.buffers.remove(&owner).unwrap_or_default())];
        let mut attempt = 1;

        while let Some((owner, items)) = pending.pop() {
            if items.is_empty() {
                continue;
            }
            match self.send(owner, &items) {
                Ok(()) => {}
                Err(e) if e.is_retryable() && attempt < MAX_ROUTE_ATTEMPTS => {
                    debug!(
                        "Re-routing {} streamed items for {} after attempt {}: {}",
                        items.len(),
                        self.cache,
                        attempt,
                        e
                    );
                    attempt += 1;
                    self.routing = None;
                    pending.extend(self.reroute(items)?);
                }
                Err(e) => {
                    // Nodes apply a batch entirely or not at all, so none of
                    // these items is applied yet; a later flush retries them
                    self.buffers.entry(owner).or_default().extend(items);
                    for (owner, items) in pending.drain(..) {
                        self.buffers.entry(owner).or_default().extend(items);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Send one node batch under the cached routing
    fn send(&mut self, owner: NodeId, items: &[Item]) -> Result<()> {
        self.routing()?;
        let routing = self.current_routing()?;
        let updater = &self.updater;
        let node = routing.node(owner)?;
        let batch = items
            .iter()
            .map(|(key, value, _)| (key.clone(), value.clone()))
            .collect();

        node.apply(&self.cache, routing.epoch, batch, |key, current, value| {
            let key: K = decode(key)?;
            let current: Option<V> = current.map(decode).transpose()?;
            let value: V = decode(value)?;
            updater
                .update(&key, current, value)
                .map(|v| encode(&v))
                .transpose()
        })
    }

    /// Assign rejected items to the owners of the same copy at the new epoch
    fn reroute(&mut self, items: Vec<Item>) -> Result<Vec<(NodeId, Vec<Item>)>> {
        let routing = self.routing()?;
        let mut batches: HashMap<NodeId, Vec<Item>> = HashMap::new();
        for (key, value, copy) in items {
            match routing.owners(&key)?.get(copy) {
                Some(&owner) => batches.entry(owner).or_default().push((key, value, copy)),
                None => warn!("Dropping copy {} of a streamed item: fewer owners now", copy),
            }
        }
        Ok(batches.into_iter().collect())
    }
}

impl<K: 'static, V: 'static> Drop for DataStreamer<K, V> {
    fn drop(&mut self) {
        let pending: usize = self.buffers.values().map(Vec::len).sum();
        if pending > 0 {
            warn!(
                "Data streamer for {} dropped with {} unsent items; call close()",
                self.cache, pending
            );
        }
    }
}
