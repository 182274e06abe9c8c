//! Typed cache handle
//!
//! Keys and values are encoded with bincode; the encoded key is what the
//! affinity function hashes, so every client computes the same owner for the
//! same typed key. Writes go to every owner of the partition, reads to the
//! primary.

use crate::grid::{Grid, Routing};
use gridstore_common::{Error, NodeId, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Encode a key or value
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a key or value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

/// Handle to a grid cache with typed keys and values
pub struct GridCache<K, V> {
    grid: Grid,
    name: String,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for GridCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            grid: self.grid.clone(),
            name: self.name.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V> GridCache<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub(crate) fn new(grid: Grid, name: &str) -> Self {
        Self {
            grid,
            name: name.to_string(),
            _types: PhantomData,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or replace one entry
    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        let entry = (encode(key)?, encode(value)?);
        self.write(vec![entry])
    }

    /// Insert or replace many entries
    pub fn put_all(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()> {
        let encoded = entries
            .into_iter()
            .map(|(k, v)| Ok((encode(&k)?, encode(&v)?)))
            .collect::<Result<Vec<_>>>()?;
        self.write(encoded)
    }

    fn write(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        self.grid.with_routing(&self.name, |routing| {
            for (node, items) in group_by_owner(routing, &entries)? {
                routing
                    .node(node)?
                    .apply(&self.name, routing.epoch, items, |_, _, value| {
                        Ok(Some(value.to_vec()))
                    })?;
            }
            Ok(())
        })
    }

    /// Value of `key`, read from its primary
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let key = encode(key)?;
        let bytes = self.grid.with_routing(&self.name, |routing| {
            let primary = primary(routing, &key)?;
            routing.node(primary)?.get(&self.name, routing.epoch, &key)
        })?;
        bytes.as_deref().map(decode).transpose()
    }

    /// Remove `key` from every owner; returns whether the primary had it
    pub fn remove(&self, key: &K) -> Result<bool> {
        let key = encode(key)?;
        self.grid.with_routing(&self.name, |routing| {
            let mut existed = false;
            for (i, owner) in routing.owners(&key)?.into_iter().enumerate() {
                let removed = routing.node(owner)?.remove(&self.name, routing.epoch, &key)?;
                if i == 0 {
                    existed = removed;
                }
            }
            Ok(existed)
        })
    }

    /// Number of entries, counting primary copies only
    pub fn len(&self) -> Result<usize> {
        let counts = self.grid.broadcast(|node| {
            let (cache_id, partitions) = node.primary_partitions(&self.name)?;
            partitions
                .into_iter()
                .map(|p| node.engine().partition_len(cache_id, p))
                .sum::<Result<usize>>()
        })?;
        Ok(counts.into_iter().map(|(_, n)| n).sum())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every entry on every node
    pub fn clear(&self) -> Result<()> {
        self.grid.broadcast(|node| {
            let descriptor = node.descriptor(&self.name)?;
            node.engine().clear(descriptor.id)
        })?;
        Ok(())
    }
}

fn primary(routing: &Routing, key: &[u8]) -> Result<NodeId> {
    routing
        .owners(key)?
        .first()
        .copied()
        .ok_or_else(|| Error::NotReady("no owner for partition".into()))
}

/// Split entries into per-owner batches, keeping submission order
fn group_by_owner(
    routing: &Routing,
    entries: &[(Vec<u8>, Vec<u8>)],
) -> Result<BTreeMap<NodeId, Vec<(Vec<u8>, Vec<u8>)>>> {
    let mut batches: BTreeMap<NodeId, Vec<_>> = BTreeMap::new();
    for (key, value) in entries {
        for owner in routing.owners(key)? {
            batches
                .entry(owner)
                .or_default()
                .push((key.clone(), value.clone()));
        }
    }
    Ok(batches)
}
