//! Distributed top-K
//!
//! Every node scans the partitions it is primary for and keeps its local
//! best `k` entries; the caller merges the node results. Entries rank by
//! value descending, then key ascending.

use crate::cache::decode;
use crate::grid::Grid;
use crate::node::Node;
use gridstore_common::Result;
use serde::de::DeserializeOwned;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// An entry ordered by value, ties broken by the smaller key
#[derive(Debug, PartialEq, Eq)]
struct Ranked<K, V> {
    key: K,
    value: V,
}

impl<K: Ord, V: Ord> Ord for Ranked<K, V> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl<K: Ord, V: Ord> PartialOrd for Ranked<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Keeps the `k` greatest entries pushed into it
struct TopK<K, V> {
    k: usize,
    heap: BinaryHeap<Reverse<Ranked<K, V>>>,
}

impl<K: Ord, V: Ord> TopK<K, V> {
    fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    fn push(&mut self, key: K, value: V) {
        if self.k == 0 {
            return;
        }
        self.heap.push(Reverse(Ranked { key, value }));
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    /// Best entry first
    fn into_sorted(self) -> Vec<(K, V)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(r)| (r.key, r.value))
            .collect()
    }
}

/// Best `k` entries among the primary partitions of `cache` on `node`
pub fn local_top_k<K, V>(node: &Node, cache: &str, k: usize) -> Result<Vec<(K, V)>>
where
    K: DeserializeOwned + Ord,
    V: DeserializeOwned + Ord,
{
    let (cache_id, partitions) = node.primary_partitions(cache)?;
    let mut top = TopK::new(k);
    for partition in partitions {
        for entry in node.engine().scan(cache_id, partition)? {
            let (key, value) = entry?;
            top.push(decode(&key)?, decode(&value)?);
        }
    }
    Ok(top.into_sorted())
}

impl Grid {
    /// Best `k` entries of `cache` over the whole grid
    pub fn top_k<K, V>(&self, cache: &str, k: usize) -> Result<Vec<(K, V)>>
    where
        K: DeserializeOwned + Ord + Send,
        V: DeserializeOwned + Ord + Send,
    {
        let locals = self.broadcast(|node| local_top_k::<K, V>(node, cache, k))?;
        let mut top = TopK::new(k);
        for (_, entries) in locals {
            for (key, value) in entries {
                top.push(key, value);
            }
        }
        Ok(top.into_sorted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::GridCache;
    use gridstore_affinity::AffinityFunction;
    use gridstore_common::Config;
    use gridstore_common::config::Durability;
    use gridstore_storage::CacheConfig;
    use tempfile::tempdir;

    #[test]
    fn test_top_k_order() {
        let mut top = TopK::new(3);
        for (k, v) in [(1, 5), (2, 9), (3, 5), (4, 1), (5, 9), (6, 7)] {
            top.push(k, v);
        }
        assert_eq!(top.into_sorted(), vec![(2, 9), (5, 9), (6, 7)]);

        let mut empty = TopK::new(0);
        empty.push(1, 1);
        assert!(empty.into_sorted().is_empty());
    }

    #[test]
    fn test_grid_top_k_merges_nodes() {
        let dir = tempdir().unwrap();
        let grid = Grid::start((0..3).map(|i| {
            let mut config = Config::with_data_dir(dir.path().join(format!("node-{i}")));
            config.checkpoint.background = false;
            config.durability = Durability::Relaxed;
            config
        }))
        .unwrap();
        grid.create_cache(CacheConfig::new("n").with_affinity(AffinityFunction::rendezvous(32, 1)))
            .unwrap();
        let cache: GridCache<u32, u64> = grid.cache("n").unwrap();
        cache
            .put_all((0..500u32).map(|i| (i, u64::from(i % 100))))
            .unwrap();

        let top: Vec<(u32, u64)> = grid.top_k("n", 5).unwrap();
        assert_eq!(top, vec![(99, 99), (199, 99), (299, 99), (399, 99), (499, 99)]);

        let all: Vec<(u32, u64)> = grid.top_k("n", 1000).unwrap();
        assert_eq!(all.len(), 500);
    }
}
