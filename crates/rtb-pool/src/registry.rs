//! Name-keyed registry of pools

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::{Poolable, ResourcePool};

/// Pools addressed by name. Registration is atomic per name, so two racing
/// registrations for the same name leave exactly one pool behind.
pub struct PoolRegistry<W: Poolable> {
    pools: DashMap<String, Arc<ResourcePool<W>>>,
}

impl<W: Poolable> Default for PoolRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Poolable> PoolRegistry<W> {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    /// Register the pool built by `make` unless `name` is already taken.
    ///
    /// Returns the registered pool and whether this call created it. `make`
    /// only runs when the name is free.
    pub fn register_if_absent<F>(&self, name: &str, make: F) -> (Arc<ResourcePool<W>>, bool)
    where
        F: FnOnce() -> Arc<ResourcePool<W>>,
    {
        match self.pools.entry(name.to_string()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
            Entry::Vacant(slot) => {
                let pool = make();
                slot.insert(Arc::clone(&pool));
                (pool, true)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResourcePool<W>>> {
        self.pools.get(name).map(|pool| Arc::clone(pool.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ResourcePool<W>>> {
        self.pools.remove(name).map(|(_, pool)| pool)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
