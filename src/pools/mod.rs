//! Storage Pools
//!
//! Capability model, pool discovery and validation, and admission control
//! for new volumes.

pub mod admission;
pub mod capability;
pub mod discovery;
pub mod validation;

use serde::Serialize;
use std::collections::BTreeMap;

pub use capability::{Offer, Request, Requests, StoragePool};

/// Smallest volume the appliance will create
pub const MINIMUM_VOLUME_SIZE_BYTES: u64 = 20 * 1024 * 1024;

/// Read access to the pools of one backend
pub trait PoolSource {
    fn physical_pools(&self) -> &BTreeMap<String, StoragePool>;
    fn virtual_pools(&self) -> &BTreeMap<String, StoragePool>;

    fn pool(&self, name: &str) -> Option<&StoragePool> {
        self.physical_pools()
            .get(name)
            .or_else(|| self.virtual_pools().get(name))
    }
}

/// All pools of one backend, built once at initialization
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolSet {
    pub physical: BTreeMap<String, StoragePool>,
    pub virtual_pools: BTreeMap<String, StoragePool>,
}

impl PoolSet {
    pub fn new(
        physical: BTreeMap<String, StoragePool>,
        virtual_pools: BTreeMap<String, StoragePool>,
    ) -> Self {
        Self {
            physical,
            virtual_pools,
        }
    }

    /// Pools the backend advertises: virtual pools when any are defined,
    /// physical pools otherwise
    pub fn published(&self) -> Vec<&StoragePool> {
        if self.virtual_pools.is_empty() {
            self.physical.values().collect()
        } else {
            self.virtual_pools.values().collect()
        }
    }

    pub fn physical_pool_names(&self) -> Vec<&str> {
        self.physical.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoragePool> {
        self.physical.values().chain(self.virtual_pools.values())
    }
}

impl PoolSource for PoolSet {
    fn physical_pools(&self) -> &BTreeMap<String, StoragePool> {
        &self.physical
    }

    fn virtual_pools(&self) -> &BTreeMap<String, StoragePool> {
        &self.virtual_pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_published_prefers_virtual_pools() {
        let mut set = PoolSet::default();
        set.physical
            .insert("b_aggr1".into(), StoragePool::new("b_aggr1", "b"));
        assert_eq!(set.published().len(), 1);
        assert_eq!(set.published()[0].name, "b_aggr1");

        set.virtual_pools
            .insert("b_pool_0".into(), StoragePool::new("b_pool_0", "b"));
        set.virtual_pools
            .insert("b_pool_1".into(), StoragePool::new("b_pool_1", "b"));
        let names: Vec<_> = set.published().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["b_pool_0", "b_pool_1"]);

        assert!(set.pool("b_aggr1").is_some());
        assert!(set.pool("b_pool_1").is_some());
        assert_eq!(set.iter().count(), 3);
    }
}
