//! Resource registry contract and the in-memory cache

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// A cache-backed data handle that can refresh itself
#[async_trait]
pub trait Resource: Send + Sync {
    /// Cache key the resource is registered under
    fn cache_key(&self) -> &str;

    /// Refetch the resource's data
    async fn reload(&self) -> Result<()>;
}

/// Lookup of cached resources by key
pub trait ResourceRegistry: Send + Sync + 'static {
    /// Single-record resource cached under `cache_key`
    fn cached_resource(&self, cache_key: &str) -> Option<Arc<dyn Resource>>;

    /// List resource cached under `cache_key`
    fn cached_list_resource(&self, cache_key: &str) -> Option<Arc<dyn Resource>>;

    /// Single-record resource, falling back to the list resource
    fn lookup(&self, cache_key: &str) -> Option<Arc<dyn Resource>> {
        self.cached_resource(cache_key)
            .or_else(|| self.cached_list_resource(cache_key))
    }
}

impl<R: ResourceRegistry> ResourceRegistry for Arc<R> {
    fn cached_resource(&self, cache_key: &str) -> Option<Arc<dyn Resource>> {
        (**self).cached_resource(cache_key)
    }

    fn cached_list_resource(&self, cache_key: &str) -> Option<Arc<dyn Resource>> {
        (**self).cached_list_resource(cache_key)
    }

    fn lookup(&self, cache_key: &str) -> Option<Arc<dyn Resource>> {
        (**self).lookup(cache_key)
    }
}

type ResourceMap = RwLock<HashMap<String, Arc<dyn Resource>>>;

/// In-memory registry with separate single-record and list namespaces
#[derive(Default)]
pub struct ResourceCache {
    resources: ResourceMap,
    list_resources: ResourceMap,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache a single-record resource under its key, replacing any previous one
    pub fn register(&self, resource: Arc<dyn Resource>) {
        insert(&self.resources, resource);
    }

    /// Cache a list resource under its key, replacing any previous one
    pub fn register_list(&self, resource: Arc<dyn Resource>) {
        insert(&self.list_resources, resource);
    }

    /// Number of cached resources across both namespaces
    pub fn len(&self) -> usize {
        [&self.resources, &self.list_resources]
            .iter()
            .map(|map| map.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn insert(map: &ResourceMap, resource: Arc<dyn Resource>) {
    let key = resource.cache_key().to_string();
    map.write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key, resource);
}

fn get(map: &ResourceMap, cache_key: &str) -> Option<Arc<dyn Resource>> {
    map.read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(cache_key)
        .cloned()
}

impl ResourceRegistry for ResourceCache {
    fn cached_resource(&self, cache_key: &str) -> Option<Arc<dyn Resource>> {
        get(&self.resources, cache_key)
    }

    fn cached_list_resource(&self, cache_key: &str) -> Option<Arc<dyn Resource>> {
        get(&self.list_resources, cache_key)
    }
}
