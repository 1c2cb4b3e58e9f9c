#![forbid(unsafe_code)]

use std::sync::Arc;

use tanjun_core::{LabelSelector, Object};
use tanjun_store::Indexer;

/// Namespace/name view over the informer cache. Results are sorted by key.
pub struct Lister<K> {
    cache: Indexer<K>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self { cache: self.cache.clone() }
    }
}

impl<K: Object> Lister<K> {
    pub fn new(cache: Indexer<K>) -> Self {
        Self { cache }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.cache.get_by_name(Some(namespace), name)
    }

    /// Objects in `namespace`, or everywhere for `None`.
    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<K>> {
        let mut out = match namespace {
            Some(ns) => self.cache.list_namespace(ns),
            None => self.cache.list(),
        };
        out.sort_by_key(|o| o.key());
        out
    }

    pub fn list_matching(&self, namespace: Option<&str>, selector: &LabelSelector) -> Vec<Arc<K>> {
        let mut out = self.list(namespace);
        out.retain(|o| selector.matches(o.labels()));
        out
    }
}
