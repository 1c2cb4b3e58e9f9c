//! Tanjun core types: object keys, deltas and the remote source contract.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod selector;
mod stop;

pub use selector::{LabelSelector, Requirement, SelectorError};
pub use stop::{stop_pair, StopHandle, StopSignal};

/// Cache key of an object: optional namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(str::to_string), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    /// Parse `ns/name` or a bare cluster-scoped `name`.
    pub fn parse(key: &str) -> Self {
        match key.split_once('/') {
            Some((ns, name)) if !ns.is_empty() => Self::namespaced(ns, name),
            Some((_, name)) => Self::new(None, name),
            None => Self::new(None, key),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A watched object as the informer sees it.
///
/// Implemented once per watched type; handlers and listers are generic over it,
/// so no runtime downcasts happen on the delivery path.
pub trait Object: Clone + Send + Sync + 'static {
    fn key(&self) -> ObjectKey;

    /// Opaque resource version of this snapshot of the object.
    fn resource_version(&self) -> Option<&str>;

    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        None
    }
}

/// Whether `candidate` is strictly newer than `current`.
///
/// Versions are opaque; when both parse as integers they are compared
/// numerically, otherwise the candidate is taken as newer.
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    match (candidate.parse::<u64>(), current.parse::<u64>()) {
        (Ok(c), Ok(cur)) => c > cur,
        _ => candidate != current,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Produced by a full list or relist.
    Replaced,
    /// Produced by the periodic resync for an unchanged cached object.
    Sync,
}

impl DeltaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
            DeltaKind::Replaced => "replaced",
            DeltaKind::Sync => "sync",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delta<K> {
    pub kind: DeltaKind,
    pub object: Arc<K>,
    /// Logical sequence number, assigned by the queue on push.
    pub seq: u64,
}

impl<K: Object> Delta<K> {
    pub fn new(kind: DeltaKind, object: impl Into<Arc<K>>) -> Self {
        Self { kind, object: object.into(), seq: 0 }
    }

    pub fn key(&self) -> ObjectKey {
        self.object.key()
    }
}

/// Raw event from a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker: the stream is current up to this version.
    Bookmark(String),
}

impl<K: Object> WatchEvent<K> {
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o.resource_version(),
            WatchEvent::Bookmark(rv) => Some(rv.as_str()),
        }
    }
}

/// Result of a list call: the items plus the collection resource version.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// Scope of a list/watch: optional namespace and label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSelector {
    pub namespace: Option<String>,
    pub labels: LabelSelector,
}

impl ListSelector {
    pub fn namespaced(namespace: &str) -> Self {
        Self { namespace: Some(namespace.to_string()), labels: LabelSelector::default() }
    }

    pub fn with_labels(mut self, labels: LabelSelector) -> Self {
        self.labels = labels;
        self
    }

    pub fn matches<K: Object>(&self, obj: &K) -> bool {
        if let Some(ns) = &self.namespace {
            if obj.key().namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        self.labels.matches(obj.labels())
    }
}

/// Errors reported by an [`ObjectSource`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Network or server hiccup; retried with backoff.
    #[error("transient source error: {0}")]
    Transient(String),
    /// The watch cursor is no longer served (HTTP 410 Gone); forces a relist.
    #[error("resource version too old: {0}")]
    StaleCursor(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("malformed object: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Transient(_) => "transient",
            SourceError::StaleCursor(_) => "stale_cursor",
            SourceError::Permission(_) => "permission",
            SourceError::Malformed(_) => "malformed",
        }
    }
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, SourceError>>;

/// The remote list/watch endpoint for one object type.
///
/// A watch stream ending with `None` means the server closed it cleanly
/// (timeout); an `Err(StaleCursor)` item means the cursor expired.
#[async_trait]
pub trait ObjectSource<K: Object>: Send + Sync {
    async fn list(&self, selector: &ListSelector) -> Result<ObjectList<K>, SourceError>;

    async fn watch(&self, selector: &ListSelector, resource_version: &str) -> Result<WatchStream<K>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parse_and_display() {
        let k = ObjectKey::parse("test/foo");
        assert_eq!(k, ObjectKey::namespaced("test", "foo"));
        assert_eq!(k.to_string(), "test/foo");
        assert_eq!(ObjectKey::parse("bar").to_string(), "bar");
        assert_eq!(ObjectKey::parse("/bar"), ObjectKey::new(None, "bar"));
    }

    #[test]
    fn numeric_versions_compare_numerically() {
        assert!(is_newer_version("10", "9"));
        assert!(!is_newer_version("9", "10"));
        assert!(!is_newer_version("7", "7"));
        assert!(is_newer_version("abc", "abd"));
        assert!(!is_newer_version("abc", "abc"));
    }
}
