//! Local cache: a single writer applies deltas, readers load frozen snapshots.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tanjun_core::{Delta, DeltaKind, Object, ObjectKey};
use tokio::sync::watch;

/// Name of the index every indexer maintains.
pub const NAMESPACE_INDEX: &str = "namespace";

/// Maps an object to the index values it should be found under.
pub type IndexFn<K> = Arc<dyn Fn(&K) -> SmallVec<[String; 2]> + Send + Sync>;

type IndexMap = FxHashMap<String, FxHashMap<String, FxHashSet<ObjectKey>>>;

fn namespace_index<K: Object>() -> IndexFn<K> {
    Arc::new(|obj: &K| obj.key().namespace.into_iter().collect())
}

/// Immutable view of the cache at one epoch.
pub struct Snapshot<K> {
    pub epoch: u64,
    items: FxHashMap<ObjectKey, Arc<K>>,
    indices: IndexMap,
}

impl<K> Default for Snapshot<K> {
    fn default() -> Self {
        Self { epoch: 0, items: FxHashMap::default(), indices: IndexMap::default() }
    }
}

impl<K> Snapshot<K> {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.items.get(key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.items.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.items.values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(ObjectKey, Arc<K>)> {
        self.items.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
    }

    /// Objects filed under `value` in the named index. Unknown index → empty.
    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<K>> {
        self.indices
            .get(index)
            .and_then(|m| m.get(value))
            .map(|keys| keys.iter().filter_map(|k| self.items.get(k).cloned()).collect())
            .unwrap_or_default()
    }

    /// Distinct values currently present in the named index.
    pub fn index_values(&self, index: &str) -> Vec<String> {
        self.indices.get(index).map(|m| m.keys().cloned().collect()).unwrap_or_default()
    }
}

/// Result of applying one delta.
#[derive(Debug)]
pub struct Applied<K> {
    /// Cached value before the delta, if any.
    pub old: Option<Arc<K>>,
    /// Cached value after the delta; `None` for deletes and dropped resyncs.
    pub new: Option<Arc<K>>,
}

/// Builder for an indexer with extra named indexes.
pub struct IndexerBuilder<K> {
    index_fns: Vec<(String, IndexFn<K>)>,
}

impl<K: Object> Default for IndexerBuilder<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Object> IndexerBuilder<K> {
    pub fn new() -> Self {
        Self { index_fns: vec![(NAMESPACE_INDEX.to_string(), namespace_index())] }
    }

    pub fn with_index(mut self, name: &str, f: IndexFn<K>) -> Self {
        self.index_fns.retain(|(n, _)| n != name);
        self.index_fns.push((name.to_string(), f));
        self
    }

    pub fn build(self) -> (IndexWriter<K>, Indexer<K>) {
        let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let writer = IndexWriter {
            items: FxHashMap::default(),
            indices: IndexMap::default(),
            index_fns: self.index_fns,
            epoch: 0,
            dirty: false,
            snap: Arc::clone(&snap),
            epoch_tx,
        };
        (writer, Indexer { snap, epoch_rx })
    }
}

/// An indexer with only the namespace index.
pub fn indexer<K: Object>() -> (IndexWriter<K>, Indexer<K>) {
    IndexerBuilder::new().build()
}

/// The only mutator of the cache. Owned by the dispatch loop.
pub struct IndexWriter<K> {
    items: FxHashMap<ObjectKey, Arc<K>>,
    indices: IndexMap,
    index_fns: Vec<(String, IndexFn<K>)>,
    epoch: u64,
    dirty: bool,
    snap: Arc<ArcSwap<Snapshot<K>>>,
    epoch_tx: watch::Sender<u64>,
}

impl<K: Object> IndexWriter<K> {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.items.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Apply one delta to the working set. Readers see it after [`publish`](Self::publish).
    ///
    /// A `Sync` never writes: it re-delivers the cached value, and is dropped
    /// for a key that is no longer cached. Its object may come from an older
    /// snapshot.
    pub fn apply(&mut self, delta: &Delta<K>) -> Applied<K> {
        let key = delta.key();
        match delta.kind {
            DeltaKind::Sync => match self.items.get(&key) {
                Some(cur) => Applied { old: Some(Arc::clone(cur)), new: Some(Arc::clone(cur)) },
                None => Applied { old: None, new: None },
            },
            DeltaKind::Deleted => {
                let old = self.items.remove(&key);
                if let Some(prev) = &old {
                    self.dirty = true;
                    self.unindex(&key, prev);
                }
                Applied { old, new: None }
            }
            DeltaKind::Added | DeltaKind::Updated | DeltaKind::Replaced => {
                self.dirty = true;
                let new = Arc::clone(&delta.object);
                let old = self.items.insert(key.clone(), Arc::clone(&new));
                if let Some(prev) = &old {
                    self.unindex(&key, prev);
                }
                self.index(&key, &new);
                Applied { old, new: Some(new) }
            }
        }
    }

    /// Freeze the working set into a new snapshot and swap it in.
    pub fn publish(&mut self) -> u64 {
        if !self.dirty {
            return self.epoch;
        }
        self.dirty = false;
        self.epoch = self.epoch.saturating_add(1);
        // Freezing clones the key maps; values are shared.
        let next = Snapshot { epoch: self.epoch, items: self.items.clone(), indices: self.indices.clone() };
        self.snap.store(Arc::new(next));
        gauge!("informer_cache_objects", self.items.len() as f64);
        let _ = self.epoch_tx.send(self.epoch);
        self.epoch
    }

    fn index(&mut self, key: &ObjectKey, obj: &K) {
        for (name, f) in &self.index_fns {
            let by_value = self.indices.entry(name.clone()).or_default();
            for value in f(obj) {
                by_value.entry(value).or_default().insert(key.clone());
            }
        }
    }

    fn unindex(&mut self, key: &ObjectKey, obj: &K) {
        for (name, f) in &self.index_fns {
            let Some(by_value) = self.indices.get_mut(name) else { continue };
            for value in f(obj) {
                if let Some(keys) = by_value.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        by_value.remove(&value);
                    }
                }
            }
        }
    }
}

/// Read handle on the cache. Clone freely; every read sees one whole snapshot.
pub struct Indexer<K> {
    snap: Arc<ArcSwap<Snapshot<K>>>,
    epoch_rx: watch::Receiver<u64>,
}

impl<K> Clone for Indexer<K> {
    fn clone(&self) -> Self {
        Self { snap: Arc::clone(&self.snap), epoch_rx: self.epoch_rx.clone() }
    }
}

impl<K: Object> Indexer<K> {
    pub fn current(&self) -> Arc<Snapshot<K>> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.snap.load().get(key)
    }

    pub fn get_by_name(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        self.get(&ObjectKey::new(namespace, name))
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.snap.load().list()
    }

    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        self.snap.load().by_index(NAMESPACE_INDEX, namespace)
    }

    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<K>> {
        self.snap.load().by_index(index, value)
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.snap.load().keys()
    }

    pub fn len(&self) -> usize {
        self.snap.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snap.load().is_empty()
    }
}
