//! Per-key coalescing delta queue between the reflector and the dispatch loop.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tanjun_core::{Delta, DeltaKind, Object, ObjectKey};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::indexer::Indexer;

pub type DeltaList<K> = SmallVec<[Delta<K>; 2]>;

/// All pending deltas of one key, handed out by [`DeltaQueue::pop`].
#[derive(Debug)]
pub struct Deltas<K> {
    pub key: ObjectKey,
    pub deltas: DeltaList<K>,
    initial: bool,
}

impl<K> Deltas<K> {
    /// Whether this key was queued by the first list.
    pub fn is_initial(&self) -> bool {
        self.initial
    }
}

struct Entry<K> {
    deltas: DeltaList<K>,
    initial: bool,
}

struct Inner<K> {
    items: FxHashMap<ObjectKey, Entry<K>>,
    order: VecDeque<ObjectKey>,
    /// Keys handed out by `pop` and not yet finished, with their last live state.
    processing: FxHashMap<ObjectKey, Option<Arc<K>>>,
    next_seq: u64,
    populated: bool,
    initial_remaining: usize,
    closed: bool,
}

/// FIFO across keys, coalescing within a key.
///
/// Consecutive non-delete deltas of a pending key collapse into the newest one
/// (an `Added` keeps its kind). A `Deleted` drops pending updates of that key
/// but is never dropped itself. A pending `Added`, or anything queued right
/// after an earlier `Deleted`, survives in front of it.
pub struct DeltaQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K: Object> DeltaQueue<K> {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: FxHashMap::with_capacity_and_hasher(cap, Default::default()),
                order: VecDeque::with_capacity(cap),
                processing: FxHashMap::default(),
                next_seq: 0,
                populated: false,
                initial_remaining: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys with pending deltas.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the first [`replace`](Self::replace) happened and every key it
    /// queued has been popped and [`finish`](Self::finish)ed.
    pub fn has_synced(&self) -> bool {
        let inner = self.lock();
        inner.populated && inner.initial_remaining == 0
    }

    pub fn push(&self, delta: Delta<K>) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.push(delta, false);
            gauge!("informer_queue_depth", inner.items.len() as f64);
        }
        self.notify.notify_one();
    }

    /// Replace the queue's view of the world with a full list.
    ///
    /// Every listed item is queued as `Replaced`. Every key cached in `cache`
    /// or pending in the queue that the list no longer contains is queued as
    /// `Deleted` with its last known state. The cache is read under the queue
    /// lock: a key finished before that is in the snapshot, a later one is
    /// still in flight.
    pub fn replace(&self, items: Vec<K>, cache: &Indexer<K>) -> usize {
        let queued = {
            let mut inner = self.lock();
            if inner.closed {
                return 0;
            }
            let first = !inner.populated;
            let mut listed: FxHashSet<ObjectKey> = FxHashSet::default();
            let mut touched: FxHashSet<ObjectKey> = FxHashSet::default();

            for item in items {
                let key = item.key();
                listed.insert(key.clone());
                touched.insert(key);
                inner.push(Delta::new(DeltaKind::Replaced, item), first);
            }

            let mut gone: FxHashMap<ObjectKey, Arc<K>> = FxHashMap::default();
            for (key, obj) in cache.current().entries() {
                if !listed.contains(&key) {
                    gone.insert(key, obj);
                }
            }
            // Keys queued or in flight but not yet applied also count as known.
            let pending = inner.items.iter().filter_map(|(key, entry)| {
                entry.deltas.last().filter(|d| d.kind != DeltaKind::Deleted).map(|d| (key, &d.object))
            });
            let in_flight = inner.processing.iter().filter_map(|(key, obj)| obj.as_ref().map(|o| (key, o)));
            for (key, obj) in pending.chain(in_flight) {
                if !listed.contains(key) && !gone.contains_key(key) {
                    gone.insert(key.clone(), Arc::clone(obj));
                }
            }
            for (key, obj) in gone {
                debug!(key = %key, "relist: object vanished; queueing delete");
                touched.insert(key);
                inner.push(Delta { kind: DeltaKind::Deleted, object: obj, seq: 0 }, first);
            }

            if first {
                inner.populated = true;
                inner.initial_remaining = touched.len();
            }
            gauge!("informer_queue_depth", inner.items.len() as f64);
            touched.len()
        };
        self.notify.notify_one();
        queued
    }

    /// Queue a `Sync` delta for every cached object that has nothing pending.
    pub fn resync(&self, cache: &Indexer<K>) -> usize {
        let mut n = 0;
        {
            let mut inner = self.lock();
            if inner.closed {
                return 0;
            }
            for obj in cache.current().list() {
                let key = obj.key();
                if inner.items.contains_key(&key) || inner.processing.contains_key(&key) {
                    continue;
                }
                inner.push(Delta { kind: DeltaKind::Sync, object: obj, seq: 0 }, false);
                n += 1;
            }
        }
        if n > 0 {
            self.notify.notify_one();
        }
        n
    }

    /// Wait for the next key with pending deltas. Returns `None` once closed.
    pub async fn pop(&self) -> Option<Deltas<K>> {
        loop {
            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(batch) = inner.take_next() {
                    gauge!("informer_queue_depth", inner.items.len() as f64);
                    return Some(batch);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<Deltas<K>> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        inner.take_next()
    }

    /// Mark a popped batch as fully processed.
    pub fn finish(&self, batch: &Deltas<K>) {
        let wake = {
            let mut inner = self.lock();
            inner.processing.remove(&batch.key);
            if batch.initial {
                inner.initial_remaining = inner.initial_remaining.saturating_sub(1);
            }
            inner.items.contains_key(&batch.key)
        };
        if wake {
            self.notify.notify_one();
        }
    }

    /// Drop everything pending and wake all waiters; `pop` returns `None` from now on.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            let dropped = inner.items.len();
            inner.items.clear();
            inner.order.clear();
            debug!(dropped, "delta queue closed");
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

impl<K: Object> Inner<K> {
    fn push(&mut self, mut delta: Delta<K>, initial: bool) {
        self.next_seq += 1;
        delta.seq = self.next_seq;
        counter!("informer_deltas_pushed", 1);
        let key = delta.key();
        trace!(key = %key, kind = delta.kind.as_str(), seq = delta.seq, "push");
        match self.items.get_mut(&key) {
            Some(entry) => {
                entry.initial |= initial;
                if coalesce(&mut entry.deltas, delta) {
                    counter!("informer_deltas_coalesced", 1);
                }
            }
            None => {
                let mut deltas = DeltaList::new();
                deltas.push(delta);
                self.items.insert(key.clone(), Entry { deltas, initial });
                self.order.push_back(key);
            }
        }
    }

    fn take_next(&mut self) -> Option<Deltas<K>> {
        let idx = self.order.iter().position(|k| !self.processing.contains_key(k))?;
        let key = self.order.remove(idx)?;
        let entry = self.items.remove(&key)?;
        let live = entry.deltas.last().filter(|d| d.kind != DeltaKind::Deleted).map(|d| Arc::clone(&d.object));
        self.processing.insert(key.clone(), live);
        Some(Deltas { key, deltas: entry.deltas, initial: entry.initial })
    }
}

/// Fold `delta` into the pending list of its key. Returns true if an older
/// delta was superseded.
fn coalesce<K>(pending: &mut DeltaList<K>, delta: Delta<K>) -> bool {
    let Some(last) = pending.last() else {
        pending.push(delta);
        return false;
    };
    match (last.kind, delta.kind) {
        (DeltaKind::Deleted, DeltaKind::Deleted) => {
            let n = pending.len();
            pending[n - 1] = delta;
            true
        }
        (prev, DeltaKind::Deleted) => {
            // An `Added`, or anything queued after an earlier delete, re-creates the key.
            let superseded = pending.len() == 1 && prev != DeltaKind::Added;
            if superseded {
                pending.pop();
            }
            pending.push(delta);
            superseded
        }
        (DeltaKind::Deleted, _) => {
            pending.push(delta);
            false
        }
        (prev, next) => {
            let kind = if prev == DeltaKind::Added { DeltaKind::Added } else { next };
            let n = pending.len();
            pending[n - 1] = Delta { kind, ..delta };
            true
        }
    }
}
