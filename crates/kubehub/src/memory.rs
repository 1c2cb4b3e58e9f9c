//! In-process object source with a resource-version counter.
//!
//! Behaves like a small API server for one kind: `list` returns the current
//! objects and version, `watch` replays history newer than the requested
//! version and then follows live changes. History can be compacted and open
//! watches expired, which is how stale-cursor recovery gets exercised without
//! a cluster.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tanjun_core::{ListSelector, Object, ObjectKey, ObjectList, ObjectSource, SourceError, WatchEvent, WatchStream};
use tokio::sync::broadcast;
use tracing::debug;

/// Objects whose resource version the source may stamp.
pub trait Versioned: Object {
    fn set_resource_version(&mut self, rv: String);
}

#[derive(Debug, Clone)]
enum Signal<K> {
    Event(u64, WatchEvent<K>),
    Error(SourceError),
    Expire,
    Close,
}

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    rv: u64,
    history: VecDeque<(u64, WatchEvent<K>)>,
    /// Watches from a version below this get `StaleCursor`.
    oldest: u64,
    list_failures: VecDeque<SourceError>,
    watch_failures: VecDeque<SourceError>,
    list_calls: usize,
    watch_calls: usize,
}

pub struct MemorySource<K> {
    state: Mutex<State<K>>,
    tx: broadcast::Sender<Signal<K>>,
}

impl<K: Versioned> Default for MemorySource<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Versioned> MemorySource<K> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                rv: 0,
                history: VecDeque::new(),
                oldest: 0,
                list_failures: VecDeque::new(),
                watch_failures: VecDeque::new(),
                list_calls: 0,
                watch_calls: 0,
            }),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, state: &mut State<K>, ev: WatchEvent<K>) {
        let rv = state.rv;
        state.history.push_back((rv, ev.clone()));
        let _ = self.tx.send(Signal::Event(rv, ev));
    }

    /// Create or replace an object; returns it stamped with its new version.
    pub fn apply(&self, mut obj: K) -> K {
        let mut state = self.lock();
        state.rv += 1;
        obj.set_resource_version(state.rv.to_string());
        let key = obj.key();
        let existed = state.objects.insert(key, obj.clone()).is_some();
        let ev = if existed { WatchEvent::Modified(obj.clone()) } else { WatchEvent::Added(obj.clone()) };
        self.record(&mut state, ev);
        obj
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<K> {
        let mut state = self.lock();
        let mut obj = state.objects.remove(key)?;
        state.rv += 1;
        obj.set_resource_version(state.rv.to_string());
        self.record(&mut state, WatchEvent::Deleted(obj.clone()));
        Some(obj)
    }

    /// Change state without notifying watchers or keeping history, as if the
    /// change happened while the history window was lost.
    pub fn apply_silently(&self, mut obj: K) -> K {
        let mut state = self.lock();
        state.rv += 1;
        obj.set_resource_version(state.rv.to_string());
        state.objects.insert(obj.key(), obj.clone());
        state.oldest = state.rv;
        state.history.clear();
        obj
    }

    pub fn delete_silently(&self, key: &ObjectKey) -> Option<K> {
        let mut state = self.lock();
        let obj = state.objects.remove(key)?;
        state.rv += 1;
        state.oldest = state.rv;
        state.history.clear();
        Some(obj)
    }

    /// Forget history; watches from older versions become stale.
    pub fn compact(&self) {
        let mut state = self.lock();
        state.oldest = state.rv;
        state.history.clear();
    }

    /// Fail every open watch with `StaleCursor`.
    pub fn expire_watches(&self) {
        debug!("memory source: expiring watches");
        let _ = self.tx.send(Signal::Expire);
    }

    /// End every open watch cleanly, like a server-side timeout.
    pub fn close_watches(&self) {
        let _ = self.tx.send(Signal::Close);
    }

    /// Deliver `err` as an item on every open watch; the streams stay open.
    pub fn inject_watch_error(&self, err: SourceError) {
        let _ = self.tx.send(Signal::Error(err));
    }

    pub fn fail_next_list(&self, err: SourceError) {
        self.lock().list_failures.push_back(err);
    }

    pub fn fail_next_watch(&self, err: SourceError) {
        self.lock().watch_failures.push_back(err);
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn watch_calls(&self) -> usize {
        self.lock().watch_calls
    }

    pub fn resource_version(&self) -> u64 {
        self.lock().rv
    }

    pub fn get(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }
}

fn event_object<K>(ev: &WatchEvent<K>) -> Option<&K> {
    match ev {
        WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
        WatchEvent::Bookmark(_) => None,
    }
}

#[async_trait]
impl<K: Versioned> ObjectSource<K> for MemorySource<K> {
    async fn list(&self, selector: &ListSelector) -> Result<ObjectList<K>, SourceError> {
        let mut state = self.lock();
        state.list_calls += 1;
        if let Some(err) = state.list_failures.pop_front() {
            return Err(err);
        }
        let items = state.objects.values().filter(|o| selector.matches(*o)).cloned().collect();
        Ok(ObjectList { items, resource_version: state.rv.to_string() })
    }

    async fn watch(&self, selector: &ListSelector, resource_version: &str) -> Result<WatchStream<K>, SourceError> {
        let mut state = self.lock();
        state.watch_calls += 1;
        if let Some(err) = state.watch_failures.pop_front() {
            return Err(err);
        }
        let from: u64 = resource_version
            .parse()
            .map_err(|_| SourceError::Malformed(format!("resource version {:?}", resource_version)))?;
        if from < state.oldest {
            return Err(SourceError::StaleCursor(format!("{} < {}", from, state.oldest)));
        }
        let rx = self.tx.subscribe();
        let selector = selector.clone();
        let keep = move |ev: &WatchEvent<K>| event_object(ev).map_or(true, |o| selector.matches(o));
        let replay: Vec<_> = state
            .history
            .iter()
            .filter(|(rv, ev)| *rv > from && keep(ev))
            .map(|(_, ev)| Ok(ev.clone()))
            .collect();
        let last = state.history.back().map_or(from, |(rv, _)| (*rv).max(from));
        drop(state);

        let live = futures::stream::unfold(Some((rx, last)), move |st| {
            let keep = keep.clone();
            async move {
                let (mut rx, last) = st?;
                loop {
                    match rx.recv().await {
                        Ok(Signal::Event(rv, ev)) => {
                            if rv <= last || !keep(&ev) {
                                continue;
                            }
                            return Some((Ok(ev), Some((rx, rv))));
                        }
                        Ok(Signal::Error(err)) => return Some((Err(err), Some((rx, last)))),
                        Ok(Signal::Expire) => {
                            return Some((Err(SourceError::StaleCursor("watch expired".into())), None));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((Err(SourceError::StaleCursor(format!("watcher lagged by {}", n))), None));
                        }
                        Ok(Signal::Close) | Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(futures::stream::iter(replay).chain(live).boxed())
    }
}
