//! Event handlers and the dispatcher registry.

#![forbid(unsafe_code)]

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use metrics::counter;
use tanjun_core::{Delta, DeltaKind, Object};
use tanjun_store::Applied;
use tracing::{error, warn};

/// Failure reported by a handler. Logged and counted; delivery continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Receives cache changes for objects of type `K`, in apply order.
///
/// Callbacks run on the dispatch loop; a slow handler delays every other
/// handler but never the reflector.
pub trait Handler<K>: Send + Sync {
    fn on_add(&self, _obj: &K) -> Result<(), HandlerError> {
        Ok(())
    }

    /// `old` is the value cached before this change. Resyncs call this with
    /// `old` and `new` at the same version.
    fn on_update(&self, _old: &K, _new: &K) -> Result<(), HandlerError> {
        Ok(())
    }

    /// `obj` is the last known state; the cache entry is already gone.
    fn on_delete(&self, _obj: &K) -> Result<(), HandlerError> {
        Ok(())
    }
}

type ObjFn<K> = Box<dyn Fn(&K) -> Result<(), HandlerError> + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&K, &K) -> Result<(), HandlerError> + Send + Sync>;

/// A [`Handler`] assembled from optional closures.
pub struct HandlerFuncs<K> {
    add: Option<ObjFn<K>>,
    update: Option<UpdateFn<K>>,
    delete: Option<ObjFn<K>>,
}

impl<K> Default for HandlerFuncs<K> {
    fn default() -> Self {
        Self { add: None, update: None, delete: None }
    }
}

impl<K> HandlerFuncs<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(mut self, f: impl Fn(&K) -> Result<(), HandlerError> + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&K, &K) -> Result<(), HandlerError> + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&K) -> Result<(), HandlerError> + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<K: Send + Sync> Handler<K> for HandlerFuncs<K> {
    fn on_add(&self, obj: &K) -> Result<(), HandlerError> {
        self.add.as_ref().map_or(Ok(()), |f| f(obj))
    }

    fn on_update(&self, old: &K, new: &K) -> Result<(), HandlerError> {
        self.update.as_ref().map_or(Ok(()), |f| f(old, new))
    }

    fn on_delete(&self, obj: &K) -> Result<(), HandlerError> {
        self.delete.as_ref().map_or(Ok(()), |f| f(obj))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// What handlers get told about one applied delta.
#[derive(Debug, Clone)]
pub(crate) enum Notification<K> {
    Add(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete(Arc<K>),
}

impl<K> Notification<K> {
    fn callback(&self) -> &'static str {
        match self {
            Notification::Add(_) => "on_add",
            Notification::Update { .. } => "on_update",
            Notification::Delete(_) => "on_delete",
        }
    }
}

/// Map a delta and its effect on the cache to a callback.
pub(crate) fn notification<K: Object>(delta: &Delta<K>, applied: Applied<K>) -> Option<Notification<K>> {
    match (delta.kind, applied.old, applied.new) {
        (DeltaKind::Deleted, Some(old), _) => Some(Notification::Delete(old)),
        (DeltaKind::Deleted, None, _) => Some(Notification::Delete(Arc::clone(&delta.object))),
        (_, None, Some(new)) => Some(Notification::Add(new)),
        (_, Some(old), Some(new)) => Some(Notification::Update { old, new }),
        // Dropped resync.
        (_, _, None) => None,
    }
}

type HandlerList<K> = Arc<Vec<(HandlerId, Arc<dyn Handler<K>>)>>;

/// Registered handlers, in registration order.
pub(crate) struct Registry<K> {
    next_id: u64,
    handlers: HandlerList<K>,
}

impl<K> Default for Registry<K> {
    fn default() -> Self {
        Self { next_id: 0, handlers: Arc::new(Vec::new()) }
    }
}

impl<K: Object> Registry<K> {
    pub(crate) fn insert(&mut self, handler: Arc<dyn Handler<K>>) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        Arc::make_mut(&mut self.handlers).push((id, handler));
        id
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        Arc::make_mut(&mut self.handlers).retain(|(h, _)| *h != id);
        self.handlers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    /// The handlers registered right now. Later changes to the registry do
    /// not affect it.
    pub(crate) fn snapshot(&self) -> Handlers<K> {
        Handlers(Arc::clone(&self.handlers))
    }
}

/// A frozen handler list; dispatching through it needs no registry lock.
pub(crate) struct Handlers<K>(HandlerList<K>);

impl<K> Handlers<K> {
    pub(crate) fn dispatch(&self, note: &Notification<K>) {
        for (id, handler) in self.0.iter() {
            deliver(*id, handler.as_ref(), note);
        }
    }
}

/// Call one handler, containing errors and panics.
pub(crate) fn deliver<K>(id: HandlerId, handler: &dyn Handler<K>, note: &Notification<K>) {
    let outcome = catch_unwind(AssertUnwindSafe(|| match note {
        Notification::Add(obj) => handler.on_add(obj),
        Notification::Update { old, new } => handler.on_update(old, new),
        Notification::Delete(obj) => handler.on_delete(obj),
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(handler = %id, callback = note.callback(), error = %err, "handler failed");
            counter!("informer_handler_errors", 1, "cause" => "error");
        }
        Err(panic) => {
            error!(handler = %id, callback = note.callback(), panic = %panic_message(&*panic), "handler panicked");
            counter!("informer_handler_errors", 1, "cause" => "panic");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tanjun_core::ObjectKey;

    #[derive(Debug, Clone, PartialEq)]
    struct Item(&'static str, u32);

    impl Object for Item {
        fn key(&self) -> ObjectKey {
            ObjectKey::new(None, self.0)
        }

        fn resource_version(&self) -> Option<&str> {
            None
        }
    }

    fn applied(old: Option<Item>, new: Option<Item>) -> Applied<Item> {
        Applied { old: old.map(Arc::new), new: new.map(Arc::new) }
    }

    #[test]
    fn callback_mapping() {
        let add = Delta::new(DeltaKind::Replaced, Item("a", 1));
        assert!(matches!(notification(&add, applied(None, Some(Item("a", 1)))), Some(Notification::Add(_))));
        assert!(matches!(
            notification(&add, applied(Some(Item("a", 0)), Some(Item("a", 1)))),
            Some(Notification::Update { .. })
        ));

        let del = Delta::new(DeltaKind::Deleted, Item("a", 9));
        match notification(&del, applied(Some(Item("a", 1)), None)) {
            Some(Notification::Delete(obj)) => assert_eq!(*obj, Item("a", 1)),
            other => panic!("unexpected {:?}", other),
        }
        match notification(&del, applied(None, None)) {
            Some(Notification::Delete(obj)) => assert_eq!(*obj, Item("a", 9)),
            other => panic!("unexpected {:?}", other),
        }

        let sync = Delta::new(DeltaKind::Sync, Item("a", 1));
        assert!(notification(&sync, applied(None, None)).is_none());
    }

    #[test]
    fn panics_and_errors_are_contained() {
        let mut reg = Registry::<Item>::default();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        reg.insert(Arc::new(HandlerFuncs::new().on_add(|_: &Item| panic!("boom"))));
        reg.insert(Arc::new(HandlerFuncs::new().on_add(|_: &Item| Err(HandlerError::new("nope")))));
        let id = reg.insert(Arc::new(HandlerFuncs::new().on_add(move |o: &Item| {
            log.lock().unwrap().push(o.0);
            Ok(())
        })));

        reg.snapshot().dispatch(&Notification::Add(Arc::new(Item("a", 1))));
        assert_eq!(*seen.lock().unwrap(), vec!["a"]);

        assert!(reg.remove(id));
        assert!(!reg.remove(id));
        reg.snapshot().dispatch(&Notification::Add(Arc::new(Item("b", 1))));
        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn snapshots_ignore_later_registrations() {
        let mut reg = Registry::<Item>::default();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let first = reg.insert(Arc::new(HandlerFuncs::new().on_add(move |o: &Item| {
            log.lock().unwrap().push(o.0);
            Ok(())
        })));
        let frozen = reg.snapshot();
        reg.remove(first);
        reg.insert(Arc::new(HandlerFuncs::new().on_add(|_: &Item| panic!("not in the snapshot"))));

        frozen.dispatch(&Notification::Add(Arc::new(Item("a", 1))));
        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
    }
}
