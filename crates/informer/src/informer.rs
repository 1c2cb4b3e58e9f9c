#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tanjun_core::{Object, ObjectSource, StopSignal};
use tanjun_kubehub::{ErrorHook, Health, Reflector};
use tanjun_store::{DeltaQueue, IndexWriter, Indexer, IndexerBuilder, SyncBarrier};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::InformerConfig;
use crate::handler::{deliver, notification, Handler, HandlerId, Notification, Registry};
use crate::lister::Lister;
use crate::InformerError;

/// Pieces consumed by [`Informer::start`].
struct Parts<K: Object> {
    reflector: Reflector<K>,
    writer: IndexWriter<K>,
}

/// A list-watch informer for one object type.
///
/// The reflector task feeds the delta queue; the dispatch task drains it,
/// applies each batch to the cache, publishes a snapshot and then calls the
/// handlers. Reads go through [`Lister`] or [`Indexer`] and never block the
/// dispatch task.
pub struct Informer<K: Object> {
    config: InformerConfig,
    queue: Arc<DeltaQueue<K>>,
    cache: Indexer<K>,
    barrier: SyncBarrier,
    handlers: Arc<RwLock<Registry<K>>>,
    health: watch::Receiver<Health>,
    parts: Mutex<Option<Parts<K>>>,
}

/// Join handles of a started informer.
pub struct RunHandle {
    reflector: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

impl RunHandle {
    /// Wait for both tasks; they exit once the stop signal fires.
    pub async fn join(self) -> Result<(), InformerError> {
        let (reflector, dispatch) = tokio::join!(self.reflector, self.dispatch);
        reflector?;
        dispatch?;
        Ok(())
    }
}

impl<K: Object> Informer<K> {
    pub fn new(source: Arc<dyn ObjectSource<K>>, config: InformerConfig) -> Result<Self, InformerError> {
        Self::with_indexes(source, config, IndexerBuilder::new())
    }

    /// Like [`new`](Self::new), with extra named indexes on the cache.
    pub fn with_indexes(
        source: Arc<dyn ObjectSource<K>>,
        config: InformerConfig,
        indexes: IndexerBuilder<K>,
    ) -> Result<Self, InformerError> {
        let reflector_cfg = config.reflector()?;
        let queue = Arc::new(DeltaQueue::with_capacity(config.queue_cap));
        let (writer, cache) = indexes.build();
        let barrier = SyncBarrier::new();
        let reflector = Reflector::new(source, Arc::clone(&queue), cache.clone(), barrier.clone(), reflector_cfg);
        let health = reflector.health();
        Ok(Self {
            config,
            queue,
            cache,
            barrier,
            handlers: Arc::new(RwLock::new(Registry::default())),
            health,
            parts: Mutex::new(Some(Parts { reflector, writer })),
        })
    }

    /// Call `hook` for every list/watch error. Only effective before `start`.
    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        let parts = self.parts.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(p) = parts.take() {
            *parts = Some(Parts { reflector: p.reflector.with_error_hook(hook), writer: p.writer });
        }
        self
    }

    pub fn config(&self) -> &InformerConfig {
        &self.config
    }

    /// Register a handler. It first gets `on_add` for every cached object,
    /// then every later change.
    ///
    /// May be called from inside a handler callback, but not from a callback
    /// that is itself being replayed by `add_handler`: the registry lock is
    /// held for the whole replay.
    pub fn add_handler(&self, handler: impl Handler<K> + 'static) -> HandlerId {
        let handler: Arc<dyn Handler<K>> = Arc::new(handler);
        // The dispatch loop applies and publishes under the read lock, so the
        // cache seen here is exactly what the existing handlers were sent.
        let mut registry = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let id = registry.insert(Arc::clone(&handler));
        let existing = Lister::new(self.cache.clone()).list(None);
        for obj in &existing {
            deliver(id, handler.as_ref(), &Notification::Add(Arc::clone(obj)));
        }
        debug!(handler = %id, replayed = existing.len(), total = registry.len(), "handler registered");
        id
    }

    /// Unregister a handler. A batch already being dispatched may still reach it.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).remove(id)
    }

    pub fn lister(&self) -> Lister<K> {
        Lister::new(self.cache.clone())
    }

    pub fn indexer(&self) -> Indexer<K> {
        self.cache.clone()
    }

    pub fn has_synced(&self) -> bool {
        self.barrier.has_synced()
    }

    /// True once the first list is in the cache; false if `stop` fires first.
    pub async fn wait_for_sync(&self, stop: &StopSignal) -> bool {
        self.barrier.wait_for_sync(stop).await
    }

    pub fn health(&self) -> watch::Receiver<Health> {
        self.health.clone()
    }

    /// Spawn the reflector and dispatch tasks. Fails if already started.
    pub fn start(&self, stop: StopSignal) -> Result<RunHandle, InformerError> {
        let Parts { reflector, writer } =
            self.parts.lock().unwrap_or_else(PoisonError::into_inner).take().ok_or(InformerError::AlreadyStarted)?;
        info!(namespace = ?self.config.namespace, resync_secs = self.config.resync_secs, "informer starting");
        let reflector = tokio::spawn(reflector.run(stop.clone()));
        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&self.queue),
            writer,
            Arc::clone(&self.handlers),
            self.barrier.clone(),
            stop,
        ));
        Ok(RunHandle { reflector, dispatch })
    }
}

async fn dispatch_loop<K: Object>(
    queue: Arc<DeltaQueue<K>>,
    mut writer: IndexWriter<K>,
    handlers: Arc<RwLock<Registry<K>>>,
    barrier: SyncBarrier,
    stop: StopSignal,
) {
    let mut batches: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.stopped() => None,
            batch = queue.pop() => batch,
        };
        let Some(batch) = next else { break };
        // Handlers run without the registry lock so they may register others.
        let (targets, notes) = {
            let registry = handlers.read().unwrap_or_else(PoisonError::into_inner);
            let notes: Vec<_> =
                batch.deltas.iter().filter_map(|delta| notification(delta, writer.apply(delta))).collect();
            writer.publish();
            (registry.snapshot(), notes)
        };
        for note in &notes {
            targets.dispatch(note);
        }
        queue.finish(&batch);
        batches += 1;
        if !barrier.has_synced() && queue.has_synced() {
            barrier.mark_synced();
        }
    }
    queue.close();
    info!(batches, "dispatch loop stopped");
}
