//! List + watch driver feeding the delta queue.
//!
//! One `Reflector` owns the watch cursor. It lists, replaces the queue's view
//! with the result, then watches from the list version, pushing one delta per
//! event. A clean end of the watch stream re-opens it from the cursor; an
//! expired cursor relists at once; any other failure backs off and relists.
//! A separate timer re-enqueues cached objects for periodic resync.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use metrics::{counter, histogram};
use tanjun_core::{
    is_newer_version, Delta, DeltaKind, ListSelector, Object, ObjectSource, SourceError, StopSignal, WatchEvent,
};
use tanjun_store::{DeltaQueue, Indexer, SyncBarrier};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::{Backoff, BackoffConfig};

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    pub selector: ListSelector,
    /// Period of the resync timer; `None` disables it.
    pub resync: Option<Duration>,
    pub backoff: BackoffConfig,
    /// Consecutive failures before health turns `Unreachable`.
    pub failure_threshold: u32,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            selector: ListSelector::default(),
            resync: Some(Duration::from_secs(30)),
            backoff: BackoffConfig::default(),
            failure_threshold: 5,
        }
    }
}

/// Connection health as seen by the reflector. Independent of the sync barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Starting,
    Listing,
    Watching,
    Backoff { failures: u32 },
    /// Still retrying, but the failure threshold has been crossed.
    Unreachable { failures: u32, last_error: String },
    Denied { reason: String },
    Stopped,
}

pub type ErrorHook = Arc<dyn Fn(&SourceError) + Send + Sync>;

enum WatchEnd {
    /// Server closed the stream; re-open from the cursor.
    Closed,
    Stale,
    Failed(SourceError),
    Stopped,
}

pub struct Reflector<K: Object> {
    source: Arc<dyn ObjectSource<K>>,
    queue: Arc<DeltaQueue<K>>,
    cache: Indexer<K>,
    barrier: SyncBarrier,
    config: ReflectorConfig,
    health: watch::Sender<Health>,
    on_error: Option<ErrorHook>,
    cursor: Option<String>,
    failures: u32,
}

impl<K: Object> Reflector<K> {
    pub fn new(
        source: Arc<dyn ObjectSource<K>>,
        queue: Arc<DeltaQueue<K>>,
        cache: Indexer<K>,
        barrier: SyncBarrier,
        config: ReflectorConfig,
    ) -> Self {
        let (health, _) = watch::channel(Health::Starting);
        Self { source, queue, cache, barrier, config, health, on_error: None, cursor: None, failures: 0 }
    }

    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.on_error = Some(hook);
        self
    }

    pub fn health(&self) -> watch::Receiver<Health> {
        self.health.subscribe()
    }

    /// Run until `stop` fires.
    pub async fn run(mut self, stop: StopSignal) {
        info!(selector = ?self.config.selector, resync = ?self.config.resync, "reflector started");
        let resync = resync_loop(Arc::clone(&self.queue), self.cache.clone(), self.config.resync, stop.clone());
        tokio::join!(self.list_and_watch(&stop), resync);
        self.health.send_replace(Health::Stopped);
        info!("reflector stopped");
    }

    async fn list_and_watch(&mut self, stop: &StopSignal) {
        let mut backoff = Backoff::new(self.config.backoff);
        while !stop.is_stopped() {
            self.health.send_replace(Health::Listing);
            let listed = tokio::select! {
                _ = stop.stopped() => return,
                res = self.relist() => res,
            };
            if let Err(err) = listed {
                let delay = self.on_failure(&err, &mut backoff);
                if !sleep_or_stop(delay, stop).await {
                    return;
                }
                continue;
            }
            self.failures = 0;

            // Watch until the stream cannot be resumed from the cursor.
            loop {
                let opened = Instant::now();
                match self.watch_once(stop).await {
                    WatchEnd::Stopped => return,
                    WatchEnd::Closed => {
                        counter!("informer_watch_restarts", 1);
                        debug!(rv = ?self.cursor, "watch closed by server; resuming");
                        if opened.elapsed() >= backoff.healthy_after() {
                            backoff.reset();
                        } else if !sleep_or_stop(backoff.next(), stop).await {
                            return;
                        }
                    }
                    WatchEnd::Stale => {
                        info!(rv = ?self.cursor, "watch cursor expired; relisting");
                        if opened.elapsed() >= backoff.healthy_after() {
                            backoff.reset();
                        } else if !sleep_or_stop(backoff.next(), stop).await {
                            return;
                        }
                        break;
                    }
                    WatchEnd::Failed(err) => {
                        if opened.elapsed() >= backoff.healthy_after() {
                            backoff.reset();
                        }
                        let delay = self.on_failure(&err, &mut backoff);
                        if !sleep_or_stop(delay, stop).await {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }

    async fn relist(&mut self) -> Result<(), SourceError> {
        let started = Instant::now();
        let list = self.source.list(&self.config.selector).await?;
        histogram!("informer_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("informer_relists", 1);
        let items = list.items.len();
        let queued = self.queue.replace(list.items, &self.cache);
        info!(items, queued, rv = %list.resource_version, "list applied to queue");
        self.cursor = Some(list.resource_version);
        if self.queue.has_synced() {
            self.barrier.mark_synced();
        }
        Ok(())
    }

    async fn watch_once(&mut self, stop: &StopSignal) -> WatchEnd {
        let rv = self.cursor.clone().unwrap_or_else(|| "0".to_string());
        let opened = tokio::select! {
            _ = stop.stopped() => return WatchEnd::Stopped,
            res = self.source.watch(&self.config.selector, &rv) => res,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(SourceError::StaleCursor(msg)) => {
                debug!(rv = %rv, msg = %msg, "watch refused: stale cursor");
                return WatchEnd::Stale;
            }
            Err(err) => return WatchEnd::Failed(err),
        };
        self.health.send_replace(Health::Watching);
        self.failures = 0;
        debug!(rv = %rv, "watch opened");
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.stopped() => return WatchEnd::Stopped,
                next = stream.next() => next,
            };
            match next {
                None => return WatchEnd::Closed,
                Some(Ok(ev)) => self.handle_event(ev),
                Some(Err(SourceError::Malformed(msg))) => {
                    warn!(error = %msg, "skipping malformed watch event");
                    counter!("informer_source_errors", 1, "kind" => "malformed");
                }
                Some(Err(SourceError::StaleCursor(msg))) => {
                    debug!(msg = %msg, "watch stream: stale cursor");
                    return WatchEnd::Stale;
                }
                Some(Err(err)) => return WatchEnd::Failed(err),
            }
        }
    }

    fn handle_event(&mut self, ev: WatchEvent<K>) {
        let rv = ev.resource_version().map(str::to_string);
        let delta = match ev {
            WatchEvent::Added(o) => Some(Delta::new(DeltaKind::Added, o)),
            WatchEvent::Modified(o) => Some(Delta::new(DeltaKind::Updated, o)),
            WatchEvent::Deleted(o) => Some(Delta::new(DeltaKind::Deleted, o)),
            WatchEvent::Bookmark(_) => None,
        };
        if let Some(delta) = delta {
            trace!(key = %delta.key(), kind = delta.kind.as_str(), rv = ?rv, "watch event");
            self.queue.push(delta);
        }
        if let Some(rv) = rv {
            let advance = self.cursor.as_deref().map_or(true, |cur| is_newer_version(&rv, cur));
            if advance {
                self.cursor = Some(rv);
            }
        }
    }

    /// Record a failed attempt and pick the delay before the next one.
    fn on_failure(&mut self, err: &SourceError, backoff: &mut Backoff) -> Duration {
        self.failures = self.failures.saturating_add(1);
        counter!("informer_source_errors", 1, "kind" => err.kind());
        if let Some(hook) = &self.on_error {
            hook(err);
        }
        match err {
            SourceError::Permission(reason) => {
                error!(error = %err, "source denied access; retrying at max backoff");
                self.health.send_replace(Health::Denied { reason: reason.clone() });
                backoff.max()
            }
            _ if self.failures >= self.config.failure_threshold => {
                error!(failures = self.failures, error = %err, "source unreachable; still retrying");
                self.health
                    .send_replace(Health::Unreachable { failures: self.failures, last_error: err.to_string() });
                backoff.next()
            }
            _ => {
                warn!(failures = self.failures, error = %err, "list/watch failed; backing off");
                self.health.send_replace(Health::Backoff { failures: self.failures });
                backoff.next()
            }
        }
    }
}

/// Sleep for `delay`; false if `stop` fired first.
async fn sleep_or_stop(delay: Duration, stop: &StopSignal) -> bool {
    tokio::select! {
        _ = stop.stopped() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn resync_loop<K: Object>(
    queue: Arc<DeltaQueue<K>>,
    cache: Indexer<K>,
    period: Option<Duration>,
    stop: StopSignal,
) {
    let Some(period) = period.filter(|p| !p.is_zero()) else {
        return;
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.stopped() => return,
            _ = ticker.tick() => {
                let n = queue.resync(&cache);
                debug!(queued = n, "resync");
                counter!("informer_resyncs", 1);
            }
        }
    }
}
