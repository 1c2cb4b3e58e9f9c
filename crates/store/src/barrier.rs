#![forbid(unsafe_code)]

use std::sync::Arc;

use tanjun_core::StopSignal;
use tokio::sync::watch;
use tracing::info;

/// Latch that flips once the first full list is in the cache. Never resets.
#[derive(Debug, Clone)]
pub struct SyncBarrier {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for SyncBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncBarrier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn has_synced(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns true the first time it is called.
    pub fn mark_synced(&self) -> bool {
        let flipped = self.tx.send_if_modified(|synced| {
            if *synced {
                false
            } else {
                *synced = true;
                true
            }
        });
        if flipped {
            info!("cache synced");
        }
        flipped
    }

    /// Wait until synced. Returns false if `stop` fires first.
    pub async fn wait_for_sync(&self, stop: &StopSignal) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            res = rx.wait_for(|synced| *synced) => res.is_ok(),
            _ = stop.stopped() => false,
        }
    }
}
