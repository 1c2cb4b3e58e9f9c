#![forbid(unsafe_code)]

use tokio::sync::watch;

/// Owner side of a stop signal. Calling [`StopHandle::stop`] or dropping the
/// handle fires every cloned [`StopSignal`].
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Observer side of a stop signal; cheap to clone into tasks.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

pub fn stop_pair() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal { rx: self.tx.subscribe() }
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the signal fires.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
