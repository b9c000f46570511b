//! Cooperative stop signalling built on `tokio::sync::watch`.

use std::time::Duration;

use tokio::sync::watch;

/// Owning side of a stop signal.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Observing side of a stop signal; cheap to clone.
#[derive(Clone, Debug)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

impl StopHandle {
    pub fn new() -> Self {
        stop_channel().0
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop is requested or the owning handle is dropped.
    pub async fn stopped(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleeps for `delay` unless stopped first. Returns `true` when stopped.
    pub async fn sleep_or_stop(&self, delay: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let mut signal = self.clone();
        tokio::select! {
            _ = signal.stopped() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}
