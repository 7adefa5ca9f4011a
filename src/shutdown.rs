use tokio::sync::watch;

/// A cloneable graceful-shutdown trigger and the signal it fires.
///
/// Mirrors the shape of `tari_shutdown::{Shutdown, ShutdownSignal}` (an
/// internal, path-only dependency of the teacher workspace, unavailable
/// outside it — see DESIGN.md), rebuilt here on a `tokio::sync::watch`
/// channel: every task is handed a clone of `ShutdownSignal` and awaits it
/// alongside its regular I/O in a `tokio::select!`.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn to_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Triggers shutdown. Idempotent: firing twice is a no-op the second time.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Resolves once `Shutdown::trigger` has been called.
    pub async fn wait(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        let _ = self.rx.changed().await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.to_signal();
        shutdown.trigger();
        signal.wait().await;
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn multiple_signals_all_observe_trigger() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.to_signal();
        let mut b = shutdown.to_signal();
        shutdown.trigger();
        a.wait().await;
        b.wait().await;
        assert!(a.is_triggered() && b.is_triggered());
    }
}
