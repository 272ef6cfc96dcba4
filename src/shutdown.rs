//! Process-wide cancellation signal
//!
//! One [`Shutdown`] is created per process; every polling loop and delivery
//! worker holds a [`ShutdownListener`] and checks it between iterations and
//! before blocking calls. The signal is level-triggered: listeners created
//! after [`Shutdown::trigger`] observe it immediately.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal every listener; idempotent
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been triggered
    ///
    /// Also resolves if the [`Shutdown`] handle is dropped.
    pub async fn cancelled(&mut self) {
        // Err means the sender is gone, which is treated as cancellation too
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}
