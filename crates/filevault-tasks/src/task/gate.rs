//! One-shot broadcast gate

use tokio::sync::watch;

/// A gate that opens exactly once and releases every waiter
#[derive(Debug)]
pub(crate) struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Open the gate. Returns true only for the call that opened it.
    pub(crate) fn open(&self) -> bool {
        self.tx.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the gate is open
    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
