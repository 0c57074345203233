//! A drain channel to wait for the workers of a coordinator to finish.
//!
//! Based on the drain channel of linkerd2-proxy.

use tokio::sync::mpsc;

/// Creates a drain channel.
///
/// Every worker holds a clone of the [`Watch`]. [`Signal::drain()`] completes once all of them
/// are dropped.
pub(crate) fn channel() -> (Signal, Watch) {
    let (drained_tx, drained_rx) = mpsc::channel(1);
    (Signal { drained_rx }, Watch { drained_tx })
}

enum Never {}

/// Waits for all watchers to be released.
#[derive(Debug)]
pub(crate) struct Signal {
    drained_rx: mpsc::Receiver<Never>,
}

/// Blocks the completion of a drain while held.
#[derive(Clone, Debug)]
pub(crate) struct Watch {
    drained_tx: mpsc::Sender<Never>,
}

impl Signal {
    /// Waits until every [`Watch`] has been dropped.
    pub async fn drain(mut self) {
        tracing::debug!("draining workers");
        match self.drained_rx.recv().await {
            None => tracing::debug!("all workers released"),
            Some(n) => match n {},
        }
    }
}
