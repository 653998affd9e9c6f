//! The bounded in-process FIFOs (`inbound`, `outbound`) that connect the
//! Scheduler, Executor pool, and Collector.
//!
//! SPEC_FULL.md §9 resolves the source's nullable-item convention by keeping
//! it rather than switching to channel-close detection: a [`tokio::sync::mpsc`]
//! bounded channel carrying `Option<T>` gives exactly the "one done signal per
//! consumer, consumed exactly once" contract the Coordinator's shutdown
//! sequence depends on — one `None` per executor slot, not one shared close
//! event. The `inbound` side needs more than one consumer (the executor
//! pool), which `mpsc::Receiver` alone does not allow; wrapping it in
//! `Arc<Mutex<_>>` turns it into a work queue the pool shares.

use std::sync::Arc;
use std::time::Duration;

use shared::PipelineError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// Producing half of a bounded local queue. Cheaply cloned; every clone sends
/// into the same underlying channel.
#[derive(Clone)]
pub struct LocalSender<T> {
    tx: mpsc::Sender<Option<T>>,
}

/// Consuming half of a bounded local queue. Cheaply cloned; every clone
/// competes for items out of the same underlying channel, which is what lets
/// a pool of executors share one `inbound` queue.
#[derive(Clone)]
pub struct LocalReceiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<Option<T>>>>,
}

/// Construct a bounded local queue with capacity `bundlesize` (SPEC_FULL.md
/// §4.2: capacity is fixed to the configured bundle size).
pub fn bounded<T>(capacity: usize) -> (LocalSender<T>, LocalReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        LocalSender { tx },
        LocalReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl<T> LocalSender<T> {
    /// `put(item, timeout)`: blocks until there is room or `wait` elapses.
    /// `item = None` is the sentinel meaning "producer done."
    pub async fn put(&self, item: Option<T>, wait: Duration) -> Result<(), PipelineError> {
        match timeout(wait, self.tx.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PipelineError::Disconnected),
            Err(_) => Err(PipelineError::Full(wait)),
        }
    }
}

impl<T> LocalReceiver<T> {
    /// `get(timeout)`: blocks until an item is available or `wait` elapses.
    /// Returns `Ok(None)` on the sentinel, `Err(Empty)` on timeout.
    pub async fn get(&self, wait: Duration) -> Result<Option<T>, PipelineError> {
        let mut rx = self.rx.lock().await;
        match timeout(wait, rx.recv()).await {
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(PipelineError::Disconnected),
            Err(_) => Err(PipelineError::Empty(wait)),
        }
    }
}
