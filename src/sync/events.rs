use std::sync::Arc;
use tokio::sync::broadcast;

use crate::queue::Patient;

/// Where a queue change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A mutation made on this surface; peers still need to hear about it
    Local,
    /// A snapshot relayed from the hub; already known to the network
    Remote,
}

#[derive(Debug, Clone)]
pub struct QueueChange {
    pub origin: ChangeOrigin,
    pub patients: Arc<Vec<Patient>>,
}

/// Publish/subscribe channel for queue changes. UI layers subscribe to
/// re-render; the sync agent subscribes to forward local mutations.
#[derive(Clone)]
pub struct QueueEvents {
    tx: broadcast::Sender<QueueChange>,
}

impl QueueEvents {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueChange> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers that will see the change.
    pub fn publish(&self, change: QueueChange) -> usize {
        self.tx.send(change).unwrap_or(0)
    }
}

impl Default for QueueEvents {
    fn default() -> Self {
        Self::new()
    }
}
