use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::queue::PartitionFilter;
use crate::sync::RelayFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

struct Peer {
    tx: mpsc::UnboundedSender<String>,
    connected_at: DateTime<Utc>,
}

/// What the hub did with one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Forwarded as an `update` to this many other peers
    Relayed(usize),
    /// Well-formed but not a `sync`/`update`
    Ignored,
    Malformed,
}

/// Stateless fan-out point between sync agents.
///
/// The hub keeps no queue of its own: every `sync` or `update` it receives
/// is re-sent as an `update` to every *other* open peer, after the partition
/// filter has been applied. Delivery is best effort per peer.
pub struct Hub {
    peers: DashMap<PeerId, Peer>,
    next_id: AtomicU64,
    filter: PartitionFilter,
}

impl Hub {
    pub fn new(filter: PartitionFilter) -> Self {
        Self {
            peers: DashMap::new(),
            next_id: AtomicU64::new(1),
            filter,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Register a peer whose outbound frames are drained from `tx`.
    pub fn on_connect(&self, tx: mpsc::UnboundedSender<String>) -> PeerId {
        let id = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.peers.insert(
            id,
            Peer {
                tx,
                connected_at: Utc::now(),
            },
        );
        tracing::info!(peer = %id, peers = self.peers.len(), "peer connected");
        id
    }

    pub fn on_disconnect(&self, id: PeerId) {
        if let Some((_, peer)) = self.peers.remove(&id) {
            let secs = (Utc::now() - peer.connected_at).num_seconds();
            tracing::info!(peer = %id, connected_secs = secs, peers = self.peers.len(), "peer disconnected");
        }
    }

    /// Relay a `sync` or `update` as an `update`. Only `type` and each
    /// entry's `doctorId` are read; the patient objects go out as received.
    pub fn on_message(&self, from: PeerId, raw: &str) -> RelayOutcome {
        let frame = match RelayFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "dropping malformed frame");
                return RelayOutcome::Malformed;
            }
        };

        let kind = frame.kind();
        if !frame.is_snapshot() {
            tracing::debug!(peer = %from, kind, "ignoring frame");
            return RelayOutcome::Ignored;
        }

        let text = match frame.to_update(&self.filter) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "failed to encode relay frame");
                return RelayOutcome::Ignored;
            }
        };

        let relayed = self.fan_out(from, &text);
        tracing::debug!(peer = %from, kind, relayed, "relayed snapshot");
        RelayOutcome::Relayed(relayed)
    }

    fn fan_out(&self, from: PeerId, text: &str) -> usize {
        let mut relayed = 0;
        for entry in self.peers.iter() {
            if *entry.key() == from || entry.value().tx.is_closed() {
                continue;
            }
            match entry.value().tx.send(text.to_owned()) {
                Ok(()) => relayed += 1,
                Err(_) => tracing::debug!(peer = %entry.key(), "peer went away mid-relay"),
            }
        }
        relayed
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(PartitionFilter::allow_all())
    }
}
