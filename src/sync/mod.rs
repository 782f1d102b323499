pub mod agent;
pub mod events;
pub mod protocol;
pub mod store;

pub use agent::{AgentOptions, ConnectionStatus, SyncAgent};
pub use events::{ChangeOrigin, QueueChange, QueueEvents};
pub use protocol::{RelayFrame, Role, Snapshot, SyncMessage};
pub use store::QueueStore;

// Snapshot sync between surfaces: each agent owns a QueueStore, pushes
// whole-queue snapshots to the relay hub and overwrites its cache with
// whatever the hub relays back.
