//! # Queue Relay - Clinic Patient-Queue Broadcaster
//!
//! Keeps every surface in a clinic (reception desk, doctor rooms, waiting
//! room displays) on the same patient queue.
//!
//! ## Features
//!
//! - **Relay Hub**: stateless WebSocket fan-out; every snapshot a peer sends
//!   is forwarded to all other peers
//! - **Sync Agents**: local cache with persistence, sync-on-connect and
//!   capped exponential reconnect backoff
//! - **Two-lane queue**: per-doctor ordering, reordering and transfers
//! - **Role views**: receptionist, doctor, display and queue-manager surfaces
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use queue_relay::{AgentOptions, DoctorId, QueueStore, SyncAgent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(QueueStore::ephemeral());
//!     let agent = SyncAgent::new(AgentOptions::new("192.168.1.11:8080"), store.clone());
//!     agent.on_update(|patients| println!("{} waiting", patients.len()));
//!     let handle = agent.start();
//!
//!     store.add_patient("Abebe", DoctorId::primary())?;
//!
//!     handle.await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod queue;
pub mod server;
pub mod storage;
pub mod sync;

// Re-export main types for library consumers
pub use config::RelayConfig;
pub use queue::{DoctorId, Patient, PatientId, PatientQueue};
pub use server::Hub;
pub use storage::{Database, SnapshotStore};
pub use sync::{AgentOptions, ConnectionStatus, QueueStore, Role, SyncAgent, SyncMessage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
