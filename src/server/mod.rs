pub mod api;
pub mod hub;

pub use hub::{Hub, PeerId, RelayOutcome};

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::queue::PartitionFilter;

pub async fn start(config: &RelayConfig) -> Result<()> {
    api::serve(config).await
}

/// Bind a hub on `addr` (port 0 picks a free one) and serve it in the
/// background. Returns the bound address.
pub async fn spawn(addr: &str, filter: PartitionFilter) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let hub = Arc::new(Hub::new(filter));
    let handle = tokio::spawn(async move {
        if let Err(e) = api::run(listener, hub, None).await {
            tracing::error!(error = %e, "relay hub stopped");
        }
    });
    Ok((local, handle))
}
