use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::events::{ChangeOrigin, QueueChange};
use super::protocol::{Role, Snapshot, SyncMessage};
use super::store::QueueStore;
use crate::config::{websocket_url, RelayConfig};
use crate::error::{Backoff, ReconnectPolicy, RetryStep};
use crate::queue::{DoctorId, Patient};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Attempts exhausted; still retrying on the cooldown cycle
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub server_url: String,
    pub role: Role,
    pub doctor_id: DoctorId,
    pub auto_reconnect: bool,
    pub policy: ReconnectPolicy,
}

impl AgentOptions {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            role: Role::default(),
            doctor_id: DoctorId::primary(),
            auto_reconnect: true,
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            server_url: config.server_url.clone(),
            role: config.role,
            doctor_id: config.doctor_id.clone(),
            auto_reconnect: config.auto_reconnect,
            policy: config.reconnect_policy(),
        }
    }
}

/// Render hook invoked with the (role-filtered) queue after every relayed update.
pub type RenderHook = Arc<dyn Fn(&[Patient]) + Send + Sync>;

enum SessionEnd {
    Closed,
    Superseded,
    Stopped,
}

struct AgentInner {
    options: RwLock<AgentOptions>,
    store: Arc<QueueStore>,
    status: watch::Sender<ConnectionStatus>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    render: RwLock<Option<RenderHook>>,
    /// Cuts short a backoff wait or an open session
    wake: Notify,
    shutdown: watch::Sender<bool>,
    /// Bumped by every `stop()`
    stops: AtomicU64,
    running: AtomicBool,
    forwarding: AtomicBool,
}

/// Keeps one surface's [`QueueStore`] converged with the hub.
///
/// On connect it announces its whole cache with a `sync`; afterwards every
/// local mutation is sent as an `update` while connected and silently
/// skipped while not. Relayed `update`s overwrite the cache.
#[derive(Clone)]
pub struct SyncAgent {
    inner: Arc<AgentInner>,
}

impl SyncAgent {
    pub fn new(options: AgentOptions, store: Arc<QueueStore>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(AgentInner {
                options: RwLock::new(options),
                store,
                status,
                outbound: Mutex::new(None),
                render: RwLock::new(None),
                wake: Notify::new(),
                shutdown,
                stops: AtomicU64::new(0),
                running: AtomicBool::new(false),
                forwarding: AtomicBool::new(false),
            }),
        }
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.inner.store
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Wait until the agent reaches `status`, or fail after `timeout`.
    pub async fn wait_for(&self, status: ConnectionStatus, timeout: Duration) -> Result<()> {
        let mut rx = self.watch_status();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == status))
            .await
            .map_err(|_| anyhow!("timed out waiting for agent to become {status}"))?
            .map_err(|_| anyhow!("agent dropped before becoming {status}"))?;
        Ok(())
    }

    pub fn on_update(&self, hook: impl Fn(&[Patient]) + Send + Sync + 'static) {
        *self.inner.render.write() = Some(Arc::new(hook));
    }

    /// Begin connecting in the background and start forwarding local
    /// mutations. The returned handle finishes after [`stop`](Self::stop).
    pub fn start(&self) -> JoinHandle<()> {
        let forward = self.spawn_forwarder();
        let connection = self.spawn_connection_loop();
        tokio::spawn(async move {
            let _ = tokio::join!(forward, connection);
        })
    }

    /// Drop the current connection or pending backoff and connect again now.
    /// On a stopped agent this resumes both the connection and the
    /// forwarding of local mutations.
    pub fn reconnect(&self) {
        if *self.inner.shutdown.borrow() {
            self.resume_after_stop();
        } else if self.inner.running.load(Ordering::SeqCst) {
            self.inner.wake.notify_one();
        } else {
            let _ = self.spawn_forwarder();
            let _ = self.spawn_connection_loop();
        }
    }

    /// Point the agent at a different hub (settings changed) and reconnect.
    pub fn set_server_url(&self, server_url: impl Into<String>) {
        self.inner.options.write().server_url = server_url.into();
        self.reconnect();
    }

    pub fn stop(&self) {
        self.inner.stops.fetch_add(1, Ordering::SeqCst);
        let _ = self.inner.shutdown.send_replace(true);
        *self.inner.outbound.lock() = None;
    }

    /// Send the full local cache as an `update` if connected. Returns false
    /// (and sends nothing) otherwise; nothing is queued for later.
    pub fn broadcast(&self) -> bool {
        let patients = self.inner.store.snapshot();
        let count = patients.len();
        let sent = self.send(&SyncMessage::update(patients));
        if sent {
            tracing::debug!(count, "broadcast queue update");
        } else {
            tracing::debug!("not connected, skipping broadcast");
        }
        sent
    }

    /// Fire-and-forget send; false when not connected.
    pub fn send(&self, message: &SyncMessage) -> bool {
        if !self.is_connected() {
            return false;
        }
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode outbound frame");
                return false;
            }
        };
        match self.inner.outbound.lock().as_ref() {
            Some(tx) => tx.send(Message::Text(text.into())).is_ok(),
            None => false,
        }
    }

    /// Wait for the stopped tasks to wind down, then bring both back unless
    /// `stop()` was called again in the meantime.
    fn resume_after_stop(&self) {
        let agent = self.clone();
        let stops = self.inner.stops.load(Ordering::SeqCst);
        tokio::spawn(async move {
            while agent.inner.running.load(Ordering::SeqCst) || agent.inner.forwarding.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            if agent.inner.stops.load(Ordering::SeqCst) != stops {
                return;
            }
            let _ = agent.inner.shutdown.send_replace(false);
            let _ = agent.spawn_forwarder();
            let _ = agent.spawn_connection_loop();
        });
    }

    fn spawn_forwarder(&self) -> JoinHandle<()> {
        if self.inner.forwarding.swap(true, Ordering::SeqCst) {
            return tokio::spawn(async {});
        }
        let changes = self.inner.store.subscribe();
        let stop_rx = self.inner.shutdown.subscribe();
        let agent = self.clone();
        tokio::spawn(async move {
            forward_local_changes(&agent, changes, stop_rx).await;
            agent.inner.forwarding.store(false, Ordering::SeqCst);
        })
    }

    fn spawn_connection_loop(&self) -> JoinHandle<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return tokio::spawn(async {});
        }
        let _ = self.inner.shutdown.send_replace(false);
        let agent = self.clone();
        tokio::spawn(async move {
            agent.connection_loop().await;
            agent.inner.running.store(false, Ordering::SeqCst);
        })
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.inner.status.send_replace(status);
        if previous != status {
            tracing::info!(from = %previous, to = %status, "connection status changed");
        }
    }

    async fn connection_loop(&self) {
        let policy = self.inner.options.read().policy.clone();
        let mut backoff = Backoff::new(policy);
        let mut stop_rx = self.inner.shutdown.subscribe();

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            let url = websocket_url(&self.inner.options.read().server_url);
            self.set_status(ConnectionStatus::Connecting);
            tracing::info!(%url, "connecting to relay hub");

            match connect(&url).await {
                Ok(ws) => {
                    backoff.reset();
                    match self.session(ws, &mut stop_rx).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Superseded => continue,
                        SessionEnd::Closed => {
                            tracing::info!("relay hub connection closed");
                            self.set_status(ConnectionStatus::Disconnected);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(%url, error = %e, "failed to connect to relay hub");
                    self.set_status(ConnectionStatus::Disconnected);
                }
            }

            if !self.inner.options.read().auto_reconnect {
                break;
            }

            let delay = match backoff.next_step() {
                RetryStep::Retry { attempt, delay } => {
                    tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnection");
                    delay
                }
                RetryStep::Cooldown(delay) => {
                    tracing::warn!(
                        delay_ms = delay.as_millis() as u64,
                        "max reconnection attempts reached, cooling down"
                    );
                    self.set_status(ConnectionStatus::Error);
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.wake.notified() => backoff.reset(),
                _ = stop_rx.changed() => {}
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn session(
        &self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        *self.inner.outbound.lock() = Some(tx.clone());
        self.set_status(ConnectionStatus::Connected);

        // Snapshot only once connected, so a mutation made meanwhile is
        // either in the sync or broadcast on its own
        let hello = {
            let options = self.inner.options.read();
            SyncMessage::sync(
                Snapshot::new(self.inner.store.snapshot()).sent_by(options.role, options.doctor_id.clone()),
            )
        };
        match hello.encode() {
            Ok(text) => {
                let _ = tx.send(Message::Text(text.into()));
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode sync frame"),
        }
        drop(tx);

        let end = loop {
            tokio::select! {
                Some(message) = rx.recv() => {
                    if let Err(e) = sink.send(message).await {
                        tracing::warn!(error = %e, "send to relay hub failed");
                        break SessionEnd::Closed;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break SessionEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "relay hub connection error");
                        break SessionEnd::Closed;
                    }
                },
                _ = self.inner.wake.notified() => break SessionEnd::Superseded,
                _ = stop_rx.changed() => break SessionEnd::Stopped,
            }
        };

        *self.inner.outbound.lock() = None;
        let _ = sink.close().await;
        end
    }

    fn handle_frame(&self, text: &str) {
        let message = match SyncMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame from hub");
                return;
            }
        };

        match message {
            SyncMessage::Update(snapshot) => {
                tracing::debug!(count = snapshot.patients.len(), "applying relayed snapshot");
                let patients = snapshot.patients;
                self.inner.store.apply_remote(patients.clone());

                let hook = self.inner.render.read().clone();
                if let Some(render) = hook {
                    let options = self.inner.options.read();
                    let visible = visible_for(options.role, &options.doctor_id, patients);
                    drop(options);
                    render(&visible);
                }
            }
            other => tracing::debug!(kind = other.kind(), "ignoring non-update frame"),
        }
    }
}

/// Doctors only render their own lane; every other surface gets everything.
pub fn visible_for(role: Role, doctor: &DoctorId, patients: Vec<Patient>) -> Vec<Patient> {
    match role {
        Role::Doctor => patients.into_iter().filter(|p| &p.doctor_id == doctor).collect(),
        _ => patients,
    }
}

async fn connect(url: &str) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let url = Url::parse(url).map_err(|e| anyhow!("invalid ws url: {e}"))?;
    let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()))
        .await
        .map_err(|_| anyhow!("connection timed out"))??;
    Ok(ws)
}

/// Observer loop: every local mutation becomes an `update` broadcast.
async fn forward_local_changes(
    agent: &SyncAgent,
    mut changes: broadcast::Receiver<QueueChange>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) if change.origin == ChangeOrigin::Local => {
                    let _ = agent.broadcast();
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "change feed lagged, sending latest snapshot");
                    let _ = agent.broadcast();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
}
