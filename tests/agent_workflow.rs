use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use queue_relay::error::ReconnectPolicy;
use queue_relay::queue::PartitionFilter;
use queue_relay::storage::{self, SnapshotStore};
use queue_relay::{AgentOptions, ConnectionStatus, DoctorId, QueueStore, Role, SyncAgent, SyncMessage};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

fn reserve_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn agent(addr: &str, role: Role, store: Arc<QueueStore>) -> SyncAgent {
    let mut options = AgentOptions::new(addr);
    options.role = role;
    options.policy = ReconnectPolicy::fixed(Duration::from_millis(100));
    SyncAgent::new(options, store)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for {what}"))
}

const UP: Duration = Duration::from_secs(5);

type Observer = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Patients of the next snapshot a raw hub client sees.
async fn next_patients(ws: &mut Observer) -> Result<Vec<queue_relay::Patient>> {
    timeout(UP, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    break SyncMessage::decode(text.as_str()).map(|m| m.into_snapshot().map(|s| s.patients).unwrap_or_default())
                }
                Some(Ok(_)) => continue,
                other => break Err(anyhow!("observer connection ended: {other:?}")),
            }
        }
    })
    .await?
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reception_add_reaches_display_board() -> Result<()> {
    let (addr, hub) = queue_relay::server::spawn("127.0.0.1:0", PartitionFilter::allow_all()).await?;
    let addr = addr.to_string();

    let reception = agent(&addr, Role::Receptionist, Arc::new(QueueStore::ephemeral()));
    let display = agent(&addr, Role::Display, Arc::new(QueueStore::ephemeral()));

    let rendered = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = rendered.clone();
    display.on_update(move |patients| *sink.lock() = patients.to_vec());

    let _r = reception.start();
    let _d = display.start();
    reception.wait_for(ConnectionStatus::Connected, UP).await?;
    display.wait_for(ConnectionStatus::Connected, UP).await?;
    sleep(Duration::from_millis(200)).await;

    reception.store().add_patient("Abebe", DoctorId::primary())?;

    eventually("display to receive Abebe", || {
        display.store().snapshot().iter().any(|p| p.patient_name == "Abebe")
    })
    .await?;
    assert_eq!(display.store().snapshot(), reception.store().snapshot());
    assert_eq!(rendered.lock().len(), 1);

    reception.stop();
    display.stop();
    hub.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn offline_add_is_announced_on_connect() -> Result<()> {
    let temp = TempDir::new()?;
    let snapshots = SnapshotStore::new(storage::init(temp.path())?);
    let store = Arc::new(QueueStore::open(snapshots.clone()));

    let port = reserve_port()?;
    let reception = agent(&format!("127.0.0.1:{port}"), Role::Receptionist, store.clone());

    // Nobody to send to yet; the add only lands locally
    store.add_patient("Kebede", DoctorId::secondary())?;
    assert!(!reception.broadcast());
    assert_eq!(snapshots.load().len(), 1);

    let (addr, hub) = queue_relay::server::spawn(&format!("127.0.0.1:{port}"), PartitionFilter::allow_all()).await?;
    let (mut observer, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await?;
    sleep(Duration::from_millis(100)).await;

    let _handle = reception.start();

    let frame = timeout(UP, async {
        loop {
            if let Some(Ok(Message::Text(text))) = observer.next().await {
                break SyncMessage::decode(text.as_str());
            }
        }
    })
    .await??;

    let patients = frame.into_snapshot().map(|s| s.patients).unwrap_or_default();
    assert_eq!(patients.len(), 1);
    assert_eq!(patients[0].patient_name, "Kebede");
    assert_eq!(patients[0].doctor_id, DoctorId::secondary());

    reception.stop();
    hub.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agent_keeps_retrying_until_hub_appears() -> Result<()> {
    let port = reserve_port()?;
    let addr = format!("127.0.0.1:{port}");
    let reception = agent(&addr, Role::Receptionist, Arc::new(QueueStore::ephemeral()));
    let _handle = reception.start();

    sleep(Duration::from_millis(350)).await;
    assert_ne!(reception.status(), ConnectionStatus::Connected);

    let (_, hub) = queue_relay::server::spawn(&addr, PartitionFilter::allow_all()).await?;
    reception.wait_for(ConnectionStatus::Connected, UP).await?;

    reception.stop();
    hub.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_newcomer_wipes_existing_queue() -> Result<()> {
    let (addr, hub) = queue_relay::server::spawn("127.0.0.1:0", PartitionFilter::allow_all()).await?;
    let addr = addr.to_string();

    let first_store = Arc::new(QueueStore::ephemeral());
    first_store.add_patient("Almaz", DoctorId::primary())?;
    let first = agent(&addr, Role::QueueManager, first_store.clone());
    let _f = first.start();
    first.wait_for(ConnectionStatus::Connected, UP).await?;
    sleep(Duration::from_millis(100)).await;

    let second_store = Arc::new(QueueStore::ephemeral());
    second_store.add_patient("Kebede", DoctorId::secondary())?;
    let second = agent(&addr, Role::Receptionist, second_store.clone());
    let _s = second.start();
    second.wait_for(ConnectionStatus::Connected, UP).await?;
    eventually("veterans to converge", || {
        !first_store.snapshot().is_empty() && first_store.snapshot() == second_store.snapshot()
    })
    .await?;

    // Last writer wins, even when the last writer knows nothing
    let newcomer = agent(&addr, Role::Display, Arc::new(QueueStore::ephemeral()));
    let _n = newcomer.start();
    newcomer.wait_for(ConnectionStatus::Connected, UP).await?;

    eventually("both veteran caches to be replaced", || {
        first_store.snapshot().is_empty() && second_store.snapshot().is_empty()
    })
    .await?;

    first.stop();
    second.stop();
    newcomer.stop();
    hub.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopped_agent_settles_disconnected() -> Result<()> {
    let (addr, hub) = queue_relay::server::spawn("127.0.0.1:0", PartitionFilter::allow_all()).await?;
    let reception = agent(&addr.to_string(), Role::Receptionist, Arc::new(QueueStore::ephemeral()));

    let handle = reception.start();
    reception.wait_for(ConnectionStatus::Connected, UP).await?;

    reception.stop();
    timeout(UP, handle).await??;
    assert_eq!(reception.status(), ConnectionStatus::Disconnected);
    assert!(!reception.broadcast());

    hub.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_after_stop_resumes_broadcasting() -> Result<()> {
    let (addr, hub) = queue_relay::server::spawn("127.0.0.1:0", PartitionFilter::allow_all()).await?;
    let (mut observer, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await?;
    sleep(Duration::from_millis(100)).await;

    let reception = agent(&addr.to_string(), Role::Receptionist, Arc::new(QueueStore::ephemeral()));
    let _handle = reception.start();
    reception.wait_for(ConnectionStatus::Connected, UP).await?;
    assert!(next_patients(&mut observer).await?.is_empty());

    reception.stop();
    reception.reconnect();

    // The second sync only goes out once the new session is connected
    assert!(next_patients(&mut observer).await?.is_empty());
    reception.wait_for(ConnectionStatus::Connected, UP).await?;

    reception.store().add_patient("Abebe", DoctorId::primary())?;
    let patients = next_patients(&mut observer).await?;
    assert_eq!(patients.len(), 1);
    assert_eq!(patients[0].patient_name, "Abebe");

    reception.stop();
    hub.abort();
    Ok(())
}
