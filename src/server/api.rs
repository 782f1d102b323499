use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    routing::get,
    Json, Router,
};
use colored::*;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use super::hub::Hub;
use crate::config::RelayConfig;

pub fn router(hub: Arc<Hub>, static_dir: Option<&Path>) -> Router {
    let app = Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(hub);

    // Kiosk pages, when a directory is configured
    let app = match static_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    };

    app.layer(TraceLayer::new_for_http())
}

pub async fn serve(config: &RelayConfig) -> Result<()> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind relay hub to address {addr}"))?;

    let hub = Arc::new(Hub::new(config.partition_filter()));
    let local = listener.local_addr()?;
    println!(
        "{} Relay hub running at {}",
        "✓".green(),
        format!("ws://{local}/ws").bright_blue()
    );
    if let Some(count) = config.doctor_count {
        println!("{} Relaying lanes for {} doctor(s)", "•".bright_black(), count.to_string().bright_yellow());
    }

    run(listener, hub, config.static_dir.as_deref()).await
}

/// Serve `hub` on an already-bound listener until the task is dropped.
pub async fn run(listener: TcpListener, hub: Arc<Hub>, static_dir: Option<&Path>) -> Result<()> {
    let local: SocketAddr = listener.local_addr()?;
    tracing::info!(%local, "relay hub listening");
    axum::serve(listener, router(hub, static_dir)).await?;
    Ok(())
}

async fn health(State(hub): State<Arc<Hub>>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "peers": hub.peer_count() }))
}

async fn ws_handler(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(hub, socket))
}

async fn handle_ws(hub: Arc<Hub>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let id = hub.on_connect(tx);

    // Drain relayed frames to this peer
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                hub.on_message(id, text.as_str());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(peer = %id, error = %e, "socket error");
                break;
            }
        }
    }

    hub.on_disconnect(id);
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_reports_peer_count() {
        let hub = Arc::new(Hub::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.on_connect(tx);

        let response = router(hub, None)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({ "status": "ok", "peers": 1 }));
    }

    #[tokio::test]
    async fn test_static_pages_served_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("display.html"), "<h1>Queue</h1>").unwrap();

        let response = router(Arc::new(Hub::default()), Some(dir.path()))
            .oneshot(Request::builder().uri("/display.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_plain_get_on_ws_route_is_rejected() {
        let response = router(Arc::new(Hub::default()), None)
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
