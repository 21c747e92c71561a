use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast::error::RecvError, watch};
use tower_http::cors::CorsLayer;

use crate::engine::SyncEngine;
use crate::sink::RenderCommand;
use crate::stream::StreamState;
use crate::view::{DashboardView, ViewSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub view: Arc<DashboardView>,
    pub stream: watch::Receiver<StreamState>,
    pub export_url: String,
}

#[derive(Serialize)]
struct StateResponse {
    view: ViewSnapshot,
    stream: StreamState,
    watermark: Option<String>,
    epoch: u64,
    export_url: String,
}

/// Websocket frames: one snapshot on connect, then incremental commands
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Push {
    Snapshot { view: ViewSnapshot },
    Command { command: RenderCommand },
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/state", get(state_handler))
        .route("/ws", get(ws_handler))
        .route("/clear", post(clear_handler))
        .route("/export", get(export_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` flips to true
pub async fn start_dashboard(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    log::info!("[DASHBOARD] Serving at http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("dashboard_static.html"))
}

async fn state_handler(State(state): State<AppState>) -> Json<StateResponse> {
    let stream = *state.stream.borrow();
    Json(StateResponse {
        view: state.view.snapshot(),
        stream,
        watermark: state.engine.watermark().map(|w| w.to_string()),
        epoch: state.engine.epoch(),
        export_url: state.export_url.clone(),
    })
}

async fn clear_handler(State(state): State<AppState>) -> Response {
    match state.engine.reset().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            log::warn!("[DASHBOARD] Clear failed: {}", e);
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

async fn export_handler(State(state): State<AppState>) -> Redirect {
    Redirect::temporary(&state.export_url)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_push(socket: &mut WebSocket, push: &Push) -> bool {
    match serde_json::to_string(push) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            log::error!("[DASHBOARD] Failed to encode push: {}", e);
            false
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (view, mut updates) = state.view.snapshot_and_subscribe();
    if !send_push(&mut socket, &Push::Snapshot { view }).await {
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                let push = match update {
                    Ok(command) => Push::Command { command },
                    Err(RecvError::Lagged(missed)) => {
                        log::debug!("[DASHBOARD] Client lagged by {} commands, resyncing", missed);
                        let (view, resubscribed) = state.view.snapshot_and_subscribe();
                        updates = resubscribed;
                        Push::Snapshot { view }
                    }
                    Err(RecvError::Closed) => break,
                };
                if !send_push(&mut socket, &push).await {
                    // Client disconnected
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
