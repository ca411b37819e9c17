use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::NodeConfig;
use crate::notifier::HubHandle;
use crate::peer::PeerHandle;

#[derive(Clone)]
pub struct DashboardState {
    pub config: Arc<NodeConfig>,
    pub hub: HubHandle,
    pub peer: PeerHandle,
}

#[derive(Serialize)]
struct StatusResponse {
    name: String,
    node: String,
    ident: String,
    is_leader: bool,
    connected: bool,
    channels: Vec<String>,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = server.await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(StatusResponse {
        name: state.config.name.clone(),
        node: state.config.node.clone(),
        ident: state.config.ident(),
        is_leader: state.peer.is_leader(),
        connected: state.hub.is_connected(),
        channels: state.hub.channels().await,
    })
}
