use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::backend::overlay::websocket::{websocket_handler, OverlayMessage};
use crate::backend::overlay::OverlayState;

/// How often connected overlays are pinged
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("Overlay server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Start the overlay HTTP server on localhost
pub async fn start_overlay_server(
    port: u16,
    overlay_dir: PathBuf,
    state: OverlayState,
) -> Result<(), OverlayError> {
    if !overlay_dir.exists() {
        log::warn!(
            "Overlay directory does not exist: {:?}. Creating it...",
            overlay_dir
        );
        std::fs::create_dir_all(&overlay_dir)?;
    }

    let app = create_router(overlay_dir, state.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    log::info!("Starting overlay server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let pinger = tokio::spawn(ping_clients(state));
    let served = axum::serve(listener, app).await;
    pinger.abort();
    served?;

    Ok(())
}

async fn ping_clients(state: OverlayState) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        if state.client_count().await > 0 {
            state.broadcast(OverlayMessage::Ping);
        }
    }
}

/// Create the axum router with all routes
fn create_router(overlay_dir: PathBuf, state: OverlayState) -> Router {
    // CORS configuration for OBS browser source
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .fallback_service(ServeDir::new(overlay_dir))
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "Overlay server is running")
}
