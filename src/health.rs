//! Liveness and status HTTP endpoint.

use crate::error::Result;
use crate::reconciler::{RecordStatusView, StatusBoard};
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Routes: `GET /healthz` and `GET /status`.
pub fn router(board: StatusBoard) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(board)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(board): State<StatusBoard>) -> Json<Vec<RecordStatusView>> {
    Json(board.snapshot().await)
}

/// Bind the health listener on all interfaces.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    Ok(TcpListener::bind(addr).await?)
}

/// Serve until `shutdown` flips to true or its sender is dropped.
pub async fn serve(
    listener: TcpListener,
    board: StatusBoard,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Health endpoint listening on {}", addr);
    }

    axum::serve(listener, router(board))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    tracing::debug!("Health endpoint stopped");
    Ok(())
}
