//! Readiness endpoint for orchestrators

use crate::error::{Error, Result};
use axum::{http::StatusCode, routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Router answering `GET /readyz`
pub fn router() -> Router {
    Router::new()
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
}

async fn readyz() -> StatusCode {
    StatusCode::OK
}

/// Bind `addr` and serve the health check until `cancel` fires
pub async fn serve(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("failed to bind health check port {}: {}", addr, e)))?;
    serve_on(listener, cancel).await
}

/// Serve the health check on an already bound socket
pub async fn serve_on(listener: TcpListener, cancel: CancellationToken) -> Result<()> {
    info!("enabling health check on {}", listener.local_addr()?);
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
