//! API Server
//!
//! Serves the REST router until the shutdown token fires.

use super::rest::RestRouter;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default REST bind address
pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8090";

/// Run the REST API server
pub async fn serve(addr: SocketAddr, router: RestRouter, shutdown: CancellationToken) -> Result<()> {
    let app = router.build();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
    info!("REST API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}
