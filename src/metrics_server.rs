// HTTP server for the Prometheus metrics endpoint
//
// Serves /metrics and /health while the batch command runs.

use anyhow::{Context, Result};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::metrics;

/// Router exposing the metrics and health endpoints
pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
}

/// Bind the metrics listener
///
/// # Arguments
/// * `bind` - Interface address to listen on
/// * `port` - Port to listen on, 0 for an ephemeral port
pub async fn bind(bind: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("Invalid metrics bind address: {}:{}", bind, port))?;
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))
}

/// Serve metrics on an already bound listener until the task is dropped
pub async fn serve(listener: TcpListener) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;
    let addr = listener.local_addr().context("Metrics listener has no address")?;
    info!("Starting metrics server on {}", addr);

    axum::serve(listener, router())
        .await
        .context("Metrics server error")?;
    Ok(())
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_metrics_and_health_endpoints() {
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener));

        metrics::init().unwrap();
        metrics::BACKEND_FALLBACKS_TOTAL.inc();

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));

        let body = get(addr, "/metrics").await;
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("gateway_backend_fallbacks_total"));

        server.abort();
    }

    #[tokio::test]
    async fn test_invalid_bind_address() {
        assert!(bind("not an address", 0).await.is_err());
    }
}
