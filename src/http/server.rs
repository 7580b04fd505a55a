//! HTTP server hosting the demo API behind the gate.

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::GateLayer;
use crate::error::{FloodgateError, Result};
use crate::gate::Gate;

/// HTTP server for the limited API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    gate: Arc<Gate>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, gate: Arc<Gate>) -> Self {
        Self { addr, gate }
    }

    /// Build the router: API routes sit behind the gate, `/healthz` does not.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/product", get(product))
            .route("/api/slow", get(slow))
            .layer(GateLayer::new(Arc::clone(&self.gate)))
            .route("/healthz", get(|| async { "ok" }))
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let app = self.router();

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            FloodgateError::Server(e.to_string())
        })
    }
}

async fn product() -> &'static str {
    "product"
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(1)).await;
    "slow"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, Policy, PolicyRegistry};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn server(limit: u32) -> HttpServer {
        let registry = PolicyRegistry::builder(Arc::new(ManualClock::new()))
            .register(Policy::fixed_window("Fixed", limit, Duration::from_secs(12)))
            .unwrap()
            .default_policy("Fixed")
            .build()
            .unwrap();
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        HttpServer::new(addr, Arc::new(Gate::new(Arc::new(registry))))
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check_is_not_limited() {
        let app = server(1).router();

        let response = app.clone().oneshot(get("/api/product")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(get("/api/product")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        for _ in 0..3 {
            let response = app.clone().oneshot(get("/healthz")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_endpoint() {
        let app = server(4).router();
        let response = app.oneshot(get("/api/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serve_with_shutdown() {
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), server(1).gate);
        server.serve_with_shutdown(async {}).await.unwrap();
    }
}
