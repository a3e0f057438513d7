//! Axum-backed HTTP [`Server`].
//!
//! [`HttpServer`] binds a TCP listener on `run`, serves until `shutdown` is
//! requested, then drains in-flight requests for at most the configured
//! shutdown timeout.
//!
//! Built-in endpoints: `GET /` (greeting) and `GET /health` (liveness).
//! Extra routes can be merged with [`HttpServer::with_routes`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors;
use tower_http::timeout::TimeoutLayer;

use crate::server::{BoxError, BoxFuture, Hook, Server};
use crate::telemetry::http_tracing;

/// Default time allowed for draining connections on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP server failures.
#[derive(Debug, Error)]
pub enum HttpError {
    /// `run` was called more than once.
    #[error("http server '{0}' already started")]
    AlreadyStarted(String),

    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Serving failed.
    #[error("serve: {0}")]
    Serve(#[source] std::io::Error),

    /// In-flight requests did not drain in time.
    #[error("http server '{name}' did not stop within {timeout:?}")]
    ShutdownTimeout {
        /// Server name.
        name: String,
        /// Configured shutdown timeout.
        timeout: Duration,
    },
}

#[derive(Clone)]
struct HealthState {
    name: String,
}

/// HTTP server managed by the [`Engine`](crate::Engine).
#[allow(missing_debug_implementations)]
pub struct HttpServer {
    name: String,
    addr: SocketAddr,
    shutdown_timeout: Duration,
    request_timeout: Option<Duration>,
    routes: Mutex<Option<Router>>,
    before_run: Option<Hook>,
    before_shutdown: Option<Hook>,
    after_stop: Option<Hook>,
    started: AtomicBool,
    drain_expired: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    stop: CancellationToken,
    stopped: CancellationToken,
}

impl HttpServer {
    /// Creates a server named `name` that will listen on `addr`.
    #[must_use]
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            request_timeout: None,
            routes: Mutex::new(Some(Router::new())),
            before_run: None,
            before_shutdown: None,
            after_stop: None,
            started: AtomicBool::new(false),
            drain_expired: AtomicBool::new(false),
            local_addr: OnceLock::new(),
            stop: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    /// Sets how long `shutdown` waits for in-flight requests to drain.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets a per-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Merges additional routes into the server.
    #[must_use]
    pub fn with_routes(mut self, routes: Router) -> Self {
        let slot = self.routes.get_mut().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(slot.take().unwrap_or_default().merge(routes));
        self
    }

    /// Sets the hook run before the listener is bound.
    #[must_use]
    pub fn with_before_run(mut self, hook: Hook) -> Self {
        self.before_run = Some(hook);
        self
    }

    /// Sets the hook run before graceful shutdown starts.
    #[must_use]
    pub fn with_before_shutdown(mut self, hook: Hook) -> Self {
        self.before_shutdown = Some(hook);
        self
    }

    /// Sets the hook run after the server stopped serving.
    #[must_use]
    pub fn with_after_stop(mut self, hook: Hook) -> Self {
        self.after_stop = Some(hook);
        self
    }

    /// Address the listener is bound to, once `run` has bound it.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn router(&self, extra: Router) -> Router {
        let state = HealthState {
            name: self.name.clone(),
        };
        let router = Router::new()
            .route("/", get(get_root))
            .route("/health", get(get_health))
            .with_state(state)
            .merge(extra)
            .layer(http_tracing())
            .layer(
                cors::CorsLayer::new()
                    .allow_origin(cors::Any)
                    .allow_methods([Method::GET, Method::POST])
                    .allow_headers(cors::Any),
            );
        match self.request_timeout {
            Some(timeout) => router.layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                timeout,
            )),
            None => router,
        }
    }

    async fn serve(&self) -> Result<(), HttpError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(HttpError::AlreadyStarted(self.name.clone()));
        }
        if self.stop.is_cancelled() {
            tracing::debug!(server = %self.name, "shutdown requested before start");
            self.stopped.cancel();
            return Ok(());
        }

        let extra = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();
        let router = self.router(extra);

        let result = async {
            let listener = tokio::net::TcpListener::bind(self.addr)
                .await
                .map_err(|source| HttpError::Bind {
                    addr: self.addr,
                    source,
                })?;
            let local_addr = listener.local_addr().map_err(HttpError::Serve)?;
            let _ = self.local_addr.set(local_addr);
            tracing::info!(server = %self.name, "listening on http://{}", local_addr);

            let stop = self.stop.clone();
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .into_future();
            let drain_deadline = async {
                self.stop.cancelled().await;
                tokio::time::sleep(self.shutdown_timeout).await;
            };
            tokio::select! {
                result = serve => result.map_err(HttpError::Serve),
                () = drain_deadline => {
                    self.drain_expired.store(true, Ordering::Release);
                    tracing::warn!(
                        server = %self.name,
                        timeout = ?self.shutdown_timeout,
                        "in-flight requests did not drain, abandoning them"
                    );
                    Ok(())
                }
            }
        }
        .await;

        self.stopped.cancel();
        result
    }

    async fn stop(&self) -> Result<(), HttpError> {
        self.stop.cancel();
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let drained = tokio::time::timeout(self.shutdown_timeout, self.stopped.cancelled())
            .await
            .is_ok();
        if drained && !self.drain_expired.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(HttpError::ShutdownTimeout {
                name: self.name.clone(),
                timeout: self.shutdown_timeout,
            })
        }
    }
}

impl Server for HttpServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn before_run_hook(&self) -> Option<Hook> {
        self.before_run.clone()
    }

    fn before_shutdown_hook(&self) -> Option<Hook> {
        self.before_shutdown.clone()
    }

    fn after_stop_hook(&self) -> Option<Hook> {
        self.after_stop.clone()
    }

    fn run(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move { self.serve().await.map_err(Into::into) })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move { self.stop().await.map_err(Into::into) })
    }
}

/// `GET /` — simple greeting.
async fn get_root(State(state): State<HealthState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        format!("Hello from {} ({})!", state.name, env!("CARGO_PKG_NAME")),
    )
}

/// `GET /health` — lightweight liveness check.
async fn get_health(State(state): State<HealthState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "server": state.name })),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::engine::Engine;
    use crate::server::hook;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn wait_bound(server: &HttpServer) -> SocketAddr {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                if let Some(addr) = server.local_addr() {
                    return addr;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("server never bound")
    }

    async fn fetch(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        response
    }

    #[tokio::test]
    async fn serves_health_until_shutdown() {
        let server = Arc::new(HttpServer::new("api", loopback()));
        let engine = Engine::builder("test")
            .with_shared_server(Arc::clone(&server))
            .build();

        let run = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };
        let addr = wait_bound(&server).await;

        let response = fetch(addr, "/health").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains(r#""server":"api""#), "{response}");

        assert!(engine.shutdown().await.is_ok());
        let result = tokio::time::timeout(TIMEOUT, run)
            .await
            .expect("engine did not stop")
            .expect("run panicked");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn extra_routes_are_merged() {
        let server = Arc::new(
            HttpServer::new("api", loopback())
                .with_routes(Router::new().route("/ping", get(|| async { "pong" }))),
        );
        let engine = Engine::builder("test")
            .with_shared_server(Arc::clone(&server))
            .build();
        let run = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };
        let addr = wait_bound(&server).await;

        let response = fetch(addr, "/ping").await;
        assert!(response.ends_with("pong"), "{response}");

        assert!(engine.shutdown().await.is_ok());
        assert!(run.await.expect("run panicked").is_ok());
    }

    #[tokio::test]
    async fn stuck_request_is_abandoned_after_shutdown_timeout() {
        let entered = Arc::new(AtomicBool::new(false));
        let stuck = {
            let entered = Arc::clone(&entered);
            move || {
                let entered = Arc::clone(&entered);
                async move {
                    entered.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    "late"
                }
            }
        };
        let server = Arc::new(
            HttpServer::new("api", loopback())
                .with_shutdown_timeout(Duration::from_millis(200))
                .with_routes(Router::new().route("/stuck", get(stuck))),
        );
        let engine = Engine::builder("test")
            .with_shared_server(Arc::clone(&server))
            .build();
        let run = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };
        let addr = wait_bound(&server).await;

        let client = tokio::spawn(fetch(addr, "/stuck"));
        tokio::time::timeout(TIMEOUT, async {
            while !entered.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("request never reached the handler");

        let errors = engine.shutdown().await.unwrap_err();
        assert!(errors.to_string().contains("did not stop within"), "{errors}");

        let result = tokio::time::timeout(TIMEOUT, run)
            .await
            .expect("engine did not stop after the shutdown timeout")
            .expect("run panicked");
        assert!(result.is_ok());
        client.abort();
    }

    #[tokio::test]
    async fn shutdown_before_run_skips_binding() {
        let server = HttpServer::new("api", loopback());
        assert!(server.stop().await.is_ok());
        assert!(server.serve().await.is_ok());
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let server = HttpServer::new("api", loopback());
        assert!(server.stop().await.is_ok());
        assert!(server.serve().await.is_ok());
        assert!(matches!(
            server.serve().await,
            Err(HttpError::AlreadyStarted(name)) if name == "api"
        ));
    }

    #[tokio::test]
    async fn bind_failure_is_a_run_error() {
        let occupied = tokio::net::TcpListener::bind(loopback()).await.expect("bind");
        let addr = occupied.local_addr().expect("addr");

        let stopped = Arc::new(AtomicBool::new(false));
        let engine = Engine::builder("test")
            .with_server(HttpServer::new("api", addr).with_after_stop(hook({
                let stopped = Arc::clone(&stopped);
                move |_, _| {
                    let stopped = Arc::clone(&stopped);
                    async move {
                        stopped.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                }
            })))
            .build();

        let errors = engine.run().await.unwrap_err();
        assert!(errors.to_string().contains("failed to bind"), "{errors}");
        assert!(stopped.load(Ordering::SeqCst));
    }
}
