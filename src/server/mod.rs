//! HTTP front door.
//!
//! One axum server hosts the terminal socket (`/profiles`), the daemon
//! introspection routes and the static frontend. Sessions are spawned per
//! upgraded connection and never share state.

pub mod frontend;
pub mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use axum::routing::{any, get};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::error::ServerError;
use crate::session::SessionEndpoint;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to.
    pub addr: SocketAddr,
    /// Directory served for every path not matched by a route.
    pub frontend_dir: Option<PathBuf>,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionEndpoint,
}

/// Build the route table.
pub fn router(state: AppState, frontend_dir: Option<PathBuf>) -> Router {
    let routes = Router::new()
        .route("/ping", any(handlers::ping))
        .route("/info", any(handlers::info))
        .route("/info-userns", any(handlers::info_userns))
        .route("/profiles", get(handlers::profiles))
        .with_state(state);

    let routes = match frontend_dir {
        Some(dir) => routes.fallback_service(ServeDir::new(dir)),
        None => routes,
    };
    routes.layer(TraceLayer::new_for_http())
}

/// The relay's HTTP server.
///
/// `start()` binds the listener and spawns the serving task; `shutdown()`
/// stops accepting connections and waits for in-flight requests.
pub struct Server {
    config: ServerConfig,
    state: AppState,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// The bound address, once started. Differs from the configured address
    /// when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and spawn the server.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        let app = router(self.state.clone(), self.config.frontend_dir.clone());

        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| ServerError::StartupFailed {
                reason: format!("Failed to bind to {}: {}", self.config.addr, e),
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::StartupFailed {
                reason: format!("Failed to read bound address: {}", e),
            })?;
        self.local_addr = Some(local_addr);

        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("Server shutting down");
                })
                .await
            {
                tracing::error!("Server error: {}", e);
            }
        });

        self.handle = Some(handle);
        Ok(local_addr)
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    ///
    /// Terminal sockets are upgraded connections the HTTP server no longer
    /// tracks, so live sessions are stopped and drained separately; this
    /// returns only after each of their containers has been removed.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.state.sessions.tracker().shutdown().await;
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
