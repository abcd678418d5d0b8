//! WebSocket gateway and admin HTTP surface.
//!
//! One listener serves both:
//!
//! - `GET /ws/terminal/{session_id}`: attach to (or create) a session
//! - `GET /health`
//! - `GET /api/sessions`, `GET /api/sessions/{id}`, `DELETE /api/sessions/{id}`

mod admin;
pub mod client;
pub mod error;
mod socket;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use protocol::CloseReason;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::session::SessionManager;

pub use admin::{CloseResponse, HealthResponse};
pub use client::AdminClient;
pub use error::{ApiError, ErrorResponse};

/// State shared by every handler.
pub struct GatewayState<M> {
    pub registry: Arc<M>,
}

/// Builds the router for `registry`.
pub fn router<M: SessionManager + 'static>(registry: Arc<M>) -> Router {
    let state = Arc::new(GatewayState { registry });

    Router::new()
        .route("/ws/terminal/{session_id}", get(socket::ws_handler::<M>))
        .route("/health", get(admin::health::<M>))
        .route("/api/sessions", get(admin::list_sessions::<M>))
        .route(
            "/api/sessions/{id}",
            get(admin::get_session::<M>).delete(admin::close_session::<M>),
        )
        .with_state(state)
}

/// A bound gateway, ready to serve.
pub struct Gateway<M> {
    registry: Arc<M>,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl<M: SessionManager + 'static> Gateway<M> {
    /// Binds the listener. Use port 0 to let the OS pick one.
    pub async fn bind(addr: SocketAddr, registry: Arc<M>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        Ok(Self {
            registry,
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Token that stops the gateway when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves until the shutdown token is cancelled, then closes every
    /// session with `shutdown`.
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        let app = router(Arc::clone(&self.registry));
        let shutdown = self.shutdown.clone();

        tracing::info!(addr = %addr, "Gateway listening");

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("Gateway server error")?;

        let closed = self.registry.close_all(CloseReason::Shutdown).await;
        tracing::info!(sessions = closed, "Gateway stopped");
        Ok(())
    }
}
