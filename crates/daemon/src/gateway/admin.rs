//! Administrative HTTP endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use protocol::CloseReason;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::GatewayState;
use crate::session::{SessionInfo, SessionManager};

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
}

/// Body of `DELETE /api/sessions/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseResponse {
    /// False when another close was already under way.
    pub closed: bool,
    pub session: SessionInfo,
}

/// GET /health
pub(super) async fn health<M: SessionManager + 'static>(
    State(state): State<Arc<GatewayState<M>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.registry.count(),
    })
}

/// GET /api/sessions
pub(super) async fn list_sessions<M: SessionManager + 'static>(
    State(state): State<Arc<GatewayState<M>>>,
) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list())
}

/// GET /api/sessions/{id}
pub(super) async fn get_session<M: SessionManager + 'static>(
    State(state): State<Arc<GatewayState<M>>>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = state.registry.get(&id).ok_or(ApiError::NotFound(id))?;
    Ok(Json(session.info()))
}

/// DELETE /api/sessions/{id}
///
/// Force-closes the session with `admin_kill` and waits for it to stop.
pub(super) async fn close_session<M: SessionManager + 'static>(
    State(state): State<Arc<GatewayState<M>>>,
    Path(id): Path<String>,
) -> Result<Json<CloseResponse>, ApiError> {
    let session = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;

    tracing::info!(session_id = %id, "Admin close requested");
    let closed = state.registry.close(&id, CloseReason::AdminKill).await?;
    if !closed {
        session.stopped().await;
    }

    Ok(Json(CloseResponse {
        closed,
        session: session.info(),
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use protocol::SessionState;

    use super::*;
    use crate::session::{SessionOptions, SessionRegistry, SpawnOptions};

    fn state() -> Arc<GatewayState<SessionRegistry>> {
        let options = SessionOptions {
            spawn: SpawnOptions {
                shell: Some("/bin/sh".to_string()),
                ..SpawnOptions::default()
            },
            kill_grace: Duration::from_millis(500),
            drain_timeout: Duration::from_millis(200),
            ..SessionOptions::default()
        };
        Arc::new(GatewayState {
            registry: Arc::new(SessionRegistry::new(options, 4)),
        })
    }

    #[tokio::test]
    async fn test_close_session_through_registry() {
        let state = state();
        state.registry.acquire_or_create("victim").await.unwrap();

        let Json(response) = close_session(State(Arc::clone(&state)), Path("victim".to_string()))
            .await
            .unwrap();

        assert!(response.closed);
        assert_eq!(response.session.state, SessionState::Stopped);
        assert_eq!(response.session.close_reason, Some(CloseReason::AdminKill));
        assert!(state.registry.get("victim").is_none());
    }

    #[tokio::test]
    async fn test_close_missing_session_not_found() {
        let state = state();

        let result = close_session(State(state), Path("ghost".to_string())).await;

        assert!(matches!(result, Err(ApiError::NotFound(ref id)) if id == "ghost"));
    }
}
