//! Idle-timeout watchdog.

use std::sync::Arc;
use std::time::Duration;

use protocol::CloseReason;
use tokio::task::JoinHandle;

use super::handle::Session;

/// Closes `session` with `idle_timeout` once it has seen no input or output
/// for `idle_timeout`. Stops as soon as the session starts closing.
pub(super) fn spawn_idle_watchdog(session: Arc<Session>, idle_timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let idle = session.idle_for();
            if idle >= idle_timeout {
                tracing::info!(
                    session_id = %session.id(),
                    idle_secs = idle.as_secs_f64(),
                    "Session idle, closing"
                );
                session.close(CloseReason::IdleTimeout).await;
                break;
            }

            tokio::select! {
                _ = session.cancel.cancelled() => break,
                _ = tokio::time::sleep(idle_timeout - idle) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use protocol::{FrameKind, SessionState};
    use tokio::time::timeout;

    use crate::session::{RegistryHandle, SessionOptions, SpawnOptions};

    use super::*;

    fn idle_options(idle_timeout: Duration) -> SessionOptions {
        SessionOptions {
            spawn: SpawnOptions {
                shell: Some("/bin/sh".to_string()),
                ..SpawnOptions::default()
            },
            idle_timeout: Some(idle_timeout),
            kill_grace: Duration::from_millis(500),
            drain_timeout: Duration::from_millis(200),
            ..SessionOptions::default()
        }
    }

    #[tokio::test]
    async fn test_idle_session_closes() {
        let session = Session::spawn(
            "idle".to_string(),
            0,
            idle_options(Duration::from_millis(400)),
            RegistryHandle::detached(),
        )
        .await;
        let mut stream = session.subscribe();

        let mut states = Vec::new();
        let mut closed = None;
        timeout(Duration::from_secs(10), async {
            while let Some(frame) = stream.recv().await {
                match frame.kind() {
                    FrameKind::Status => states.push(frame.text().unwrap().to_string()),
                    FrameKind::Closed => closed = frame.close_reason(),
                    _ => {}
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(states, vec!["RUNNING", "STOPPING"]);
        assert_eq!(closed, Some(CloseReason::IdleTimeout));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_activity_defers_idle_timeout() {
        let session = Session::spawn(
            "busy".to_string(),
            0,
            idle_options(Duration::from_millis(1500)),
            RegistryHandle::detached(),
        )
        .await;

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            session.write(b"\n").unwrap();
        }
        assert_eq!(session.state(), SessionState::Running);

        timeout(Duration::from_secs(10), session.stopped()).await.unwrap();
        assert_eq!(session.close_reason(), Some(CloseReason::IdleTimeout));
    }

    #[tokio::test]
    async fn test_watchdog_exits_on_close() {
        let session = Session::spawn(
            "watched".to_string(),
            0,
            idle_options(Duration::from_secs(3600)),
            RegistryHandle::detached(),
        )
        .await;

        let watchdog = spawn_idle_watchdog(Arc::clone(&session), Duration::from_secs(3600));
        session.close(CloseReason::AdminKill).await;

        timeout(Duration::from_secs(1), watchdog).await.unwrap().unwrap();
        assert_eq!(session.close_reason(), Some(CloseReason::AdminKill));
    }
}
