//! The single path from RUNNING (or ERROR) to STOPPED.
//!
//! Every termination trigger (client kill, process exit, I/O failure,
//! stalled consumer, idle timeout, daemon shutdown) ends up in
//! [`Session::close`]. The state check and the move to STOPPING happen under
//! the session lock, so concurrent callers collapse into one teardown.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::Child;
use protocol::{CloseReason, SessionState};

use super::handle::{lock, Session};

/// Poll interval while waiting for the shell to exit after hangup.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(25);

impl Session {
    /// Closes the session with `reason`.
    ///
    /// Returns true for the one caller that performed the teardown and false
    /// for everyone else. Either way the session is STOPPED, or on its way
    /// there, when this returns.
    pub async fn close(&self, reason: CloseReason) -> bool {
        {
            let mut inner = self.lock_inner();
            match inner.state {
                SessionState::Running | SessionState::Error => {}
                SessionState::Initializing => {
                    tracing::warn!(session_id = %self.id, "Close requested before session started");
                    return false;
                }
                SessionState::Stopping | SessionState::Stopped => {
                    tracing::debug!(
                        session_id = %self.id,
                        reason = %reason,
                        state = %inner.state,
                        "Session already closing"
                    );
                    return false;
                }
            }

            inner.close_reason = Some(reason);
            // The writer task exits once the last sender is gone.
            inner.input_tx = None;
            self.transition(&mut inner, SessionState::Stopping);
        }

        self.teardowns.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            session_id = %self.id,
            generation = self.generation,
            reason = %reason,
            "Closing session"
        );

        self.cancel.cancel();
        drop(lock(&self.master).take());

        if let Some(code) = self.terminate_child().await {
            self.lock_inner().exit_code = Some(code);
        }

        // The reader drains what the PTY still holds before the closed frame.
        let reader = lock(&self.reader_task).take();
        if let Some(reader) = reader {
            if tokio::time::timeout(self.options.drain_timeout, reader)
                .await
                .is_err()
            {
                tracing::warn!(session_id = %self.id, "Reader task did not stop in time, output may be cut short");
            }
        }

        if self.queue.push_closed(reason).is_err() {
            tracing::debug!(session_id = %self.id, "Outbound queue already closed");
        }
        if !self.queue.drained(self.options.drain_timeout).await {
            tracing::debug!(
                session_id = %self.id,
                pending = self.queue.len(),
                "Subscriber did not drain before stop"
            );
        }

        {
            let mut inner = self.lock_inner();
            self.transition(&mut inner, SessionState::Stopped);
        }
        self.registry.remove(&self.id, self.generation);

        tracing::info!(
            session_id = %self.id,
            generation = self.generation,
            reason = %reason,
            "Session stopped"
        );
        true
    }

    /// Hangs up the shell, escalating to a kill after the grace period.
    ///
    /// Returns the exit code if the process was reaped.
    async fn terminate_child(&self) -> Option<u32> {
        let child = lock(&self.child).take()?;
        let id = self.id.clone();
        let pid = self.pid;
        let grace = self.options.kill_grace;

        match tokio::task::spawn_blocking(move || reap(&id, child, pid, grace)).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "Reap task panicked");
                None
            }
        }
    }
}

fn reap(
    id: &str,
    mut child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    grace: Duration,
) -> Option<u32> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status.exit_code());
    }

    if let Some(pid) = pid {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
            tracing::debug!(session_id = %id, error = %e, "Failed to send SIGHUP");
        }
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status.exit_code()),
            Ok(None) => std::thread::sleep(REAP_POLL_INTERVAL),
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Failed to poll shell status");
                break;
            }
        }
    }

    tracing::warn!(session_id = %id, "Shell ignored hangup, killing");
    if let Err(e) = child.kill() {
        tracing::debug!(session_id = %id, error = %e, "Kill failed");
    }
    match child.wait() {
        Ok(status) => Some(status.exit_code()),
        Err(e) => {
            tracing::warn!(session_id = %id, error = %e, "Failed to reap shell");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::future::join_all;
    use protocol::FrameKind;
    use tokio::time::timeout;

    use crate::session::{
        OverflowPolicy, QueueConfig, RegistryHandle, Session, SessionOptions, SpawnOptions,
    };

    use super::*;

    fn sh_options() -> SessionOptions {
        SessionOptions {
            spawn: SpawnOptions {
                shell: Some("/bin/sh".to_string()),
                ..SpawnOptions::default()
            },
            kill_grace: Duration::from_millis(500),
            drain_timeout: Duration::from_millis(200),
            ..SessionOptions::default()
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = Session::spawn(
            "idempotent".to_string(),
            0,
            sh_options(),
            RegistryHandle::detached(),
        )
        .await;

        assert!(session.close(CloseReason::AdminKill).await);
        assert!(!session.close(CloseReason::Shutdown).await);
        assert_eq!(session.teardown_count(), 1);
        assert_eq!(session.close_reason(), Some(CloseReason::AdminKill));
    }

    #[tokio::test]
    async fn test_concurrent_close_single_teardown() {
        let session = Session::spawn(
            "concurrent-close".to_string(),
            0,
            sh_options(),
            RegistryHandle::detached(),
        )
        .await;
        let mut stream = session.subscribe();

        let reasons = [
            CloseReason::AdminKill,
            CloseReason::IdleTimeout,
            CloseReason::Shutdown,
            CloseReason::IoError,
        ];
        let closers = (0..16).map(|i| {
            let session = Arc::clone(&session);
            let reason = reasons[i % reasons.len()];
            tokio::spawn(async move { session.close(reason).await })
        });
        let results = join_all(closers).await;

        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);
        assert_eq!(session.teardown_count(), 1);

        timeout(Duration::from_secs(5), session.stopped()).await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);

        let mut closed_frames = 0;
        let mut stopping_frames = 0;
        while let Some(frame) = stream.recv().await {
            match frame.kind() {
                FrameKind::Closed => closed_frames += 1,
                FrameKind::Status if frame.text().unwrap() == "STOPPING" => stopping_frames += 1,
                _ => {}
            }
        }
        assert_eq!(closed_frames, 1);
        assert_eq!(stopping_frames, 1);
    }

    #[tokio::test]
    async fn test_close_kills_shell_ignoring_hangup() {
        let session = Session::spawn(
            "stubborn".to_string(),
            0,
            sh_options(),
            RegistryHandle::detached(),
        )
        .await;
        let mut stream = session.subscribe();

        session.write(b"trap '' HUP TERM; echo trapped_\"ready\"\n").unwrap();
        let mut output = String::new();
        timeout(Duration::from_secs(5), async {
            while let Some(frame) = stream.recv().await {
                output.push_str(&String::from_utf8_lossy(frame.payload()));
                if output.contains("trapped_ready\r\n") {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let pid = session.pid().unwrap() as i32;
        timeout(Duration::from_secs(5), session.close(CloseReason::AdminKill))
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        // The process is reaped, so it no longer exists.
        assert!(kill(Pid::from_raw(pid), None).is_err());
    }

    #[tokio::test]
    async fn test_closed_frame_follows_buffered_output() {
        let session = Session::spawn(
            "drain".to_string(),
            0,
            sh_options(),
            RegistryHandle::detached(),
        )
        .await;
        let mut stream = session.subscribe();

        session.write(b"echo before_close\n").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let closer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.close(CloseReason::AdminKill).await })
        };

        let mut frames = Vec::new();
        while let Some(frame) = stream.recv().await {
            frames.push(frame);
        }
        assert!(closer.await.unwrap());

        let last = frames.last().unwrap();
        assert_eq!(last.kind(), FrameKind::Closed);
        assert_eq!(last.close_reason(), Some(CloseReason::AdminKill));
        let output: String = frames
            .iter()
            .filter(|f| f.kind() == FrameKind::Data)
            .map(|f| String::from_utf8_lossy(f.payload()).into_owned())
            .collect();
        assert!(output.contains("before_close"));
    }

    #[tokio::test]
    async fn test_close_during_backpressure_keeps_output() {
        let options = SessionOptions {
            queue: QueueConfig {
                capacity: 1,
                policy: OverflowPolicy::Backpressure,
                stall_timeout: Duration::from_secs(10),
            },
            drain_timeout: Duration::from_secs(5),
            ..sh_options()
        };
        let session =
            Session::spawn("backlog".to_string(), 0, options, RegistryHandle::detached()).await;
        let mut stream = session.subscribe();

        session
            .write(b"i=0; while [ $i -lt 200 ]; do echo line_$i; i=$((i+1)); done; echo lines_\"done\"\n")
            .unwrap();
        // The unread RUNNING frame fills the queue, so the reader is parked
        // on its first chunk and the rest waits in the PTY.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let closer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.close(CloseReason::AdminKill).await })
        };

        let mut output = String::new();
        let mut last = None;
        while let Some(frame) = stream.recv().await {
            if frame.kind() == FrameKind::Data {
                output.push_str(&String::from_utf8_lossy(frame.payload()));
            }
            last = Some(frame);
        }
        assert!(closer.await.unwrap());

        assert_eq!(last.unwrap().close_reason(), Some(CloseReason::AdminKill));
        for i in 0..200 {
            assert!(output.contains(&format!("line_{}\r\n", i)), "missing line_{}", i);
        }
        assert!(output.contains("lines_done"));
        assert_eq!(session.info().queue.dropped, 0);
    }
}
