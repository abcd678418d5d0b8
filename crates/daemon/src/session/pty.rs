//! PTY process spawning.
//!
//! This module opens a pseudo-terminal pair and starts the shell on its
//! slave side. The resulting [`PtyProcess`] hands out exclusively owned
//! handles; the [`Session`](super::Session) decides which task owns which.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::str::FromStr;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::SessionState;
use thiserror::Error;

/// Identifier of a session, supplied by the client.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Input, resize or signal requested outside RUNNING.
    #[error("session {id} is not running (state: {state})")]
    NotRunning { id: SessionId, state: SessionState },

    /// Failed to open the PTY or start the shell.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// The writer task has too many pending frames.
    #[error("input queue full for session {0}")]
    InputQueueFull(SessionId),

    /// A resize with a zero dimension.
    #[error("invalid terminal size: {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    /// The signal name is not recognised.
    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    /// The registry refused to create another session.
    #[error("session limit reached ({0} sessions)")]
    LimitReached(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How to start the shell of a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Shell command. If None, uses $SHELL or /bin/sh.
    pub shell: Option<String>,
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            shell: None,
            cols: 80,
            rows: 24,
            env: Vec::new(),
            cwd: None,
        }
    }
}

/// A freshly spawned shell and the master side of its terminal.
pub struct PtyProcess {
    /// Master handle, used for resizing and foreground lookups.
    pub master: Box<dyn MasterPty + Send>,
    /// Output side of the master (merged stdout/stderr of the shell).
    pub reader: Box<dyn Read + Send>,
    /// Input side of the master.
    pub writer: Box<dyn Write + Send>,
    /// The shell process.
    pub child: Box<dyn Child + Send + Sync>,
    /// Process ID of the shell.
    pub pid: Option<u32>,
}

impl PtyProcess {
    /// Opens a PTY pair and starts the shell on it.
    pub fn spawn(options: &SpawnOptions) -> Result<Self, SessionError> {
        if options.cols == 0 || options.rows == 0 {
            return Err(SessionError::InvalidSize {
                cols: options.cols,
                rows: options.rows,
            });
        }

        let shell_cmd = detect_shell(options.shell.clone());

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell_cmd);
        if let Some(ref dir) = options.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", shell_cmd, e)))?;

        // Only the shell may hold the slave open, otherwise its exit never
        // surfaces as EOF on the master.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        Ok(Self {
            master: pair.master,
            reader,
            writer,
            child,
            pid,
        })
    }
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell {
        return s;
    }

    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Parse a signal name into a signal.
///
/// Accepts:
/// - Numeric signals: "2", "15"
/// - Named signals, any case, with or without the SIG prefix: "SIGINT", "int"
pub fn parse_signal(name: &str) -> Result<Signal, SessionError> {
    let trimmed = name.trim();

    if let Ok(num) = trimmed.parse::<i32>() {
        return Signal::try_from(num).map_err(|_| SessionError::UnknownSignal(name.to_string()));
    }

    let upper = trimmed.to_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };

    Signal::from_str(&full).map_err(|_| SessionError::UnknownSignal(name.to_string()))
}

/// Sends `signal` to the terminal's foreground process group.
///
/// Falls back to the shell's own process group when the foreground group
/// cannot be determined.
pub fn signal_foreground(
    master: &dyn MasterPty,
    shell_pid: Option<u32>,
    signal: Signal,
) -> std::io::Result<()> {
    let pgrp = master
        .process_group_leader()
        .or_else(|| shell_pid.map(|pid| pid as i32))
        .ok_or_else(|| std::io::Error::other("no process group for terminal"))?;

    killpg(Pid::from_raw(pgrp), signal).map_err(std::io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_shell_with_provided() {
        let shell = detect_shell(Some("/bin/bash".to_string()));
        assert_eq!(shell, "/bin/bash");
    }

    #[test]
    fn test_detect_shell_from_env() {
        let shell = detect_shell(None);
        assert!(!shell.is_empty());
    }

    #[test]
    fn test_parse_signal_names() {
        assert_eq!(parse_signal("SIGINT").unwrap(), Signal::SIGINT);
        assert_eq!(parse_signal("int").unwrap(), Signal::SIGINT);
        assert_eq!(parse_signal("Term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGWINCH").unwrap(), Signal::SIGWINCH);
        assert_eq!(parse_signal(" hup ").unwrap(), Signal::SIGHUP);
    }

    #[test]
    fn test_parse_signal_numbers() {
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("15").unwrap(), Signal::SIGTERM);
    }

    #[test]
    fn test_parse_signal_unknown() {
        assert!(matches!(
            parse_signal("SIGBOGUS"),
            Err(SessionError::UnknownSignal(_))
        ));
        assert!(matches!(
            parse_signal("0"),
            Err(SessionError::UnknownSignal(_))
        ));
        assert!(matches!(
            parse_signal("4096"),
            Err(SessionError::UnknownSignal(_))
        ));
    }

    #[test]
    fn test_spawn_rejects_zero_size() {
        let options = SpawnOptions {
            cols: 0,
            ..SpawnOptions::default()
        };
        assert!(matches!(
            PtyProcess::spawn(&options),
            Err(SessionError::InvalidSize { cols: 0, rows: 24 })
        ));
    }

    #[test]
    fn test_spawn_missing_shell_fails() {
        let options = SpawnOptions {
            shell: Some("/nonexistent/shell/binary".to_string()),
            ..SpawnOptions::default()
        };
        let result = PtyProcess::spawn(&options);
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[test]
    fn test_spawn_sh() {
        let options = SpawnOptions {
            shell: Some("/bin/sh".to_string()),
            ..SpawnOptions::default()
        };
        let mut process = PtyProcess::spawn(&options).unwrap();
        assert!(process.pid.is_some());

        process.child.kill().unwrap();
        process.child.wait().unwrap();
    }
}
