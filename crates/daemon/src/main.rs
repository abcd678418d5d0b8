//! PtyGate daemon
//!
//! Serves shell sessions over WebSocket and manages a running gateway.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ptygate::config::{default_config_path, Config};
use ptygate::gateway::{AdminClient, Gateway};
use ptygate::logging;
use ptygate::session::{SessionInfo, SessionRegistry};

/// PtyGate - per-conversation shell sessions over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "ptygated")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the gateway
    Serve {
        /// Listen address, overriding the configuration
        #[arg(long, short, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Manage sessions of a running gateway
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Inspect the configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all active sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,

        /// Gateway address (defaults to the configured bind address)
        #[arg(long, value_name = "ADDR")]
        addr: Option<String>,
    },

    /// Force-close an active session
    Kill {
        /// Session ID to close
        session_id: String,

        /// Gateway address (defaults to the configured bind address)
        #[arg(long, value_name = "ADDR")]
        addr: Option<String>,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            config.validate()?;

            let _guard = logging::init(
                &config.server.log_level,
                cli.verbose,
                config.server.log_dir.as_deref(),
            )?;
            tracing::info!(config = %config_path.display(), "PtyGate starting");

            serve(config).await?;
        }
        Commands::Sessions(cmd) => {
            let _guard = logging::init(&config.server.log_level, cli.verbose, None)?;

            match cmd {
                SessionsCommands::List { json, addr } => {
                    let client = AdminClient::new(&addr.unwrap_or(config.server.bind_addr))?;
                    let sessions = client.list_sessions().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                }
                SessionsCommands::Kill { session_id, addr } => {
                    let client = AdminClient::new(&addr.unwrap_or(config.server.bind_addr))?;
                    let response = client.kill_session(&session_id).await?;
                    if response.closed {
                        println!("Session {} closed", session_id);
                    } else {
                        println!("Session {} was already closing", session_id);
                    }
                }
            }
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => print!("{}", config.to_toml()?),
            ConfigCommands::Path => println!("{}", config_path.display()),
        },
    }

    Ok(())
}

/// Runs the gateway until SIGINT or SIGTERM.
async fn serve(config: Config) -> anyhow::Result<()> {
    let registry = Arc::new(SessionRegistry::new(
        config.session_options(),
        config.session.max_sessions,
    ));

    let gateway = Gateway::bind(config.bind_addr()?, registry).await?;
    let shutdown = gateway.shutdown_token();

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Received shutdown signal");
        shutdown.cancel();
    });

    gateway.run().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Failed to register signal handlers, falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionInfo]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(8)
        .clamp(8, 36);

    println!(
        "{:<id_width$}  {:<9}  {:>8}  {:>9}  {:>10}  {:>10}",
        "ID",
        "STATE",
        "PID",
        "SIZE",
        "CREATED",
        "ACTIVE",
        id_width = id_width
    );
    println!("{}", "-".repeat(id_width + 58));

    for session in sessions {
        let pid = session
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<id_width$}  {:<9}  {:>8}  {:>9}  {:>10}  {:>10}",
            truncate_str(&session.id, id_width),
            session.state.as_str(),
            pid,
            format!("{}x{}", session.cols, session.rows),
            format_relative_time(session.created_at),
            format_relative_time(session.last_activity_at),
            id_width = id_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["ptygated", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { bind } => assert!(bind.is_none()),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_with_bind() {
        let cli = Cli::try_parse_from(["ptygated", "serve", "--bind", "0.0.0.0:9000"]).unwrap();
        match cli.command {
            Commands::Serve { bind } => assert_eq!(bind.as_deref(), Some("0.0.0.0:9000")),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_sessions_list_json() {
        let cli = Cli::try_parse_from(["ptygated", "sessions", "list", "--json"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json, addr }) => {
                assert!(json);
                assert!(addr.is_none());
            }
            _ => panic!("Expected Sessions List command"),
        }
    }

    #[test]
    fn test_sessions_kill() {
        let cli = Cli::try_parse_from([
            "ptygated",
            "sessions",
            "kill",
            "conv-42",
            "--addr",
            "127.0.0.1:9999",
        ])
        .unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Kill { session_id, addr }) => {
                assert_eq!(session_id, "conv-42");
                assert_eq!(addr.as_deref(), Some("127.0.0.1:9999"));
            }
            _ => panic!("Expected Sessions Kill command"),
        }
    }

    #[test]
    fn test_sessions_kill_requires_id() {
        assert!(Cli::try_parse_from(["ptygated", "sessions", "kill"]).is_err());
    }

    #[test]
    fn test_config_commands() {
        let cli = Cli::try_parse_from(["ptygated", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));

        let cli = Cli::try_parse_from(["ptygated", "config", "path"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Path)));
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["ptygated", "serve", "--config", "/tmp/p.toml", "-v"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/p.toml")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a-very-long-session-id", 10), "a-very-...");
    }

    #[test]
    fn test_format_relative_time() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(format_relative_time(now).ends_with("s ago"));
        assert_eq!(format_relative_time(now - 120), "2m ago");
        assert_eq!(format_relative_time(now - 7200), "2h ago");
        assert_eq!(format_relative_time(now - 172800), "2d ago");
    }
}
