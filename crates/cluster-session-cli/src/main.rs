//! Cluster Session CLI - run a session coordinator or poke at a running one.
//!
//! `serve` runs the coordinator in the foreground. Every other command
//! connects as a peer, performs one operation, and prints the result as JSON
//! on stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cluster_session::{ClusterStore, PeerClient, Role, SessionConfig, SessionStore};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "cluster-session")]
#[command(about = "Shared session store for multi-process web servers")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Coordinator socket path (overrides CLUSTER_SESSION_SOCKET)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Per-request timeout in milliseconds (overrides CLUSTER_SESSION_TIMEOUT_MS)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Default session TTL in seconds (overrides CLUSTER_SESSION_TTL_SECS)
    #[arg(long)]
    ttl_secs: Option<u64>,

    /// Expired-session sweep interval in seconds (overrides CLUSTER_SESSION_SWEEP_SECS)
    #[arg(long)]
    sweep_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator until interrupted
    Serve,
    /// Check that the coordinator answers
    Ping,
    /// Print a session payload, or null if absent
    Get { session_id: String },
    /// Create or replace a session
    Set {
        session_id: String,
        /// Session payload as JSON
        payload: String,
        /// Session TTL in seconds (default TTL if omitted)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Remove a session
    Destroy { session_id: String },
    /// Extend a session's expiry
    Touch {
        session_id: String,
        /// New TTL in seconds (default TTL if omitted)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Print the number of live sessions
    Length,
    /// Remove every session
    Clear,
}

impl Args {
    fn session_config(&self, role: Role) -> Result<SessionConfig> {
        let mut config = SessionConfig::from_env()?.with_role(role);
        if let Some(path) = &self.socket {
            config = config.with_socket_path(path);
        }
        if let Some(ms) = self.timeout_ms {
            config = config.with_request_timeout(Duration::from_millis(ms));
        }
        if let Some(secs) = self.ttl_secs {
            config = config.with_default_ttl(Duration::from_secs(secs));
        }
        if let Some(secs) = self.sweep_secs {
            config = config.with_sweep_interval(Duration::from_secs(secs));
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays machine-readable
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match &args.command {
        Command::Serve => serve(args.session_config(Role::Coordinator)?).await,
        command => {
            let config = args.session_config(Role::Peer)?;
            let client = PeerClient::connect(&config).await.with_context(|| {
                format!(
                    "no session coordinator reachable at {}",
                    config.socket_path.display()
                )
            })?;
            let output = run_command(&client, command).await?;
            println!("{}", output);
            Ok(())
        }
    }
}

async fn serve(config: SessionConfig) -> Result<()> {
    info!("Starting session coordinator");
    let mut store = ClusterStore::start(config).await?;

    // Print the socket path for supervisors to read (intentional stdout)
    println!("SOCKET={}", store.config().socket_path.display());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    store.shutdown();

    Ok(())
}

async fn run_command(client: &PeerClient, command: &Command) -> Result<Value> {
    let output = match command {
        Command::Serve => anyhow::bail!("serve does not run against an existing coordinator"),
        Command::Ping => {
            client.ping().await?;
            json!("pong")
        }
        Command::Get { session_id } => client.get(session_id).await?.unwrap_or(Value::Null),
        Command::Set {
            session_id,
            payload,
            ttl_secs,
        } => {
            let payload: Value = serde_json::from_str(payload)
                .with_context(|| format!("payload for {} is not valid JSON", session_id))?;
            client
                .set(session_id, payload, ttl_secs.map(Duration::from_secs))
                .await?;
            json!({"ok": true})
        }
        Command::Destroy { session_id } => {
            client.destroy(session_id).await?;
            json!({"ok": true})
        }
        Command::Touch {
            session_id,
            ttl_secs,
        } => {
            client
                .touch(session_id, ttl_secs.map(Duration::from_secs))
                .await?;
            json!({"ok": true})
        }
        Command::Length => json!(client.length().await?),
        Command::Clear => {
            client.clear().await?;
            json!({"ok": true})
        }
    };
    Ok(output)
}
