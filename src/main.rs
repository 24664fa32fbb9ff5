//! Crosswire - transport bridge between stdio and HTTP stream MCP peers.
//!
//! Two modes, chosen by flag:
//!
//! - `--url <SSE_URL>`: connecting mode. Stdin/stdout carry the caller;
//!   the remote stream endpoint is the tool.
//! - `--listen <ADDR> -- <command> [args...]`: listening mode. HTTP
//!   callers get an SSE stream each; every stream gets its own spawned
//!   tool process.
//!
//! All logs go to stderr, because stdout is the wire in connecting mode.

use std::net::SocketAddr;

use clap::{ArgGroup, Parser};
use tokio::sync::broadcast;
use tracing::{error, info};

use crosswire::config::BridgeConfig;
use crosswire::error::CrosswireError;
use crosswire::runner::BridgeRunner;
use crosswire::transport::sse_client::{self, SseClientConfig};
use crosswire::transport::sse_server::StreamServer;
use crosswire::transport::stdio::{self, ProcessLaunch};

/// Command line surface of the bridge.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["url", "listen"])))]
struct Cli {
    /// Remote stream endpoint to bridge stdin/stdout to, e.g. "http://127.0.0.1:8766/sse"
    #[arg(long, env = "CROSSWIRE_URL")]
    url: Option<String>,

    /// Address to serve the stream endpoint on, e.g. "127.0.0.1:8766"
    #[arg(long, env = "CROSSWIRE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Bearer token attached to every outgoing stream request
    #[arg(long, env = "CROSSWIRE_BEARER_TOKEN")]
    bearer_token: Option<String>,

    /// Extra allowed Origin value for the HTTP endpoints (repeatable)
    #[arg(long = "allow-origin", value_name = "ORIGIN")]
    allow_origin: Vec<String>,

    /// KEY=VALUE environment entry for the tool process (repeatable)
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Pass the parent environment through to the tool process
    #[arg(long)]
    pass_env: bool,

    /// Tool command and arguments for listening mode
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = BridgeConfig::from_env();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let shutdown_tx_sigint = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                let _ = shutdown_tx_sigint.send(());
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        let shutdown_tx_sigterm = shutdown_tx.clone();
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    let _ = shutdown_tx_sigterm.send(());
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    if let Some(url) = cli.url.clone() {
        run_connecting(url, cli.bearer_token, config, shutdown_tx).await?;
    } else if let Some(addr) = cli.listen {
        run_listening(addr, cli, config, shutdown_tx).await?;
    }

    Ok(())
}

/// Connecting mode: our stdio is the caller, the stream endpoint is the tool.
async fn run_connecting(
    url: String,
    bearer_token: Option<String>,
    config: BridgeConfig,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), CrosswireError> {
    info!(url = %url, "Crosswire starting in connecting mode");

    let client_config = SseClientConfig {
        url,
        bearer_token,
        connect_timeout: config.init_timeout,
        capacity: config.channel_capacity,
    };
    let upstream = sse_client::connect(&client_config).await?;
    let downstream = stdio::current_process(config.channel_capacity);

    let runner = BridgeRunner::new(config);
    let reason = runner
        .run(downstream, upstream, shutdown_tx.subscribe())
        .await?;
    info!(%reason, "bridge finished");
    Ok(())
}

/// Listening mode: serve stream callers, one spawned tool process each.
async fn run_listening(
    addr: SocketAddr,
    cli: Cli,
    config: BridgeConfig,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), CrosswireError> {
    let mut command = cli.command.into_iter();
    let program = command.next().ok_or_else(|| CrosswireError::ConfigError {
        details: "listening mode needs a tool command after the flags".to_string(),
    })?;

    let mut launch = ProcessLaunch::new(program);
    launch.args = command.collect();
    launch.env = cli.env.into_iter().collect();
    launch.pass_through_env = cli.pass_env;

    info!(
        addr = %addr,
        command = %launch.command,
        pass_env = launch.pass_through_env,
        "Crosswire starting in listening mode"
    );

    let server = StreamServer::bind(addr, config, launch, &cli.allow_origin, shutdown_tx).await?;
    server.serve().await
}
