//! tunnelbind CLI - expose a built-in demo server through a tunnel
//!
//! Binds an echo or static-text server to a default tunnel and prints its
//! public URL. Ctrl+C closes the tunnel and the local socket.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunnelbind_lib::{
    console_log, listen_with, BindOptions, BridgeStream, Engine, LogLevel, Server,
    SessionConfig, StreamServer, TunnelClass,
};

/// tunnelbind - serve local connections from a public tunnel
#[derive(Parser, Debug)]
#[command(name = "tunnelbind")]
#[command(about = "tunnelbind - serve local connections from a public tunnel")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, env = "TUNNELBIND_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print engine events at or above this level (trace|debug|info|warn|error)
    #[arg(long, global = true)]
    engine_log: Option<LogLevel>,

    /// Tunnel class (http|tcp|tls)
    #[arg(long, global = true)]
    class: Option<TunnelClass>,

    /// Authentication token
    #[arg(long, global = true, env = "TUNNELBIND_AUTHTOKEN", hide_env_values = true)]
    authtoken: Option<String>,

    /// Bind loopback TCP only, skipping the domain socket
    #[arg(long, global = true)]
    tcp_only: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Echo every byte back to the sender
    #[command(long_about = r#"
Bind a TCP echo server to a tunnel. Every byte a remote client sends is
written back to it.

EXAMPLES:
  # Echo over a TCP tunnel
  tunnelbind --class tcp echo

  # Force the loopback TCP bridge
  tunnelbind --class tcp --tcp-only echo

ENVIRONMENT VARIABLES:
  TUNNELBIND_AUTHTOKEN   Authentication token
  TUNNELBIND_CONFIG      YAML configuration file
  TUNNELBIND_ENGINE_DIR  Directory holding installed engine packages
  RUST_LOG               Log filter
    "#)]
    Echo,

    /// Answer every request with a fixed HTTP response
    #[command(long_about = r#"
Bind a minimal HTTP responder to a tunnel. Every connection receives one
200 response carrying the given body.

EXAMPLES:
  # Serve a greeting over the default HTTP tunnel
  tunnelbind text --body "hello from tunnelbind"

  # Load the token and class from a file
  tunnelbind --config tunnelbind.yaml text --body ok

ENVIRONMENT VARIABLES:
  TUNNELBIND_AUTHTOKEN   Authentication token
  TUNNELBIND_CONFIG      YAML configuration file
  TUNNELBIND_ENGINE_DIR  Directory holding installed engine packages
  RUST_LOG               Log filter
    "#)]
    Text {
        /// Response body
        #[arg(long, default_value = "Hello from tunnelbind!\n")]
        body: String,
    },
}

/// Settings loadable from the configuration file. Flags take precedence.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    #[serde(flatten)]
    session: SessionConfig,
    log_level: Option<String>,
    engine_log: Option<String>,
    tcp_only: bool,
}

fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {:?}", path))
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn echo(stream: BridgeStream) -> std::io::Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    debug!("Echoed {} bytes", copied);
    Ok(())
}

fn http_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

async fn respond(mut stream: BridgeStream, response: Arc<String>) -> std::io::Result<()> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") && request.len() < 16 * 1024 {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
    }

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn serve(
    engine: &dyn Engine,
    config: &SessionConfig,
    server: &dyn Server,
    opts: &BindOptions,
) -> Result<()> {
    let bound = listen_with(engine, config, server, opts)
        .await
        .context("Failed to bind server to tunnel")?;

    let tunnel = bound.tunnel();
    info!("Tunnel {} ready ({} bridge)", tunnel.id(), bound.strategy());
    println!(
        "Forwarding {} -> {}",
        tunnel.url().unwrap_or_else(|| tunnel.id()),
        bound.endpoint()
    );

    std::future::pending::<()>().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => load_config(path)?,
        None => FileConfig::default(),
    };

    let log_level = cli
        .log_level
        .clone()
        .or(file.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&log_level);

    info!(
        "tunnelbind {} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let engine_log = match (cli.engine_log, &file.engine_log) {
        (Some(level), _) => Some(level),
        (None, Some(name)) => Some(
            name.parse::<LogLevel>()
                .map_err(anyhow::Error::msg)
                .context("Invalid engine_log in config file")?,
        ),
        (None, None) => None,
    };
    if engine_log.is_some() {
        console_log(engine_log).context("Failed to load tunnel engine")?;
    }

    let mut session = file.session;
    if let Some(token) = cli.authtoken {
        session.authtoken = Some(token);
    }
    if let Some(class) = cli.class {
        session.class = class;
    }

    let opts = BindOptions {
        prefer_pipe: !(cli.tcp_only || file.tcp_only),
        ..Default::default()
    };

    let engine = tunnelbind_lib::engine().context("Failed to load tunnel engine")?;
    info!("Using engine {}", engine.artifact());

    match cli.command {
        Commands::Echo => {
            let server = StreamServer::new(echo);
            serve(engine.as_ref(), &session, &server, &opts).await
        }
        Commands::Text { body } => {
            let response = Arc::new(http_response(&body));
            let server = StreamServer::new(move |stream: BridgeStream| {
                let response = response.clone();
                respond(stream, response)
            });
            serve(engine.as_ref(), &session, &server, &opts).await
        }
    }
}
