//! tunnelbind - expose a tunnel as an ordinary local listening socket
//!
//! This library ties the workspace crates together: it loads the engine once
//! per process, opens a default session from the environment, and binds local
//! servers to tunnels through the bridge.
//!
//! # Quick Start - listenable tunnel
//!
//! ```ignore
//! use tunnelbind_lib::listenable;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads TUNNELBIND_AUTHTOKEN
//!     let default = listenable().await?;
//!     println!("Tunnel URL: {:?}", default.tunnel.url());
//!
//!     // Taking the listener turns forwarding on
//!     let (_tunnel, listener) = default.tunnel.into_listener()?;
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         // serve stream
//!     }
//! }
//! ```
//!
//! # Quick Start - bind an existing server
//!
//! ```ignore
//! use tunnelbind_lib::{listen, BridgeStream, StreamServer};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = StreamServer::new(|mut stream: BridgeStream| async move {
//!     stream.write_all(b"hello\n").await
//! });
//!
//! // Domain socket in the working or temp directory, else loopback TCP
//! let bound = listen(&server, None).await?;
//! println!("Listening on {} via {}", bound.endpoint(), bound.strategy());
//! # Ok(())
//! # }
//! ```
//!
//! Ctrl+C closes every bound tunnel and socket. Applications that handle
//! interrupts themselves hold a claim from [`claim_interrupt`] instead.

pub mod config;
pub mod console;
pub mod engine;
pub mod session;

pub use config::SessionConfig;
pub use console::{console_log, console_log_with};
pub use engine::{engine, install_engine};
pub use session::{
    default_tunnel, default_tunnel_with, listen, listen_with, listenable, DefaultTunnel,
};

// Re-export engine contract
pub use tunnelbind_engine::{
    Engine, EngineError, ForwardTarget, LoadError, LogCallback, LogLevel, Platform, Session,
    SessionBuilder, Tunnel, TunnelBuilder, TunnelClass, TunnelOptions, AUTHTOKEN_ENV,
};

// Re-export bridge
pub use tunnelbind_bridge::lifecycle::{claim_interrupt, set_exit_on_interrupt};
pub use tunnelbind_bridge::{
    bind, BindOptions, BoundSocket, BridgeError, BridgeListener, BridgeStream, BridgingTunnelBuilder,
    CleanupMode, CleanupOutcome, CleanupRegistry, ConnectionHandler, Endpoint, InterruptClaim,
    ListenableTunnel, PipeDirs, Server, ServerSocket, Strategy, StreamServer,
};

// Re-export embedded engine
pub use tunnelbind_embedded::{EmbeddedConfig, EmbeddedEngine, EmbeddedLoader};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing authtoken: set TUNNELBIND_AUTHTOKEN in the environment")]
    MissingAuthtoken,

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

pub type Result<T> = std::result::Result<T, Error>;
