//! Local bridging between tunnels and socket servers
//!
//! A tunnel delivers inbound traffic to a local forwarding target. This crate
//! makes that target an ordinary listening socket:
//!
//! - [`listenable`]: wrap a tunnel builder so the tunnel it produces carries a
//!   pre-bound loopback listener, and forwarding is only declared when the
//!   consumer asks for the listener's handle.
//! - [`selector`]: bind a [`Server`] for a tunnel, preferring a domain socket
//!   named after the tunnel and falling back to loopback TCP.
//! - [`lifecycle`]: close every bridged tunnel and socket when the process is
//!   interrupted, unless the application has claimed interrupt handling.
//!
//! In every path the local socket is listening before the tunnel is told to
//! forward to it.

pub mod lifecycle;
pub mod listenable;
pub mod selector;
pub mod server;

pub use lifecycle::{CleanupOutcome, CleanupRegistry, InterruptClaim};
pub use listenable::{BridgingTunnelBuilder, ListenableTunnel};
pub use selector::{bind, BindOptions, BoundSocket, CleanupMode, PipeDirs, Strategy};
pub use server::{
    BridgeListener, BridgeStream, ConnectionHandler, Endpoint, Server, ServerSocket, StreamServer,
};

use thiserror::Error;
use tunnelbind_engine::EngineError;

/// Bridge errors
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Errors from the engine are passed through unchanged
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("No writable directory for the tunnel socket (tried {0})")]
    NoWritableDir(String),

    #[error("Socket {0} is in use by another listener")]
    SocketInUse(String),

    #[error("{0} exists and is not a socket")]
    SocketPathOccupied(String),

    #[error("Pipe bridging is not supported on this platform")]
    PipesUnsupported,

    #[error("Tunnel {0} was created without a bridge socket")]
    NoBridgeSocket(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
