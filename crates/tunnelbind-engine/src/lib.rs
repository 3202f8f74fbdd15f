//! Engine capability contract
//!
//! The tunnel session protocol (authentication, multiplexing, forwarding
//! instructions) lives in a platform-specific engine artifact. This crate
//! defines the capability set the rest of the workspace consumes from that
//! engine, selects the artifact for the running platform, and owns the
//! process-wide logging-callback slot engines report into.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  session_builder()  ┌────────────────┐  connect()  ┌─────────┐
//! │    Engine    │ ──────────────────→ │ SessionBuilder │ ──────────→ │ Session │
//! └──────────────┘                     └────────────────┘             └─────────┘
//!                                                                         │
//!                                                   tunnel_builder(class) │
//!                                                                         ↓
//! ┌──────────────────────────────────────┐   listen()   ┌───────────────────┐
//! │ Tunnel: forward_tcp / forward_pipe   │ ←─────────── │   TunnelBuilder   │
//! └──────────────────────────────────────┘              └───────────────────┘
//! ```

pub mod loader;
pub mod logging;
pub mod platform;

pub use loader::{ArtifactLoader, ArtifactSource, EngineLoader, LoadError, ENGINE_DIR_ENV};
pub use logging::{LogCallback, LogLevel};
pub use platform::{Artifact, Libc, Platform};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Environment variable holding the default authentication credential
pub const AUTHTOKEN_ENV: &str = "TUNNELBIND_AUTHTOKEN";

/// Engine-level errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Missing authtoken: set TUNNELBIND_AUTHTOKEN or configure one explicitly")]
    MissingAuthtoken,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Listen error: {0}")]
    ListenError(String),

    #[error("Invalid forwarding target: {0}")]
    InvalidForward(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Tunnel {0} is closed")]
    Closed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Class of remote endpoint a tunnel builder produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TunnelClass {
    #[default]
    Http,
    Tcp,
    Tls,
    Labeled,
}

impl TunnelClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelClass::Http => "http",
            TunnelClass::Tcp => "tcp",
            TunnelClass::Tls => "tls",
            TunnelClass::Labeled => "labeled",
        }
    }
}

impl fmt::Display for TunnelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(TunnelClass::Http),
            "tcp" => Ok(TunnelClass::Tcp),
            "tls" => Ok(TunnelClass::Tls),
            "labeled" | "label" => Ok(TunnelClass::Labeled),
            other => Err(format!(
                "unknown tunnel class {other:?} (expected http|tcp|tls|labeled)"
            )),
        }
    }
}

/// Where a tunnel delivers inbound traffic locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardTarget {
    /// `host:port` of a TCP listener
    Tcp(String),
    /// Filesystem path of a domain socket (or named pipe)
    Pipe(PathBuf),
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardTarget::Tcp(addr) => write!(f, "tcp://{}", addr),
            ForwardTarget::Pipe(path) => write!(f, "pipe://{}", path.display()),
        }
    }
}

/// Settings shared by every tunnel builder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelOptions {
    /// Opaque metadata reported to the backend
    pub metadata: Option<String>,
    /// Human-readable description of the local destination
    pub forwards_to: Option<String>,
    /// Labels for label-addressed tunnels
    pub labels: BTreeMap<String, String>,
}

impl TunnelOptions {
    pub fn metadata(&mut self, metadata: impl Into<String>) -> &mut Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn forwards_to(&mut self, forwards_to: impl Into<String>) -> &mut Self {
        self.forwards_to = Some(forwards_to.into());
        self
    }

    pub fn label(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A loaded engine artifact
pub trait Engine: Send + Sync + Debug {
    /// Name of the artifact this engine was loaded from
    fn artifact(&self) -> &str;

    /// Create a new session builder
    fn session_builder(&self) -> Box<dyn SessionBuilder>;

    /// Install (or with `None`, remove) the process-wide logging callback
    fn logging_callback(&self, callback: Option<LogCallback>, level: LogLevel) {
        logging::set_callback(callback, level);
    }
}

/// Configures and establishes a session with the tunneling backend
#[async_trait]
pub trait SessionBuilder: Send + Sync + Debug {
    /// Use an explicit authentication credential
    fn authtoken(&mut self, token: String);

    /// Read the credential from [`AUTHTOKEN_ENV`], if present
    fn authtoken_from_env(&mut self) {
        if let Ok(token) = std::env::var(AUTHTOKEN_ENV) {
            self.authtoken(token);
        }
    }

    /// Opaque metadata reported to the backend
    fn metadata(&mut self, metadata: String);

    /// Connect and authenticate
    async fn connect(&self) -> EngineResult<Arc<dyn Session>>;
}

/// A live, authenticated connection to the tunneling backend
#[async_trait]
pub trait Session: Send + Sync + Debug {
    /// Stable session identifier
    fn id(&self) -> String;

    /// Obtain a tunnel builder for the given class
    fn tunnel_builder(&self, class: TunnelClass) -> Box<dyn TunnelBuilder>;

    /// Close the session and every tunnel it owns
    async fn close(&self) -> EngineResult<()>;
}

impl<'a> dyn Session + 'a {
    pub fn http_endpoint(&self) -> Box<dyn TunnelBuilder> {
        self.tunnel_builder(TunnelClass::Http)
    }

    pub fn tcp_endpoint(&self) -> Box<dyn TunnelBuilder> {
        self.tunnel_builder(TunnelClass::Tcp)
    }

    pub fn tls_endpoint(&self) -> Box<dyn TunnelBuilder> {
        self.tunnel_builder(TunnelClass::Tls)
    }

    pub fn labeled_tunnel(&self) -> Box<dyn TunnelBuilder> {
        self.tunnel_builder(TunnelClass::Labeled)
    }
}

/// Builds a tunnel of one class
#[async_trait]
pub trait TunnelBuilder: Send + Sync + Debug {
    fn class(&self) -> TunnelClass;

    fn options(&self) -> &TunnelOptions;

    fn options_mut(&mut self) -> &mut TunnelOptions;

    /// Ask the backend to start listening. Inbound traffic cannot be delivered
    /// until a forwarding target is declared on the returned tunnel.
    async fn listen(&self) -> EngineResult<Arc<dyn Tunnel>>;
}

/// A remote-routable endpoint whose traffic is delivered to a local target
#[async_trait]
pub trait Tunnel: Send + Sync + Debug {
    /// Stable, non-empty identifier
    fn id(&self) -> String;

    fn class(&self) -> TunnelClass;

    /// Public URL, if the tunnel class has one
    fn url(&self) -> Option<String>;

    /// Deliver inbound traffic to a TCP address. Replaces any earlier target.
    fn forward_tcp(&self, addr: &str) -> EngineResult<()>;

    /// Deliver inbound traffic to a domain socket. Replaces any earlier target.
    fn forward_pipe(&self, path: &Path) -> EngineResult<()>;

    /// The currently declared forwarding target
    fn forward_target(&self) -> Option<ForwardTarget>;

    /// Stop the tunnel. Closing twice is not an error.
    async fn close(&self) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_class_round_trips_names() {
        for class in [
            TunnelClass::Http,
            TunnelClass::Tcp,
            TunnelClass::Tls,
            TunnelClass::Labeled,
        ] {
            assert_eq!(class.as_str().parse::<TunnelClass>().unwrap(), class);
        }
        assert_eq!(" HTTP ".parse::<TunnelClass>().unwrap(), TunnelClass::Http);
        assert!("udp".parse::<TunnelClass>().is_err());
    }

    #[test]
    fn test_default_class_is_http() {
        assert_eq!(TunnelClass::default(), TunnelClass::Http);
    }

    #[test]
    fn test_forward_target_display() {
        assert_eq!(
            ForwardTarget::Tcp("127.0.0.1:8080".to_string()).to_string(),
            "tcp://127.0.0.1:8080"
        );
        assert_eq!(
            ForwardTarget::Pipe(PathBuf::from("/tmp/tun-1.sock")).to_string(),
            "pipe:///tmp/tun-1.sock"
        );
    }

    #[test]
    fn test_tunnel_options_builder() {
        let mut opts = TunnelOptions::default();
        opts.metadata("meta")
            .forwards_to("my app")
            .label("edge", "edghts_123");

        assert_eq!(opts.metadata.as_deref(), Some("meta"));
        assert_eq!(opts.forwards_to.as_deref(), Some("my app"));
        assert_eq!(opts.labels.get("edge").map(String::as_str), Some("edghts_123"));
    }

    #[test]
    fn test_missing_authtoken_names_variable() {
        let err = EngineError::MissingAuthtoken.to_string();
        assert!(err.contains(AUTHTOKEN_ENV));
    }
}
