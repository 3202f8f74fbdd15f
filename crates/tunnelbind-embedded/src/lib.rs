//! In-process tunnel engine
//!
//! A statically linked engine that satisfies the [`tunnelbind_engine`]
//! capability contract without a remote backend: every tunnel is a public TCP
//! listener whose inbound connections are proxied to the tunnel's current
//! forwarding target (a TCP address or a Unix domain socket).
//!
//! It is the default [`ArtifactLoader`](tunnelbind_engine::ArtifactLoader)
//! used by `tunnelbind-lib`, and the engine the integration tests run against.

mod engine;
mod loader;
mod session;
mod tunnel;

pub use engine::{EmbeddedEngine, EmbeddedSessionBuilder};
pub use loader::EmbeddedLoader;
pub use session::{EmbeddedSession, EmbeddedTunnelBuilder};
pub use tunnel::EmbeddedTunnel;

use std::net::{IpAddr, Ipv4Addr};
use tunnelbind_engine::{logging, LogLevel};

/// Embedded engine configuration
#[derive(Debug, Clone)]
pub struct EmbeddedConfig {
    /// Address public tunnel listeners bind to
    pub public_addr: IpAddr,
    /// Host name used when building tunnel URLs
    pub hostname: String,
    /// When set, only these credentials are accepted by `connect()`
    pub accepted_authtokens: Option<Vec<String>>,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            public_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            hostname: "localhost".to_string(),
            accepted_authtokens: None,
        }
    }
}

/// Log through `tracing` and the process-wide engine callback
pub(crate) fn report(level: LogLevel, target: &'static str, message: String) {
    match level {
        LogLevel::Trace => tracing::trace!("{}", message),
        LogLevel::Debug => tracing::debug!("{}", message),
        LogLevel::Info => tracing::info!("{}", message),
        LogLevel::Warn => tracing::warn!("{}", message),
        LogLevel::Error => tracing::error!("{}", message),
    }
    logging::emit(level, target, &message);
}
