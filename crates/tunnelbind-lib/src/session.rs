use std::sync::Arc;
use tracing::{debug, info};
use tunnelbind_bridge::{
    bind, lifecycle, BindOptions, BoundSocket, BridgingTunnelBuilder, ListenableTunnel, Server,
};
use tunnelbind_engine::{Engine, Session, Tunnel};

use crate::config::SessionConfig;
use crate::engine::engine;
use crate::Result;

/// A tunnel on a freshly connected session
#[derive(Debug)]
pub struct DefaultTunnel {
    pub tunnel: ListenableTunnel,
    /// The session that owns `tunnel`
    pub session: Arc<dyn Session>,
}

/// Connect a session with the credential from the environment and open an
/// HTTP tunnel on it. With `bind`, the tunnel carries a bridge listener.
pub async fn default_tunnel(bind: bool) -> Result<DefaultTunnel> {
    let engine = engine()?;
    let config = SessionConfig::from_env()?;
    default_tunnel_with(engine.as_ref(), &config, bind).await
}

pub async fn default_tunnel_with(
    engine: &dyn Engine,
    config: &SessionConfig,
    bind: bool,
) -> Result<DefaultTunnel> {
    let mut builder = engine.session_builder();
    match &config.authtoken {
        Some(token) => builder.authtoken(token.clone()),
        None => builder.authtoken_from_env(),
    }
    if let Some(metadata) = &config.metadata {
        builder.metadata(metadata.clone());
    }

    let session = builder.connect().await?;
    let tunnel = match BridgingTunnelBuilder::new(session.tunnel_builder(config.class))
        .listen(bind)
        .await
    {
        Ok(tunnel) => tunnel,
        Err(e) => {
            let _ = session.close().await;
            return Err(e.into());
        }
    };

    info!(
        "Started {} tunnel {} on session {}",
        config.class,
        tunnel.id(),
        session.id()
    );
    if let Some(url) = tunnel.url() {
        info!("Tunnel URL: {}", url);
    }

    Ok(DefaultTunnel { tunnel, session })
}

/// A default tunnel with a bridge listener, ready to hand to a server
pub async fn listenable() -> Result<DefaultTunnel> {
    default_tunnel(true).await
}

/// Bind `server` to `tunnel`, or to a new default tunnel when none is given.
pub async fn listen(server: &dyn Server, tunnel: Option<Arc<dyn Tunnel>>) -> Result<BoundSocket> {
    let opts = BindOptions::default();
    match tunnel {
        Some(tunnel) => Ok(bind(server, tunnel, &opts).await?),
        None => {
            let engine = engine()?;
            let config = SessionConfig::from_env()?;
            lifecycle::global().set_logging_engine(engine.clone());
            listen_with(engine.as_ref(), &config, server, &opts).await
        }
    }
}

/// Open a default tunnel on `engine` and bind `server` to it.
///
/// The tunnel is created without a bridge listener; the server's own socket
/// becomes the forwarding target. The session is attached to the result.
pub async fn listen_with(
    engine: &dyn Engine,
    config: &SessionConfig,
    server: &dyn Server,
    opts: &BindOptions,
) -> Result<BoundSocket> {
    let DefaultTunnel { tunnel, session } = default_tunnel_with(engine, config, false).await?;

    match bind(server, tunnel.into_tunnel(), opts).await {
        Ok(bound) => Ok(bound.with_session(session)),
        Err(e) => {
            debug!("Closing session {} after bind failure", session.id());
            let _ = session.close().await;
            Err(e.into())
        }
    }
}
