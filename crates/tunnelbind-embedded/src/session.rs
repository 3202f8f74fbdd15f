use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tunnelbind_engine::{
    EngineError, EngineResult, LogLevel, Session, Tunnel, TunnelBuilder, TunnelClass,
    TunnelOptions,
};
use uuid::Uuid;

use crate::tunnel::EmbeddedTunnel;
use crate::{report, EmbeddedConfig};

#[derive(Debug)]
struct SessionInner {
    id: String,
    config: EmbeddedConfig,
    metadata: Option<String>,
    tunnels: Mutex<Vec<Arc<EmbeddedTunnel>>>,
    closed: AtomicBool,
}

/// An embedded session; owns every tunnel created through its builders
#[derive(Debug)]
pub struct EmbeddedSession {
    inner: Arc<SessionInner>,
}

impl EmbeddedSession {
    pub(crate) fn new(config: EmbeddedConfig, metadata: Option<String>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: format!("ses_{}", Uuid::new_v4().simple()),
                config,
                metadata,
                tunnels: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn metadata(&self) -> Option<&str> {
        self.inner.metadata.as_deref()
    }

    /// Number of tunnels that have not been closed
    pub fn open_tunnels(&self) -> usize {
        let tunnels = self.inner.tunnels.lock().unwrap_or_else(|e| e.into_inner());
        tunnels.iter().filter(|t| !t.is_closed()).count()
    }
}

#[async_trait]
impl Session for EmbeddedSession {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn tunnel_builder(&self, class: TunnelClass) -> Box<dyn TunnelBuilder> {
        Box::new(EmbeddedTunnelBuilder {
            session: self.inner.clone(),
            class,
            options: TunnelOptions::default(),
        })
    }

    async fn close(&self) -> EngineResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tunnels: Vec<_> = {
            let mut tunnels = self.inner.tunnels.lock().unwrap_or_else(|e| e.into_inner());
            tunnels.drain(..).collect()
        };
        for tunnel in tunnels {
            tunnel.close().await?;
        }

        report(
            LogLevel::Info,
            "tunnelbind_embedded::session",
            format!("session closed: {}", self.inner.id),
        );
        Ok(())
    }
}

#[derive(Debug)]
pub struct EmbeddedTunnelBuilder {
    session: Arc<SessionInner>,
    class: TunnelClass,
    options: TunnelOptions,
}

#[async_trait]
impl TunnelBuilder for EmbeddedTunnelBuilder {
    fn class(&self) -> TunnelClass {
        self.class
    }

    fn options(&self) -> &TunnelOptions {
        &self.options
    }

    fn options_mut(&mut self) -> &mut TunnelOptions {
        &mut self.options
    }

    async fn listen(&self) -> EngineResult<Arc<dyn Tunnel>> {
        if self.session.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ConnectionError(format!(
                "session {} is closed",
                self.session.id
            )));
        }
        if self.class == TunnelClass::Labeled && self.options.labels.is_empty() {
            return Err(EngineError::ConfigurationError(
                "labeled tunnels require at least one label".to_string(),
            ));
        }

        let tunnel =
            EmbeddedTunnel::start(self.class, self.options.clone(), &self.session.config).await?;

        let mut tunnels = self.session.tunnels.lock().unwrap_or_else(|e| e.into_inner());
        tunnels.retain(|t| !t.is_closed());
        tunnels.push(tunnel.clone());
        drop(tunnels);

        Ok(tunnel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> EmbeddedSession {
        EmbeddedSession::new(EmbeddedConfig::default(), Some("meta".to_string()))
    }

    #[tokio::test]
    async fn test_labeled_tunnel_requires_label() {
        let session = session();
        let builder = session.tunnel_builder(TunnelClass::Labeled);
        assert!(matches!(
            builder.listen().await,
            Err(EngineError::ConfigurationError(_))
        ));

        let mut builder = session.tunnel_builder(TunnelClass::Labeled);
        builder.options_mut().label("edge", "edghts_1");
        let tunnel = builder.listen().await.unwrap();
        assert_eq!(tunnel.class(), TunnelClass::Labeled);
        assert!(tunnel.url().is_none());
    }

    #[tokio::test]
    async fn test_close_session_closes_tunnels() {
        let session = session();
        let dyn_session: &dyn Session = &session;
        let a = dyn_session.http_endpoint().listen().await.unwrap();
        let b = dyn_session.tcp_endpoint().listen().await.unwrap();
        assert_eq!(session.open_tunnels(), 2);
        assert_ne!(a.id(), b.id());

        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(matches!(
            a.forward_tcp("127.0.0.1:1"),
            Err(EngineError::Closed(_))
        ));
        assert!(session.tunnel_builder(TunnelClass::Http).listen().await.is_err());
    }

    #[tokio::test]
    async fn test_closed_tunnels_are_released_on_listen() {
        let session = session();
        let first = session.tunnel_builder(TunnelClass::Http).listen().await.unwrap();
        first.close().await.unwrap();

        let _second = session.tunnel_builder(TunnelClass::Tcp).listen().await.unwrap();
        let tracked = session.inner.tunnels.lock().unwrap();
        assert_eq!(tracked.len(), 1);
        assert!(!tracked[0].is_closed());
    }
}
