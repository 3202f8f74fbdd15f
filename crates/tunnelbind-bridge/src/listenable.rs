//! Tunnels that carry a pre-bound loopback listener
//!
//! Forwarding is declared only when the consumer asks for the listener.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};
use tunnelbind_engine::{Tunnel, TunnelBuilder, TunnelClass, TunnelOptions};

use crate::{BridgeError, BridgeResult};

#[cfg(unix)]
use std::os::fd::{AsFd, BorrowedFd};
#[cfg(windows)]
use std::os::windows::io::{AsSocket, BorrowedSocket};

/// Raw OS handle of a bridge listener
#[cfg(unix)]
pub type RawHandle<'a> = BorrowedFd<'a>;
#[cfg(windows)]
pub type RawHandle<'a> = BorrowedSocket<'a>;

/// Wraps a tunnel builder so its tunnels can carry a local bridge listener
#[derive(Debug)]
pub struct BridgingTunnelBuilder {
    inner: Box<dyn TunnelBuilder>,
}

impl BridgingTunnelBuilder {
    pub fn new(inner: Box<dyn TunnelBuilder>) -> Self {
        Self { inner }
    }

    pub fn class(&self) -> TunnelClass {
        self.inner.class()
    }

    pub fn options(&self) -> &TunnelOptions {
        self.inner.options()
    }

    pub fn options_mut(&mut self) -> &mut TunnelOptions {
        self.inner.options_mut()
    }

    /// Start the tunnel. With `bind`, also allocate a loopback listener on an
    /// OS-assigned port. No forwarding target is declared here.
    pub async fn listen(&self, bind: bool) -> BridgeResult<ListenableTunnel> {
        let tunnel = self.inner.listen().await?;

        let listener = if bind {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    let _ = tunnel.close().await;
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let local_addr = match &listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        if let Some(addr) = local_addr {
            debug!("Tunnel {} bridge listener bound to {}", tunnel.id(), addr);
        }

        Ok(ListenableTunnel {
            tunnel,
            listener,
            local_addr,
            prepared: AtomicBool::new(false),
        })
    }
}

impl From<Box<dyn TunnelBuilder>> for BridgingTunnelBuilder {
    fn from(inner: Box<dyn TunnelBuilder>) -> Self {
        Self::new(inner)
    }
}

/// A tunnel plus, optionally, a pre-bound loopback listener.
///
/// Forwarding to the listener is declared lazily, the first time the listener
/// is requested through [`handle`](Self::handle) or
/// [`into_listener`](Self::into_listener).
#[derive(Debug)]
pub struct ListenableTunnel {
    tunnel: Arc<dyn Tunnel>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    prepared: AtomicBool,
}

impl ListenableTunnel {
    pub fn tunnel(&self) -> &Arc<dyn Tunnel> {
        &self.tunnel
    }

    pub fn into_tunnel(self) -> Arc<dyn Tunnel> {
        self.tunnel
    }

    pub fn id(&self) -> String {
        self.tunnel.id()
    }

    pub fn url(&self) -> Option<String> {
        self.tunnel.url()
    }

    /// Address of the bridge listener, if one was bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::SeqCst)
    }

    /// Point the tunnel at the bridge listener. Only the first call forwards.
    pub fn prepare(&self) -> BridgeResult<()> {
        let addr = self
            .local_addr
            .ok_or_else(|| BridgeError::NoBridgeSocket(self.tunnel.id()))?;
        if self
            .prepared
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        if let Err(e) = self.tunnel.forward_tcp(&addr.to_string()) {
            self.prepared.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        info!("Tunnel {} forwarding to {}", self.tunnel.id(), addr);
        Ok(())
    }

    /// Raw descriptor of the bridge listener, for servers that adopt an
    /// existing socket. Turns forwarding on.
    pub fn handle(&self) -> BridgeResult<RawHandle<'_>> {
        self.prepare()?;
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| BridgeError::NoBridgeSocket(self.tunnel.id()))?;
        #[cfg(unix)]
        return Ok(listener.as_fd());
        #[cfg(windows)]
        return Ok(listener.as_socket());
    }

    /// Take ownership of the bridge listener. Turns forwarding on.
    pub fn into_listener(self) -> BridgeResult<(Arc<dyn Tunnel>, TcpListener)> {
        self.prepare()?;
        match self.listener {
            Some(listener) => Ok((self.tunnel, listener)),
            None => Err(BridgeError::NoBridgeSocket(self.tunnel.id())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tunnelbind_engine::{EngineError, EngineResult, ForwardTarget};

    #[derive(Debug, Default)]
    struct StubTunnel {
        forwards: Mutex<Vec<String>>,
        rejections: AtomicUsize,
    }

    #[async_trait]
    impl Tunnel for StubTunnel {
        fn id(&self) -> String {
            "tn_stub".to_string()
        }
        fn class(&self) -> TunnelClass {
            TunnelClass::Http
        }
        fn url(&self) -> Option<String> {
            None
        }
        fn forward_tcp(&self, addr: &str) -> EngineResult<()> {
            if self
                .rejections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EngineError::InvalidForward(addr.to_string()));
            }
            self.forwards.lock().unwrap().push(addr.to_string());
            Ok(())
        }
        fn forward_pipe(&self, _path: &Path) -> EngineResult<()> {
            unreachable!("listenable tunnels only forward over TCP")
        }
        fn forward_target(&self) -> Option<ForwardTarget> {
            self.forwards
                .lock()
                .unwrap()
                .last()
                .map(|a| ForwardTarget::Tcp(a.clone()))
        }
        async fn close(&self) -> EngineResult<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct StubBuilder {
        tunnel: Arc<StubTunnel>,
        options: TunnelOptions,
    }

    #[async_trait]
    impl TunnelBuilder for StubBuilder {
        fn class(&self) -> TunnelClass {
            TunnelClass::Http
        }
        fn options(&self) -> &TunnelOptions {
            &self.options
        }
        fn options_mut(&mut self) -> &mut TunnelOptions {
            &mut self.options
        }
        async fn listen(&self) -> EngineResult<Arc<dyn Tunnel>> {
            Ok(self.tunnel.clone())
        }
    }

    fn builder() -> (Arc<StubTunnel>, BridgingTunnelBuilder) {
        let tunnel = Arc::new(StubTunnel::default());
        let builder = BridgingTunnelBuilder::new(Box::new(StubBuilder {
            tunnel: tunnel.clone(),
            options: TunnelOptions::default(),
        }));
        (tunnel, builder)
    }

    #[tokio::test]
    async fn test_bind_defers_forwarding_until_handle() {
        let (stub, builder) = builder();
        let tunnel = builder.listen(true).await.unwrap();

        let addr = tunnel.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert!(stub.forwards.lock().unwrap().is_empty());

        tunnel.handle().unwrap();
        tunnel.handle().unwrap();
        assert_eq!(*stub.forwards.lock().unwrap(), vec![addr.to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_prepare_forwards_once() {
        let (stub, builder) = builder();
        let tunnel = builder.listen(true).await.unwrap();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| tunnel.prepare().unwrap());
            }
        });

        assert_eq!(stub.forwards.lock().unwrap().len(), 1);
        assert!(tunnel.is_prepared());
    }

    #[tokio::test]
    async fn test_failed_prepare_can_be_retried() {
        let (stub, builder) = builder();
        stub.rejections.store(1, Ordering::SeqCst);
        let tunnel = builder.listen(true).await.unwrap();

        assert!(matches!(tunnel.prepare(), Err(BridgeError::Engine(_))));
        assert!(!tunnel.is_prepared());

        tunnel.prepare().unwrap();
        assert!(tunnel.is_prepared());
        assert_eq!(stub.forwards.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_without_bind_has_no_handle() {
        let (stub, builder) = builder();
        let tunnel = builder.listen(false).await.unwrap();

        assert!(tunnel.local_addr().is_none());
        assert!(matches!(
            tunnel.prepare(),
            Err(BridgeError::NoBridgeSocket(_))
        ));
        assert!(stub.forwards.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_into_listener_accepts_forwarded_connections() {
        let (stub, builder) = builder();
        let tunnel = builder.listen(true).await.unwrap();
        let addr = tunnel.local_addr().unwrap();

        let (_tunnel, listener) = tunnel.into_listener().unwrap();
        assert_eq!(
            stub.forward_target(),
            Some(ForwardTarget::Tcp(addr.to_string()))
        );

        let connect = tokio::spawn(tokio::net::TcpStream::connect(addr));
        let (_, peer) = listener.accept().await.unwrap();
        assert!(peer.ip().is_loopback());
        connect.await.unwrap().unwrap();
    }
}
