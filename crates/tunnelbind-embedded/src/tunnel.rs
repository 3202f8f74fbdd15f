use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tunnelbind_engine::{
    EngineError, EngineResult, ForwardTarget, LogLevel, Tunnel, TunnelClass, TunnelOptions,
};
use uuid::Uuid;

use crate::{report, EmbeddedConfig};

const TARGET: &str = "tunnelbind_embedded::tunnel";

#[derive(Debug)]
struct TunnelState {
    id: String,
    forward: RwLock<Option<ForwardTarget>>,
    closed: AtomicBool,
}

/// A tunnel backed by a public TCP listener
#[derive(Debug)]
pub struct EmbeddedTunnel {
    class: TunnelClass,
    options: TunnelOptions,
    public_addr: SocketAddr,
    url: Option<String>,
    state: Arc<TunnelState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddedTunnel {
    pub(crate) async fn start(
        class: TunnelClass,
        options: TunnelOptions,
        config: &EmbeddedConfig,
    ) -> EngineResult<Arc<Self>> {
        let listener = TcpListener::bind((config.public_addr, 0))
            .await
            .map_err(|e| EngineError::ListenError(e.to_string()))?;
        let public_addr = listener.local_addr()?;

        let port = public_addr.port();
        let url = match class {
            TunnelClass::Http => Some(format!("http://{}:{}", config.hostname, port)),
            TunnelClass::Tcp => Some(format!("tcp://{}:{}", config.hostname, port)),
            TunnelClass::Tls => Some(format!("tls://{}:{}", config.hostname, port)),
            TunnelClass::Labeled => None,
        };

        let state = Arc::new(TunnelState {
            id: format!("tn_{}", Uuid::new_v4().simple()),
            forward: RwLock::new(None),
            closed: AtomicBool::new(false),
        });

        let task = tokio::spawn(accept_loop(listener, state.clone()));

        report(
            LogLevel::Info,
            TARGET,
            format!(
                "{} tunnel {} listening on {}",
                class, state.id, public_addr
            ),
        );

        Ok(Arc::new(Self {
            class,
            options,
            public_addr,
            url,
            state,
            task: Mutex::new(Some(task)),
        }))
    }

    /// Address remote peers connect to
    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn set_forward(&self, target: ForwardTarget) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed(self.state.id.clone()));
        }
        report(
            LogLevel::Debug,
            TARGET,
            format!("tunnel {} forwarding to {}", self.state.id, target),
        );
        *self.state.forward.write().unwrap_or_else(|e| e.into_inner()) = Some(target);
        Ok(())
    }
}

#[async_trait]
impl Tunnel for EmbeddedTunnel {
    fn id(&self) -> String {
        self.state.id.clone()
    }

    fn class(&self) -> TunnelClass {
        self.class
    }

    fn url(&self) -> Option<String> {
        self.url.clone()
    }

    fn forward_tcp(&self, addr: &str) -> EngineResult<()> {
        let addr = addr.trim();
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                self.set_forward(ForwardTarget::Tcp(addr.to_string()))
            }
            _ => Err(EngineError::InvalidForward(format!(
                "expected host:port, got {:?}",
                addr
            ))),
        }
    }

    fn forward_pipe(&self, path: &Path) -> EngineResult<()> {
        if path.as_os_str().is_empty() {
            return Err(EngineError::InvalidForward("empty pipe path".to_string()));
        }
        self.set_forward(ForwardTarget::Pipe(path.to_path_buf()))
    }

    fn forward_target(&self) -> Option<ForwardTarget> {
        self.state
            .forward
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn close(&self) -> EngineResult<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        report(
            LogLevel::Info,
            TARGET,
            format!("tunnel {} closed", self.state.id),
        );
        Ok(())
    }
}

impl Drop for EmbeddedTunnel {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<TunnelState>) {
    loop {
        match listener.accept().await {
            Ok((inbound, peer_addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = forward_connection(inbound, &state).await {
                        report(
                            LogLevel::Debug,
                            TARGET,
                            format!(
                                "tunnel {} connection from {} ended: {}",
                                state.id, peer_addr, e
                            ),
                        );
                    }
                });
            }
            Err(e) => {
                report(
                    LogLevel::Error,
                    TARGET,
                    format!("tunnel {} failed to accept connection: {}", state.id, e),
                );
            }
        }
    }
}

async fn forward_connection(mut inbound: TcpStream, state: &TunnelState) -> std::io::Result<()> {
    let target = state
        .forward
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    let (to_local, to_remote) = match target {
        None => {
            report(
                LogLevel::Warn,
                TARGET,
                format!(
                    "tunnel {} has no forwarding target, dropping connection",
                    state.id
                ),
            );
            return Ok(());
        }
        Some(ForwardTarget::Tcp(addr)) => {
            let mut local = TcpStream::connect(&addr).await?;
            tokio::io::copy_bidirectional(&mut inbound, &mut local).await?
        }
        #[cfg(unix)]
        Some(ForwardTarget::Pipe(path)) => {
            let mut local = tokio::net::UnixStream::connect(&path).await?;
            tokio::io::copy_bidirectional(&mut inbound, &mut local).await?
        }
        #[cfg(windows)]
        Some(ForwardTarget::Pipe(path)) => {
            let mut local = tokio::net::windows::named_pipe::ClientOptions::new().open(&path)?;
            tokio::io::copy_bidirectional(&mut inbound, &mut local).await?
        }
        #[cfg(not(any(unix, windows)))]
        Some(ForwardTarget::Pipe(path)) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("pipe forwarding to {} is not supported", path.display()),
            ));
        }
    };

    report(
        LogLevel::Trace,
        TARGET,
        format!(
            "tunnel {} connection complete: {} bytes to local, {} bytes to remote",
            state.id, to_local, to_remote
        ),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn tunnel(class: TunnelClass) -> Arc<EmbeddedTunnel> {
        EmbeddedTunnel::start(class, TunnelOptions::default(), &EmbeddedConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_url_follows_class() {
        let http = tunnel(TunnelClass::Http).await;
        let port = http.public_addr().port();
        assert_eq!(http.url(), Some(format!("http://localhost:{}", port)));
        assert!(http.id().starts_with("tn_"));

        let tcp = tunnel(TunnelClass::Tcp).await;
        assert!(tcp.url().unwrap().starts_with("tcp://"));
    }

    #[tokio::test]
    async fn test_last_forwarding_call_wins() {
        let t = tunnel(TunnelClass::Http).await;
        assert!(t.forward_target().is_none());

        t.forward_tcp("127.0.0.1:9000").unwrap();
        t.forward_pipe(Path::new("/tmp/tun-x.sock")).unwrap();
        assert_eq!(
            t.forward_target(),
            Some(ForwardTarget::Pipe("/tmp/tun-x.sock".into()))
        );
    }

    #[tokio::test]
    async fn test_rejects_malformed_tcp_target() {
        let t = tunnel(TunnelClass::Tcp).await;
        assert!(matches!(
            t.forward_tcp("no-port"),
            Err(EngineError::InvalidForward(_))
        ));
        assert!(matches!(
            t.forward_tcp(":8080"),
            Err(EngineError::InvalidForward(_))
        ));
        assert!(t.forward_target().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let t = tunnel(TunnelClass::Http).await;
        t.close().await.unwrap();
        t.close().await.unwrap();
        assert!(t.is_closed());
        assert!(matches!(
            t.forward_tcp("127.0.0.1:1"),
            Err(EngineError::Closed(_))
        ));
    }
}
