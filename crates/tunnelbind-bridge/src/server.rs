//! Listen/accept contract for servers the bridge can bind
//!
//! Pipe endpoints are Unix domain sockets on Unix platforms and named pipes
//! on Windows. Elsewhere only TCP endpoints can be bound.

use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(windows)]
use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

/// Where a server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Pipe(PathBuf),
}

impl Endpoint {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Endpoint::Pipe(path) => Some(path),
            Endpoint::Tcp(_) => None,
        }
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Tcp(addr) => Some(*addr),
            Endpoint::Pipe(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
            Endpoint::Pipe(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Anything that can be told to start listening on an endpoint
#[async_trait]
pub trait Server: Send + Sync {
    /// Start listening. The returned socket must already accept connections.
    async fn listen(&self, endpoint: &Endpoint) -> io::Result<Arc<dyn ServerSocket>>;
}

/// A listening socket produced by a [`Server`]
#[async_trait]
pub trait ServerSocket: Send + Sync + Debug {
    /// The endpoint actually bound (port 0 resolved to the assigned port)
    fn local_endpoint(&self) -> Endpoint;

    /// Stop accepting connections and release the endpoint. Idempotent.
    async fn close(&self) -> io::Result<()>;
}

/// A bound listener over TCP, a Unix domain socket or a named pipe
#[derive(Debug)]
pub enum BridgeListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
    /// The instance waiting for the next client
    #[cfg(windows)]
    NamedPipe {
        pending: tokio::sync::Mutex<NamedPipeServer>,
        path: PathBuf,
    },
}

impl BridgeListener {
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(BridgeListener::Tcp(TcpListener::bind(addr).await?)),
            #[cfg(unix)]
            Endpoint::Pipe(path) => {
                let listener = UnixListener::bind(path)?;
                Ok(BridgeListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(windows)]
            Endpoint::Pipe(path) => {
                let server = ServerOptions::new()
                    .first_pipe_instance(true)
                    .create(path)?;
                Ok(BridgeListener::NamedPipe {
                    pending: tokio::sync::Mutex::new(server),
                    path: path.clone(),
                })
            }
            #[cfg(not(any(unix, windows)))]
            Endpoint::Pipe(path) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("cannot listen on {}: domain sockets unsupported", path.display()),
            )),
        }
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> io::Result<BridgeStream> {
        match self {
            BridgeListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(BridgeStream::Tcp(stream))
            }
            #[cfg(unix)]
            BridgeListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(BridgeStream::Unix(stream))
            }
            #[cfg(windows)]
            BridgeListener::NamedPipe { pending, path } => {
                let mut pending = pending.lock().await;
                pending.connect().await?;
                // The next instance must exist before the connected one is handed out
                let next = ServerOptions::new().create(path)?;
                Ok(BridgeStream::NamedPipe(std::mem::replace(&mut *pending, next)))
            }
        }
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            BridgeListener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?)),
            #[cfg(unix)]
            BridgeListener::Unix { path, .. } => Ok(Endpoint::Pipe(path.clone())),
            #[cfg(windows)]
            BridgeListener::NamedPipe { path, .. } => Ok(Endpoint::Pipe(path.clone())),
        }
    }
}

/// A connection accepted by a [`BridgeListener`]
#[derive(Debug)]
pub enum BridgeStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(windows)]
    NamedPipe(NamedPipeServer),
}

impl AsyncRead for BridgeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BridgeStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            BridgeStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(windows)]
            BridgeStream::NamedPipe(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BridgeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BridgeStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            BridgeStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(windows)]
            BridgeStream::NamedPipe(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BridgeStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            BridgeStream::Unix(s) => Pin::new(s).poll_flush(cx),
            #[cfg(windows)]
            BridgeStream::NamedPipe(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BridgeStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            BridgeStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(windows)]
            BridgeStream::NamedPipe(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Serves one accepted connection
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: BridgeStream) -> io::Result<()>;
}

#[async_trait]
impl<F, Fut> ConnectionHandler for F
where
    F: Fn(BridgeStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    async fn handle(&self, stream: BridgeStream) -> io::Result<()> {
        (self)(stream).await
    }
}

/// A [`Server`] that spawns an accept loop and hands every connection to `H`
pub struct StreamServer<H> {
    handler: Arc<H>,
}

impl<H: ConnectionHandler> StreamServer<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H> Debug for StreamServer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamServer").finish_non_exhaustive()
    }
}

#[async_trait]
impl<H: ConnectionHandler> Server for StreamServer<H> {
    async fn listen(&self, endpoint: &Endpoint) -> io::Result<Arc<dyn ServerSocket>> {
        let listener = BridgeListener::bind(endpoint).await?;
        let local = listener.local_endpoint()?;
        debug!("Server listening on {}", local);

        let handler = self.handler.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(stream) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle(stream).await {
                                debug!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        });

        Ok(Arc::new(SpawnedSocket {
            endpoint: local,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Socket whose accept loop runs on a spawned task
#[derive(Debug)]
struct SpawnedSocket {
    endpoint: Endpoint,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SpawnedSocket {
    fn release(&self) -> io::Result<()> {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        // Named pipes vanish with their last handle; only socket files linger
        #[cfg(unix)]
        if let Endpoint::Pipe(path) = &self.endpoint {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ServerSocket for SpawnedSocket {
    fn local_endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing server socket {}", self.endpoint);
        self.release()
    }
}

impl Drop for SpawnedSocket {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo(mut stream: BridgeStream) -> io::Result<()> {
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await?;
        stream.write_all(&buf[..n]).await
    }

    #[tokio::test]
    async fn test_tcp_listen_resolves_port() {
        let server = StreamServer::new(echo);
        let socket = server
            .listen(&Endpoint::Tcp("127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();

        let addr = socket.local_endpoint().tcp_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        socket.close().await.unwrap();
        socket.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_removes_socket_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tun-close.sock");

        let server = StreamServer::new(echo);
        let socket = server.listen(&Endpoint::Pipe(path.clone())).await.unwrap();
        assert!(path.exists());
        assert_eq!(socket.local_endpoint().path(), Some(path.as_path()));

        socket.close().await.unwrap();
        assert!(!path.exists());
        socket.close().await.unwrap();
    }

    #[cfg(windows)]
    #[tokio::test]
    async fn test_named_pipe_accepts_successive_clients() {
        use tokio::net::windows::named_pipe::ClientOptions;

        let path = PathBuf::from(r"\\.\pipe\tun-server-test.sock");
        let server = StreamServer::new(echo);
        let socket = server.listen(&Endpoint::Pipe(path.clone())).await.unwrap();
        assert_eq!(socket.local_endpoint().path(), Some(path.as_path()));

        for payload in [b"one", b"two"] {
            let mut client = ClientOptions::new().open(&path).unwrap();
            client.write_all(payload).await.unwrap();
            let mut buf = [0u8; 3];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, payload);
        }

        socket.close().await.unwrap();
    }

    #[test]
    fn test_endpoint_display() {
        let tcp = Endpoint::Tcp("127.0.0.1:4000".parse().unwrap());
        assert_eq!(tcp.to_string(), "127.0.0.1:4000");
        assert!(tcp.path().is_none());

        let pipe = Endpoint::Pipe(PathBuf::from("/tmp/tun-a.sock"));
        assert_eq!(pipe.to_string(), "/tmp/tun-a.sock");
        assert!(pipe.tcp_addr().is_none());
    }
}
