//! Transport selection for a server bound to a tunnel
//!
//! The pipe strategy binds a socket named `tun-<tunnel id>.sock` in the first
//! writable directory of (working directory, temp directory), or the named
//! pipe of that name on Windows. The TCP strategy binds loopback TCP on an
//! OS-assigned port. The pipe is attempted first; any failure there falls
//! back to TCP, and a TCP failure is returned to the caller.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tunnelbind_engine::{Session, Tunnel};

use crate::lifecycle::{self, CleanupRegistry};
use crate::server::{Endpoint, Server, ServerSocket};
use crate::{BridgeError, BridgeResult};

/// Transport chosen between the tunnel and the local server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Pipe,
    Tcp,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Pipe => f.write_str("pipe"),
            Strategy::Tcp => f.write_str("tcp"),
        }
    }
}

/// File name of the domain socket for a tunnel
pub fn socket_name(tunnel_id: &str) -> String {
    format!("tun-{}.sock", tunnel_id)
}

/// Full socket path for a tunnel inside `dir`
#[cfg(not(windows))]
pub fn socket_path(dir: &Path, tunnel_id: &str) -> PathBuf {
    dir.join(socket_name(tunnel_id))
}

/// Named pipes live in their own namespace; `dir` is ignored
#[cfg(windows)]
pub fn socket_path(_dir: &Path, tunnel_id: &str) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\{}", socket_name(tunnel_id)))
}

/// Candidate directories for the tunnel socket, in order of preference
#[derive(Debug, Clone)]
pub struct PipeDirs {
    pub cwd: Option<PathBuf>,
    pub tmp: PathBuf,
}

impl PipeDirs {
    pub fn new(cwd: Option<PathBuf>, tmp: impl Into<PathBuf>) -> Self {
        Self {
            cwd,
            tmp: tmp.into(),
        }
    }

    /// The process working directory and the system temp directory
    pub fn from_env() -> Self {
        Self {
            cwd: std::env::current_dir().ok(),
            tmp: std::env::temp_dir(),
        }
    }

    /// First writable candidate, as an absolute path
    pub fn select(&self) -> BridgeResult<PathBuf> {
        let candidates = self.cwd.iter().chain(std::iter::once(&self.tmp));
        let mut tried = Vec::new();

        for dir in candidates {
            if is_writable(dir) {
                return Ok(absolute(dir)?);
            }
            debug!("Cannot write to: {}", dir.display());
            tried.push(dir.display().to_string());
        }

        Err(BridgeError::NoWritableDir(tried.join(", ")))
    }
}

impl Default for PipeDirs {
    fn default() -> Self {
        Self::from_env()
    }
}

fn is_writable(dir: &Path) -> bool {
    tempfile::Builder::new()
        .prefix(".tunnelbind-")
        .tempfile_in(dir)
        .is_ok()
}

fn absolute(dir: &Path) -> io::Result<PathBuf> {
    if dir.is_absolute() {
        Ok(dir.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(dir))
    }
}

/// Which registry, if any, tracks the bound pair for interrupt cleanup
#[derive(Debug, Clone, Default)]
pub enum CleanupMode {
    /// The process-wide registry
    #[default]
    Global,
    Registry(Arc<CleanupRegistry>),
    Disabled,
}

#[derive(Debug, Clone)]
pub struct BindOptions {
    pub dirs: PipeDirs,
    /// Attempt the domain socket strategy before TCP
    pub prefer_pipe: bool,
    /// Address used by the TCP strategy
    pub loopback: IpAddr,
    pub cleanup: CleanupMode,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            dirs: PipeDirs::from_env(),
            prefer_pipe: true,
            loopback: IpAddr::V4(Ipv4Addr::LOCALHOST),
            cleanup: CleanupMode::Global,
        }
    }
}

/// A server socket bound for a tunnel
#[derive(Debug)]
pub struct BoundSocket {
    socket: Arc<dyn ServerSocket>,
    tunnel: Arc<dyn Tunnel>,
    strategy: Strategy,
    session: Option<Arc<dyn Session>>,
}

impl BoundSocket {
    pub fn socket(&self) -> &Arc<dyn ServerSocket> {
        &self.socket
    }

    pub fn tunnel(&self) -> &Arc<dyn Tunnel> {
        &self.tunnel
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn endpoint(&self) -> Endpoint {
        self.socket.local_endpoint()
    }

    /// Socket file path when the pipe strategy was used
    pub fn path(&self) -> Option<PathBuf> {
        match self.socket.local_endpoint() {
            Endpoint::Pipe(path) => Some(path),
            Endpoint::Tcp(_) => None,
        }
    }

    /// Attach the session that owns the tunnel
    pub fn with_session(mut self, session: Arc<dyn Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn session(&self) -> Option<&Arc<dyn Session>> {
        self.session.as_ref()
    }

    /// Close the tunnel and the socket. Both are attempted.
    pub async fn close(&self) -> BridgeResult<()> {
        let tunnel = self.tunnel.close().await;
        let socket = self.socket.close().await;
        tunnel?;
        socket?;
        Ok(())
    }
}

/// Bind `server` locally and point `tunnel` at it.
///
/// The socket is always listening before the tunnel's forwarding target is
/// declared. The resulting pair is registered for interrupt cleanup according
/// to `opts.cleanup`.
pub async fn bind(
    server: &dyn Server,
    tunnel: Arc<dyn Tunnel>,
    opts: &BindOptions,
) -> BridgeResult<BoundSocket> {
    let (socket, strategy) = if opts.prefer_pipe {
        match link_pipe(server, tunnel.as_ref(), &opts.dirs).await {
            Ok(socket) => (socket, Strategy::Pipe),
            Err(err) => {
                debug!("Using TCP socket: {}", err);
                (
                    link_tcp(server, tunnel.as_ref(), opts.loopback).await?,
                    Strategy::Tcp,
                )
            }
        }
    } else {
        (
            link_tcp(server, tunnel.as_ref(), opts.loopback).await?,
            Strategy::Tcp,
        )
    };

    match &opts.cleanup {
        CleanupMode::Global => lifecycle::global().register(tunnel.clone(), socket.clone()),
        CleanupMode::Registry(registry) => registry.register(tunnel.clone(), socket.clone()),
        CleanupMode::Disabled => {}
    }

    info!(
        "Tunnel {} bridged over {} at {}",
        tunnel.id(),
        strategy,
        socket.local_endpoint()
    );

    Ok(BoundSocket {
        socket,
        tunnel,
        strategy,
        session: None,
    })
}

#[cfg(any(unix, windows))]
async fn link_pipe(
    server: &dyn Server,
    tunnel: &dyn Tunnel,
    dirs: &PipeDirs,
) -> BridgeResult<Arc<dyn ServerSocket>> {
    let path = socket_path(&dirs.select()?, &tunnel.id());
    remove_stale(&path).await?;

    let socket = server.listen(&Endpoint::Pipe(path.clone())).await?;
    restrict_to_owner(&path);

    if let Err(e) = tunnel.forward_pipe(&path) {
        let _ = socket.close().await;
        return Err(e.into());
    }

    Ok(socket)
}

#[cfg(not(any(unix, windows)))]
async fn link_pipe(
    _server: &dyn Server,
    _tunnel: &dyn Tunnel,
    _dirs: &PipeDirs,
) -> BridgeResult<Arc<dyn ServerSocket>> {
    Err(BridgeError::PipesUnsupported)
}

/// Clear the way for a new socket at `path`.
///
/// Only a socket nobody answers on is removed. A live socket or any other
/// kind of file is left alone and reported as an error.
#[cfg(unix)]
async fn remove_stale(path: &Path) -> BridgeResult<()> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !metadata.file_type().is_socket() {
        return Err(BridgeError::SocketPathOccupied(path.display().to_string()));
    }

    match tokio::net::UnixStream::connect(path).await {
        Ok(_) => Err(BridgeError::SocketInUse(path.display().to_string())),
        Err(_) => {
            std::fs::remove_file(path)?;
            debug!("Removed stale socket {}", path.display());
            Ok(())
        }
    }
}

/// Named pipes leave nothing behind; a live one makes the bind fail
#[cfg(windows)]
async fn remove_stale(_path: &Path) -> BridgeResult<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)) {
        warn!("Cannot change permissions of {}: {}", path.display(), e);
    }
}

#[cfg(windows)]
fn restrict_to_owner(_path: &Path) {}

async fn link_tcp(
    server: &dyn Server,
    tunnel: &dyn Tunnel,
    loopback: IpAddr,
) -> BridgeResult<Arc<dyn ServerSocket>> {
    let socket = server
        .listen(&Endpoint::Tcp(SocketAddr::new(loopback, 0)))
        .await?;

    let addr = match socket.local_endpoint() {
        Endpoint::Tcp(addr) => addr,
        other => {
            let _ = socket.close().await;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("server bound {} when asked for a TCP endpoint", other),
            )
            .into());
        }
    };

    if let Err(e) = tunnel.forward_tcp(&addr.to_string()) {
        let _ = socket.close().await;
        return Err(e.into());
    }

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_name() {
        assert_eq!(socket_name("tn_abc"), "tun-tn_abc.sock");
    }

    #[cfg(unix)]
    #[test]
    fn test_socket_path_joins_dir() {
        assert_eq!(
            socket_path(Path::new("/run/app"), "tn_1"),
            PathBuf::from("/run/app/tun-tn_1.sock")
        );
    }

    #[cfg(windows)]
    #[test]
    fn test_socket_path_uses_pipe_namespace() {
        assert_eq!(
            socket_path(Path::new(r"C:\work"), "tn_1"),
            PathBuf::from(r"\\.\pipe\tun-tn_1.sock")
        );
    }

    #[test]
    fn test_select_prefers_cwd() {
        let cwd = tempfile::TempDir::new().unwrap();
        let tmp = tempfile::TempDir::new().unwrap();
        let dirs = PipeDirs::new(Some(cwd.path().to_path_buf()), tmp.path());
        assert_eq!(dirs.select().unwrap(), cwd.path());
    }

    #[test]
    fn test_select_falls_back_to_tmp() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dirs = PipeDirs::new(Some(tmp.path().join("missing")), tmp.path());
        assert_eq!(dirs.select().unwrap(), tmp.path());
    }

    #[test]
    fn test_select_fails_without_writable_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dirs = PipeDirs::new(None, tmp.path().join("missing"));
        assert!(matches!(dirs.select(), Err(BridgeError::NoWritableDir(_))));
    }

    #[test]
    fn test_writability_check_leaves_no_files() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(is_writable(dir.path()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
