//! End-to-end forwarding through the embedded engine
//!
//! A client connecting to the tunnel's public address must reach whatever
//! local target was declared last.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tunnelbind_embedded::EmbeddedEngine;
use tunnelbind_engine::{Engine, Session, Tunnel, TunnelClass};

async fn open_tunnel(class: TunnelClass) -> (Arc<dyn Session>, Arc<dyn Tunnel>) {
    let engine = EmbeddedEngine::new("test");
    let mut builder = engine.session_builder();
    builder.authtoken("token".to_string());
    let session = builder.connect().await.unwrap();
    let tunnel = session.tunnel_builder(class).listen().await.unwrap();
    (session, tunnel)
}

fn public_addr(tunnel: &Arc<dyn Tunnel>) -> std::net::SocketAddr {
    let url = tunnel.url().unwrap();
    let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();
    std::net::SocketAddr::from(([127, 0, 0, 1], port))
}

async fn echo_once<S>(mut stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    stream.write_all(&buf[..n]).await.unwrap();
}

async fn round_trip(addr: std::net::SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("forwarded reply timed out")
        .unwrap();
    buf
}

#[tokio::test]
async fn test_forwards_to_tcp_target() {
    let (_session, tunnel) = open_tunnel(TunnelClass::Tcp).await;

    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();
    tunnel.forward_tcp(&local_addr.to_string()).unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = local.accept().await.unwrap();
        echo_once(stream).await;
    });

    let reply = round_trip(public_addr(&tunnel), b"hello tcp").await;
    assert_eq!(reply, b"hello tcp");
    server.await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_forwards_to_unix_socket_target() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("tun-test.sock");

    let (_session, tunnel) = open_tunnel(TunnelClass::Http).await;

    let local = tokio::net::UnixListener::bind(&path).unwrap();
    tunnel.forward_pipe(&path).unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = local.accept().await.unwrap();
        echo_once(stream).await;
    });

    let reply = round_trip(public_addr(&tunnel), b"hello pipe").await;
    assert_eq!(reply, b"hello pipe");
    server.await.unwrap();
}

#[cfg(windows)]
#[tokio::test]
async fn test_forwards_to_named_pipe_target() {
    use tokio::net::windows::named_pipe::ServerOptions;

    let (_session, tunnel) = open_tunnel(TunnelClass::Http).await;
    let path = std::path::PathBuf::from(format!(r"\\.\pipe\tun-{}.sock", tunnel.id()));

    let local = ServerOptions::new()
        .first_pipe_instance(true)
        .create(&path)
        .unwrap();
    tunnel.forward_pipe(&path).unwrap();

    let server = tokio::spawn(async move {
        local.connect().await.unwrap();
        echo_once(local).await;
    });

    let reply = round_trip(public_addr(&tunnel), b"hello named pipe").await;
    assert_eq!(reply, b"hello named pipe");
    server.await.unwrap();
}

#[tokio::test]
async fn test_connection_without_target_is_dropped() {
    let (_session, tunnel) = open_tunnel(TunnelClass::Tcp).await;

    let mut client = TcpStream::connect(public_addr(&tunnel)).await.unwrap();
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("dropped connection should reach EOF")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_tls_tunnel_closes_cleanly() {
    let engine = EmbeddedEngine::new("test");
    let mut builder = engine.session_builder();
    builder.authtoken("token".to_string());
    builder.metadata("integration".to_string());
    let session = builder.connect().await.unwrap();

    let tunnel = session.tunnel_builder(TunnelClass::Tls).listen().await.unwrap();
    assert!(tunnel.url().unwrap().starts_with("tls://localhost:"));

    tunnel.close().await.unwrap();
    session.close().await.unwrap();
}
