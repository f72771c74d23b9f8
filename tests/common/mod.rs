//! Test utilities for socksd
//!
//! This module provides a running proxy, throwaway target servers and the
//! client half of the handshake used across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use socksd::error::ResolutionError;
use socksd::{Resolve, ServerConfig, Socks5Server, StaticResolver};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

/// A configuration listening on an ephemeral loopback port
pub fn test_config() -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    }
}

/// Resolver knowing `echo.test` as loopback
pub fn test_resolver() -> Arc<dyn Resolve> {
    Arc::new(StaticResolver::new().with_host("echo.test", vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]))
}

/// A resolver that never answers
pub struct Stalled;

#[async_trait]
impl Resolve for Stalled {
    async fn lookup(&self, _host: &str) -> Result<Vec<IpAddr>, ResolutionError> {
        std::future::pending().await
    }
}

/// Start a proxy and return its address plus the token that stops it
pub async fn spawn_proxy(config: ServerConfig, resolver: Arc<dyn Resolve>) -> (SocketAddr, CancellationToken) {
    let mut server = Socks5Server::from_config(config).with_resolver(resolver);
    let addr = server.bind().await.unwrap();
    let shutdown = server.shutdown_token();

    tokio::spawn(server.run());
    (addr, shutdown)
}

/// Start a TCP server that echoes every connection until EOF
pub async fn spawn_tcp_echo() -> SocketAddr {
    spawn_tcp_echo_on("127.0.0.1:0").await.unwrap()
}

/// Like `spawn_tcp_echo`, on a chosen address. None when it cannot be bound,
/// e.g. `[::1]` on a host without IPv6
pub async fn spawn_tcp_echo_on(bind: &str) -> Option<SocketAddr> {
    let listener = TcpListener::bind(bind).await.ok()?;
    let addr = listener.local_addr().ok()?;

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });

    Some(addr)
}

/// Start a UDP server that echoes every datagram back to its sender
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });

    addr
}

/// Start a UDP server that answers the first datagram it gets with `count`
/// replies spaced `every` apart, and never listens again
pub async fn spawn_udp_streamer(count: usize, every: std::time::Duration) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        let Ok((_, from)) = socket.recv_from(&mut buf).await else { return };
        for i in 0..count {
            let _ = socket.send_to(format!("tick {i}").as_bytes(), from).await;
            tokio::time::sleep(every).await;
        }
    });

    addr
}

/// Wrap a payload in a SOCKS5 UDP header for an IP destination
pub fn udp_datagram(dest: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut datagram = vec![0x00, 0x00, 0x00];
    datagram.extend_from_slice(&request(0x00, dest)[3..]);
    datagram.extend_from_slice(payload);
    datagram
}

/// Wrap a payload in a SOCKS5 UDP header for a domain destination
pub fn udp_domain_datagram(host: &str, port: u16, payload: &[u8]) -> Vec<u8> {
    let mut datagram = vec![0x00, 0x00, 0x00];
    datagram.extend_from_slice(&domain_request(0x00, host, port)[3..]);
    datagram.extend_from_slice(payload);
    datagram
}

/// Open a UDP association and return the control stream and relay address
pub async fn associate(proxy: SocketAddr) -> (TcpStream, SocketAddr) {
    let mut stream = connect_no_auth(proxy).await;
    stream
        .write_all(&request(0x03, "0.0.0.0:0".parse().unwrap()))
        .await
        .unwrap();

    let (rep, relay) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x00);
    (stream, relay)
}

/// An address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Connect and complete a NO AUTH method selection
pub async fn connect_no_auth(proxy: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    stream
}

/// Encode a request frame for an IP destination
pub fn request(command: u8, dest: SocketAddr) -> Vec<u8> {
    let mut frame = vec![0x05, command, 0x00];
    match dest {
        SocketAddr::V4(v4) => {
            frame.push(0x01);
            frame.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            frame.push(0x04);
            frame.extend_from_slice(&v6.ip().octets());
        }
    }
    frame.extend_from_slice(&dest.port().to_be_bytes());
    frame
}

/// Encode a request frame for a domain destination
pub fn domain_request(command: u8, host: &str, port: u16) -> Vec<u8> {
    let mut frame = vec![0x05, command, 0x00, 0x03, host.len() as u8];
    frame.extend_from_slice(host.as_bytes());
    frame.extend_from_slice(&port.to_be_bytes());
    frame
}

/// Read one reply frame, returning REP and BND.ADDR:BND.PORT
pub async fn read_reply(stream: &mut TcpStream) -> (u8, SocketAddr) {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0x05);
    assert_eq!(head[2], 0x00);

    let ip = match head[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await.unwrap();
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await.unwrap();
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => panic!("unexpected ATYP in reply: {other:#04x}"),
    };
    let port = stream.read_u16().await.unwrap();

    (head[1], SocketAddr::new(ip, port))
}

/// Assert the proxy closed the connection
pub async fn assert_closed(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    let read = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read_to_end(&mut rest)).await;
    match read {
        Ok(Ok(_)) => assert!(rest.is_empty(), "unexpected trailing bytes: {rest:?}"),
        // A reset also counts as closed
        Ok(Err(_)) => (),
        Err(_) => panic!("connection was not closed"),
    }
}
