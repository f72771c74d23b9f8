mod common;

use common::*;
use socksd::UserPass;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

const CONNECT: u8 = 0x01;
const BIND: u8 = 0x02;
const UDP_ASSOCIATE: u8 = 0x03;

#[tokio::test]
async fn test_connect_ipv4_relays_until_eof() {
    let echo = spawn_tcp_echo().await;
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream.write_all(&request(CONNECT, echo)).await.unwrap();

    let (rep, bound) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x00);
    assert!(bound.ip().is_loopback());
    assert_ne!(bound.port(), 0);

    stream.write_all(b"hello through the proxy").await.unwrap();
    let mut echoed = [0u8; 23];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello through the proxy");

    // Half-close: the echo server sees EOF, closes, and we see EOF in turn
    stream.shutdown().await.unwrap();
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_connect_domain() {
    let echo = spawn_tcp_echo().await;
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream
        .write_all(&domain_request(CONNECT, "echo.test", echo.port()))
        .await
        .unwrap();

    let (rep, _) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x00);

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_unknown_host_is_host_unreachable() {
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream
        .write_all(&domain_request(CONNECT, "missing.test", 80))
        .await
        .unwrap();

    let (rep, bound) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x04);
    assert_eq!(bound, "0.0.0.0:0".parse::<std::net::SocketAddr>().unwrap());
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_resolution_timeout_replies_in_time() {
    let mut config = test_config();
    config.dns.timeout_secs = 1;
    let (proxy, _shutdown) = spawn_proxy(config, Arc::new(Stalled)).await;

    let mut stream = connect_no_auth(proxy).await;
    stream
        .write_all(&domain_request(CONNECT, "slow.test", 80))
        .await
        .unwrap();

    let started = Instant::now();
    let (rep, _) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x04);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_connection_refused() {
    let target = closed_port().await;
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream.write_all(&request(CONNECT, target)).await.unwrap();

    let (rep, _) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x05);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_unsupported_address_type() {
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream.write_all(&[0x05, CONNECT, 0x00, 0x05]).await.unwrap();

    let (rep, _) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x08);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_unsupported_command() {
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream
        .write_all(&request(0x09, "127.0.0.1:80".parse().unwrap()))
        .await
        .unwrap();

    let (rep, _) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x07);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_disabled_command_not_allowed() {
    let echo = spawn_tcp_echo().await;
    let mut config = test_config();
    config.rules.connect = false;
    let (proxy, _shutdown) = spawn_proxy(config, test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream.write_all(&request(CONNECT, echo)).await.unwrap();

    let (rep, _) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x02);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_no_acceptable_method() {
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    // GSSAPI only
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x01]).await.unwrap();

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0xFF]);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_bad_version_closes_without_reply() {
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
    assert_closed(&mut stream).await;
}

fn auth_config() -> socksd::ServerConfig {
    let mut config = test_config();
    config.auth.users = vec![UserPass {
        username: "alice".into(),
        password: "secret".into(),
    }];
    config
}

fn userpass_frame(username: &str, password: &str) -> Vec<u8> {
    let mut frame = vec![0x01, username.len() as u8];
    frame.extend_from_slice(username.as_bytes());
    frame.push(password.len() as u8);
    frame.extend_from_slice(password.as_bytes());
    frame
}

#[tokio::test]
async fn test_userpass_success() {
    let echo = spawn_tcp_echo().await;
    let (proxy, _shutdown) = spawn_proxy(auth_config(), test_resolver()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x02]);

    stream.write_all(&userpass_frame("alice", "secret")).await.unwrap();
    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await.unwrap();
    assert_eq!(status, [0x01, 0x00]);

    stream.write_all(&request(CONNECT, echo)).await.unwrap();
    let (rep, _) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x00);
}

#[tokio::test]
async fn test_userpass_failure() {
    let (proxy, _shutdown) = spawn_proxy(auth_config(), test_resolver()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x02]);

    stream.write_all(&userpass_frame("alice", "wrong")).await.unwrap();
    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await.unwrap();
    assert_eq!(status[0], 0x01);
    assert_ne!(status[1], 0x00);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_auth_required_rejects_no_auth() {
    let (proxy, _shutdown) = spawn_proxy(auth_config(), test_resolver()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0xFF]);
}

#[tokio::test]
async fn test_bind_accepts_expected_peer() {
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream
        .write_all(&request(BIND, "127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();

    let (rep, listening) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x00);
    assert!(listening.ip().is_loopback());

    let mut inbound = TcpStream::connect(listening).await.unwrap();

    let (rep, peer) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x00);
    assert_eq!(peer, inbound.local_addr().unwrap());

    inbound.write_all(b"from far end").await.unwrap();
    let mut received = [0u8; 12];
    stream.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"from far end");

    stream.write_all(b"back").await.unwrap();
    let mut received = [0u8; 4];
    inbound.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"back");
}

#[tokio::test]
async fn test_udp_associate_round_trip() {
    let echo = spawn_udp_echo().await;
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream
        .write_all(&request(UDP_ASSOCIATE, "0.0.0.0:0".parse().unwrap()))
        .await
        .unwrap();

    let (rep, relay) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x00);
    assert_ne!(relay.port(), 0);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // RSV RSV FRAG + destination, then the payload
    let mut datagram = vec![0x00, 0x00, 0x00];
    datagram.extend_from_slice(&request(0x00, echo)[3..]);
    datagram.extend_from_slice(b"over udp");
    client.send_to(&datagram, relay).await.unwrap();

    let mut buf = [0u8; 1024];
    let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, relay);

    let mut expected = vec![0x00, 0x00, 0x00];
    expected.extend_from_slice(&request(0x00, echo)[3..]);
    expected.extend_from_slice(b"over udp");
    assert_eq!(&buf[..n], &expected[..]);
}

#[tokio::test]
async fn test_udp_fragments_are_dropped() {
    let echo = spawn_udp_echo().await;
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream
        .write_all(&request(UDP_ASSOCIATE, "0.0.0.0:0".parse().unwrap()))
        .await
        .unwrap();
    let (_, relay) = read_reply(&mut stream).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut datagram = vec![0x00, 0x00, 0x01];
    datagram.extend_from_slice(&request(0x00, echo)[3..]);
    datagram.extend_from_slice(b"fragment");
    client.send_to(&datagram, relay).await.unwrap();

    let mut buf = [0u8; 1024];
    let received = tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(received.is_err(), "fragmented datagram was relayed");
}

#[tokio::test]
async fn test_connect_ipv6_reports_listener_family() {
    let Some(echo) = spawn_tcp_echo_on("[::1]:0").await else {
        // No IPv6 on this host
        return;
    };
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream.write_all(&request(CONNECT, echo)).await.unwrap();

    let (rep, bound) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x00);
    assert!(bound.is_ipv4(), "listener is IPv4, got {bound}");
    assert_ne!(bound.port(), 0);

    stream.write_all(b"v6").await.unwrap();
    let mut echoed = [0u8; 2];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"v6");
}

#[tokio::test]
async fn test_bind_timeout_replies_ttl_expired() {
    let mut config = test_config();
    config.timeouts.bind_accept_secs = 1;
    let (proxy, _shutdown) = spawn_proxy(config, test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream
        .write_all(&request(BIND, "127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();

    let (rep, _) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x00);

    // Nobody connects to the listener
    let started = Instant::now();
    let (rep, _) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x06);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_udp_domain_destination() {
    let echo = spawn_udp_echo().await;
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;
    let (_stream, relay) = associate(proxy).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&udp_domain_datagram("echo.test", echo.port(), b"by name"), relay)
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    // Replies carry the resolved address
    assert_eq!(&buf[..n], &udp_datagram(echo, b"by name")[..]);
}

#[tokio::test]
async fn test_udp_association_ends_with_control_connection() {
    let echo = spawn_udp_echo().await;
    let (proxy, _shutdown) = spawn_proxy(test_config(), test_resolver()).await;
    let (stream, relay) = associate(proxy).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 1024];

    client.send_to(&udp_datagram(echo, b"first"), relay).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    drop(stream);
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.send_to(&udp_datagram(echo, b"second"), relay).await.unwrap();
    let received = tokio::time::timeout(Duration::from_millis(500), client.recv_from(&mut buf)).await;
    assert!(!matches!(received, Ok(Ok(_))), "datagram relayed after TCP close");
}

#[tokio::test]
async fn test_udp_replies_keep_association_alive() {
    let streamer = spawn_udp_streamer(15, Duration::from_millis(200)).await;
    let mut config = test_config();
    config.timeouts.udp_idle_secs = 1;
    let (proxy, _shutdown) = spawn_proxy(config, test_resolver()).await;
    let (_stream, relay) = associate(proxy).await;

    // One datagram out, then the client stays quiet
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&udp_datagram(streamer, b"start"), relay).await.unwrap();

    let mut buf = [0u8; 1024];
    let mut received = 0;
    while let Ok(Ok(_)) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf)).await {
        received += 1;
    }
    assert_eq!(received, 15);
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let echo = spawn_tcp_echo().await;
    let (proxy, shutdown) = spawn_proxy(test_config(), test_resolver()).await;

    let mut stream = connect_no_auth(proxy).await;
    stream.write_all(&request(CONNECT, echo)).await.unwrap();
    let (rep, _) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x00);

    shutdown.cancel();
    assert_closed(&mut stream).await;
}
