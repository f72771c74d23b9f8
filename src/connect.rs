use crate::commands::send_reply;
use crate::error::{DialError, Socks5Error};
use crate::protocol::ReplyCode;
use crate::relay::relay;
use crate::server::Shared;
use crate::session::Session;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

/// handle_connect dials the destination, reports the outbound socket's
/// local address to the client and relays until either side is done
pub async fn handle_connect(
    stream: &mut TcpStream,
    dest: SocketAddr,
    session: &Session,
    shared: &Shared,
) -> Result<(), Socks5Error> {
    let timeouts = &shared.config.timeouts;

    // Connect to target
    let dial = dial(dest, shared.config.bind_ip, timeouts.connect());
    let outbound = session.guard(stream, dial).await?;

    // Send OK reply
    let bound = reported_bound(outbound.local_addr()?, session.local);
    send_reply(stream, ReplyCode::Succeeded, bound).await?;

    debug!(%dest, %bound, "connected");

    relay(stream, outbound, timeouts.relay_linger(), &session.cancel).await?;
    Ok(())
}

/// reported_bound is the BND address for a CONNECT reply: the outbound
/// socket's local address, kept in the family of the listener the client
/// reached us on
fn reported_bound(outbound: SocketAddr, listener: SocketAddr) -> SocketAddr {
    if outbound.is_ipv4() == listener.is_ipv4() {
        return outbound;
    }

    let ip = match listener {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, outbound.port())
}

/// dial opens a TCP connection within `timeout`, optionally from a fixed
/// local IP
pub async fn dial(
    dest: SocketAddr,
    bind_ip: Option<IpAddr>,
    timeout: Duration,
) -> Result<TcpStream, Socks5Error> {
    let connect = connect_from(dest, bind_ip);

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(outbound)) => Ok(outbound),
        Ok(Err(e)) => Err(DialError::from_io(dest, e).into()),
        Err(_) => Err(DialError::Timeout(dest).into()),
    }
}

async fn connect_from(dest: SocketAddr, bind_ip: Option<IpAddr>) -> io::Result<TcpStream> {
    match bind_ip {
        // Only bind when the families agree; a v4 bind IP cannot reach
        // a v6 destination
        Some(ip) if ip.is_ipv4() == dest.is_ipv4() => {
            let socket = if dest.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(ip, 0))?;
            socket.connect(dest).await
        }
        _ => TcpStream::connect(dest).await,
    }
}
