use crate::commands::send_reply;
use crate::error::{BindError, Socks5Error};
use crate::protocol::ReplyCode;
use crate::relay::relay;
use crate::server::Shared;
use crate::session::Session;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// handle_bind implements passive-mode proxying: open a listener for the
/// client, announce it, wait for one inbound connection and relay it.
///
/// Two replies are sent on success, the first with the listening address
/// and the second with the address of the connecting peer
pub async fn handle_bind(
    stream: &mut TcpStream,
    dest: SocketAddr,
    session: &Session,
    shared: &Shared,
) -> Result<(), Socks5Error> {
    let timeouts = &shared.config.timeouts;

    // Listen on the address the client reached us on, unless told otherwise
    let ip = shared.config.bind_ip.unwrap_or_else(|| session.local.ip());
    let listener = TcpListener::bind(SocketAddr::new(ip, 0))
        .await
        .map_err(BindError::Io)?;
    let listen_addr = listener.local_addr().map_err(BindError::Io)?;

    // First reply: where the far end should connect
    send_reply(stream, ReplyCode::Succeeded, listen_addr).await?;

    // DEBUG
    info!(%listen_addr, expected = %dest, "BIND listening");

    let accept = accept_from(&listener, dest.ip(), timeouts.bind_accept());
    let (inbound, peer) = session.guard(stream, accept).await?;

    // Second reply: who connected
    send_reply(stream, ReplyCode::Succeeded, peer).await?;

    debug!(%peer, "BIND accepted");

    relay(stream, inbound, timeouts.relay_linger(), &session.cancel).await?;
    Ok(())
}

/// accept_from waits for a connection from `expected`, dropping connections
/// from other hosts. An unspecified `expected` accepts anyone
async fn accept_from(
    listener: &TcpListener,
    expected: IpAddr,
    timeout: Duration,
) -> Result<(TcpStream, SocketAddr), Socks5Error> {
    let accept = async {
        loop {
            let (inbound, peer) = listener.accept().await.map_err(BindError::Io)?;
            if expected.is_unspecified() || peer.ip() == expected {
                return Ok::<_, Socks5Error>((inbound, peer));
            }
            warn!(%peer, %expected, "rejected BIND connection from unexpected host");
        }
    };

    tokio::time::timeout(timeout, accept)
        .await
        .map_err(|_| BindError::Timeout(timeout))?
}
