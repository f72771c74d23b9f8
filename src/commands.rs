use crate::address::TargetAddr;
use crate::error::{ProtocolError, Socks5Error};
use crate::protocol::{Command, RSV, ReplyCode, Version};
use crate::server::Shared;
use crate::session::Session;
use crate::{bind, connect, udp};
use bytes::BufMut;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Request is a parsed SOCKS5 command frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub dest: TargetAddr,
}

/// read_request parses the request frame that follows authentication
pub async fn read_request<S>(stream: &mut S) -> Result<Request, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    // Instantiate a request buffer & read
    let mut reqbuf = [0u8; 3];
    stream.read_exact(&mut reqbuf).await?;

    let [version, command, rsv] = reqbuf;

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        return Err(ProtocolError::BadVersion(version).into());
    }

    if rsv != RSV {
        debug!("non-zero reserved byte in request: {rsv:#04x}");
    }

    // The address is consumed before the command is judged, so an
    // unknown ATYP is reported even when CMD is bad too
    let dest = TargetAddr::read_from(stream).await?;

    let command = Command::from_byte(command).ok_or(ProtocolError::CommandNotSupported(command))?;

    Ok(Request { command, dest })
}

/// handle_socks_request reads the client's request and routes it to the
/// matching command handler. Any failure that has a reply code is reported
/// to the client before returning
pub async fn handle_socks_request(
    mut stream: TcpStream,
    session: &Session,
    shared: &Shared,
) -> Result<(), Socks5Error> {
    let result = dispatch(&mut stream, session, shared).await;

    if let Err(e) = &result {
        if let Some(code) = e.reply_code() {
            // Best effort: the client may already be gone
            let _ = send_reply(&mut stream, code, unspecified()).await;
        }
    }

    result
}

async fn dispatch(stream: &mut TcpStream, session: &Session, shared: &Shared) -> Result<(), Socks5Error> {
    let request = read_request(stream).await?;

    // DEBUG
    info!(command = %request.command, target = %request.dest, "request");

    if !shared.config.rules.permits(request.command) {
        return Err(Socks5Error::NotAllowed(request.command));
    }

    let dest = resolve_dest(stream, session, shared, &request.dest).await?;

    // Check command and route
    match request.command {
        Command::Connect => connect::handle_connect(stream, dest, session, shared).await,
        Command::Bind => bind::handle_bind(stream, dest, session, shared).await,
        Command::UdpAssociate => udp::handle_udp_associate(stream, dest, session, shared).await,
    }
}

/// resolve_dest turns the request destination into a socket address,
/// consulting the resolver for domain names
async fn resolve_dest(
    stream: &TcpStream,
    session: &Session,
    shared: &Shared,
    dest: &TargetAddr,
) -> Result<SocketAddr, Socks5Error> {
    match dest {
        TargetAddr::Ip(addr) => Ok(*addr),
        TargetAddr::Domain(host, _) => {
            let dns = &shared.config.dns;
            let lookup = async {
                shared
                    .resolver
                    .resolve(host, dns.timeout(), dns.prefer)
                    .await
                    .map_err(Socks5Error::from)
            };
            let ip = session.guard(stream, lookup).await?;
            Ok(dest.with_ip(ip))
        }
    }
}

/// send_reply handles logic for sending replies from the SOCKS server to
/// the client
pub async fn send_reply<S>(stream: &mut S, reply_code: ReplyCode, bound_addr: SocketAddr) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    // Build initial reply vec
    let mut reply = Vec::with_capacity(22);
    reply.put_slice(&[Version::SOCKS5 as u8, reply_code as u8, RSV]);
    TargetAddr::Ip(bound_addr).write_to(&mut reply);

    // Write reply
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// unspecified is the BND address used in failure replies
pub fn unspecified() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
}
