use crate::address::TargetAddr;
use crate::commands::send_reply;
use crate::config::DnsConfig;
use crate::error::{ProtocolError, Socks5Error};
use crate::protocol::{MAX_DGRAM, ReplyCode};
use crate::resolver::Resolve;
use crate::server::Shared;
use crate::session::Session;
use anyhow::{Result, anyhow};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Client datagrams being forwarded at once; more are dropped
pub const MAX_PENDING_DATAGRAMS: usize = 256;

/// Datagram is a client datagram with its SOCKS5 UDP header taken apart
#[derive(Debug, PartialEq, Eq)]
pub struct Datagram<'a> {
    pub frag: u8,
    pub dest: TargetAddr,
    pub payload: &'a [u8],
}

/// parse_datagram splits a SOCKS5 UDP request into header fields and payload
pub fn parse_datagram(packet: &[u8]) -> Result<Datagram<'_>, ProtocolError> {
    // SOCKS5 UDP Request Header
    // +----+------+------+----------+----------+----------+
    // |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
    // +----+------+------+----------+----------+----------+
    // | 2  |  1   |  1   | Variable |    2     | Variable |
    // +----+------+------+----------+----------+----------+

    // Ensure we receive a valid packet
    if packet.len() < 4 {
        return Err(ProtocolError::Malformed("UDP packet too short".into()));
    }

    let frag = packet[2];

    // Address parsing starts at ATYP -> skip RSV and FRAG
    let (dest, used) = TargetAddr::parse_from_packet(&packet[3..])?;

    Ok(Datagram {
        frag,
        dest,
        payload: &packet[3 + used..],
    })
}

/// encode_datagram wraps a payload received from `from` for the client
pub fn encode_datagram(from: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut packet = BytesMut::with_capacity(22 + payload.len());

    // RSV -> 2 bytes, FRAG -> single byte
    packet.put_slice(&[0x00, 0x00, 0x00]);
    TargetAddr::Ip(from).write_to(&mut packet);
    packet.put_slice(payload);

    packet.to_vec()
}

/// handle_udp_associate opens the relay socket, tells the client where it
/// is, and relays datagrams until the control connection goes away
pub async fn handle_udp_associate(
    stream: &mut TcpStream,
    dest: SocketAddr,
    session: &Session,
    shared: &Shared,
) -> Result<(), Socks5Error> {
    // Bind UDP socket on SOCKS server, on the address the client reached us on
    let ip = shared.config.bind_ip.unwrap_or_else(|| session.local.ip());
    let socket = UdpSocket::bind(SocketAddr::new(ip, 0))
        .await
        .map_err(|source| Socks5Error::Setup {
            what: "UDP relay socket",
            source,
        })?;
    let relay_addr = socket.local_addr()?;

    // Send the successful reply with the bound UDP address
    send_reply(stream, ReplyCode::Succeeded, relay_addr).await?;

    // DEBUG
    info!("UDP relay started: server is listening on: {relay_addr}");

    let (responses, response_rx) = mpsc::unbounded_channel();
    let association = Arc::new(Association::new(
        Arc::clone(&shared.resolver),
        shared.config.dns.clone(),
        shared.config.bind_ip,
        session.cancel.child_token(),
        responses,
        MAX_PENDING_DATAGRAMS,
    ));

    let client = ClientFilter::new(session.peer.ip(), dest);
    let idle = shared.config.timeouts.udp_idle();

    let result = run(stream, socket, client, Arc::clone(&association), response_rx, idle).await;

    // Stops every outbound receive task
    association.cancel.cancel();

    info!("UDP relay on {relay_addr} closed");
    result.map_err(Socks5Error::Relay)
}

/// ClientFilter decides which datagrams on the relay socket come from the
/// client. The first admitted datagram pins the client's source address
#[derive(Debug, Clone)]
struct ClientFilter {
    ip: IpAddr,
    port: Option<u16>,
    pinned: Option<SocketAddr>,
}

impl ClientFilter {
    /// The client's IP must match the control connection; the port named in
    /// the request, if any, must match too
    fn new(peer_ip: IpAddr, requested: SocketAddr) -> Self {
        Self {
            ip: peer_ip,
            port: (requested.port() != 0).then_some(requested.port()),
            pinned: None,
        }
    }

    fn admit(&mut self, from: SocketAddr) -> bool {
        if let Some(pinned) = self.pinned {
            return from == pinned;
        }
        if from.ip() != self.ip || self.port.is_some_and(|port| port != from.port()) {
            return false;
        }
        self.pinned = Some(from);
        true
    }
}

/// Outbound is the socket one destination is reached through
struct Outbound {
    socket: Arc<UdpSocket>,
    last_activity: Instant,
    cancel: CancellationToken,
}

/// Association is the state shared between the relay loop and the tasks it spawns
struct Association {
    resolver: Arc<dyn Resolve>,
    dns: DnsConfig,
    bind_ip: Option<IpAddr>,
    /// Maps target address -> outbound socket
    outbound: RwLock<HashMap<SocketAddr, Outbound>>,
    cancel: CancellationToken,
    responses: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    /// Caps the forwarding tasks alive at once
    pending: Arc<Semaphore>,
}

/// run is the relay loop
async fn run(
    stream: &mut TcpStream,
    socket: UdpSocket,
    mut client: ClientFilter,
    association: Arc<Association>,
    mut response_rx: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    idle: Duration,
) -> io::Result<()> {
    // Instantiate UDP relay buffer
    let mut buffer = vec![0u8; MAX_DGRAM];
    let mut control = [0u8; 64];

    let mut sweep = tokio::time::interval(idle / 2);
    sweep.tick().await;

    loop {
        tokio::select! {
            // The association lives exactly as long as the TCP connection
            read = stream.read(&mut control) => {
                match read {
                    Ok(0) => {
                        info!("Client disconnected: terminating UDP association");
                        return Ok(());
                    }
                    Ok(_) => debug!("Unexpected data on TCP connection during UDP association"),
                    Err(e) => return Err(e),
                }
            }

            _ = association.cancel.cancelled() => return Ok(()),

            // Client -> server
            incoming = socket.recv_from(&mut buffer) => {
                let (len, from) = match incoming {
                    Ok(received) => received,
                    // ICMP errors surface here on some platforms
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                    Err(e) => {
                        error!("UDP receive error: {e}");
                        return Err(e);
                    }
                };

                if !client.admit(from) {
                    warn!("rejected UDP from unauthorized client: {from}");
                    continue;
                }

                let Some(permit) = association.try_pending() else {
                    debug!("too many datagrams in flight, dropped one from {from}");
                    continue;
                };

                let packet = buffer[..len].to_vec();
                let association = Arc::clone(&association);

                // Spawn task to handle datagram; resolving may take a while
                tokio::spawn(async move {
                    if let Err(e) = association.forward(&packet).await {
                        debug!("dropped datagram from {from}: {e}");
                    }
                    drop(permit);
                });
            }

            // Target -> Server -> Client
            Some((data, from)) = response_rx.recv() => {
                let Some(client_addr) = client.pinned else { continue };

                // Replies count as activity, even when the client is quiet
                association.touch(from).await;

                let response = encode_datagram(from, &data);
                if let Err(e) = socket.send_to(&response, client_addr).await {
                    error!("Error sending response to client {client_addr}: {e}");
                    continue;
                }

                debug!("Sent {} bytes from {from} to client {client_addr}", data.len());
            }

            // Clean up expired outbound sockets
            _ = sweep.tick() => association.expire(idle).await,
        }
    }
}

impl Association {
    fn new(
        resolver: Arc<dyn Resolve>,
        dns: DnsConfig,
        bind_ip: Option<IpAddr>,
        cancel: CancellationToken,
        responses: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
        max_pending: usize,
    ) -> Self {
        Self {
            resolver,
            dns,
            bind_ip,
            outbound: RwLock::new(HashMap::new()),
            cancel,
            responses,
            pending: Arc::new(Semaphore::new(max_pending)),
        }
    }

    /// try_pending reserves a forwarding slot, or None when all are taken
    fn try_pending(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.pending).try_acquire_owned().ok()
    }

    /// touch marks the outbound socket for `target` as active
    async fn touch(&self, target: SocketAddr) {
        if let Some(entry) = self.outbound.write().await.get_mut(&target) {
            entry.last_activity = Instant::now();
        }
    }

    /// forward unwraps a client datagram and sends the payload on
    async fn forward(&self, packet: &[u8]) -> Result<()> {
        let datagram = parse_datagram(packet)?;

        // Check for fragmentation
        if datagram.frag != 0 {
            return Err(anyhow!("UDP fragmentation not supported"));
        }

        let target = match &datagram.dest {
            TargetAddr::Ip(addr) => *addr,
            TargetAddr::Domain(host, _) => {
                let ip = self
                    .resolver
                    .resolve(host, self.dns.timeout(), self.dns.prefer)
                    .await?;
                datagram.dest.with_ip(ip)
            }
        };

        let socket = self.outbound_for(target).await?;
        socket.send_to(datagram.payload, target).await?;

        // Update last activity for socket
        self.touch(target).await;

        debug!("forwarded {} bytes -> {target}", datagram.payload.len());
        Ok(())
    }

    /// outbound_for returns the socket used for `target`, creating it and
    /// its receive task on first use
    async fn outbound_for(&self, target: SocketAddr) -> Result<Arc<UdpSocket>> {
        let mut outbound = self.outbound.write().await;

        if let Some(entry) = outbound.get(&target) {
            return Ok(Arc::clone(&entry.socket));
        }

        let local = match (self.bind_ip, target) {
            (Some(ip), _) if ip.is_ipv4() == target.is_ipv4() => SocketAddr::new(ip, 0),
            (_, SocketAddr::V4(_)) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            (_, SocketAddr::V6(_)) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        };
        let socket = Arc::new(UdpSocket::bind(local).await?);
        let cancel = self.cancel.child_token();

        // DEBUG
        info!("Created new UDP relay -> {target} (via {})", socket.local_addr()?);

        tokio::spawn(monitor_outbound_socket(
            Arc::clone(&socket),
            target,
            self.responses.clone(),
            cancel.clone(),
        ));

        outbound.insert(
            target,
            Outbound {
                socket: Arc::clone(&socket),
                last_activity: Instant::now(),
                cancel,
            },
        );

        Ok(socket)
    }

    /// expire drops outbound sockets idle for longer than `idle`
    async fn expire(&self, idle: Duration) {
        let now = Instant::now();
        let mut outbound = self.outbound.write().await;

        outbound.retain(|target, entry| {
            let keep = now.duration_since(entry.last_activity) <= idle;
            if !keep {
                entry.cancel.cancel();
                info!("Removed expired UDP relay -> {target}");
            }
            keep
        });
    }
}

/// monitor_outbound_socket passes datagrams from `target` back to the relay
/// loop until cancelled
async fn monitor_outbound_socket(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    responses: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    cancel: CancellationToken,
) {
    // Instantiate buffer
    let mut buffer = vec![0u8; MAX_DGRAM];

    loop {
        let received = tokio::select! {
            r = socket.recv_from(&mut buffer) => r,
            _ = cancel.cancelled() => break,
        };

        match received {
            Ok((len, from_addr)) => {
                // Verify response is from expected target
                if from_addr != target {
                    debug!("Unexpected response from {from_addr} (expected {target})");
                    continue;
                }

                // Send through channel to main loop
                if responses.send((buffer[..len].to_vec(), from_addr)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                error!("Error receiving from outbound socket: {e}");
                break;
            }
        }
    }

    // DEBUG
    debug!("Stopped monitoring socket for {target}");
}
