use crate::error::{ProtocolError, Socks5Error};
use crate::protocol::AddressType;
use bytes::{Buf, BufMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// TargetAddr is a SOCKS5 address: either a literal socket address
/// or a domain name still to be resolved, plus a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// address_type returns the ATYP byte this address is encoded with
    pub fn address_type(&self) -> AddressType {
        match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => AddressType::IPv4,
            TargetAddr::Ip(SocketAddr::V6(_)) => AddressType::IPv6,
            TargetAddr::Domain(..) => AddressType::DomainName,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// read_from parses ATYP, DST.ADDR and DST.PORT from a stream.
    ///
    /// The ATYP byte is read first; an unknown value stops parsing right
    /// there since the length of the address that follows is unknown
    pub async fn read_from<S>(stream: &mut S) -> Result<Self, Socks5Error>
    where
        S: AsyncRead + Unpin,
    {
        // Read address type byte from stream
        let atyp = stream.read_u8().await?;

        // Match type and extract address or domain name
        let addr = match AddressType::from_byte(atyp) {
            Some(AddressType::IPv4) => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;
                let port = stream.read_u16().await?;
                TargetAddr::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
            }
            Some(AddressType::DomainName) => {
                // First octet in DomainName contains the number of
                // octets to follow
                let len = stream.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                stream.read_exact(&mut domain).await?;
                let port = stream.read_u16().await?;
                TargetAddr::Domain(decode_domain(domain)?, port)
            }
            Some(AddressType::IPv6) => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;
                let port = stream.read_u16().await?;
                TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
            }
            None => return Err(ProtocolError::AddressTypeNotSupported(atyp).into()),
        };

        Ok(addr)
    }

    /// parse_from_packet parses ATYP, DST.ADDR and DST.PORT from the front
    /// of a datagram and returns the address with the number of bytes consumed
    pub fn parse_from_packet(packet: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let mut buf = packet;
        if !buf.has_remaining() {
            return Err(ProtocolError::Malformed("missing address type".into()));
        }
        let atyp = buf.get_u8();

        let addr = match AddressType::from_byte(atyp) {
            Some(AddressType::IPv4) => {
                ensure_len(buf, 6, "IPv4 address and port")?;
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                let port = buf.get_u16();
                TargetAddr::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
            }
            Some(AddressType::DomainName) => {
                ensure_len(buf, 1, "domain length")?;
                let len = buf.get_u8() as usize;
                ensure_len(buf, len + 2, "domain and port")?;
                let domain = buf[..len].to_vec();
                buf.advance(len);
                let port = buf.get_u16();
                TargetAddr::Domain(decode_domain(domain)?, port)
            }
            Some(AddressType::IPv6) => {
                ensure_len(buf, 18, "IPv6 address and port")?;
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                let port = buf.get_u16();
                TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
            }
            None => return Err(ProtocolError::AddressTypeNotSupported(atyp)),
        };

        Ok((addr, packet.len() - buf.len()))
    }

    /// write_to appends ATYP, ADDR and PORT in wire format
    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.address_type() as u8);
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => buf.put_slice(&addr.ip().octets()),
            TargetAddr::Ip(SocketAddr::V6(addr)) => buf.put_slice(&addr.ip().octets()),
            TargetAddr::Domain(domain, _) => {
                // Domains longer than a length byte can carry never get
                // here: they can only come from the wire
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
        buf.put_u16(self.port());
    }

    /// with_ip returns the socket address for this target once its host is known
    pub fn with_ip(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.port())
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

fn ensure_len(buf: &[u8], needed: usize, what: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        return Err(ProtocolError::Malformed(format!("not enough data for {what}")));
    }
    Ok(())
}

fn decode_domain(raw: Vec<u8>) -> Result<String, ProtocolError> {
    if raw.is_empty() {
        return Err(ProtocolError::Malformed("domain length cannot be 0".into()));
    }
    String::from_utf8(raw).map_err(|e| ProtocolError::Malformed(format!("invalid domain: {e}")))
}
