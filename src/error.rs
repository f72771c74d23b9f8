//! Error types for socksd
//!
//! Every session-level failure is a [`Socks5Error`]. Whether the client is
//! told about it, and with which REP byte, is decided in one place:
//! [`Socks5Error::reply_code`].

use crate::protocol::{Command, ReplyCode};
use std::{io, net::SocketAddr};
use thiserror::Error;

/// Malformed or unsupported frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version: {0:#04x}")]
    BadVersion(u8),

    #[error("command not supported: {0:#04x}")]
    CommandNotSupported(u8),

    #[error("address type not supported: {0:#04x}")]
    AddressTypeNotSupported(u8),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Failures of the method selection or the username/password exchange
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid username/password sub-negotiation version: {0:#04x}")]
    BadSubnegotiationVersion(u8),
}

/// Name resolution failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("resolving {host} timed out")]
    Timeout { host: String },

    #[error("{host} resolved to no addresses")]
    NoAddress { host: String },

    #[error("failed to resolve {host}: {reason}")]
    Lookup { host: String, reason: String },
}

/// Outbound connection failures
#[derive(Error, Debug)]
pub enum DialError {
    #[error("connection to {0} refused")]
    Refused(SocketAddr),

    #[error("network unreachable for {0}")]
    NetworkUnreachable(SocketAddr),

    #[error("host {0} unreachable")]
    HostUnreachable(SocketAddr),

    #[error("connection to {0} not permitted")]
    NotAllowed(SocketAddr),

    #[error("connection to {0} timed out")]
    Timeout(SocketAddr),

    #[error("connection to {target} failed: {source}")]
    Other {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl DialError {
    /// from_io classifies a failed connect by its io::ErrorKind
    pub fn from_io(target: SocketAddr, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => DialError::Refused(target),
            io::ErrorKind::NetworkUnreachable => DialError::NetworkUnreachable(target),
            io::ErrorKind::HostUnreachable => DialError::HostUnreachable(target),
            io::ErrorKind::PermissionDenied => DialError::NotAllowed(target),
            io::ErrorKind::TimedOut => DialError::Timeout(target),
            _ => DialError::Other {
                target,
                source: err,
            },
        }
    }
}

/// BIND command failures
#[derive(Error, Debug)]
pub enum BindError {
    #[error("no inbound connection within {0:?}")]
    Timeout(std::time::Duration),

    #[error("bind listener failed: {0}")]
    Io(#[from] io::Error),
}

/// Session-level error
#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("relay failed: {0}")]
    Relay(#[source] io::Error),

    #[error("{0} not allowed by ruleset")]
    NotAllowed(Command),

    #[error("failed to set up {what}: {source}")]
    Setup {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("client closed the connection")]
    ClientClosed,

    #[error("session cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Socks5Error {
    /// reply_code returns the REP byte to send before closing the session,
    /// or None when the client must not (or cannot) receive a reply
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            Socks5Error::Protocol(ProtocolError::CommandNotSupported(_)) => {
                Some(ReplyCode::CommandNotSupported)
            }
            Socks5Error::Protocol(ProtocolError::AddressTypeNotSupported(_)) => {
                Some(ReplyCode::AddrTypeUnsupported)
            }
            Socks5Error::Protocol(_) => Some(ReplyCode::ServerFailure),
            Socks5Error::Resolution(_) => Some(ReplyCode::HostUnreachable),
            Socks5Error::Dial(e) => Some(match e {
                DialError::Refused(_) => ReplyCode::ConnectionRefused,
                DialError::NetworkUnreachable(_) => ReplyCode::NetworkUnreachable,
                DialError::HostUnreachable(_) | DialError::Timeout(_) => {
                    ReplyCode::HostUnreachable
                }
                DialError::NotAllowed(_) => ReplyCode::ConnectionNotAllowed,
                DialError::Other { .. } => ReplyCode::ServerFailure,
            }),
            Socks5Error::Bind(BindError::Timeout(_)) => Some(ReplyCode::TtlExpired),
            Socks5Error::Bind(BindError::Io(_)) => Some(ReplyCode::ServerFailure),
            Socks5Error::NotAllowed(_) => Some(ReplyCode::ConnectionNotAllowed),
            Socks5Error::Setup { .. } | Socks5Error::Cancelled => Some(ReplyCode::ServerFailure),
            Socks5Error::Auth(_)
            | Socks5Error::Relay(_)
            | Socks5Error::ClientClosed
            | Socks5Error::Io(_) => None,
        }
    }
}
