use crate::auth::AuthOutcome;
use crate::error::Socks5Error;
use crate::protocol::AuthMethod;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Session is the per-connection state, owned by the task serving the client
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub method: Option<AuthMethod>,
    pub identity: Option<String>,
    pub cancel: CancellationToken,
    started: Instant,
}

impl Session {
    pub fn new(id: u64, peer: SocketAddr, local: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            id,
            peer,
            local,
            method: None,
            identity: None,
            cancel,
            started: Instant::now(),
        }
    }

    /// authenticated records the outcome of auth negotiation
    pub fn authenticated(&mut self, outcome: AuthOutcome) {
        self.method = Some(outcome.method);
        self.identity = outcome.identity;
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// guard runs `work` until it finishes, the client hangs up or the
    /// session is cancelled, whichever comes first.
    ///
    /// `work` must not read from `client`; the guard peeks at it to notice
    /// a hang-up
    pub async fn guard<T, F>(&self, client: &TcpStream, work: F) -> Result<T, Socks5Error>
    where
        F: Future<Output = Result<T, Socks5Error>>,
    {
        tokio::select! {
            result = work => result,
            _ = client_closed(client) => Err(Socks5Error::ClientClosed),
            _ = self.cancel.cancelled() => Err(Socks5Error::Cancelled),
        }
    }
}

/// client_closed resolves once the peer has closed its write side (or the
/// socket failed). Pending data means the client is still there, in which
/// case this never resolves
pub async fn client_closed(stream: &TcpStream) {
    let mut peeked = [0u8; 1];
    match stream.peek(&mut peeked).await {
        Ok(0) | Err(_) => (),
        Ok(_) => std::future::pending().await,
    }
}
