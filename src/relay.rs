//! Bidirectional relay between the client and the far end of a CONNECT or
//! BIND.
//!
//! Each direction is its own copy loop holding at most one chunk. When a
//! direction reaches EOF it half-closes the opposite write side and
//! stops; the other direction keeps going for as long as data flows but is
//! ended after `linger` of silence. An I/O error in either direction stops
//! both.

use crate::error::Socks5Error;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Size of the single in-flight chunk per direction
pub const RELAY_BUFFER: usize = 8 * 1024;

/// RelayStats counts the bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub from_client: u64,
    pub from_remote: u64,
}

/// relay copies between `client` and `remote` until both directions have
/// finished, then drops (closes) both endpoints.
///
/// `cancel` ends the relay from outside, e.g. on server shutdown.
pub async fn relay<C, R>(
    client: C,
    remote: R,
    linger: Duration,
    cancel: &CancellationToken,
) -> Result<RelayStats, Socks5Error>
where
    C: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (remote_rd, remote_wr) = tokio::io::split(remote);

    // Aborts both directions: fired on error or by the session
    let abort = cancel.child_token();
    let upstream_done = CancellationToken::new();
    let downstream_done = CancellationToken::new();

    let upstream = pipe(
        client_rd,
        remote_wr,
        Direction {
            done: &upstream_done,
            peer_done: &downstream_done,
            abort: &abort,
            linger,
        },
    );
    let downstream = pipe(
        remote_rd,
        client_wr,
        Direction {
            done: &downstream_done,
            peer_done: &upstream_done,
            abort: &abort,
            linger,
        },
    );

    let (from_client, from_remote) = tokio::join!(upstream, downstream);

    // Report the first failure, counting whatever made it across
    let stats = RelayStats {
        from_client: *from_client.as_ref().unwrap_or(&0),
        from_remote: *from_remote.as_ref().unwrap_or(&0),
    };
    if let Err(e) = from_client.and(from_remote) {
        debug!(?stats, "relay aborted: {e}");
        return Err(Socks5Error::Relay(e));
    }

    // DEBUG
    info!(
        "connection closed: {} bytes from client, {} bytes from server",
        stats.from_client, stats.from_remote
    );

    Ok(stats)
}

struct Direction<'a> {
    /// Fired by this direction when it stops
    done: &'a CancellationToken,
    /// Fired by the opposite direction when it stops
    peer_done: &'a CancellationToken,
    abort: &'a CancellationToken,
    linger: Duration,
}

/// pipe copies one direction; returns the number of bytes written
async fn pipe<Rd, Wr>(mut reader: Rd, mut writer: Wr, dir: Direction<'_>) -> io::Result<u64>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    let mut total = 0u64;

    let result = loop {
        let read = tokio::select! {
            r = reader.read(&mut buf) => r,
            _ = dir.abort.cancelled() => break Ok(total),
            _ = lingered(dir.peer_done, dir.linger) => {
                debug!("half-closed relay idle for {:?}, closing", dir.linger);
                break Ok(total);
            }
        };

        let n = match read {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) => break Err(e),
        };

        let write = tokio::select! {
            w = writer.write_all(&buf[..n]) => w,
            _ = dir.abort.cancelled() => break Ok(total),
        };
        if let Err(e) = write {
            break Err(e);
        }
        total += n as u64;
    };

    match &result {
        // Half-close: the far side sees EOF while the other direction
        // may still be talking
        Ok(_) => {
            let _ = writer.shutdown().await;
        }
        Err(_) => dir.abort.cancel(),
    }
    dir.done.cancel();

    result
}

/// lingered resolves `linger` after the opposite direction has stopped.
/// It is re-armed on every read, so it measures idleness
async fn lingered(peer_done: &CancellationToken, linger: Duration) {
    peer_done.cancelled().await;
    tokio::time::sleep(linger).await;
}
