use crate::auth::{self, AuthPolicy, UserPass};
use crate::commands;
use crate::config::ServerConfig;
use crate::error::Socks5Error;
use crate::resolver::{self, Resolve};
use crate::session::Session;
use anyhow::{Result, anyhow, bail};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Shared is the read-only state every session is handed
pub struct Shared {
    pub config: ServerConfig,
    pub resolver: Arc<dyn Resolve>,
    pub auth: AuthPolicy,
}

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server {
    pub config: ServerConfig,
    resolver: Option<Arc<dyn Resolve>>,
    shutdown: CancellationToken,
    listener: Option<TcpListener>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self::from_config(ServerConfig {
            listen: listen_addr.into(),
            ..ServerConfig::default()
        })
    }

    /// from_config builds a server from a complete configuration
    pub fn from_config(config: ServerConfig) -> Self {
        Self {
            config,
            resolver: None,
            shutdown: CancellationToken::new(),
            listener: None,
        }
    }

    /// with_auth applies the desired authentication, replacing any
    /// configured users. `None` leaves the configuration untouched
    pub fn with_auth(mut self, auth: Option<UserPass>) -> Self {
        if let Some(user) = auth {
            self.config.auth.users = vec![user];
        }
        self
    }

    /// with_resolver overrides the resolver built from the DNS configuration
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn listen_addr(&self) -> &str {
        &self.config.listen
    }

    /// shutdown_token returns the token that stops the server. Cancelling it
    /// ends the accept loop and every open session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// bind to the listen address; a second call is an error
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("[ERR] server is already bound");
        }

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.config.listen).await?;
        let addr = listener.local_addr()?;

        // DEBUG
        info!("SOCKS5 proxy listening on {:?}", addr);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run handles server spinup and listens for incoming connections until
    /// the shutdown token fires
    pub async fn run(mut self) -> Result<()> {
        self.config.validate()?;

        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("[ERR] listener missing after bind"))?;

        let resolver = self
            .resolver
            .take()
            .unwrap_or_else(|| resolver::from_config(&self.config.dns));
        let auth = AuthPolicy::new(&self.config.auth.users, self.config.auth.required);

        if self.config.auth_enabled() {
            info!(users = self.config.auth.users.len(), "Authentication enabled");
        }

        let shared = Arc::new(Shared {
            config: self.config,
            resolver,
            auth,
        });

        let mut next_id = 0u64;

        // Listen for connections to proxy
        loop {
            // Accept incoming connection
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.cancelled() => {
                    info!("shutting down");
                    return Ok(());
                }
            };

            let (inbound, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
                Err(e) => {
                    self.shutdown.cancel();
                    return Err(anyhow!("[ERR] accept failed: {e}"));
                }
            };

            next_id += 1;
            let id = next_id;

            // Clone for this connection
            let shared = Arc::clone(&shared);
            let cancel = self.shutdown.child_token();

            // Spawn async task
            let span = info_span!("session", id, peer = %peer_addr);
            tokio::spawn(
                async move {
                    // DEBUG
                    info!("new client: {}", peer_addr);

                    handle_connection(inbound, id, peer_addr, cancel, &shared).await;
                }
                .instrument(span),
            );
        }
    }
}

/// Errors that leave the listener usable
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// handle_connection handles the full client/server SOCKS5 protocol flow and
/// logs how it ended
async fn handle_connection(
    stream: TcpStream,
    id: u64,
    peer: SocketAddr,
    cancel: CancellationToken,
    shared: &Shared,
) {
    let local = match stream.local_addr() {
        Ok(local) => local,
        Err(e) => {
            error!("connection error: {e}");
            return;
        }
    };

    let mut session = Session::new(id, peer, local, cancel);
    let result = serve(stream, &mut session, shared).await;
    let elapsed = session.elapsed();

    match result {
        Ok(()) => debug!(?elapsed, "session finished"),
        Err(e @ (Socks5Error::ClientClosed | Socks5Error::Cancelled)) => {
            debug!(?elapsed, "session ended: {e}")
        }
        Err(e @ (Socks5Error::Auth(_) | Socks5Error::Protocol(_) | Socks5Error::NotAllowed(_))) => {
            warn!("rejected client: {e}")
        }
        Err(e) => error!("connection error: {e}"),
    }
}

async fn serve(mut stream: TcpStream, session: &mut Session, shared: &Shared) -> Result<(), Socks5Error> {
    // Negotiate authentication with client
    let outcome = tokio::select! {
        outcome = auth::negotiate_auth(&mut stream, &shared.auth) => outcome?,
        _ = session.cancel.cancelled() => return Err(Socks5Error::Cancelled),
    };

    debug!(method = ?outcome.method, user = outcome.identity.as_deref(), "authenticated");
    session.authenticated(outcome);

    // Handle connection request from client
    commands::handle_socks_request(stream, session, shared).await
}
