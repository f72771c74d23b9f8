use crate::error::{AuthError, ProtocolError, Socks5Error};
use crate::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// UserPass holds username/password credentials as dictated
/// server-side
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for UserPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPass")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// AuthPolicy is the server side of method selection: the credential store
/// and the methods it accepts, most preferred first
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    credentials: HashMap<Vec<u8>, Vec<u8>>,
    preferred: Vec<AuthMethod>,
}

impl AuthPolicy {
    /// no_auth accepts every client without credentials
    pub fn no_auth() -> Self {
        Self {
            credentials: HashMap::new(),
            preferred: vec![AuthMethod::NoAuth],
        }
    }

    /// new builds a policy from configured users. Without users only NO AUTH
    /// is offered; with users, NO AUTH stays acceptable unless `required`
    pub fn new(users: &[UserPass], required: bool) -> Self {
        if users.is_empty() {
            return Self::no_auth();
        }

        let credentials = users
            .iter()
            .map(|u| (u.username.as_bytes().to_vec(), u.password.as_bytes().to_vec()))
            .collect();

        let preferred = if required {
            vec![AuthMethod::UserPass]
        } else {
            vec![AuthMethod::UserPass, AuthMethod::NoAuth]
        };

        Self {
            credentials,
            preferred,
        }
    }

    /// select_method returns the first server-preferred method the client
    /// offered
    pub fn select_method(&self, client_methods: &[u8]) -> Option<AuthMethod> {
        self.preferred
            .iter()
            .copied()
            .find(|preferred| client_methods.contains(&(*preferred as u8)))
    }

    fn verify(&self, username: &[u8], password: &[u8]) -> bool {
        self.credentials
            .get(username)
            .is_some_and(|expected| expected.as_slice() == password)
    }
}

/// AuthOutcome is what the session remembers about a finished negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub method: AuthMethod,
    pub identity: Option<String>,
}

/// negotiate_auth handles authentication negotiation between the SOCKS server and client
pub async fn negotiate_auth<S>(stream: &mut S, policy: &AuthPolicy) -> Result<AuthOutcome, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+

    // Instantiate handshake buffer & read
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    // Parse version and client methods from handshake
    let version = buf[0];
    let n_methods = buf[1];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        return Err(ProtocolError::BadVersion(version).into());
    }

    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;

    // Retrieve desired method
    let selected = policy.select_method(&methods);

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    let method = selected.unwrap_or(AuthMethod::NoAcceptable);
    stream.write_all(&[Version::SOCKS5 as u8, method as u8]).await?;
    stream.flush().await?;

    // Route to appropriate auth handler
    match method {
        AuthMethod::UserPass => {
            let identity = authenticate_userpass(stream, policy).await?;
            Ok(AuthOutcome {
                method,
                identity: Some(identity),
            })
        }
        AuthMethod::NoAuth => Ok(AuthOutcome {
            method,
            identity: None,
        }),
        _ => {
            debug!(offered = ?methods, "no acceptable authentication method");
            Err(AuthError::NoAcceptableMethod.into())
        }
    }
}

/// authenticate_userpass handles username/password authentication according
/// to RFC 1929 and returns the authenticated username
async fn authenticate_userpass<S>(stream: &mut S, policy: &AuthPolicy) -> Result<String, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+

    // Get subnegotiation version -> 0x01 expected
    let ver = stream.read_u8().await?;
    if ver != USERPASS_VERSION {
        send_auth_status(stream, AuthStatus::Failure).await?;
        return Err(AuthError::BadSubnegotiationVersion(ver).into());
    }

    // Read username
    let username_len = stream.read_u8().await?;
    let mut username = vec![0u8; username_len as usize];
    stream.read_exact(&mut username).await?;

    // Read password
    let password_len = stream.read_u8().await?;
    let mut password = vec![0u8; password_len as usize];
    stream.read_exact(&mut password).await?;

    // Validate credentials
    let status = if policy.verify(&username, &password) {
        AuthStatus::Success
    } else {
        AuthStatus::Failure
    };

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    send_auth_status(stream, status).await?;

    match status {
        AuthStatus::Success => Ok(String::from_utf8_lossy(&username).into_owned()),
        AuthStatus::Failure => Err(AuthError::InvalidCredentials.into()),
    }
}

async fn send_auth_status<S>(stream: &mut S, status: AuthStatus) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[USERPASS_VERSION, status as u8]).await?;
    stream.flush().await?;
    Ok(())
}
