//! A lightweight SOCKS5 proxy library
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT
//!     - BIND
//!     - UDP ASSOCIATE
//!     - No Authentication
//!     - Username/Password Authentication
//!     - Hostname resolution through the system or a configured DNS server
//!     - Per-command allow rules and TOML configuration
//!     - Half-close aware relaying with an idle bound on the remaining direction
//!     - Dedicated socket per client-target pair for UDP, with time-out based cleanup
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socksd::{Socks5Server, auth::UserPass};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Socks5Server::new("127.0.0.1:1080");
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod auth;
pub mod bind;
pub mod commands;
pub mod config;
pub mod connect;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod session;
pub mod udp;

// Re-export main types at crate root for convenience
pub use address::TargetAddr;
pub use auth::UserPass;
pub use config::ServerConfig;
pub use error::Socks5Error;
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use resolver::{Resolve, StaticResolver, SystemResolver, UpstreamResolver};
pub use server::Socks5Server;
