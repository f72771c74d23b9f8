use anyhow::{Result, bail};
use clap::Parser;
use socksd::{ServerConfig, Socks5Server, auth::UserPass};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "A lightweight SOCKS5 proxy", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listener address [default: 127.0.0.1:1080]
    #[arg(short, long)]
    listen: Option<String>,

    /// Username for SOCKS5 proxy
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS5 proxy
    #[arg(short, long)]
    password: Option<String>,

    /// Upstream DNS server (ip:port) used instead of the system resolver
    #[arg(short, long)]
    dns: Option<SocketAddr>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber; RUST_LOG wins over --verbose
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(upstream) = args.dns {
        config.dns.upstream = Some(upstream);
    }

    // Check for auth and grab it if present
    let auth = match (args.username, args.password) {
        (Some(u), Some(p)) => Some(UserPass {
            username: u,
            password: p,
        }),
        (None, None) => None,
        _ => bail!("[ERR] must provide both username and password (or neither)"),
    };

    // Instantiate server
    let server = Socks5Server::from_config(config).with_auth(auth);

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => shutdown.cancel(),
            Err(e) => warn!("unable to listen for shutdown signal: {e}"),
        }
    });

    // Run it
    info!("Starting SOCKS5 proxy: {}", server.listen_addr());
    server.run().await
}
