use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "pickline-server",
    author,
    version,
    about = "Session server for warehouse picking and packing"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "PICKLINE_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Redis URI for pairing tokens. Tokens stay in memory when unset.
    #[arg(long, env = "PICKLINE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Lifetime of a pairing token.
    #[arg(long, env = "PICKLINE_PAIRING_TTL_SECS", default_value_t = 300)]
    pub pairing_ttl_secs: u64,

    /// Base URL mobile devices open; the QR payload is `<base>/m/<token>`.
    #[arg(
        long,
        env = "PICKLINE_PUBLIC_BASE_URL",
        default_value = "http://localhost:8080"
    )]
    pub public_base_url: String,

    #[arg(long, env = "PICKLINE_ORDER_API_URL")]
    pub order_api_url: Option<String>,

    #[arg(long, env = "PICKLINE_SUGGESTION_API_URL")]
    pub suggestion_api_url: Option<String>,

    #[arg(long, env = "PICKLINE_PHOTO_API_URL")]
    pub photo_api_url: Option<String>,

    /// JSON fixture with orders and packaging materials for the in-memory
    /// collaborators.
    #[arg(long, env = "PICKLINE_SEED_FILE")]
    pub seed_file: Option<PathBuf>,

    /// Timeout applied to every collaborator HTTP call.
    #[arg(long, env = "PICKLINE_COLLABORATOR_TIMEOUT_SECS", default_value_t = 10)]
    pub collaborator_timeout_secs: u64,

    /// How long an ended session stays readable after everyone has left.
    #[arg(long, env = "PICKLINE_SESSION_RETENTION_SECS", default_value_t = 300)]
    pub session_retention_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PICKLINE_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, env = "PICKLINE_LOG", default_value = "info,pickline_server=debug")]
    pub log_filter: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub pairing_ttl: Duration,
    pub public_base_url: String,
    pub order_api_url: Option<String>,
    pub suggestion_api_url: Option<String>,
    pub photo_api_url: Option<String>,
    pub seed_file: Option<PathBuf>,
    pub collaborator_timeout: Duration,
    pub session_retention: Duration,
    pub shutdown_grace: Duration,
    pub log_filter: String,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.pairing_ttl_secs == 0 {
            bail!("pairing ttl must be at least one second");
        }
        let public_base_url = cli.public_base_url.trim_end_matches('/').to_string();
        if public_base_url.is_empty() {
            bail!("public base url must not be empty");
        }
        Ok(ServerConfig {
            listen_addr,
            redis_url: non_empty(cli.redis_url),
            pairing_ttl: Duration::from_secs(cli.pairing_ttl_secs),
            public_base_url,
            order_api_url: non_empty(cli.order_api_url),
            suggestion_api_url: non_empty(cli.suggestion_api_url),
            photo_api_url: non_empty(cli.photo_api_url),
            seed_file: cli.seed_file,
            collaborator_timeout: Duration::from_secs(cli.collaborator_timeout_secs),
            session_retention: Duration::from_secs(cli.session_retention_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            log_filter: cli.log_filter,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            redis_url: None,
            pairing_ttl: Duration::from_secs(300),
            public_base_url: "http://localhost:8080".to_string(),
            order_api_url: None,
            suggestion_api_url: None,
            photo_api_url: None,
            seed_file: None,
            collaborator_timeout: Duration::from_secs(10),
            session_retention: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(5),
            log_filter: "info,pickline_server=debug".to_string(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
