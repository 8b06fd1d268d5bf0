use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use clap::Parser;
use url::Url;

use crate::store::DEFAULT_MEMORY_STORE_CAPACITY;

#[derive(Debug, Parser)]
#[command(
    name = "console-broker",
    author,
    version,
    about = "Issues remote-console connection descriptors for compute instances"
)]
pub struct Cli {
    /// Address the HTTP API binds to.
    #[arg(long, env = "CONSOLE_BROKER_LISTEN_ADDR", default_value = "0.0.0.0:8774")]
    pub listen_addr: String,

    /// Base URL of the compute service that negotiates consoles.
    #[arg(
        long,
        env = "CONSOLE_BROKER_COMPUTE_URL",
        default_value = "http://127.0.0.1:8775"
    )]
    pub compute_url: String,

    /// Per-request timeout applied to compute calls.
    #[arg(long, env = "CONSOLE_BROKER_COMPUTE_TIMEOUT_SECS", default_value_t = 30)]
    pub compute_timeout_secs: u64,

    /// Redis connection URI for keeper session records. In-memory when unset.
    #[arg(long, env = "CONSOLE_BROKER_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Explicit TTL for keeper session records.
    #[arg(long, env = "CONSOLE_BROKER_SESSION_TTL_SECS")]
    pub session_ttl_secs: Option<u64>,

    /// Most records the in-memory store holds before dropping the oldest.
    #[arg(
        long,
        env = "CONSOLE_BROKER_MEMORY_STORE_CAPACITY",
        default_value_t = DEFAULT_MEMORY_STORE_CAPACITY
    )]
    pub memory_store_capacity: usize,

    #[arg(long, env = "CONSOLEKEEPER_HOST", default_value = "")]
    pub keeper_host: String,

    #[arg(long, env = "CONSOLEKEEPER_PORT", default_value = "")]
    pub keeper_port: String,

    /// Seconds after which the keeper treats a session as stale.
    #[arg(long, env = "CONSOLEKEEPER_EXPIRY_SEC", default_value_t = 0)]
    pub keeper_expiry_secs: u64,

    /// How often the keeper re-checks session liveness.
    #[arg(long, env = "CONSOLEKEEPER_INTERVAL_SEC", default_value_t = 0)]
    pub keeper_interval_secs: u64,

    /// Hard deadline after which the keeper kills a session regardless of activity.
    #[arg(long, env = "CONSOLEKEEPER_SUICIDE_SEC", default_value_t = 0)]
    pub suicide_secs: u64,

    /// Grace period applied after the shutdown signal.
    #[arg(long, env = "CONSOLE_BROKER_SHUTDOWN_GRACE_SECS", default_value_t = 0)]
    pub shutdown_grace_secs: u64,
}

/// Keeper settings copied verbatim into every persisted session record.
///
/// Zero and empty values are legal and written as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleKeeperConfig {
    pub host: String,
    pub port: String,
    pub expiry_secs: u64,
    pub interval_secs: u64,
    pub suicide_secs: u64,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen_addr: SocketAddr,
    pub compute_url: Url,
    pub compute_timeout: Duration,
    pub redis_url: Option<String>,
    pub session_ttl_secs: Option<u64>,
    pub memory_store_capacity: usize,
    pub keeper: ConsoleKeeperConfig,
    pub shutdown_grace: Duration,
}

impl BrokerConfig {
    /// TTL for stored session records: explicit setting first, then the keeper expiry.
    pub fn record_ttl(&self) -> Option<Duration> {
        match self.session_ttl_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None if self.keeper.expiry_secs > 0 => {
                Some(Duration::from_secs(self.keeper.expiry_secs))
            }
            None => None,
        }
    }
}

impl TryFrom<Cli> for BrokerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let compute_url = Url::parse(&cli.compute_url)
            .with_context(|| format!("invalid compute url: {}", cli.compute_url))?;
        if cli.memory_store_capacity == 0 {
            anyhow::bail!("memory store capacity must be at least 1");
        }
        let redis_url = cli.redis_url.and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        });

        Ok(BrokerConfig {
            listen_addr,
            compute_url,
            compute_timeout: Duration::from_secs(cli.compute_timeout_secs),
            redis_url,
            session_ttl_secs: cli.session_ttl_secs,
            memory_store_capacity: cli.memory_store_capacity,
            keeper: ConsoleKeeperConfig {
                host: cli.keeper_host,
                port: cli.keeper_port,
                expiry_secs: cli.keeper_expiry_secs,
                interval_secs: cli.keeper_interval_secs,
                suicide_secs: cli.suicide_secs,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<BrokerConfig> {
        let mut argv = vec!["console-broker"];
        argv.extend_from_slice(args);
        BrokerConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test]
    fn keeper_settings_default_to_disabled() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.keeper, ConsoleKeeperConfig::default());
        assert_eq!(config.record_ttl(), None);
    }

    #[test]
    fn keeper_settings_from_flags() {
        let config = parse(&[
            "--keeper-host",
            "keeper.local",
            "--keeper-port",
            "7000",
            "--keeper-expiry-secs",
            "600",
            "--keeper-interval-secs",
            "30",
            "--suicide-secs",
            "3600",
        ])
        .unwrap();
        assert_eq!(config.keeper.host, "keeper.local");
        assert_eq!(config.keeper.port, "7000");
        assert_eq!(config.keeper.suicide_secs, 3600);
        assert_eq!(config.record_ttl(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn explicit_session_ttl_wins() {
        let config = parse(&["--keeper-expiry-secs", "600", "--session-ttl-secs", "90"]).unwrap();
        assert_eq!(config.record_ttl(), Some(Duration::from_secs(90)));

        let config = parse(&["--keeper-expiry-secs", "600", "--session-ttl-secs", "0"]).unwrap();
        assert_eq!(config.record_ttl(), None);
    }

    #[test]
    fn blank_redis_url_means_in_memory() {
        let config = parse(&["--redis-url", "  "]).unwrap();
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn memory_store_capacity_must_be_positive() {
        assert_eq!(
            parse(&[]).unwrap().memory_store_capacity,
            DEFAULT_MEMORY_STORE_CAPACITY
        );
        let err = parse(&["--memory-store-capacity", "0"]).unwrap_err();
        assert!(err.to_string().contains("memory store capacity"));
    }

    #[test]
    fn invalid_listen_addr_is_rejected() {
        let err = parse(&["--listen-addr", "nowhere"]).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }
}
