//! relayd configuration.
//!
//! Everything is env-driven; see [`Config::from_env`] for the variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use relayd_hooks::Verification;
use serde::Serialize;

use crate::proxy::{
    ClientConfig, ProxyOptions, DEFAULT_MAX_CONNECTIONS, DEFAULT_RECEIVE_BUFFER_SIZE,
    DEFAULT_RECEIVE_CHUNK_SIZE,
};

/// relayd configuration (env-driven).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Inbound bind address.
    pub listen_addr: SocketAddr,

    /// Maximum concurrent inbound connections.
    pub max_connections: usize,

    /// Number of backend clients created at startup; also the pool capacity.
    /// Zero means an unbounded pool that starts empty.
    pub pool_size: usize,

    /// Elastic and reuse switches.
    pub proxy: ProxyOptions,

    /// Template for every backend client.
    pub client: ClientConfig,

    /// Hook verification policy.
    pub verification: Verification,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr: SocketAddr = parse(&lookup, "RELAYD_LISTEN_ADDR", "a socket address")?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 15432)));

        let max_connections: usize =
            parse(&lookup, "RELAYD_MAX_CONNECTIONS", "an integer")?
                .unwrap_or(DEFAULT_MAX_CONNECTIONS)
                .max(1);

        let pool_size: usize = parse(&lookup, "RELAYD_POOL_SIZE", "an integer")?.unwrap_or(10);

        let proxy = ProxyOptions {
            elastic: flag(&lookup, "RELAYD_ELASTIC")?,
            reuse_elastic_clients: flag(&lookup, "RELAYD_REUSE_ELASTIC_CLIENTS")?,
        };

        let client = ClientConfig {
            network: lookup("RELAYD_BACKEND_NETWORK").unwrap_or_else(|| "tcp".to_string()),
            address: lookup("RELAYD_BACKEND_ADDR")
                .unwrap_or_else(|| "localhost:5432".to_string()),
            receive_buffer_size: parse(&lookup, "RELAYD_RECEIVE_BUFFER_SIZE", "an integer")?
                .unwrap_or(DEFAULT_RECEIVE_BUFFER_SIZE),
            receive_chunk_size: parse(&lookup, "RELAYD_RECEIVE_CHUNK_SIZE", "an integer")?
                .unwrap_or(DEFAULT_RECEIVE_CHUNK_SIZE)
                .max(1),
            receive_deadline: millis(&lookup, "RELAYD_RECEIVE_DEADLINE_MS")?,
            send_deadline: millis(&lookup, "RELAYD_SEND_DEADLINE_MS")?,
        };

        let verification = lookup("RELAYD_HOOK_VERIFICATION")
            .map(|v| v.parse::<Verification>())
            .transpose()
            .map_err(anyhow::Error::msg)
            .context("RELAYD_HOOK_VERIFICATION is invalid.")?
            .unwrap_or_default();

        let log_level = lookup("RELAYD_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            max_connections,
            pool_size,
            proxy,
            client,
            verification,
            log_level,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, what: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{key} must be {what}."))
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if v == "1" || v == "true" => Ok(true),
        Some(v) if v.is_empty() || v == "0" || v == "false" => Ok(false),
        Some(v) => anyhow::bail!("{key} must be a boolean (true/false/1/0), got '{v}'."),
    }
}

// Zero disables the deadline.
fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    let ms: u64 = parse(lookup, key, "an integer (milliseconds)")?.unwrap_or(0);
    Ok((ms > 0).then(|| Duration::from_millis(ms)))
}
