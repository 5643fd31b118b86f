// Load balancer configuration
//
// Read from the environment (a .env file is loaded first by main). Unset
// numeric values fall back to defaults; values that are set but invalid are
// rejected so a typo never silently changes placement behavior.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use switchyard_placement::{HashPoolConfig, PlacerConfig, RetryPolicy};
use thiserror::Error;

const DEFAULT_CERT_COMMON_NAME: &str = "runner";
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("RUNNER_POOL must be \"static\" or \"consistent_hash\", got {0:?}")]
    UnknownPool(String),

    #[error("RUNNER_TLS_CA, RUNNER_TLS_CERT and RUNNER_TLS_KEY must be set together (missing {0})")]
    PartialTls(&'static str),
}

/// Which pool implementation orders candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolKind {
    Static,
    #[default]
    ConsistentHash,
}

impl FromStr for PoolKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "consistent_hash" | "consistent-hash" | "hash" => Ok(Self::ConsistentHash),
            _ => Err(ConfigError::UnknownPool(s.to_string())),
        }
    }
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static => write!(f, "static"),
            Self::ConsistentHash => write!(f, "consistent_hash"),
        }
    }
}

/// PEM files for mutual TLS with runners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LbConfig {
    pub runner_addresses: Vec<String>,
    pub pool: PoolKind,
    /// `None` means plaintext runner connections
    pub tls: Option<TlsPaths>,
    /// Name the runners' certificates must be valid for
    pub cert_common_name: String,
    pub placer: PlacerConfig,
    pub hash_pool: HashPoolConfig,
    pub shutdown_timeout: Duration,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            runner_addresses: Vec::new(),
            pool: PoolKind::default(),
            tls: None,
            cert_common_name: DEFAULT_CERT_COMMON_NAME.to_string(),
            placer: PlacerConfig::default(),
            hash_pool: HashPoolConfig::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl LbConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUNNER_ADDRESSES`: comma-separated `host:port` list
    /// - `RUNNER_POOL`: `static` or `consistent_hash` (default)
    /// - `RUNNER_TLS_CA`, `RUNNER_TLS_CERT`, `RUNNER_TLS_KEY`: PEM file paths
    /// - `RUNNER_CERT_COMMON_NAME`: expected runner identity (default: "runner")
    /// - `PLACER_TIMEOUT_MS`: bound on a whole placement
    /// - `PLACER_ROUNDS`: passes over the candidate list (default: 1)
    /// - `HEALTH_CHECK_INTERVAL_MS`: status probe period, 0 disables
    /// - `SHUTDOWN_TIMEOUT_MS`: drain deadline on shutdown (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(addresses) = get("RUNNER_ADDRESSES") {
            config.runner_addresses = parse_addresses(&addresses);
        }
        if let Some(pool) = get("RUNNER_POOL") {
            config.pool = pool.parse()?;
        }

        config.tls = match (
            get("RUNNER_TLS_CA"),
            get("RUNNER_TLS_CERT"),
            get("RUNNER_TLS_KEY"),
        ) {
            (None, None, None) => None,
            (Some(ca), Some(cert), Some(key)) => Some(TlsPaths {
                ca: ca.into(),
                cert: cert.into(),
                key: key.into(),
            }),
            (None, _, _) => return Err(ConfigError::PartialTls("RUNNER_TLS_CA")),
            (_, None, _) => return Err(ConfigError::PartialTls("RUNNER_TLS_CERT")),
            (_, _, None) => return Err(ConfigError::PartialTls("RUNNER_TLS_KEY")),
        };
        if let Some(name) = get("RUNNER_CERT_COMMON_NAME") {
            config.cert_common_name = name;
        }

        if let Some(ms) = parse_millis("PLACER_TIMEOUT_MS", get("PLACER_TIMEOUT_MS"))? {
            if !ms.is_zero() {
                config.placer = config.placer.with_placement_timeout(ms);
            }
        }
        if let Some(rounds) = parse_number("PLACER_ROUNDS", get("PLACER_ROUNDS"))? {
            if rounds > 1 {
                config.placer = config
                    .placer
                    .with_retry(RetryPolicy::exponential().with_max_attempts(
                        u32::try_from(rounds).unwrap_or(u32::MAX),
                    ));
            }
        }
        if let Some(interval) =
            parse_millis("HEALTH_CHECK_INTERVAL_MS", get("HEALTH_CHECK_INTERVAL_MS"))?
        {
            config.hash_pool = config.hash_pool.with_health_check_interval(interval);
        }
        if let Some(timeout) = parse_millis("SHUTDOWN_TIMEOUT_MS", get("SHUTDOWN_TIMEOUT_MS"))? {
            config.shutdown_timeout = timeout;
            config.hash_pool = config.hash_pool.with_drain_timeout(timeout);
        }

        Ok(config)
    }
}

/// Split a comma or whitespace separated address list, dropping blanks
pub fn parse_addresses(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number(name: &'static str, value: Option<String>) -> Result<Option<u64>, ConfigError> {
    value
        .map(|v| {
            v.trim().parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
                name,
                value: v.clone(),
            })
        })
        .transpose()
}

fn parse_millis(
    name: &'static str,
    value: Option<String>,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_number(name, value)?.map(Duration::from_millis))
}
