//! Provider configuration loading from file and environment variables.

use attest_types::ProcedureDescription;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level Provider configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP transport settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Attestation node settings.
    #[serde(default)]
    pub node: NodeConfig,

    /// Transaction settings.
    #[serde(default)]
    pub attestation: AttestationConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Procedures offered by this Provider.
    #[serde(default)]
    pub procedures: Vec<ProcedureEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Where the Provider's attestation node listens and how it is polled.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Base URL of the node's REST API.
    #[serde(default = "default_node_url")]
    pub url: String,

    /// Delay between two polling ticks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timeout of a single node request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttestationConfig {
    /// How long a resolved attribute stays staged for its holder.
    #[serde(default = "default_attestation_timeout")]
    pub timeout_seconds: u64,

    /// Upper bound on credential verification. Unbounded when absent.
    #[serde(default)]
    pub verification_timeout_seconds: Option<u64>,

    /// Reuse a verification of the same credential younger than this.
    #[serde(default)]
    pub verification_max_age_seconds: Option<u64>,

    /// How long finished transactions stay queryable. 0 keeps them forever.
    #[serde(default = "default_retention")]
    pub transaction_retention_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "attest_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

/// One `[[procedures]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcedureEntry {
    #[serde(flatten)]
    pub desc: ProcedureDescription,

    pub resolver: ResolverConfig,
}

/// How a procedure computes its output attributes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResolverConfig {
    /// Fixed value per output attribute.
    Static { values: BTreeMap<String, String> },

    /// Maps the value of one credential to one output attribute.
    Lookup {
        credential: String,
        attribute: String,
        table: HashMap<String, String>,
    },
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_node_url() -> String {
    "http://localhost:8124".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_attestation_timeout() -> u64 {
    60
}

fn default_retention() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            url: default_node_url(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_attestation_timeout(),
            verification_timeout_seconds: None,
            verification_max_age_seconds: None,
            transaction_retention_seconds: default_retention(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Lowest accepted bridge poll interval.
pub const MIN_POLL_INTERVAL_MS: u64 = 1;

/// Loads configuration from a TOML file, falling back to defaults.
///
/// `node.poll_interval_ms` is raised to [`MIN_POLL_INTERVAL_MS`] if lower.
///
/// Environment variable overrides:
/// - `ATTEST_HOST`, `ATTEST_PORT` override `server.host` and `server.port`
/// - `ATTEST_NODE_URL` overrides `node.url`
/// - `ATTEST_POLL_INTERVAL_MS` overrides `node.poll_interval_ms`
/// - `ATTEST_ATTESTATION_TIMEOUT_SECONDS` overrides `attestation.timeout_seconds`
/// - `ATTEST_LOG_LEVEL` overrides `logging.level`
/// - `ATTEST_LOG_JSON` overrides `logging.json` ("true" or "1" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("ATTEST_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("ATTEST_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(url) = std::env::var("ATTEST_NODE_URL") {
        config.node.url = url;
    }
    if let Ok(interval) = std::env::var("ATTEST_POLL_INTERVAL_MS") {
        if let Ok(parsed) = interval.parse() {
            config.node.poll_interval_ms = parsed;
        }
    }
    if let Ok(timeout) = std::env::var("ATTEST_ATTESTATION_TIMEOUT_SECONDS") {
        if let Ok(parsed) = timeout.parse() {
            config.attestation.timeout_seconds = parsed;
        }
    }
    if let Ok(level) = std::env::var("ATTEST_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("ATTEST_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    if config.node.poll_interval_ms < MIN_POLL_INTERVAL_MS {
        tracing::warn!(
            configured = config.node.poll_interval_ms,
            using = MIN_POLL_INTERVAL_MS,
            "node.poll_interval_ms too small, raising it"
        );
        config.node.poll_interval_ms = MIN_POLL_INTERVAL_MS;
    }

    Ok(config)
}
