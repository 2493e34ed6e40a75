//! Requester configuration loading from file and environment variables.

use crate::procedure::ClientSettings;
use attest_types::{ClientProcedure, PeerId};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    /// Our own ids on the node's network.
    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Procedures this Requester knows how to run.
    #[serde(default)]
    pub procedures: Vec<ClientProcedure>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_url")]
    pub url: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub mid_b64: String,

    #[serde(default)]
    pub mid_hex: String,
}

impl IdentityConfig {
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.mid_b64.clone(), self.mid_hex.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// Delay between two polls of the Provider's staged data.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long the Provider may verify our credentials.
    #[serde(default = "default_verification_window_ms")]
    pub verification_window_ms: u64,
}

impl ClientConfig {
    pub fn settings(&self) -> ClientSettings {
        ClientSettings {
            max_poll_attempts: self.max_poll_attempts,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            verification_window: Duration::from_millis(self.verification_window_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
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

fn default_max_poll_attempts() -> u32 {
    20
}

fn default_verification_window_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
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

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_poll_attempts: default_max_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            verification_window_ms: default_verification_window_ms(),
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

/// Lowest accepted poll interval, for both the bridge and the staged-data
/// polls.
pub const MIN_POLL_INTERVAL_MS: u64 = 1;

/// Loads configuration from a TOML file, falling back to defaults.
///
/// `ATTEST_NODE_URL`, `ATTEST_MID_B64`, `ATTEST_MID_HEX`, `ATTEST_LOG_LEVEL`
/// and `ATTEST_LOG_JSON` override the matching fields. Poll intervals below
/// [`MIN_POLL_INTERVAL_MS`] are raised to it.
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

    if let Ok(url) = std::env::var("ATTEST_NODE_URL") {
        config.node.url = url;
    }
    if let Ok(mid) = std::env::var("ATTEST_MID_B64") {
        config.identity.mid_b64 = mid;
    }
    if let Ok(mid) = std::env::var("ATTEST_MID_HEX") {
        config.identity.mid_hex = mid;
    }
    if let Ok(level) = std::env::var("ATTEST_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("ATTEST_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    for (field, interval) in [
        ("node.poll_interval_ms", &mut config.node.poll_interval_ms),
        ("client.poll_interval_ms", &mut config.client.poll_interval_ms),
    ] {
        if *interval < MIN_POLL_INTERVAL_MS {
            tracing::warn!(
                field,
                configured = *interval,
                using = MIN_POLL_INTERVAL_MS,
                "poll interval too small, raising it"
            );
            *interval = MIN_POLL_INTERVAL_MS;
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_identity_and_procedures() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
[identity]
mid_b64 = "O7FeQkMLukRQP+KrpVaNQZFAHwE="
mid_hex = "3bb15e42430bba44503fe2aba5568d4191401f01"

[client]
max_poll_attempts = 5

[[procedures]]
server = { http_address = "http://localhost:3000", mid_b64 = "tAX/kPZ1E3KM/miu/4d2c1Ni9yw=" }
desc = { procedure_name = "p_kvknr", requirements = ["bsn"], attributes = [{ name = "kvknr", type = "id_metadata" }] }
"#,
        )
        .unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.identity.peer_id().secondary, "3bb15e42430bba44503fe2aba5568d4191401f01");
        assert_eq!(config.client.max_poll_attempts, 5);
        assert_eq!(config.client.settings().poll_interval, Duration::from_secs(1));
        assert_eq!(config.client.settings().verification_window, Duration::from_secs(10));

        let procedure = &config.procedures[0];
        assert_eq!(procedure.provider.peer, "tAX/kPZ1E3KM/miu/4d2c1Ni9yw=");
        assert_eq!(procedure.desc.requirements, vec!["bsn"]);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Some("/nonexistent/attest-client.toml")).unwrap();
        assert_eq!(config.client.max_poll_attempts, 20);
        assert!(config.procedures.is_empty());
    }

    #[test]
    fn zero_poll_intervals_are_raised() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[node]\npoll_interval_ms = 0\n\n[client]\npoll_interval_ms = 0\n")
            .unwrap();
        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.node.poll_interval_ms, MIN_POLL_INTERVAL_MS);
        assert_eq!(config.client.poll_interval_ms, MIN_POLL_INTERVAL_MS);
    }
}
