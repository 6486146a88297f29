use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::PublicKey;
use crate::update_manager::UpdaterStrategy;

/// Recognized extension names. The allow-list in `Config` is validated
/// against this set at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionName {
    Geo,
    Health,
    LocalShell,
    Logging,
}

impl std::fmt::Display for ExtensionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtensionName::Geo => write!(f, "geo"),
            ExtensionName::Health => write!(f, "health"),
            ExtensionName::LocalShell => write!(f, "local-shell"),
            ExtensionName::Logging => write!(f, "logging"),
        }
    }
}

/// Authentication material for the channel client. Chosen once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    MutualTls {
        client_cert_pem: String,
        client_key_pem: String,
        ca_cert_pem: String,
    },
    SharedSecret {
        key_id: String,
        secret: String,
        digest: String,
        iterations: u32,
        key_length: u32,
    },
}

/// Retry/timeout configuration for the resumable downloader, per spec 4.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_disconnects: u32,
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub max_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub time_between_retries: Duration,
    pub worst_case_download_speed_bytes_per_sec: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_disconnects: 5,
            idle_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(3600),
            time_between_retries: Duration::from_millis(500),
            worst_case_download_speed_bytes_per_sec: 10_000,
        }
    }
}

/// Immutable configuration for the whole agent, assembled once by the
/// caller before the supervisor starts. There is no CLI in this crate;
/// loading from environment or a file is the composition root's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_url: String,
    pub sni: Option<String>,
    pub auth: AuthConfig,
    pub firmware_device_path: PathBuf,
    pub flasher_task: String,
    #[serde(default)]
    pub flasher_env: Vec<(String, String)>,
    #[serde(default)]
    pub fwup_public_keys: Vec<PublicKey>,
    #[serde(default)]
    pub archive_public_keys: Vec<PublicKey>,
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_millis")]
    pub rejoin_delay: Duration,
    #[serde(default)]
    pub reconnect_backoff_ms: Vec<u64>,
    pub remote_shell_enabled: bool,
    #[serde(with = "duration_millis")]
    pub remote_shell_idle_timeout: Duration,
    #[serde(default)]
    pub extensions_allow_list: HashSet<ExtensionName>,
    #[serde(default)]
    pub retry: RetryConfig,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub wait_for_network: bool,
    #[serde(default)]
    pub updater_strategy: UpdaterStrategy,
}

impl Config {
    /// Validates required fields beyond what serde's required-ness already
    /// enforces, mirroring the teacher's explicit post-deserialize checks.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.server_url.is_empty() {
            return Err(ConfigError::MissingField("server_url".into()));
        }
        if self.flasher_task.is_empty() {
            return Err(ConfigError::MissingField("flasher_task".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_interval".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if let AuthConfig::SharedSecret { iterations, .. } = &self.auth {
            if *iterations == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "auth.iterations".into(),
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            server_url: "wss://example.test/socket".into(),
            sni: None,
            auth: AuthConfig::SharedSecret {
                key_id: "k1".into(),
                secret: "s3cr3t".into(),
                digest: "sha256".into(),
                iterations: 10,
                key_length: 16,
            },
            firmware_device_path: "/dev/mmcblk0".into(),
            flasher_task: "upgrade".into(),
            flasher_env: Vec::new(),
            fwup_public_keys: Vec::new(),
            archive_public_keys: Vec::new(),
            heartbeat_interval: Duration::from_secs(30),
            rejoin_delay: Duration::from_secs(5),
            reconnect_backoff_ms: vec![1000, 2000, 4000],
            remote_shell_enabled: false,
            remote_shell_idle_timeout: Duration::from_secs(60),
            extensions_allow_list: HashSet::new(),
            retry: RetryConfig::default(),
            data_dir: "/tmp/nh-agent".into(),
            wait_for_network: false,
            updater_strategy: UpdaterStrategy::Streaming,
        }
    }

    #[test]
    fn validates_sensible_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_empty_server_url() {
        let mut cfg = base_config();
        cfg.server_url.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingField(ref f)) if f == "server_url"
        ));
    }

    #[test]
    fn rejects_zero_heartbeat() {
        let mut cfg = base_config();
        cfg.heartbeat_interval = Duration::from_secs(0);
        assert!(cfg.validate().is_err());
    }
}
