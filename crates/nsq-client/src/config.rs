use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::error::ConsumerError;

/// TLS behavior for the IDENTIFY handshake's `tls_v1` upgrade.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub insecure_skip_verify: bool,
    /// Minimum accepted protocol version. Defaults to TLS 1.2; the reference
    /// implementation this runtime is modeled on defaulted to SSLv3, which is
    /// unsafe and is not reproduced here.
    pub min_version: TlsMinVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMinVersion {
    Tls12,
    Tls13,
}

impl Default for TlsMinVersion {
    fn default() -> Self {
        TlsMinVersion::Tls12
    }
}

/// Stream compression negotiated during IDENTIFY. At most one may be active;
/// `validate()` rejects requesting both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Deflate {
        level: i32,
    },
    Snappy,
}

/// Immutable, validated configuration a [`Consumer`](crate::consumer::Consumer)
/// is built from. Construct with [`Config::new`], adjust fields with the
/// builder-style `with_*` setters, then call [`Config::validate`] (the
/// `Consumer` constructor does this for you and freezes the result).
#[derive(Debug, Clone)]
pub struct Config {
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub connect_timeout: Duration,
    pub msg_timeout: Duration,
    pub max_in_flight: u32,
    pub max_attempts: u16,
    pub default_requeue_delay: Duration,
    pub max_requeue_delay: Duration,
    pub max_backoff_duration: Duration,
    pub backoff_multiplier: Duration,
    pub lookupd_poll_interval: Duration,
    pub lookupd_poll_jitter: f64,
    pub rdy_redistribute_interval: Duration,
    pub low_rdy_idle_timeout: Duration,
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub tls: TlsConfig,
    pub compression: Compression,
    pub auth_secret: Option<String>,
    pub sample_rate: i32,
    pub max_frame_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        let hostname =
            hostname_or_default();

        Self {
            heartbeat_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            msg_timeout: Duration::from_secs(60),
            max_in_flight: 1,
            max_attempts: 5,
            default_requeue_delay: Duration::from_secs(90),
            max_requeue_delay: Duration::from_secs(15 * 60),
            max_backoff_duration: Duration::from_secs(2 * 60),
            backoff_multiplier: Duration::from_secs(1),
            lookupd_poll_interval: Duration::from_secs(60),
            lookupd_poll_jitter: 0.3,
            rdy_redistribute_interval: Duration::from_secs(5),
            low_rdy_idle_timeout: Duration::from_secs(10),
            client_id: hostname.clone(),
            hostname,
            user_agent: concat!("nsq-client/", env!("CARGO_PKG_VERSION")).to_string(),
            tls: TlsConfig::default(),
            compression: Compression::default(),
            auth_secret: None,
            sample_rate: 0,
            max_frame_size: nsq_proto::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_in_flight(mut self, n: u32) -> Self {
        self.max_in_flight = n;
        self
    }

    pub fn with_max_attempts(mut self, n: u16) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_auth_secret(mut self, secret: impl Into<String>) -> Self {
        self.auth_secret = Some(secret.into());
        self
    }

    /// Checks cross-field invariants. Individual field validity (e.g. a
    /// `sample_rate` of 0..99) is the kind of mistake this catches before a
    /// `Consumer` is ever constructed.
    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.max_attempts == 0 {
            return Err(ConsumerError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0..=99).contains(&self.sample_rate) {
            return Err(ConsumerError::InvalidConfig(
                "sample_rate must be in 0..=99".to_string(),
            ));
        }
        if self.lookupd_poll_jitter < 0.0 || self.lookupd_poll_jitter > 1.0 {
            return Err(ConsumerError::InvalidConfig(
                "lookupd_poll_jitter must be in 0.0..=1.0".to_string(),
            ));
        }
        if matches!(self.compression, Compression::Deflate { level } if !(0..=9).contains(&level))
        {
            return Err(ConsumerError::InvalidConfig(
                "deflate level must be in 0..=9".to_string(),
            ));
        }
        Ok(())
    }
}

fn hostname_or_default() -> String {
    hostname_from_env().unwrap_or_else(|| "unknown-host".to_string())
}

fn hostname_from_env() -> Option<String> {
    for key in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// YAML-sourced mirror of [`Config`] for binaries that embed this library and
/// want to load settings the way `bouncer-server` loads `Config::load()`: an
/// env var pointing at a file, or a handful of default search paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerSettings {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u16,
    #[serde(
        default,
        deserialize_with = "nsq_helpers::de::deserialize_optional_duration"
    )]
    pub heartbeat_interval: Option<Duration>,
    #[serde(
        default,
        deserialize_with = "nsq_helpers::de::deserialize_optional_duration"
    )]
    pub msg_timeout: Option<Duration>,
    #[serde(
        default,
        deserialize_with = "nsq_helpers::de::deserialize_optional_duration"
    )]
    pub lookupd_poll_interval: Option<Duration>,
    #[serde(default)]
    pub lookupd_poll_jitter: Option<f64>,
    #[serde(default)]
    pub tls_v1: bool,
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
    #[serde(default)]
    pub deflate: bool,
    #[serde(default = "default_deflate_level")]
    pub deflate_level: i32,
    #[serde(default)]
    pub snappy: bool,
    #[serde(default)]
    pub auth_secret: Option<String>,
    #[serde(default)]
    pub sample_rate: i32,
}

impl ConsumerSettings {
    /// Resolves `NSQ_CONSUMER_CONFIG_PATH`, or `./nsq-consumer.yaml` /
    /// `$HOME/nsq-consumer.yaml`, loads and validates it.
    pub fn load() -> Result<Self> {
        let config_path = resolve_settings_path().context(
            "consumer settings path not found (NSQ_CONSUMER_CONFIG_PATH or nsq-consumer.yaml)",
        )?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let settings: ConsumerSettings = serde_yaml::from_slice(&raw)
            .with_context(|| format!("failed to parse YAML config {}", path.display()))?;
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<()> {
        if self.deflate && self.snappy {
            bail!("consumer settings cannot enable both `deflate` and `snappy`");
        }
        Ok(())
    }

    /// Converts settings into a validated [`Config`], applying defaults for
    /// anything the YAML document left unset.
    pub fn into_config(self) -> Result<Config, ConsumerError> {
        let mut config = Config::default();

        if let Some(client_id) = self.client_id {
            config.client_id = client_id;
        }
        if let Some(hostname) = self.hostname {
            config.hostname = hostname;
        }
        if let Some(user_agent) = self.user_agent {
            config.user_agent = user_agent;
        }
        config.max_in_flight = self.max_in_flight;
        config.max_attempts = self.max_attempts;
        if let Some(d) = self.heartbeat_interval {
            config.heartbeat_interval = d;
        }
        if let Some(d) = self.msg_timeout {
            config.msg_timeout = d;
        }
        if let Some(d) = self.lookupd_poll_interval {
            config.lookupd_poll_interval = d;
        }
        if let Some(j) = self.lookupd_poll_jitter {
            config.lookupd_poll_jitter = j;
        }

        config.tls = TlsConfig {
            enabled: self.tls_v1,
            insecure_skip_verify: self.tls_insecure_skip_verify,
            min_version: TlsMinVersion::Tls12,
        };

        config.compression = if self.deflate {
            Compression::Deflate { level: self.deflate_level }
        } else if self.snappy {
            Compression::Snappy
        } else {
            Compression::None
        };

        config.auth_secret = self.auth_secret;
        config.sample_rate = self.sample_rate;

        config.validate()?;
        Ok(config)
    }
}

fn default_max_in_flight() -> u32 {
    1
}

fn default_max_attempts() -> u16 {
    5
}

fn default_deflate_level() -> i32 {
    6
}

fn resolve_settings_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("NSQ_CONSUMER_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    if let Some(home) = non_empty_env("HOME") {
        let candidate = PathBuf::from(home).join("nsq-consumer.yaml");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let candidate = cwd.join("nsq-consumer.yaml");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_max_attempts() {
        let config = Config::default().with_max_attempts(0);
        assert!(matches!(config.validate(), Err(ConsumerError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_sample_rate_out_of_range() {
        let mut config = Config::default();
        config.sample_rate = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn settings_reject_both_compressions() {
        let yaml = "deflate: true\nsnappy: true\n";
        let settings: ConsumerSettings = serde_yaml::from_str(yaml).unwrap();
        assert!(settings.check().is_err());
    }

    #[test]
    fn settings_convert_into_validated_config() {
        let yaml = "max_in_flight: 50\nmax_attempts: 3\nheartbeat_interval: 15s\n";
        let settings: ConsumerSettings = serde_yaml::from_str(yaml).unwrap();
        let config = settings.into_config().unwrap();
        assert_eq!(config.max_in_flight, 50);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
    }
}
