//! Daemon configuration.
//!
//! One TOML file with four sections: `[daemon]` (paths, diagnostic listener,
//! poll interval), `[chain]` (relay endpoint and signer identity, required),
//! `[sync]` (retry and batching tunables, see
//! [`SyncSettings`](crate::sync::SyncSettings)), and `[schedule]` (week
//! generation). Parsing fails closed: unknown legacy keys and invalid values
//! are rejected at startup, never silently defaulted around.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::RpcChainConfig;
use crate::schedule::WeekSchedule;
use crate::sync::SyncSettings;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyConfig {
    /// Daemon-local settings.
    #[serde(default)]
    pub daemon: DaemonSection,

    /// Chain relay settings. Required: there is no meaningful default for
    /// the relay endpoint or the signing identity.
    pub chain: RpcChainConfig,

    /// Reconciliation tunables.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Week schedule generation.
    pub schedule: ScheduleSection,
}

impl TallyConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, a legacy key is present, or
    /// any value fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        // The periodic cron trigger was replaced by the scheduler loop; a
        // config still carrying it would silently stop meaning anything, so
        // its presence is an error rather than an ignored key.
        if let Ok(raw) = content.parse::<toml::Table>() {
            if let Some(daemon) = raw.get("daemon").and_then(toml::Value::as_table) {
                if daemon.contains_key("cron_schedule") {
                    return Err(ConfigError::Validation(
                        "'cron_schedule' is no longer supported in [daemon]; \
                         use 'poll_interval' instead"
                            .to_string(),
                    ));
                }
            }
        }

        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "daemon.poll_interval must be positive".to_string(),
            ));
        }
        if self.sync.max_batch_size == 0 {
            return Err(ConfigError::Validation(
                "sync.max_batch_size must be positive".to_string(),
            ));
        }
        if self.sync.max_submit_attempts == 0 || self.sync.max_confirm_attempts == 0 {
            return Err(ConfigError::Validation(
                "sync attempt bounds must be positive".to_string(),
            ));
        }
        self.chain
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        // Schedule parameters must produce a well-formed generator.
        self.schedule
            .generator()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        if self.schedule.weeks_ahead == 0 {
            return Err(ConfigError::Validation(
                "schedule.weeks_ahead must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[daemon]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    /// Path to the SQLite ledger database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Listen address for the diagnostic HTTP surface.
    #[serde(default = "default_diag_listen")]
    pub diag_listen: SocketAddr,

    /// Scheduler tick interval. Default 60s.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            diag_listen: default_diag_listen(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/tally/tally.db")
}

fn default_diag_listen() -> SocketAddr {
    "127.0.0.1:9310".parse().expect("static literal parses")
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

/// `[schedule]` section: parameters for the week generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSection {
    /// Instant week 0 opens.
    pub genesis: DateTime<Utc>,

    /// Length of a full week window. Default 7d.
    #[serde(default = "default_week_length")]
    #[serde(with = "humantime_serde")]
    pub week_length: Duration,

    /// Length of the registration window at the start of each week.
    /// Default 2d.
    #[serde(default = "default_registration_length")]
    #[serde(with = "humantime_serde")]
    pub registration_length: Duration,

    /// How many future weeks to keep materialized. Default 2.
    #[serde(default = "default_weeks_ahead")]
    pub weeks_ahead: u64,
}

impl ScheduleSection {
    /// Builds the week generator from this section.
    ///
    /// # Errors
    ///
    /// Returns [`crate::schedule::ScheduleError`] if the durations are
    /// inconsistent.
    pub fn generator(&self) -> Result<WeekSchedule, crate::schedule::ScheduleError> {
        WeekSchedule::new(self.genesis, self.week_length, self.registration_length)
    }
}

const fn default_week_length() -> Duration {
    Duration::from_secs(7 * 86_400)
}

const fn default_registration_length() -> Duration {
    Duration::from_secs(2 * 86_400)
}

const fn default_weeks_ahead() -> u64 {
    2
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Serde shim encoding `Duration` as humantime strings ("90s", "2d").
pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [chain]
        endpoint = "https://relay.example.net"
        signer_address = "0xabc"

        [schedule]
        genesis = "2026-01-05T00:00:00Z"
    "#;

    #[test]
    fn parse_minimal_config_applies_defaults() {
        let config = TallyConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.daemon.poll_interval, Duration::from_secs(60));
        assert_eq!(config.daemon.diag_listen, default_diag_listen());
        assert_eq!(config.sync.max_batch_size, 64);
        assert_eq!(config.schedule.week_length, Duration::from_secs(7 * 86_400));
        assert_eq!(config.schedule.weeks_ahead, 2);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [daemon]
            db_path = "/tmp/tally.db"
            diag_listen = "0.0.0.0:9999"
            poll_interval = "30s"

            [chain]
            endpoint = "https://relay.example.net"
            signer_address = "0xabc"
            api_token = "secret"

            [sync]
            max_batch_size = 16
            max_submit_attempts = 3
            max_confirm_attempts = 4
            confirm_timeout = "10s"

            [sync.backoff]
            type = "fixed"
            delay = "2s"

            [schedule]
            genesis = "2026-01-05T00:00:00Z"
            week_length = "7d"
            registration_length = "1d"
            weeks_ahead = 3
        "#;

        let config = TallyConfig::from_toml(toml).unwrap();
        assert_eq!(config.daemon.poll_interval, Duration::from_secs(30));
        assert_eq!(config.sync.max_batch_size, 16);
        assert_eq!(config.sync.confirm_timeout, Duration::from_secs(10));
        assert_eq!(
            config.schedule.registration_length,
            Duration::from_secs(86_400)
        );
        assert_eq!(config.chain.api_token.as_deref(), Some("secret"));
    }

    #[test]
    fn chain_section_is_required() {
        let toml = r#"
            [schedule]
            genesis = "2026-01-05T00:00:00Z"
        "#;
        assert!(TallyConfig::from_toml(toml).is_err());
    }

    #[test]
    fn legacy_cron_key_rejected() {
        let toml = r#"
            [daemon]
            cron_schedule = "*/5 * * * *"

            [chain]
            endpoint = "https://relay.example.net"
            signer_address = "0xabc"

            [schedule]
            genesis = "2026-01-05T00:00:00Z"
        "#;
        let err = TallyConfig::from_toml(toml).unwrap_err();
        match err {
            ConfigError::Validation(msg) => {
                assert!(msg.contains("cron_schedule"), "{msg}");
                assert!(msg.contains("poll_interval"), "{msg}");
            },
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let toml = r#"
            [daemon]
            poll_interval = "0s"

            [chain]
            endpoint = "https://relay.example.net"
            signer_address = "0xabc"

            [schedule]
            genesis = "2026-01-05T00:00:00Z"
        "#;
        assert!(matches!(
            TallyConfig::from_toml(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn registration_longer_than_week_rejected() {
        let toml = r#"
            [chain]
            endpoint = "https://relay.example.net"
            signer_address = "0xabc"

            [schedule]
            genesis = "2026-01-05T00:00:00Z"
            week_length = "1d"
            registration_length = "2d"
        "#;
        assert!(matches!(
            TallyConfig::from_toml(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = TallyConfig::from_toml(MINIMAL).unwrap();
        let rendered = config.to_toml().unwrap();
        let reparsed = TallyConfig::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.daemon.poll_interval, config.daemon.poll_interval);
        assert_eq!(reparsed.chain.endpoint, config.chain.endpoint);
    }
}
