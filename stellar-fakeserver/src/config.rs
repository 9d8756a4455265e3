use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Synthetic pass schedule served by `ListPlans`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// A pass starts every this many minutes, aligned to the Unix epoch.
    #[serde(default = "default_pass_every_minutes")]
    pub pass_every_minutes: u64,

    #[serde(default = "default_pass_duration_secs")]
    pub pass_duration_secs: u64,

    /// Gap between start and AOS, and between LOS and end.
    #[serde(default = "default_margin_secs")]
    pub margin_secs: u64,

    #[serde(default = "default_satellite_id")]
    pub satellite_id: String,

    #[serde(default = "default_downlink_frequency_hz")]
    pub downlink_frequency_hz: u64,
}

/// Behaviour of `OpenStream` sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Commands are pushed to the client at this interval. 0 disables them.
    #[serde(default = "default_command_interval_ms")]
    pub command_interval_ms: u64,

    /// Synthetic telemetry is pushed at this interval. 0 disables it.
    #[serde(default)]
    pub telemetry_interval_ms: u64,

    #[serde(default = "default_telemetry_payload_size")]
    pub telemetry_payload_size: usize,

    /// The server aborts each stream after this long. 0 keeps streams open.
    #[serde(default)]
    pub session_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// When set, requests must carry exactly this bearer token.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    50051
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pass_every_minutes() -> u64 {
    15
}

fn default_pass_duration_secs() -> u64 {
    600
}

fn default_margin_secs() -> u64 {
    10
}

fn default_satellite_id() -> String {
    "sat-1".to_string()
}

fn default_downlink_frequency_hz() -> u64 {
    437_500_000
}

fn default_command_interval_ms() -> u64 {
    5000
}

fn default_telemetry_payload_size() -> usize {
    64
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            pass_every_minutes: default_pass_every_minutes(),
            pass_duration_secs: default_pass_duration_secs(),
            margin_secs: default_margin_secs(),
            satellite_id: default_satellite_id(),
            downlink_frequency_hz: default_downlink_frequency_hz(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_interval_ms: default_command_interval_ms(),
            telemetry_interval_ms: 0,
            telemetry_payload_size: default_telemetry_payload_size(),
            session_timeout_ms: 0,
        }
    }
}

impl Default for FakeServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            api_key: None,
            schedule: ScheduleConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl SessionConfig {
    pub fn command_interval(&self) -> Option<Duration> {
        non_zero_millis(self.command_interval_ms)
    }

    pub fn telemetry_interval(&self) -> Option<Duration> {
        non_zero_millis(self.telemetry_interval_ms)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.session_timeout_ms)
    }
}

impl FakeServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FakeServerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` if it exists, otherwise run with defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let schedule = &self.schedule;
        anyhow::ensure!(schedule.pass_every_minutes > 0, "pass_every_minutes must be positive");
        anyhow::ensure!(
            schedule.pass_duration_secs > 2 * schedule.margin_secs,
            "pass_duration_secs must exceed twice margin_secs"
        );
        anyhow::ensure!(
            schedule.pass_duration_secs <= schedule.pass_every_minutes * 60,
            "passes must not overlap"
        );
        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_file_missing() {
        let config = FakeServerConfig::load_or_default("/nonexistent/fakeserver.toml").unwrap();
        assert_eq!(config.server_address(), "0.0.0.0:50051");
        assert_eq!(config.session.command_interval(), Some(Duration::from_secs(5)));
        assert_eq!(config.session.session_timeout(), None);
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
port = 6000
api_key = "secret"

[schedule]
pass_every_minutes = 2
pass_duration_secs = 60

[session]
session_timeout_ms = 1500
"#
        )
        .unwrap();

        let config = FakeServerConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.schedule.margin_secs, 10);
        assert_eq!(config.session.session_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_rejects_overlapping_passes() {
        let mut config = FakeServerConfig::default();
        config.schedule.pass_every_minutes = 1;
        config.schedule.pass_duration_secs = 120;
        assert!(config.validate().is_err());

        config.schedule.pass_duration_secs = 15;
        assert!(config.validate().is_err());
    }
}
