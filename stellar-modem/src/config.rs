use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use stellar_common::Framing;

use crate::backoff::BackoffConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundStationConfig {
    pub name: String,
    pub id: String,

    /// API endpoint, e.g. `https://api.example.com:443`.
    pub address: String,

    /// Path to the API key file.
    pub key: PathBuf,

    #[serde(default = "default_plan_update_interval_minutes")]
    pub plan_update_interval_minutes: u64,

    /// Also list plans whose AOS was up to an hour ago, so a restart picks up
    /// a pass that is already in progress.
    #[serde(default = "default_lookback")]
    pub lookback: bool,
}

impl GroundStationConfig {
    pub fn plan_update_interval(&self) -> Duration {
        Duration::from_secs(self.plan_update_interval_minutes.max(1) * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteConfig {
    pub name: String,
    pub id: String,

    #[serde(default)]
    pub framing: Framing,

    /// File whose contents are sent as telemetry during this satellite's passes.
    #[serde(default = "default_telemetry_file")]
    pub telemetry: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Name of the ground station used when none is requested.
    #[serde(default)]
    pub default: String,

    #[serde(default)]
    pub ground_stations: Vec<GroundStationConfig>,

    #[serde(default)]
    pub satellites: Vec<SatelliteConfig>,

    #[serde(default)]
    pub stream: BackoffConfig,

    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_plan_update_interval_minutes() -> u64 {
    5
}

fn default_lookback() -> bool {
    true
}

fn default_telemetry_file() -> PathBuf {
    PathBuf::from("data.bin")
}

fn default_send_interval_ms() -> u64 {
    1000
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            default: String::new(),
            ground_stations: Vec::new(),
            satellites: Vec::new(),
            stream: BackoffConfig::default(),
            send_interval_ms: default_send_interval_ms(),
        }
    }
}

impl ModemConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse TOML and reject configs without ground stations or with unusable
    /// `[stream]` backoff settings.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: ModemConfig = toml::from_str(content)?;
        anyhow::ensure!(
            !config.ground_stations.is_empty(),
            "No ground stations configured"
        );
        config.stream.validate().context("Invalid [stream] settings")?;
        Ok(config)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms.max(1))
    }

    /// Pick the ground station to run: the requested name if given, then the
    /// configured default, then the first one listed. Unknown names fall
    /// through to the next choice with a warning.
    pub fn select_ground_station(&self, requested: Option<&str>) -> anyhow::Result<&GroundStationConfig> {
        let by_name = |name: &str| self.ground_stations.iter().find(|gs| gs.name == name);

        if let Some(name) = requested.filter(|n| !n.is_empty()) {
            match by_name(name) {
                Some(gs) => return Ok(gs),
                None => tracing::warn!("Ground station '{}' is not configured, falling back", name),
            }
        }

        if !self.default.is_empty() {
            match by_name(&self.default) {
                Some(gs) => return Ok(gs),
                None => tracing::warn!(
                    "Default ground station '{}' is not configured, using the first one",
                    self.default
                ),
            }
        }

        self.ground_stations
            .first()
            .context("No ground stations configured")
    }

    pub fn satellite(&self, id: &str) -> Option<&SatelliteConfig> {
        self.satellites.iter().find(|sat| sat.id == id)
    }

    /// Every framing any configured satellite uses, in configuration order.
    pub fn accepted_framings(&self) -> Vec<Framing> {
        let mut framings = Vec::new();
        for sat in &self.satellites {
            if !framings.contains(&sat.framing) {
                framings.push(sat.framing);
            }
        }
        framings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
log_level = "debug"
default = "north"
send_interval_ms = 250

[[ground_stations]]
name = "south"
id = "gs-2"
address = "http://localhost:50051"
key = "south.key"
lookback = false

[[ground_stations]]
name = "north"
id = "gs-1"
address = "http://localhost:50051"
key = "north.key"
plan_update_interval_minutes = 2

[[satellites]]
name = "cubesat"
id = "sat-1"
framing = "ax25"
telemetry = "cubesat.bin"

[[satellites]]
name = "imager"
id = "sat-2"

[stream]
max_elapsed_secs = 120
"#;

    #[test]
    fn test_parse_sample() {
        let config = ModemConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.send_interval(), Duration::from_millis(250));

        let south = &config.ground_stations[0];
        assert!(!south.lookback);
        assert_eq!(south.plan_update_interval_minutes, 5);

        let north = &config.ground_stations[1];
        assert!(north.lookback);
        assert_eq!(north.plan_update_interval(), Duration::from_secs(120));

        let imager = config.satellite("sat-2").unwrap();
        assert_eq!(imager.framing, Framing::Bitstream);
        assert_eq!(imager.telemetry, PathBuf::from("data.bin"));

        assert_eq!(config.stream.max_elapsed_secs, 120);
        assert_eq!(config.stream.initial_backoff_ms, 500);
        assert_eq!(config.accepted_framings(), vec![Framing::Ax25, Framing::Bitstream]);
    }

    #[test]
    fn test_ground_station_selection() {
        let mut config = ModemConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.select_ground_station(Some("south")).unwrap().id, "gs-2");
        assert_eq!(config.select_ground_station(None).unwrap().id, "gs-1");
        assert_eq!(config.select_ground_station(Some("")).unwrap().id, "gs-1");
        assert_eq!(config.select_ground_station(Some("east")).unwrap().id, "gs-1");

        config.default = "missing".to_string();
        assert_eq!(config.select_ground_station(None).unwrap().id, "gs-2");

        config.default.clear();
        assert_eq!(config.select_ground_station(None).unwrap().id, "gs-2");
    }

    #[test]
    fn test_unknown_station_falls_back_to_first() {
        let mut config = ModemConfig::parse(SAMPLE).unwrap();
        config.default.clear();
        assert_eq!(config.select_ground_station(Some("east")).unwrap().id, "gs-2");
    }

    #[test]
    fn test_rejects_bad_stream_settings() {
        let shrinking = SAMPLE.replace("max_elapsed_secs = 120", "multiplier = 0.5");
        assert!(ModemConfig::parse(&shrinking).is_err());

        let negative = SAMPLE.replace("max_elapsed_secs = 120", "multiplier = -1.0");
        assert!(ModemConfig::parse(&negative).is_err());

        let no_delay = SAMPLE.replace("max_elapsed_secs = 120", "initial_backoff_ms = 0");
        assert!(ModemConfig::parse(&no_delay).is_err());
    }

    #[test]
    fn test_rejects_config_without_stations() {
        assert!(ModemConfig::parse("log_level = \"info\"").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = ModemConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ground_stations.len(), 2);

        assert!(ModemConfig::from_file("/nonexistent/config.toml").is_err());
    }
}
