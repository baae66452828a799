//! TOML configuration for the test station.
//!
//! Every section has compiled-in defaults so a partial file (or no file at
//! all) yields a usable configuration. The loaded value is passed explicitly
//! into the engine; nothing here is global.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::sequence::Sequence;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "XMNZ_TESTER_CONFIG";
/// Environment variable overriding `api.key`.
pub const API_KEY_ENV: &str = "XMNZ_API_KEY";
/// Looked up in the working directory when nothing else is given.
pub const DEFAULT_CONFIG_FILE: &str = "station.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for one station.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub station_id: String,
    /// Halt the sequence after the first FAIL.
    pub stop_on_fail: bool,
    /// Directory for per-run result files.
    pub log_dir: PathBuf,
    /// Relay name -> 1-based relay number on the board.
    pub relays: BTreeMap<String, u8>,
    pub serial: SerialConfig,
    pub current_meter: CurrentMeterConfig,
    pub power_monitor: PowerMonitorConfig,
    pub thresholds: Thresholds,
    pub timing: TimingConfig,
    pub api: ApiConfig,
    /// Per-step display templates; `{}` becomes the 1-based step index.
    pub messages: BTreeMap<String, String>,
    pub bench: BenchConfig,
    /// Replaces the built-in sequence when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Sequence>,
}

impl Default for StationConfig {
    fn default() -> Self {
        let relays = [
            ("battery", 1),
            ("vin", 2),
            ("tamper_1", 3),
            ("tamper_2", 4),
            ("ua_meter", 5),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            station_id: "XMNZ-STATION-01".to_string(),
            stop_on_fail: true,
            log_dir: PathBuf::from("results"),
            relays,
            serial: SerialConfig::default(),
            current_meter: CurrentMeterConfig::default(),
            power_monitor: PowerMonitorConfig::default(),
            thresholds: Thresholds::default(),
            timing: TimingConfig::default(),
            api: ApiConfig::default(),
            messages: BTreeMap::new(),
            bench: BenchConfig::default(),
            sequence: None,
        }
    }
}

impl StationConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env_overrides();
        config.validate()?;
        info!(path = %path.display(), station = %config.station_id, "loaded station configuration");
        Ok(config)
    }

    /// Resolve the configuration, in order:
    /// 1. `explicit` if given.
    /// 2. The path in `XMNZ_TESTER_CONFIG`.
    /// 3. `./station.toml` if it exists.
    /// 4. Compiled-in defaults.
    ///
    /// A file that is named but unreadable is an error, not a silent fallback.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&env_path));
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::load(local);
        }

        debug!("no config file found, using compiled-in defaults");
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            self.api.key = key;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.station_id.trim().is_empty() {
            return Err(ConfigError::Invalid("station_id is empty".into()));
        }

        let mut seen = BTreeMap::new();
        for (name, id) in &self.relays {
            if *id == 0 {
                return Err(ConfigError::Invalid(format!(
                    "relay '{}' has id 0; relay ids start at 1",
                    name
                )));
            }
            if let Some(other) = seen.insert(*id, name) {
                return Err(ConfigError::Invalid(format!(
                    "relays '{}' and '{}' share id {}",
                    other, name, id
                )));
            }
        }

        let t = &self.thresholds;
        for (name, value) in [
            ("sleep_current_max_ua", t.sleep_current_max_ua),
            ("active_current_min_ma", t.active_current_min_ma),
            ("active_current_max_ma", t.active_current_max_ma),
            ("vin_min_v", t.vin_min_v),
            ("vin_max_v", t.vin_max_v),
            ("battery_min_v", t.battery_min_v),
            ("battery_max_v", t.battery_max_v),
        ] {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "thresholds.{} must be positive, got {}",
                    name, value
                )));
            }
        }
        for (label, min, max) in [
            ("active_current", t.active_current_min_ma, t.active_current_max_ma),
            ("vin", t.vin_min_v, t.vin_max_v),
            ("battery", t.battery_min_v, t.battery_max_v),
        ] {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "thresholds.{}: min {} exceeds max {}",
                    label, min, max
                )));
            }
        }

        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("serial.baud_rate must be positive".into()));
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(ConfigError::Invalid(format!(
                "serial.data_bits {} out of range 5..=8",
                self.serial.data_bits
            )));
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            return Err(ConfigError::Invalid(format!(
                "serial.stop_bits {} must be 1 or 2",
                self.serial.stop_bits
            )));
        }

        if !(1..=3).contains(&self.power_monitor.channel) {
            return Err(ConfigError::Invalid(format!(
                "power_monitor.channel {} out of range 1..=3",
                self.power_monitor.channel
            )));
        }

        if let Some(seq) = &self.sequence {
            if seq.is_empty() {
                return Err(ConfigError::Invalid("sequence is empty".into()));
            }
        }

        Ok(())
    }

    pub fn relay_id(&self, name: &str) -> Option<u8> {
        self.relays.get(name).copied()
    }

    /// Number of relays the board must expose: the highest mapped id.
    pub fn relay_count(&self) -> u8 {
        self.relays.values().copied().max().unwrap_or(0)
    }

    /// Sequence to run: the configured one, else the built-in default.
    pub fn sequence(&self) -> Sequence {
        self.sequence.clone().unwrap_or_default()
    }

    /// Display text for the step at `index` (0-based).
    pub fn step_message(&self, key: &str, index: usize) -> String {
        match self.messages.get(key) {
            Some(template) => template.replacen("{}", &(index + 1).to_string(), 1),
            None => format!("Step {}: {}", index + 1, key),
        }
    }
}

// ---------------------------------------------------------------------------
// Serial (RS485)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub port: PathBuf,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: LineParity,
    pub stop_bits: u8,
    pub timeout_ms: u64,
    /// Line that closes every DUT response.
    pub prompt: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: PathBuf::from("/dev/ttyUSB0"),
            baud_rate: 115_200,
            data_bits: 8,
            parity: LineParity::None,
            stop_bits: 1,
            timeout_ms: 2_000,
            prompt: ">".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineParity {
    None,
    Odd,
    Even,
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Meters
// ---------------------------------------------------------------------------

/// uA-range meter that can also source power to the DUT.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentMeterConfig {
    pub serial_number: Option<String>,
    pub source_voltage_mv: u32,
    pub measure_duration_ms: u64,
}

impl Default for CurrentMeterConfig {
    fn default() -> Self {
        Self {
            serial_number: None,
            source_voltage_mv: 3_700,
            measure_duration_ms: 3_000,
        }
    }
}

/// Three-channel mA-range power monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerMonitorConfig {
    pub i2c_bus: u8,
    pub address: u8,
    pub shunt_ohms: f64,
    /// Channel read by `measure_active_power` when the step gives none.
    pub channel: u8,
}

impl Default for PowerMonitorConfig {
    fn default() -> Self {
        Self {
            i2c_bus: 1,
            address: 0x40,
            shunt_ohms: 0.1,
            channel: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Thresholds and timing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Sleep current must be strictly below this.
    pub sleep_current_max_ua: f64,
    pub active_current_min_ma: f64,
    pub active_current_max_ma: f64,
    pub vin_min_v: f64,
    pub vin_max_v: f64,
    pub battery_min_v: f64,
    pub battery_max_v: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            sleep_current_max_ua: 50.0,
            active_current_min_ma: 5.0,
            active_current_max_ma: 150.0,
            vin_min_v: 11.0,
            vin_max_v: 13.0,
            battery_min_v: 3.3,
            battery_max_v: 4.2,
        }
    }
}

/// Settle delays and long-running command timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub relay_settle_ms: u64,
    pub power_settle_ms: u64,
    pub sleep_settle_ms: u64,
    pub wakeup_settle_ms: u64,
    pub modem_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            relay_settle_ms: 200,
            power_settle_ms: 1_000,
            sleep_settle_ms: 1_000,
            wakeup_settle_ms: 500,
            modem_timeout_ms: 30_000,
        }
    }
}

impl TimingConfig {
    /// No delays at all; for dry runs against the simulated bench.
    pub fn zero() -> Self {
        Self {
            relay_settle_ms: 0,
            power_settle_ms: 0,
            sleep_settle_ms: 0,
            wakeup_settle_ms: 0,
            modem_timeout_ms: 2_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Remote API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Results are not uploaded when unset.
    pub endpoint_url: Option<String>,
    /// Bearer token.
    pub key: String,
    pub request_timeout_s: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            key: String::new(),
            request_timeout_s: 10,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s)
    }
}

// ---------------------------------------------------------------------------
// Bench
// ---------------------------------------------------------------------------

/// Selects the device backend and tunes the simulated DUT.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub simulated: bool,
    pub sim_sleep_current_ua: f64,
    pub sim_active_current_ma: f64,
    pub sim_vin_v: f64,
    pub sim_serial: String,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            simulated: true,
            sim_sleep_current_ua: 18.5,
            sim_active_current_ma: 42.0,
            sim_vin_v: 12.0,
            sim_serial: "25070001".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = StationConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.relay_count(), 5);
        assert_eq!(cfg.relay_id("vin"), Some(2));
        assert!(cfg.stop_on_fail);
        assert_eq!(cfg.sequence().len(), 16);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("station.toml");
        std::fs::write(
            &path,
            r#"
            station_id = "LINE-3"
            stop_on_fail = false

            [thresholds]
            sleep_current_max_ua = 30.0

            [relays]
            battery = 1
            vin = 2
            "#,
        )
        .unwrap();

        let cfg = StationConfig::load(&path).unwrap();
        assert_eq!(cfg.station_id, "LINE-3");
        assert!(!cfg.stop_on_fail);
        assert_eq!(cfg.thresholds.sleep_current_max_ua, 30.0);
        assert_eq!(cfg.thresholds.vin_min_v, 11.0);
        assert_eq!(cfg.relay_count(), 2);
        assert_eq!(cfg.serial.baud_rate, 115_200);
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = StationConfig::load(Path::new("/nonexistent/station.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "station_id = [").unwrap();
        let err = StationConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_duplicate_relay_ids_rejected() {
        let mut cfg = StationConfig::default();
        cfg.relays.insert("extra".into(), 2);
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_relay_id_rejected() {
        let mut cfg = StationConfig::default();
        cfg.relays.insert("extra".into(), 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_inverted_window_rejected() {
        let mut cfg = StationConfig::default();
        cfg.thresholds.vin_min_v = 14.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_non_positive_or_nan_threshold_rejected() {
        let mut cfg = StationConfig::default();
        cfg.thresholds.vin_min_v = -1.0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("vin_min_v"), "{}", err);

        let mut cfg = StationConfig::default();
        cfg.thresholds.sleep_current_max_ua = f64::NAN;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("sleep_current_max_ua"), "{}", err);

        let mut cfg = StationConfig::default();
        cfg.thresholds.active_current_min_ma = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_serial_line_settings() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("station.toml");
        std::fs::write(
            &path,
            r#"
            [serial]
            port = "/dev/ttyS1"
            baud_rate = 9600
            parity = "even"
            stop_bits = 2
            "#,
        )
        .unwrap();
        let cfg = StationConfig::load(&path).unwrap();
        assert_eq!(cfg.serial.parity, LineParity::Even);
        assert_eq!(cfg.serial.stop_bits, 2);
        assert_eq!(cfg.serial.data_bits, 8);
        cfg.validate().unwrap();

        let mut cfg = StationConfig::default();
        cfg.serial.data_bits = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_step_message_template() {
        let mut cfg = StationConfig::default();
        cfg.messages
            .insert("apply_vin".into(), "Paso {}: Aplicando VIN".into());
        assert_eq!(cfg.step_message("apply_vin", 1), "Paso 2: Aplicando VIN");
        assert_eq!(cfg.step_message("get_barcode", 14), "Step 15: get_barcode");
    }
}
