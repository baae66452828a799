//! Parsed views over the DUT's JSON replies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Value the firmware contract uses when a field is absent.
pub const FIELD_ERROR: &str = "ERROR";

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("no JSON payload in DUT response")]
    Missing,

    #[error("malformed JSON payload: {0}")]
    Malformed(String),
}

fn field_error() -> String {
    FIELD_ERROR.to_string()
}

fn minus_one() -> i64 {
    -1
}

/// Live status snapshot (`GETSTATUS`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DutStatus {
    #[serde(default = "field_error")]
    pub power_source: String,
    #[serde(default)]
    pub vin_voltage_v: f64,
    #[serde(default)]
    pub battery_voltage_v: f64,
    #[serde(default = "field_error")]
    pub onboard_relay_state: String,
    #[serde(default)]
    pub temperature_c: f64,
    #[serde(default)]
    pub humidity_rh: f64,
    #[serde(default)]
    pub tamper_states: BTreeMap<String, String>,
}

/// Identity and factory self-check (`GETINFO`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DutInfo {
    #[serde(default = "field_error")]
    pub device_serial: String,
    #[serde(default = "field_error")]
    pub imei: String,
    #[serde(default = "field_error")]
    pub iccid: String,
    #[serde(default = "minus_one")]
    pub temp_sensor_id: i64,
    #[serde(default)]
    pub hardware_ok: BTreeMap<String, bool>,
}

impl DutStatus {
    pub fn from_transcript(lines: &[String]) -> Result<Self, PayloadError> {
        parse_payload(lines)
    }
}

impl DutInfo {
    pub fn from_transcript(lines: &[String]) -> Result<Self, PayloadError> {
        parse_payload(lines)
    }

    /// Names of hardware self-checks the firmware reported as failed.
    pub fn failed_hardware(&self) -> Vec<&str> {
        self.hardware_ok
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn has_valid_serial(&self) -> bool {
        let s = self.device_serial.trim();
        !s.is_empty() && s != FIELD_ERROR
    }
}

/// Extract the JSON object from a serial transcript.
///
/// The firmware may echo the command or print log lines before the payload;
/// everything from the first line opening with `{` onwards is the object.
fn parse_payload<T: serde::de::DeserializeOwned>(lines: &[String]) -> Result<T, PayloadError> {
    let start = lines
        .iter()
        .position(|l| l.trim_start().starts_with('{'))
        .ok_or(PayloadError::Missing)?;
    let body = lines[start..].join("\n");
    serde_json::from_str(&body).map_err(|e| PayloadError::Malformed(e.to_string()))
}
