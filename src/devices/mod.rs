//! Device capabilities the engine drives, and the bench that owns them.
//!
//! Vendor protocols (USB HID relay boards, current profilers, I2C power
//! monitors) live behind these traits. The crate ships the RS485 line channel
//! and a simulated bench; hardware drivers plug in through [`Bench::new`].

pub mod commands;
pub mod rs485;
pub mod sim;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::StationConfig;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("device not connected")]
    NotConnected,

    #[error("invalid relay number {id}: board has relays 1..={count}")]
    InvalidRelay { id: u8, count: u8 },

    #[error("invalid channel {0}: expected 1..=3")]
    InvalidChannel(u8),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no {0} driver available; supply one through Bench::new")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// USB relay board. Relay numbers start at 1.
#[async_trait::async_trait]
pub trait RelayBoard: Send + Sync {
    /// Open the board and switch every relay off.
    async fn connect(&mut self) -> Result<(), DeviceError>;
    /// Switch every relay off and release the board. No-op when not connected.
    async fn disconnect(&mut self) -> Result<(), DeviceError>;
    async fn set(&mut self, id: u8, on: bool) -> Result<(), DeviceError>;
    /// Physical state as reported by the board.
    async fn get(&mut self, id: u8) -> Result<bool, DeviceError>;
    async fn all_off(&mut self) -> Result<(), DeviceError>;
}

/// Line-oriented command channel to the DUT firmware.
#[async_trait::async_trait]
pub trait CommandChannel: Send + Sync {
    async fn connect(&mut self) -> Result<(), DeviceError>;
    /// No-op when not connected.
    async fn disconnect(&mut self) -> Result<(), DeviceError>;
    /// Send `command` and collect the response lines up to the prompt.
    ///
    /// `Ok(None)` means the prompt never arrived within `timeout`.
    async fn send(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<String>>, DeviceError>;
}

/// uA-range meter that can also power the DUT from its source output.
#[async_trait::async_trait]
pub trait CurrentMeter: Send + Sync {
    async fn connect(&mut self) -> Result<(), DeviceError>;
    /// Disable the source output and release the meter. No-op when not connected.
    async fn disconnect(&mut self) -> Result<(), DeviceError>;
    async fn set_source_enabled(&mut self, enabled: bool) -> Result<(), DeviceError>;
    /// Average current in uA over `duration`; `None` when sampling failed.
    async fn measure_average(&mut self, duration: Duration) -> Result<Option<f64>, DeviceError>;
}

/// One power-monitor channel sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ChannelReading {
    pub voltage_v: f64,
    pub current_ma: f64,
    pub power_mw: f64,
}

/// Three-channel mA-range power monitor.
#[async_trait::async_trait]
pub trait PowerMonitor: Send + Sync {
    async fn connect(&mut self) -> Result<(), DeviceError>;
    /// No-op when not connected.
    async fn disconnect(&mut self) -> Result<(), DeviceError>;
    /// `Ok(None)` when the channel is out of measurement range.
    async fn read_channel(&mut self, channel: u8) -> Result<Option<ChannelReading>, DeviceError>;
}

/// Which bench device an error or event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    RelayBoard,
    Serial,
    CurrentMeter,
    PowerMonitor,
}

impl DeviceKind {
    /// Connection order. Teardown walks the same list.
    pub const ALL: [DeviceKind; 4] = [
        DeviceKind::RelayBoard,
        DeviceKind::Serial,
        DeviceKind::CurrentMeter,
        DeviceKind::PowerMonitor,
    ];
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::RelayBoard => write!(f, "relay board"),
            DeviceKind::Serial => write!(f, "RS485 channel"),
            DeviceKind::CurrentMeter => write!(f, "uA meter"),
            DeviceKind::PowerMonitor => write!(f, "power monitor"),
        }
    }
}

/// Failure of one device during connect or teardown.
#[derive(Debug, Error)]
#[error("{device}: {source}")]
pub struct BenchError {
    pub device: DeviceKind,
    #[source]
    pub source: DeviceError,
}

/// Every device handle of the station, owned by the engine for a run.
pub struct Bench {
    pub relays: Box<dyn RelayBoard>,
    pub serial: Box<dyn CommandChannel>,
    pub ua_meter: Box<dyn CurrentMeter>,
    pub power: Box<dyn PowerMonitor>,
}

impl Bench {
    pub fn new(
        relays: Box<dyn RelayBoard>,
        serial: Box<dyn CommandChannel>,
        ua_meter: Box<dyn CurrentMeter>,
        power: Box<dyn PowerMonitor>,
    ) -> Self {
        Self {
            relays,
            serial,
            ua_meter,
            power,
        }
    }

    /// Build the bench described by the configuration.
    ///
    /// Only the simulated backend is built in; hardware stations assemble
    /// their drivers and call [`Bench::new`].
    pub fn from_config(config: &StationConfig) -> Result<Self, DeviceError> {
        if config.bench.simulated {
            let (bench, _handle) = sim::simulated_bench(config);
            Ok(bench)
        } else {
            Err(DeviceError::Unsupported("relay board"))
        }
    }

    /// Connect every device in order, stopping at the first failure.
    pub async fn connect_all(&mut self) -> Result<(), BenchError> {
        for device in DeviceKind::ALL {
            let res = match device {
                DeviceKind::RelayBoard => self.relays.connect().await,
                DeviceKind::Serial => self.serial.connect().await,
                DeviceKind::CurrentMeter => self.ua_meter.connect().await,
                DeviceKind::PowerMonitor => self.power.connect().await,
            };
            res.map_err(|source| BenchError { device, source })?;
            info!(%device, "connected");
        }
        Ok(())
    }

    /// Disconnect every device, whatever happened before.
    ///
    /// A failing device does not stop the others from being released; all
    /// failures are returned.
    pub async fn disconnect_all(&mut self) -> Vec<BenchError> {
        let mut failures = Vec::new();
        for device in DeviceKind::ALL {
            let res = match device {
                DeviceKind::RelayBoard => self.relays.disconnect().await,
                DeviceKind::Serial => self.serial.disconnect().await,
                DeviceKind::CurrentMeter => self.ua_meter.disconnect().await,
                DeviceKind::PowerMonitor => self.power.disconnect().await,
            };
            if let Err(source) = res {
                warn!(%device, error = %source, "disconnect failed");
                failures.push(BenchError { device, source });
            }
        }
        failures
    }
}
