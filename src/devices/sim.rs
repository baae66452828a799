//! Software bench for dry runs and tests.
//!
//! All simulated devices share one [`SimState`]. The DUT's view follows the
//! relays: closing `vin` powers it from VIN, closing `battery` (or `ua_meter`
//! with the meter's source enabled) powers it from battery, and each tamper
//! relay closes the matching tamper loop. The DUT firmware runs as a task on
//! the far end of an in-memory pipe and speaks the real line protocol, so the
//! RS485 channel is exercised unchanged.
//!
//! Faults are injected through [`SimHandle`].

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

use super::commands::DutCommand;
use super::rs485::{Rs485Channel, Transport};
use super::{Bench, ChannelReading, CurrentMeter, DeviceError, DeviceKind, PowerMonitor, RelayBoard};
use crate::config::StationConfig;

/// Relay numbers the simulated DUT is wired to.
#[derive(Debug, Clone, Default)]
pub struct Wiring {
    pub battery: Option<u8>,
    pub vin: Option<u8>,
    pub ua_meter: Option<u8>,
    /// DUT tamper input name -> relay number.
    pub tampers: BTreeMap<String, u8>,
}

impl Wiring {
    fn from_config(config: &StationConfig) -> Self {
        let tampers = ["tamper_1", "tamper_2"]
            .into_iter()
            .filter_map(|name| config.relay_id(name).map(|id| (name.to_string(), id)))
            .collect();
        Self {
            battery: config.relay_id("battery"),
            vin: config.relay_id("vin"),
            ua_meter: config.relay_id("ua_meter"),
            tampers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSource {
    None,
    Vin,
    Battery,
}

/// Firmware-side state of the simulated DUT.
#[derive(Debug, Clone)]
pub struct SimDut {
    pub serial: String,
    pub imei: String,
    pub iccid: String,
    pub hardware_ok: BTreeMap<String, bool>,
    pub sleeping: bool,
    pub onboard_relay: bool,
    /// Last value received through `SET_CURRENT`.
    pub reported_current_ua: Option<f64>,
    /// Stops answering while set.
    pub mute: bool,
    /// Tamper inputs that always read OPEN.
    pub broken_tampers: BTreeSet<String>,
    /// Commands that are answered with `ERR`.
    pub rejected: BTreeSet<String>,
    /// Every command received, in order.
    pub received: Vec<String>,
}

#[derive(Debug)]
pub struct SimState {
    pub wiring: Wiring,
    pub relays: Vec<bool>,
    pub stuck_relays: BTreeSet<u8>,
    pub connected: BTreeSet<DeviceKind>,
    pub fail_connect: BTreeSet<DeviceKind>,
    pub fail_disconnect: BTreeSet<DeviceKind>,
    /// Disconnects that released a connected device.
    pub disconnects: BTreeMap<DeviceKind, u32>,
    pub source_enabled: bool,
    pub source_voltage_v: f64,
    pub vin_v: f64,
    pub active_current_ma: f64,
    pub sleep_current_ua: f64,
    /// uA meter sampling failure.
    pub meter_fault: bool,
    /// Power monitor readings forced per channel.
    pub fixed_channels: BTreeMap<u8, ChannelReading>,
    /// Channels that report a range error.
    pub range_error_channels: BTreeSet<u8>,
    pub dut: SimDut,
}

impl SimState {
    fn new(config: &StationConfig) -> Self {
        let hardware_ok = ["flash", "modem", "rtc", "temp_sensor"]
            .into_iter()
            .map(|k| (k.to_string(), true))
            .collect();
        Self {
            wiring: Wiring::from_config(config),
            relays: vec![false; usize::from(config.relay_count())],
            stuck_relays: BTreeSet::new(),
            connected: BTreeSet::new(),
            fail_connect: BTreeSet::new(),
            fail_disconnect: BTreeSet::new(),
            disconnects: BTreeMap::new(),
            source_enabled: false,
            source_voltage_v: f64::from(config.current_meter.source_voltage_mv) / 1000.0,
            vin_v: config.bench.sim_vin_v,
            active_current_ma: config.bench.sim_active_current_ma,
            sleep_current_ua: config.bench.sim_sleep_current_ua,
            meter_fault: false,
            fixed_channels: BTreeMap::new(),
            range_error_channels: BTreeSet::new(),
            dut: SimDut {
                serial: config.bench.sim_serial.clone(),
                imei: "356938035643809".to_string(),
                iccid: "8934071100293849301".to_string(),
                hardware_ok,
                sleeping: false,
                onboard_relay: false,
                reported_current_ua: None,
                mute: false,
                broken_tampers: BTreeSet::new(),
                rejected: BTreeSet::new(),
                received: Vec::new(),
            },
        }
    }

    fn relay(&self, id: Option<u8>) -> bool {
        id.and_then(|id| self.relays.get(usize::from(id).checked_sub(1)?))
            .copied()
            .unwrap_or(false)
    }

    pub fn power_source(&self) -> PowerSource {
        if self.relay(self.wiring.vin) {
            PowerSource::Vin
        } else if self.relay(self.wiring.battery)
            || (self.relay(self.wiring.ua_meter) && self.source_enabled)
        {
            PowerSource::Battery
        } else {
            PowerSource::None
        }
    }

    /// DUT supply current in uA.
    fn dut_current_ua(&self) -> f64 {
        match self.power_source() {
            PowerSource::None => 0.0,
            _ if self.dut.sleeping => self.sleep_current_ua,
            _ => self.active_current_ma * 1000.0,
        }
    }

    fn dut_current_ma(&self) -> f64 {
        match self.power_source() {
            PowerSource::None => 0.0,
            _ if self.dut.sleeping => self.sleep_current_ua / 1000.0,
            _ => self.active_current_ma,
        }
    }

    fn tamper_states(&self) -> BTreeMap<String, String> {
        self.wiring
            .tampers
            .iter()
            .map(|(name, id)| {
                let closed = self.relay(Some(*id)) && !self.dut.broken_tampers.contains(name);
                let state = if closed { "CLOSED" } else { "OPEN" };
                (name.clone(), state.to_string())
            })
            .collect()
    }

    fn check_connected(&self, device: DeviceKind) -> Result<(), DeviceError> {
        if self.connected.contains(&device) {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    fn connect(&mut self, device: DeviceKind) -> Result<(), DeviceError> {
        if self.fail_connect.contains(&device) {
            return Err(DeviceError::Connect(format!("simulated {} not found", device)));
        }
        self.connected.insert(device);
        Ok(())
    }

    /// Release `device`; counts only when it was connected.
    fn disconnect(&mut self, device: DeviceKind) -> Result<(), DeviceError> {
        if !self.connected.remove(&device) {
            return Ok(());
        }
        *self.disconnects.entry(device).or_default() += 1;
        if self.fail_disconnect.contains(&device) {
            return Err(DeviceError::Io(io::Error::other(format!(
                "simulated {} release failure",
                device
            ))));
        }
        Ok(())
    }

    fn all_relays_off(&mut self) {
        for (idx, state) in self.relays.iter_mut().enumerate() {
            let id = u8::try_from(idx + 1).unwrap_or(u8::MAX);
            if !self.stuck_relays.contains(&id) {
                *state = false;
            }
        }
    }

    /// Firmware response to one console line, without the prompt.
    /// `None` means the DUT stays silent.
    fn respond(&mut self, line: &str) -> Option<Vec<String>> {
        self.dut.received.push(line.to_string());
        if self.dut.mute || self.power_source() == PowerSource::None {
            return None;
        }

        let mut out = vec![line.to_string()];
        if self.dut.rejected.contains(line) {
            out.push("ERR: rejected".to_string());
            return Some(out);
        }

        let cmd = match line.parse::<DutCommand>() {
            Ok(cmd) => cmd,
            Err(e) => {
                out.push(format!("ERR: {}", e));
                return Some(out);
            }
        };

        match cmd {
            DutCommand::GetStatus => {
                let source = match self.power_source() {
                    PowerSource::Vin => "VIN",
                    PowerSource::Battery => "BATTERY",
                    PowerSource::None => "NONE",
                };
                let vin = if source == "VIN" { self.vin_v } else { 0.0 };
                let battery = if self.relay(self.wiring.ua_meter) && self.source_enabled {
                    self.source_voltage_v
                } else if self.relay(self.wiring.battery) {
                    3.9
                } else {
                    0.0
                };
                let status = serde_json::json!({
                    "power_source": source,
                    "vin_voltage_v": vin,
                    "battery_voltage_v": battery,
                    "onboard_relay_state": if self.dut.onboard_relay { "ON" } else { "OFF" },
                    "temperature_c": 24.5,
                    "humidity_rh": 41.0,
                    "tamper_states": self.tamper_states(),
                });
                out.push(status.to_string());
            }
            DutCommand::GetInfo => {
                let info = serde_json::json!({
                    "device_serial": self.dut.serial,
                    "imei": self.dut.imei,
                    "iccid": self.dut.iccid,
                    "temp_sensor_id": 1,
                    "hardware_ok": self.dut.hardware_ok,
                });
                out.push(info.to_string());
            }
            DutCommand::GetSerial => out.push(self.dut.serial.clone()),
            DutCommand::GetImei => out.push(self.dut.imei.clone()),
            DutCommand::GetIccid => out.push(self.dut.iccid.clone()),
            DutCommand::Sleep => {
                self.dut.sleeping = true;
                out.push("OK".to_string());
            }
            DutCommand::WakeUp => {
                self.dut.sleeping = false;
                out.push("OK".to_string());
            }
            DutCommand::SetLastCurrent(ua) => {
                self.dut.reported_current_ua = Some(ua);
                out.push("OK".to_string());
            }
            DutCommand::SetSerial(sn) => {
                self.dut.serial = sn;
                out.push("OK".to_string());
            }
            DutCommand::ModemSend => out.push("OK SENT".to_string()),
            DutCommand::BoardRelayOn => {
                self.dut.onboard_relay = true;
                out.push("OK".to_string());
            }
            DutCommand::BoardRelayOff => {
                self.dut.onboard_relay = false;
                out.push("OK".to_string());
            }
        }
        Some(out)
    }
}

/// Shared handle to the simulated bench for fault injection and inspection.
#[derive(Clone)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    pub fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge the bench.
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_connect(&self, device: DeviceKind) {
        self.lock().fail_connect.insert(device);
    }

    pub fn fail_disconnect(&self, device: DeviceKind) {
        self.lock().fail_disconnect.insert(device);
    }

    pub fn stick_relay(&self, id: u8) {
        self.lock().stuck_relays.insert(id);
    }

    pub fn break_tamper(&self, name: &str) {
        self.lock().dut.broken_tampers.insert(name.to_string());
    }

    pub fn reject_command(&self, command: &str) {
        self.lock().dut.rejected.insert(command.to_string());
    }

    pub fn set_sleep_current(&self, ua: f64) {
        self.lock().sleep_current_ua = ua;
    }

    pub fn set_meter_fault(&self, fault: bool) {
        self.lock().meter_fault = fault;
    }

    pub fn set_mute(&self, mute: bool) {
        self.lock().dut.mute = mute;
    }

    pub fn set_serial(&self, serial: &str) {
        self.lock().dut.serial = serial.to_string();
    }

    pub fn fix_channel(&self, channel: u8, reading: ChannelReading) {
        self.lock().fixed_channels.insert(channel, reading);
    }

    pub fn range_error(&self, channel: u8) {
        self.lock().range_error_channels.insert(channel);
    }

    pub fn disconnects(&self, device: DeviceKind) -> u32 {
        self.lock().disconnects.get(&device).copied().unwrap_or(0)
    }

    pub fn is_connected(&self, device: DeviceKind) -> bool {
        self.lock().connected.contains(&device)
    }

    pub fn relay_states(&self) -> Vec<bool> {
        self.lock().relays.clone()
    }

    pub fn received_commands(&self) -> Vec<String> {
        self.lock().dut.received.clone()
    }

    pub fn reported_current(&self) -> Option<f64> {
        self.lock().dut.reported_current_ua
    }
}

/// Build a complete simulated bench and the handle that controls it.
pub fn simulated_bench(config: &StationConfig) -> (Bench, SimHandle) {
    let handle = SimHandle(Arc::new(Mutex::new(SimState::new(config))));
    let bench = Bench::new(
        Box::new(SimRelayBoard(handle.clone())),
        Box::new(Rs485Channel::new(
            SimTransport::new(handle.clone(), &config.serial.prompt),
            config.serial.prompt.clone(),
        )),
        Box::new(SimCurrentMeter(handle.clone())),
        Box::new(SimPowerMonitor(handle.clone())),
    );
    (bench, handle)
}

// ---------------------------------------------------------------------------
// Relay board
// ---------------------------------------------------------------------------

pub struct SimRelayBoard(SimHandle);

impl SimRelayBoard {
    fn index(state: &SimState, id: u8) -> Result<usize, DeviceError> {
        let count = u8::try_from(state.relays.len()).unwrap_or(u8::MAX);
        if id == 0 || id > count {
            return Err(DeviceError::InvalidRelay { id, count });
        }
        Ok(usize::from(id - 1))
    }
}

#[async_trait::async_trait]
impl RelayBoard for SimRelayBoard {
    async fn connect(&mut self) -> Result<(), DeviceError> {
        let mut s = self.0.lock();
        s.connect(DeviceKind::RelayBoard)?;
        s.all_relays_off();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        let mut s = self.0.lock();
        if s.connected.contains(&DeviceKind::RelayBoard) {
            s.all_relays_off();
        }
        s.disconnect(DeviceKind::RelayBoard)
    }

    async fn set(&mut self, id: u8, on: bool) -> Result<(), DeviceError> {
        let mut s = self.0.lock();
        s.check_connected(DeviceKind::RelayBoard)?;
        let idx = Self::index(&s, id)?;
        if s.stuck_relays.contains(&id) {
            debug!(relay = id, on, "simulated relay is stuck, command ignored");
            return Ok(());
        }
        s.relays[idx] = on;
        Ok(())
    }

    async fn get(&mut self, id: u8) -> Result<bool, DeviceError> {
        let s = self.0.lock();
        s.check_connected(DeviceKind::RelayBoard)?;
        let idx = Self::index(&s, id)?;
        Ok(s.relays[idx])
    }

    async fn all_off(&mut self) -> Result<(), DeviceError> {
        let mut s = self.0.lock();
        s.check_connected(DeviceKind::RelayBoard)?;
        s.all_relays_off();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DUT console
// ---------------------------------------------------------------------------

/// Opens an in-memory pipe with the simulated firmware on the far end.
pub struct SimTransport {
    state: SimHandle,
    prompt: String,
}

impl SimTransport {
    pub fn new(state: SimHandle, prompt: &str) -> Self {
        Self {
            state,
            prompt: prompt.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Transport for SimTransport {
    type Io = DuplexStream;

    async fn open(&mut self) -> io::Result<DuplexStream> {
        self.state
            .lock()
            .connect(DeviceKind::Serial)
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
        let (near, far) = tokio::io::duplex(16 * 1024);
        tokio::spawn(run_firmware(far, self.state.clone(), self.prompt.clone()));
        Ok(near)
    }

    async fn release(&mut self) -> io::Result<()> {
        self.state
            .lock()
            .disconnect(DeviceKind::Serial)
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn describe(&self) -> String {
        "simulated DUT console".to_string()
    }
}

/// Firmware console loop; ends when the station side closes the pipe.
async fn run_firmware(io: DuplexStream, state: SimHandle, prompt: String) {
    let mut framed = Framed::new(io, LinesCodec::new());
    while let Some(Ok(line)) = framed.next().await {
        let reply = state.lock().respond(line.trim());
        let Some(reply) = reply else {
            continue;
        };
        for out in reply.iter().chain(std::iter::once(&prompt)) {
            if framed.send(out.as_str()).await.is_err() {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Meters
// ---------------------------------------------------------------------------

pub struct SimCurrentMeter(SimHandle);

#[async_trait::async_trait]
impl CurrentMeter for SimCurrentMeter {
    async fn connect(&mut self) -> Result<(), DeviceError> {
        self.0.lock().connect(DeviceKind::CurrentMeter)
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        let mut s = self.0.lock();
        if s.connected.contains(&DeviceKind::CurrentMeter) {
            s.source_enabled = false;
        }
        s.disconnect(DeviceKind::CurrentMeter)
    }

    async fn set_source_enabled(&mut self, enabled: bool) -> Result<(), DeviceError> {
        let mut s = self.0.lock();
        s.check_connected(DeviceKind::CurrentMeter)?;
        s.source_enabled = enabled;
        Ok(())
    }

    async fn measure_average(&mut self, duration: Duration) -> Result<Option<f64>, DeviceError> {
        self.0.lock().check_connected(DeviceKind::CurrentMeter)?;
        tokio::time::sleep(duration).await;

        let s = self.0.lock();
        if s.meter_fault {
            return Ok(None);
        }
        // Only current drawn through the meter's own source is visible to it.
        let on_meter = s.source_enabled
            && s.relay(s.wiring.ua_meter)
            && s.power_source() == PowerSource::Battery;
        if on_meter {
            Ok(Some(s.dut_current_ua()))
        } else {
            Ok(Some(0.0))
        }
    }
}

pub struct SimPowerMonitor(SimHandle);

#[async_trait::async_trait]
impl PowerMonitor for SimPowerMonitor {
    async fn connect(&mut self) -> Result<(), DeviceError> {
        self.0.lock().connect(DeviceKind::PowerMonitor)
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.0.lock().disconnect(DeviceKind::PowerMonitor)
    }

    async fn read_channel(&mut self, channel: u8) -> Result<Option<ChannelReading>, DeviceError> {
        let s = self.0.lock();
        s.check_connected(DeviceKind::PowerMonitor)?;
        if !(1..=3).contains(&channel) {
            return Err(DeviceError::InvalidChannel(channel));
        }
        if s.range_error_channels.contains(&channel) {
            return Ok(None);
        }
        if let Some(fixed) = s.fixed_channels.get(&channel) {
            return Ok(Some(*fixed));
        }

        // 1: VIN input, 2: battery input, 3: 3V3 rail.
        let (voltage_v, current_ma) = match (channel, s.power_source()) {
            (1, PowerSource::Vin) => (s.vin_v, s.dut_current_ma()),
            (2, PowerSource::Battery) => (s.source_voltage_v, s.dut_current_ma()),
            (3, PowerSource::Vin | PowerSource::Battery) => (3.3, s.dut_current_ma()),
            _ => (0.0, 0.0),
        };
        Ok(Some(ChannelReading {
            voltage_v,
            current_ma,
            power_mw: voltage_v * current_ma,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bench() -> (Bench, SimHandle) {
        simulated_bench(&StationConfig::default())
    }

    #[tokio::test]
    async fn test_relay_range_is_checked() {
        let (mut b, _h) = bench();
        b.relays.connect().await.unwrap();
        let err = b.relays.set(6, true).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidRelay { id: 6, count: 5 }));
        assert!(matches!(
            b.relays.get(0).await,
            Err(DeviceError::InvalidRelay { .. })
        ));
    }

    #[tokio::test]
    async fn test_relay_requires_connection() {
        let (mut b, _h) = bench();
        assert!(matches!(
            b.relays.set(1, true).await,
            Err(DeviceError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_turns_relays_off() {
        let (mut b, h) = bench();
        b.relays.connect().await.unwrap();
        b.relays.set(1, true).await.unwrap();
        b.relays.set(3, true).await.unwrap();
        b.relays.disconnect().await.unwrap();
        assert!(h.relay_states().iter().all(|on| !on));
        assert_eq!(h.disconnects(DeviceKind::RelayBoard), 1);

        // Second disconnect is a no-op.
        b.relays.disconnect().await.unwrap();
        assert_eq!(h.disconnects(DeviceKind::RelayBoard), 1);
    }

    #[tokio::test]
    async fn test_stuck_relay_reads_back_off() {
        let (mut b, h) = bench();
        h.stick_relay(2);
        b.relays.connect().await.unwrap();
        b.relays.set(2, true).await.unwrap();
        assert!(!b.relays.get(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_dut_follows_power_relays() {
        let (mut b, _h) = bench();
        b.connect_all().await.unwrap();
        let t = Duration::from_millis(500);

        // Unpowered DUT stays silent.
        assert!(b.serial.send("GETSTATUS", t).await.unwrap().is_none());

        b.relays.set(2, true).await.unwrap();
        let lines = b.serial.send("GETSTATUS", t).await.unwrap().unwrap();
        let status = crate::model::DutStatus::from_transcript(&lines).unwrap();
        assert_eq!(status.power_source, "VIN");
        assert_eq!(status.tamper_states["tamper_1"], "OPEN");

        b.relays.set(3, true).await.unwrap();
        let lines = b.serial.send("GETSTATUS", t).await.unwrap().unwrap();
        let status = crate::model::DutStatus::from_transcript(&lines).unwrap();
        assert_eq!(status.tamper_states["tamper_1"], "CLOSED");
        assert_eq!(status.tamper_states["tamper_2"], "OPEN");
    }

    #[tokio::test]
    async fn test_meter_sees_sleep_current_only_on_its_source() {
        let (mut b, h) = bench();
        h.set_sleep_current(12.5);
        b.connect_all().await.unwrap();

        assert_eq!(b.ua_meter.measure_average(Duration::ZERO).await.unwrap(), Some(0.0));

        b.ua_meter.set_source_enabled(true).await.unwrap();
        b.relays.set(5, true).await.unwrap();
        let t = Duration::from_millis(500);
        b.serial.send("SLEEP", t).await.unwrap().unwrap();
        let ua = b.ua_meter.measure_average(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(ua, 12.5);

        h.set_meter_fault(true);
        assert_eq!(b.ua_meter.measure_average(Duration::ZERO).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_power_monitor_channels() {
        let (mut b, h) = bench();
        b.connect_all().await.unwrap();
        assert!(matches!(
            b.power.read_channel(4).await,
            Err(DeviceError::InvalidChannel(4))
        ));

        b.relays.set(2, true).await.unwrap();
        let r = b.power.read_channel(1).await.unwrap().unwrap();
        assert_eq!(r.voltage_v, 12.0);
        assert_eq!(r.current_ma, 42.0);

        h.range_error(1);
        assert!(b.power.read_channel(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bench_disconnect_is_best_effort() {
        let (mut b, h) = bench();
        b.connect_all().await.unwrap();
        h.fail_disconnect(DeviceKind::Serial);

        let failures = b.disconnect_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].device, DeviceKind::Serial);
        for device in DeviceKind::ALL {
            assert_eq!(h.disconnects(device), 1, "{} not released", device);
            assert!(!h.is_connected(device));
        }
    }

    #[tokio::test]
    async fn test_connect_stops_at_first_failure() {
        let (mut b, h) = bench();
        h.fail_connect(DeviceKind::Serial);
        let err = b.connect_all().await.unwrap_err();
        assert_eq!(err.device, DeviceKind::Serial);
        assert!(h.is_connected(DeviceKind::RelayBoard));
        assert!(!h.is_connected(DeviceKind::CurrentMeter));
    }
}
