//! Built-in production steps.
//!
//! Every handler reports at least one outcome. Device errors are returned
//! with context and become a FAIL record in the engine; expected failures
//! (threshold violations, read-back mismatches, bad payloads) are reported
//! here so the record carries the measured values.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::context::{details, StepContext};
use super::registry::StepHandler;
use crate::devices::commands::{is_rejection, DutCommand};
use crate::model::{DutInfo, DutStatus, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinStep {
    ConnectBattery,
    ApplyVin,
    CheckInitialStatus,
    MeasureActivePower,
    TestTampers,
    TestOnboardRelay,
    DisconnectBattery,
    SimulateBattery,
    DisconnectVin,
    CheckBoardStatus,
    SetLowPowerMode,
    MeasureSleepCurrent,
    WakeupFromSleep,
    SendCurrentResult,
    GetBarcode,
    ModemSend,
}

impl BuiltinStep {
    pub const ALL: [BuiltinStep; 16] = [
        BuiltinStep::ConnectBattery,
        BuiltinStep::ApplyVin,
        BuiltinStep::CheckInitialStatus,
        BuiltinStep::MeasureActivePower,
        BuiltinStep::TestTampers,
        BuiltinStep::TestOnboardRelay,
        BuiltinStep::DisconnectBattery,
        BuiltinStep::SimulateBattery,
        BuiltinStep::DisconnectVin,
        BuiltinStep::CheckBoardStatus,
        BuiltinStep::SetLowPowerMode,
        BuiltinStep::MeasureSleepCurrent,
        BuiltinStep::WakeupFromSleep,
        BuiltinStep::SendCurrentResult,
        BuiltinStep::GetBarcode,
        BuiltinStep::ModemSend,
    ];

    pub fn key(self) -> &'static str {
        match self {
            BuiltinStep::ConnectBattery => "connect_battery",
            BuiltinStep::ApplyVin => "apply_vin",
            BuiltinStep::CheckInitialStatus => "check_initial_status",
            BuiltinStep::MeasureActivePower => "measure_active_power",
            BuiltinStep::TestTampers => "test_tampers",
            BuiltinStep::TestOnboardRelay => "test_onboard_relay",
            BuiltinStep::DisconnectBattery => "disconnect_battery",
            BuiltinStep::SimulateBattery => "simulate_battery",
            BuiltinStep::DisconnectVin => "disconnect_vin",
            BuiltinStep::CheckBoardStatus => "check_board_status",
            BuiltinStep::SetLowPowerMode => "set_low_power_mode",
            BuiltinStep::MeasureSleepCurrent => "measure_sleep_current",
            BuiltinStep::WakeupFromSleep => "wakeup_from_sleep",
            BuiltinStep::SendCurrentResult => "send_current_result",
            BuiltinStep::GetBarcode => "get_barcode",
            BuiltinStep::ModemSend => "modem_send",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.key() == key)
    }
}

#[async_trait::async_trait]
impl StepHandler for BuiltinStep {
    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        match self {
            BuiltinStep::ConnectBattery => switch_relay(ctx, "battery", true).await.map(drop),
            BuiltinStep::ApplyVin => power_relay(ctx, "vin", true).await,
            BuiltinStep::CheckInitialStatus => check_power_status(ctx, "VIN").await,
            BuiltinStep::MeasureActivePower => measure_active_power(ctx).await,
            BuiltinStep::TestTampers => test_tampers(ctx).await,
            BuiltinStep::TestOnboardRelay => test_onboard_relay(ctx).await,
            BuiltinStep::DisconnectBattery => switch_relay(ctx, "battery", false).await.map(drop),
            BuiltinStep::SimulateBattery => simulate_battery(ctx).await,
            BuiltinStep::DisconnectVin => power_relay(ctx, "vin", false).await,
            BuiltinStep::CheckBoardStatus => check_power_status(ctx, "BATTERY").await,
            BuiltinStep::SetLowPowerMode => {
                let settle = ctx.config.timing.sleep_settle_ms;
                ack_step(ctx, DutCommand::Sleep, "DUT entered low-power mode", settle).await
            }
            BuiltinStep::MeasureSleepCurrent => measure_sleep_current(ctx).await,
            BuiltinStep::WakeupFromSleep => {
                let settle = ctx.config.timing.wakeup_settle_ms;
                ack_step(ctx, DutCommand::WakeUp, "DUT woke up", settle).await
            }
            BuiltinStep::SendCurrentResult => send_current_result(ctx).await,
            BuiltinStep::GetBarcode => get_barcode(ctx).await,
            BuiltinStep::ModemSend => modem_send(ctx).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Sleep-current pass criterion: strictly below the limit.
pub fn below_threshold(measured: f64, threshold: f64) -> bool {
    measured < threshold
}

fn in_window(value: f64, min: f64, max: f64) -> bool {
    (min..=max).contains(&value)
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

fn open_closed(closed: bool) -> &'static str {
    if closed {
        "CLOSED"
    } else {
        "OPEN"
    }
}

/// Commanded vs. read-back state of one relay.
struct RelayCheck {
    name: String,
    id: u8,
    commanded: bool,
    actual: bool,
}

impl RelayCheck {
    fn ok(&self) -> bool {
        self.commanded == self.actual
    }

    fn details(&self) -> Map<String, Value> {
        details([
            ("relay", json!(self.name)),
            ("relay_id", json!(self.id)),
            ("commanded", json!(on_off(self.commanded))),
            ("actual", json!(on_off(self.actual))),
        ])
    }
}

/// Set a relay and read the physical state back. Reports nothing.
async fn drive_relay(ctx: &mut StepContext<'_>, name: &str, on: bool) -> Result<RelayCheck> {
    let id = ctx
        .config
        .relay_id(name)
        .with_context(|| format!("relay '{}' is not mapped", name))?;
    ctx.bench
        .relays
        .set(id, on)
        .await
        .with_context(|| format!("setting relay {} ({})", name, id))?;
    ctx.settle(ctx.config.timing.relay_settle_ms).await;
    let actual = ctx
        .bench
        .relays
        .get(id)
        .await
        .with_context(|| format!("reading back relay {} ({})", name, id))?;
    debug!(relay = id, commanded = on, actual, "relay read-back");
    Ok(RelayCheck {
        name: name.to_string(),
        id,
        commanded: on,
        actual,
    })
}

/// Drive a relay and report the verified outcome. Returns whether it took.
async fn switch_relay(ctx: &mut StepContext<'_>, name: &str, on: bool) -> Result<bool> {
    let check = drive_relay(ctx, name, on).await?;
    if check.ok() {
        ctx.report(
            Status::Pass,
            format!("Relay {} ({}) {}", name, check.id, on_off(on)),
            check.details(),
        );
    } else {
        ctx.report(
            Status::Fail,
            format!(
                "Relay {} ({}) commanded {} but reads {}",
                name,
                check.id,
                on_off(on),
                on_off(check.actual)
            ),
            check.details(),
        );
    }
    Ok(check.ok())
}

/// Switch a supply relay, then let the DUT rails settle.
async fn power_relay(ctx: &mut StepContext<'_>, name: &str, on: bool) -> Result<()> {
    if switch_relay(ctx, name, on).await? {
        ctx.settle(ctx.config.timing.power_settle_ms).await;
    }
    Ok(())
}

/// How the DUT answered one command.
enum Reply {
    Lines(Vec<String>),
    Timeout,
    Rejected(String),
}

async fn exchange(ctx: &mut StepContext<'_>, command: &DutCommand, timeout: Duration) -> Result<Reply> {
    let wire = command.to_string();
    let lines = ctx
        .bench
        .serial
        .send(&wire, timeout)
        .await
        .with_context(|| format!("sending {}", wire))?;
    Ok(match lines {
        None => Reply::Timeout,
        Some(lines) if is_rejection(&lines) => {
            let line = lines
                .iter()
                .find(|l| is_rejection(std::slice::from_ref(*l)))
                .cloned()
                .unwrap_or_default();
            Reply::Rejected(line)
        }
        Some(lines) => Reply::Lines(lines),
    })
}

/// Why a command produced no usable answer.
fn reply_failure(command: &DutCommand, reply: &Reply, timeout: Duration) -> Option<String> {
    match reply {
        Reply::Lines(_) => None,
        Reply::Timeout => Some(format!(
            "No response to {} within {} ms",
            command,
            timeout.as_millis()
        )),
        Reply::Rejected(line) => Some(format!("DUT rejected {}: {}", command, line)),
    }
}

/// Send a command that only needs an acknowledgement. Reports FAIL when the
/// DUT stays silent or rejects it.
async fn expect_ack(ctx: &mut StepContext<'_>, command: DutCommand, timeout: Duration) -> Result<bool> {
    let reply = exchange(ctx, &command, timeout).await?;
    match reply_failure(&command, &reply, timeout) {
        None => Ok(true),
        Some(reason) => {
            ctx.report(
                Status::Fail,
                reason,
                details([("command", json!(command.to_string()))]),
            );
            Ok(false)
        }
    }
}

async fn ack_step(
    ctx: &mut StepContext<'_>,
    command: DutCommand,
    message: &str,
    settle_ms: u64,
) -> Result<()> {
    let timeout = ctx.config.serial.timeout();
    if expect_ack(ctx, command, timeout).await? {
        ctx.settle(settle_ms).await;
        ctx.pass(message);
    }
    Ok(())
}

/// `GETSTATUS` without reporting. The inner `Err` is a reportable reason.
async fn read_status(ctx: &mut StepContext<'_>) -> Result<std::result::Result<DutStatus, String>> {
    let timeout = ctx.config.serial.timeout();
    let command = DutCommand::GetStatus;
    let reply = exchange(ctx, &command, timeout).await?;
    if let Some(reason) = reply_failure(&command, &reply, timeout) {
        ctx.dut.status = None;
        return Ok(Err(reason));
    }
    let Reply::Lines(lines) = reply else {
        return Ok(Err(format!("No status from {}", command)));
    };
    match DutStatus::from_transcript(&lines) {
        Ok(status) => {
            ctx.dut.status = Some(status.clone());
            Ok(Ok(status))
        }
        Err(e) => {
            ctx.dut.status = None;
            Ok(Err(format!("Invalid status payload: {}", e)))
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// `GETSTATUS` and check power source plus the matching supply voltage.
async fn check_power_status(ctx: &mut StepContext<'_>, default_source: &str) -> Result<()> {
    let expected = ctx
        .definition
        .str_kwarg("expect_power_source")
        .unwrap_or(default_source)
        .to_ascii_uppercase();

    let status = match read_status(ctx).await? {
        Ok(status) => status,
        Err(reason) => {
            ctx.fail(reason);
            return Ok(());
        }
    };

    let t = &ctx.config.thresholds;
    let (label, voltage, min, max) = if expected == "BATTERY" {
        ("battery", status.battery_voltage_v, t.battery_min_v, t.battery_max_v)
    } else {
        ("VIN", status.vin_voltage_v, t.vin_min_v, t.vin_max_v)
    };

    let d = details([
        ("power_source", json!(status.power_source)),
        ("expected_power_source", json!(expected)),
        ("vin_voltage_v", json!(status.vin_voltage_v)),
        ("battery_voltage_v", json!(status.battery_voltage_v)),
        ("temperature_c", json!(status.temperature_c)),
        ("humidity_rh", json!(status.humidity_rh)),
    ]);

    if !status.power_source.eq_ignore_ascii_case(&expected) {
        ctx.report(
            Status::Fail,
            format!(
                "DUT power source is {}, expected {}",
                status.power_source, expected
            ),
            d,
        );
    } else if !in_window(voltage, min, max) {
        ctx.report(
            Status::Fail,
            format!(
                "DUT {} voltage {:.2} V outside [{:.2}, {:.2}] V",
                label, voltage, min, max
            ),
            d,
        );
    } else {
        ctx.report(
            Status::Pass,
            format!("DUT powered from {} at {:.2} V", expected, voltage),
            d,
        );
    }
    Ok(())
}

async fn measure_active_power(ctx: &mut StepContext<'_>) -> Result<()> {
    let definition = ctx.definition;
    let channel = match definition.arg("channel", 0) {
        None => ctx.config.power_monitor.channel,
        Some(arg) => match arg.as_u64().and_then(|ch| u8::try_from(ch).ok()) {
            Some(ch) => ch,
            None => {
                ctx.report(
                    Status::Fail,
                    format!("Invalid power monitor channel argument: {}", arg),
                    details([("channel", arg.clone())]),
                );
                return Ok(());
            }
        },
    };

    let Some(reading) = ctx
        .bench
        .power
        .read_channel(channel)
        .await
        .with_context(|| format!("reading power monitor channel {}", channel))?
    else {
        ctx.report(
            Status::Fail,
            format!("Power monitor channel {} out of measurement range", channel),
            details([("channel", json!(channel))]),
        );
        return Ok(());
    };

    let t = &ctx.config.thresholds;
    let (min, max) = (t.active_current_min_ma, t.active_current_max_ma);
    let d = details([
        ("channel", json!(channel)),
        ("voltage_v", json!(reading.voltage_v)),
        ("current_ma", json!(reading.current_ma)),
        ("power_mw", json!(reading.power_mw)),
        ("min_ma", json!(min)),
        ("max_ma", json!(max)),
    ]);

    if in_window(reading.current_ma, min, max) {
        ctx.report(
            Status::Pass,
            format!(
                "Active current {:.2} mA at {:.2} V (channel {})",
                reading.current_ma, reading.voltage_v, channel
            ),
            d,
        );
    } else {
        ctx.report(
            Status::Fail,
            format!(
                "Active current {:.2} mA outside [{:.2}, {:.2}] mA (channel {})",
                reading.current_ma, min, max, channel
            ),
            d,
        );
    }
    Ok(())
}

const TAMPER_INPUTS: [&str; 2] = ["tamper_1", "tamper_2"];

/// Every combination of the two tamper relays, in test order.
const TAMPER_COMBINATIONS: [[bool; 2]; 4] =
    [[false, false], [true, false], [false, true], [true, true]];

/// One truth-table row. Device errors are returned; the caller reports them
/// against this row and moves on.
async fn check_tamper_combination(
    ctx: &mut StepContext<'_>,
    combo: [bool; 2],
) -> Result<(bool, String, Map<String, Value>)> {
    let label = TAMPER_INPUTS
        .iter()
        .zip(combo)
        .map(|(name, closed)| format!("{}={}", name, open_closed(closed)))
        .collect::<Vec<_>>()
        .join(" ");

    let mut d = Map::new();
    for (name, closed) in TAMPER_INPUTS.iter().zip(combo) {
        let check = drive_relay(ctx, name, closed).await?;
        if !check.ok() {
            let msg = format!(
                "Tamper {}: relay {} ({}) commanded {} but reads {}",
                label,
                name,
                check.id,
                on_off(closed),
                on_off(check.actual)
            );
            return Ok((false, msg, check.details()));
        }
    }
    ctx.settle(ctx.config.timing.relay_settle_ms).await;

    let status = match read_status(ctx).await? {
        Ok(status) => status,
        Err(reason) => return Ok((false, format!("Tamper {}: {}", label, reason), d)),
    };

    let mut mismatches = Vec::new();
    for (name, closed) in TAMPER_INPUTS.iter().zip(combo) {
        let expected = open_closed(closed);
        let actual = status
            .tamper_states
            .get(*name)
            .map(String::as_str)
            .unwrap_or("MISSING");
        d.insert(format!("{}_expected", name), json!(expected));
        d.insert(format!("{}_actual", name), json!(actual));
        if !actual.eq_ignore_ascii_case(expected) {
            mismatches.push(format!("{} reads {} (expected {})", name, actual, expected));
        }
    }

    if mismatches.is_empty() {
        Ok((true, format!("Tamper {}: OK", label), d))
    } else {
        Ok((false, format!("Tamper {}: {}", label, mismatches.join(", ")), d))
    }
}

async fn test_tampers(ctx: &mut StepContext<'_>) -> Result<()> {
    for combo in TAMPER_COMBINATIONS {
        match check_tamper_combination(ctx, combo).await {
            Ok((true, msg, d)) => ctx.report(Status::Pass, msg, d),
            Ok((false, msg, d)) => ctx.report(Status::Fail, msg, d),
            Err(e) => ctx.report(
                Status::Fail,
                format!("Tamper combination {:?}: {:#}", combo, e),
                Map::new(),
            ),
        }
    }

    // Leave both loops open whatever happened above.
    let mut release_errors = Vec::new();
    for name in TAMPER_INPUTS {
        if let Some(id) = ctx.config.relay_id(name) {
            if let Err(e) = ctx.bench.relays.set(id, false).await {
                warn!(relay = id, error = %e, "could not release tamper relay");
                release_errors.push(format!("{} ({}): {}", name, id, e));
            }
        }
    }
    if !release_errors.is_empty() {
        ctx.fail(format!(
            "Could not release tamper relays: {}",
            release_errors.join("; ")
        ));
    }
    Ok(())
}

async fn test_onboard_relay(ctx: &mut StepContext<'_>) -> Result<()> {
    let timeout = ctx.config.serial.timeout();
    for (command, expected) in [(DutCommand::BoardRelayOn, "ON"), (DutCommand::BoardRelayOff, "OFF")] {
        if !expect_ack(ctx, command, timeout).await? {
            continue;
        }
        match read_status(ctx).await? {
            Err(reason) => ctx.fail(reason),
            Ok(status) => {
                let d = details([
                    ("expected", json!(expected)),
                    ("actual", json!(status.onboard_relay_state)),
                ]);
                if status.onboard_relay_state.eq_ignore_ascii_case(expected) {
                    ctx.report(Status::Pass, format!("On-board relay {}", expected), d);
                } else {
                    ctx.report(
                        Status::Fail,
                        format!(
                            "On-board relay reads {}, expected {}",
                            status.onboard_relay_state, expected
                        ),
                        d,
                    );
                }
            }
        }
    }
    Ok(())
}

/// Power the DUT from the uA meter's source output instead of the battery.
async fn simulate_battery(ctx: &mut StepContext<'_>) -> Result<()> {
    ctx.bench
        .ua_meter
        .set_source_enabled(true)
        .await
        .context("enabling uA meter source")?;
    let check = drive_relay(ctx, "ua_meter", true).await?;
    let volts = f64::from(ctx.config.current_meter.source_voltage_mv) / 1000.0;
    let mut d = check.details();
    d.insert("source_voltage_v".into(), json!(volts));

    if check.ok() {
        ctx.settle(ctx.config.timing.power_settle_ms).await;
        ctx.report(
            Status::Pass,
            format!("Battery simulated from uA meter source at {:.2} V", volts),
            d,
        );
    } else {
        ctx.report(
            Status::Fail,
            format!(
                "Relay ua_meter ({}) commanded ON but reads {}",
                check.id,
                on_off(check.actual)
            ),
            d,
        );
    }
    Ok(())
}

async fn measure_sleep_current(ctx: &mut StepContext<'_>) -> Result<()> {
    let threshold = ctx
        .definition
        .arg("threshold_ua", 0)
        .and_then(Value::as_f64)
        .unwrap_or(ctx.config.thresholds.sleep_current_max_ua);
    let duration_ms = ctx
        .definition
        .u64_kwarg("duration_ms")
        .unwrap_or(ctx.config.current_meter.measure_duration_ms);

    let measured = ctx
        .bench
        .ua_meter
        .measure_average(Duration::from_millis(duration_ms))
        .await
        .context("sampling sleep current")?;

    let Some(current_ua) = measured else {
        ctx.report(
            Status::Fail,
            "uA meter returned no samples",
            details([("threshold_ua", json!(threshold))]),
        );
        return Ok(());
    };

    let d = details([
        ("current_ua", json!(current_ua)),
        ("threshold_ua", json!(threshold)),
        ("duration_ms", json!(duration_ms)),
    ]);
    if below_threshold(current_ua, threshold) {
        ctx.report(
            Status::Pass,
            format!("Sleep current {:.2} uA < {:.2} uA", current_ua, threshold),
            d,
        );
    } else {
        ctx.report(
            Status::Fail,
            format!(
                "Sleep current {:.2} uA not below {:.2} uA",
                current_ua, threshold
            ),
            d,
        );
    }
    Ok(())
}

async fn send_current_result(ctx: &mut StepContext<'_>) -> Result<()> {
    let Some(current_ua) = ctx
        .result()
        .detail("measure_sleep_current", "current_ua")
        .and_then(Value::as_f64)
    else {
        ctx.fail("No sleep current measured earlier in this run");
        return Ok(());
    };

    let timeout = ctx.config.serial.timeout();
    if expect_ack(ctx, DutCommand::SetLastCurrent(current_ua), timeout).await? {
        ctx.report(
            Status::Pass,
            format!("Sleep current {:.2} uA sent to DUT", current_ua),
            details([("current_ua", json!(current_ua))]),
        );
    }
    Ok(())
}

async fn get_barcode(ctx: &mut StepContext<'_>) -> Result<()> {
    let timeout = ctx.config.serial.timeout();
    let command = DutCommand::GetInfo;
    let reply = exchange(ctx, &command, timeout).await?;
    if let Some(reason) = reply_failure(&command, &reply, timeout) {
        ctx.dut.info = None;
        ctx.fail(reason);
        return Ok(());
    }
    let Reply::Lines(lines) = reply else {
        bail!("no identity lines from {}", command);
    };

    let info = match DutInfo::from_transcript(&lines) {
        Ok(info) => info,
        Err(e) => {
            ctx.dut.info = None;
            ctx.fail(format!("Invalid identity payload: {}", e));
            return Ok(());
        }
    };

    let d = details([
        ("serial_number", json!(info.device_serial)),
        ("imei", json!(info.imei)),
        ("iccid", json!(info.iccid)),
        ("temp_sensor_id", json!(info.temp_sensor_id)),
        ("hardware_ok", json!(info.hardware_ok)),
    ]);

    if !info.has_valid_serial() {
        ctx.report(Status::Fail, "DUT reported no serial number", d);
    } else {
        ctx.set_serial_number(&info.device_serial);
        let failed = info.failed_hardware();
        if failed.is_empty() {
            ctx.report(
                Status::Pass,
                format!(
                    "DUT {} (IMEI {}, ICCID {})",
                    info.device_serial, info.imei, info.iccid
                ),
                d,
            );
        } else {
            ctx.report(
                Status::Fail,
                format!("DUT hardware self-check failed: {}", failed.join(", ")),
                d,
            );
        }
    }
    ctx.dut.info = Some(info);
    Ok(())
}

async fn modem_send(ctx: &mut StepContext<'_>) -> Result<()> {
    let timeout = Duration::from_millis(ctx.config.timing.modem_timeout_ms);
    if expect_ack(ctx, DutCommand::ModemSend, timeout).await? {
        ctx.pass("Modem report sent");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_strict() {
        assert!(below_threshold(49.99, 50.0));
        assert!(!below_threshold(50.0, 50.0));
        assert!(!below_threshold(50.01, 50.0));
    }

    #[test]
    fn test_window_is_inclusive() {
        assert!(in_window(11.0, 11.0, 13.0));
        assert!(in_window(13.0, 11.0, 13.0));
        assert!(!in_window(13.01, 11.0, 13.0));
    }

    #[test]
    fn test_keys_round_trip_and_match_default_sequence() {
        for step in BuiltinStep::ALL {
            assert_eq!(BuiltinStep::from_key(step.key()), Some(step));
        }
        let keys: Vec<_> = BuiltinStep::ALL.iter().map(|s| s.key()).collect();
        assert_eq!(keys, crate::sequence::DEFAULT_SEQUENCE);
        assert_eq!(BuiltinStep::from_key("reboot"), None);
    }

    #[test]
    fn test_tamper_table_is_exhaustive() {
        let mut seen = TAMPER_COMBINATIONS.to_vec();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }
}
