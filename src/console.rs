//! Manual bench console: drive the station's devices one command at a time.
//!
//! Used while wiring or debugging a fixture. Commands are single lines:
//!
//! ```text
//! relay on|off|state <number|name>
//! all_off
//! power on|off
//! measure ua
//! measure ma <channel>
//! status
//! menu
//! quit
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::config::StationConfig;
use crate::devices::Bench;

pub const MENU: &str = "\
Relay board:
  relay on <number|name>     switch a relay on (e.g. 'relay on 2' or 'relay on vin')
  relay off <number|name>    switch a relay off
  relay state <number|name>  read a relay back
  all_off                    switch every relay off
uA meter:
  power on | power off       enable or disable the source output
  measure ua                 average current in uA
Power monitor:
  measure ma <channel>       read one channel (1-3)
Other:
  status                     state of every mapped relay
  menu                       show this menu
  quit                       disconnect and exit";

/// Relay named in the station's relay map, or given by number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayRef {
    Number(u8),
    Name(String),
}

impl fmt::Display for RelayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayRef::Number(n) => write!(f, "{}", n),
            RelayRef::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    On,
    Off,
    State,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BenchCommand {
    Relay(RelayAction, RelayRef),
    AllOff,
    Source(bool),
    MeasureUa,
    MeasureMa(u8),
    Status,
    Menu,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("unknown command '{0}'; type 'menu' for the list")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

impl FromStr for BenchCommand {
    type Err = CommandParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim().to_lowercase();
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["relay", action, target] => {
                let action = match *action {
                    "on" => RelayAction::On,
                    "off" => RelayAction::Off,
                    "state" => RelayAction::State,
                    _ => return Err(CommandParseError::Usage("relay on|off|state <number|name>")),
                };
                let target = match target.parse::<u8>() {
                    Ok(n) => RelayRef::Number(n),
                    Err(_) => RelayRef::Name(target.to_string()),
                };
                Ok(BenchCommand::Relay(action, target))
            }
            ["relay", ..] => Err(CommandParseError::Usage("relay on|off|state <number|name>")),
            ["all_off"] | ["all-off"] => Ok(BenchCommand::AllOff),
            ["power", "on"] => Ok(BenchCommand::Source(true)),
            ["power", "off"] => Ok(BenchCommand::Source(false)),
            ["power", ..] => Err(CommandParseError::Usage("power on|off")),
            ["measure", "ua"] => Ok(BenchCommand::MeasureUa),
            ["measure", "ma", channel] => channel
                .parse()
                .map(BenchCommand::MeasureMa)
                .map_err(|_| CommandParseError::Usage("measure ma <channel>")),
            ["measure", ..] => Err(CommandParseError::Usage("measure ua | measure ma <channel>")),
            ["status"] => Ok(BenchCommand::Status),
            ["menu"] | ["help"] => Ok(BenchCommand::Menu),
            ["quit"] | ["exit"] => Ok(BenchCommand::Quit),
            [other, ..] => Err(CommandParseError::Unknown(other.to_string())),
            [] => Err(CommandParseError::Unknown(String::new())),
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

/// Connected bench plus the configuration that names its relays.
pub struct Console<'a> {
    bench: &'a mut Bench,
    config: &'a StationConfig,
}

impl<'a> Console<'a> {
    pub fn new(bench: &'a mut Bench, config: &'a StationConfig) -> Self {
        Self { bench, config }
    }

    fn relay_id(&self, relay: &RelayRef) -> Result<u8> {
        match relay {
            RelayRef::Number(n) => Ok(*n),
            RelayRef::Name(name) => self
                .config
                .relay_id(name)
                .with_context(|| format!("no relay named '{}' in the relay map", name)),
        }
    }

    /// Run one command and return the text to show the operator.
    pub async fn execute(&mut self, command: &BenchCommand) -> Result<String> {
        match command {
            BenchCommand::Relay(action, relay) => {
                let id = self.relay_id(relay)?;
                match action {
                    RelayAction::On | RelayAction::Off => {
                        let on = *action == RelayAction::On;
                        self.bench.relays.set(id, on).await?;
                        Ok(format!("Relay {} set {}", id, on_off(on)))
                    }
                    RelayAction::State => {
                        let on = self.bench.relays.get(id).await?;
                        Ok(format!("Relay {} is {}", id, on_off(on)))
                    }
                }
            }
            BenchCommand::AllOff => {
                self.bench.relays.all_off().await?;
                Ok("All relays OFF".to_string())
            }
            BenchCommand::Source(enabled) => {
                self.bench.ua_meter.set_source_enabled(*enabled).await?;
                Ok(format!("uA meter source output {}", on_off(*enabled)))
            }
            BenchCommand::MeasureUa => {
                let duration = Duration::from_millis(self.config.current_meter.measure_duration_ms);
                match self.bench.ua_meter.measure_average(duration).await? {
                    Some(ua) => Ok(format!("Current: {:.2} uA", ua)),
                    None => Ok("Measurement failed: no samples".to_string()),
                }
            }
            BenchCommand::MeasureMa(channel) => {
                match self.bench.power.read_channel(*channel).await? {
                    Some(r) => Ok(format!(
                        "Channel {}: {:.3} V, {:.2} mA, {:.2} mW",
                        channel, r.voltage_v, r.current_ma, r.power_mw
                    )),
                    None => Ok(format!("Channel {} out of measurement range", channel)),
                }
            }
            BenchCommand::Status => {
                let mut lines = Vec::with_capacity(self.config.relays.len());
                for (name, id) in &self.config.relays {
                    let on = self.bench.relays.get(*id).await?;
                    lines.push(format!("{:>2} {:<12}{}", id, name, on_off(on)));
                }
                Ok(lines.join("\n"))
            }
            BenchCommand::Menu => Ok(MENU.to_string()),
            BenchCommand::Quit => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::sim::simulated_bench;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "relay on vin".parse::<BenchCommand>(),
            Ok(BenchCommand::Relay(RelayAction::On, RelayRef::Name("vin".into())))
        );
        assert_eq!(
            "  RELAY State 3 ".parse::<BenchCommand>(),
            Ok(BenchCommand::Relay(RelayAction::State, RelayRef::Number(3)))
        );
        assert_eq!("all_off".parse::<BenchCommand>(), Ok(BenchCommand::AllOff));
        assert_eq!("power off".parse::<BenchCommand>(), Ok(BenchCommand::Source(false)));
        assert_eq!("measure ma 2".parse::<BenchCommand>(), Ok(BenchCommand::MeasureMa(2)));
        assert_eq!("measure ua".parse::<BenchCommand>(), Ok(BenchCommand::MeasureUa));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "relay toggle 1".parse::<BenchCommand>(),
            Err(CommandParseError::Usage(_))
        ));
        assert!(matches!(
            "measure ma x".parse::<BenchCommand>(),
            Err(CommandParseError::Usage(_))
        ));
        assert_eq!(
            "reboot now".parse::<BenchCommand>(),
            Err(CommandParseError::Unknown("reboot".into()))
        );
    }

    #[tokio::test]
    async fn test_relay_by_name_and_number() {
        let config = StationConfig::default();
        let (mut bench, sim) = simulated_bench(&config);
        bench.connect_all().await.unwrap();
        let mut console = Console::new(&mut bench, &config);

        let on = BenchCommand::Relay(RelayAction::On, RelayRef::Name("vin".into()));
        assert_eq!(console.execute(&on).await.unwrap(), "Relay 2 set ON");
        let state = BenchCommand::Relay(RelayAction::State, RelayRef::Number(2));
        assert_eq!(console.execute(&state).await.unwrap(), "Relay 2 is ON");
        assert!(sim.relay_states()[1]);

        let unknown = BenchCommand::Relay(RelayAction::On, RelayRef::Name("fan".into()));
        assert!(console.execute(&unknown).await.is_err());

        console.execute(&BenchCommand::AllOff).await.unwrap();
        assert!(sim.relay_states().iter().all(|on| !on));
    }

    #[tokio::test]
    async fn test_measurements() {
        let mut config = StationConfig::default();
        config.current_meter.measure_duration_ms = 0;
        let (mut bench, _sim) = simulated_bench(&config);
        bench.connect_all().await.unwrap();
        let mut console = Console::new(&mut bench, &config);

        let unpowered = console.execute(&BenchCommand::MeasureUa).await.unwrap();
        assert_eq!(unpowered, "Current: 0.00 uA");

        let vin = BenchCommand::Relay(RelayAction::On, RelayRef::Name("vin".into()));
        console.execute(&vin).await.unwrap();
        let reading = console.execute(&BenchCommand::MeasureMa(1)).await.unwrap();
        assert!(reading.starts_with("Channel 1: "), "{}", reading);
        assert!(reading.contains(" mA"));

        assert!(console.execute(&BenchCommand::MeasureMa(4)).await.is_err());
    }
}
