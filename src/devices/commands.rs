//! Command vocabulary of the DUT firmware's RS485 console.

/// Commands accepted by the DUT.
#[derive(Debug, Clone, PartialEq)]
pub enum DutCommand {
    GetStatus,
    GetInfo,
    GetSerial,
    GetImei,
    GetIccid,
    Sleep,
    WakeUp,
    /// Hand the measured sleep current (uA) back to the DUT.
    SetLastCurrent(f64),
    SetSerial(String),
    /// Force the modem to upload its JSON report.
    ModemSend,
    BoardRelayOn,
    BoardRelayOff,
}

impl std::fmt::Display for DutCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DutCommand::GetStatus => write!(f, "GETSTATUS"),
            DutCommand::GetInfo => write!(f, "GETINFO"),
            DutCommand::GetSerial => write!(f, "GETSERIAL"),
            DutCommand::GetImei => write!(f, "GETIMEI"),
            DutCommand::GetIccid => write!(f, "GETICCID"),
            DutCommand::Sleep => write!(f, "SLEEP"),
            DutCommand::WakeUp => write!(f, "WAKEUP"),
            DutCommand::SetLastCurrent(ua) => write!(f, "SET_CURRENT={:.2}", ua),
            DutCommand::SetSerial(sn) => write!(f, "SETSERIAL={}", sn),
            DutCommand::ModemSend => write!(f, "SENDJSON"),
            DutCommand::BoardRelayOn => write!(f, "RELAY_ON"),
            DutCommand::BoardRelayOff => write!(f, "RELAY_OFF"),
        }
    }
}

impl std::str::FromStr for DutCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(v) = s.strip_prefix("SET_CURRENT=") {
            return v
                .parse()
                .map(DutCommand::SetLastCurrent)
                .map_err(|_| format!("bad current value '{}'", v));
        }
        if let Some(v) = s.strip_prefix("SETSERIAL=") {
            return Ok(DutCommand::SetSerial(v.to_string()));
        }
        match s {
            "GETSTATUS" => Ok(DutCommand::GetStatus),
            "GETINFO" => Ok(DutCommand::GetInfo),
            "GETSERIAL" => Ok(DutCommand::GetSerial),
            "GETIMEI" => Ok(DutCommand::GetImei),
            "GETICCID" => Ok(DutCommand::GetIccid),
            "SLEEP" => Ok(DutCommand::Sleep),
            "WAKEUP" => Ok(DutCommand::WakeUp),
            "SENDJSON" => Ok(DutCommand::ModemSend),
            "RELAY_ON" => Ok(DutCommand::BoardRelayOn),
            "RELAY_OFF" => Ok(DutCommand::BoardRelayOff),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

/// True when the firmware rejected the command.
pub fn is_rejection(lines: &[String]) -> bool {
    lines.iter().any(|l| {
        let l = l.trim_start();
        l.starts_with("ERR") || l.starts_with("NACK")
    })
}
