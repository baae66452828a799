//! Result model: the record of one test run and the steps inside it.

pub mod dut;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use dut::{DutInfo, DutStatus};

/// Serial number placeholder until a step reads it from the DUT.
pub const UNKNOWN_SERIAL: &str = "unknown";

/// Outcome or progress tag attached to every reported event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Fail,
    Info,
    Testing,
    Header,
}

impl Status {
    /// Outcome events are part of the result record. Progress markers
    /// (`Testing`, `Header`) only stream to the UI.
    pub fn is_outcome(self) -> bool {
        matches!(self, Status::Pass | Status::Fail | Status::Info)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pass => write!(f, "PASS"),
            Status::Fail => write!(f, "FAIL"),
            Status::Info => write!(f, "INFO"),
            Status::Testing => write!(f, "TESTING"),
            Status::Header => write!(f, "HEADER"),
        }
    }
}

/// Run-level verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    #[default]
    Pass,
    Fail,
}

impl Verdict {
    pub fn is_pass(self) -> bool {
        self == Verdict::Pass
    }
}

impl From<Verdict> for Status {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Pass => Status::Pass,
            Verdict::Fail => Status::Fail,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestStepResult {
    pub step_name: String,
    pub status: Status,
    pub message: String,
    /// Measured values, thresholds, channel ids. Later steps may read these.
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// A complete run for one DUT.
///
/// Steps are append-only and `overall_status` only ever moves from PASS to
/// FAIL. Fields are private so that both properties hold; the serialized
/// form is what the sinks consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    run_id: Uuid,
    station_id: String,
    serial_number: String,
    overall_status: Verdict,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    steps: Vec<TestStepResult>,
}

impl TestResult {
    pub fn new(station_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            station_id: station_id.into(),
            serial_number: UNKNOWN_SERIAL.to_string(),
            overall_status: Verdict::Pass,
            start_time: Utc::now(),
            end_time: None,
            steps: Vec::new(),
        }
    }

    /// Append a step. A FAIL step flips the run to FAIL permanently.
    pub fn add_step(&mut self, step: TestStepResult) {
        if step.status == Status::Fail {
            self.overall_status = Verdict::Fail;
        }
        self.steps.push(step);
    }

    /// Stamp the end time. Only the first call has an effect.
    pub fn finalize(&mut self) {
        if self.end_time.is_none() {
            // Wall clocks can step backwards; never record an end before the start.
            self.end_time = Some(Utc::now().max(self.start_time));
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn set_serial_number(&mut self, serial: impl Into<String>) {
        self.serial_number = serial.into();
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn overall_status(&self) -> Verdict {
        self.overall_status
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn steps(&self) -> &[TestStepResult] {
        &self.steps
    }

    /// Most recent detail value recorded under `key` by step `step_name`.
    pub fn detail(&self, step_name: &str, key: &str) -> Option<&serde_json::Value> {
        self.steps
            .iter()
            .rev()
            .filter(|s| s.step_name == step_name)
            .find_map(|s| s.details.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, status: Status) -> TestStepResult {
        TestStepResult {
            step_name: name.to_string(),
            status,
            message: format!("{} {}", name, status),
            details: Default::default(),
        }
    }

    #[test]
    fn test_new_result_starts_pass_and_unknown() {
        let r = TestResult::new("ST-01");
        assert_eq!(r.overall_status(), Verdict::Pass);
        assert_eq!(r.serial_number(), UNKNOWN_SERIAL);
        assert!(r.end_time().is_none());
        assert!(r.steps().is_empty());
    }

    #[test]
    fn test_failure_is_monotonic() {
        let mut r = TestResult::new("ST-01");
        r.add_step(step("a", Status::Pass));
        assert_eq!(r.overall_status(), Verdict::Pass);

        r.add_step(step("b", Status::Fail));
        assert_eq!(r.overall_status(), Verdict::Fail);

        for name in ["c", "d", "e"] {
            r.add_step(step(name, Status::Pass));
            assert_eq!(r.overall_status(), Verdict::Fail);
        }
        r.add_step(step("f", Status::Info));
        r.finalize();
        assert_eq!(r.overall_status(), Verdict::Fail);
    }

    #[test]
    fn test_info_steps_do_not_fail_the_run() {
        let mut r = TestResult::new("ST-01");
        r.add_step(step("a", Status::Info));
        r.add_step(step("b", Status::Pass));
        assert_eq!(r.overall_status(), Verdict::Pass);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut r = TestResult::new("ST-01");
        assert!(!r.is_finalized());

        r.finalize();
        let first = r.end_time().unwrap();
        assert!(first >= r.start_time());

        std::thread::sleep(std::time::Duration::from_millis(5));
        r.finalize();
        assert_eq!(r.end_time(), Some(first));
    }

    #[test]
    fn test_steps_keep_insertion_order() {
        let mut r = TestResult::new("ST-01");
        let names = ["one", "two", "three", "four"];
        for n in names {
            r.add_step(step(n, Status::Pass));
        }
        let got: Vec<&str> = r.steps().iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(got, names);
    }

    #[test]
    fn test_detail_lookup_returns_latest() {
        let mut r = TestResult::new("ST-01");
        let mut s1 = step("measure", Status::Fail);
        s1.details.insert("current_ua".into(), serde_json::json!(61.0));
        let mut s2 = step("measure", Status::Pass);
        s2.details.insert("current_ua".into(), serde_json::json!(12.5));
        r.add_step(s1);
        r.add_step(s2);

        assert_eq!(r.detail("measure", "current_ua"), Some(&serde_json::json!(12.5)));
        assert!(r.detail("measure", "missing").is_none());
        assert!(r.detail("other", "current_ua").is_none());
    }

    #[test]
    fn test_serialized_shape() {
        let mut r = TestResult::new("ST-01");
        r.set_serial_number("25070001");
        r.add_step(step("a", Status::Pass));
        r.finalize();

        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["station_id"], "ST-01");
        assert_eq!(v["serial_number"], "25070001");
        assert_eq!(v["overall_status"], "PASS");
        assert_eq!(v["steps"][0]["status"], "PASS");
        assert_eq!(v["steps"][0]["step_name"], "a");
        assert!(v["end_time"].is_string());
    }
}
