//! The single funnel every reported event passes through.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::model::{Status, TestResult, TestStepResult};

/// Live update for the operator UI.
///
/// The stream carries more than the record: progress events (HEADER,
/// TESTING) and everything reported after the result was finalized are
/// shown but never stored. `recorded` marks the events that were appended
/// to the result, in the same order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub step_id: String,
    pub message: String,
    pub status: Status,
    pub recorded: bool,
}

pub type EventSender = mpsc::UnboundedSender<StepEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<StepEvent>;

/// Owns the in-progress result and the UI channel for one run.
///
/// Each call appends to the record first and then notifies, so the UI never
/// shows an outcome the record does not contain. Once the result is
/// finalized, events still reach the UI but the record is closed.
pub struct Reporter {
    result: TestResult,
    events: Option<EventSender>,
}

impl Reporter {
    pub fn new(result: TestResult, events: Option<EventSender>) -> Self {
        Self { result, events }
    }

    pub fn report(
        &mut self,
        step_id: &str,
        message: impl Into<String>,
        status: Status,
        details: Map<String, Value>,
    ) {
        let message = message.into();

        if status == Status::Fail {
            warn!(step = %step_id, %status, "{}", message);
        } else {
            info!(step = %step_id, %status, "{}", message);
        }

        let recorded = status.is_outcome() && !self.result.is_finalized();
        if recorded {
            self.result.add_step(TestStepResult {
                step_name: step_id.to_string(),
                status,
                message: message.clone(),
                details,
            });
        }

        if let Some(tx) = &self.events {
            // A closed UI must never disturb the run.
            let _ = tx.send(StepEvent {
                step_id: step_id.to_string(),
                message,
                status,
                recorded,
            });
        }
    }

    pub fn result(&self) -> &TestResult {
        &self.result
    }

    pub fn set_serial_number(&mut self, serial: &str) {
        self.result.set_serial_number(serial);
    }

    pub fn finalize(&mut self) {
        self.result.finalize();
    }

    pub fn into_result(self) -> TestResult {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Verdict;

    #[test]
    fn test_outcomes_recorded_progress_streamed_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut r = Reporter::new(TestResult::new("ST"), Some(tx));

        r.report("run", "--- Connecting ---", Status::Header, Map::new());
        r.report("apply_vin", "Step 2: apply_vin", Status::Testing, Map::new());
        r.report("apply_vin", "relay vin ON", Status::Pass, Map::new());
        r.report("apply_vin", "note", Status::Info, Map::new());

        assert_eq!(r.result().steps().len(), 2);
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert_eq!(events.len(), 4);
        let flags: Vec<_> = events.iter().map(|e| e.recorded).collect();
        assert_eq!(flags, [false, false, true, true]);
        assert_eq!(events[2].status, Status::Pass);
        assert_eq!(events[2].message, "relay vin ON");
    }

    #[test]
    fn test_record_closed_after_finalize() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut r = Reporter::new(TestResult::new("ST"), Some(tx));
        r.report("a", "ok", Status::Pass, Map::new());
        r.finalize();
        r.report("run", "late failure", Status::Fail, Map::new());

        assert_eq!(r.result().steps().len(), 1);
        assert_eq!(r.result().overall_status(), Verdict::Pass);
        assert_eq!(rx.try_recv().unwrap().step_id, "a");
        let late = rx.try_recv().unwrap();
        assert_eq!(late.message, "late failure");
        assert!(!late.recorded);
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut r = Reporter::new(TestResult::new("ST"), Some(tx));
        r.report("a", "still recorded", Status::Fail, Map::new());
        assert_eq!(r.result().steps().len(), 1);
    }
}
