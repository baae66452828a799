//! What a step handler sees while it runs.

use std::future::Future;
use std::time::Duration;

use serde_json::{Map, Value};

use super::reporter::Reporter;
use crate::config::StationConfig;
use crate::devices::Bench;
use crate::model::{DutInfo, DutStatus, Status, TestResult};
use crate::sequence::StepDefinition;

/// Parsed DUT snapshots carried between steps of one run.
///
/// Either may be absent: a step that failed to parse leaves the previous
/// value cleared, and readers must check before use.
#[derive(Debug, Default)]
pub struct DutState {
    pub info: Option<DutInfo>,
    pub status: Option<DutStatus>,
}

pub struct StepContext<'a> {
    pub bench: &'a mut Bench,
    pub config: &'a StationConfig,
    pub dut: &'a mut DutState,
    pub definition: &'a StepDefinition,
    reporter: &'a mut Reporter,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        bench: &'a mut Bench,
        config: &'a StationConfig,
        dut: &'a mut DutState,
        definition: &'a StepDefinition,
        reporter: &'a mut Reporter,
    ) -> Self {
        Self {
            bench,
            config,
            dut,
            definition,
            reporter,
        }
    }

    /// Step identifier used for every record this step produces.
    pub fn key(&self) -> &str {
        &self.definition.key
    }

    pub fn report(&mut self, status: Status, message: impl Into<String>, details: Map<String, Value>) {
        let key = self.definition.key.as_str();
        self.reporter.report(key, message, status, details);
    }

    pub fn pass(&mut self, message: impl Into<String>) {
        self.report(Status::Pass, message, Map::new());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.report(Status::Fail, message, Map::new());
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.report(Status::Info, message, Map::new());
    }

    /// Results recorded so far, including earlier steps' details.
    pub fn result(&self) -> &TestResult {
        self.reporter.result()
    }

    pub fn set_serial_number(&mut self, serial: &str) {
        self.reporter.set_serial_number(serial);
    }

    /// Wait for hardware to settle. Zero returns immediately.
    ///
    /// The returned future does not borrow the context.
    pub fn settle(&self, millis: u64) -> impl Future<Output = ()> + Send + 'static {
        async move {
            if millis > 0 {
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }
        }
    }
}

/// Build a details map from `(key, value)` pairs.
pub fn details<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
