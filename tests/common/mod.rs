//! Shared harness: a fast simulated station and a run that captures events.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use xmnz_tester::config::{StationConfig, TimingConfig};
use xmnz_tester::devices::sim::{simulated_bench, SimHandle};
use xmnz_tester::devices::Bench;
use xmnz_tester::engine::{StepEvent, StepRegistry, TestRunner};
use xmnz_tester::model::Status;
use xmnz_tester::{Sequence, TestResult};

/// Default station with every delay removed and results under `dir`.
pub fn station(dir: &Path) -> StationConfig {
    let mut cfg = StationConfig::default();
    cfg.timing = TimingConfig::zero();
    cfg.serial.timeout_ms = 300;
    cfg.current_meter.measure_duration_ms = 0;
    cfg.log_dir = dir.join("results");
    cfg
}

pub struct Bed {
    pub config: Arc<StationConfig>,
    pub bench: Bench,
    pub sim: SimHandle,
}

impl Bed {
    pub fn new(config: StationConfig) -> Self {
        let (bench, sim) = simulated_bench(&config);
        Self {
            config: Arc::new(config),
            bench,
            sim,
        }
    }
}

pub struct Outcome {
    pub result: TestResult,
    pub events: Vec<StepEvent>,
}

impl Outcome {
    pub fn step_names(&self) -> Vec<&str> {
        self.result
            .steps()
            .iter()
            .map(|s| s.step_name.as_str())
            .collect()
    }

    pub fn statuses_of(&self, step: &str) -> Vec<Status> {
        self.result
            .steps()
            .iter()
            .filter(|s| s.step_name == step)
            .map(|s| s.status)
            .collect()
    }

    /// Steps the engine started, in order.
    pub fn attempted(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter(|e| e.status == Status::Testing)
            .map(|e| e.step_id.as_str())
            .collect()
    }
}

pub async fn run(
    bed: Bed,
    sequence: Sequence,
    registry: StepRegistry,
    cancel: Option<CancellationToken>,
) -> Outcome {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut runner = TestRunner::with_registry(
        bed.config,
        Arc::new(sequence),
        registry,
        bed.bench,
        Some(tx),
    )
    .expect("sequence resolves");
    if let Some(token) = cancel {
        runner = runner.with_cancellation(token);
    }

    let result = runner.run().await;
    drop(runner);

    let mut events = Vec::new();
    while let Some(e) = rx.recv().await {
        events.push(e);
    }
    Outcome { result, events }
}

pub async fn run_keys(bed: Bed, keys: &[&str]) -> Outcome {
    run(
        bed,
        Sequence::from_keys(keys.iter().copied()),
        StepRegistry::builtin(),
        None,
    )
    .await
}
