//! Test sequencing engine.
//!
//! One [`TestRunner`] drives one bench. A run connects every device, walks
//! the sequence, and always tears the bench down and finalizes the result,
//! whatever happened in between. Nothing a step does escapes [`TestRunner::run`].

pub mod context;
pub mod registry;
pub mod reporter;
pub mod steps;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Map};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use context::{details, DutState, StepContext};
pub use registry::{FnStep, StepHandler, StepRegistry};
pub use reporter::{EventReceiver, EventSender, Reporter, StepEvent};
pub use steps::BuiltinStep;

use crate::config::StationConfig;
use crate::devices::Bench;
use crate::model::{Status, TestResult, Verdict};
use crate::sequence::Sequence;
use crate::sink::{ApiClient, LocalStore, SinkError};

/// Step id of events that belong to the run rather than one step.
pub const RUN_EVENT: &str = "run";
/// Step name of the record written when the bench cannot be connected.
pub const CONNECT_STEP: &str = "connect_hardware";
/// Step name of the record written when the operator cancels.
pub const CANCEL_STEP: &str = "operator_cancel";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("test sequence is empty")]
    EmptySequence,

    #[error("no handler registered for step '{key}' (sequence position {position})")]
    UnknownStep { key: String, position: usize },

    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub struct TestRunner {
    config: Arc<StationConfig>,
    sequence: Arc<Sequence>,
    registry: StepRegistry,
    bench: Bench,
    events: Option<EventSender>,
    cancel: CancellationToken,
    store: LocalStore,
    api: Option<ApiClient>,
}

impl TestRunner {
    /// Runner for the configured sequence with the built-in steps.
    pub fn new(
        config: Arc<StationConfig>,
        bench: Bench,
        events: Option<EventSender>,
    ) -> Result<Self, EngineError> {
        let sequence = Arc::new(config.sequence());
        Self::with_registry(config, sequence, StepRegistry::builtin(), bench, events)
    }

    /// Every sequence key must resolve in `registry`; otherwise no runner is built.
    pub fn with_registry(
        config: Arc<StationConfig>,
        sequence: Arc<Sequence>,
        registry: StepRegistry,
        bench: Bench,
        events: Option<EventSender>,
    ) -> Result<Self, EngineError> {
        registry.validate(&sequence)?;
        let store = LocalStore::new(&config.log_dir);
        let api = match &config.api.endpoint_url {
            Some(url) => Some(ApiClient::new(url, &config.api.key, config.api.timeout())?),
            None => None,
        };
        Ok(Self {
            config,
            sequence,
            registry,
            bench,
            events,
            cancel: CancellationToken::new(),
            store,
            api,
        })
    }

    /// Token that stops the run at the next step boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Share a token created elsewhere, e.g. before handlers that need it.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    /// Execute one run and return its verdict.
    pub async fn run_full_test(&mut self) -> Verdict {
        self.run().await.overall_status()
    }

    /// Execute one run and return the finalized record.
    pub async fn run(&mut self) -> TestResult {
        let mut reporter = Reporter::new(
            TestResult::new(&self.config.station_id),
            self.events.clone(),
        );
        info!(
            run_id = %reporter.result().run_id(),
            station = %self.config.station_id,
            steps = self.sequence.len(),
            "test run started"
        );

        reporter.report(RUN_EVENT, "--- Connecting to hardware ---", Status::Header, Map::new());
        if self.connect(&mut reporter).await {
            self.run_sequence(&mut reporter).await;
        }

        reporter.report(RUN_EVENT, "--- Disconnecting hardware ---", Status::Header, Map::new());
        self.teardown(&mut reporter).await;

        reporter.finalize();
        let verdict = reporter.result().overall_status();
        reporter.report(
            RUN_EVENT,
            format!("Test finished. Overall result: {}", verdict),
            verdict.into(),
            Map::new(),
        );

        self.persist(&mut reporter).await;
        self.upload(&mut reporter).await;

        let result = reporter.into_result();
        info!(
            run_id = %result.run_id(),
            serial = %result.serial_number(),
            %verdict,
            steps = result.steps().len(),
            "test run finished"
        );
        result
    }

    async fn connect(&mut self, reporter: &mut Reporter) -> bool {
        let outcome = AssertUnwindSafe(self.bench.connect_all()).catch_unwind().await;
        let (message, device) = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => (
                format!("CRITICAL ERROR: {} failed to connect: {}", e.device, e.source),
                json!(e.device),
            ),
            Err(panic) => (
                format!("CRITICAL ERROR: hardware connect panicked: {}", panic_message(&*panic)),
                json!(null),
            ),
        };
        reporter.report(
            CONNECT_STEP,
            message,
            Status::Fail,
            details([("device", device)]),
        );
        false
    }

    async fn run_sequence(&mut self, reporter: &mut Reporter) {
        let sequence = Arc::clone(&self.sequence);
        let config = Arc::clone(&self.config);
        let mut dut = DutState::default();

        reporter.report(RUN_EVENT, "--- Starting test sequence ---", Status::Header, Map::new());
        for (index, def) in sequence.steps().iter().enumerate() {
            if self.cancel.is_cancelled() {
                reporter.report(
                    CANCEL_STEP,
                    format!("Test cancelled by operator before {}", def.key),
                    Status::Fail,
                    details([("next_step", json!(def.key))]),
                );
                break;
            }

            let Some(handler) = self.registry.get(&def.key) else {
                reporter.report(
                    &def.key,
                    format!("No handler registered for step '{}'", def.key),
                    Status::Fail,
                    Map::new(),
                );
                break;
            };

            reporter.report(&def.key, config.step_message(&def.key, index), Status::Testing, Map::new());
            let recorded = reporter.result().steps().len();

            let outcome = {
                let mut ctx = StepContext::new(&mut self.bench, &config, &mut dut, def, reporter);
                AssertUnwindSafe(handler.run(&mut ctx)).catch_unwind().await
            };
            match outcome {
                Ok(Ok(())) => {
                    if reporter.result().steps().len() == recorded {
                        reporter.report(&def.key, "Step reported no outcome", Status::Fail, Map::new());
                    }
                }
                Ok(Err(e)) => {
                    reporter.report(&def.key, format!("Error: {:#}", e), Status::Fail, Map::new());
                }
                Err(panic) => {
                    reporter.report(
                        &def.key,
                        format!("Step panicked: {}", panic_message(&*panic)),
                        Status::Fail,
                        Map::new(),
                    );
                }
            }

            if config.stop_on_fail && !reporter.result().overall_status().is_pass() {
                info!(step = %def.key, "stop on fail: skipping remaining steps");
                reporter.report(
                    RUN_EVENT,
                    format!("--- Sequence halted after {} ---", def.key),
                    Status::Header,
                    Map::new(),
                );
                break;
            }
        }
    }

    /// Release every device. Failures are reported and never stop the rest.
    async fn teardown(&mut self, reporter: &mut Reporter) {
        let failures = match AssertUnwindSafe(self.bench.disconnect_all()).catch_unwind().await {
            Ok(failures) => failures,
            Err(panic) => {
                reporter.report(
                    RUN_EVENT,
                    format!("Hardware teardown panicked: {}", panic_message(&*panic)),
                    Status::Info,
                    Map::new(),
                );
                return;
            }
        };
        for failure in failures {
            reporter.report(
                RUN_EVENT,
                format!("{} disconnect failed: {}", failure.device, failure.source),
                Status::Info,
                details([("device", json!(failure.device))]),
            );
        }
    }

    async fn persist(&self, reporter: &mut Reporter) {
        match self.store.save(reporter.result()).await {
            Ok(path) => reporter.report(
                RUN_EVENT,
                format!("Result saved to {}", path.display()),
                Status::Info,
                Map::new(),
            ),
            Err(e) => {
                warn!(error = %e, "local result write failed");
                reporter.report(
                    RUN_EVENT,
                    format!("Could not save result locally: {}", e),
                    Status::Info,
                    Map::new(),
                );
            }
        }
    }

    async fn upload(&self, reporter: &mut Reporter) {
        let Some(api) = &self.api else {
            reporter.report(RUN_EVENT, "No API endpoint configured, upload skipped", Status::Info, Map::new());
            return;
        };
        match api.send(reporter.result()).await {
            Ok(()) => reporter.report(RUN_EVENT, "Result uploaded to API", Status::Info, Map::new()),
            Err(e) => {
                warn!(error = %e, "API upload failed");
                reporter.report(
                    RUN_EVENT,
                    format!("API upload failed: {}", e),
                    Status::Info,
                    Map::new(),
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::devices::sim::simulated_bench;
    use crate::sequence::StepDefinition;

    fn config(dir: &std::path::Path) -> Arc<StationConfig> {
        let mut cfg = StationConfig::default();
        cfg.timing = TimingConfig::zero();
        cfg.log_dir = dir.to_path_buf();
        Arc::new(cfg)
    }

    #[tokio::test]
    async fn test_missing_handler_at_runtime_fails_and_halts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let (bench, _sim) = simulated_bench(&cfg);
        let seq = Arc::new(Sequence::from_keys(["connect_battery", "apply_vin"]));

        let mut runner = TestRunner::with_registry(
            cfg,
            seq,
            StepRegistry::builtin(),
            bench,
            None,
        )
        .unwrap();
        // Simulate a registry that lost a key after the runner was built.
        runner.registry = StepRegistry::empty();
        runner
            .registry
            .register("connect_battery", Arc::new(BuiltinStep::ConnectBattery));

        let result = runner.run().await;
        assert_eq!(result.overall_status(), Verdict::Fail);
        let names: Vec<_> = result.steps().iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, ["connect_battery", "apply_vin"]);
        assert_eq!(result.steps()[1].status, Status::Fail);
    }

    #[tokio::test]
    async fn test_silent_handler_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let (bench, _sim) = simulated_bench(&cfg);
        let mut registry = StepRegistry::empty();
        registry.register("quiet", Arc::new(FnStep::new(|_ctx| Ok(()))));

        let seq = Arc::new(Sequence::new(vec![StepDefinition::new("quiet")]));
        let mut runner = TestRunner::with_registry(cfg, seq, registry, bench, None).unwrap();
        let result = runner.run().await;
        assert_eq!(result.steps().len(), 1);
        assert_eq!(result.steps()[0].message, "Step reported no outcome");
        assert_eq!(result.overall_status(), Verdict::Fail);
    }

    #[tokio::test]
    async fn test_unknown_step_rejected_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let (bench, _sim) = simulated_bench(&cfg);
        let seq = Arc::new(Sequence::from_keys(["apply_vin", "warp_drive"]));
        let err = TestRunner::with_registry(cfg, seq, StepRegistry::builtin(), bench, None)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::UnknownStep { position: 2, .. }));
    }

    #[tokio::test]
    async fn test_run_on_worker_task() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let (bench, _sim) = simulated_bench(&cfg);
        let seq = Arc::new(Sequence::from_keys(["connect_battery", "apply_vin"]));
        let mut runner =
            TestRunner::with_registry(cfg, seq, StepRegistry::builtin(), bench, None).unwrap();

        let worker = tokio::spawn(async move { runner.run().await });
        let result = worker.await.unwrap();
        assert_eq!(result.overall_status(), Verdict::Pass);
        assert_eq!(result.steps().len(), 2);
    }

    #[test]
    fn test_panic_message_extraction() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*p), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*p), "bang");
        let p: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*p), "unknown panic");
    }
}
