//! xmnz-tester -- production test station for XMNZ IoT boards.
//!
//! This crate provides the test sequencing engine, the device capabilities it
//! drives (relay board, RS485 console, uA meter, power monitor), a simulated
//! bench, a manual bench console, and the local and remote result sinks.

pub mod config;
pub mod console;
pub mod devices;
pub mod engine;
pub mod model;
pub mod sequence;
pub mod sink;

pub use config::StationConfig;
pub use devices::Bench;
pub use engine::{StepEvent, TestRunner};
pub use model::{Status, TestResult, TestStepResult, Verdict};
pub use sequence::{Sequence, StepDefinition};
