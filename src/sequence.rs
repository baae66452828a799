//! Declarative step sequence: the "program" the engine executes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Built-in production sequence, in execution order.
pub const DEFAULT_SEQUENCE: &[&str] = &[
    "connect_battery",
    "apply_vin",
    "check_initial_status",
    "measure_active_power",
    "test_tampers",
    "test_onboard_relay",
    "disconnect_battery",
    "simulate_battery",
    "disconnect_vin",
    "check_board_status",
    "set_low_power_mode",
    "measure_sleep_current",
    "wakeup_from_sleep",
    "send_current_result",
    "get_barcode",
    "modem_send",
];

/// One entry of the sequence. Arguments are opaque here; handlers interpret them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
}

impl StepDefinition {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.to_string(), value.into());
        self
    }

    /// Keyword argument first, then positional argument `pos`.
    pub fn arg(&self, name: &str, pos: usize) -> Option<&Value> {
        self.kwargs.get(name).or_else(|| self.args.get(pos))
    }

    pub fn str_kwarg(&self, name: &str) -> Option<&str> {
        self.kwargs.get(name).and_then(Value::as_str)
    }

    pub fn u64_kwarg(&self, name: &str) -> Option<u64> {
        self.kwargs.get(name).and_then(Value::as_u64)
    }
}

/// Ordered, immutable list of step definitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Sequence {
    steps: Vec<StepDefinition>,
}

impl Sequence {
    pub fn new(steps: Vec<StepDefinition>) -> Self {
        Self { steps }
    }

    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(keys.into_iter().map(StepDefinition::new).collect())
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::from_keys(DEFAULT_SEQUENCE.iter().copied())
    }
}
