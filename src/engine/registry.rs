//! Step key -> handler mapping.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use super::context::StepContext;
use super::steps::BuiltinStep;
use super::EngineError;
use crate::sequence::Sequence;

/// One kind of check. Must report at least one outcome through the context.
///
/// An `Err` return is turned into a FAIL record by the engine, so handlers
/// can use `?` freely for device errors.
#[async_trait::async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<()>;
}

/// Adapter for handlers that never wait on I/O.
pub struct FnStep<F>(F);

impl<F> FnStep<F>
where
    F: Fn(&mut StepContext<'_>) -> Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait::async_trait]
impl<F> StepHandler for FnStep<F>
where
    F: Fn(&mut StepContext<'_>) -> Result<()> + Send + Sync,
{
    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        (self.0)(ctx)
    }
}

#[derive(Clone, Default)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in production step.
    pub fn builtin() -> Self {
        let mut reg = Self::empty();
        for step in BuiltinStep::ALL {
            reg.register(step.key(), Arc::new(step));
        }
        reg
    }

    /// Add or replace the handler for `key`.
    pub fn register(&mut self, key: impl Into<String>, handler: Arc<dyn StepHandler>) -> &mut Self {
        self.handlers.insert(key.into(), handler);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    /// Every key in `sequence` must resolve.
    pub fn validate(&self, sequence: &Sequence) -> Result<(), EngineError> {
        if sequence.is_empty() {
            return Err(EngineError::EmptySequence);
        }
        for (position, def) in sequence.steps().iter().enumerate() {
            if !self.contains(&def.key) {
                return Err(EngineError::UnknownStep {
                    key: def.key.clone(),
                    position: position + 1,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_default_sequence() {
        StepRegistry::builtin().validate(&Sequence::default()).unwrap();
    }

    #[test]
    fn test_unknown_key_is_reported_with_position() {
        let seq = Sequence::from_keys(["connect_battery", "calibrate_flux", "apply_vin"]);
        let err = StepRegistry::builtin().validate(&seq).unwrap_err();
        match err {
            EngineError::UnknownStep { key, position } => {
                assert_eq!(key, "calibrate_flux");
                assert_eq!(position, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let err = StepRegistry::builtin().validate(&Sequence::new(vec![])).unwrap_err();
        assert!(matches!(err, EngineError::EmptySequence));
    }

    #[test]
    fn test_register_custom_handler() {
        let mut reg = StepRegistry::empty();
        reg.register(
            "noop",
            Arc::new(FnStep::new(|ctx| {
                ctx.pass("ok");
                Ok(())
            })),
        );
        assert!(reg.contains("noop"));
        assert!(!reg.contains("apply_vin"));
    }
}
