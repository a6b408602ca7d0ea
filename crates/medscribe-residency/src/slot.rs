//! Model slots: one engine handle plus its residency status.

use crate::engine::EngineHandle;
use crate::error::{EngineResult, ResidencyError, ResidencyResult};
use crate::model::{ModelName, ModelStatus};
use crate::status::SlotStatus;

/// Pairs a model name with its engine and status.
///
/// Only the residency manager holds slots, so status changes always go
/// through it.
pub struct ModelSlot {
    name: ModelName,
    engine: Option<Box<dyn EngineHandle>>,
    status: ModelStatus,
    fallback: bool,
}

impl ModelSlot {
    /// A slot whose engine has been initialized (and therefore evicted).
    ///
    /// Software-only engines never occupy the GPU and start resident.
    pub fn loaded(name: ModelName, engine: Box<dyn EngineHandle>) -> Self {
        let status = if engine.uses_gpu() {
            ModelStatus::Dormant
        } else {
            ModelStatus::Resident
        };
        Self {
            name,
            engine: Some(engine),
            status,
            fallback: false,
        }
    }

    /// A slot running a stand-in after its primary engine failed to load.
    pub fn fallback(name: ModelName, engine: Box<dyn EngineHandle>) -> Self {
        Self {
            fallback: true,
            ..Self::loaded(name, engine)
        }
    }

    /// A slot that never finished loading.
    pub fn unloaded(name: ModelName) -> Self {
        Self {
            name,
            engine: None,
            status: ModelStatus::Unloaded,
            fallback: false,
        }
    }

    pub fn name(&self) -> ModelName {
        self.name
    }

    pub fn status(&self) -> ModelStatus {
        self.status
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Whether this slot counts against the single-GPU budget.
    pub fn uses_gpu(&self) -> bool {
        self.engine.as_ref().is_some_and(|e| e.uses_gpu())
    }

    pub fn engine_name(&self) -> Option<&str> {
        self.engine.as_deref().map(|e| e.name())
    }

    pub(crate) fn engine(&self) -> ResidencyResult<&dyn EngineHandle> {
        self.engine
            .as_deref()
            .ok_or(ResidencyError::ModelUnavailable(self.name))
    }

    /// Evict the engine and mark the slot dormant. Status is untouched if the
    /// engine fails.
    pub(crate) async fn evict(&mut self) -> EngineResult<()> {
        let Some(engine) = self.engine.as_deref() else {
            return Ok(());
        };
        engine.evict().await?;
        if engine.uses_gpu() {
            self.status = ModelStatus::Dormant;
        }
        Ok(())
    }

    /// Restore the engine and mark the slot resident. Status is untouched if
    /// the engine fails.
    pub(crate) async fn restore(&mut self) -> EngineResult<()> {
        let Some(engine) = self.engine.as_deref() else {
            return Ok(());
        };
        engine.restore().await?;
        self.status = ModelStatus::Resident;
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> SlotStatus {
        SlotStatus {
            status: self.status,
            engine: self.engine_name().map(str::to_string),
            fallback: self.fallback,
            uses_gpu: self.uses_gpu(),
        }
    }
}

impl std::fmt::Debug for ModelSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSlot")
            .field("name", &self.name)
            .field("engine", &self.engine_name())
            .field("status", &self.status)
            .field("fallback", &self.fallback)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{KeywordRouter, SimulatedSpeechEngine};

    #[test]
    fn test_software_engine_starts_resident() {
        let slot = ModelSlot::fallback(ModelName::Speech, Box::new(SimulatedSpeechEngine::new()));
        assert_eq!(slot.status(), ModelStatus::Resident);
        assert!(slot.is_fallback());
        assert!(!slot.uses_gpu());
        assert_eq!(slot.engine_name(), Some("simulated-speech"));
    }

    #[tokio::test]
    async fn test_software_engine_stays_resident_after_evict() {
        let mut slot = ModelSlot::fallback(ModelName::Routing, Box::new(KeywordRouter::default()));
        slot.evict().await.unwrap();
        assert_eq!(slot.status(), ModelStatus::Resident);
    }

    #[test]
    fn test_unloaded_slot_has_no_engine() {
        let slot = ModelSlot::unloaded(ModelName::Reasoning);
        assert_eq!(slot.status(), ModelStatus::Unloaded);
        assert!(!slot.uses_gpu());
        assert!(matches!(
            slot.engine(),
            Err(ResidencyError::ModelUnavailable(ModelName::Reasoning))
        ));
    }
}
