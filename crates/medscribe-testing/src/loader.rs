use crate::engine::FakeEngine;
use async_trait::async_trait;
use medscribe_residency::{EngineError, EngineHandle, EngineLoader, EngineResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Loader that hands out a clone of a [`FakeEngine`], evicted.
#[derive(Clone)]
pub struct FakeLoader {
    engine: FakeEngine,
    calls: Arc<AtomicUsize>,
}

impl FakeLoader {
    pub fn new(engine: FakeEngine) -> Self {
        Self {
            engine,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLoader for FakeLoader {
    fn describe(&self) -> String {
        format!("fake:{}", self.engine.name())
    }

    async fn initialize(&self) -> EngineResult<Box<dyn EngineHandle>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.engine.reset_to_dormant();
        Ok(Box::new(self.engine.clone()))
    }
}

/// Loader whose `initialize` always fails.
#[derive(Clone)]
pub struct FailingLoader {
    reason: String,
    calls: Arc<AtomicUsize>,
}

impl FailingLoader {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLoader for FailingLoader {
    fn describe(&self) -> String {
        format!("failing:{}", self.reason)
    }

    async fn initialize(&self) -> EngineResult<Box<dyn EngineHandle>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::Other(self.reason.clone()))
    }
}
