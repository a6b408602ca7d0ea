//! Test support for `medscribe-residency`.
//!
//! [`FakeEngine`] records every evict, restore and infer call with entry and
//! exit timestamps, injects faults on demand, and can hold inference open so
//! tests can observe the manager while a request is in flight.

pub mod engine;
pub mod loader;

pub use engine::{CallWindow, EngineEvent, EventLog, FakeEngine, GpuMeter, Phase};
pub use loader::{FailingLoader, FakeLoader};

use medscribe_residency::{BootstrapConfig, EngineSet, ResidencyManager, bootstrap};
use std::time::Duration;

/// Three fake GPU engines sharing one event log and one GPU meter.
#[derive(Clone)]
pub struct FakeStack {
    pub reasoning: FakeEngine,
    pub routing: FakeEngine,
    pub speech: FakeEngine,
    pub log: EventLog,
    pub meter: GpuMeter,
}

impl Default for FakeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStack {
    pub fn new() -> Self {
        Self::with_transition_delay(Duration::ZERO)
    }

    /// Every engine sleeps `delay` inside evict and restore, which widens the
    /// transition windows concurrent tests look at.
    pub fn with_transition_delay(delay: Duration) -> Self {
        let log = EventLog::new();
        let meter = GpuMeter::new();
        let engine = |name: &str| {
            FakeEngine::new(name, log.clone(), meter.clone()).with_transition_delay(delay)
        };
        Self {
            reasoning: engine("reasoning"),
            routing: engine("routing"),
            speech: engine("speech"),
            log,
            meter,
        }
    }

    /// Every engine switches state as soon as evict or restore is called
    /// and only replies after the transition delay.
    pub fn with_late_acknowledgement(self) -> Self {
        for engine in [&self.reasoning, &self.routing, &self.speech] {
            engine.acknowledge_late();
        }
        self
    }

    pub fn engine_set(&self) -> EngineSet {
        EngineSet::new()
            .with_reasoning(FakeLoader::new(self.reasoning.clone()))
            .with_routing(FakeLoader::new(self.routing.clone()))
            .with_speech(FakeLoader::new(self.speech.clone()))
    }

    /// Bootstrap a manager over the three fakes.
    pub async fn manager(&self) -> anyhow::Result<ResidencyManager> {
        let manager = bootstrap(self.engine_set(), &BootstrapConfig::default()).await?;
        Ok(manager)
    }
}
