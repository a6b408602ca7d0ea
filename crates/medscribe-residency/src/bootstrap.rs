//! Process-start bootstrap.
//!
//! Loads every engine once, sequentially, in the order reasoning, routing,
//! speech. Each loader leaves its engine evicted, so the next one starts with
//! the accelerator free. Load failures are absorbed here:
//!
//! - routing falls back to the [`KeywordRouter`]
//! - speech falls back to the [`SimulatedSpeechEngine`], primed with
//!   [`BootstrapConfig::dictation`] when one is configured
//! - reasoning tries each configured backend in turn and leaves the slot
//!   unloaded if none initialize (or fails outright with
//!   [`BootstrapConfig::require_reasoning`])

use crate::config::{BootstrapConfig, ResidencyConfig};
use crate::engine::{EngineHandle, EngineLoader, KeywordRouter, SimulatedSpeechEngine, VllmLoader};
use crate::error::{EngineError, EngineResult, ResidencyError, ResidencyResult};
use crate::manager::ResidencyManager;
use crate::model::ModelName;
use crate::slot::ModelSlot;
use std::time::Instant;
use tracing::{info, warn};

/// The loaders bootstrap will try, per model.
#[derive(Default)]
pub struct EngineSet {
    reasoning: Vec<Box<dyn EngineLoader>>,
    routing: Option<Box<dyn EngineLoader>>,
    speech: Option<Box<dyn EngineLoader>>,
}

impl EngineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the primary reasoning backend. Replaces any previous primary but
    /// keeps fallbacks.
    pub fn with_reasoning(mut self, loader: impl EngineLoader + 'static) -> Self {
        if self.reasoning.is_empty() {
            self.reasoning.push(Box::new(loader));
        } else {
            self.reasoning[0] = Box::new(loader);
        }
        self
    }

    /// Add a reasoning backend tried after every earlier one has failed.
    pub fn with_reasoning_fallback(mut self, loader: impl EngineLoader + 'static) -> Self {
        self.reasoning.push(Box::new(loader));
        self
    }

    pub fn with_routing(mut self, loader: impl EngineLoader + 'static) -> Self {
        self.routing = Some(Box::new(loader));
        self
    }

    pub fn with_speech(mut self, loader: impl EngineLoader + 'static) -> Self {
        self.speech = Some(Box::new(loader));
        self
    }

    /// vLLM loaders for every configured endpoint. Simulated mode yields an
    /// empty set, so only the software stand-ins load.
    pub fn from_config(config: &ResidencyConfig) -> Self {
        let mut set = Self::new();
        if config.simulated {
            return set;
        }

        set = set.with_reasoning(VllmLoader::new("reasoning", config.reasoning.clone()));
        if let Some(fallback) = &config.reasoning_fallback {
            set = set.with_reasoning_fallback(VllmLoader::new(
                "reasoning-fallback",
                fallback.clone(),
            ));
        }
        if config.bootstrap.load_routing {
            set = set.with_routing(VllmLoader::new("routing", config.routing.clone()));
        }
        if config.bootstrap.load_speech {
            set = set.with_speech(VllmLoader::new("speech", config.speech.clone()));
        }
        set
    }
}

async fn load(name: ModelName, loader: &dyn EngineLoader) -> EngineResult<Box<dyn EngineHandle>> {
    let started = Instant::now();
    let description = loader.describe();
    info!(model = %name, loader = %description, "loading engine");

    let engine = loader.initialize().await?;
    info!(
        model = %name,
        engine = engine.name(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "engine loaded"
    );
    Ok(engine)
}

async fn load_reasoning(
    loaders: &[Box<dyn EngineLoader>],
    require: bool,
) -> ResidencyResult<ModelSlot> {
    let mut last_error = None;

    for (attempt, loader) in loaders.iter().enumerate() {
        match load(ModelName::Reasoning, loader.as_ref()).await {
            Ok(engine) if attempt == 0 => return Ok(ModelSlot::loaded(ModelName::Reasoning, engine)),
            Ok(engine) => return Ok(ModelSlot::fallback(ModelName::Reasoning, engine)),
            Err(e) => {
                warn!(
                    model = %ModelName::Reasoning,
                    loader = %loader.describe(),
                    error = %e,
                    "reasoning backend failed to load"
                );
                last_error = Some(e);
            }
        }
    }

    let source =
        last_error.unwrap_or_else(|| EngineError::Other("no reasoning backend configured".into()));
    if require {
        return Err(ResidencyError::Initialization {
            model: ModelName::Reasoning,
            source,
        });
    }

    warn!(model = %ModelName::Reasoning, error = %source, "reasoning unavailable");
    Ok(ModelSlot::unloaded(ModelName::Reasoning))
}

async fn load_or_stand_in<F>(
    name: ModelName,
    loader: Option<&dyn EngineLoader>,
    stand_in: F,
) -> ModelSlot
where
    F: FnOnce() -> Box<dyn EngineHandle>,
{
    let Some(loader) = loader else {
        info!(model = %name, "loading disabled, using software stand-in");
        return ModelSlot::fallback(name, stand_in());
    };

    match load(name, loader).await {
        Ok(engine) => ModelSlot::loaded(name, engine),
        Err(e) => {
            warn!(model = %name, error = %e, "engine failed to load, using software stand-in");
            ModelSlot::fallback(name, stand_in())
        }
    }
}

/// Load every engine and build the manager.
pub async fn bootstrap(set: EngineSet, options: &BootstrapConfig) -> ResidencyResult<ResidencyManager> {
    let started = Instant::now();

    let reasoning = load_reasoning(&set.reasoning, options.require_reasoning).await?;
    let routing = load_or_stand_in(ModelName::Routing, set.routing.as_deref(), || {
        Box::new(KeywordRouter::default())
    })
    .await;
    let speech = load_or_stand_in(ModelName::Speech, set.speech.as_deref(), || {
        let engine = SimulatedSpeechEngine::new();
        if let Some(script) = &options.dictation {
            engine.simulate_dictation(script, options.dictation_chunk_words);
        }
        Box::new(engine)
    })
    .await;

    let manager = ResidencyManager::new([reasoning, routing, speech]);
    let status = manager.status().await;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        reasoning = %status.status_of(ModelName::Reasoning),
        routing = %status.status_of(ModelName::Routing),
        speech = %status.status_of(ModelName::Speech),
        "residency manager ready"
    );
    Ok(manager)
}

/// [`bootstrap`] with loaders built from `config`.
pub async fn bootstrap_from_config(config: &ResidencyConfig) -> ResidencyResult<ResidencyManager> {
    bootstrap(EngineSet::from_config(config), &config.bootstrap).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioInput;
    use crate::engine::{InferenceRequest, KeywordRouterLoader};
    use crate::model::ModelStatus;
    use async_trait::async_trait;

    struct Broken(&'static str);

    #[async_trait]
    impl EngineLoader for Broken {
        fn describe(&self) -> String {
            format!("broken:{}", self.0)
        }

        async fn initialize(&self) -> EngineResult<Box<dyn EngineHandle>> {
            Err(EngineError::Other(format!("{} out of memory", self.0)))
        }
    }

    struct Gpu(&'static str);

    struct GpuEngine(&'static str);

    #[async_trait]
    impl EngineHandle for GpuEngine {
        fn name(&self) -> &str {
            self.0
        }

        async fn evict(&self) -> EngineResult<()> {
            Ok(())
        }

        async fn restore(&self) -> EngineResult<()> {
            Ok(())
        }

        async fn infer(&self, _request: &InferenceRequest) -> EngineResult<String> {
            Ok(self.0.to_string())
        }
    }

    #[async_trait]
    impl EngineLoader for Gpu {
        fn describe(&self) -> String {
            format!("gpu:{}", self.0)
        }

        async fn initialize(&self) -> EngineResult<Box<dyn EngineHandle>> {
            Ok(Box::new(GpuEngine(self.0)))
        }
    }

    #[tokio::test]
    async fn test_everything_loads_dormant() {
        let set = EngineSet::new()
            .with_reasoning(Gpu("medgemma"))
            .with_routing(Gpu("functiongemma"))
            .with_speech(Gpu("medasr"));
        let manager = bootstrap(set, &BootstrapConfig::default()).await.unwrap();

        let status = manager.status().await;
        assert_eq!(status.active, None);
        for name in ModelName::ALL {
            assert_eq!(status.status_of(name), ModelStatus::Dormant);
            assert!(!status.models[&name].fallback);
        }
    }

    #[tokio::test]
    async fn test_failures_use_stand_ins() {
        let set = EngineSet::new()
            .with_reasoning(Gpu("medgemma"))
            .with_routing(Broken("functiongemma"))
            .with_speech(Broken("medasr"));
        let manager = bootstrap(set, &BootstrapConfig::default()).await.unwrap();

        let status = manager.status().await;
        assert_eq!(status.status_of(ModelName::Routing), ModelStatus::Resident);
        assert_eq!(status.status_of(ModelName::Speech), ModelStatus::Resident);
        assert_eq!(status.models[&ModelName::Routing].engine.as_deref(), Some("keyword-router"));
        assert_eq!(status.models[&ModelName::Speech].engine.as_deref(), Some("simulated-speech"));
        assert!(status.models[&ModelName::Speech].fallback);
    }

    #[tokio::test]
    async fn test_reasoning_fallback_backend() {
        let set = EngineSet::new()
            .with_reasoning(Broken("medgemma-bf16"))
            .with_reasoning_fallback(Gpu("medgemma-4bit"));
        let manager = bootstrap(set, &BootstrapConfig::default()).await.unwrap();

        let status = manager.status().await;
        assert_eq!(status.status_of(ModelName::Reasoning), ModelStatus::Dormant);
        assert_eq!(status.models[&ModelName::Reasoning].engine.as_deref(), Some("medgemma-4bit"));
        assert!(status.models[&ModelName::Reasoning].fallback);
    }

    #[tokio::test]
    async fn test_reasoning_exhausted_leaves_unloaded() {
        let set = EngineSet::new()
            .with_reasoning(Broken("a"))
            .with_reasoning_fallback(Broken("b"))
            .with_routing(KeywordRouterLoader);
        let manager = bootstrap(set, &BootstrapConfig::default()).await.unwrap();
        assert_eq!(
            manager.status().await.status_of(ModelName::Reasoning),
            ModelStatus::Unloaded
        );
    }

    #[tokio::test]
    async fn test_require_reasoning_fails_bootstrap() {
        let set = EngineSet::new().with_reasoning(Broken("a"));
        let options = BootstrapConfig {
            require_reasoning: true,
            ..Default::default()
        };
        let err = bootstrap(set, &options).await.unwrap_err();
        assert!(matches!(
            err,
            ResidencyError::Initialization {
                model: ModelName::Reasoning,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_configured_dictation_reaches_speech_stand_in() {
        let options = BootstrapConfig {
            load_speech: false,
            dictation: Some("no known drug allergies".into()),
            dictation_chunk_words: 2,
            ..Default::default()
        };
        let manager = bootstrap(EngineSet::new(), &options).await.unwrap();

        let clip = || AudioInput::samples(vec![0.0; 1_600], 16_000);
        assert_eq!(manager.transcribe(clip(), None).await.unwrap(), "no known");
        assert_eq!(manager.transcribe(clip(), None).await.unwrap(), "drug allergies");
        assert!(
            manager
                .transcribe(clip(), None)
                .await
                .unwrap()
                .starts_with("[simulated transcript")
        );
    }

    #[test]
    fn test_simulated_config_has_no_loaders() {
        let config = ResidencyConfig {
            simulated: true,
            ..Default::default()
        };
        let set = EngineSet::from_config(&config);
        assert!(set.reasoning.is_empty());
        assert!(set.routing.is_none());
        assert!(set.speech.is_none());
    }

    #[test]
    fn test_disabled_loads_are_skipped() {
        let mut config = ResidencyConfig {
            reasoning_fallback: Some(crate::config::EndpointConfig::new(
                "http://127.0.0.1:8003",
                "google/medgemma-4b-it",
            )),
            ..Default::default()
        };
        config.bootstrap.load_speech = false;

        let set = EngineSet::from_config(&config);
        assert_eq!(set.reasoning.len(), 2);
        assert!(set.routing.is_some());
        assert!(set.speech.is_none());
    }
}
