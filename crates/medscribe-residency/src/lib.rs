//! GPU residency management for the MedScribe model stack.
//!
//! Three models share one accelerator that can hold only one of them at a
//! time: a multimodal reasoning model, a small function-routing model and a
//! speech recognition model. [`ResidencyManager`] loads each once, keeps
//! dormant models evicted, and swaps them in on demand under a single lock.
//!
//! ```rust,ignore
//! use medscribe_residency::{ResidencyConfig, GenerateRequest, bootstrap_from_config};
//! use std::sync::Arc;
//!
//! let config = ResidencyConfig::from_file("medscribe.toml")?;
//! let manager = Arc::new(bootstrap_from_config(&config).await?);
//!
//! let note = manager
//!     .infer_reasoning(GenerateRequest::reasoning("Summarise the encounter"), None)
//!     .await?;
//! println!("{}", manager.status().await.to_json());
//! ```

// audio normalisation
pub mod audio;

// engine loading at process start
pub mod bootstrap;

// configuration loading
pub mod config;

// engine handles and adapters
pub mod engine;

pub mod error;

// the residency manager
pub mod manager;

pub mod model;
pub mod slot;
pub mod status;

pub use audio::{AudioClip, AudioInput, TARGET_SAMPLE_RATE};
pub use bootstrap::{EngineSet, bootstrap, bootstrap_from_config};
pub use config::{BootstrapConfig, ConfigError, ConfigResult, EndpointConfig, ResidencyConfig};
pub use engine::{
    EngineHandle, EngineLoader, GenerateOptions, GenerateRequest, ImageInput, InferenceRequest,
};
pub use error::{EngineError, EngineResult, ResidencyError, ResidencyResult, TransitionStep};
pub use manager::ResidencyManager;
pub use model::{ModelName, ModelStatus};
pub use slot::ModelSlot;
pub use status::{SlotStatus, StatusSnapshot};
