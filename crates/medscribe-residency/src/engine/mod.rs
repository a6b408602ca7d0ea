//! Engine handles
//!
//! An engine handle wraps one inference backend and exposes the four
//! operations the residency manager needs:
//!
//! - `EngineLoader::initialize`: construct the backend and leave it evicted
//! - `EngineHandle::evict`: move weights and working memory off the GPU
//! - `EngineHandle::restore`: move them back
//! - `EngineHandle::infer`: run one request while resident
//!
//! Only the residency manager may call `evict` and `restore`.

pub mod request;
pub mod router;
pub mod simulated;
pub mod vllm;

use crate::error::EngineResult;
use async_trait::async_trait;

pub use request::{GenerateOptions, GenerateRequest, ImageInput, InferenceRequest};
pub use router::{ESCALATE_TOOL, KeywordRoute, KeywordRouter, KeywordRouterLoader};
pub use simulated::{SimulatedSpeechEngine, SimulatedSpeechLoader};
pub use vllm::{VllmEngine, VllmLoader};

/// A loaded inference backend.
///
/// Implementations use interior state so the manager can drive them through
/// a shared reference while it holds its lock.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Backend name for logs and diagnostics
    fn name(&self) -> &str;

    /// Whether this engine occupies the accelerator. Software-only stand-ins
    /// return `false` and are always resident.
    fn uses_gpu(&self) -> bool {
        true
    }

    /// Free the engine's accelerator memory. Idempotent.
    async fn evict(&self) -> EngineResult<()>;

    /// Bring the engine back onto the accelerator. Idempotent.
    async fn restore(&self) -> EngineResult<()>;

    /// Run one request. Only valid while resident.
    async fn infer(&self, request: &InferenceRequest) -> EngineResult<String>;
}

/// Constructs an engine handle.
///
/// A successful `initialize` returns an engine that has already been
/// evicted, so the next loader can use the freed memory.
#[async_trait]
pub trait EngineLoader: Send + Sync {
    /// Human-readable description (backend and model id)
    fn describe(&self) -> String;

    async fn initialize(&self) -> EngineResult<Box<dyn EngineHandle>>;
}
