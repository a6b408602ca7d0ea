//! Error types for engines and the residency manager.

use crate::model::ModelName;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Engine errors
// ============================================================================

/// Errors raised by an engine handle.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The request never produced an HTTP response
    #[error("HTTP request to {endpoint} failed: {message}")]
    Http { endpoint: String, message: String },

    /// The server answered with a non-success status
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The response body did not have the expected shape
    #[error("Failed to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    /// Audio or image payload could not be encoded
    #[error("Failed to encode request payload: {0}")]
    Encode(String),

    /// Inference was attempted while the weights were evicted
    #[error("Engine {0} is not resident")]
    NotResident(String),

    /// The engine does not implement the requested operation
    #[error("Engine {engine} does not support {operation}")]
    Unsupported {
        engine: String,
        operation: &'static str,
    },

    /// The served model is not the one this engine was configured for
    #[error("Engine {engine} serves {served:?}, expected {expected}")]
    ModelMismatch {
        engine: String,
        expected: String,
        served: Vec<String>,
    },

    /// The engine did not become ready in time
    #[error("Timed out after {0:?} waiting for engine")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

// ============================================================================
// Residency errors
// ============================================================================

/// Which half of a transition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionStep {
    Evict,
    Restore,
}

impl fmt::Display for TransitionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evict => write!(f, "evict"),
            Self::Restore => write!(f, "restore"),
        }
    }
}

/// Errors surfaced by the residency manager.
#[derive(Debug, Clone, Error)]
pub enum ResidencyError {
    /// An engine could not be constructed. Absorbed during bootstrap unless
    /// the slot has no fallback left.
    #[error("Failed to initialize {model}: {source}")]
    Initialization {
        model: ModelName,
        #[source]
        source: EngineError,
    },

    /// `evict` or `restore` failed while switching the resident model.
    /// Safe to retry.
    #[error("Failed to {step} {model}: {source}")]
    Transition {
        model: ModelName,
        step: TransitionStep,
        #[source]
        source: EngineError,
    },

    /// The engine itself failed to answer the request
    #[error("Inference on {model} failed: {source}")]
    Inference {
        model: ModelName,
        #[source]
        source: EngineError,
    },

    /// The caller's cancellation token fired
    #[error("Request cancelled{}", .model.map(|m| format!(" ({m})")).unwrap_or_default())]
    Cancelled { model: Option<ModelName> },

    /// The slot never finished loading and has no fallback
    #[error("Model {0} is unavailable")]
    ModelUnavailable(ModelName),

    /// The request payload was malformed
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ResidencyError {
    /// Transition failures leave the manager consistent and can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transition { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether the API boundary should answer with a 5xx.
    pub fn is_server_fault(&self) -> bool {
        !matches!(self, Self::Cancelled { .. } | Self::InvalidInput(_))
    }

    /// The model this error concerns, if any.
    pub fn model(&self) -> Option<ModelName> {
        match self {
            Self::Initialization { model, .. }
            | Self::Transition { model, .. }
            | Self::Inference { model, .. } => Some(*model),
            Self::Cancelled { model } => *model,
            Self::ModelUnavailable(model) => Some(*model),
            Self::InvalidInput(_) => None,
        }
    }
}

/// Result type for residency manager operations
pub type ResidencyResult<T> = Result<T, ResidencyError>;
