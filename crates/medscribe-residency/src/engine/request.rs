//! Requests handed to engine handles.

use crate::audio::AudioClip;
use serde::{Deserialize, Serialize};

/// Sampling parameters for text generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Sampling temperature (0.0 = greedy)
    pub temperature: f32,
    /// Top-p nucleus sampling threshold
    pub top_p: f32,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Stop sequences
    pub stop: Vec<String>,
}

impl GenerateOptions {
    /// Defaults for the reasoning model.
    pub fn reasoning() -> Self {
        Self {
            temperature: 0.4,
            top_p: 0.9,
            max_tokens: 2048,
            stop: vec!["<|end|>".to_string(), "<|eot_id|>".to_string()],
        }
    }

    /// Defaults for the routing model: near-greedy and short.
    pub fn routing() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.95,
            max_tokens: 512,
            stop: vec!["User:".to_string(), "\n\n".to_string()],
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }
}

/// An image attached to a reasoning request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInput {
    pub bytes: Vec<u8>,
    /// e.g. `image/png`
    pub mime_type: String,
}

impl ImageInput {
    pub fn new(bytes: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// A text generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub options: GenerateOptions,
    pub image: Option<ImageInput>,
}

impl GenerateRequest {
    /// A reasoning request with the reasoning defaults.
    pub fn reasoning(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: GenerateOptions::reasoning(),
            image: None,
        }
    }

    /// A routing request with the routing defaults.
    pub fn routing(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: GenerateOptions::routing(),
            image: None,
        }
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.image = Some(image);
        self
    }
}

/// One inference call against an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceRequest {
    Generate(GenerateRequest),
    Transcribe(AudioClip),
}

impl InferenceRequest {
    /// Operation name used in logs and `Unsupported` errors.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Generate(req) if req.image.is_some() => "multimodal generation",
            Self::Generate(_) => "text generation",
            Self::Transcribe(_) => "transcription",
        }
    }
}
