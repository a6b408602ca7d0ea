//! Software-only speech engine used when no speech model can be loaded.

use super::request::InferenceRequest;
use super::{EngineHandle, EngineLoader};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

/// Words per scripted dictation chunk.
pub const DEFAULT_DICTATION_CHUNK_WORDS: usize = 20;

/// A speech stand-in that never touches the GPU.
///
/// Each transcription returns the next scripted dictation chunk if one was
/// queued with [`simulate_dictation`](Self::simulate_dictation), otherwise a
/// placeholder describing the clip length.
#[derive(Default)]
pub struct SimulatedSpeechEngine {
    dictation: Mutex<VecDeque<String>>,
}

impl SimulatedSpeechEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `text` as dictation, split into chunks of about `chunk_words`
    /// words.
    pub fn simulate_dictation(&self, text: &str, chunk_words: usize) {
        let words: Vec<&str> = text.split_whitespace().collect();
        let chunks = words
            .chunks(chunk_words.max(1))
            .map(|chunk| chunk.join(" "));

        let mut queue = self.dictation.lock();
        queue.clear();
        queue.extend(chunks);
    }

    pub fn pending_chunks(&self) -> usize {
        self.dictation.lock().len()
    }
}

#[async_trait]
impl EngineHandle for SimulatedSpeechEngine {
    fn name(&self) -> &str {
        "simulated-speech"
    }

    fn uses_gpu(&self) -> bool {
        false
    }

    async fn evict(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn restore(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn infer(&self, request: &InferenceRequest) -> EngineResult<String> {
        let InferenceRequest::Transcribe(clip) = request else {
            return Err(EngineError::Unsupported {
                engine: self.name().to_string(),
                operation: request.operation(),
            });
        };

        if let Some(chunk) = self.dictation.lock().pop_front() {
            return Ok(chunk);
        }

        debug!(samples = clip.samples().len(), "simulated transcription");
        Ok(format!(
            "[simulated transcript: {:.1}s of audio]",
            clip.duration().as_secs_f64()
        ))
    }
}

/// Loader that always yields a fresh [`SimulatedSpeechEngine`].
pub struct SimulatedSpeechLoader;

#[async_trait]
impl EngineLoader for SimulatedSpeechLoader {
    fn describe(&self) -> String {
        "simulated-speech".to_string()
    }

    async fn initialize(&self) -> EngineResult<Box<dyn EngineHandle>> {
        Ok(Box::new(SimulatedSpeechEngine::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioInput;
    use crate::engine::request::GenerateRequest;

    fn one_second_clip() -> InferenceRequest {
        let clip = AudioInput::samples(vec![0.0; 16_000], 16_000)
            .into_clip()
            .unwrap();
        InferenceRequest::Transcribe(clip)
    }

    #[tokio::test]
    async fn test_placeholder_transcript() {
        let engine = SimulatedSpeechEngine::new();
        let text = engine.infer(&one_second_clip()).await.unwrap();
        assert_eq!(text, "[simulated transcript: 1.0s of audio]");
        assert!(!engine.uses_gpu());
    }

    #[tokio::test]
    async fn test_scripted_dictation_chunks() {
        let engine = SimulatedSpeechEngine::new();
        engine.simulate_dictation("patient reports chest pain radiating to left arm", 3);
        assert_eq!(engine.pending_chunks(), 3);

        assert_eq!(engine.infer(&one_second_clip()).await.unwrap(), "patient reports chest");
        assert_eq!(engine.infer(&one_second_clip()).await.unwrap(), "pain radiating to");
        assert_eq!(engine.infer(&one_second_clip()).await.unwrap(), "left arm");
        assert!(
            engine
                .infer(&one_second_clip())
                .await
                .unwrap()
                .starts_with("[simulated transcript")
        );
    }

    #[tokio::test]
    async fn test_generation_unsupported() {
        let engine = SimulatedSpeechEngine::new();
        let err = engine
            .infer(&InferenceRequest::Generate(GenerateRequest::routing("hi")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_evict_restore_are_noops() {
        let engine = SimulatedSpeechEngine::new();
        engine.evict().await.unwrap();
        engine.evict().await.unwrap();
        engine.restore().await.unwrap();
        assert!(engine.infer(&one_second_clip()).await.is_ok());
    }
}
