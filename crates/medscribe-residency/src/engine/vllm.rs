//! vLLM engine adapter
//!
//! Drives an OpenAI-compatible vLLM server launched with
//! `--enable-sleep-mode`. Eviction is `POST /sleep?level=N`, which releases
//! the server's GPU memory; restoration is `POST /wake_up`. Generation goes
//! through `/v1/completions` (or `/v1/chat/completions` when an image is
//! attached) and speech through `/v1/audio/transcriptions`.

use super::request::{GenerateRequest, InferenceRequest};
use super::{EngineHandle, EngineLoader};
use crate::audio::AudioClip;
use crate::config::EndpointConfig;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const TRANSCRIPTION_LANGUAGE: &str = "en";

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    stop: &'a [String],
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelCard>,
}

#[derive(Debug, Deserialize)]
struct ModelCard {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SleepState {
    is_sleeping: bool,
}

/// One vLLM deployment managed as an engine handle.
pub struct VllmEngine {
    label: String,
    config: EndpointConfig,
    client: reqwest::Client,
    sleeping: AtomicBool,
}

impl VllmEngine {
    /// Create a handle. No request is sent until initialization.
    pub fn new(label: impl Into<String>, config: EndpointConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| EngineError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            label: label.into(),
            config,
            client,
            sleeping: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Whether this handle believes the server is asleep.
    pub fn is_dormant(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> EngineResult<reqwest::Response> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| EngineError::Http {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                endpoint: endpoint.to_string(),
                status,
                body,
            });
        }
        Ok(response)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &str,
    ) -> EngineResult<T> {
        response.json().await.map_err(|e| EngineError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }

    /// Poll `/health` until the server answers or `timeout` elapses.
    pub async fn wait_until_healthy(&self, timeout: Duration) -> EngineResult<()> {
        let started = Instant::now();
        loop {
            match self.send(self.client.get(self.url("/health")), "/health").await {
                Ok(_) => return Ok(()),
                Err(e) if started.elapsed() >= timeout => {
                    warn!(engine = %self.label, error = %e, "vLLM server never became healthy");
                    return Err(EngineError::Timeout(timeout));
                }
                Err(e) => {
                    debug!(engine = %self.label, error = %e, "waiting for vLLM server");
                    tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Check that the server serves the configured model id.
    pub async fn verify_served_model(&self) -> EngineResult<()> {
        let endpoint = "/v1/models";
        let response = self.send(self.client.get(self.url(endpoint)), endpoint).await?;
        let models: ModelList = Self::decode(response, endpoint).await?;

        if models.data.iter().any(|m| m.id == self.config.model_id) {
            return Ok(());
        }
        Err(EngineError::ModelMismatch {
            engine: self.label.clone(),
            expected: self.config.model_id.clone(),
            served: models.data.into_iter().map(|m| m.id).collect(),
        })
    }

    /// Ask the server whether it is asleep, and sync the local flag.
    pub async fn probe_sleeping(&self) -> EngineResult<bool> {
        let endpoint = "/is_sleeping";
        let response = self.send(self.client.get(self.url(endpoint)), endpoint).await?;
        let state: SleepState = Self::decode(response, endpoint).await?;
        self.sleeping.store(state.is_sleeping, Ordering::Release);
        Ok(state.is_sleeping)
    }

    async fn sleep(&self) -> EngineResult<()> {
        let level = self.config.sleep_level.to_string();
        self.send(
            self.client
                .post(self.url("/sleep"))
                .query(&[("level", level.as_str())]),
            "/sleep",
        )
        .await?;
        self.sleeping.store(true, Ordering::Release);
        Ok(())
    }

    async fn wake_up(&self) -> EngineResult<()> {
        self.send(self.client.post(self.url("/wake_up")), "/wake_up")
            .await?;
        self.sleeping.store(false, Ordering::Release);
        Ok(())
    }

    async fn complete(&self, request: &GenerateRequest) -> EngineResult<String> {
        let endpoint = "/v1/completions";
        let body = CompletionRequest {
            model: &self.config.model_id,
            prompt: &request.prompt,
            temperature: request.options.temperature,
            top_p: request.options.top_p,
            max_tokens: request.options.max_tokens,
            stop: &request.options.stop,
        };
        let response = self
            .send(self.client.post(self.url(endpoint)).json(&body), endpoint)
            .await?;
        let completion: CompletionResponse = Self::decode(response, endpoint).await?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or_else(|| EngineError::Decode {
                endpoint: endpoint.to_string(),
                message: "response has no choices".to_string(),
            })
    }

    async fn chat_with_image(&self, request: &GenerateRequest) -> EngineResult<String> {
        let endpoint = "/v1/chat/completions";
        let mut content = Vec::with_capacity(2);
        if let Some(image) = &request.image {
            let data_url = format!(
                "data:{};base64,{}",
                image.mime_type,
                BASE64.encode(&image.bytes)
            );
            content.push(json!({ "type": "image_url", "image_url": { "url": data_url } }));
        }
        content.push(json!({ "type": "text", "text": request.prompt }));

        let body = json!({
            "model": self.config.model_id,
            "messages": [{ "role": "user", "content": content }],
            "temperature": request.options.temperature,
            "top_p": request.options.top_p,
            "max_tokens": request.options.max_tokens,
            "stop": request.options.stop,
        });
        let response = self
            .send(self.client.post(self.url(endpoint)).json(&body), endpoint)
            .await?;
        let chat: ChatResponse = Self::decode(response, endpoint).await?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EngineError::Decode {
                endpoint: endpoint.to_string(),
                message: "response has no message content".to_string(),
            })
    }

    async fn transcribe(&self, clip: &AudioClip) -> EngineResult<String> {
        let endpoint = "/v1/audio/transcriptions";
        let file_part = multipart::Part::bytes(clip.to_wav_bytes()?)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| EngineError::Encode(format!("failed to build multipart chunk: {e}")))?;

        let form = multipart::Form::new()
            .part("file", file_part)
            .text("model", self.config.model_id.clone())
            .text("language", TRANSCRIPTION_LANGUAGE)
            .text("response_format", "json");

        let response = self
            .send(self.client.post(self.url(endpoint)).multipart(form), endpoint)
            .await?;
        let transcription: TranscriptionResponse = Self::decode(response, endpoint).await?;
        Ok(transcription.text.trim().to_string())
    }
}

#[async_trait]
impl EngineHandle for VllmEngine {
    fn name(&self) -> &str {
        &self.label
    }

    async fn evict(&self) -> EngineResult<()> {
        if self.is_dormant() {
            debug!(engine = %self.label, "already asleep");
            return Ok(());
        }
        self.sleep().await
    }

    async fn restore(&self) -> EngineResult<()> {
        if !self.is_dormant() {
            debug!(engine = %self.label, "already awake");
            return Ok(());
        }
        self.wake_up().await
    }

    async fn infer(&self, request: &InferenceRequest) -> EngineResult<String> {
        if self.is_dormant() {
            return Err(EngineError::NotResident(self.label.clone()));
        }

        debug!(
            engine = %self.label,
            model_id = %self.config.model_id,
            operation = request.operation(),
            "dispatching to vLLM"
        );

        match request {
            InferenceRequest::Generate(req) if req.image.is_some() => self.chat_with_image(req).await,
            InferenceRequest::Generate(req) => self.complete(req).await,
            InferenceRequest::Transcribe(clip) => self.transcribe(clip).await,
        }
    }
}

/// Initializes a [`VllmEngine`]: waits for the server, checks the model id,
/// then puts the server to sleep.
pub struct VllmLoader {
    label: String,
    config: EndpointConfig,
}

impl VllmLoader {
    pub fn new(label: impl Into<String>, config: EndpointConfig) -> Self {
        Self {
            label: label.into(),
            config,
        }
    }
}

#[async_trait]
impl EngineLoader for VllmLoader {
    fn describe(&self) -> String {
        format!("vllm:{}@{}", self.config.model_id, self.config.base_url)
    }

    async fn initialize(&self) -> EngineResult<Box<dyn EngineHandle>> {
        info!(
            engine = %self.label,
            model_id = %self.config.model_id,
            base_url = %self.config.base_url,
            launch = %self.config.launch_args().join(" "),
            "initializing vLLM engine"
        );

        let engine = VllmEngine::new(self.label.clone(), self.config.clone())?;
        engine
            .wait_until_healthy(self.config.startup_timeout())
            .await?;
        engine.verify_served_model().await?;

        if !engine.probe_sleeping().await? {
            engine.sleep().await?;
        }

        info!(engine = %self.label, "vLLM engine loaded and sleeping");
        Ok(Box::new(engine))
    }
}
