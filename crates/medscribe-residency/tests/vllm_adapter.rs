//! vLLM adapter tests against an in-process stub of the vLLM HTTP API.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use medscribe_residency::engine::{VllmEngine, VllmLoader};
use medscribe_residency::{
    AudioInput, EndpointConfig, EngineError, EngineHandle, EngineLoader, GenerateRequest,
    ImageInput, InferenceRequest,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

const MODEL: &str = "google/medgemma-1.5-4b-it";

#[derive(Default)]
struct Stub {
    sleeping: AtomicBool,
    sleep_calls: AtomicUsize,
    wake_calls: AtomicUsize,
    fail_wake: AtomicBool,
    sleep_level: Mutex<Option<String>>,
    last_completion: Mutex<Option<Value>>,
    last_chat: Mutex<Option<Value>>,
    last_upload: Mutex<Option<(String, Vec<u8>)>>,
}

type Shared = Arc<Stub>;

fn asleep() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "model is sleeping").into_response()
}

async fn models() -> Json<Value> {
    Json(json!({ "object": "list", "data": [{ "id": MODEL, "object": "model" }] }))
}

async fn sleep(State(stub): State<Shared>, Query(query): Query<HashMap<String, String>>) -> StatusCode {
    *stub.sleep_level.lock() = query.get("level").cloned();
    stub.sleep_calls.fetch_add(1, Ordering::SeqCst);
    stub.sleeping.store(true, Ordering::SeqCst);
    StatusCode::OK
}

async fn wake_up(State(stub): State<Shared>) -> StatusCode {
    if stub.fail_wake.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    stub.wake_calls.fetch_add(1, Ordering::SeqCst);
    stub.sleeping.store(false, Ordering::SeqCst);
    StatusCode::OK
}

async fn is_sleeping(State(stub): State<Shared>) -> Json<Value> {
    Json(json!({ "is_sleeping": stub.sleeping.load(Ordering::SeqCst) }))
}

async fn completions(State(stub): State<Shared>, Json(body): Json<Value>) -> Response {
    if stub.sleeping.load(Ordering::SeqCst) {
        return asleep();
    }
    let prompt = body["prompt"].as_str().unwrap_or_default().to_string();
    *stub.last_completion.lock() = Some(body);
    Json(json!({ "choices": [{ "index": 0, "text": format!("  echo: {prompt}\n") }] })).into_response()
}

async fn chat(State(stub): State<Shared>, Json(body): Json<Value>) -> Response {
    if stub.sleeping.load(Ordering::SeqCst) {
        return asleep();
    }
    *stub.last_chat.lock() = Some(body);
    Json(json!({
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": "No acute findings." } }]
    }))
    .into_response()
}

async fn transcriptions(State(stub): State<Shared>, headers: HeaderMap, body: Bytes) -> Response {
    if stub.sleeping.load(Ordering::SeqCst) {
        return asleep();
    }
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    *stub.last_upload.lock() = Some((content_type, body.to_vec()));
    Json(json!({ "text": "  Patient denies chest pain.\n" })).into_response()
}

async fn spawn_stub() -> (String, Shared) {
    let stub = Shared::default();
    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/v1/models", get(models))
        .route("/sleep", post(sleep))
        .route("/wake_up", post(wake_up))
        .route("/is_sleeping", get(is_sleeping))
        .route("/v1/completions", post(completions))
        .route("/v1/chat/completions", post(chat))
        .route("/v1/audio/transcriptions", post(transcriptions))
        .with_state(stub.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), stub)
}

fn endpoint(base_url: &str, model_id: &str) -> EndpointConfig {
    EndpointConfig::new(base_url, model_id).with_startup_timeout(Duration::from_secs(5))
}

async fn loaded_engine() -> (Box<dyn EngineHandle>, Shared) {
    let (url, stub) = spawn_stub().await;
    let engine = VllmLoader::new("reasoning", endpoint(&url, MODEL))
        .initialize()
        .await
        .unwrap();
    (engine, stub)
}

#[tokio::test]
async fn test_initialize_leaves_server_asleep() {
    let (engine, stub) = loaded_engine().await;

    assert_eq!(engine.name(), "reasoning");
    assert!(engine.uses_gpu());
    assert!(stub.sleeping.load(Ordering::SeqCst));
    assert_eq!(stub.sleep_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stub.sleep_level.lock().as_deref(), Some("2"));
}

#[tokio::test]
async fn test_initialize_skips_sleep_when_already_asleep() {
    let (url, stub) = spawn_stub().await;
    stub.sleeping.store(true, Ordering::SeqCst);

    let engine = VllmLoader::new("routing", endpoint(&url, MODEL))
        .initialize()
        .await
        .unwrap();
    assert_eq!(stub.sleep_calls.load(Ordering::SeqCst), 0);

    engine.restore().await.unwrap();
    assert_eq!(stub.wake_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_evict_and_restore_are_idempotent() {
    let (engine, stub) = loaded_engine().await;

    engine.evict().await.unwrap();
    assert_eq!(stub.sleep_calls.load(Ordering::SeqCst), 1);

    engine.restore().await.unwrap();
    engine.restore().await.unwrap();
    assert_eq!(stub.wake_calls.load(Ordering::SeqCst), 1);
    assert!(!stub.sleeping.load(Ordering::SeqCst));

    engine.evict().await.unwrap();
    engine.evict().await.unwrap();
    assert_eq!(stub.sleep_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_infer_while_dormant_is_rejected() {
    let (engine, _stub) = loaded_engine().await;
    let err = engine
        .infer(&InferenceRequest::Generate(GenerateRequest::reasoning("hello")))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotResident(_)));
}

#[tokio::test]
async fn test_text_completion_sends_sampling_options() {
    let (engine, stub) = loaded_engine().await;
    engine.restore().await.unwrap();

    let text = engine
        .infer(&InferenceRequest::Generate(GenerateRequest::routing("order a cbc")))
        .await
        .unwrap();
    assert_eq!(text, "  echo: order a cbc\n");

    let body = stub.last_completion.lock().clone().unwrap();
    assert_eq!(body["model"], MODEL);
    assert_eq!(body["max_tokens"], 512);
    assert_eq!(body["stop"], json!(["User:", "\n\n"]));
}

#[tokio::test]
async fn test_image_goes_through_chat_completions() {
    let (engine, stub) = loaded_engine().await;
    engine.restore().await.unwrap();

    let request = GenerateRequest::reasoning("Describe the radiograph")
        .with_image(ImageInput::new(vec![0x89, b'P', b'N', b'G'], "image/png"));
    let text = engine
        .infer(&InferenceRequest::Generate(request))
        .await
        .unwrap();
    assert_eq!(text, "No acute findings.");

    let body = stub.last_chat.lock().clone().unwrap();
    let content = &body["messages"][0]["content"];
    assert_eq!(content[0]["type"], "image_url");
    assert_eq!(content[0]["image_url"]["url"], "data:image/png;base64,iVBORw==");
    assert_eq!(content[1]["text"], "Describe the radiograph");
}

#[tokio::test]
async fn test_transcription_uploads_wav() {
    let (url, stub) = spawn_stub().await;
    let engine = VllmLoader::new("speech", endpoint(&url, MODEL))
        .initialize()
        .await
        .unwrap();
    engine.restore().await.unwrap();

    let clip = AudioInput::samples(vec![0.1; 8_000], 8_000).into_clip().unwrap();
    let text = engine
        .infer(&InferenceRequest::Transcribe(clip))
        .await
        .unwrap();
    assert_eq!(text, "Patient denies chest pain.");

    let (content_type, body) = stub.last_upload.lock().clone().unwrap();
    assert!(content_type.starts_with("multipart/form-data"));
    let body = String::from_utf8_lossy(&body);
    assert!(body.contains("filename=\"audio.wav\""));
    assert!(body.contains("RIFF"));
    assert!(body.contains("name=\"language\""));
}

#[tokio::test]
async fn test_failed_wake_keeps_engine_dormant() {
    let (url, stub) = spawn_stub().await;
    let engine = VllmEngine::new("reasoning", endpoint(&url, MODEL)).unwrap();
    engine.evict().await.unwrap();

    stub.fail_wake.store(true, Ordering::SeqCst);
    let err = engine.restore().await.unwrap_err();
    assert!(matches!(err, EngineError::Status { status: 500, .. }));
    assert!(engine.is_dormant());

    stub.fail_wake.store(false, Ordering::SeqCst);
    engine.restore().await.unwrap();
    assert!(!engine.is_dormant());
}

#[tokio::test]
async fn test_model_mismatch_fails_initialization() {
    let (url, stub) = spawn_stub().await;
    let err = VllmLoader::new("routing", endpoint(&url, "google/functiongemma-3-270m"))
        .initialize()
        .await
        .err()
        .unwrap();

    match err {
        EngineError::ModelMismatch { expected, served, .. } => {
            assert_eq!(expected, "google/functiongemma-3-270m");
            assert_eq!(served, vec![MODEL.to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(stub.sleep_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_server_times_out() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let config = EndpointConfig::new(url, MODEL).with_startup_timeout(Duration::from_secs(1));
    let err = VllmLoader::new("speech", config)
        .initialize()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::Timeout(_)));
}
