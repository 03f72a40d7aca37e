//! HTTP backend client tests against local mock servers

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use futures::StreamExt;
use serde_json::{Value, json};

use parlance::voice::{
    SAMPLE_RATE, SovitsClient, SpeechRecognizer, SpeechSynthesizer, VoiceParams, WhisperClient,
};
use parlance::{Error, GenerateRequest, OllamaClient, TextGenerator};

mod common;

use common::{active_frame, serve};

fn request(prompt: &str) -> GenerateRequest {
    GenerateRequest {
        model: "llama3".to_string(),
        prompt: prompt.to_string(),
        stream: true,
    }
}

#[tokio::test]
async fn test_ollama_streams_ndjson() {
    let received = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&received);
    let router = axum::Router::new().route(
        "/api/generate",
        post(move |Json(body): Json<Value>| {
            let seen = Arc::clone(&seen);
            async move {
                *seen.lock().unwrap() = Some(body);
                concat!(
                    "{\"model\":\"llama3\",\"response\":\"Hi\",\"done\":false}\n",
                    "\n",
                    "{\"model\":\"llama3\",\"response\":\" there.\",\"done\":false}\n",
                    "{\"model\":\"llama3\",\"response\":\"\",\"done\":true}\n",
                )
            }
        }),
    );
    let base = serve(router).await;

    let client = OllamaClient::new(&base, Duration::from_secs(5)).unwrap();
    let chunks: Vec<_> = client
        .generate(&request("User: hello\nAssistant:"))
        .await
        .unwrap()
        .collect()
        .await;

    let chunks: Vec<_> = chunks.into_iter().map(Result::unwrap).collect();
    let text: String = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(text, "Hi there.");
    assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    assert!(chunks.last().unwrap().done);

    let body = received.lock().unwrap().clone().unwrap();
    assert_eq!(body["model"], "llama3");
    assert_eq!(body["stream"], true);
    assert_eq!(body["prompt"], "User: hello\nAssistant:");
}

#[tokio::test]
async fn test_ollama_error_status() {
    let router = axum::Router::new().route(
        "/api/generate",
        post(|| async { (StatusCode::NOT_FOUND, "model 'llama3' not found") }),
    );
    let base = serve(router).await;

    let client = OllamaClient::new(&base, Duration::from_secs(5)).unwrap();
    let err = client.generate(&request("hi")).await.err().unwrap();
    assert!(matches!(err, Error::Backend { status: 404, ref message } if message.contains("not found")));
}

#[tokio::test]
async fn test_ollama_error_line_ends_stream() {
    let router = axum::Router::new().route(
        "/api/generate",
        post(|| async {
            "{\"response\":\"Hi\",\"done\":false}\n{\"error\":\"out of memory\"}\n"
        }),
    );
    let base = serve(router).await;

    let client = OllamaClient::new(&base, Duration::from_secs(5)).unwrap();
    let items: Vec<_> = client.generate(&request("hi")).await.unwrap().collect().await;
    assert_eq!(items[0].as_ref().unwrap().text, "Hi");
    assert!(items.iter().any(Result::is_err));
}

#[tokio::test]
async fn test_unreachable_backend() {
    let client = OllamaClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
    let err = client.generate(&request("hi")).await.err().unwrap();
    assert!(matches!(err, Error::BackendUnreachable(_)));
}

#[tokio::test]
async fn test_sovits_query_and_audio() {
    let received = Arc::new(Mutex::new(HashMap::new()));
    let seen = Arc::clone(&received);
    let router = axum::Router::new().route(
        "/tts",
        get(move |Query(query): Query<HashMap<String, String>>| {
            let seen = Arc::clone(&seen);
            async move {
                *seen.lock().unwrap() = query;
                b"RIFF-fake-audio".to_vec()
            }
        }),
    );
    let base = serve(router).await;

    let voice = VoiceParams {
        ref_audio_path: Some("voices/neko/hello there.wav".to_string()),
        prompt_lang: Some("ja".to_string()),
        speed_factor: 1.2,
        ..VoiceParams::default()
    };
    let client = SovitsClient::new(&base, voice, Duration::from_secs(5)).unwrap();
    let audio = client.synthesize("Hi there.").await.unwrap();
    assert_eq!(audio, b"RIFF-fake-audio");

    let query = received.lock().unwrap().clone();
    assert_eq!(query["text"], "Hi there.");
    assert_eq!(query["text_lang"], "auto");
    assert_eq!(query["ref_audio_path"], "voices/neko/hello there.wav");
    assert_eq!(query["prompt_lang"], "ja");
    assert_eq!(query["prompt_text"], "hello there");
    assert_eq!(query["speed_factor"], "1.2");
    assert_eq!(query["text_split_method"], "cut5");
    assert_eq!(query["media_type"], "wav");
}

#[tokio::test]
async fn test_sovits_error_status() {
    let router = axum::Router::new().route(
        "/tts",
        get(|| async { (StatusCode::BAD_REQUEST, "ref_audio_path is required") }),
    );
    let base = serve(router).await;

    let client = SovitsClient::new(&base, VoiceParams::default(), Duration::from_secs(5)).unwrap();
    let err = client.synthesize("Hi.").await.unwrap_err();
    assert!(matches!(err, Error::Backend { status: 400, .. }));
}

#[tokio::test]
async fn test_whisper_multipart_upload() {
    let received = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&received);
    let router = axum::Router::new().route(
        "/v1/audio/transcriptions",
        post(move |headers: HeaderMap, body: Bytes| {
            let seen = Arc::clone(&seen);
            async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string);
                *seen.lock().unwrap() = Some((auth, body.to_vec()));
                Json(json!({ "text": " hello " }))
            }
        }),
    );
    let base = serve(router).await;

    let client = WhisperClient::new(
        &base,
        "whisper-1".to_string(),
        Some("sk-test".to_string()),
        Duration::from_secs(5),
    )
    .unwrap();
    let text = client.transcribe(&active_frame(SAMPLE_RATE as usize / 10)).await.unwrap();
    assert_eq!(text.trim(), "hello");

    let (auth, body) = received.lock().unwrap().clone().unwrap();
    assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
    let body = String::from_utf8_lossy(&body);
    assert!(body.contains("name=\"file\""));
    assert!(body.contains("RIFF"));
    assert!(body.contains("name=\"model\""));
    assert!(body.contains("whisper-1"));
}

#[tokio::test]
async fn test_whisper_error_status() {
    let router = axum::Router::new().route(
        "/v1/audio/transcriptions",
        post(|| async { (StatusCode::UNAUTHORIZED, "invalid api key") }),
    );
    let base = serve(router).await;

    let client =
        WhisperClient::new(&base, "whisper-1".to_string(), None, Duration::from_secs(5)).unwrap();
    let err = client.transcribe(&active_frame(160)).await.unwrap_err();
    assert!(matches!(err, Error::Backend { status: 401, .. }));
}

#[test]
fn test_empty_base_url_rejected() {
    assert!(matches!(
        OllamaClient::new("  ", Duration::from_secs(1)),
        Err(Error::Config(_))
    ));
}
