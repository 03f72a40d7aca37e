//! Speech-to-text (STT) backend

use std::time::Duration;

use async_trait::async_trait;

use super::capture::{SAMPLE_RATE, pcm_to_wav};
use crate::{Error, Result};

/// Speech-recognition backend
///
/// One call per utterance; the audio is 16 kHz mono 16-bit little-endian PCM.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe raw PCM to text
    ///
    /// # Errors
    ///
    /// Returns a backend error if the service is unreachable or rejects the audio
    async fn transcribe(&self, pcm: &[u8]) -> Result<String>;
}

/// Response from a Whisper-compatible transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Client for a Whisper-compatible `/v1/audio/transcriptions` endpoint
///
/// Works against the hosted `OpenAI` API as well as local servers that
/// mirror its multipart interface.
pub struct WhisperClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl WhisperClient {
    /// Create a new STT client
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is empty or the HTTP client cannot be built
    pub fn new(
        base_url: &str,
        model: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(Error::Config("STT base URL required".to_string()));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            model,
        })
    }
}

#[async_trait]
impl SpeechRecognizer for WhisperClient {
    async fn transcribe(&self, pcm: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = pcm.len(), "starting transcription");

        let wav = pcm_to_wav(pcm, SAMPLE_RATE)?;
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Malformed(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let mut request = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "transcription request failed");
            Error::from(e)
        })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Backend {
                status: status.as_u16(),
                message: body,
            });
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse transcription response");
            Error::Malformed(e.to_string())
        })?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}
