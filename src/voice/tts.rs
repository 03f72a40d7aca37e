//! Text-to-speech (TTS) backend

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::{Error, Result};

/// Speech-synthesis backend
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize one sentence
    ///
    /// # Returns
    ///
    /// Encoded audio bytes (WAV or MP3)
    ///
    /// # Errors
    ///
    /// Returns a backend error if the service is unreachable or rejects the text
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Voice of the active character, fixed at construction
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceParams {
    /// Reference audio the backend clones the voice from
    pub ref_audio_path: Option<String>,
    /// Language spoken in the reference audio
    pub prompt_lang: Option<String>,
    /// Language of the text to synthesize ("auto" lets the backend detect it)
    pub text_lang: String,
    /// Speaking speed multiplier
    pub speed_factor: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            ref_audio_path: None,
            prompt_lang: None,
            text_lang: "auto".to_string(),
            speed_factor: 1.0,
        }
    }
}

impl VoiceParams {
    /// Transcript of the reference audio, taken from its file stem
    ///
    /// Reference clips are named after what is said in them.
    #[must_use]
    pub fn prompt_text(&self) -> Option<String> {
        self.ref_audio_path
            .as_deref()
            .and_then(|p| Path::new(p).file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
    }

    /// Query parameters describing this voice
    fn query(&self, text: &str) -> Vec<(&'static str, String)> {
        let mut query = vec![("text", text.to_string()), ("text_lang", self.text_lang.clone())];
        if let Some(path) = &self.ref_audio_path {
            query.push(("ref_audio_path", path.clone()));
        }
        if let Some(lang) = &self.prompt_lang {
            query.push(("prompt_lang", lang.clone()));
        }
        if let Some(prompt_text) = self.prompt_text() {
            query.push(("prompt_text", prompt_text));
        }
        query.push(("speed_factor", self.speed_factor.to_string()));
        query.push(("text_split_method", "cut5".to_string()));
        query.push(("media_type", "wav".to_string()));
        query
    }
}

/// Client for a GPT-SoVITS style `/tts` endpoint
pub struct SovitsClient {
    client: reqwest::Client,
    base_url: String,
    voice: VoiceParams,
}

impl SovitsClient {
    /// Create a new TTS client
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is empty or the HTTP client cannot be built
    pub fn new(base_url: &str, voice: VoiceParams, timeout: Duration) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(Error::Config("TTS base URL required".to_string()));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            voice,
        })
    }

    /// Voice parameters sent with every request
    #[must_use]
    pub const fn voice(&self) -> &VoiceParams {
        &self.voice
    }
}

#[async_trait]
impl SpeechSynthesizer for SovitsClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        tracing::debug!(chars = text.chars().count(), "starting synthesis");

        let response = self
            .client
            .get(format!("{}/tts", self.base_url))
            .query(&self.voice.query(text))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Backend {
                status: status.as_u16(),
                message: body,
            });
        }

        let audio = response.bytes().await?;
        tracing::debug!(bytes = audio.len(), "synthesis complete");
        Ok(audio.to_vec())
    }
}
