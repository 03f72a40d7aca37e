//! Streaming text-generation backend
//!
//! The backend answers a generate request with newline-delimited JSON
//! objects, each carrying a `response` fragment and a `done` flag.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Request body for a streaming generation
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GenerateRequest {
    /// Model identifier
    pub model: String,
    /// Fully assembled prompt
    pub prompt: String,
    /// Always `true` for the dialogue pipeline
    pub stream: bool,
}

/// One incremental piece of a generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateChunk {
    /// Text fragment (may be empty on the final chunk)
    pub text: String,
    /// Set on the last chunk of the stream
    pub done: bool,
}

/// Ordered fragments of one generation request
pub type TokenStream = BoxStream<'static, Result<GenerateChunk>>;

/// Text-generation backend
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Open a streaming generation
    ///
    /// # Errors
    ///
    /// Returns a backend error if the request cannot be started
    async fn generate(&self, request: &GenerateRequest) -> Result<TokenStream>;
}

/// Line of the streaming response as sent on the wire
#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Parse one line of the streaming response
///
/// # Errors
///
/// Returns `Malformed` for invalid JSON and a backend error when the line reports one
pub fn parse_line(line: &str) -> Result<GenerateChunk> {
    let wire: WireChunk = serde_json::from_str(line)
        .map_err(|e| Error::Malformed(format!("invalid generation chunk: {e}")))?;

    if let Some(message) = wire.error {
        return Err(Error::Backend {
            status: 200,
            message,
        });
    }

    Ok(GenerateChunk {
        text: wire.response,
        done: wire.done,
    })
}

/// Reassembles newline-delimited lines from arbitrarily split body chunks
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Create an empty decoder
    #[must_use]
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed body bytes, returning every complete non-blank line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(line) = decode_line(&line) {
                lines.push(line);
            }
        }
        lines
    }

    /// Return the trailing line left without a newline, if any
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(bytes: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(bytes);
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_string())
}

/// State carried between polls of a decoded body stream
struct BodyState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: LineDecoder,
    ready: VecDeque<String>,
    exhausted: bool,
}

/// Turn a streaming response body into parsed generation chunks
fn decode_body(body: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> TokenStream {
    let state = BodyState {
        body,
        decoder: LineDecoder::new(),
        ready: VecDeque::new(),
        exhausted: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                return Some((parse_line(&line), state));
            }
            if state.exhausted {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let lines = state.decoder.push(&bytes);
                    state.ready.extend(lines);
                }
                Some(Err(e)) => {
                    state.exhausted = true;
                    return Some((Err(Error::from(e)), state));
                }
                None => {
                    state.exhausted = true;
                    let tail = state.decoder.finish();
                    state.ready.extend(tail);
                }
            }
        }
    })
    .boxed()
}

/// Client for an Ollama-style `/api/generate` endpoint
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    /// Create a new generation client
    ///
    /// `connect_timeout` bounds connection setup only; a generation may
    /// stream for as long as the model keeps producing tokens.
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is empty or the HTTP client cannot be built
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(Error::Config("LLM base URL required".to_string()));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TextGenerator for OllamaClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<TokenStream> {
        tracing::debug!(model = %request.model, prompt_len = request.prompt.len(), "starting generation");

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "generation request failed");
                Error::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "generation API error");
            return Err(Error::Backend {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(decode_body(body))
    }
}
