//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;

use parlance::voice::{AudioOutput, AudioSource, SpeechRecognizer, SpeechSynthesizer};
use parlance::{Error, GenerateChunk, GenerateRequest, Result, TextGenerator, TokenStream};

/// Frame of `samples` identical 16-bit samples
#[must_use]
pub fn pcm_frame(amplitude: i16, samples: usize) -> Vec<u8> {
    amplitude
        .to_le_bytes()
        .iter()
        .copied()
        .cycle()
        .take(samples * 2)
        .collect()
}

/// Loud frame, well above the default activation threshold
#[must_use]
pub fn active_frame(samples: usize) -> Vec<u8> {
    pcm_frame(20_000, samples)
}

/// Silent frame
#[must_use]
pub fn silent_frame(samples: usize) -> Vec<u8> {
    pcm_frame(0, samples)
}

/// Successful generation chunk
#[must_use]
pub fn chunk(text: &str, done: bool) -> Result<GenerateChunk> {
    Ok(GenerateChunk {
        text: text.to_string(),
        done,
    })
}

/// Generator replaying one scripted response per request
#[derive(Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Vec<Result<GenerateChunk>>>>,
    prompts: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedGenerator {
    /// Generator answering requests with `responses` in order
    #[must_use]
    pub fn new(responses: Vec<Vec<Result<GenerateChunk>>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    /// Hold every stream until `gate` is notified
    #[must_use]
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<TokenStream> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let script = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::BackendUnreachable("no scripted response".to_string()))?;

        let gate = self.gate.clone();
        Ok(futures::stream::once(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            futures::stream::iter(script)
        })
        .flatten()
        .boxed())
    }
}

/// Recognizer whose behavior is decided per utterance by a closure
///
/// The closure sees the utterance audio and returns a delay plus the
/// transcript, or `None` to fail.
pub struct FnRecognizer<F> {
    behavior: F,
}

impl<F> FnRecognizer<F>
where
    F: Fn(&[u8]) -> (Duration, Option<String>) + Send + Sync,
{
    pub fn new(behavior: F) -> Self {
        Self { behavior }
    }
}

#[async_trait]
impl<F> SpeechRecognizer for FnRecognizer<F>
where
    F: Fn(&[u8]) -> (Duration, Option<String>) + Send + Sync,
{
    async fn transcribe(&self, pcm: &[u8]) -> Result<String> {
        let (delay, text) = (self.behavior)(pcm);
        tokio::time::sleep(delay).await;
        text.ok_or_else(|| Error::Backend {
            status: 500,
            message: "scripted failure".to_string(),
        })
    }
}

/// Synthesizer returning the text bytes as audio
#[derive(Default)]
pub struct EchoSynthesizer {
    fail_on: Option<String>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
}

impl EchoSynthesizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail whenever the text equals `text`
    #[must_use]
    pub fn failing_on(mut self, text: &str) -> Self {
        self.fail_on = Some(text.to_string());
        self
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Texts received so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for EchoSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(text.to_string());
        tokio::time::sleep(self.delay).await;
        if self.fail_on.as_deref() == Some(text) {
            return Err(Error::Backend {
                status: 500,
                message: "synthesis failed".to_string(),
            });
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// Output recording every clip it was asked to play
#[derive(Clone, Default)]
pub struct RecordingOutput {
    played: Arc<Mutex<Vec<Vec<u8>>>>,
    delay: Duration,
}

impl RecordingOutput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Clips played so far, decoded as UTF-8
    pub fn played(&self) -> Vec<String> {
        self.played
            .lock()
            .unwrap()
            .iter()
            .map(|clip| String::from_utf8_lossy(clip).into_owned())
            .collect()
    }
}

impl AudioOutput for RecordingOutput {
    fn play(&mut self, clip: &[u8]) -> Result<()> {
        std::thread::sleep(self.delay);
        self.played.lock().unwrap().push(clip.to_vec());
        Ok(())
    }
}

/// Source fed by the test through a channel
///
/// Capturing ends once the sender is dropped and every frame is read.
pub struct ChannelSource {
    frames: std_mpsc::Receiver<Vec<u8>>,
    capturing: bool,
}

impl ChannelSource {
    #[must_use]
    pub fn new() -> (std_mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = std_mpsc::channel();
        (
            tx,
            Self {
                frames: rx,
                capturing: false,
            },
        )
    }
}

impl AudioSource for ChannelSource {
    fn start(&mut self) -> Result<()> {
        self.capturing = true;
        Ok(())
    }

    fn read(&mut self, _n: usize) -> Vec<u8> {
        if !self.capturing {
            return Vec::new();
        }
        match self.frames.recv_timeout(Duration::from_millis(20)) {
            Ok(frame) => frame,
            Err(std_mpsc::RecvTimeoutError::Timeout) => Vec::new(),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                self.capturing = false;
                Vec::new()
            }
        }
    }

    fn stop(&mut self) {
        self.capturing = false;
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }
}

/// Source that can never be opened
pub struct UnavailableSource;

impl AudioSource for UnavailableSource {
    fn start(&mut self) -> Result<()> {
        Err(Error::DeviceUnavailable("no input device".to_string()))
    }

    fn read(&mut self, _n: usize) -> Vec<u8> {
        Vec::new()
    }

    fn stop(&mut self) {}

    fn is_capturing(&self) -> bool {
        false
    }
}

/// Poll `condition` until it holds or five seconds pass
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Serve `router` on an ephemeral local port and return its base URL
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}
