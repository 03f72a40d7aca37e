//! Synthesis stage
//!
//! Sentences are synthesized one at a time in submission order and the
//! resulting clips handed to the playback sink. A sentence that cannot be
//! synthesized is dropped and the next one proceeds.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::playback::PlaybackSink;
use super::queue::{BoundedQueue, QueueClosed};
use super::types::{AudioClip, SentenceChunk};
use crate::voice::SpeechSynthesizer;
use crate::{Error, Result};

/// Longest sentence sent to the synthesizer, in characters
pub const DEFAULT_MAX_CHARS: usize = 1024;

/// Tuning for the synthesis stage
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Sentences waiting for synthesis
    pub queue_capacity: usize,
    /// Longer sentences are dropped
    pub max_chars: usize,
    /// Limit for a single synthesizer call
    pub timeout: Duration,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            max_chars: DEFAULT_MAX_CHARS,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Single-flight text-to-speech worker feeding a [`PlaybackSink`]
pub struct SynthesisWorker {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<PlaybackSink>,
    config: SynthesisConfig,
    queue: Arc<BoundedQueue<SentenceChunk>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SynthesisWorker {
    /// Create a stopped worker
    #[must_use]
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Arc<PlaybackSink>,
        config: SynthesisConfig,
    ) -> Self {
        Self {
            queue: Arc::new(BoundedQueue::new(config.queue_capacity)),
            synthesizer,
            sink,
            config,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Start the worker loop; no-op if already running
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let runner = Runner {
            synthesizer: Arc::clone(&self.synthesizer),
            sink: Arc::clone(&self.sink),
            config: self.config.clone(),
            queue: Arc::clone(&self.queue),
        };
        *task = Some(tokio::spawn(runner.run(self.cancel.clone())));
        tracing::debug!(max_chars = self.config.max_chars, "synthesis worker started");
    }

    /// Queue a sentence, waiting while the queue is full
    ///
    /// # Errors
    ///
    /// Hands the sentence back if the worker has been stopped
    pub async fn submit(&self, chunk: SentenceChunk) -> std::result::Result<(), QueueClosed<SentenceChunk>> {
        self.queue.push(chunk).await
    }

    /// Drop queued sentences; the call already in flight still completes
    pub fn clear(&self) -> usize {
        let dropped = self.queue.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "synthesis queue cleared");
        }
        dropped
    }

    /// Stop the worker after its in-flight call; calling it again is harmless
    pub async fn stop(&self) {
        self.queue.close();
        self.cancel.cancel();

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "synthesis worker ended abnormally");
            }
            tracing::debug!("synthesis worker stopped");
        }
    }

    /// Whether a sentence is waiting, being synthesized or being handed to playback
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.queue.is_idle()
    }
}

struct Runner {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<PlaybackSink>,
    config: SynthesisConfig,
    queue: Arc<BoundedQueue<SentenceChunk>>,
}

impl Runner {
    async fn run(self, cancel: CancellationToken) {
        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => break,
                chunk = self.queue.pop() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            let sequence = chunk.sequence;
            let result = self.synthesize(&chunk).await;

            // The sentence stays in progress until its clip is queued for playback
            let handed_off = match result {
                Ok(data) => {
                    tracing::debug!(sequence, bytes = data.len(), "sentence synthesized");
                    self.sink.enqueue(AudioClip { sequence, data }).await.is_ok()
                }
                Err(e) => {
                    tracing::warn!(sequence, error = %e, "dropping sentence");
                    true
                }
            };
            self.queue.done();

            if !handed_off {
                tracing::debug!("playback sink closed, stopping synthesis");
                break;
            }
        }
    }

    async fn synthesize(&self, chunk: &SentenceChunk) -> Result<Vec<u8>> {
        let text = chunk.text.trim();
        if text.is_empty() {
            return Err(Error::Malformed("empty sentence".to_string()));
        }
        let chars = text.chars().count();
        if chars > self.config.max_chars {
            return Err(Error::Malformed(format!(
                "sentence of {chars} characters exceeds limit of {}",
                self.config.max_chars
            )));
        }

        let data = tokio::time::timeout(self.config.timeout, self.synthesizer.synthesize(text))
            .await
            .map_err(|_| Error::BackendUnreachable("speech synthesis timed out".to_string()))??;

        if data.is_empty() {
            return Err(Error::Malformed("synthesizer returned no audio".to_string()));
        }
        Ok(data)
    }
}
