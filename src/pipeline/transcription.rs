//! Transcription stage
//!
//! Utterances are transcribed concurrently but delivered strictly in
//! sequence order. A completed result waits in the reorder buffer until
//! every earlier utterance has either been delivered or dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::types::{TranscriptEvent, Utterance};
use crate::voice::SpeechRecognizer;
use crate::{Error, Result};

/// Tuning for the transcription stage
#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    /// Utterances transcribed at the same time
    pub max_in_flight: usize,
    /// Limit for a single recognizer call
    pub timeout: Duration,
    /// How long the oldest pending utterance may hold back later results
    pub head_of_line_wait: Duration,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 2,
            timeout: Duration::from_secs(30),
            head_of_line_wait: Duration::from_secs(35),
        }
    }
}

/// Pending and completed sequences awaiting in-order release
#[derive(Debug, Default)]
struct ReorderBuffer {
    /// Sequence -> time the call started
    in_flight: BTreeMap<u64, Instant>,
    /// Sequence -> text, or `None` when the call failed
    completed: BTreeMap<u64, Option<String>>,
}

impl ReorderBuffer {
    fn begin(&mut self, sequence: u64, now: Instant) {
        self.in_flight.insert(sequence, now);
    }

    /// Record a result; results for skipped sequences are ignored
    fn complete(&mut self, sequence: u64, text: Option<String>) {
        if self.in_flight.remove(&sequence).is_some() {
            self.completed.insert(sequence, text);
        }
    }

    fn skip(&mut self, sequence: u64) {
        self.in_flight.remove(&sequence);
    }

    /// Release every completed result no longer blocked by an earlier sequence
    fn drain_ready(&mut self) -> Vec<TranscriptEvent> {
        let mut ready = Vec::new();
        loop {
            let Some((&done, _)) = self.completed.first_key_value() else {
                break;
            };
            if self.in_flight.keys().next().is_some_and(|&pending| pending < done) {
                break;
            }
            if let Some(Some(text)) = self.completed.remove(&done) {
                ready.push(TranscriptEvent {
                    sequence: done,
                    text,
                });
            }
        }
        ready
    }

    /// Oldest in-flight sequence if it is holding back a completed result
    fn blocking_head(&self) -> Option<(u64, Instant)> {
        let (&head, &started) = self.in_flight.first_key_value()?;
        self.completed
            .keys()
            .next()
            .is_some_and(|&done| done > head)
            .then_some((head, started))
    }

    fn is_empty(&self) -> bool {
        self.in_flight.is_empty() && self.completed.is_empty()
    }
}

/// Consumes utterances, emits ordered transcripts
pub struct TranscriptionWorker {
    recognizer: Arc<dyn SpeechRecognizer>,
    config: TranscriptionConfig,
}

impl TranscriptionWorker {
    /// Create a worker around a recognizer
    #[must_use]
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>, config: TranscriptionConfig) -> Self {
        Self { recognizer, config }
    }

    /// Run until the input closes (after draining) or `cancel` fires
    ///
    /// Failed or timed-out utterances are logged and dropped.
    pub async fn run(
        self,
        mut input: mpsc::Receiver<Utterance>,
        output: mpsc::Sender<TranscriptEvent>,
        cancel: CancellationToken,
    ) {
        let max_in_flight = self.config.max_in_flight.max(1);
        let mut tasks: JoinSet<(u64, Result<String>)> = JoinSet::new();
        let mut task_sequences: HashMap<Id, u64> = HashMap::new();
        let mut aborts: HashMap<u64, AbortHandle> = HashMap::new();
        let mut buffer = ReorderBuffer::default();
        let mut input_open = true;

        tracing::debug!(max_in_flight, "transcription worker started");

        loop {
            if !input_open && tasks.is_empty() && buffer.is_empty() {
                break;
            }

            let head = buffer.blocking_head();
            let head_deadline = head.map(|(_, started)| started + self.config.head_of_line_wait);

            tokio::select! {
                () = cancel.cancelled() => break,

                next = input.recv(), if input_open && tasks.len() < max_in_flight => {
                    let Some(utterance) = next else {
                        input_open = false;
                        continue;
                    };
                    let sequence = utterance.sequence;
                    tracing::debug!(sequence, samples = utterance.sample_count(), "transcribing utterance");

                    buffer.begin(sequence, Instant::now());
                    let recognizer = Arc::clone(&self.recognizer);
                    let timeout = self.config.timeout;
                    let handle = tasks.spawn(async move {
                        let result = tokio::time::timeout(timeout, recognizer.transcribe(&utterance.audio))
                            .await
                            .unwrap_or_else(|_| {
                                Err(Error::BackendUnreachable("transcription timed out".to_string()))
                            });
                        (sequence, result)
                    });
                    task_sequences.insert(handle.id(), sequence);
                    aborts.insert(sequence, handle);
                }

                Some(joined) = tasks.join_next_with_id() => {
                    match joined {
                        Ok((id, (sequence, result))) => {
                            task_sequences.remove(&id);
                            aborts.remove(&sequence);
                            match result {
                                Ok(text) => {
                                    tracing::info!(sequence, text = %text, "utterance transcribed");
                                    buffer.complete(sequence, Some(text));
                                }
                                Err(e) => {
                                    tracing::warn!(sequence, error = %e, "transcription failed, dropping utterance");
                                    buffer.complete(sequence, None);
                                }
                            }
                        }
                        Err(e) => {
                            if let Some(sequence) = task_sequences.remove(&e.id()) {
                                aborts.remove(&sequence);
                                if !e.is_cancelled() {
                                    tracing::error!(sequence, error = %e, "transcription task panicked");
                                }
                                buffer.complete(sequence, None);
                            }
                        }
                    }
                }

                () = sleep_until(head_deadline), if head_deadline.is_some() => {
                    if let Some((sequence, _)) = head {
                        tracing::warn!(sequence, "transcription stalled, skipping utterance");
                        buffer.skip(sequence);
                        if let Some(handle) = aborts.remove(&sequence) {
                            handle.abort();
                        }
                    }
                }
            }

            for event in buffer.drain_ready() {
                if output.send(event).await.is_err() {
                    tracing::debug!("transcript receiver gone, stopping transcription worker");
                    return;
                }
            }
        }

        tasks.abort_all();
        tracing::debug!("transcription worker stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
