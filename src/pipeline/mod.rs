//! Streaming voice pipeline
//!
//! ```text
//! capture ─frames─▶ VAD ─utterances─▶ transcription ─transcripts─▶ dialogue
//!                    │                                    typed ──▶    │
//!                    └── speech start (barge-in) ───────────────────▶  │
//!                                                                      ▼
//!            playback ◀─clips─ synthesis ◀─sentences─ orchestrator tokens
//! ```
//!
//! Every arrow is a bounded queue. Sequence numbers are assigned where
//! utterances and sentences are cut and are never reordered downstream.

mod dialogue;
mod playback;
mod queue;
mod sentence;
mod synthesis;
mod transcription;
mod types;

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use playback::PlaybackSink;
pub use queue::{BoundedQueue, QueueClosed};
pub use sentence::{SentenceSegmenter, TERMINATORS, is_terminator};
pub use synthesis::{DEFAULT_MAX_CHARS, SynthesisConfig, SynthesisWorker};
pub use transcription::{TranscriptionConfig, TranscriptionWorker};
pub use types::{AudioClip, SentenceChunk, TranscriptEvent, Utterance};

use self::dialogue::{Activity, Dialogue, DialogueInputs};
use crate::conversation::ConversationOrchestrator;
use crate::voice::{
    AudioOutput, AudioSource, SpeechRecognizer, SpeechSynthesizer, VadEvent,
    VoiceActivitySegmenter, frame_bytes, vad,
};
use crate::{Error, Result};

/// Builds the audio source on the capture thread
///
/// Device streams are usually not `Send`, so the source is created on the
/// thread that reads from it.
pub type SourceFactory = Box<dyn FnOnce() -> Result<Box<dyn AudioSource>> + Send>;

/// Something observable happened in the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Voice activity began
    SpeechStarted,
    /// Utterance finalized and sent for transcription
    SpeechEnded {
        /// Utterance sequence
        sequence: u64,
        /// Samples in the utterance
        samples: usize,
    },
    /// Utterance transcribed
    Transcript(TranscriptEvent),
    /// Generated fragment
    Token(String),
    /// Sentence queued for synthesis
    Sentence(SentenceChunk),
    /// Full response stored in history
    ResponseComplete(String),
    /// Speaking was cut short by the user
    Interrupted,
    /// Generation or submission failed
    Error(String),
}

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capture frame duration
    pub frame_ms: u32,
    /// Normalized energy above which a frame counts as speech
    pub activation_threshold: f32,
    /// Silence that ends an utterance
    pub silence_ms: u32,
    /// Frames buffered between capture and VAD
    pub frame_capacity: usize,
    /// Utterances waiting for transcription
    pub utterance_capacity: usize,
    /// Transcripts waiting for the dialogue stage
    pub transcript_capacity: usize,
    /// Clips waiting for playback
    pub playback_capacity: usize,
    /// Subscriber lag tolerated on the event channel
    pub event_capacity: usize,
    /// Cut the response short when the user starts speaking
    pub barge_in: bool,
    /// Transcription stage tuning
    pub transcription: TranscriptionConfig,
    /// Synthesis stage tuning
    pub synthesis: SynthesisConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_ms: 250,
            activation_threshold: vad::DEFAULT_ACTIVATION_THRESHOLD,
            silence_ms: vad::DEFAULT_SILENCE_MS,
            frame_capacity: 64,
            utterance_capacity: 8,
            transcript_capacity: 8,
            playback_capacity: 8,
            event_capacity: 256,
            barge_in: true,
            transcription: TranscriptionConfig::default(),
            synthesis: SynthesisConfig::default(),
        }
    }
}

/// Owns every stage from microphone to speaker
pub struct VoicePipeline {
    config: PipelineConfig,
    orchestrator: Arc<ConversationOrchestrator>,
    recognizer: Arc<dyn SpeechRecognizer>,
    sink: Arc<PlaybackSink>,
    synthesis: Arc<SynthesisWorker>,
    events: broadcast::Sender<PipelineEvent>,
    activity: Arc<Activity>,
    typed_tx: mpsc::Sender<String>,
    typed_rx: Mutex<Option<mpsc::Receiver<String>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    capture_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl VoicePipeline {
    /// Assemble a stopped pipeline
    #[must_use]
    pub fn new(
        orchestrator: Arc<ConversationOrchestrator>,
        recognizer: Arc<dyn SpeechRecognizer>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        config: PipelineConfig,
    ) -> Self {
        let sink = Arc::new(PlaybackSink::new(config.playback_capacity));
        let synthesis = Arc::new(SynthesisWorker::new(
            synthesizer,
            Arc::clone(&sink),
            config.synthesis.clone(),
        ));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (typed_tx, typed_rx) = mpsc::channel(config.transcript_capacity.max(1));

        Self {
            config,
            orchestrator,
            recognizer,
            sink,
            synthesis,
            events,
            activity: Arc::new(Activity::default()),
            typed_tx,
            typed_rx: Mutex::new(Some(typed_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            capture_thread: Mutex::new(None),
        }
    }

    /// Receive pipeline events from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Conversation state shared with the dialogue stage
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<ConversationOrchestrator> {
        &self.orchestrator
    }

    /// Start every stage
    ///
    /// Without a source only typed input drives the conversation.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the audio source cannot be opened and
    /// `Config` if the pipeline was already started
    pub async fn start(
        &self,
        output: Box<dyn AudioOutput>,
        source: Option<SourceFactory>,
    ) -> Result<()> {
        let typed_rx = self
            .typed_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Config("pipeline already started".to_string()))?;

        let (utterance_tx, utterance_rx) = mpsc::channel(self.config.utterance_capacity.max(1));
        let (transcript_tx, transcript_rx) = mpsc::channel(self.config.transcript_capacity.max(1));
        let (speech_tx, speech_rx) = mpsc::channel(8);

        if let Some(factory) = source {
            let (frame_tx, frame_rx) = mpsc::channel(self.config.frame_capacity.max(1));
            self.spawn_capture(factory, frame_tx).await?;
            self.track(tokio::spawn(segment_frames(
                VoiceActivitySegmenter::from_durations(
                    self.config.activation_threshold,
                    self.config.silence_ms,
                    self.config.frame_ms,
                ),
                frame_rx,
                utterance_tx,
                speech_tx,
                self.events.clone(),
                self.cancel.clone(),
            )));
        }

        self.sink.start(output);
        self.synthesis.start();

        let worker = TranscriptionWorker::new(
            Arc::clone(&self.recognizer),
            self.config.transcription.clone(),
        );
        self.track(tokio::spawn(worker.run(
            utterance_rx,
            transcript_tx,
            self.cancel.clone(),
        )));

        let (generation_tx, generation_rx) = mpsc::channel(64);
        let dialogue = Dialogue::new(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.synthesis),
            Arc::clone(&self.sink),
            self.events.clone(),
            Arc::clone(&self.activity),
            self.config.barge_in,
            generation_tx,
        );
        let inputs = DialogueInputs {
            transcripts: transcript_rx,
            typed: typed_rx,
            speech_started: speech_rx,
        };
        self.track(tokio::spawn(dialogue.run(
            inputs,
            generation_rx,
            self.cancel.clone(),
        )));

        tracing::info!(
            frame_ms = self.config.frame_ms,
            barge_in = self.config.barge_in,
            "voice pipeline started"
        );
        Ok(())
    }

    /// Feed typed text into the conversation as if it had been spoken
    ///
    /// # Errors
    ///
    /// Returns `Malformed` for blank text and `Config` once the pipeline is stopped
    pub async fn submit_text(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(Error::Malformed("empty user input".to_string()));
        }
        self.activity.typed_sent();
        let sent = self.typed_tx.send(text.to_string()).await;
        if sent.is_err() {
            self.activity.typed_received();
            return Err(Error::Config("pipeline stopped".to_string()));
        }
        Ok(())
    }

    /// Whether submitted input still has a reply to generate, synthesize or play
    ///
    /// True from [`submit_text`](Self::submit_text) until the last clip of
    /// the reply has finished.
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        // Stages are read upstream first; work only ever moves downstream
        // and becomes visible there before it leaves the stage above
        self.activity.is_active() || self.synthesis.is_active() || self.sink.is_active()
    }

    /// Stop every stage and release both audio devices
    ///
    /// Calling it again is harmless.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "pipeline task failed");
                }
            }
        }

        let capture = self
            .capture_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(capture) = capture {
            let joined = tokio::task::spawn_blocking(move || capture.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::error!("capture thread ended abnormally");
            }
        }

        self.synthesis.stop().await;
        self.sink.stop().await;
        tracing::info!("voice pipeline stopped");
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    async fn spawn_capture(
        &self,
        factory: SourceFactory,
        frames: mpsc::Sender<Vec<u8>>,
    ) -> Result<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let frame_len = frame_bytes(self.config.frame_ms);
        let cancel = self.cancel.clone();

        let handle = thread::Builder::new()
            .name("parlance-capture".to_string())
            .spawn(move || capture_frames(factory, frame_len, &frames, &cancel, ready_tx))?;

        let ready = ready_rx
            .await
            .unwrap_or_else(|_| Err(Error::DeviceUnavailable("capture thread exited".to_string())));
        *self
            .capture_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        ready
    }
}

/// Capture thread body: read fixed-size frames until cancelled or the source ends
fn capture_frames(
    factory: SourceFactory,
    frame_len: usize,
    frames: &mpsc::Sender<Vec<u8>>,
    cancel: &CancellationToken,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut source = match factory() {
        Ok(source) => source,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = source.start() {
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));
    tracing::debug!(frame_len, "capture thread running");

    let mut frame = Vec::with_capacity(frame_len);
    while !cancel.is_cancelled() {
        let bytes = source.read(frame_len - frame.len());
        if bytes.is_empty() {
            if !source.is_capturing() {
                break;
            }
            continue;
        }

        frame.extend_from_slice(&bytes);
        if frame.len() >= frame_len {
            let full = std::mem::replace(&mut frame, Vec::with_capacity(frame_len));
            if frames.blocking_send(full).is_err() {
                break;
            }
        }
    }

    source.stop();
    tracing::debug!("capture thread stopped");
}

/// VAD stage: turn frames into utterances and speech-start signals
async fn segment_frames(
    mut segmenter: VoiceActivitySegmenter,
    mut frames: mpsc::Receiver<Vec<u8>>,
    utterances: mpsc::Sender<Utterance>,
    speech_started: mpsc::Sender<()>,
    events: broadcast::Sender<PipelineEvent>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match segmenter.process(&frame) {
            Some(VadEvent::SpeechStart) => {
                tracing::debug!("speech started");
                let _ = events.send(PipelineEvent::SpeechStarted);
                let _ = speech_started.send(()).await;
            }
            Some(VadEvent::SpeechEnd(utterance)) => {
                let sequence = utterance.sequence;
                let samples = utterance.sample_count();
                tracing::debug!(sequence, samples, "utterance finalized");
                let _ = events.send(PipelineEvent::SpeechEnded { sequence, samples });
                if utterances.send(utterance).await.is_err() {
                    break;
                }
            }
            None => {}
        }
    }

    tracing::debug!("voice activity segmentation stopped");
}
