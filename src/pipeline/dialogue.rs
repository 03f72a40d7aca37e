//! Dialogue stage
//!
//! Bridges transcripts and typed input to the orchestrator, cuts the
//! streamed reply into sentences for synthesis and handles barge-in.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::PipelineEvent;
use super::playback::PlaybackSink;
use super::sentence::SentenceSegmenter;
use super::synthesis::SynthesisWorker;
use super::types::{SentenceChunk, TranscriptEvent};
use crate::Error;
use crate::conversation::{ConversationOrchestrator, GenerationEvent};

/// Generation event tagged with the request it belongs to
type TaggedGeneration = (u64, GenerationEvent);

/// Inputs the dialogue loop listens on
pub(crate) struct DialogueInputs {
    pub transcripts: mpsc::Receiver<TranscriptEvent>,
    pub typed: mpsc::Receiver<String>,
    pub speech_started: mpsc::Receiver<()>,
}

/// Dialogue state visible outside the loop
#[derive(Debug, Default)]
pub(crate) struct Activity {
    /// Typed inputs sent but not yet picked up by the loop
    typed: AtomicUsize,
    /// A reply is being spoken or input is held for the next one
    responding: AtomicBool,
}

impl Activity {
    pub(crate) fn typed_sent(&self) {
        self.typed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn typed_received(&self) {
        self.typed.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.typed.load(Ordering::Acquire) > 0 || self.responding.load(Ordering::Acquire)
    }
}

/// Speech-start signal that stays pending once the VAD stage is gone
struct SpeechSignal {
    rx: mpsc::Receiver<()>,
    open: bool,
}

impl SpeechSignal {
    async fn started(&mut self) {
        if self.open {
            if self.rx.recv().await.is_some() {
                return;
            }
            self.open = false;
        }
        std::future::pending::<()>().await;
    }
}

pub(crate) struct Dialogue {
    orchestrator: Arc<ConversationOrchestrator>,
    synthesis: Arc<SynthesisWorker>,
    sink: Arc<PlaybackSink>,
    events: broadcast::Sender<PipelineEvent>,
    activity: Arc<Activity>,
    barge_in: bool,
    segmenter: SentenceSegmenter,
    generation_tx: mpsc::Sender<TaggedGeneration>,
    request_id: u64,
    responding: bool,
    suppressed: bool,
    waiting: VecDeque<String>,
}

impl Dialogue {
    pub(crate) fn new(
        orchestrator: Arc<ConversationOrchestrator>,
        synthesis: Arc<SynthesisWorker>,
        sink: Arc<PlaybackSink>,
        events: broadcast::Sender<PipelineEvent>,
        activity: Arc<Activity>,
        barge_in: bool,
        generation_tx: mpsc::Sender<TaggedGeneration>,
    ) -> Self {
        Self {
            orchestrator,
            synthesis,
            sink,
            events,
            activity,
            barge_in,
            segmenter: SentenceSegmenter::new(),
            generation_tx,
            request_id: 0,
            responding: false,
            suppressed: false,
            waiting: VecDeque::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut inputs: DialogueInputs,
        mut generations: mpsc::Receiver<TaggedGeneration>,
        cancel: CancellationToken,
    ) {
        let mut transcripts_open = true;
        let mut typed_open = true;
        let mut speech = SpeechSignal {
            rx: inputs.speech_started,
            open: true,
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,

                transcript = inputs.transcripts.recv(), if transcripts_open => match transcript {
                    Some(transcript) => {
                        self.publish(PipelineEvent::Transcript(transcript.clone()));
                        self.handle_user_text(transcript.text);
                    }
                    None => transcripts_open = false,
                },

                text = inputs.typed.recv(), if typed_open => match text {
                    Some(text) => {
                        self.handle_user_text(text);
                        self.sync_activity();
                        self.activity.typed_received();
                    }
                    None => typed_open = false,
                },

                () = speech.started() => self.handle_speech_started(),

                Some((id, event)) = generations.recv() => {
                    self.handle_generation(id, event, &mut speech, &cancel).await;
                }
            }
            self.sync_activity();
        }

        tracing::debug!("dialogue loop stopped");
    }

    fn sync_activity(&self) {
        let responding = (self.responding && !self.suppressed) || !self.waiting.is_empty();
        self.activity.responding.store(responding, Ordering::Release);
    }

    fn publish(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn handle_user_text(&mut self, text: String) {
        let text = text.trim();
        if text.is_empty() {
            tracing::debug!("ignoring empty user input");
            return;
        }

        if self.responding {
            tracing::debug!(waiting = self.waiting.len() + 1, "response in progress, holding input");
            self.waiting.push_back(text.to_string());
            return;
        }

        self.submit(text);
    }

    fn submit(&mut self, text: &str) {
        match self.orchestrator.submit(text) {
            Ok(mut rx) => {
                self.request_id += 1;
                self.responding = true;
                self.suppressed = false;
                self.segmenter.discard();

                let id = self.request_id;
                let tx = self.generation_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        if tx.send((id, event)).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Err(Error::ConversationBusy) => {
                tracing::debug!("orchestrator busy, holding input");
                self.waiting.push_back(text.to_string());
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not submit user input");
                self.publish(PipelineEvent::Error(e.to_string()));
            }
        }
    }

    fn is_speaking(&self) -> bool {
        (self.responding && !self.suppressed) || self.synthesis.is_active() || self.sink.is_active()
    }

    fn handle_speech_started(&mut self) {
        if !self.barge_in || !self.is_speaking() {
            return;
        }

        let sentences = self.synthesis.clear();
        let clips = self.sink.clear();
        if self.responding {
            self.suppressed = true;
            self.segmenter.discard();
        }
        tracing::info!(sentences, clips, "user barged in, response interrupted");
        self.publish(PipelineEvent::Interrupted);
    }

    async fn handle_generation(
        &mut self,
        id: u64,
        event: GenerationEvent,
        speech: &mut SpeechSignal,
        cancel: &CancellationToken,
    ) {
        if id != self.request_id {
            return;
        }

        match event {
            GenerationEvent::Token(token) => {
                self.publish(PipelineEvent::Token(token.clone()));
                if self.suppressed {
                    return;
                }
                for chunk in self.segmenter.feed(&token) {
                    self.speak(chunk, speech, cancel).await;
                    if self.suppressed {
                        break;
                    }
                }
            }
            GenerationEvent::Complete(response) => {
                if self.suppressed {
                    self.segmenter.discard();
                } else if let Some(chunk) = self.segmenter.finish() {
                    self.speak(chunk, speech, cancel).await;
                }
                self.publish(PipelineEvent::ResponseComplete(response));
                self.finish_response();
            }
            GenerationEvent::Error(e) => {
                self.segmenter.discard();
                self.publish(PipelineEvent::Error(e.to_string()));
                self.finish_response();
            }
        }
    }

    /// Hand a sentence to synthesis
    ///
    /// Waiting for queue space must not hold off barge-in, so the hand-off
    /// races the speech-start signal and gives up once the reply is cut.
    async fn speak(
        &mut self,
        chunk: SentenceChunk,
        speech: &mut SpeechSignal,
        cancel: &CancellationToken,
    ) {
        tracing::debug!(sequence = chunk.sequence, text = %chunk.text, "sentence ready");
        self.publish(PipelineEvent::Sentence(chunk.clone()));

        let synthesis = Arc::clone(&self.synthesis);
        let submit = synthesis.submit(chunk);
        tokio::pin!(submit);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => return,

                () = speech.started() => {
                    self.handle_speech_started();
                    if self.suppressed {
                        tracing::debug!("sentence abandoned after barge-in");
                        return;
                    }
                }

                submitted = &mut submit => {
                    if submitted.is_err() {
                        tracing::debug!("synthesis stopped, sentence not spoken");
                    }
                    return;
                }
            }
        }
    }

    fn finish_response(&mut self) {
        self.responding = false;
        self.suppressed = false;
        if let Some(next) = self.waiting.pop_front() {
            self.submit(&next);
        }
    }
}
