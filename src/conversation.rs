//! Conversation orchestration
//!
//! Owns the dialogue history, assembles prompts and runs one streaming
//! generation at a time. Results are delivered as [`GenerationEvent`]s over
//! a channel: any number of tokens followed by exactly one terminal event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::llm::{GenerateRequest, TextGenerator};
use crate::memory::{MemoryHit, MemoryStore};
use crate::{Error, Result};

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Person speaking or typing
    User,
    /// Generated reply
    Assistant,
}

impl Role {
    /// Label used in prompts
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

/// One entry of the dialogue history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationTurn {
    /// Author of the turn
    pub role: Role,
    /// Full text
    pub content: String,
    /// When the turn was appended
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Progress of one generation request
#[derive(Debug)]
pub enum GenerationEvent {
    /// Next fragment of the response, in order
    Token(String),
    /// Stream finished; carries the full response now stored in history
    Complete(String),
    /// Stream failed; no assistant turn was stored
    Error(Error),
}

impl GenerationEvent {
    /// Whether this is the last event of the request
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_))
    }
}

/// Construction parameters for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model identifier sent with every request
    pub model: String,
    /// Character description placed before the transcript
    pub system_prompt: Option<String>,
    /// Passages requested from memory per prompt
    pub memory_top_k: usize,
    /// Responses must be longer than this (in characters) to be remembered
    pub memory_min_chars: usize,
    /// Capacity of the event channel returned by `submit`
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: "llama3".to_string(),
            system_prompt: None,
            memory_top_k: 4,
            memory_min_chars: 50,
            event_capacity: 64,
        }
    }
}

/// Clears the in-flight flag when the generation task ends, however it ends
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Dialogue state plus the single in-flight generation
pub struct ConversationOrchestrator {
    generator: Arc<dyn TextGenerator>,
    memory: Option<Arc<dyn MemoryStore>>,
    config: OrchestratorConfig,
    history: Arc<Mutex<Vec<ConversationTurn>>>,
    busy: Arc<AtomicBool>,
}

impl ConversationOrchestrator {
    /// Create an orchestrator
    ///
    /// Passing a memory store enables memory augmentation.
    #[must_use]
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        memory: Option<Arc<dyn MemoryStore>>,
        config: OrchestratorConfig,
    ) -> Self {
        tracing::debug!(
            model = %config.model,
            memory = memory.is_some(),
            "conversation orchestrator initialized"
        );

        Self {
            generator,
            memory,
            config,
            history: Arc::new(Mutex::new(Vec::new())),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Submit user text and start a streaming generation
    ///
    /// Must be called from within a tokio runtime. The returned receiver
    /// yields tokens and then exactly one `Complete` or `Error`.
    ///
    /// # Errors
    ///
    /// Returns `ConversationBusy` while another request is in flight and
    /// `Malformed` for blank input
    pub fn submit(&self, user_text: &str) -> Result<mpsc::Receiver<GenerationEvent>> {
        let user_text = user_text.trim();
        if user_text.is_empty() {
            return Err(Error::Malformed("empty user input".to_string()));
        }

        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("submit rejected, generation in flight");
            return Err(Error::ConversationBusy);
        }
        let guard = BusyGuard(Arc::clone(&self.busy));

        let snapshot = {
            let mut history = lock(&self.history);
            history.push(ConversationTurn::new(Role::User, user_text));
            history.clone()
        };
        tracing::info!(turns = snapshot.len(), "user turn submitted");

        let (tx, rx) = mpsc::channel(self.config.event_capacity.max(1));
        let task = GenerationTask {
            generator: Arc::clone(&self.generator),
            memory: self.memory.clone(),
            config: self.config.clone(),
            history: Arc::clone(&self.history),
            user_text: user_text.to_string(),
            snapshot,
        };
        tokio::spawn(task.run(tx, guard));

        Ok(rx)
    }

    /// Copy of the dialogue history
    #[must_use]
    pub fn history(&self) -> Vec<ConversationTurn> {
        lock(&self.history).clone()
    }

    /// Forget every turn
    ///
    /// # Errors
    ///
    /// Returns `ConversationBusy` while a request is in flight
    pub fn reset_history(&self) -> Result<()> {
        // Holding the flag keeps a concurrent submit from landing mid-reset
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ConversationBusy);
        }
        let _guard = BusyGuard(Arc::clone(&self.busy));
        lock(&self.history).clear();
        tracing::info!("conversation history reset");
        Ok(())
    }

    /// Whether a generation request is in flight
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

fn lock(history: &Mutex<Vec<ConversationTurn>>) -> MutexGuard<'_, Vec<ConversationTurn>> {
    history.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything a spawned generation needs
struct GenerationTask {
    generator: Arc<dyn TextGenerator>,
    memory: Option<Arc<dyn MemoryStore>>,
    config: OrchestratorConfig,
    history: Arc<Mutex<Vec<ConversationTurn>>>,
    user_text: String,
    snapshot: Vec<ConversationTurn>,
}

impl GenerationTask {
    async fn run(self, tx: mpsc::Sender<GenerationEvent>, guard: BusyGuard) {
        let context = self.retrieve_context().await;
        let request = GenerateRequest {
            model: self.config.model.clone(),
            prompt: build_prompt(self.config.system_prompt.as_deref(), &context, &self.snapshot),
            stream: true,
        };

        match self.stream_response(&request, &tx).await {
            Ok(response) => {
                lock(&self.history).push(ConversationTurn::new(Role::Assistant, response.clone()));
                tracing::info!(chars = response.chars().count(), "generation complete");
                self.remember(&response).await;

                drop(guard);
                let _ = tx.send(GenerationEvent::Complete(response)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "generation failed");
                drop(guard);
                let _ = tx.send(GenerationEvent::Error(e)).await;
            }
        }
    }

    async fn retrieve_context(&self) -> Vec<MemoryHit> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        match memory.query(&self.user_text, self.config.memory_top_k).await {
            Ok(hits) => {
                tracing::debug!(hits = hits.len(), "retrieved memory context");
                hits
            }
            Err(e) => {
                tracing::warn!(error = %e, "memory query failed, continuing without context");
                Vec::new()
            }
        }
    }

    async fn remember(&self, response: &str) {
        let Some(memory) = &self.memory else {
            return;
        };
        if response.chars().count() <= self.config.memory_min_chars {
            return;
        }
        if let Err(e) = memory.insert_text(response).await {
            tracing::warn!(error = %e, "failed to store response in memory");
        }
    }

    /// Relay tokens and return the accumulated response once `done` arrives
    async fn stream_response(
        &self,
        request: &GenerateRequest,
        tx: &mpsc::Sender<GenerationEvent>,
    ) -> Result<String> {
        let mut stream = self.generator.generate(request).await?;
        let mut response = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !chunk.text.is_empty() {
                response.push_str(&chunk.text);
                // A dropped receiver only stops delivery; history still gets the full reply
                let _ = tx.send(GenerationEvent::Token(chunk.text)).await;
            }
            if chunk.done {
                return Ok(response);
            }
        }

        Err(Error::BackendUnreachable(
            "generation stream ended before completion".to_string(),
        ))
    }
}

/// Assemble the prompt from the character description, retrieved context and history
#[must_use]
pub fn build_prompt(
    system_prompt: Option<&str>,
    context: &[MemoryHit],
    history: &[ConversationTurn],
) -> String {
    let mut prompt = String::new();

    if let Some(system) = system_prompt.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str(system);
        prompt.push_str("\n\n");
    }

    if !context.is_empty() {
        prompt.push_str("Relevant context:\n");
        for hit in context {
            prompt.push_str("- ");
            prompt.push_str(hit.content.trim());
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    for turn in history {
        prompt.push_str(turn.role.label());
        prompt.push_str(": ");
        prompt.push_str(&turn.content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");

    prompt
}
