//! Parlance - spoken-dialogue pipeline
//!
//! This library provides the building blocks of a voice conversation loop:
//! - Audio capture, energy-based voice activity segmentation and playback
//! - Speech recognition and synthesis backends
//! - Conversation orchestration over a streaming text generator
//! - Sentence segmentation, ordered transcription and single-flight synthesis
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Devices                         │
//! │        Microphone (cpal)   │   Speakers (cpal)       │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                   VoicePipeline                      │
//! │   VAD  │  Transcription  │  Dialogue  │  Synthesis  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                     Backends                         │
//! │    Whisper (STT)  │  Ollama (LLM)  │  SoVITS (TTS)   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod character;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod voice;

pub use character::Character;
pub use config::Config;
pub use conversation::{
    ConversationOrchestrator, ConversationTurn, GenerationEvent, OrchestratorConfig, Role,
};
pub use error::{Error, Result};
pub use llm::{GenerateChunk, GenerateRequest, OllamaClient, TextGenerator, TokenStream};
pub use memory::{KeywordMemory, MemoryHit, MemoryStore};
pub use pipeline::{PipelineConfig, PipelineEvent, VoicePipeline};
