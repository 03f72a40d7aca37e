//! Configuration management for parlance
//!
//! Every value resolves as env > TOML file > character card > default.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::character::Character;
use crate::conversation::OrchestratorConfig;
use crate::pipeline::{PipelineConfig, SynthesisConfig, TranscriptionConfig};
use crate::voice::{VoiceParams, vad};
use crate::{Error, Result};

use self::file::ParlanceConfigFile;

/// Default local Whisper-compatible server
pub const DEFAULT_STT_URL: &str = "http://127.0.0.1:8000";
/// Default Ollama server
pub const DEFAULT_LLM_URL: &str = "http://localhost:11434";
/// Default GPT-SoVITS server
pub const DEFAULT_TTS_URL: &str = "http://127.0.0.1:9880";

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Character card the persona came from, if any
    pub character: Option<Character>,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub memory: MemoryConfig,
    pub pipeline: QueueConfig,
}

/// Audio capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Capture frame duration in milliseconds
    pub frame_ms: u32,
}

/// Voice activity detection configuration
#[derive(Debug, Clone)]
pub struct VadConfig {
    pub activation_threshold: f32,
    pub silence_ms: u32,
}

/// Speech recognition configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub base_url: String,
    pub model: String,
    /// Bearer key for hosted endpoints
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// Utterances transcribed concurrently
    pub max_in_flight: usize,
    /// Bounded wait before a stalled utterance is skipped
    pub head_of_line_wait: Duration,
}

/// Text generation configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub connect_timeout: Duration,
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub base_url: String,
    pub voice: VoiceParams,
    pub timeout: Duration,
    pub max_chars: usize,
}

/// Conversation memory configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub top_k: usize,
    pub min_store_chars: usize,
}

/// Queue sizing and barge-in
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub utterance_capacity: usize,
    pub sentence_capacity: usize,
    pub playback_capacity: usize,
    pub barge_in: bool,
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns `Config` if a configured character card cannot be loaded
    pub fn load() -> Result<Self> {
        Self::load_with_options(None)
    }

    /// Load configuration with an explicit character card path
    ///
    /// # Errors
    ///
    /// Returns `Config` if the character card cannot be loaded
    pub fn load_with_options(character: Option<String>) -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| {
            if key == "PARLANCE_CHARACTER" && character.is_some() {
                return character.clone();
            }
            std::env::var(key).ok()
        })
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns `Config` if a configured character card cannot be loaded
    pub fn from_sources(
        fc: ParlanceConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env_parse = |key: &str| env(key).and_then(|v| v.trim().parse::<f32>().ok());

        let character = env("PARLANCE_CHARACTER")
            .or(fc.character)
            .map(|path| Character::load(&PathBuf::from(path)))
            .transpose()?;
        let card = character.as_ref();

        let audio = AudioConfig {
            frame_ms: fc.audio.frame_ms.unwrap_or(250),
        };
        if audio.frame_ms == 0 {
            return Err(Error::Config("audio.frame_ms must be positive".to_string()));
        }

        let vad = VadConfig {
            activation_threshold: fc
                .vad
                .activation_threshold
                .unwrap_or(vad::DEFAULT_ACTIVATION_THRESHOLD),
            silence_ms: fc.vad.silence_ms.unwrap_or(vad::DEFAULT_SILENCE_MS),
        };

        let stt_timeout = Duration::from_secs(fc.stt.timeout_secs.unwrap_or(30));
        let stt = SttConfig {
            base_url: env("PARLANCE_STT_URL")
                .or(fc.stt.base_url)
                .unwrap_or_else(|| DEFAULT_STT_URL.to_string()),
            model: env("PARLANCE_STT_MODEL")
                .or(fc.stt.model)
                .unwrap_or_else(|| "Systran/faster-whisper-small".to_string()),
            api_key: env("OPENAI_API_KEY").or(fc.stt.api_key),
            timeout: stt_timeout,
            max_in_flight: fc.stt.max_in_flight.unwrap_or(2).max(1),
            head_of_line_wait: fc
                .stt
                .head_of_line_wait_secs
                .map_or(stt_timeout + Duration::from_secs(5), Duration::from_secs),
        };

        let llm = LlmConfig {
            base_url: env("PARLANCE_LLM_URL")
                .or(fc.llm.base_url)
                .unwrap_or_else(|| DEFAULT_LLM_URL.to_string()),
            model: env("PARLANCE_LLM_MODEL")
                .or(fc.llm.model)
                .or_else(|| card.and_then(|c| c.model.clone()))
                .unwrap_or_else(|| "llama3".to_string()),
            system_prompt: fc
                .llm
                .system_prompt
                .or_else(|| card.map(Character::system_prompt)),
            connect_timeout: Duration::from_secs(fc.llm.connect_timeout_secs.unwrap_or(10)),
        };

        let voice = VoiceParams {
            ref_audio_path: env("PARLANCE_REF_AUDIO")
                .or(fc.tts.ref_audio_path)
                .or_else(|| card.and_then(|c| c.ref_audio_path.clone())),
            prompt_lang: env("PARLANCE_PROMPT_LANG")
                .or(fc.tts.prompt_lang)
                .or_else(|| card.and_then(|c| c.prompt_lang.clone())),
            text_lang: fc.tts.text_lang.unwrap_or_else(|| "auto".to_string()),
            speed_factor: env_parse("PARLANCE_TTS_SPEED")
                .or(fc.tts.speed_factor)
                .or_else(|| card.and_then(|c| c.speed_factor))
                .filter(|s| *s > 0.0)
                .unwrap_or(1.0),
        };
        let tts = TtsConfig {
            base_url: env("PARLANCE_TTS_URL")
                .or(fc.tts.base_url)
                .unwrap_or_else(|| DEFAULT_TTS_URL.to_string()),
            voice,
            timeout: Duration::from_secs(fc.tts.timeout_secs.unwrap_or(60)),
            max_chars: fc
                .tts
                .max_chars
                .unwrap_or(crate::pipeline::DEFAULT_MAX_CHARS),
        };

        let memory = MemoryConfig {
            enabled: env("PARLANCE_MEMORY")
                .map(|v| parse_bool(&v))
                .or(fc.memory.enabled)
                .unwrap_or(false),
            top_k: fc.memory.top_k.unwrap_or(4),
            min_store_chars: fc.memory.min_store_chars.unwrap_or(50),
        };

        let pipeline = QueueConfig {
            utterance_capacity: fc.pipeline.utterance_capacity.unwrap_or(8),
            sentence_capacity: fc.pipeline.sentence_capacity.unwrap_or(16),
            playback_capacity: fc.pipeline.playback_capacity.unwrap_or(8),
            barge_in: fc.pipeline.barge_in.unwrap_or(true),
        };

        Ok(Self {
            character,
            audio,
            vad,
            stt,
            llm,
            tts,
            memory,
            pipeline,
        })
    }

    /// Orchestrator parameters
    #[must_use]
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            model: self.llm.model.clone(),
            system_prompt: self.llm.system_prompt.clone(),
            memory_top_k: self.memory.top_k,
            memory_min_chars: self.memory.min_store_chars,
            ..OrchestratorConfig::default()
        }
    }

    /// Synthesis stage parameters
    #[must_use]
    pub fn synthesis(&self) -> SynthesisConfig {
        SynthesisConfig {
            queue_capacity: self.pipeline.sentence_capacity,
            max_chars: self.tts.max_chars,
            timeout: self.tts.timeout,
        }
    }

    /// Pipeline parameters
    #[must_use]
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            frame_ms: self.audio.frame_ms,
            activation_threshold: self.vad.activation_threshold,
            silence_ms: self.vad.silence_ms,
            utterance_capacity: self.pipeline.utterance_capacity,
            playback_capacity: self.pipeline.playback_capacity,
            barge_in: self.pipeline.barge_in,
            transcription: TranscriptionConfig {
                max_in_flight: self.stt.max_in_flight,
                timeout: self.stt.timeout,
                head_of_line_wait: self.stt.head_of_line_wait,
            },
            synthesis: self.synthesis(),
            ..PipelineConfig::default()
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(ParlanceConfigFile::default(), env_from(&[])).unwrap();

        assert_eq!(config.stt.base_url, DEFAULT_STT_URL);
        assert_eq!(config.llm.base_url, DEFAULT_LLM_URL);
        assert_eq!(config.tts.base_url, DEFAULT_TTS_URL);
        assert_eq!(config.llm.model, "llama3");
        assert_eq!(config.audio.frame_ms, 250);
        assert_eq!(config.tts.max_chars, 1024);
        assert_eq!(config.memory.min_store_chars, 50);
        assert!(!config.memory.enabled);
        assert!(config.pipeline.barge_in);
        assert!(config.stt.head_of_line_wait > config.stt.timeout);
    }

    #[test]
    fn test_env_overrides_file() {
        let fc: ParlanceConfigFile = toml::from_str(
            r#"
            [llm]
            model = "from-file"
            base_url = "http://file:11434"
            "#,
        )
        .unwrap();
        let config = Config::from_sources(
            fc,
            env_from(&[
                ("PARLANCE_LLM_MODEL", "from-env"),
                ("PARLANCE_TTS_SPEED", "1.25"),
                ("PARLANCE_MEMORY", "yes"),
            ]),
        )
        .unwrap();

        assert_eq!(config.llm.model, "from-env");
        assert_eq!(config.llm.base_url, "http://file:11434");
        assert!((config.tts.voice.speed_factor - 1.25).abs() < f32::EPSILON);
        assert!(config.memory.enabled);
    }

    #[test]
    fn test_character_card_fills_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neko.json");
        std::fs::write(
            &path,
            r#"{"name": "Neko", "ref_audio": "ref/hello.wav", "ref_audio_lang": "ja", "from_model": "qwen2"}"#,
        )
        .unwrap();

        let fc: ParlanceConfigFile = toml::from_str(&format!(
            "character = {:?}\n[tts]\nprompt_lang = \"zh\"\n",
            path.display().to_string()
        ))
        .unwrap();
        let config = Config::from_sources(fc, env_from(&[])).unwrap();

        assert_eq!(config.llm.model, "qwen2");
        assert_eq!(config.llm.system_prompt.as_deref(), Some("You are Neko."));
        assert_eq!(config.tts.voice.ref_audio_path.as_deref(), Some("ref/hello.wav"));
        assert_eq!(config.tts.voice.prompt_lang.as_deref(), Some("zh"));
    }

    #[test]
    fn test_missing_character_card_is_error() {
        let result = Config::from_sources(
            ParlanceConfigFile::default(),
            env_from(&[("PARLANCE_CHARACTER", "/nonexistent/card.json")]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_pipeline_parameters() {
        let config = Config::from_sources(ParlanceConfigFile::default(), env_from(&[])).unwrap();
        let pipeline = config.pipeline();

        assert_eq!(pipeline.frame_ms, 250);
        assert_eq!(pipeline.synthesis.max_chars, 1024);
        assert_eq!(pipeline.transcription.max_in_flight, 2);
    }
}
