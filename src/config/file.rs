//! TOML configuration file loading
//!
//! Supports `~/.config/parlance/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ParlanceConfigFile {
    /// Path to a character card (JSON)
    #[serde(default)]
    pub character: Option<String>,

    /// Audio capture settings
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Voice activity detection
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Speech recognition backend
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Text generation backend
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Speech synthesis backend
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Conversation memory
    #[serde(default)]
    pub memory: MemoryFileConfig,

    /// Queue sizes and barge-in
    #[serde(default)]
    pub pipeline: PipelineFileConfig,
}

/// Audio capture settings
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Frame duration in milliseconds
    pub frame_ms: Option<u32>,
}

/// Voice activity detection settings
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    /// Normalized energy threshold (0.0 - 1.0)
    pub activation_threshold: Option<f32>,
    /// Silence that ends an utterance, in milliseconds
    pub silence_ms: Option<u32>,
}

/// Speech recognition settings
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_in_flight: Option<usize>,
    pub head_of_line_wait_secs: Option<u64>,
}

/// Text generation settings
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub base_url: Option<String>,
    /// Model name (e.g. "llama3")
    pub model: Option<String>,
    /// Character description placed at the top of every prompt
    pub system_prompt: Option<String>,
    pub connect_timeout_secs: Option<u64>,
}

/// Speech synthesis settings
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub base_url: Option<String>,
    /// Reference audio for voice cloning
    pub ref_audio_path: Option<String>,
    /// Language of the reference audio
    pub prompt_lang: Option<String>,
    pub text_lang: Option<String>,
    pub speed_factor: Option<f32>,
    pub timeout_secs: Option<u64>,
    /// Longest sentence sent to the backend
    pub max_chars: Option<usize>,
}

/// Memory settings
#[derive(Debug, Default, Deserialize)]
pub struct MemoryFileConfig {
    pub enabled: Option<bool>,
    pub top_k: Option<usize>,
    /// Responses must be longer than this to be stored
    pub min_store_chars: Option<usize>,
}

/// Pipeline settings
#[derive(Debug, Default, Deserialize)]
pub struct PipelineFileConfig {
    pub utterance_capacity: Option<usize>,
    pub sentence_capacity: Option<usize>,
    pub playback_capacity: Option<usize>,
    pub barge_in: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ParlanceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ParlanceConfigFile {
    config_file_path().map_or_else(ParlanceConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Missing, unreadable or invalid files yield the defaults.
pub fn load_config_file_from(path: &Path) -> ParlanceConfigFile {
    if !path.exists() {
        return ParlanceConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ParlanceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ParlanceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/parlance/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parlance").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_parses() {
        let file: ParlanceConfigFile = toml::from_str(
            r#"
            [llm]
            model = "qwen2"

            [vad]
            silence_ms = 800
            "#,
        )
        .unwrap();

        assert_eq!(file.llm.model.as_deref(), Some("qwen2"));
        assert_eq!(file.vad.silence_ms, Some(800));
        assert!(file.stt.base_url.is_none());
        assert!(file.character.is_none());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = load_config_file_from(&dir.path().join("absent.toml"));
        assert!(file.llm.model.is_none());
    }

    #[test]
    fn test_invalid_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[llm\nmodel = ").unwrap();

        let file = load_config_file_from(&path);
        assert!(file.llm.model.is_none());
    }
}
