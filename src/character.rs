//! Character cards
//!
//! A character card is a JSON file describing who the assistant plays:
//! its name and description become the system prompt, the reference audio
//! and speed drive the synthesized voice, and `from_model` picks the
//! generation model.

use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

/// Persona loaded from a character card
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Character {
    /// Display name
    pub name: String,
    /// Free-form personality description
    #[serde(default)]
    pub description: Option<String>,
    /// Reference audio the voice is cloned from
    #[serde(default, rename = "ref_audio")]
    pub ref_audio_path: Option<String>,
    /// Language spoken in the reference audio
    #[serde(default, rename = "ref_audio_lang")]
    pub prompt_lang: Option<String>,
    #[serde(default)]
    pub speed_factor: Option<f32>,
    /// Generation model the character was written for
    #[serde(default, rename = "from_model")]
    pub model: Option<String>,
}

impl Character {
    /// Load a character card from a JSON file
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file is missing, not JSON, or has no name
    pub fn load(path: &Path) -> Result<Self> {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if !is_json {
            return Err(Error::Config(format!(
                "unsupported character card format: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read character card {}: {e}", path.display()))
        })?;
        let character = Self::from_json(&content)?;

        tracing::info!(name = %character.name, path = %path.display(), "loaded character card");
        Ok(character)
    }

    /// Parse a character card
    ///
    /// # Errors
    ///
    /// Returns `Config` if the JSON is invalid or the name is blank
    pub fn from_json(content: &str) -> Result<Self> {
        let character: Self = serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("invalid character card: {e}")))?;
        if character.name.trim().is_empty() {
            return Err(Error::Config("character card has no name".to_string()));
        }
        Ok(character)
    }

    /// System prompt introducing the character
    #[must_use]
    pub fn system_prompt(&self) -> String {
        match self.description.as_deref().map(str::trim) {
            Some(description) if !description.is_empty() => {
                format!("You are {}. {description}", self.name.trim())
            }
            _ => format!("You are {}.", self.name.trim()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_card() {
        let character = Character::from_json(
            r#"{
                "name": "Neko",
                "description": "A cheerful cat girl who loves fish.",
                "ref_audio": "voices/neko_hello there.wav",
                "ref_audio_lang": "ja",
                "speed_factor": 1.1,
                "from_model": "qwen2"
            }"#,
        )
        .unwrap();

        assert_eq!(character.name, "Neko");
        assert_eq!(character.ref_audio_path.as_deref(), Some("voices/neko_hello there.wav"));
        assert_eq!(character.prompt_lang.as_deref(), Some("ja"));
        assert_eq!(character.model.as_deref(), Some("qwen2"));
        assert_eq!(
            character.system_prompt(),
            "You are Neko. A cheerful cat girl who loves fish."
        );
    }

    #[test]
    fn test_minimal_card() {
        let character = Character::from_json(r#"{"name": "Orin"}"#).unwrap();
        assert_eq!(character.system_prompt(), "You are Orin.");
        assert!(character.speed_factor.is_none());
    }

    #[test]
    fn test_blank_name_rejected() {
        assert!(matches!(
            Character::from_json(r#"{"name": "  "}"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_rejects_non_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card.png");
        std::fs::write(&path, b"\x89PNG").unwrap();
        assert!(Character::load(&path).is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neko.json");
        std::fs::write(&path, r#"{"name": "Neko"}"#).unwrap();
        assert_eq!(Character::load(&path).unwrap().name, "Neko");
    }
}
