//! Conversion configuration, loaded from `config.yml` the way the teacher
//! crate's `core::config::Config` does.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_input")]
    pub input_folder: String,
    #[serde(default = "default_output")]
    pub output_folder: String,
    #[serde(default = "default_build")]
    pub build_folder: String,
    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,
    pub tts: TtsPoolConfig,
    #[serde(default)]
    pub audio: AudioConfig,
}

/// §6's enumerated configuration table. `api_url`/`api_key`/`model` are
/// ambient connection settings for whatever concrete `LlmClient` the host
/// wires in (the client itself is out of scope per §1), mirroring the
/// teacher's `GeminiClient`/`OllamaClient` constructor arguments.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_threads")]
    pub llm_threads: usize,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            llm_threads: default_llm_threads(),
            timeout_secs: default_llm_timeout_secs(),
            api_url: String::new(),
            api_key: String::new(),
            model: String::new(),
        }
    }
}

/// One enabled voice, as the host's voice-catalog curation hands it to the
/// core (§3 Voice, §4.2 Voice Pool Builder).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VoiceConfig {
    pub id: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default = "default_voice_gender")]
    pub gender: String,
    #[serde(default)]
    pub name: String,
}

fn default_voice_gender() -> String {
    "unknown".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TtsPoolConfig {
    #[serde(default = "default_tts_threads")]
    pub tts_threads: usize,
    #[serde(default)]
    pub api_url: String,
    pub narrator_voice: String,
    #[serde(default)]
    pub enabled_voices: Vec<VoiceConfig>,
    #[serde(default)]
    pub rate: i32,
    #[serde(default)]
    pub pitch: i32,
}

impl Default for TtsPoolConfig {
    fn default() -> Self {
        Self {
            tts_threads: default_tts_threads(),
            api_url: String::new(),
            narrator_voice: String::new(),
            enabled_voices: Vec::new(),
            rate: 0,
            pitch: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AudioConfig {
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default)]
    pub silence_removal: bool,
    #[serde(default)]
    pub normalization: bool,
}

fn default_input() -> String {
    "input".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_llm_threads() -> usize {
    2
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_tts_threads() -> usize {
    15
}
fn default_output_format() -> String {
    "mp3".to_string()
}

/// Clamp a value read from config into the range §6 allows, the way the
/// teacher crate defaults missing fields rather than rejecting them outright.
pub fn clamp_tts_threads(n: usize) -> usize {
    n.clamp(1, 30)
}

pub fn clamp_llm_threads(n: usize) -> usize {
    n.clamp(1, 10)
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config =
            serde_yaml_ng::from_str(&content).context("Failed to parse config")?;
        config.tts.tts_threads = clamp_tts_threads(config.tts.tts_threads);
        config.llm.llm_threads = clamp_llm_threads(config.llm.llm_threads);
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path, content).context("Failed to write config")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.input_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_out_of_range_thread_counts() {
        assert_eq!(clamp_tts_threads(0), 1);
        assert_eq!(clamp_tts_threads(99), 30);
        assert_eq!(clamp_llm_threads(0), 1);
        assert_eq!(clamp_llm_threads(99), 10);
    }

    #[test]
    fn loads_minimal_config() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            "llm:\n  llm_threads: 4\ntts:\n  tts_threads: 40\n  narrator_voice: en-US-Neutral\n",
        )?;
        let config = Config::load(&path)?;
        assert_eq!(config.llm.llm_threads, 4);
        assert_eq!(config.tts.tts_threads, 30);
        assert_eq!(config.tts.narrator_voice, "en-US-Neutral");
        assert_eq!(config.input_folder, "input");
        Ok(())
    }
}
