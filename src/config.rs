//! Configuration management for negotiation-narrator.
//!
//! Loads config from YAML files in standard locations; any missing or
//! malformed file falls back to defaults with a warning.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Broker base URL (the `/api/start|reset|transcript` host).
    pub base_url: String,
    /// Polling interval in milliseconds.
    pub interval_ms: u64,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            interval_ms: 800,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub enabled: bool,
    /// OpenAI-compatible TTS endpoint base, e.g. https://api.openai.com/v1
    pub api_url: String,
    /// Bearer key; empty disables synthesis (silent device).
    pub api_key: String,
    pub model: String,
    /// Playback speed multiplier.
    pub speed: f32,
    /// Delay between cancelling an utterance and starting the next one.
    /// Keeps a cancelled job's late completion from racing the new job.
    pub preempt_delay_ms: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            model: "tts-1".into(),
            speed: 1.0,
            preempt_delay_ms: 50,
        }
    }
}

/// One role-to-voice preference. Roles are matched by lower-cased substring,
/// first match wins in table order.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceBinding {
    pub role_keyword: String,
    pub preferred_voice: String,
}

fn default_voice_bindings() -> Vec<VoiceBinding> {
    // Match order matters: maylim before kumar before broker.
    [
        ("maylim", "shimmer"),
        ("kumar", "onyx"),
        ("broker", "echo"),
    ]
    .into_iter()
    .map(|(role_keyword, preferred_voice)| VoiceBinding {
        role_keyword: role_keyword.into(),
        preferred_voice: preferred_voice.into(),
    })
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub poll: PollConfig,
    pub speech: SpeechConfig,
    pub voices: Vec<VoiceBinding>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            speech: SpeechConfig::default(),
            voices: default_voice_bindings(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/negotiation-narrator/config.yaml
    /// 3. /etc/negotiation-narrator/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/negotiation-narrator/config.yaml")),
                Some(PathBuf::from("/etc/negotiation-narrator/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match serde_yml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_the_three_roles_in_order() {
        let config = Config::default();
        let keywords: Vec<&str> = config
            .voices
            .iter()
            .map(|b| b.role_keyword.as_str())
            .collect();
        assert_eq!(keywords, ["maylim", "kumar", "broker"]);
    }

    #[test]
    fn partial_yaml_keeps_remaining_defaults() {
        let config: Config = serde_yml::from_str("poll:\n  interval_ms: 250\n").unwrap();
        assert_eq!(config.poll.interval_ms, 250);
        assert_eq!(config.poll.base_url, "http://127.0.0.1:8000");
        assert!(config.speech.enabled);
        assert_eq!(config.voices.len(), 3);
    }
}
