//! Configuration management for the chorus gateway
//!
//! Lookup order: `$CHORUS_CONFIG` → `<state>/config.json` → built-in
//! defaults. Individual values can be overridden through environment
//! variables after the file is read. A missing or malformed file is not an
//! error: the gateway starts with defaults and logs a warning.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default port for the loopback HTTP side-channel; sessions claim the
/// lowest free port at or above this.
pub const DEFAULT_HTTP_PORT: u16 = 7865;

/// Chorus gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Synthesis engine configuration
    pub tts: TtsConfig,

    /// Transcription and voice-activity configuration
    pub stt: SttConfig,

    /// Wake word listener configuration
    pub wake_word: WakeConfig,

    /// Name this process prefers to register under
    pub main_agent: String,

    /// Last name explicitly chosen via `set_voice`; takes precedence over
    /// `main_agent` when re-registering after a restart
    pub last_voice_name: Option<String>,

    /// Pre-seeded agent-name → voice-id assignments
    pub voice_registry: BTreeMap<String, String>,

    /// Base port for the HTTP side-channel
    pub http_port: u16,
}

/// Synthesis engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Path to the synthesis ONNX model
    pub model_path: PathBuf,

    /// Path to the packed voice style vectors
    pub voices_path: PathBuf,

    /// Voice used for the process's own `default` agent
    pub default_voice: String,

    /// Speed multiplier applied when a request does not specify one
    pub default_speed: f32,

    /// External playback command (`mpv`, `afplay`, `aplay`, ...)
    pub audio_player: String,
}

/// Transcription and voice-activity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Path to the transcription model
    pub model_path: PathBuf,

    /// Transcription language hint
    pub language: String,

    /// Speech probability at or above which a frame counts as speech
    pub vad_threshold: f32,

    /// Seconds of post-speech silence that end a recording
    pub silence_threshold: f32,

    /// Default maximum seconds to wait for speech
    pub max_listen_timeout: f32,
}

/// Wake word listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Start the listener at boot
    pub enabled: bool,

    /// Wake phrase model identifier or path
    pub model: String,

    /// Detection score at or above which the phrase counts as spoken
    pub threshold: f32,

    /// Sound played when recording starts ("tink", a file path, or empty
    /// for none)
    pub ready_sound: String,

    /// Maximum seconds to record after the wake phrase
    pub recording_timeout: f32,

    /// Seconds with no detected speech after the wake phrase before giving
    /// up and resuming listening
    pub no_speech_timeout: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tts: TtsConfig::default(),
            stt: SttConfig::default(),
            wake_word: WakeConfig::default(),
            main_agent: "Eric".to_string(),
            last_voice_name: None,
            voice_registry: BTreeMap::new(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        let models = model_dir();
        Self {
            model_path: models.join("kokoro-v1.0.onnx"),
            voices_path: models.join("voices-v1.0.bin"),
            default_voice: "am_eric".to_string(),
            default_speed: 1.0,
            audio_player: "mpv".to_string(),
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model_path: model_dir().join("ggml-base.en.bin"),
            language: "en".to_string(),
            vad_threshold: 0.3,
            silence_threshold: 1.5,
            max_listen_timeout: 15.0,
        }
    }
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "hey_jarvis_v0.1".to_string(),
            threshold: 0.5,
            ready_sound: "tink".to_string(),
            recording_timeout: 10.0,
            no_speech_timeout: 5.0,
        }
    }
}

/// Per-user state directory (`~/.local/share/chorus` on Linux)
#[must_use]
pub fn state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chorus")
}

/// Engine model directory under the state directory
#[must_use]
pub fn model_dir() -> PathBuf {
    state_dir().join("models")
}

/// Config file path, respecting `$CHORUS_CONFIG`
#[must_use]
pub fn config_path() -> PathBuf {
    env::var_os("CHORUS_CONFIG")
        .map_or_else(|| state_dir().join("config.json"), PathBuf::from)
}

/// Shared session registry file path
#[must_use]
pub fn sessions_path() -> PathBuf {
    state_dir().join("sessions.json")
}

/// Cross-process playback lock path under the system temp directory
#[must_use]
pub fn audio_lock_path() -> PathBuf {
    env::temp_dir().join("chorus-audio.lock")
}

impl Config {
    /// Load configuration from the given path, falling back to defaults and
    /// applying environment overrides.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Self>(&raw) {
                Ok(config) => {
                    tracing::debug!(path = %path.display(), "loaded configuration");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "malformed config, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(path) = env::var_os("CHORUS_TTS_MODEL") {
            self.tts.model_path = PathBuf::from(path);
        }
        if let Some(path) = env::var_os("CHORUS_TTS_VOICES") {
            self.tts.voices_path = PathBuf::from(path);
        }
        if let Some(path) = env::var_os("CHORUS_STT_MODEL") {
            self.stt.model_path = PathBuf::from(path);
        }
        if let Ok(player) = env::var("CHORUS_PLAYER") {
            self.tts.audio_player = player;
        }
        if let Ok(voice) = env::var("CHORUS_DEFAULT_VOICE") {
            self.tts.default_voice = voice;
        }
        if let Ok(port) = env::var("CHORUS_HTTP_PORT") {
            match port.parse() {
                Ok(port) => self.http_port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid CHORUS_HTTP_PORT"),
            }
        }
    }

    /// Write the configuration as pretty JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or the file cannot
    /// be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .map_err(|e| Error::Config(format!("cannot write {}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "saved configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.main_agent, "Eric");
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(config.tts.default_voice, "am_eric");
        assert!((config.stt.vad_threshold - 0.3).abs() < f32::EPSILON);
        assert!(!config.wake_word.enabled);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.json"));
        assert_eq!(config.main_agent, "Eric");
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let config = Config::load(&path);
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
    }

    #[test]
    fn partial_file_keeps_defaults_for_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"main_agent":"Nova","http_port":9000}"#).unwrap();
        let config = Config::load(&path);
        assert_eq!(config.main_agent, "Nova");
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.tts.default_voice, "am_eric");
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");

        let mut config = Config::default();
        config.main_agent = "Bella".to_string();
        config.last_voice_name = Some("Bella".to_string());
        config
            .voice_registry
            .insert("Bella".to_string(), "af_bella".to_string());
        config.save(&path).unwrap();

        let reloaded = Config::load(&path);
        assert_eq!(reloaded.main_agent, "Bella");
        assert_eq!(reloaded.last_voice_name.as_deref(), Some("Bella"));
        assert_eq!(
            reloaded.voice_registry.get("Bella").map(String::as_str),
            Some("af_bella")
        );
    }
}
