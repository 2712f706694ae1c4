//! Error types for the chorus gateway

use thiserror::Error;

/// Result type alias for chorus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the chorus gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or playback error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech synthesis error
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Speech transcription error
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Voice activity detection error
    #[error("voice detection error: {0}")]
    Vad(String),

    /// Wake word detection error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// A voice id that is not in the static catalogue
    #[error("unknown voice: {0}")]
    InvalidVoice(String),

    /// A name already claimed by another live session
    #[error("name '{name}' is held by session '{holder}'")]
    NameOccupied { name: String, holder: String },

    /// An engine that failed to load at startup
    #[error("engine not loaded: {0}")]
    EngineUnavailable(&'static str),

    /// Session registry error
    #[error("session registry error: {0}")]
    Registry(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Machine-readable kind tag for tool responses, where one exists.
    ///
    /// Domain failures surface to callers as `{ error: <kind>, message }`;
    /// everything else is reported under a generic kind by the dispatcher.
    #[must_use]
    pub fn kind(&self) -> Option<&'static str> {
        match self {
            Self::InvalidVoice(_) => Some("invalid_voice"),
            Self::NameOccupied { .. } => Some("name_occupied"),
            Self::EngineUnavailable(_) => Some("engine_unavailable"),
            _ => None,
        }
    }
}
