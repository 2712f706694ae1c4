//! Chorus - local voice gateway for coding agents
//!
//! A long-running process that gives editor-driven assistants a voice:
//! speech synthesis, microphone capture with voice-activity detection, and
//! a wake-word listener, exposed as MCP tools over stdio. Many gateways
//! run concurrently on one machine; they coordinate identities through a
//! file-locked session registry, playback through a cross-process audio
//! lock, and cross-session requests through per-process loopback HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │  stdio JSON-RPC        127.0.0.1 HTTP side-channel    │
//! │  (tool calls)          (/status /listen /speak ...)   │
//! └──────────────┬─────────────────┬──────────────────────┘
//!                │                 │
//! ┌──────────────▼─────────────────▼──────────────────────┐
//! │                     ServerState                       │
//! │  speech queue │ listen pipeline │ wake worker │ mute  │
//! │  voice registry │ session registry │ mic arbiter     │
//! └──────────────┬────────────────────────────────────────┘
//!                │
//! ┌──────────────▼────────────────────────────────────────┐
//! │  engine adapters: TTS / STT / VAD / wake (trait seams)│
//! └───────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod catalog;
pub mod config;
pub mod engines;
pub mod error;
pub mod listen;
pub mod registry;
pub mod server;
pub mod speech;
pub mod wake;

pub use config::Config;
pub use error::{Error, Result};
pub use listen::{CancelToken, ListenOutcome, ListenParams, MicArbiter};
pub use registry::{SessionEntry, SessionStore, VoiceRegistry};
pub use server::{McpServer, ServerState};
pub use speech::SpeechQueue;
pub use wake::{WakeListener, WakeState};
