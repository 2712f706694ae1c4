//! Identity registries: per-process agent-name → voice bindings, and the
//! cross-process session registry shared through a file-locked JSON
//! document.

mod session;
mod voice;

pub use session::{SessionEntry, SessionStore};
pub use voice::VoiceRegistry;
