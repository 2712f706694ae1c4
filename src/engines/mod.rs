//! Engine adapter seams.
//!
//! The pipelines only ever see these four narrow traits; the concrete ONNX
//! and whisper.cpp adapters live behind cargo features, and the test suite
//! runs entirely on the deterministic fakes. No engine-specific type leaks
//! past this module.

pub mod fake;

#[cfg(feature = "onnx")]
mod kokoro;
#[cfg(feature = "onnx")]
mod silero;
#[cfg(feature = "onnx")]
mod wakeword;
#[cfg(feature = "whisper")]
mod whisper;

#[cfg(feature = "onnx")]
pub use kokoro::KokoroEngine;
#[cfg(feature = "onnx")]
pub use silero::SileroDetector;
#[cfg(feature = "onnx")]
pub use wakeword::OnnxWakeScorer;
#[cfg(feature = "whisper")]
pub use whisper::WhisperEngine;

use std::sync::{Arc, Mutex};

use crate::{Config, Result};

/// PCM produced by a synthesis engine
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Text produced by a transcription engine
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    /// Average log probability over decoded tokens, in (-inf, 0]
    pub avg_logprob: f32,
}

/// Text-to-speech: `(voice, text, speed)` → PCM.
///
/// Implementations must reject empty text and honour `speed` as a
/// multiplicative rate.
pub trait SynthesisEngine: Send + Sync {
    fn synthesize(&self, voice_id: &str, text: &str, speed: f32) -> Result<Synthesis>;

    /// Model identifier for status reporting
    fn model_name(&self) -> String;
}

/// Speech-to-text over 16 kHz mono f32 PCM
pub trait TranscriptionEngine: Send + Sync {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<Transcription>;

    /// Model identifier for status reporting
    fn model_name(&self) -> String;
}

/// Frame-by-frame speech probability. Stateful: implementations carry
/// recurrent state and the 64-sample context between calls.
pub trait SpeechDetector: Send {
    /// Speech probability in [0, 1] for one 512-sample frame
    fn probability(&mut self, frame: &[f32]) -> Result<f32>;

    /// Clear recurrent state between recordings
    fn reset(&mut self);
}

/// Wake phrase scoring over 1280-sample int16 frames
pub trait WakeScorer: Send {
    /// Detection score in [0, 1] per shipped phrase model
    fn scores(&mut self, frame: &[i16]) -> Result<Vec<(String, f32)>>;
}

/// Confidence for a transcription: `exp(avg_logprob)` clamped to [0, 1]
#[must_use]
pub fn confidence(avg_logprob: f32) -> f32 {
    avg_logprob.exp().clamp(0.0, 1.0)
}

/// Shared handle to a stateful detector
pub type SharedDetector = Arc<Mutex<Box<dyn SpeechDetector>>>;

/// The engines a running gateway holds. Any of them may be absent when its
/// model failed to load; the pipelines degrade per-tool rather than the
/// process aborting (unless both TTS and STT are gone).
#[derive(Clone, Default)]
pub struct EngineSet {
    pub tts: Option<Arc<dyn SynthesisEngine>>,
    pub stt: Option<Arc<dyn TranscriptionEngine>>,
    pub vad: Option<SharedDetector>,
}

impl EngineSet {
    /// Load the real engines described by the configuration, tolerating
    /// individual failures.
    #[must_use]
    pub fn load(config: &Config) -> Self {
        #[allow(unused_mut)]
        let mut set = Self::default();

        #[cfg(feature = "onnx")]
        {
            match KokoroEngine::new(&config.tts.model_path, &config.tts.voices_path) {
                Ok(engine) => set.tts = Some(Arc::new(engine)),
                Err(e) => tracing::error!(error = %e, "TTS initialization failed"),
            }
            match SileroDetector::from_model_dir() {
                Ok(vad) => {
                    set.vad = Some(Arc::new(Mutex::new(
                        Box::new(vad) as Box<dyn SpeechDetector>
                    )));
                }
                Err(e) => tracing::warn!(error = %e, "VAD initialization failed"),
            }
        }

        #[cfg(feature = "whisper")]
        {
            match WhisperEngine::new(&config.stt.model_path, &config.stt.language) {
                Ok(engine) => set.stt = Some(Arc::new(engine)),
                Err(e) => tracing::error!(error = %e, "STT initialization failed"),
            }
        }

        #[cfg(not(feature = "onnx"))]
        tracing::warn!("built without the `onnx` feature: TTS and VAD unavailable");
        #[cfg(not(feature = "whisper"))]
        tracing::warn!("built without the `whisper` feature: STT unavailable");

        let _ = config;
        set
    }

    /// Build a wake phrase scorer for the configured model. Called lazily
    /// when the wake listener first enters its listening state.
    pub fn load_wake_scorer(config: &Config) -> Result<Box<dyn WakeScorer>> {
        #[cfg(feature = "onnx")]
        {
            let scorer = OnnxWakeScorer::new(&config.wake_word.model)?;
            return Ok(Box::new(scorer));
        }
        #[cfg(not(feature = "onnx"))]
        {
            let _ = config;
            Err(crate::Error::EngineUnavailable("wake word"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_clamps_to_unit_interval() {
        assert!((confidence(0.0) - 1.0).abs() < f32::EPSILON);
        assert!(confidence(-0.5) > 0.0 && confidence(-0.5) < 1.0);
        assert!(confidence(-100.0) >= 0.0);
        assert!((confidence(2.0) - 1.0).abs() < f32::EPSILON);
    }
}
