//! Deterministic in-memory engines for the test suite.
//!
//! Every fake is cheap, hardware-free, and fully predictable: synthesis
//! length is a pure function of the text, detection is a pure function of
//! frame energy, and transcriptions are scripted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{SpeechDetector, Synthesis, SynthesisEngine, Transcription, TranscriptionEngine,
    WakeScorer};
use crate::{Error, Result};

/// Synthesis fake: a 440 Hz tone whose length scales with the text
pub struct FakeSynth {
    sample_rate: u32,
    samples_per_char: usize,
    calls: Mutex<Vec<(String, String, f32)>>,
}

impl Default for FakeSynth {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            samples_per_char: 240,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeSynth {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `(voice, text, speed)` tuples in synthesis order
    pub fn calls(&self) -> Vec<(String, String, f32)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl SynthesisEngine for FakeSynth {
    fn synthesize(&self, voice_id: &str, text: &str, speed: f32) -> Result<Synthesis> {
        if text.is_empty() {
            return Err(Error::Synthesis("empty text".to_string()));
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((voice_id.to_string(), text.to_string(), speed));
        }

        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let len = ((text.len() * self.samples_per_char) as f32 / speed.max(0.1)) as usize;
        let samples = (0..len)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let t = i as f32 / self.sample_rate as f32;
                (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.2
            })
            .collect();

        Ok(Synthesis {
            samples,
            sample_rate: self.sample_rate,
        })
    }

    fn model_name(&self) -> String {
        "fake-tts".to_string()
    }
}

/// Transcription fake returning a scripted string
pub struct FakeTranscriber {
    text: String,
    avg_logprob: f32,
}

impl Default for FakeTranscriber {
    fn default() -> Self {
        Self {
            text: "fake transcription".to_string(),
            avg_logprob: -0.2,
        }
    }
}

impl FakeTranscriber {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_response(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            avg_logprob: -0.2,
        }
    }

    #[must_use]
    pub fn with_logprob(mut self, avg_logprob: f32) -> Self {
        self.avg_logprob = avg_logprob;
        self
    }
}

impl TranscriptionEngine for FakeTranscriber {
    fn transcribe(&self, samples: &[f32], _sample_rate: u32) -> Result<Transcription> {
        if samples.is_empty() {
            return Ok(Transcription {
                text: String::new(),
                avg_logprob: f32::MIN,
            });
        }
        Ok(Transcription {
            text: self.text.clone(),
            avg_logprob: self.avg_logprob,
        })
    }

    fn model_name(&self) -> String {
        "fake-stt".to_string()
    }
}

/// Energy-threshold detector: any frame with RMS above the threshold is
/// speech with probability 0.9, everything else 0.05
pub struct FakeDetector {
    threshold: f32,
}

impl Default for FakeDetector {
    fn default() -> Self {
        Self { threshold: 0.01 }
    }
}

impl FakeDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpeechDetector for FakeDetector {
    fn probability(&mut self, frame: &[f32]) -> Result<f32> {
        if frame.is_empty() {
            return Ok(0.0);
        }
        #[allow(clippy::cast_precision_loss)]
        let rms = (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt();
        Ok(if rms > self.threshold { 0.9 } else { 0.05 })
    }

    fn reset(&mut self) {}
}

/// Wake fake: fires once each time the shared trigger flag is raised
pub struct FakeWake {
    model: String,
    trigger: Arc<AtomicBool>,
}

impl FakeWake {
    #[must_use]
    pub fn new(model: impl Into<String>) -> (Self, Arc<AtomicBool>) {
        let trigger = Arc::new(AtomicBool::new(false));
        (
            Self {
                model: model.into(),
                trigger: Arc::clone(&trigger),
            },
            trigger,
        )
    }
}

impl WakeScorer for FakeWake {
    fn scores(&mut self, _frame: &[i16]) -> Result<Vec<(String, f32)>> {
        let score = if self.trigger.swap(false, Ordering::SeqCst) {
            0.9
        } else {
            0.0
        };
        Ok(vec![(self.model.clone(), score)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synth_rejects_empty_text() {
        let synth = FakeSynth::new();
        assert!(synth.synthesize("am_eric", "", 1.0).is_err());
    }

    #[test]
    fn synth_length_scales_with_text_and_speed() {
        let synth = FakeSynth::new();
        let slow = synth.synthesize("am_eric", "hello", 1.0).unwrap();
        let fast = synth.synthesize("am_eric", "hello", 2.0).unwrap();
        assert_eq!(slow.samples.len(), fast.samples.len() * 2);

        let longer = synth.synthesize("am_eric", "hello world", 1.0).unwrap();
        assert!(longer.samples.len() > slow.samples.len());
    }

    #[test]
    fn synth_records_calls_in_order() {
        let synth = FakeSynth::new();
        synth.synthesize("am_eric", "one", 1.0).unwrap();
        synth.synthesize("af_nova", "two", 1.5).unwrap();

        let calls = synth.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "am_eric");
        assert_eq!(calls[1].1, "two");
    }

    #[test]
    fn detector_separates_tone_from_silence() {
        let mut detector = FakeDetector::new();
        let silence = vec![0.0f32; 512];
        assert!(detector.probability(&silence).unwrap() < 0.3);

        let tone: Vec<f32> = (0..512).map(|i| ((i % 20) as f32 / 10.0 - 1.0) * 0.5).collect();
        assert!(detector.probability(&tone).unwrap() > 0.5);
    }

    #[test]
    fn wake_fires_once_per_trigger() {
        let (mut wake, trigger) = FakeWake::new("hey_chorus");
        let frame = vec![0i16; 1280];

        assert!(wake.scores(&frame).unwrap()[0].1 < 0.5);
        trigger.store(true, Ordering::SeqCst);
        assert!(wake.scores(&frame).unwrap()[0].1 > 0.5);
        assert!(wake.scores(&frame).unwrap()[0].1 < 0.5);
    }
}
