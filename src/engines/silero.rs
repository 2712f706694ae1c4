//! Silero VAD over ONNX Runtime.
//!
//! The model is recurrent: a `[2, 1, 128]` state tensor persists between
//! frames, and each 512-sample frame is fed with the previous frame's last
//! 64 samples prepended as context.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, Array3};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

use super::SpeechDetector;
use crate::audio::VAD_FRAME_LEN;
use crate::config::model_dir;
use crate::{Error, Result};

const CONTEXT_LEN: usize = 64;
const STATE_DIM: usize = 128;
const SAMPLE_RATE: i64 = 16_000;

/// Silero voice activity detector
pub struct SileroDetector {
    session: Session,
    state: Array3<f32>,
    context: Vec<f32>,
}

impl SileroDetector {
    /// Load the model from the default model directory.
    ///
    /// # Errors
    ///
    /// Returns error if `silero_vad.onnx` is missing or cannot be loaded.
    pub fn from_model_dir() -> Result<Self> {
        Self::new(&model_dir().join("silero_vad.onnx"))
    }

    /// Load the model from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns error if the model cannot be loaded.
    pub fn new(model_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            return Err(Error::Vad(format!(
                "silero model not found at {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| Error::Vad(format!("cannot load silero model: {e}")))?;

        tracing::info!(path = %model_path.display(), "silero VAD loaded");

        Ok(Self {
            session,
            state: Array3::zeros((2, 1, STATE_DIM)),
            context: vec![0.0; CONTEXT_LEN],
        })
    }

    /// Path candidates probed by the installer; exposed for diagnostics.
    #[must_use]
    pub fn default_path() -> PathBuf {
        model_dir().join("silero_vad.onnx")
    }
}

impl SpeechDetector for SileroDetector {
    fn probability(&mut self, frame: &[f32]) -> Result<f32> {
        if frame.len() != VAD_FRAME_LEN {
            return Err(Error::Vad(format!(
                "expected {VAD_FRAME_LEN}-sample frame, got {}",
                frame.len()
            )));
        }

        // Context carry: previous frame's tail precedes the new frame.
        let mut input = Array2::<f32>::zeros((1, CONTEXT_LEN + VAD_FRAME_LEN));
        for (i, sample) in self.context.iter().enumerate() {
            input[[0, i]] = *sample;
        }
        for (i, sample) in frame.iter().enumerate() {
            input[[0, CONTEXT_LEN + i]] = *sample;
        }

        let sr = Array1::<i64>::from_elem(1, SAMPLE_RATE);

        let input_tensor = ort::value::TensorRef::from_array_view(input.view())
            .map_err(|e| Error::Vad(e.to_string()))?;
        let sr_tensor = ort::value::TensorRef::from_array_view(sr.view())
            .map_err(|e| Error::Vad(e.to_string()))?;
        let state_tensor = ort::value::TensorRef::from_array_view(self.state.view())
            .map_err(|e| Error::Vad(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![
                "input" => input_tensor,
                "state" => state_tensor,
                "sr" => sr_tensor,
            ])
            .map_err(|e| Error::Vad(format!("VAD inference failed: {e}")))?;

        let probability = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| Error::Vad(e.to_string()))?
            .iter()
            .copied()
            .next()
            .unwrap_or(0.0);

        let new_state = outputs[1]
            .try_extract_array::<f32>()
            .map_err(|e| Error::Vad(e.to_string()))?
            .to_owned();
        if let Ok(new_state) = new_state.into_dimensionality::<ndarray::Ix3>() {
            self.state.assign(&new_state);
        }

        self.context.copy_from_slice(&frame[VAD_FRAME_LEN - CONTEXT_LEN..]);

        Ok(probability.clamp(0.0, 1.0))
    }

    fn reset(&mut self) {
        self.state.fill(0.0);
        self.context.fill(0.0);
    }
}
