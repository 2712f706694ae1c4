//! Wake phrase scoring over ONNX Runtime.
//!
//! One session per shipped phrase model; each 1280-sample int16 frame is
//! normalised to f32 and scored, yielding a detection confidence in [0, 1].

use std::path::PathBuf;

use ndarray::Array2;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

use super::WakeScorer;
use crate::audio::WAKE_FRAME_LEN;
use crate::config::model_dir;
use crate::{Error, Result};

/// ONNX-backed wake phrase scorer
pub struct OnnxWakeScorer {
    session: Session,
    model_id: String,
}

impl OnnxWakeScorer {
    /// Load the named phrase model. `model` may be a bare identifier
    /// (resolved to `<state>/models/<model>.onnx`) or a path.
    ///
    /// # Errors
    ///
    /// Returns error if the model file is missing or cannot be loaded.
    pub fn new(model: &str) -> Result<Self> {
        let path = if model.ends_with(".onnx") {
            PathBuf::from(model)
        } else {
            model_dir().join(format!("{model}.onnx"))
        };
        if !path.exists() {
            return Err(Error::WakeWord(format!(
                "wake model not found at {}",
                path.display()
            )));
        }

        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.commit_from_file(&path))
            .map_err(|e| Error::WakeWord(format!("cannot load wake model: {e}")))?;

        let model_id = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| model.to_string());

        tracing::info!(model = %model_id, "wake word model loaded");

        Ok(Self { session, model_id })
    }
}

impl WakeScorer for OnnxWakeScorer {
    fn scores(&mut self, frame: &[i16]) -> Result<Vec<(String, f32)>> {
        if frame.len() != WAKE_FRAME_LEN {
            return Err(Error::WakeWord(format!(
                "expected {WAKE_FRAME_LEN}-sample frame, got {}",
                frame.len()
            )));
        }

        let mut input = Array2::<f32>::zeros((1, WAKE_FRAME_LEN));
        for (i, sample) in frame.iter().enumerate() {
            input[[0, i]] = f32::from(*sample) / 32768.0;
        }

        let input_tensor = ort::value::TensorRef::from_array_view(input.view())
            .map_err(|e| Error::WakeWord(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs!["input" => input_tensor])
            .map_err(|e| Error::WakeWord(format!("inference failed: {e}")))?;

        let score = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| Error::WakeWord(e.to_string()))?
            .iter()
            .copied()
            .next()
            .unwrap_or(0.0);

        Ok(vec![(self.model_id.clone(), score.clamp(0.0, 1.0))])
    }
}
