//! Kokoro synthesis over ONNX Runtime.
//!
//! The model takes a token sequence, a 256-float style vector selected from
//! the packed voices file by voice and input length, and a speed scalar; it
//! emits 24 kHz mono PCM.

use std::collections::HashMap;
use std::path::Path;

use ndarray::{Array1, Array2};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

use super::{Synthesis, SynthesisEngine};
use crate::catalog;
use crate::{Error, Result};

const OUTPUT_SAMPLE_RATE: u32 = 24_000;
const STYLE_DIM: usize = 256;
/// Style rows per voice in the packed voices file
const STYLE_ROWS: usize = 510;

/// Kokoro text-to-speech engine
pub struct KokoroEngine {
    session: std::sync::Mutex<Session>,
    styles: HashMap<String, Vec<f32>>,
    model_name: String,
}

impl KokoroEngine {
    /// Load the synthesis model and the packed voice styles.
    ///
    /// # Errors
    ///
    /// Returns error if either file is missing or malformed.
    pub fn new(model_path: &Path, voices_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            return Err(Error::Synthesis(format!(
                "synthesis model not found at {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| Error::Synthesis(format!("cannot load synthesis model: {e}")))?;

        let styles = load_styles(voices_path)?;

        let model_name = model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "kokoro".to_string());

        tracing::info!(
            model = %model_name,
            voices = styles.len(),
            "synthesis engine loaded"
        );

        Ok(Self {
            session: std::sync::Mutex::new(session),
            styles,
            model_name,
        })
    }
}

impl SynthesisEngine for KokoroEngine {
    fn synthesize(&self, voice_id: &str, text: &str, speed: f32) -> Result<Synthesis> {
        if text.is_empty() {
            return Err(Error::Synthesis("empty text".to_string()));
        }
        let style = self
            .styles
            .get(voice_id)
            .ok_or_else(|| Error::InvalidVoice(voice_id.to_string()))?;

        let token_ids = tokenize(text);
        let row = token_ids.len().min(STYLE_ROWS - 1);
        let style_row = &style[row * STYLE_DIM..(row + 1) * STYLE_DIM];

        let mut tokens = Array2::<i64>::zeros((1, token_ids.len() + 2));
        for (i, id) in token_ids.iter().enumerate() {
            tokens[[0, i + 1]] = *id;
        }
        let mut style_arr = Array2::<f32>::zeros((1, STYLE_DIM));
        for (i, v) in style_row.iter().enumerate() {
            style_arr[[0, i]] = *v;
        }
        let speed_arr = Array1::<f32>::from_elem(1, speed);

        let tokens_tensor = ort::value::TensorRef::from_array_view(tokens.view())
            .map_err(|e| Error::Synthesis(e.to_string()))?;
        let style_tensor = ort::value::TensorRef::from_array_view(style_arr.view())
            .map_err(|e| Error::Synthesis(e.to_string()))?;
        let speed_tensor = ort::value::TensorRef::from_array_view(speed_arr.view())
            .map_err(|e| Error::Synthesis(e.to_string()))?;

        let session = self
            .session
            .lock()
            .map_err(|_| Error::Synthesis("engine poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![
                "tokens" => tokens_tensor,
                "style" => style_tensor,
                "speed" => speed_tensor,
            ])
            .map_err(|e| Error::Synthesis(format!("inference failed: {e}")))?;

        let samples: Vec<f32> = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| Error::Synthesis(e.to_string()))?
            .iter()
            .copied()
            .collect();

        Ok(Synthesis {
            samples,
            sample_rate: OUTPUT_SAMPLE_RATE,
        })
    }

    fn model_name(&self) -> String {
        self.model_name.clone()
    }
}

/// Map text onto the model's token table. The shipped table covers
/// lowercase letters, digits and common punctuation; anything else maps to
/// the space token.
fn tokenize(text: &str) -> Vec<i64> {
    const TABLE: &str = " abcdefghijklmnopqrstuvwxyz0123456789.,!?;:'-";
    text.to_lowercase()
        .chars()
        .map(|c| TABLE.find(c).map_or(0, |i| i as i64 + 1))
        .collect()
}

/// Parse the packed voices file: per voice, `STYLE_ROWS` rows of
/// `STYLE_DIM` little-endian f32 values, in catalogue order.
fn load_styles(path: &Path) -> Result<HashMap<String, Vec<f32>>> {
    let raw = std::fs::read(path)
        .map_err(|e| Error::Synthesis(format!("cannot read {}: {e}", path.display())))?;

    let floats: Vec<f32> = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    let per_voice = STYLE_ROWS * STYLE_DIM;
    if floats.len() < per_voice * catalog::VOICES.len() {
        return Err(Error::Synthesis(format!(
            "voices file too short: {} floats for {} voices",
            floats.len(),
            catalog::VOICES.len()
        )));
    }

    let mut styles = HashMap::new();
    for (i, voice) in catalog::VOICES.iter().enumerate() {
        let start = i * per_voice;
        styles.insert(voice.id.to_string(), floats[start..start + per_voice].to_vec());
    }
    Ok(styles)
}
