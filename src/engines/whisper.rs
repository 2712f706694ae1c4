//! Whisper transcription via whisper.cpp bindings.

use std::path::Path;
use std::sync::Mutex;

use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::{Transcription, TranscriptionEngine};
use crate::{Error, Result};

/// Local Whisper speech-to-text engine
pub struct WhisperEngine {
    state: Mutex<whisper_rs::WhisperState>,
    language: String,
    model_name: String,
    // Context must outlive the state it created.
    _context: WhisperContext,
}

impl WhisperEngine {
    /// Load a ggml model (e.g. `ggml-base.en.bin`).
    ///
    /// # Errors
    ///
    /// Returns error if the model cannot be loaded.
    pub fn new(model_path: &Path, language: &str) -> Result<Self> {
        let path = model_path
            .to_str()
            .ok_or_else(|| Error::Transcription("non-UTF8 model path".to_string()))?;

        let context =
            WhisperContext::new_with_params(path, WhisperContextParameters::default())
                .map_err(|e| Error::Transcription(format!("whisper load failed: {e}")))?;
        let state = context
            .create_state()
            .map_err(|e| Error::Transcription(format!("whisper state init failed: {e}")))?;

        let model_name = model_path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "whisper".to_string());

        tracing::info!(model = %model_name, language, "whisper engine loaded");

        Ok(Self {
            state: Mutex::new(state),
            language: language.to_string(),
            model_name,
            _context: context,
        })
    }
}

impl TranscriptionEngine for WhisperEngine {
    fn transcribe(&self, samples: &[f32], _sample_rate: u32) -> Result<Transcription> {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some(&self.language));
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_special(false);
        params.set_suppress_blank(true);

        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Transcription("engine poisoned".to_string()))?;

        state
            .full(params, samples)
            .map_err(|e| Error::Transcription(format!("inference failed: {e}")))?;

        let segments = state
            .full_n_segments()
            .map_err(|e| Error::Transcription(e.to_string()))?;

        let mut text = String::new();
        let mut log_probs: Vec<f32> = Vec::new();
        for i in 0..segments {
            let segment = state
                .full_get_segment_text(i)
                .map_err(|e| Error::Transcription(e.to_string()))?;
            text.push_str(&segment);

            let tokens = state
                .full_n_tokens(i)
                .map_err(|e| Error::Transcription(e.to_string()))?;
            for j in 0..tokens {
                if let Ok(p) = state.full_get_token_prob(i, j) {
                    log_probs.push(p.max(1e-10).ln());
                }
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let avg_logprob = if log_probs.is_empty() {
            f32::MIN
        } else {
            log_probs.iter().sum::<f32>() / log_probs.len() as f32
        };

        Ok(Transcription {
            text: text.trim().to_string(),
            avg_logprob,
        })
    }

    fn model_name(&self) -> String {
        self.model_name.clone()
    }
}
