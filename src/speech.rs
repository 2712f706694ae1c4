//! Speech pipeline: a serial FIFO of speak requests feeding synthesis and
//! the playback sink.
//!
//! One worker consumes the queue. Long texts are chunked on sentence
//! boundaries and the chunks play back to back; the cross-process playback
//! lock is taken per chunk, inside the sink. `stop` kills the current
//! player and drains everything still queued, waking blocked callers with
//! a cancelled outcome.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::audio::AudioSink;
use crate::engines::SynthesisEngine;

/// Auto-chunk texts longer than this many characters
pub const MAX_CHUNK_LEN: usize = 500;

/// Final state of one speak request
#[derive(Debug, Clone)]
pub enum SpeakOutcome {
    Played {
        duration_ms: f64,
        synthesis_ms: f64,
    },
    /// Dropped by `stop` before or during playback
    Cancelled,
    Failed(String),
}

struct SpeakJob {
    voice: String,
    text: String,
    speed: f32,
    generation: u64,
    done: Option<oneshot::Sender<SpeakOutcome>>,
}

/// Handle to the speech worker
#[derive(Clone)]
pub struct SpeechQueue {
    tx: mpsc::UnboundedSender<SpeakJob>,
    depth: Arc<AtomicUsize>,
    generation: Arc<AtomicU64>,
    sink: Arc<AudioSink>,
}

impl SpeechQueue {
    /// Spawn the worker and return the producer handle.
    #[must_use]
    pub fn start(tts: Arc<dyn SynthesisEngine>, sink: Arc<AudioSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let generation = Arc::new(AtomicU64::new(0));

        tokio::spawn(worker(
            rx,
            tts,
            Arc::clone(&sink),
            Arc::clone(&depth),
            Arc::clone(&generation),
        ));

        Self {
            tx,
            depth,
            generation,
            sink,
        }
    }

    /// Enqueue a request and receive its completion signal.
    pub fn enqueue(
        &self,
        voice: &str,
        text: &str,
        speed: f32,
    ) -> oneshot::Receiver<SpeakOutcome> {
        let (done_tx, done_rx) = oneshot::channel();
        self.push(voice, text, speed, Some(done_tx));
        done_rx
    }

    /// Enqueue a fire-and-forget request (`block=false`).
    pub fn enqueue_detached(&self, voice: &str, text: &str, speed: f32) {
        self.push(voice, text, speed, None);
    }

    fn push(&self, voice: &str, text: &str, speed: f32, done: Option<oneshot::Sender<SpeakOutcome>>) {
        let job = SpeakJob {
            voice: voice.to_string(),
            text: text.to_string(),
            speed,
            generation: self.generation.load(Ordering::SeqCst),
            done,
        };
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            tracing::error!("speech worker gone, dropping request");
        }
    }

    /// Number of requests not yet picked up by the worker
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Kill the current playback and drain the queue. Returns true when a
    /// player process was actually playing.
    pub fn stop(&self) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.sink.stop()
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<SpeakJob>,
    tts: Arc<dyn SynthesisEngine>,
    sink: Arc<AudioSink>,
    depth: Arc<AtomicUsize>,
    generation: Arc<AtomicU64>,
) {
    while let Some(job) = rx.recv().await {
        depth.fetch_sub(1, Ordering::SeqCst);

        let outcome = if job.generation < generation.load(Ordering::SeqCst) {
            SpeakOutcome::Cancelled
        } else {
            run_job(&job, &tts, &sink, &generation).await
        };

        if let Some(done) = job.done {
            let _ = done.send(outcome);
        }
    }
}

async fn run_job(
    job: &SpeakJob,
    tts: &Arc<dyn SynthesisEngine>,
    sink: &Arc<AudioSink>,
    generation: &Arc<AtomicU64>,
) -> SpeakOutcome {
    let mut synthesis_ms = 0.0;
    let mut duration_ms = 0.0;

    for chunk in chunk_text(&job.text, MAX_CHUNK_LEN) {
        if job.generation < generation.load(Ordering::SeqCst) {
            return SpeakOutcome::Cancelled;
        }

        let tts = Arc::clone(tts);
        let voice = job.voice.clone();
        let speed = job.speed;
        let synth = tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let result = tts.synthesize(&voice, &chunk, speed);
            (result, start.elapsed().as_secs_f64() * 1000.0)
        })
        .await;

        let (synthesis, elapsed_ms) = match synth {
            Ok((Ok(synthesis), elapsed_ms)) => (synthesis, elapsed_ms),
            Ok((Err(e), _)) => {
                tracing::error!(error = %e, "synthesis failed");
                return SpeakOutcome::Failed(e.to_string());
            }
            Err(e) => return SpeakOutcome::Failed(format!("synthesis panicked: {e}")),
        };
        synthesis_ms += elapsed_ms;

        if job.generation < generation.load(Ordering::SeqCst) {
            return SpeakOutcome::Cancelled;
        }

        let sink = Arc::clone(sink);
        let played = tokio::task::spawn_blocking(move || {
            sink.play(&synthesis.samples, synthesis.sample_rate)
        })
        .await;

        match played {
            Ok(Ok(outcome)) => {
                duration_ms += outcome.duration_ms;
                if !outcome.completed {
                    return SpeakOutcome::Cancelled;
                }
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "playback failed");
                return SpeakOutcome::Failed(e.to_string());
            }
            Err(e) => return SpeakOutcome::Failed(format!("playback panicked: {e}")),
        }
    }

    SpeakOutcome::Played {
        duration_ms,
        synthesis_ms,
    }
}

/// Split text into chunks on sentence terminators (`.`, `!`, `?` followed
/// by a space or end of text). Sentences are grouped up to `max_len`; a
/// single sentence longer than `max_len` is kept whole, never broken
/// mid-sentence.
#[must_use]
pub fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let chars: Vec<char> = text.chars().collect();
    let mut sentences: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut i = 0;
    while i < chars.len() {
        current.push(chars[i]);
        let is_terminator = matches!(chars[i], '.' | '!' | '?');
        let at_boundary = i + 1 >= chars.len() || chars[i + 1] == ' ';
        if is_terminator && at_boundary {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
            if i + 1 < chars.len() && chars[i + 1] == ' ' {
                i += 1;
            }
        }
        i += 1;
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut chunk = String::new();
    for sentence in sentences {
        if chunk.is_empty() {
            chunk = sentence;
        } else if chunk.chars().count() + 1 + sentence.chars().count() <= max_len {
            chunk.push(' ');
            chunk.push_str(&sentence);
        } else {
            chunks.push(chunk);
            chunk = sentence;
        }
    }
    if !chunk.is_empty() {
        chunks.push(chunk);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioLock;
    use crate::engines::fake::FakeSynth;
    use crate::engines::{Synthesis, SynthesisEngine};
    use std::time::Duration;

    /// Sink whose "player" is /bin/true: playback is instant and silent.
    fn test_sink(dir: &tempfile::TempDir) -> Arc<AudioSink> {
        Arc::new(AudioSink::new(
            "true",
            AudioLock::new(dir.path().join("audio.lock")),
        ))
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("Hello there.", 500), vec!["Hello there."]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("", 500).is_empty());
    }

    #[test]
    fn long_text_splits_on_sentences() {
        let sentence = "This is a sentence that runs on for a while to fill space.";
        let text = [sentence; 12].join(" ");
        assert!(text.len() > MAX_CHUNK_LEN);

        let chunks = chunk_text(&text, MAX_CHUNK_LEN);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= MAX_CHUNK_LEN);
            assert!(chunk.ends_with('.'));
        }
        // Concatenation preserves every sentence.
        assert_eq!(chunks.join(" "), text);
    }

    #[test]
    fn oversized_sentence_is_kept_whole() {
        let long = "word ".repeat(200).trim_end().to_string() + ".";
        let text = format!("Short one. {long}");
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].len() > 100);
    }

    #[test]
    fn abbreviation_without_space_does_not_split() {
        let text = "a".repeat(400) + " ver1.2 is out. " + &"b".repeat(200);
        let chunks = chunk_text(&text, 500);
        // "1.2" has no space after the dot; only the sentence end splits.
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains("ver1.2"));
    }

    #[tokio::test]
    async fn queue_preserves_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(FakeSynth::new());
        let queue = SpeechQueue::start(
            Arc::clone(&synth) as Arc<dyn SynthesisEngine>,
            test_sink(&dir),
        );

        let a = queue.enqueue("am_eric", "first", 1.0);
        let b = queue.enqueue("am_eric", "second", 1.0);
        let c = queue.enqueue("am_eric", "third", 1.0);

        for rx in [a, b, c] {
            let outcome = rx.await.unwrap();
            assert!(matches!(outcome, SpeakOutcome::Played { .. }), "{outcome:?}");
        }

        let texts: Vec<String> = synth.calls().into_iter().map(|c| c.1).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn synthesis_failure_aborts_only_that_request() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(FakeSynth::new());
        let queue = SpeechQueue::start(
            Arc::clone(&synth) as Arc<dyn SynthesisEngine>,
            test_sink(&dir),
        );

        // Empty text makes the engine error.
        let bad = queue.enqueue("am_eric", "", 1.0);
        let good = queue.enqueue("am_eric", "still alive", 1.0);

        assert!(matches!(bad.await.unwrap(), SpeakOutcome::Failed(_)));
        assert!(matches!(good.await.unwrap(), SpeakOutcome::Played { .. }));
    }

    struct SlowSynth;

    impl SynthesisEngine for SlowSynth {
        fn synthesize(&self, _voice: &str, _text: &str, _speed: f32) -> crate::Result<Synthesis> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Synthesis {
                samples: vec![0.0; 240],
                sample_rate: 24_000,
            })
        }

        fn model_name(&self) -> String {
            "slow".to_string()
        }
    }

    #[tokio::test]
    async fn stop_drains_queued_requests() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpeechQueue::start(Arc::new(SlowSynth), test_sink(&dir));

        let first = queue.enqueue("am_eric", "one", 1.0);
        let second = queue.enqueue("am_eric", "two", 1.0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.stop();

        assert!(matches!(first.await.unwrap(), SpeakOutcome::Cancelled));
        assert!(matches!(second.await.unwrap(), SpeakOutcome::Cancelled));
    }
}
