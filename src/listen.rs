//! Listen pipeline: microphone ownership, cancellation, and the
//! VAD-driven capture state machine.
//!
//! The state machine itself is synchronous and generic over a frame
//! source, so the test suite drives it with scripted audio. Orchestration
//! around it (mute check, wake-word yield, ready cue, transcription) lives
//! on the server state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::audio::FrameSource;
use crate::engines::SpeechDetector;
use crate::Result;

/// Cooperative cancellation flag for one listen request.
///
/// Every cancellation source (the `stop` tool, a protocol-level cancel
/// notification, shutdown) flips the same token; the capture loop samples
/// it between frames.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Who holds the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicOwner {
    Listen,
    Wake,
}

struct ArbiterInner {
    owner: Mutex<Option<MicOwner>>,
    released: Condvar,
}

/// Non-reentrant in-process microphone ownership, arbitrating between the
/// listen pipeline and the wake-word worker.
#[derive(Clone)]
pub struct MicArbiter {
    inner: Arc<ArbiterInner>,
}

/// Exclusive hold on the microphone; released on drop
pub struct MicGuard {
    inner: Arc<ArbiterInner>,
}

impl Default for MicArbiter {
    fn default() -> Self {
        Self {
            inner: Arc::new(ArbiterInner {
                owner: Mutex::new(None),
                released: Condvar::new(),
            }),
        }
    }
}

impl MicArbiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire for the listen pipeline. Fails immediately when another
    /// listen holds the mic; waits up to `wait` for the wake worker to
    /// yield it.
    pub fn acquire_listen(&self, wait: Duration) -> Option<MicGuard> {
        let deadline = Instant::now() + wait;
        let mut owner = lock(&self.inner.owner);
        loop {
            match *owner {
                None => {
                    *owner = Some(MicOwner::Listen);
                    return Some(MicGuard {
                        inner: Arc::clone(&self.inner),
                    });
                }
                Some(MicOwner::Listen) => return None,
                Some(MicOwner::Wake) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .inner
                        .released
                        .wait_timeout(owner, deadline - now)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    owner = guard;
                }
            }
        }
    }

    /// Acquire for the wake worker, waiting up to `wait` for the mic to
    /// free up. The worker polls this so it can interleave stop checks.
    pub fn try_acquire_wake(&self, wait: Duration) -> Option<MicGuard> {
        let deadline = Instant::now() + wait;
        let mut owner = lock(&self.inner.owner);
        loop {
            if owner.is_none() {
                *owner = Some(MicOwner::Wake);
                return Some(MicGuard {
                    inner: Arc::clone(&self.inner),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .inner
                .released
                .wait_timeout(owner, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            owner = guard;
        }
    }

    /// Current owner, if any
    #[must_use]
    pub fn owner(&self) -> Option<MicOwner> {
        *lock(&self.inner.owner)
    }
}

impl Drop for MicGuard {
    fn drop(&mut self) {
        *lock(&self.inner.owner) = None;
        self.inner.released.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Parameters for one listen request
#[derive(Debug, Clone)]
pub struct ListenParams {
    /// Maximum seconds to wait for speech to begin
    pub timeout: f32,
    /// Seconds of post-speech silence that end the recording
    pub silence_threshold: f32,
    /// Speech probability at or above which a frame counts as speech
    pub vad_threshold: f32,
}

/// Result of one listen request
#[derive(Debug, Clone)]
pub enum ListenOutcome {
    Success {
        text: String,
        confidence: f32,
        duration_ms: f64,
        transcription_ms: f64,
    },
    Timeout,
    Cancelled,
    MicBusy,
    Muted,
    Failed(String),
}

/// How a capture loop ended
#[derive(Debug)]
pub enum CaptureEnd {
    /// Collected utterance audio, ready for transcription
    Audio(Vec<f32>),
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    WaitingForSpeech,
    Recording,
}

/// Drive the capture state machine until silence, timeout, or
/// cancellation.
///
/// `WaitingForSpeech`: frames are discarded (the last one is kept as
/// pre-trigger context) until the detector reports a probability at or
/// above the threshold. `Recording`: frames accumulate; once detected
/// silence totals `silence_threshold` seconds the utterance is complete.
/// The wall-clock timeout aborts while waiting and finalises while
/// recording.
///
/// # Errors
///
/// Returns error when the frame source or detector fails.
pub fn capture_utterance(
    source: &mut dyn FrameSource,
    detector: &mut dyn SpeechDetector,
    params: &ListenParams,
    cancel: &CancelToken,
    sample_rate: u32,
) -> Result<CaptureEnd> {
    detector.reset();

    let start = Instant::now();
    let mut phase = Phase::WaitingForSpeech;
    let mut audio: Vec<f32> = Vec::new();
    let mut pre_trigger: Option<Vec<f32>> = None;
    let mut silence_secs = 0.0f32;

    loop {
        if cancel.is_cancelled() {
            return Ok(CaptureEnd::Cancelled);
        }

        let elapsed = start.elapsed().as_secs_f32();
        if elapsed >= params.timeout {
            return match phase {
                Phase::WaitingForSpeech => Ok(CaptureEnd::Timeout),
                Phase::Recording => Ok(CaptureEnd::Audio(audio)),
            };
        }

        let Some(frame) = source.next_frame(Duration::from_millis(100))? else {
            continue;
        };

        let probability = detector.probability(&frame)?;
        let is_speech = probability >= params.vad_threshold;

        match phase {
            Phase::WaitingForSpeech => {
                if is_speech {
                    if let Some(context) = pre_trigger.take() {
                        audio.extend_from_slice(&context);
                    }
                    audio.extend_from_slice(&frame);
                    phase = Phase::Recording;
                    tracing::debug!(probability, "speech detected, recording");
                } else {
                    pre_trigger = Some(frame);
                }
            }
            Phase::Recording => {
                #[allow(clippy::cast_precision_loss)]
                let frame_secs = frame.len() as f32 / sample_rate as f32;
                audio.extend_from_slice(&frame);
                if is_speech {
                    silence_secs = 0.0;
                } else {
                    silence_secs += frame_secs;
                    if silence_secs >= params.silence_threshold {
                        tracing::debug!(silence_secs, "silence threshold reached");
                        return Ok(CaptureEnd::Audio(audio));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::fake::FakeDetector;

    /// Frame source that replays a script, then yields silence forever.
    struct ScriptedSource {
        frames: std::vec::IntoIter<Vec<f32>>,
    }

    impl ScriptedSource {
        fn new(frames: Vec<Vec<f32>>) -> Self {
            Self {
                frames: frames.into_iter(),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self, _timeout: Duration) -> Result<Option<Vec<f32>>> {
            Ok(Some(self.frames.next().unwrap_or_else(|| vec![0.0; 512])))
        }
    }

    fn loud_frame() -> Vec<f32> {
        vec![0.5; 512]
    }

    fn quiet_frame() -> Vec<f32> {
        vec![0.0; 512]
    }

    fn params() -> ListenParams {
        ListenParams {
            timeout: 10.0,
            silence_threshold: 0.1,
            vad_threshold: 0.3,
        }
    }

    #[test]
    fn records_speech_until_silence() {
        // 4 loud frames then silence; 0.1s of silence = ~4 quiet frames.
        let mut source = ScriptedSource::new(vec![
            quiet_frame(),
            loud_frame(),
            loud_frame(),
            loud_frame(),
            loud_frame(),
        ]);
        let mut detector = FakeDetector::new();
        let cancel = CancelToken::new();

        let end =
            capture_utterance(&mut source, &mut detector, &params(), &cancel, 16_000).unwrap();
        let CaptureEnd::Audio(audio) = end else {
            panic!("expected audio, got {end:?}");
        };
        // One pre-trigger context frame + 4 speech frames + trailing
        // silence frames.
        assert!(audio.len() >= 5 * 512);
    }

    #[test]
    fn zero_timeout_returns_timeout_immediately() {
        let mut source = ScriptedSource::new(vec![loud_frame()]);
        let mut detector = FakeDetector::new();
        let cancel = CancelToken::new();
        let mut p = params();
        p.timeout = 0.0;

        let end = capture_utterance(&mut source, &mut detector, &p, &cancel, 16_000).unwrap();
        assert!(matches!(end, CaptureEnd::Timeout));
    }

    #[test]
    fn cancel_token_aborts_capture() {
        let mut source = ScriptedSource::new(vec![]);
        let mut detector = FakeDetector::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let end =
            capture_utterance(&mut source, &mut detector, &params(), &cancel, 16_000).unwrap();
        assert!(matches!(end, CaptureEnd::Cancelled));
    }

    #[test]
    fn timeout_without_speech() {
        let mut source = ScriptedSource::new(vec![]);
        let mut detector = FakeDetector::new();
        let cancel = CancelToken::new();
        let mut p = params();
        p.timeout = 0.05;

        let end = capture_utterance(&mut source, &mut detector, &p, &cancel, 16_000).unwrap();
        assert!(matches!(end, CaptureEnd::Timeout));
    }

    #[test]
    fn arbiter_rejects_second_listen() {
        let arbiter = MicArbiter::new();
        let guard = arbiter.acquire_listen(Duration::from_millis(10)).unwrap();
        assert_eq!(arbiter.owner(), Some(MicOwner::Listen));

        assert!(arbiter.acquire_listen(Duration::from_millis(10)).is_none());
        drop(guard);
        assert!(arbiter.acquire_listen(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn arbiter_listen_waits_for_wake_release() {
        let arbiter = MicArbiter::new();
        let wake_guard = arbiter.try_acquire_wake(Duration::from_millis(10)).unwrap();
        assert_eq!(arbiter.owner(), Some(MicOwner::Wake));

        let arbiter2 = arbiter.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(wake_guard);
        });

        // Bounded wait spans the wake worker's release.
        let guard = arbiter.acquire_listen(Duration::from_millis(500));
        assert!(guard.is_some());
        assert_eq!(arbiter2.owner(), Some(MicOwner::Listen));
        handle.join().unwrap();
    }

    #[test]
    fn mic_guard_releases_on_drop() {
        let arbiter = MicArbiter::new();
        {
            let _guard = arbiter.try_acquire_wake(Duration::from_millis(10)).unwrap();
        }
        assert_eq!(arbiter.owner(), None);
    }
}
