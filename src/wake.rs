//! Wake-word listener.
//!
//! A dedicated OS thread owns an int16 capture stream while it holds the
//! mic arbiter, scores 80 ms frames against the wake phrase model, and on
//! trigger records an utterance, transcribes it, and routes the text to a
//! live session's HTTP side-channel. The listen pipeline can demand the
//! mic at any time by raising the yield flag; the worker parks in
//! `Yielded` with no stream open until released.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::audio::{AudioSink, MicFrames, MicFramesI16, FrameSource, CAPTURE_SAMPLE_RATE,
    VAD_FRAME_LEN, WAKE_FRAME_LEN};
use crate::engines::{SharedDetector, TranscriptionEngine, WakeScorer};
use crate::listen::{MicArbiter, MicGuard};
use crate::registry::{SessionEntry, SessionStore};
use crate::Result;

/// Worker states, observable through the `status` tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeState {
    Disabled,
    Listening,
    Recording,
    Injecting,
    Yielded,
}

impl WakeState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Listening => "listening",
            Self::Recording => "recording",
            Self::Injecting => "injecting",
            Self::Yielded => "yielded",
        }
    }
}

/// Everything the worker thread needs; engines come in as trait objects so
/// the test suite can run the routing logic without hardware.
pub struct WakeDeps {
    /// Lazily builds the phrase scorer on the worker thread; the model is
    /// not loaded until the first `Listening` entry.
    pub load_scorer: Box<dyn FnOnce() -> Result<Box<dyn WakeScorer>> + Send>,
    pub detector: SharedDetector,
    pub transcriber: Arc<dyn TranscriptionEngine>,
    pub arbiter: MicArbiter,
    pub sink: Arc<AudioSink>,
    pub store: SessionStore,
    pub own_pid: u32,
    pub model: String,
    pub threshold: f32,
    pub vad_threshold: f32,
    pub silence_threshold: f32,
    pub recording_timeout: f32,
    pub no_speech_timeout: f32,
    pub ready_sound: Option<PathBuf>,
}

struct Shared {
    state: Mutex<WakeState>,
    changed: Condvar,
    yield_requested: AtomicBool,
    stop: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: WakeState) {
        *lock(&self.state) = state;
        self.changed.notify_all();
    }
}

/// Handle to a running wake-word worker
pub struct WakeListener {
    shared: Arc<Shared>,
    model: String,
    handle: Option<JoinHandle<()>>,
}

impl WakeListener {
    /// Spawn the worker thread.
    #[must_use]
    pub fn start(deps: WakeDeps) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(WakeState::Disabled),
            changed: Condvar::new(),
            yield_requested: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });
        let model = deps.model.clone();

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("wake-listener".to_string())
            .spawn(move || run_worker(&thread_shared, deps))
            .ok();
        if handle.is_none() {
            tracing::error!("failed to spawn wake listener thread");
        }

        Self {
            shared,
            model,
            handle,
        }
    }

    /// Ask the worker to release the mic and wait (bounded) until it has.
    pub fn request_yield(&self) {
        if self.state() != WakeState::Listening {
            return;
        }
        self.shared.yield_requested.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + Duration::from_millis(500);
        let mut state = lock(&self.shared.state);
        while *state != WakeState::Yielded && *state != WakeState::Disabled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = guard;
        }
        tracing::debug!("wake listener yielded mic");
    }

    /// Let the worker reclaim the mic after a listen finished.
    pub fn release(&self) {
        self.shared.yield_requested.store(false, Ordering::SeqCst);
        self.shared.changed.notify_all();
        tracing::debug!("wake listener reclaiming mic");
    }

    /// Stop the worker and join its thread.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.changed.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.shared.set_state(WakeState::Disabled);
        tracing::info!("wake word listener stopped");
    }

    #[must_use]
    pub fn state(&self) -> WakeState {
        *lock(&self.shared.state)
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state() == WakeState::Listening
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Drop for WakeListener {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.changed.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn run_worker(shared: &Shared, deps: WakeDeps) {
    let WakeDeps {
        load_scorer,
        detector,
        transcriber,
        arbiter,
        sink,
        store,
        own_pid,
        model,
        threshold,
        vad_threshold,
        silence_threshold,
        recording_timeout,
        no_speech_timeout,
        ready_sound,
    } = deps;

    let mut scorer = match load_scorer() {
        Ok(scorer) => scorer,
        Err(e) => {
            tracing::error!(error = %e, model = %model, "wake model load failed");
            shared.set_state(WakeState::Disabled);
            return;
        }
    };
    tracing::info!(model = %model, "wake word listener started");

    while !shared.stop.load(Ordering::SeqCst) {
        if shared.yield_requested.load(Ordering::SeqCst) {
            shared.set_state(WakeState::Yielded);
            while shared.yield_requested.load(Ordering::SeqCst)
                && !shared.stop.load(Ordering::SeqCst)
            {
                std::thread::sleep(Duration::from_millis(50));
            }
            continue;
        }

        // The mic is shared with the listen pipeline; keep trying briefly
        // so stop and yield stay responsive.
        let Some(guard) = arbiter.try_acquire_wake(Duration::from_millis(200)) else {
            continue;
        };

        let mut frames = match MicFramesI16::open(WAKE_FRAME_LEN) {
            Ok(frames) => frames,
            Err(e) => {
                drop(guard);
                tracing::error!(error = %e, "cannot open mic for wake detection");
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        };
        shared.set_state(WakeState::Listening);

        let mut detected = false;
        while !shared.stop.load(Ordering::SeqCst)
            && !shared.yield_requested.load(Ordering::SeqCst)
        {
            let Some(frame) = frames.next_frame(Duration::from_millis(200)) else {
                continue;
            };
            match scorer.scores(&frame) {
                Ok(scores) => {
                    if let Some((name, score)) =
                        scores.iter().find(|(_, score)| *score >= threshold)
                    {
                        tracing::info!(model = %name, score = *score, "wake word detected");
                        detected = true;
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "wake scoring failed");
                    shared.set_state(WakeState::Disabled);
                    return;
                }
            }
        }

        if !detected {
            // Yield request or shutdown; release everything and loop.
            frames.drain_pending();
            drop(frames);
            drop(guard);
            continue;
        }

        // Discard audio captured while the phrase was spoken so it never
        // reaches the transcriber.
        frames.drain_pending();
        drop(frames);

        shared.set_state(WakeState::Recording);
        let audio = record_after_wake(
            &detector,
            &sink,
            ready_sound.as_deref(),
            vad_threshold,
            silence_threshold,
            recording_timeout,
            no_speech_timeout,
            &guard,
        );
        drop(guard);

        let Some(audio) = audio else {
            continue;
        };

        #[allow(clippy::cast_precision_loss)]
        let seconds = audio.len() as f32 / CAPTURE_SAMPLE_RATE as f32;
        tracing::info!(seconds, "transcribing wake utterance");

        let text = match transcriber.transcribe(&audio, CAPTURE_SAMPLE_RATE) {
            Ok(result) => result.text.trim().to_string(),
            Err(e) => {
                tracing::error!(error = %e, "wake transcription failed");
                continue;
            }
        };
        if text.is_empty() {
            tracing::info!("empty wake transcription");
            continue;
        }

        shared.set_state(WakeState::Injecting);
        match store.snapshot(own_pid) {
            Ok(sessions) => deliver(&sessions, &text),
            Err(e) => tracing::warn!(error = %e, "cannot read session registry for routing"),
        }
    }

    shared.set_state(WakeState::Disabled);
}

/// Record the utterance that follows a wake phrase. Returns `None` when no
/// speech arrived in time or the mic could not be reopened.
#[allow(clippy::too_many_arguments)]
fn record_after_wake(
    detector: &SharedDetector,
    sink: &AudioSink,
    ready_sound: Option<&std::path::Path>,
    vad_threshold: f32,
    silence_threshold: f32,
    recording_timeout: f32,
    no_speech_timeout: f32,
    _mic: &MicGuard,
) -> Option<Vec<f32>> {
    // Let the input device settle after the int16 stream closed.
    std::thread::sleep(Duration::from_millis(150));

    if let Some(sound) = ready_sound {
        sink.play_cue(sound);
    }

    let mut frames = None;
    for attempt in 1..=3 {
        match MicFrames::open(VAD_FRAME_LEN) {
            Ok(f) => {
                frames = Some(f);
                break;
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "mic open failed");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
    let mut frames = frames?;

    let mut detector = lock(detector);
    detector.reset();

    let start = Instant::now();
    let mut audio: Vec<f32> = Vec::new();
    let mut speech_detected = false;
    let mut silence_secs = 0.0f32;

    loop {
        let elapsed = start.elapsed().as_secs_f32();
        if elapsed >= recording_timeout {
            tracing::info!("wake recording timeout reached");
            break;
        }
        if !speech_detected && elapsed >= no_speech_timeout {
            tracing::info!("no speech after wake word");
            return None;
        }

        let frame = match frames.next_frame(Duration::from_millis(100)) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(error = %e, "wake capture failed");
                return None;
            }
        };

        #[allow(clippy::cast_precision_loss)]
        let frame_secs = frame.len() as f32 / CAPTURE_SAMPLE_RATE as f32;
        audio.extend_from_slice(&frame);

        let is_speech = detector
            .probability(&frame)
            .map(|p| p >= vad_threshold)
            .unwrap_or(false);
        if is_speech {
            speech_detected = true;
            silence_secs = 0.0;
        } else if speech_detected {
            silence_secs += frame_secs;
            if silence_secs >= silence_threshold {
                break;
            }
        }
    }

    if speech_detected && !audio.is_empty() {
        Some(audio)
    } else {
        None
    }
}

/// Resolve a configured ready-cue name to a playable file. `"tink"` maps
/// to the stock macOS sound (no bundled sound on Linux yet); anything else
/// is treated as a path.
#[must_use]
pub fn resolve_ready_sound(sound: &str) -> Option<PathBuf> {
    if sound.is_empty() {
        return None;
    }
    if sound == "tink" {
        let tink = PathBuf::from("/System/Library/Sounds/Tink.aiff");
        return tink.exists().then_some(tink);
    }
    let path = PathBuf::from(sound);
    path.exists().then_some(path)
}

/// Pick the target session and the message to deliver.
///
/// With one candidate, everything routes there. With several, the first
/// word (stripped of trailing punctuation) selects a session by name
/// case-insensitively and is removed from the message; otherwise the most
/// recently started session receives the whole text.
#[must_use]
pub fn route_target<'a>(
    sessions: &'a [SessionEntry],
    text: &str,
) -> Option<(&'a SessionEntry, String)> {
    let candidates: Vec<&SessionEntry> = sessions
        .iter()
        .filter(|s| s.tmux_session.is_some())
        .collect();

    let (target, message) = match candidates.as_slice() {
        [] => return None,
        [only] => (*only, text.to_string()),
        many => {
            let mut parts = text.splitn(2, char::is_whitespace);
            let first = parts.next().unwrap_or("").trim_matches(['.', ',', '!', '?', ':']);
            let rest = parts.next().unwrap_or("");

            match many
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(first))
            {
                Some(session) => (*session, rest.to_string()),
                None => {
                    let latest = many.iter().max_by_key(|s| s.started_at)?;
                    (*latest, text.to_string())
                }
            }
        }
    };

    if message.trim().is_empty() {
        tracing::info!("empty message after name parsing, skipping injection");
        return None;
    }
    Some((target, message))
}

/// POST the text to the target session's side-channel, which injects it
/// into that session's terminal.
fn deliver(sessions: &[SessionEntry], text: &str) {
    let Some((target, message)) = route_target(sessions, text) else {
        tracing::warn!("no session available for wake text");
        return;
    };

    let url = format!("http://127.0.0.1:{}/inject", target.port);
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "cannot build http client");
            return;
        }
    };

    match client
        .post(&url)
        .json(&serde_json::json!({ "text": message }))
        .send()
    {
        Ok(response) if response.status().is_success() => {
            tracing::info!(target = %target.name, port = target.port, "wake text delivered");
        }
        Ok(response) => {
            tracing::warn!(target = %target.name, status = %response.status(), "wake delivery rejected");
        }
        Err(e) => {
            tracing::warn!(target = %target.name, error = %e, "wake delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(name: &str, port: u16, tmux: Option<&str>, started_secs: i64) -> SessionEntry {
        SessionEntry {
            name: name.to_string(),
            voice: "am_eric".to_string(),
            port,
            pid: 1000 + u32::from(port),
            session_id: None,
            tmux_session: tmux.map(str::to_string),
            started_at: Utc.timestamp_opt(started_secs, 0).unwrap(),
        }
    }

    #[test]
    fn single_session_gets_everything() {
        let sessions = vec![entry("Eric", 7865, Some("dev"), 100)];
        let (target, message) = route_target(&sessions, "Eric hello there").unwrap();
        assert_eq!(target.port, 7865);
        assert_eq!(message, "Eric hello there");
    }

    #[test]
    fn first_word_selects_named_session() {
        let sessions = vec![
            entry("Eric", 7865, Some("dev"), 100),
            entry("Adam", 7866, Some("ops"), 200),
        ];
        let (target, message) = route_target(&sessions, "adam, restart the build").unwrap();
        assert_eq!(target.name, "Adam");
        assert_eq!(message, "restart the build");
    }

    #[test]
    fn unmatched_first_word_routes_to_most_recent() {
        let sessions = vec![
            entry("Eric", 7865, Some("dev"), 100),
            entry("Adam", 7866, Some("ops"), 200),
        ];
        let (target, message) = route_target(&sessions, "please run the tests").unwrap();
        assert_eq!(target.name, "Adam");
        assert_eq!(message, "please run the tests");
    }

    #[test]
    fn sessions_without_tmux_are_skipped() {
        let sessions = vec![
            entry("Eric", 7865, None, 100),
            entry("Adam", 7866, Some("ops"), 50),
        ];
        let (target, _) = route_target(&sessions, "Eric do something").unwrap();
        assert_eq!(target.name, "Adam");
    }

    #[test]
    fn empty_remainder_after_name_skips_injection() {
        let sessions = vec![
            entry("Eric", 7865, Some("dev"), 100),
            entry("Adam", 7866, Some("ops"), 200),
        ];
        assert!(route_target(&sessions, "Adam").is_none());
    }

    #[test]
    fn no_candidates_yields_none() {
        let sessions = vec![entry("Eric", 7865, None, 100)];
        assert!(route_target(&sessions, "hello").is_none());
    }

    #[test]
    fn wake_state_strings() {
        assert_eq!(WakeState::Disabled.as_str(), "disabled");
        assert_eq!(WakeState::Yielded.as_str(), "yielded");
    }
}
