//! Server state and lifecycle.
//!
//! One `ServerState` value owns everything process-global: the engine set,
//! the voice and session registries, the mute flag, the speech queue, the
//! mic arbiter, and the wake listener handle. The JSON-RPC dispatcher, the
//! HTTP side-channel, and the background sweep all hold the same `Arc` and
//! go through these methods, which is what keeps the mic and queue
//! invariants process-wide.

mod http;
mod rpc;
pub mod tools;

pub use http::serve as serve_http;
pub use rpc::{McpServer, ToolDefinition};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::audio::{AudioLock, AudioSink, MicFrames, CAPTURE_SAMPLE_RATE, VAD_FRAME_LEN};
use crate::config::{audio_lock_path, sessions_path, Config};
use crate::engines::{confidence, EngineSet};
use crate::listen::{
    capture_utterance, CancelToken, CaptureEnd, ListenOutcome, ListenParams, MicArbiter,
};
use crate::registry::{SessionEntry, SessionStore, VoiceRegistry};
use crate::speech::SpeechQueue;
use crate::wake::{WakeDeps, WakeListener};
use crate::{Error, Result};

/// Seconds between stale-session sweeps and registry saves
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A session whose HTTP side-channel has been silent this long is stale
/// even if its process is alive.
const ORPHAN_THRESHOLD: Duration = Duration::from_secs(300);

/// How long a listen waits for the wake worker to hand over the mic
const YIELD_WAIT: Duration = Duration::from_millis(500);

/// Process-global server state
pub struct ServerState {
    pub config: RwLock<Config>,
    pub config_path: PathBuf,
    pub engines: EngineSet,
    pub voices: Mutex<VoiceRegistry>,
    pub store: SessionStore,
    pub session: RwLock<SessionEntry>,
    pub muted: AtomicBool,
    pub speech: Option<SpeechQueue>,
    pub sink: Arc<AudioSink>,
    pub arbiter: MicArbiter,
    listen_cancel: Mutex<Option<CancelToken>>,
    pub wake: Mutex<Option<WakeListener>>,
    pub started: Instant,
    /// First-failure timestamps for sibling HTTP pings, by pid
    unresponsive: Mutex<HashMap<u32, Instant>>,
}

impl ServerState {
    /// Construct the state and register this process in the session
    /// registry.
    ///
    /// # Errors
    ///
    /// Fatal when registration fails (the process cannot operate without
    /// an identity) or when both TTS and STT are unavailable.
    pub fn init(config: Config, config_path: PathBuf, engines: EngineSet) -> Result<Arc<Self>> {
        if engines.tts.is_none() && engines.stt.is_none() {
            return Err(Error::Config(format!(
                "both TTS and STT failed to load (tts model: {}, stt model: {})",
                config.tts.model_path.display(),
                config.stt.model_path.display()
            )));
        }

        let store = SessionStore::new(sessions_path());
        let preferred = config
            .last_voice_name
            .clone()
            .unwrap_or_else(|| config.main_agent.clone());
        let tmux = std::env::var("CHORUS_TMUX").ok();
        let entry = store.register(
            &preferred,
            &config.tts.default_voice,
            config.http_port,
            std::process::id(),
            tmux,
        )?;

        let sink = Arc::new(AudioSink::new(
            &config.tts.audio_player,
            AudioLock::new(audio_lock_path()),
        ));
        let speech = engines
            .tts
            .clone()
            .map(|tts| SpeechQueue::start(tts, Arc::clone(&sink)));

        let mut voices = VoiceRegistry::new(&config.voice_registry);
        // The session identity always has a binding.
        let _ = voices.set(&entry.name, &entry.voice);

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            config_path,
            engines,
            voices: Mutex::new(voices),
            store,
            session: RwLock::new(entry),
            muted: AtomicBool::new(false),
            speech,
            sink,
            arbiter: MicArbiter::new(),
            listen_cancel: Mutex::new(None),
            wake: Mutex::new(None),
            started: Instant::now(),
            unresponsive: Mutex::new(HashMap::new()),
        }))
    }

    /// Test constructor: fake engines, temp state, no session file sharing.
    #[doc(hidden)]
    pub fn for_tests(
        config: Config,
        config_path: PathBuf,
        sessions_file: PathBuf,
        engines: EngineSet,
        sink: Arc<AudioSink>,
    ) -> Result<Arc<Self>> {
        let store = SessionStore::new(sessions_file);
        let preferred = config
            .last_voice_name
            .clone()
            .unwrap_or_else(|| config.main_agent.clone());
        let entry = store.register(
            &preferred,
            &config.tts.default_voice,
            config.http_port,
            std::process::id(),
            None,
        )?;

        let speech = engines
            .tts
            .clone()
            .map(|tts| SpeechQueue::start(tts, Arc::clone(&sink)));

        let mut voices = VoiceRegistry::new(&config.voice_registry);
        let _ = voices.set(&entry.name, &entry.voice);

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            config_path,
            engines,
            voices: Mutex::new(voices),
            store,
            session: RwLock::new(entry),
            muted: AtomicBool::new(false),
            speech,
            sink,
            arbiter: MicArbiter::new(),
            listen_cancel: Mutex::new(None),
            wake: Mutex::new(None),
            started: Instant::now(),
            unresponsive: Mutex::new(HashMap::new()),
        }))
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Our current registry entry
    #[must_use]
    pub fn session_entry(&self) -> SessionEntry {
        lock_read(&self.session).clone()
    }

    /// Cancel the in-flight listen, if any. Returns true when a token was
    /// tripped.
    pub fn cancel_listen(&self) -> bool {
        let slot = lock(&self.listen_cancel);
        if let Some(token) = slot.as_ref() {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Full listen pipeline: mute check, mic arbitration, wake yield,
    /// ready cue, VAD-gated capture, transcription.
    pub async fn listen(
        self: &Arc<Self>,
        params: ListenParams,
        play_cue: bool,
        prompt: Option<&str>,
    ) -> ListenOutcome {
        if self.engines.stt.is_none() {
            return ListenOutcome::Failed("STT engine not loaded".to_string());
        }
        let Some(detector) = self.engines.vad.clone() else {
            return ListenOutcome::Failed("VAD not loaded".to_string());
        };
        if self.is_muted() {
            return ListenOutcome::Muted;
        }

        let token = CancelToken::new();
        {
            let mut slot = lock(&self.listen_cancel);
            if slot.is_some() {
                return ListenOutcome::MicBusy;
            }
            *slot = Some(token.clone());
        }

        if let Some(prompt) = prompt {
            tracing::info!(prompt, "listening");
        }

        // The wake worker holds the mic while listening; ask it to step
        // aside before taking the arbiter.
        let yielded = {
            let wake = lock(&self.wake);
            match wake.as_ref() {
                Some(listener) if listener.is_listening() => {
                    listener.request_yield();
                    true
                }
                _ => false,
            }
        };

        let outcome = self.listen_inner(&detector, &params, play_cue, &token).await;

        if yielded {
            let wake = lock(&self.wake);
            if let Some(listener) = wake.as_ref() {
                listener.release();
            }
        }
        *lock(&self.listen_cancel) = None;
        outcome
    }

    async fn listen_inner(
        self: &Arc<Self>,
        detector: &crate::engines::SharedDetector,
        params: &ListenParams,
        play_cue: bool,
        token: &CancelToken,
    ) -> ListenOutcome {
        let state = Arc::clone(self);
        let detector = Arc::clone(detector);
        let params = params.clone();
        let token = token.clone();

        let captured = tokio::task::spawn_blocking(
            move || -> Result<Option<(CaptureEnd, Instant)>> {
            let Some(_guard) = state.arbiter.acquire_listen(YIELD_WAIT) else {
                return Ok(None);
            };

            if play_cue {
                if let Some(sound) = crate::wake::resolve_ready_sound(
                    &lock_read(&state.config).wake_word.ready_sound,
                ) {
                    state.sink.play_cue(&sound);
                }
            }

            let start = Instant::now();
            let mut source = MicFrames::open(VAD_FRAME_LEN)?;
            let mut detector = detector
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let end = capture_utterance(
                &mut source,
                &mut **detector,
                &params,
                &token,
                CAPTURE_SAMPLE_RATE,
            )?;
            Ok(Some((end, start)))
        },
        )
        .await;

        let (end, start) = match captured {
            Ok(Ok(Some(pair))) => pair,
            Ok(Ok(None)) => return ListenOutcome::MicBusy,
            Ok(Err(e)) => return ListenOutcome::Failed(e.to_string()),
            Err(e) => return ListenOutcome::Failed(format!("capture panicked: {e}")),
        };

        let audio = match end {
            CaptureEnd::Audio(audio) if !audio.is_empty() => audio,
            CaptureEnd::Audio(_) | CaptureEnd::Timeout => return ListenOutcome::Timeout,
            CaptureEnd::Cancelled => return ListenOutcome::Cancelled,
        };

        let Some(stt) = self.engines.stt.clone() else {
            return ListenOutcome::Failed("STT engine not loaded".to_string());
        };
        let transcribed = tokio::task::spawn_blocking(move || {
            let t0 = Instant::now();
            let result = stt.transcribe(&audio, CAPTURE_SAMPLE_RATE);
            (result, t0.elapsed().as_secs_f64() * 1000.0)
        })
        .await;

        match transcribed {
            Ok((Ok(result), transcription_ms)) => ListenOutcome::Success {
                text: result.text,
                confidence: confidence(result.avg_logprob),
                duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                transcription_ms,
            },
            Ok((Err(e), _)) => ListenOutcome::Failed(e.to_string()),
            Err(e) => ListenOutcome::Failed(format!("transcription panicked: {e}")),
        }
    }

    /// Start the wake listener if engines allow it.
    ///
    /// # Errors
    ///
    /// Returns `EngineUnavailable` when STT or VAD is missing, or when the
    /// build carries no wake model support.
    pub fn enable_wake(self: &Arc<Self>) -> Result<String> {
        let mut wake = lock(&self.wake);
        if let Some(listener) = wake.as_ref() {
            if listener.is_listening() {
                return Ok(listener.model().to_string());
            }
        }

        let Some(stt) = self.engines.stt.clone() else {
            return Err(Error::EngineUnavailable("stt"));
        };
        let Some(detector) = self.engines.vad.clone() else {
            return Err(Error::EngineUnavailable("vad"));
        };

        let config = lock_read(&self.config).clone();
        let model = config.wake_word.model.clone();
        let scorer_config = config.clone();

        let deps = WakeDeps {
            load_scorer: Box::new(move || EngineSet::load_wake_scorer(&scorer_config)),
            detector,
            transcriber: stt,
            arbiter: self.arbiter.clone(),
            sink: Arc::clone(&self.sink),
            store: self.store.clone(),
            own_pid: std::process::id(),
            model: model.clone(),
            threshold: config.wake_word.threshold,
            vad_threshold: config.stt.vad_threshold,
            silence_threshold: config.stt.silence_threshold,
            recording_timeout: config.wake_word.recording_timeout,
            no_speech_timeout: config.wake_word.no_speech_timeout,
            ready_sound: crate::wake::resolve_ready_sound(&config.wake_word.ready_sound),
        };

        if let Some(mut old) = wake.replace(WakeListener::start(deps)) {
            old.stop();
        }
        Ok(model)
    }

    /// Stop the wake listener. Returns false when it was not running.
    pub fn disable_wake(&self) -> bool {
        let mut wake = lock(&self.wake);
        match wake.take() {
            Some(mut listener) => {
                listener.stop();
                true
            }
            None => false,
        }
    }

    /// Periodic sweep: save the voice registry, reap dead sessions, and
    /// drop siblings whose HTTP side-channel has been silent past the
    /// orphan threshold. The registry lock is never held across the pings:
    /// snapshot, probe, then re-acquire to apply.
    pub async fn sweep(self: &Arc<Self>) {
        {
            let voices = lock(&self.voices).clone();
            if let Err(e) = voices.save_into(&self.config_path) {
                tracing::warn!(error = %e, "periodic registry save failed");
            }
        }

        let own_pid = std::process::id();
        let store = self.store.clone();
        let snapshot = tokio::task::spawn_blocking(move || store.snapshot(own_pid)).await;
        let sessions = match snapshot {
            Ok(Ok(sessions)) => sessions,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "sweep: cannot read session registry");
                return;
            }
            Err(_) => return,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .ok();

        let mut stale: Vec<u32> = Vec::new();
        if let Some(client) = client {
            for entry in sessions.iter().filter(|s| s.pid != own_pid) {
                let url = format!("http://127.0.0.1:{}/status", entry.port);
                let responsive = client
                    .get(&url)
                    .send()
                    .await
                    .map(|r| r.status().is_success())
                    .unwrap_or(false);

                let mut unresponsive = lock(&self.unresponsive);
                if responsive {
                    unresponsive.remove(&entry.pid);
                } else {
                    let first = unresponsive.entry(entry.pid).or_insert_with(Instant::now);
                    if first.elapsed() >= ORPHAN_THRESHOLD {
                        tracing::info!(
                            name = %entry.name,
                            pid = entry.pid,
                            "session unresponsive past orphan threshold"
                        );
                        stale.push(entry.pid);
                    }
                }
            }
        }

        let store = self.store.clone();
        let removed =
            tokio::task::spawn_blocking(move || store.sweep(own_pid, &stale)).await;
        match removed {
            Ok(Ok(n)) if n > 0 => tracing::info!(removed = n, "sweep reaped sessions"),
            Ok(Err(e)) => tracing::warn!(error = %e, "sweep failed"),
            _ => {}
        }
    }

    /// Spawn the periodic sweep loop.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                state.sweep().await;
            }
        })
    }

    /// Graceful shutdown: cancel pipelines, stop the wake worker, save the
    /// voice registry, unregister from the session registry.
    pub async fn shutdown(self: &Arc<Self>) {
        tracing::info!("shutting down");

        if let Some(queue) = &self.speech {
            queue.stop();
        }
        self.cancel_listen();
        self.disable_wake();

        {
            let voices = lock(&self.voices).clone();
            if let Err(e) = voices.save_into(&self.config_path) {
                tracing::error!(error = %e, "registry save failed on shutdown");
            }
        }

        let store = self.store.clone();
        let pid = std::process::id();
        let result = tokio::task::spawn_blocking(move || store.unregister(pid)).await;
        if let Ok(Err(e)) = result {
            tracing::error!(error = %e, "session unregister failed");
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) fn lock_read<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) fn lock_write<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
