//! Shared test utilities
//!
//! Builds a full server state on fake engines with isolated state files.
//! The playback "player" is /bin/true, so speak requests complete
//! instantly without touching audio hardware.

use std::sync::{Arc, Mutex};

use chorus::audio::{AudioLock, AudioSink};
use chorus::engines::fake::{FakeDetector, FakeSynth, FakeTranscriber};
use chorus::engines::{EngineSet, SpeechDetector};
use chorus::{Config, ServerState};

#[allow(dead_code)]
pub struct TestServer {
    pub state: Arc<ServerState>,
    pub synth: Arc<FakeSynth>,
    // Held for the lifetime of the test; dropping removes the state dir.
    pub dir: tempfile::TempDir,
}

/// Full server state on fake engines, registered in its own sessions file
#[must_use]
pub fn test_server(main_agent: &str) -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut config = Config::default();
    config.main_agent = main_agent.to_string();
    config.tts.default_voice = chorus::catalog::voice_for_name(main_agent)
        .unwrap_or("am_eric")
        .to_string();
    config.tts.audio_player = "true".to_string();

    let synth = Arc::new(FakeSynth::new());
    let synth_clone = Arc::clone(&synth);
    let tts: Arc<dyn chorus::engines::SynthesisEngine> = synth_clone;
    let engines = EngineSet {
        tts: Some(tts),
        stt: Some(Arc::new(FakeTranscriber::with_response("hello from the mic"))),
        vad: Some(Arc::new(Mutex::new(
            Box::new(FakeDetector::new()) as Box<dyn SpeechDetector>
        ))),
    };

    let sink = Arc::new(AudioSink::new(
        "true",
        AudioLock::new(dir.path().join("audio.lock")),
    ));

    let state = ServerState::for_tests(
        config,
        dir.path().join("config.json"),
        dir.path().join("sessions.json"),
        engines,
        sink,
    )
    .expect("server state");

    TestServer { state, synth, dir }
}
