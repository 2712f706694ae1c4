//! Tool-level integration tests on fake engines.
//!
//! No audio hardware: playback runs through /bin/true and the engines are
//! the deterministic fakes.

mod common;

use common::test_server;
use serde_json::{json, Value};

use chorus::server::tools;

fn is_true(value: &Value, key: &str) -> bool {
    value.get(key) == Some(&Value::Bool(true))
}

#[tokio::test]
async fn fresh_start_claims_main_agent_identity() {
    let server = test_server("Eric");
    let entry = server.state.session_entry();
    assert_eq!(entry.name, "Eric");
    assert_eq!(entry.voice, "am_eric");
    assert_eq!(entry.port, 7865);

    let status = tools::status(&server.state);
    assert_eq!(status["session"]["name"], "Eric");
    assert_eq!(status["session"]["voice"], "am_eric");
    assert_eq!(status["session"]["port"], 7865);
    assert!(is_true(&status["tts"], "loaded"));
    assert!(is_true(&status["stt"], "loaded"));
    assert!(is_true(&status["vad"], "loaded"));
    assert_eq!(status["muted"], Value::Bool(false));
}

#[tokio::test]
async fn speak_blocks_until_played_and_reports_timings() {
    let server = test_server("Eric");
    let result = tools::speak(
        &server.state,
        &json!({ "name": "Eric", "text": "Hello there.", "block": true }),
    )
    .await;

    assert!(is_true(&result, "success"), "{result}");
    assert_eq!(result["voice"], "am_eric");
    assert_eq!(result["auto_assigned"], Value::Bool(false));
    assert!(result["duration_ms"].as_f64().is_some());
    assert!(result["synthesis_ms"].as_f64().is_some());

    let calls = server.synth.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, "Hello there.");
}

#[tokio::test]
async fn speak_nonblocking_returns_queued() {
    let server = test_server("Eric");
    let result = tools::speak(
        &server.state,
        &json!({ "name": "Eric", "text": "later", "block": false }),
    )
    .await;

    assert!(is_true(&result, "success"));
    assert!(is_true(&result, "queued"));
}

#[tokio::test]
async fn speak_auto_assigns_unknown_agent() {
    let server = test_server("Eric");
    let result = tools::speak(
        &server.state,
        &json!({ "name": "Nova", "text": "hi", "block": true }),
    )
    .await;

    assert!(is_true(&result, "success"), "{result}");
    assert_eq!(result["voice"], "af_nova");
    assert_eq!(result["auto_assigned"], Value::Bool(true));
}

#[tokio::test]
async fn speak_for_name_held_by_other_session_is_refused() {
    let server = test_server("Eric");

    // A second live session (a real child process) holds "Adam".
    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    server
        .state
        .store
        .register("Adam", "am_adam", 7865, child.id(), None)
        .unwrap();

    let result = tools::speak(
        &server.state,
        &json!({ "name": "Adam", "text": "borrowed voice", "block": true }),
    )
    .await;
    let _ = child.kill();
    let _ = child.wait();

    assert_eq!(result["success"], Value::Bool(false));
    assert_eq!(result["error"], "name_occupied");
    assert_eq!(result["session_name"], "Eric");
    assert_eq!(result["session_voice"], "am_eric");
}

#[tokio::test]
async fn mute_is_idempotent_and_silences_speak() {
    let server = test_server("Eric");

    let first = tools::dispatch(&server.state, "mute", &json!({})).await.unwrap();
    let second = tools::dispatch(&server.state, "mute", &json!({})).await.unwrap();
    assert_eq!(first["muted"], Value::Bool(true));
    assert_eq!(second["muted"], Value::Bool(true));

    // Speak reports success but synthesizes nothing.
    let spoken = tools::speak(
        &server.state,
        &json!({ "name": "Eric", "text": "quiet please", "block": true }),
    )
    .await;
    assert!(is_true(&spoken, "success"));
    assert!(is_true(&spoken, "muted"));
    assert!(server.synth.calls().is_empty());

    let unmuted = tools::dispatch(&server.state, "unmute", &json!({})).await.unwrap();
    assert_eq!(unmuted["muted"], Value::Bool(false));
}

#[tokio::test]
async fn set_voice_updates_registry_and_session() {
    let server = test_server("Eric");
    let result = tools::set_voice(
        &server.state,
        &json!({ "name": "Captain", "voice": "bm_daniel" }),
    )
    .await;

    assert!(is_true(&result, "success"), "{result}");
    assert_eq!(result["name"], "Captain");
    assert_eq!(result["voice"], "bm_daniel");
    assert_eq!(result["previous_name"], "Eric");

    let registry = tools::get_voice_registry(&server.state);
    assert_eq!(registry["registry"]["Captain"], "bm_daniel");
    assert!(!registry["available_pool"]
        .as_array()
        .unwrap()
        .iter()
        .any(|v| v == "bm_daniel"));

    // The session entry follows the rename.
    let entry = server.state.session_entry();
    assert_eq!(entry.name, "Captain");
    assert_eq!(entry.voice, "bm_daniel");

    // The explicit choice persists for the next restart.
    let config = chorus::Config::load(&server.dir.path().join("config.json"));
    assert_eq!(config.last_voice_name.as_deref(), Some("Captain"));
}

#[tokio::test]
async fn set_voice_rejects_unknown_voice() {
    let server = test_server("Eric");
    let result = tools::set_voice(
        &server.state,
        &json!({ "name": "Eric", "voice": "xx_nobody" }),
    )
    .await;

    assert_eq!(result["success"], Value::Bool(false));
    assert_eq!(result["error"], "invalid_voice");
}

#[tokio::test]
async fn set_voice_rejects_name_of_live_session() {
    let server = test_server("Eric");

    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    server
        .state
        .store
        .register("Nova", "af_nova", 7865, child.id(), None)
        .unwrap();

    let result = tools::set_voice(
        &server.state,
        &json!({ "name": "Nova", "voice": "af_nova" }),
    )
    .await;
    let _ = child.kill();
    let _ = child.wait();

    assert_eq!(result["error"], "name_occupied");
    assert_eq!(result["session_name"], "Eric");
}

#[tokio::test]
async fn list_voices_returns_full_catalogue() {
    let result = tools::list_voices();
    let voices = result["voices"].as_array().unwrap();
    assert_eq!(voices.len(), chorus::catalog::VOICES.len());
    assert!(voices.iter().any(|v| v["id"] == "am_eric"));
    assert_eq!(result["total"], voices.len());
}

#[tokio::test]
async fn stop_without_activity_reports_nothing_stopped() {
    let server = test_server("Eric");
    let result = tools::stop(&server.state);
    assert!(is_true(&result, "success"));
    assert_eq!(result["stopped_playback"], Value::Bool(false));
    assert_eq!(result["cancelled_listen"], Value::Bool(false));
}

#[tokio::test]
async fn listen_while_muted_fails_fast() {
    let server = test_server("Eric");
    tools::dispatch(&server.state, "mute", &json!({})).await.unwrap();

    let result = tools::listen(&server.state, &json!({ "timeout": 1.0 }), false).await;
    assert_eq!(result["error"], "muted");
}

#[tokio::test]
async fn wake_disable_when_not_running() {
    let server = test_server("Eric");
    let result = tools::wake_disable(&server.state);
    assert!(is_true(&result, "success"));
    assert_eq!(result["listening"], Value::Bool(false));
    assert!(is_true(&result, "was_disabled"));
}

#[tokio::test]
async fn unknown_tool_dispatches_to_none() {
    let server = test_server("Eric");
    assert!(tools::dispatch(&server.state, "no_such_tool", &json!({}))
        .await
        .is_none());
}

#[tokio::test]
async fn status_counts_registry_and_queue() {
    let server = test_server("Eric");
    tools::speak(&server.state, &json!({ "name": "Nova", "text": "x", "block": true })).await;

    let status = tools::status(&server.state);
    // "Eric" (session) + "Nova"
    assert_eq!(status["registry_size"], 2);
    assert_eq!(status["queue_depth"], 0);
    assert!(status["uptime_s"].as_u64().is_some());
}
