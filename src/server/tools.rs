//! Tool surface: argument parsing, pipeline invocation, and the JSON
//! response shapes callers see.
//!
//! Every known domain failure is reported as a structured
//! `{ success: false, error: <kind>, message }` value; the transport layer
//! never turns one into a bare protocol error.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};

use super::{lock, lock_read, lock_write, ServerState, ToolDefinition};
use crate::catalog;
use crate::listen::{ListenOutcome, ListenParams};
use crate::speech::SpeakOutcome;
use crate::Error;

/// Round milliseconds to one decimal for response payloads
fn ms(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Definitions for `tools/list`
#[must_use]
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "speak".to_string(),
            description: "Synthesize and play speech for a named agent".to_string(),
            input_schema: schema(
                json!({
                    "name": { "type": "string", "description": "Agent name, maps to a voice via the registry" },
                    "text": { "type": "string", "description": "Text to speak" },
                    "speed": { "type": "number", "description": "Speed multiplier (default 1.0)" },
                    "block": { "type": "boolean", "description": "Wait for playback to finish (default true)" },
                }),
                &["name", "text"],
            ),
        },
        ToolDefinition {
            name: "listen".to_string(),
            description: "Record speech from the microphone and return the transcription"
                .to_string(),
            input_schema: schema(
                json!({
                    "timeout": { "type": "number", "description": "Max seconds to wait for speech (default 15)" },
                    "silence_threshold": { "type": "number", "description": "Seconds of silence that end the recording (default 1.5)" },
                    "prompt": { "type": "string", "description": "Optional context for what is being asked" },
                }),
                &[],
            ),
        },
        ToolDefinition {
            name: "speak_then_listen".to_string(),
            description: "Speak a question and immediately listen for the answer".to_string(),
            input_schema: schema(
                json!({
                    "name": { "type": "string" },
                    "text": { "type": "string" },
                    "speed": { "type": "number" },
                    "timeout": { "type": "number" },
                    "silence_threshold": { "type": "number" },
                }),
                &["name", "text"],
            ),
        },
        ToolDefinition {
            name: "set_voice".to_string(),
            description: "Assign a specific catalogue voice to an agent name".to_string(),
            input_schema: schema(
                json!({
                    "name": { "type": "string" },
                    "voice": { "type": "string", "description": "Catalogue voice id, e.g. am_eric" },
                }),
                &["name", "voice"],
            ),
        },
        ToolDefinition {
            name: "get_voice_registry".to_string(),
            description: "Current agent-to-voice assignments and the free pool".to_string(),
            input_schema: schema(json!({}), &[]),
        },
        ToolDefinition {
            name: "list_voices".to_string(),
            description: "List all catalogue voices".to_string(),
            input_schema: schema(json!({}), &[]),
        },
        ToolDefinition {
            name: "mute".to_string(),
            description: "Silence all voice output".to_string(),
            input_schema: schema(json!({}), &[]),
        },
        ToolDefinition {
            name: "unmute".to_string(),
            description: "Resume voice output".to_string(),
            input_schema: schema(json!({}), &[]),
        },
        ToolDefinition {
            name: "stop".to_string(),
            description: "Stop current playback, drain the speech queue, cancel any listen"
                .to_string(),
            input_schema: schema(json!({}), &[]),
        },
        ToolDefinition {
            name: "status".to_string(),
            description: "Engine, session and queue status".to_string(),
            input_schema: schema(json!({}), &[]),
        },
        ToolDefinition {
            name: "wake_enable".to_string(),
            description: "Start the wake word listener".to_string(),
            input_schema: schema(json!({}), &[]),
        },
        ToolDefinition {
            name: "wake_disable".to_string(),
            description: "Stop the wake word listener and release the microphone".to_string(),
            input_schema: schema(json!({}), &[]),
        },
    ]
}

/// Route one tool call. `None` means the tool name is unknown.
pub async fn dispatch(state: &Arc<ServerState>, name: &str, args: &Value) -> Option<Value> {
    let result = match name {
        "speak" => speak(state, args).await,
        "listen" => listen(state, args, true).await,
        "speak_then_listen" => speak_then_listen(state, args).await,
        "set_voice" => set_voice(state, args).await,
        "get_voice_registry" => get_voice_registry(state),
        "list_voices" => list_voices(),
        "mute" => set_muted(state, true),
        "unmute" => set_muted(state, false),
        "stop" => stop(state),
        "status" => status(state),
        "wake_enable" => wake_enable(state),
        "wake_disable" => wake_disable(state),
        _ => return None,
    };
    Some(result)
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

#[allow(clippy::cast_possible_truncation)]
fn arg_f32(args: &Value, key: &str, default: f32) -> f32 {
    args.get(key)
        .and_then(Value::as_f64)
        .map_or(default, |v| v as f32)
}

fn arg_bool(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn missing(field: &str) -> Value {
    json!({
        "success": false,
        "error": "invalid_arguments",
        "message": format!("missing required field '{field}'"),
    })
}

/// `speak { name, text, speed?, block? }`
pub async fn speak(state: &Arc<ServerState>, args: &Value) -> Value {
    let Some(name) = arg_str(args, "name") else {
        return missing("name");
    };
    let Some(text) = arg_str(args, "text") else {
        return missing("text");
    };
    let speed = arg_f32(args, "speed", 1.0);
    let block = arg_bool(args, "block", true);

    let Some(queue) = state.speech.clone() else {
        return json!({
            "success": false,
            "error": "engine_unavailable",
            "message": "TTS engine not loaded",
        });
    };

    // A name held by a different live session is never spoken from here;
    // the caller is told who it belongs to instead of silently borrowing
    // another agent's voice.
    let session = state.session_entry();
    if !name.eq_ignore_ascii_case(&session.name) {
        let store = state.store.clone();
        let own_pid = std::process::id();
        let sessions = tokio::task::spawn_blocking(move || store.snapshot(own_pid))
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        if sessions
            .iter()
            .any(|s| s.pid != own_pid && s.name.eq_ignore_ascii_case(name))
        {
            return json!({
                "success": false,
                "error": "name_occupied",
                "session_name": session.name,
                "session_voice": session.voice,
                "message": format!(
                    "'{name}' belongs to another session; this session speaks as '{}' ({})",
                    session.name, session.voice
                ),
            });
        }
    }

    let (voice, auto_assigned) = lock(&state.voices).resolve(name);

    if state.is_muted() {
        return if block {
            json!({
                "success": true, "voice": voice, "auto_assigned": auto_assigned,
                "duration_ms": 0, "synthesis_ms": 0, "muted": true,
            })
        } else {
            json!({
                "success": true, "voice": voice, "auto_assigned": auto_assigned,
                "queued": true, "muted": true,
            })
        };
    }

    if !block {
        queue.enqueue_detached(&voice, text, speed);
        return json!({
            "success": true, "voice": voice, "auto_assigned": auto_assigned, "queued": true,
        });
    }

    match queue.enqueue(&voice, text, speed).await {
        Ok(SpeakOutcome::Played {
            duration_ms,
            synthesis_ms,
        }) => json!({
            "success": true,
            "voice": voice,
            "auto_assigned": auto_assigned,
            "duration_ms": ms(duration_ms),
            "synthesis_ms": ms(synthesis_ms),
        }),
        Ok(SpeakOutcome::Cancelled) => json!({
            "success": false, "error": "cancelled", "voice": voice,
            "message": "speech stopped before completion",
        }),
        Ok(SpeakOutcome::Failed(message)) => json!({
            "success": false, "error": "speak_failed", "voice": voice, "message": message,
        }),
        Err(_) => json!({
            "success": false, "error": "speak_failed", "voice": voice,
            "message": "speech worker dropped the request",
        }),
    }
}

/// `listen { timeout?, silence_threshold?, prompt? }`
pub async fn listen(state: &Arc<ServerState>, args: &Value, play_cue: bool) -> Value {
    if state.engines.stt.is_none() {
        return json!({
            "success": false,
            "error": "engine_unavailable",
            "message": "STT engine not loaded",
        });
    }

    let (default_timeout, default_silence, vad_threshold) = {
        let config = lock_read(&state.config);
        (
            config.stt.max_listen_timeout,
            config.stt.silence_threshold,
            config.stt.vad_threshold,
        )
    };
    let params = ListenParams {
        timeout: arg_f32(args, "timeout", default_timeout),
        silence_threshold: arg_f32(args, "silence_threshold", default_silence),
        vad_threshold,
    };
    let prompt = arg_str(args, "prompt").map(str::to_string);

    listen_to_json(state.listen(params, play_cue, prompt.as_deref()).await)
}

fn listen_to_json(outcome: ListenOutcome) -> Value {
    match outcome {
        ListenOutcome::Success {
            text,
            confidence,
            duration_ms,
            transcription_ms,
        } => json!({
            "success": true,
            "text": text,
            "confidence": ((f64::from(confidence)) * 1000.0).round() / 1000.0,
            "duration_ms": ms(duration_ms),
            "transcription_ms": ms(transcription_ms),
        }),
        ListenOutcome::Timeout => json!({
            "success": false, "error": "timeout",
            "message": "no speech detected within timeout",
        }),
        ListenOutcome::Cancelled => json!({
            "success": false, "error": "cancelled", "cancelled": true,
        }),
        ListenOutcome::MicBusy => json!({
            "success": false, "error": "mic_busy",
            "message": "another listen is in progress",
        }),
        ListenOutcome::Muted => json!({
            "success": false, "error": "muted", "message": "voice input is muted",
        }),
        ListenOutcome::Failed(message) => json!({
            "success": false, "error": "listen_failed", "message": message,
        }),
    }
}

/// `speak_then_listen { name, text, speed?, timeout?, silence_threshold? }`
pub async fn speak_then_listen(state: &Arc<ServerState>, args: &Value) -> Value {
    let speak_result = speak(state, args).await;
    if speak_result.get("success") != Some(&Value::Bool(true)) {
        return json!({
            "speak": speak_result,
            "listen": { "success": false, "error": "skipped" },
        });
    }

    let mut listen_result = listen(state, args, true).await;

    // A silent caller gets one spoken nudge; the tool never retries the
    // listen itself.
    if listen_result.get("error") == Some(&Value::String("timeout".to_string())) {
        let nudge = json!({
            "name": args.get("name").cloned().unwrap_or_default(),
            "text": "Are you still there?",
            "block": true,
        });
        let nudge_result = speak(state, &nudge).await;
        if let Some(obj) = listen_result.as_object_mut() {
            obj.insert(
                "nudge_spoken".to_string(),
                Value::Bool(nudge_result.get("success") == Some(&Value::Bool(true))),
            );
        }
    }

    json!({ "speak": speak_result, "listen": listen_result })
}

/// `set_voice { name, voice }`: also renames this session so name and
/// voice stay aligned across the registry.
pub async fn set_voice(state: &Arc<ServerState>, args: &Value) -> Value {
    let Some(name) = arg_str(args, "name") else {
        return missing("name");
    };
    let Some(voice) = arg_str(args, "voice") else {
        return missing("voice");
    };

    if !catalog::is_valid(voice) {
        return json!({
            "success": false,
            "error": "invalid_voice",
            "message": format!("voice '{voice}' not found; use list_voices to see options"),
        });
    }

    let previous = state.session_entry();
    let store = state.store.clone();
    let own_pid = std::process::id();
    let new_name = name.to_string();
    let new_voice = voice.to_string();
    let renamed = tokio::task::spawn_blocking(move || {
        store.rename(own_pid, &new_name, Some(&new_voice))
    })
    .await;

    let entry = match renamed {
        Ok(Ok(entry)) => entry,
        Ok(Err(Error::NameOccupied { name, holder })) => {
            return json!({
                "success": false,
                "error": "name_occupied",
                "message": format!("'{name}' is held by session '{holder}'"),
                "session_name": previous.name,
                "session_voice": previous.voice,
            });
        }
        Ok(Err(e)) => {
            return json!({ "success": false, "error": "registry_error", "message": e.to_string() });
        }
        Err(e) => {
            return json!({ "success": false, "error": "registry_error", "message": e.to_string() });
        }
    };

    let registry_map = {
        let mut voices = lock(&state.voices);
        if previous.name != entry.name {
            voices.remove(&previous.name);
        }
        let _ = voices.set(&entry.name, voice);
        voices.snapshot().0
    };
    *lock_write(&state.session) = entry.clone();

    // Persist the explicit choice so restarts reclaim it.
    {
        let mut config = lock_write(&state.config);
        config.last_voice_name = Some(entry.name.clone());
        config.voice_registry = registry_map;
        let snapshot = config.clone();
        drop(config);
        if let Err(e) = snapshot.save(&state.config_path) {
            tracing::warn!(error = %e, "config save failed after set_voice");
        }
    }

    let mut response = json!({ "success": true, "name": entry.name, "voice": voice });
    if previous.name != entry.name {
        response["previous_name"] = Value::String(previous.name);
    }
    response
}

/// `get_voice_registry {}`
pub fn get_voice_registry(state: &Arc<ServerState>) -> Value {
    let (map, pool) = lock(&state.voices).snapshot();
    json!({
        "registry": map,
        "available_pool": pool,
        "total_assigned": map.len(),
        "total_available": pool.len(),
    })
}

/// `list_voices {}`
pub fn list_voices() -> Value {
    json!({
        "voices": catalog::VOICES,
        "total": catalog::VOICES.len(),
    })
}

fn set_muted(state: &Arc<ServerState>, muted: bool) -> Value {
    state.muted.store(muted, Ordering::SeqCst);
    tracing::info!(muted, "mute state changed");
    json!({ "success": true, "muted": muted })
}

/// `stop {}`
pub fn stop(state: &Arc<ServerState>) -> Value {
    let stopped_playback = state.speech.as_ref().is_some_and(crate::speech::SpeechQueue::stop);
    let cancelled_listen = state.cancel_listen();
    json!({
        "success": true,
        "stopped_playback": stopped_playback,
        "cancelled_listen": cancelled_listen,
    })
}

/// `status {}`
pub fn status(state: &Arc<ServerState>) -> Value {
    let config = lock_read(&state.config).clone();
    let session = state.session_entry();
    let registry_size = lock(&state.voices).len();
    let queue_depth = state.speech.as_ref().map_or(0, crate::speech::SpeechQueue::depth);

    let (wake_listening, wake_state, wake_model) = {
        let wake = lock(&state.wake);
        match wake.as_ref() {
            Some(listener) => (
                listener.is_listening(),
                listener.state().as_str(),
                Some(listener.model().to_string()),
            ),
            None => (false, "disabled", None),
        }
    };

    json!({
        "tts": {
            "loaded": state.engines.tts.is_some(),
            "model": state.engines.tts.as_ref().map(|e| e.model_name()),
            "voices": if state.engines.tts.is_some() { catalog::VOICES.len() } else { 0 },
        },
        "stt": {
            "loaded": state.engines.stt.is_some(),
            "model": state.engines.stt.as_ref().map(|e| e.model_name()),
            "language": config.stt.language,
        },
        "vad": { "loaded": state.engines.vad.is_some() },
        "muted": state.is_muted(),
        "uptime_s": state.started.elapsed().as_secs(),
        "registry_size": registry_size,
        "queue_depth": queue_depth,
        "session": {
            "name": session.name,
            "voice": session.voice,
            "port": session.port,
            "pid": session.pid,
        },
        "wake_word": {
            "enabled": config.wake_word.enabled || wake_model.is_some(),
            "listening": wake_listening,
            "state": wake_state,
            "model": wake_model.unwrap_or(config.wake_word.model),
            "tmux_session": session.tmux_session,
        },
    })
}

/// `wake_enable {}`
pub fn wake_enable(state: &Arc<ServerState>) -> Value {
    {
        let wake = lock(&state.wake);
        if let Some(listener) = wake.as_ref() {
            if listener.is_listening() {
                return json!({ "success": true, "already_listening": true });
            }
        }
    }
    match state.enable_wake() {
        Ok(model) => json!({ "success": true, "wake_word": model, "listening": true }),
        Err(e) => json!({
            "success": false,
            "error": "engine_unavailable",
            "message": e.to_string(),
        }),
    }
}

/// `wake_disable {}`
pub fn wake_disable(state: &Arc<ServerState>) -> Value {
    let was_running = state.disable_wake();
    let mut response = json!({ "success": true, "listening": false });
    if !was_running {
        response["was_disabled"] = Value::Bool(true);
    }
    response
}
