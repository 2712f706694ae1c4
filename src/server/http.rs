//! Loopback HTTP side-channel.
//!
//! One per process, on the port claimed in the session registry. Siblings
//! use it for liveness (`GET /status`), cross-session speech and listen
//! triggers, editor session-id handover (`POST /session`), and wake-word
//! text injection into this session's terminal (`POST /inject`). Binds to
//! 127.0.0.1 only; there is no authentication on purpose (same user, same
//! machine).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use super::{lock, lock_write, tools, ServerState};
use crate::Result;

/// Build the side-channel router
fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/status", get(http_status))
        .route("/listen", post(http_listen))
        .route("/speak", post(http_speak))
        .route("/session", post(http_session))
        .route("/inject", post(http_inject))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the side-channel and serve until the process exits.
///
/// # Errors
///
/// Returns error if the port cannot be bound.
pub async fn serve(state: Arc<ServerState>, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!(port, "http side-channel listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn http_status(State(state): State<Arc<ServerState>>) -> Json<Value> {
    Json(tools::status(&state))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListenBody {
    timeout: Option<f32>,
    silence_threshold: Option<f32>,
}

/// Push-to-talk entry point. The external trigger supplies its own cue,
/// so the ready-cue prelude is skipped. The body is optional; an empty
/// POST listens with the configured defaults.
async fn http_listen(
    State(state): State<Arc<ServerState>>,
    body: axum::body::Bytes,
) -> Json<Value> {
    let body: ListenBody = serde_json::from_slice(&body).unwrap_or_default();
    let mut args = serde_json::Map::new();
    if let Some(timeout) = body.timeout {
        args.insert("timeout".to_string(), json!(timeout));
    }
    if let Some(silence) = body.silence_threshold {
        args.insert("silence_threshold".to_string(), json!(silence));
    }
    args.insert("prompt".to_string(), json!("push-to-talk"));

    Json(tools::listen(&state, &Value::Object(args), false).await)
}

async fn http_speak(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    Json(tools::speak(&state, &body).await)
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    session_id: String,
}

/// Editor session-start handover: stamp the logical session id and adopt a
/// sibling identity when one already carries it.
async fn http_session(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SessionBody>,
) -> (StatusCode, Json<Value>) {
    let store = state.store.clone();
    let pid = std::process::id();
    let session_id = body.session_id.clone();
    let attached =
        tokio::task::spawn_blocking(move || store.attach_session_id(pid, &session_id)).await;

    match attached {
        Ok(Ok(Some(entry))) => {
            {
                let mut voices = lock(&state.voices);
                let previous = state.session_entry();
                if previous.name != entry.name {
                    voices.remove(&previous.name);
                }
                let _ = voices.set(&entry.name, &entry.voice);
            }
            *lock_write(&state.session) = entry.clone();
            (StatusCode::OK, Json(json!({ "success": true, "session": entry })))
        }
        Ok(Ok(None)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "not_registered" })),
        ),
        Ok(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "registry_error", "message": e.to_string() })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "registry_error", "message": e.to_string() })),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct InjectBody {
    text: String,
}

/// Type the text into the terminal session bound to this process. Literal
/// send-keys first, then the newline, so nothing in the text is
/// interpreted by the shell.
async fn http_inject(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<InjectBody>,
) -> (StatusCode, Json<Value>) {
    let Some(tmux) = state.session_entry().tmux_session else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "no_tmux_session" })),
        );
    };
    if body.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "empty_text" })),
        );
    }

    let send = tokio::process::Command::new("tmux")
        .args(["send-keys", "-t", &tmux, "-l", &body.text])
        .output()
        .await;
    let enter = tokio::process::Command::new("tmux")
        .args(["send-keys", "-t", &tmux, "Enter"])
        .output()
        .await;

    match (send, enter) {
        (Ok(a), Ok(b)) if a.status.success() && b.status.success() => {
            tracing::info!(tmux = %tmux, "text injected");
            (StatusCode::OK, Json(json!({ "success": true })))
        }
        (Err(e), _) | (_, Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "tmux_failed", "message": e.to_string() })),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "tmux_failed", "message": "send-keys exited nonzero" })),
        ),
    }
}
