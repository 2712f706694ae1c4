//! JSON-RPC shell over newline-delimited JSON streams.
//!
//! Generic over `AsyncBufRead + AsyncWrite` so stdio and in-memory
//! buffers drive it the same way. Mic and speech tool calls run on
//! spawned tasks (responses carry ids, order is free), which lets `stop`
//! and cancellation notifications reach an in-flight `listen` while it is
//! still recording; control tools are answered inline in request order.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use super::{tools, ServerState};

const PROTOCOL_VERSION: &str = "2025-06-18";
const SERVER_NAME: &str = "chorus";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const NOT_INITIALIZED: i32 = -32002;

/// One tool's advertised definition
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// The stdio-facing request dispatcher
pub struct McpServer {
    state: Arc<ServerState>,
    initialized: bool,
    /// Request ids currently being handled, for cancellation routing
    in_flight: Arc<std::sync::Mutex<HashSet<String>>>,
}

impl McpServer {
    #[must_use]
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            initialized: false,
            in_flight: Arc::new(std::sync::Mutex::new(HashSet::new())),
        }
    }

    /// Run the loop until EOF on `reader`. Returns the writer so callers
    /// (and tests) can inspect or reuse it.
    ///
    /// # Errors
    ///
    /// Returns error on transport IO failure.
    pub async fn run<R, W>(mut self, reader: R, writer: W) -> std::io::Result<W>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = Arc::new(Mutex::new(writer));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }

            let msg: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => {
                    let resp = error_response(Value::Null, INVALID_REQUEST, "Parse error");
                    write_line(&writer, &resp).await?;
                    continue;
                }
            };

            let method = msg.get("method").and_then(Value::as_str).unwrap_or("");
            let id = msg.get("id").cloned();
            let params = msg
                .get("params")
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            let is_notification = id.is_none();

            match method {
                "initialize" => {
                    self.initialized = true;
                    let result = json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": { "tools": { "listChanged": false } },
                        "serverInfo": { "name": SERVER_NAME, "version": SERVER_VERSION },
                    });
                    if let Some(id) = id {
                        write_line(&writer, &success_response(id, result)).await?;
                    }
                }

                "notifications/initialized" => {}

                "notifications/cancelled" => {
                    let request_id = params
                        .get("requestId")
                        .map(id_key)
                        .unwrap_or_default();
                    let known = self
                        .in_flight
                        .lock()
                        .map(|set| set.contains(&request_id))
                        .unwrap_or(false);
                    if known && self.state.cancel_listen() {
                        tracing::info!(request_id = %request_id, "listen cancelled by notification");
                    }
                }

                _ if !self.initialized => {
                    if !is_notification {
                        let resp = error_response(
                            id.unwrap_or(Value::Null),
                            NOT_INITIALIZED,
                            "Server not initialized",
                        );
                        write_line(&writer, &resp).await?;
                    }
                }

                "ping" => {
                    if let Some(id) = id {
                        write_line(&writer, &success_response(id, json!({}))).await?;
                    }
                }

                "tools/list" => {
                    let result = json!({ "tools": tools::definitions() });
                    if let Some(id) = id {
                        write_line(&writer, &success_response(id, result)).await?;
                    }
                }

                "tools/call" => {
                    let tool = params
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();

                    // Mic and speech tools block for seconds; they run on
                    // their own tasks so `stop` and cancellation
                    // notifications still get through. Control tools are
                    // handled inline, in request order.
                    if matches!(tool.as_str(), "speak" | "listen" | "speak_then_listen") {
                        let state = Arc::clone(&self.state);
                        let writer = Arc::clone(&writer);
                        let in_flight = Arc::clone(&self.in_flight);
                        tasks.spawn(async move {
                            let key = id.as_ref().map(id_key).unwrap_or_default();
                            if let Ok(mut set) = in_flight.lock() {
                                set.insert(key.clone());
                            }

                            let resp = handle_tool_call(&state, &params, id.clone()).await;

                            if let Ok(mut set) = in_flight.lock() {
                                set.remove(&key);
                            }
                            if let (Some(resp), Some(_)) = (resp, id) {
                                let _ = write_line(&writer, &resp).await;
                            }
                        });
                    } else if let Some(resp) =
                        handle_tool_call(&self.state, &params, id).await
                    {
                        write_line(&writer, &resp).await?;
                    }
                }

                _ => {
                    if !is_notification {
                        let resp = error_response(
                            id.unwrap_or(Value::Null),
                            METHOD_NOT_FOUND,
                            &format!("Method not found: {method}"),
                        );
                        write_line(&writer, &resp).await?;
                    }
                }
            }
        }

        // EOF: drain in-flight handlers before handing the writer back.
        while tasks.join_next().await.is_some() {}

        match Arc::try_unwrap(writer) {
            Ok(writer) => Ok(writer.into_inner()),
            Err(_) => Err(std::io::Error::other("writer still shared at EOF")),
        }
    }
}

async fn handle_tool_call(
    state: &Arc<ServerState>,
    params: &Value,
    id: Option<Value>,
) -> Option<Value> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let args = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

    let result = tools::dispatch(state, name, &args).await;
    let id = id?;

    let payload = match result {
        Some(value) => {
            let text = value.to_string();
            json!({
                "content": [{ "type": "text", "text": text }],
                "structuredContent": value,
                "isError": false,
            })
        }
        None => json!({
            "content": [{ "type": "text", "text": format!("unknown tool: {name}") }],
            "isError": true,
        }),
    };
    Some(success_response(id, payload))
}

/// Stable string key for a request id (number or string)
fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i32, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

async fn write_line<W: AsyncWrite + Unpin>(
    writer: &Arc<Mutex<W>>,
    response: &Value,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(response).map_err(std::io::Error::other)?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
