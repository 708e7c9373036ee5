//! Shared per-request pipeline for both gateways.
//!
//! Parse the body once, resolve the model, demand a running worker, forward
//! the call to its port. The SSE helpers here split upstream byte chunks
//! into events and reassemble delta streams for non-streaming clients.

use axum::http::HeaderMap;
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::info;

use crate::config::{ModelSpec, RuntimeSpec};
use crate::error::GatewayError;
use crate::server::GatewayState;
use crate::supervisor::DEFAULT_ENSURE_DEADLINE;

/// A request's model, resolved to the internal name plus everything needed
/// to start and talk to its worker.
pub struct ResolvedModel {
    pub internal_name: String,
    pub spec: ModelSpec,
    pub runtime: RuntimeSpec,
    pub fingerprint: String,
}

pub fn parse_body(body: &Bytes) -> Result<Value, GatewayError> {
    serde_json::from_slice(body)
        .map_err(|_| GatewayError::InvalidRequest("invalid JSON request body".to_string()))
}

pub fn model_field(body: &Value) -> Result<String, GatewayError> {
    body.get("model")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            GatewayError::InvalidRequest("model name not specified in request body".to_string())
        })
}

/// OpenAI gateway resolution: the external id published by the listing
/// endpoint wins, an unrecognized value falls back to being an internal
/// name.
pub fn resolve_openai_model(
    state: &GatewayState,
    requested: &str,
) -> Result<ResolvedModel, GatewayError> {
    let config = state.config.current();
    let internal_name = state
        .metadata
        .resolve_model_id(&config, requested)
        .ok_or_else(|| {
            GatewayError::InvalidRequest(format!(
                "model id '{}' not found in configuration",
                requested
            ))
        })?;
    resolve_internal(state, &internal_name)
}

/// Ollama gateway resolution: the request carries the internal name.
pub fn resolve_ollama_model(
    state: &GatewayState,
    requested: &str,
) -> Result<ResolvedModel, GatewayError> {
    resolve_internal(state, requested)
}

fn resolve_internal(state: &GatewayState, name: &str) -> Result<ResolvedModel, GatewayError> {
    let config = state.config.current();
    let spec = config
        .model(name)
        .cloned()
        .ok_or_else(|| GatewayError::InvalidRequest(format!("model '{}' not found", name)))?;
    let runtime = config.runtime_for(&spec);
    let fingerprint = spec.fingerprint();
    Ok(ResolvedModel {
        internal_name: name.to_string(),
        spec,
        runtime,
        fingerprint,
    })
}

/// Removes `tools`/`tool_choice` when the runtime cannot handle them.
/// Returns whether the body was modified.
pub fn strip_tools_if_unsupported(resolved: &ResolvedModel, body: &mut Value) -> bool {
    if resolved.runtime.supports_tools {
        return false;
    }
    let Some(map) = body.as_object_mut() else {
        return false;
    };
    let had_tools = map.remove("tools").is_some();
    let had_choice = map.remove("tool_choice").is_some();
    if had_tools || had_choice {
        info!(
            "model '{}' runs under runtime '{}' without tool support, removed tools from request",
            resolved.internal_name, resolved.runtime.name
        );
        true
    } else {
        false
    }
}

/// Blocks until a ready worker exists for the model, starting one if needed.
pub async fn ensure_port(state: &GatewayState, model_name: &str) -> Result<u16, GatewayError> {
    state
        .supervisor
        .ensure(model_name, DEFAULT_ENSURE_DEADLINE)
        .await
        .map_err(GatewayError::from)
}

/// Client headers to forward upstream: everything except `host` (wrong for
/// the worker) and `content-length` (recomputed for the re-encoded body).
pub fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    forwarded.remove(axum::http::header::HOST);
    forwarded.remove(axum::http::header::CONTENT_LENGTH);
    forwarded
}

pub async fn forward(
    state: &GatewayState,
    port: u16,
    worker_path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<reqwest::Response, GatewayError> {
    let url = format!("http://127.0.0.1:{}{}", port, worker_path);
    let response = state
        .http
        .post(&url)
        .headers(forward_headers(headers))
        .body(body)
        .send()
        .await?;
    Ok(response)
}

pub fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

/// Splits an upstream byte stream into complete lines, buffering partials
/// across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);
            lines.push(line);
        }
        lines
    }

    /// Whatever is left after the upstream closed mid-line.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buffer.trim().is_empty() {
            self.buffer.clear();
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }
}

/// The payload of a `data:` line, if it is one.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data: ").map(str::trim)
}

/// Reassembles streamed deltas into one complete response object for a
/// client that did not ask for a stream.
#[derive(Debug, Default)]
pub struct StreamReassembler {
    content: String,
    finish_reason: Option<String>,
    saw_content: bool,
    done: bool,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Feed one SSE `data:` payload.
    pub fn push_data(&mut self, data: &str) {
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };
        let Some(choice) = event.get("choices").and_then(|c| c.get(0)) else {
            return;
        };
        let content = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .or_else(|| choice.get("text"))
            .and_then(Value::as_str);
        if let Some(content) = content {
            self.content.push_str(content);
            self.saw_content = true;
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }
    }

    /// Complete response object in the worker's dialect.
    pub fn into_response(self, model: &str) -> Value {
        let mut response = json!({
            "id": "chatcmpl-default",
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": model,
            "choices": [],
        });
        if self.saw_content || self.finish_reason.is_some() {
            response["choices"] = json!([{
                "index": 0,
                "message": { "role": "assistant", "content": self.content },
                "finish_reason": self.finish_reason,
            }]);
        }
        response
    }
}

/// Adds the model fingerprint to a response object that lacks one.
pub fn inject_fingerprint(value: &mut Value, fingerprint: &str) {
    if let Value::Object(map) = value {
        if !map.contains_key("system_fingerprint") {
            map.insert("system_fingerprint".to_string(), json!(fingerprint));
        }
    }
}

/// Logs request/response bodies on the dedicated prompts target when
/// enabled in the config.
pub fn log_prompt(state: &GatewayState, direction: &str, model: &str, payload: &Value) {
    if state.config.current().prompt_logging_enabled {
        info!(target: "prompts", "{} for model '{}': {}", direction, model, payload);
    }
}
