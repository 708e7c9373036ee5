//! OpenAI-compatible gateway (port 1234).
//!
//! `/v1/*` plus the `/api/v0/*` mirror. Requests name models by the external
//! id published by the listing endpoints; the body is forwarded to the
//! model's worker with `tools` stripped for runtimes that cannot handle
//! them, and every response object or SSE event that lacks a
//! `system_fingerprint` gets the model's configuration digest injected.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::error;

use super::proxy::{self, SseLineBuffer, StreamReassembler};
use crate::error::GatewayError;
use crate::metrics;
use crate::server::GatewayState;

/// Bearer-token check, active only when an api key is configured.
pub async fn require_bearer(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(key) = state.config.current().api_key.as_deref() {
        let expected = format!("Bearer {}", key);
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value == expected)
            .unwrap_or(false);
        if !authorized {
            return GatewayError::Unauthorized.into_response();
        }
    }
    next.run(request).await
}

/// GET /v1/models — the simplified OpenAI listing.
pub async fn list_models(State(state): State<GatewayState>) -> Json<Value> {
    let config = state.config.current();
    let data: Vec<Value> = state
        .metadata
        .id_mapping(&config)
        .into_values()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "organization_owner",
            })
        })
        .collect();
    metrics::inc_request("/v1/models", "200");
    Json(json!({ "object": "list", "data": data }))
}

/// GET /api/v0/models — full descriptors with load state and capabilities.
pub async fn list_models_v0(State(state): State<GatewayState>) -> Json<Value> {
    let config = state.config.current();
    let running = state.supervisor.running_models().await;
    let mut data = Vec::new();
    for spec in config.models.values() {
        let mut record = state
            .metadata
            .descriptor(spec, running.contains(&spec.name));
        if spec.has_tools {
            record["capabilities"] = json!(["tool_use"]);
        }
        data.push(record);
    }
    metrics::inc_request("/api/v0/models", "200");
    Json(json!({ "object": "list", "data": data }))
}

/// GET /api/v0/models/{id}
pub async fn get_model_v0(
    State(state): State<GatewayState>,
    Path(model_id): Path<String>,
) -> Response {
    let config = state.config.current();
    let Some(internal) = state.metadata.resolve_model_id(&config, &model_id) else {
        metrics::inc_request("/api/v0/models/{id}", "404");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": { "message": format!("model with id '{}' not found", model_id), "type": "invalid_request_error" }
            })),
        )
            .into_response();
    };
    let Some(spec) = config.model(&internal) else {
        return GatewayError::Internal("resolved model vanished from config".to_string())
            .into_response();
    };
    let running = state.supervisor.is_running(&internal).await;
    let mut record = state.metadata.descriptor(spec, running);
    if spec.has_tools {
        record["capabilities"] = json!(["tool_use"]);
    }
    metrics::inc_request("/api/v0/models/{id}", "200");
    Json(record).into_response()
}

pub async fn chat_completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_openai(state, "/v1/chat/completions", headers, body).await
}

pub async fn completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_openai(state, "/v1/completions", headers, body).await
}

pub async fn embeddings(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_openai(state, "/v1/embeddings", headers, body).await
}

async fn proxy_openai(
    state: GatewayState,
    worker_path: &'static str,
    headers: HeaderMap,
    raw_body: Bytes,
) -> Response {
    let mut body = match proxy::parse_body(&raw_body) {
        Ok(body) => body,
        Err(err) => return finish_with_error(worker_path, err),
    };
    let requested = match proxy::model_field(&body) {
        Ok(model) => model,
        Err(err) => return finish_with_error(worker_path, err),
    };
    proxy::log_prompt(&state, "request", &requested, &body);

    // Embeddings never stream.
    let wants_stream = !worker_path.ends_with("/embeddings")
        && body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    if wants_stream {
        metrics::inc_request(worker_path, "stream");
        stream_openai(state, worker_path, headers, body, requested)
    } else {
        match fetch_openai(&state, worker_path, &headers, &mut body, &requested).await {
            Ok(response) => {
                metrics::inc_request(worker_path, "200");
                response
            }
            Err(err) => finish_with_error(worker_path, err),
        }
    }
}

fn finish_with_error(worker_path: &str, err: GatewayError) -> Response {
    metrics::inc_request(worker_path, err.status().as_str());
    err.into_response()
}

/// Non-streaming client: buffer the worker's answer, reassembling an SSE
/// upstream into one object if need be.
async fn fetch_openai(
    state: &GatewayState,
    worker_path: &'static str,
    headers: &HeaderMap,
    body: &mut Value,
    requested: &str,
) -> Result<Response, GatewayError> {
    let resolved = proxy::resolve_openai_model(state, requested)?;
    proxy::strip_tools_if_unsupported(&resolved, body);
    let port = proxy::ensure_port(state, &resolved.internal_name).await?;

    let payload = serde_json::to_vec(&*body)
        .map_err(|err| GatewayError::Internal(format!("failed to re-encode request: {}", err)))?;
    let upstream = proxy::forward(state, port, worker_path, headers, payload.into()).await?;
    let status = upstream.status();

    if proxy::is_event_stream(&upstream) {
        let mut reassembler = StreamReassembler::new();
        let mut buffer = SseLineBuffer::new();
        let mut chunks = upstream.bytes_stream();
        'outer: while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(GatewayError::from)?;
            for line in buffer.push(&chunk) {
                if let Some(data) = proxy::sse_data(&line) {
                    reassembler.push_data(data);
                    if reassembler.is_done() {
                        break 'outer;
                    }
                }
            }
        }
        let mut response = reassembler.into_response(requested);
        proxy::inject_fingerprint(&mut response, &resolved.fingerprint);
        proxy::log_prompt(state, "response", requested, &response);
        return Ok(Json(response).into_response());
    }

    let bytes = upstream.bytes().await.map_err(GatewayError::from)?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Array(items)) if worker_path.ends_with("/embeddings") => {
            // Some worker families answer with a bare array holding one
            // object whose `embedding` is a list of vectors; re-wrap it into
            // the standard listing shape.
            wrap_embeddings_array(items, requested)
        }
        Ok(mut value) => {
            proxy::inject_fingerprint(&mut value, &resolved.fingerprint);
            proxy::log_prompt(state, "response", requested, &value);
            Ok((status, Json(value)).into_response())
        }
        Err(_) => {
            error!(
                "worker for '{}' returned a non-JSON response on {}",
                resolved.internal_name, worker_path
            );
            Err(GatewayError::Upstream(
                "runner returned a non-JSON response".to_string(),
            ))
        }
    }
}

fn wrap_embeddings_array(items: Vec<Value>, model: &str) -> Result<Response, GatewayError> {
    let first = items.into_iter().next().ok_or_else(|| {
        GatewayError::Upstream("runner returned an empty embeddings response".to_string())
    })?;
    let vectors = first
        .get("embedding")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| {
            GatewayError::Upstream("unexpected embeddings response structure".to_string())
        })?;
    if vectors.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "invalid embedding data format".to_string(),
        ));
    }
    let data: Vec<Value> = vectors
        .into_iter()
        .map(|vector| json!({ "object": "embedding", "embedding": vector }))
        .collect();
    Ok(Json(json!({
        "object": "list",
        "data": data,
        "model": model,
        "usage": { "prompt_tokens": 0, "total_tokens": 0 }
    }))
    .into_response())
}

/// Streaming client: SSE out, whatever the worker does. Errors are emitted
/// as a single error event before the stream terminates.
fn stream_openai(
    state: GatewayState,
    worker_path: &'static str,
    headers: HeaderMap,
    mut body: Value,
    requested: String,
) -> Response {
    let stream = async_stream::stream! {
        let resolved = match proxy::resolve_openai_model(&state, &requested) {
            Ok(resolved) => resolved,
            Err(err) => {
                yield Ok::<Bytes, Infallible>(error_event(&err));
                return;
            }
        };
        proxy::strip_tools_if_unsupported(&resolved, &mut body);

        let port = match proxy::ensure_port(&state, &resolved.internal_name).await {
            Ok(port) => port,
            Err(err) => {
                yield Ok(error_event(&err));
                return;
            }
        };

        let payload = match serde_json::to_vec(&body) {
            Ok(payload) => payload,
            Err(err) => {
                yield Ok(error_event(&GatewayError::Internal(format!(
                    "failed to re-encode request: {}", err
                ))));
                return;
            }
        };

        let upstream = match proxy::forward(&state, port, worker_path, &headers, payload.into()).await {
            Ok(upstream) => upstream,
            Err(err) => {
                yield Ok(error_event(&err));
                return;
            }
        };

        if proxy::is_event_stream(&upstream) {
            // SSE → SSE: forward event by event, stamping the fingerprint.
            let mut buffer = SseLineBuffer::new();
            let mut chunks = upstream.bytes_stream();
            while let Some(chunk) = chunks.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Ok(error_event(&GatewayError::from(err)));
                        return;
                    }
                };
                for line in buffer.push(&chunk) {
                    match proxy::sse_data(&line) {
                        Some("[DONE]") => {
                            yield Ok(Bytes::from("data: [DONE]\n\n"));
                        }
                        Some(data) => match serde_json::from_str::<Value>(data) {
                            Ok(mut event) => {
                                proxy::inject_fingerprint(&mut event, &resolved.fingerprint);
                                yield Ok(Bytes::from(format!("data: {}\n\n", event)));
                            }
                            Err(_) => {
                                yield Ok(Bytes::from(format!("data: {}\n\n", data)));
                            }
                        },
                        None => {
                            if !line.is_empty() {
                                yield Ok(Bytes::from(format!("{}\n", line)));
                            }
                        }
                    }
                }
            }
        } else {
            // Full → SSE: wrap the whole body in one event.
            match upstream.bytes().await {
                Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                    Ok(mut value) => {
                        proxy::inject_fingerprint(&mut value, &resolved.fingerprint);
                        yield Ok(Bytes::from(format!("data: {}\n\n", value)));
                    }
                    Err(_) => {
                        yield Ok(Bytes::from(format!(
                            "data: {}\n\n",
                            String::from_utf8_lossy(&bytes)
                        )));
                    }
                },
                Err(err) => {
                    yield Ok(error_event(&GatewayError::from(err)));
                    return;
                }
            }
            yield Ok(Bytes::from("data: [DONE]\n\n"));
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_event(err: &GatewayError) -> Bytes {
    Bytes::from(format!("data: {}\n\n", err.payload()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_event_shape() {
        let event = error_event(&GatewayError::CapacityExceeded);
        let text = String::from_utf8(event.to_vec()).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.ends_with("\n\n"));
        let payload: Value = serde_json::from_str(text.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(payload["error"]["type"], "runner_startup_error");
    }

    #[test]
    fn test_wrap_embeddings_array_rebuilds_listing() {
        let items = vec![json!({ "embedding": [[0.1, 0.2], [0.3, 0.4]] })];
        let response = wrap_embeddings_array(items, "embed-model").unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_wrap_embeddings_array_rejects_empty() {
        let err = wrap_embeddings_array(vec![json!({ "embedding": [] })], "m").unwrap_err();
        assert_eq!(err.error_type(), "invalid_request_error");

        let err = wrap_embeddings_array(vec![json!({ "nope": 1 })], "m").unwrap_err();
        assert_eq!(err.error_type(), "runner_communication_error");
    }
}
