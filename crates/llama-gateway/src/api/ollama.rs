//! Ollama-compatible gateway (port 11434).
//!
//! Requests carry internal model names and are rewritten into the OpenAI
//! dialect before being forwarded; responses are rewritten back, streaming
//! as newline-delimited JSON.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};

use super::proxy::{self, SseLineBuffer, StreamReassembler};
use crate::bridge::{self, OllamaEndpoint, StreamTranslator};
use crate::error::GatewayError;
use crate::metrics;
use crate::server::GatewayState;

pub async fn generate(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    completion_endpoint(state, OllamaEndpoint::Generate, headers, body).await
}

pub async fn chat(State(state): State<GatewayState>, headers: HeaderMap, body: Bytes) -> Response {
    completion_endpoint(state, OllamaEndpoint::Chat, headers, body).await
}

async fn completion_endpoint(
    state: GatewayState,
    endpoint: OllamaEndpoint,
    headers: HeaderMap,
    raw_body: Bytes,
) -> Response {
    let route = match endpoint {
        OllamaEndpoint::Generate => "/api/generate",
        OllamaEndpoint::Chat => "/api/chat",
        OllamaEndpoint::Embeddings => "/api/embeddings",
    };
    let body = match proxy::parse_body(&raw_body) {
        Ok(body) => body,
        Err(err) => return finish_with_error(route, err),
    };
    let model = match proxy::model_field(&body) {
        Ok(model) => model,
        Err(err) => return finish_with_error(route, err),
    };
    // Ollama streams unless the client opts out.
    let wants_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(true);

    let mut openai_req = match endpoint {
        OllamaEndpoint::Generate => bridge::generate_request_to_openai(&body),
        _ => bridge::chat_request_to_openai(&body),
    };
    proxy::log_prompt(&state, "request", &model, &body);

    let resolved = match proxy::resolve_ollama_model(&state, &model) {
        Ok(resolved) => resolved,
        Err(err) => return finish_with_error(route, err),
    };
    proxy::strip_tools_if_unsupported(&resolved, &mut openai_req);

    if wants_stream {
        metrics::inc_request(route, "stream");
        stream_ndjson(state, endpoint, headers, openai_req, model, resolved.internal_name)
    } else {
        match fetch_full(&state, endpoint, &headers, &openai_req, &model, &resolved.internal_name)
            .await
        {
            Ok(response) => {
                metrics::inc_request(route, "200");
                Json(response).into_response()
            }
            Err(err) => finish_with_error(route, err),
        }
    }
}

fn finish_with_error(route: &str, err: GatewayError) -> Response {
    metrics::inc_request(route, err.status().as_str());
    err.into_response()
}

async fn fetch_full(
    state: &GatewayState,
    endpoint: OllamaEndpoint,
    headers: &HeaderMap,
    openai_req: &Value,
    model: &str,
    internal_name: &str,
) -> Result<Value, GatewayError> {
    let port = proxy::ensure_port(state, internal_name).await?;
    let payload = serde_json::to_vec(openai_req)
        .map_err(|err| GatewayError::Internal(format!("failed to encode request: {}", err)))?;
    let upstream =
        proxy::forward(state, port, endpoint.worker_path(), headers, payload.into()).await?;

    if proxy::is_event_stream(&upstream) {
        // The worker streamed anyway; reassemble before translating.
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
        let finish = reassembler.finish_reason().unwrap_or("stop").to_string();
        let content = reassembler.content().to_string();
        let openai_full = match endpoint {
            OllamaEndpoint::Generate => {
                json!({ "choices": [{ "text": content, "finish_reason": finish }] })
            }
            _ => json!({
                "choices": [{
                    "message": { "role": "assistant", "content": content },
                    "finish_reason": finish
                }]
            }),
        };
        return Ok(translate_full(endpoint, model, &openai_full));
    }

    let bytes = upstream.bytes().await.map_err(GatewayError::from)?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|_| GatewayError::Upstream("runner returned a non-JSON response".to_string()))?;
    if value.get("error").is_some() {
        return Err(GatewayError::Upstream(
            value["error"]
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("runner reported an error")
                .to_string(),
        ));
    }
    Ok(translate_full(endpoint, model, &value))
}

fn translate_full(endpoint: OllamaEndpoint, model: &str, openai: &Value) -> Value {
    match endpoint {
        OllamaEndpoint::Generate => bridge::completion_response_to_ollama(model, openai),
        _ => bridge::chat_response_to_ollama(model, openai),
    }
}

fn stream_ndjson(
    state: GatewayState,
    endpoint: OllamaEndpoint,
    headers: HeaderMap,
    openai_req: Value,
    model: String,
    internal_name: String,
) -> Response {
    let stream = async_stream::stream! {
        let port = match proxy::ensure_port(&state, &internal_name).await {
            Ok(port) => port,
            Err(err) => {
                yield Ok::<Bytes, Infallible>(error_line(&err));
                return;
            }
        };
        let payload = match serde_json::to_vec(&openai_req) {
            Ok(payload) => payload,
            Err(err) => {
                yield Ok(error_line(&GatewayError::Internal(format!(
                    "failed to encode request: {}", err
                ))));
                return;
            }
        };
        let upstream = match proxy::forward(&state, port, endpoint.worker_path(), &headers, payload.into()).await {
            Ok(upstream) => upstream,
            Err(err) => {
                yield Ok(error_line(&err));
                return;
            }
        };

        if proxy::is_event_stream(&upstream) {
            let mut translator = StreamTranslator::new(endpoint, &model);
            let mut buffer = SseLineBuffer::new();
            let mut chunks = upstream.bytes_stream();
            while let Some(chunk) = chunks.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Ok(error_line(&GatewayError::from(err)));
                        return;
                    }
                };
                for line in buffer.push(&chunk) {
                    if let Some(data) = proxy::sse_data(&line) {
                        for value in translator.push_data(data) {
                            yield Ok(ndjson_line(&value));
                        }
                    }
                }
            }
            for value in translator.finish() {
                yield Ok(ndjson_line(&value));
            }
        } else {
            match upstream.bytes().await {
                Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                    Ok(value) => {
                        yield Ok(ndjson_line(&translate_full(endpoint, &model, &value)));
                    }
                    Err(_) => {
                        yield Ok(error_line(&GatewayError::Upstream(
                            "runner returned a non-JSON response".to_string(),
                        )));
                    }
                },
                Err(err) => {
                    yield Ok(error_line(&GatewayError::from(err)));
                }
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn ndjson_line(value: &Value) -> Bytes {
    Bytes::from(format!("{}\n", value))
}

fn error_line(err: &GatewayError) -> Bytes {
    Bytes::from(format!("{}\n", err.payload()))
}

pub async fn embeddings(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let route = "/api/embeddings";
    let body = match proxy::parse_body(&body) {
        Ok(body) => body,
        Err(err) => return finish_with_error(route, err),
    };
    let model = match proxy::model_field(&body) {
        Ok(model) => model,
        Err(err) => return finish_with_error(route, err),
    };
    let openai_req = bridge::embeddings_request_to_openai(&body);
    proxy::log_prompt(&state, "request", &model, &body);

    let result: Result<Value, GatewayError> = async {
        let resolved = proxy::resolve_ollama_model(&state, &model)?;
        let port = proxy::ensure_port(&state, &resolved.internal_name).await?;
        let payload = serde_json::to_vec(&openai_req)
            .map_err(|err| GatewayError::Internal(format!("failed to encode request: {}", err)))?;
        let upstream = proxy::forward(
            &state,
            port,
            OllamaEndpoint::Embeddings.worker_path(),
            &headers,
            payload.into(),
        )
        .await?;
        let bytes = upstream.bytes().await.map_err(GatewayError::from)?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|_| {
            GatewayError::Upstream("runner returned a non-JSON response".to_string())
        })?;
        Ok(bridge::embeddings_response_to_ollama(&value))
    }
    .await;

    match result {
        Ok(response) => {
            metrics::inc_request(route, "200");
            Json(response).into_response()
        }
        Err(err) => finish_with_error(route, err),
    }
}

/// GET /api/tags — the locally available models.
pub async fn tags(State(state): State<GatewayState>) -> Json<Value> {
    let config = state.config.current();
    let running = state.supervisor.running_models().await;
    let mut models = Vec::new();
    for spec in config.models.values() {
        let record = state
            .metadata
            .descriptor(spec, running.contains(&spec.name));
        models.push(json!({
            "name": spec.name,
            "model": spec.name,
            "size": record.get("size").cloned().unwrap_or(json!(0)),
            "details": {
                "format": "gguf",
                "family": record["arch"],
                "quantization_level": record["quantization"],
            },
        }));
    }
    metrics::inc_request("/api/tags", "200");
    Json(json!({ "models": models }))
}

/// POST /api/show
pub async fn show(State(state): State<GatewayState>, body: Bytes) -> Response {
    let body = match proxy::parse_body(&body) {
        Ok(body) => body,
        Err(err) => return finish_with_error("/api/show", err),
    };
    let name = body
        .get("model")
        .or_else(|| body.get("name"))
        .and_then(Value::as_str);
    let Some(name) = name else {
        return finish_with_error(
            "/api/show",
            GatewayError::InvalidRequest("model name not specified in request body".to_string()),
        );
    };

    let config = state.config.current();
    let Some(spec) = config.model(name) else {
        metrics::inc_request("/api/show", "404");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("model '{}' not found", name) })),
        )
            .into_response();
    };

    let running = state.supervisor.is_running(name).await;
    let record = state.metadata.descriptor(spec, running);
    let capabilities = if spec.has_tools {
        json!(["completion", "tools"])
    } else {
        json!(["completion"])
    };
    metrics::inc_request("/api/show", "200");
    Json(json!({
        "details": {
            "format": "gguf",
            "family": record["arch"],
            "quantization_level": record["quantization"],
        },
        "model_info": record.get("raw_metadata").cloned().unwrap_or(json!({})),
        "capabilities": capabilities,
    }))
    .into_response()
}
