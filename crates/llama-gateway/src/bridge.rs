//! Ollama ↔ OpenAI wire format translation.
//!
//! Requests arriving on the Ollama gateway are rewritten into the OpenAI
//! dialect the worker speaks; worker responses are rewritten back. The
//! streaming direction is handled by [`StreamTranslator`], which holds each
//! translated chunk until the next one arrives so the last chunk can be
//! marked `done: true` and carry the synthesized timing counters.

use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OllamaEndpoint {
    Generate,
    Chat,
    Embeddings,
}

impl OllamaEndpoint {
    /// The worker-side path this endpoint forwards to.
    pub fn worker_path(&self) -> &'static str {
        match self {
            OllamaEndpoint::Generate => "/v1/completions",
            OllamaEndpoint::Chat => "/v1/chat/completions",
            OllamaEndpoint::Embeddings => "/v1/embeddings",
        }
    }
}

/// Sampling options that keep their name across dialects (llama-server
/// accepts the llama.cpp-native ones on its OpenAI endpoints too).
const OPTION_PASSTHROUGH: &[&str] = &[
    "temperature",
    "top_p",
    "top_k",
    "min_p",
    "seed",
    "stop",
    "repeat_penalty",
    "presence_penalty",
    "frequency_penalty",
];

fn apply_options(target: &mut Map<String, Value>, options: Option<&Value>) {
    let Some(Value::Object(options)) = options else {
        return;
    };
    if let Some(num_predict) = options.get("num_predict") {
        target.insert("max_tokens".to_string(), num_predict.clone());
    }
    for key in OPTION_PASSTHROUGH {
        if let Some(value) = options.get(*key) {
            target.insert((*key).to_string(), value.clone());
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// `/api/generate` → `/v1/completions` request body.
pub fn generate_request_to_openai(body: &Value) -> Value {
    let mut out = Map::new();
    out.insert(
        "model".to_string(),
        body.get("model").cloned().unwrap_or(Value::Null),
    );
    out.insert(
        "prompt".to_string(),
        body.get("prompt").cloned().unwrap_or_else(|| json!("")),
    );
    out.insert(
        "stream".to_string(),
        body.get("stream").cloned().unwrap_or(Value::Bool(true)),
    );
    apply_options(&mut out, body.get("options"));
    Value::Object(out)
}

/// `/api/chat` → `/v1/chat/completions` request body.
pub fn chat_request_to_openai(body: &Value) -> Value {
    let mut out = Map::new();
    out.insert(
        "model".to_string(),
        body.get("model").cloned().unwrap_or(Value::Null),
    );
    out.insert(
        "messages".to_string(),
        body.get("messages").cloned().unwrap_or_else(|| json!([])),
    );
    out.insert(
        "stream".to_string(),
        body.get("stream").cloned().unwrap_or(Value::Bool(true)),
    );
    if body.get("format").and_then(Value::as_str) == Some("json") {
        out.insert(
            "response_format".to_string(),
            json!({ "type": "json_object" }),
        );
    }
    if let Some(tools) = body.get("tools") {
        out.insert("tools".to_string(), tools.clone());
    }
    apply_options(&mut out, body.get("options"));
    Value::Object(out)
}

/// `/api/embeddings` → `/v1/embeddings` request body. Ollama sends the text
/// under `prompt`; OpenAI wants `input`.
pub fn embeddings_request_to_openai(body: &Value) -> Value {
    let input = body
        .get("prompt")
        .or_else(|| body.get("input"))
        .cloned()
        .unwrap_or_else(|| json!(""));
    json!({
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "input": input,
    })
}

fn usage_count(openai: &Value, field: &str) -> u64 {
    openai
        .get("usage")
        .and_then(|u| u.get(field))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn timing_fields(
    out: &mut Map<String, Value>,
    total_duration: u64,
    prompt_eval_count: u64,
    eval_count: u64,
    eval_duration: u64,
) {
    out.insert("total_duration".to_string(), json!(total_duration));
    out.insert("load_duration".to_string(), json!(0));
    out.insert("prompt_eval_count".to_string(), json!(prompt_eval_count));
    out.insert("prompt_eval_duration".to_string(), json!(0));
    out.insert("eval_count".to_string(), json!(eval_count));
    out.insert("eval_duration".to_string(), json!(eval_duration));
}

/// Full (non-streaming) `/v1/completions` response → one Ollama object.
pub fn completion_response_to_ollama(model: &str, openai: &Value) -> Value {
    let text = openai["choices"][0]["text"].as_str().unwrap_or_default();
    let finish = openai["choices"][0]["finish_reason"]
        .as_str()
        .unwrap_or("stop");
    let mut out = Map::new();
    out.insert("model".to_string(), json!(model));
    out.insert("created_at".to_string(), json!(now_rfc3339()));
    out.insert("response".to_string(), json!(text));
    out.insert("done".to_string(), json!(true));
    out.insert("done_reason".to_string(), json!(finish));
    timing_fields(
        &mut out,
        0,
        usage_count(openai, "prompt_tokens"),
        usage_count(openai, "completion_tokens"),
        0,
    );
    Value::Object(out)
}

/// Full (non-streaming) `/v1/chat/completions` response → one Ollama object.
pub fn chat_response_to_ollama(model: &str, openai: &Value) -> Value {
    let message = openai["choices"][0].get("message").cloned().unwrap_or_else(
        || json!({ "role": "assistant", "content": "" }),
    );
    let finish = openai["choices"][0]["finish_reason"]
        .as_str()
        .unwrap_or("stop");
    let mut out = Map::new();
    out.insert("model".to_string(), json!(model));
    out.insert("created_at".to_string(), json!(now_rfc3339()));
    out.insert("message".to_string(), message);
    out.insert("done".to_string(), json!(true));
    out.insert("done_reason".to_string(), json!(finish));
    timing_fields(
        &mut out,
        0,
        usage_count(openai, "prompt_tokens"),
        usage_count(openai, "completion_tokens"),
        0,
    );
    Value::Object(out)
}

/// `/v1/embeddings` response → Ollama's `{ "embedding": [...] }`.
pub fn embeddings_response_to_ollama(openai: &Value) -> Value {
    let embedding = openai["data"][0]["embedding"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    json!({ "embedding": embedding })
}

// ---- streaming translation ----

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<ChatDelta>,
    /// `/v1/completions` events carry the token text directly.
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug)]
struct HeldChunk {
    content: String,
}

/// Translates an OpenAI SSE stream into Ollama's newline-delimited objects.
///
/// Each upstream event becomes one chunk, held until its successor arrives:
/// only then is it emitted with `done: false`. The chunk current when a
/// `finish_reason` is observed — or the held chunk when the upstream ends
/// without one — becomes the terminal `done: true` object carrying the
/// timing counters.
pub struct StreamTranslator {
    endpoint: OllamaEndpoint,
    model: String,
    started: Option<Instant>,
    first_content: Option<Instant>,
    last_content: Option<Instant>,
    eval_count: u64,
    held: Option<HeldChunk>,
    finished: bool,
}

impl StreamTranslator {
    pub fn new(endpoint: OllamaEndpoint, model: impl Into<String>) -> Self {
        Self {
            endpoint,
            model: model.into(),
            started: None,
            first_content: None,
            last_content: None,
            eval_count: 0,
            held: None,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one SSE `data:` payload; returns the Ollama objects now ready to
    /// be written out.
    pub fn push_data(&mut self, data: &str) -> Vec<Value> {
        if self.finished {
            return Vec::new();
        }
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        if data.trim() == "[DONE]" {
            return self.finish();
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(_) => return Vec::new(),
        };
        let choice = chunk.choices.into_iter().next();
        let (content, finish_reason) = match choice {
            Some(choice) => {
                let content = choice
                    .text
                    .or(choice.delta.and_then(|d| d.content))
                    .unwrap_or_default();
                (content, choice.finish_reason)
            }
            None => (String::new(), None),
        };

        if !content.is_empty() {
            let now = Instant::now();
            if self.first_content.is_none() {
                self.first_content = Some(now);
            }
            self.last_content = Some(now);
            self.eval_count += 1;
        }

        let mut out = Vec::new();
        if let Some(previous) = self.held.take() {
            out.push(self.chunk_value(&previous.content));
        }
        if let Some(reason) = finish_reason {
            out.push(self.final_value(&content, &reason));
            self.finished = true;
        } else {
            self.held = Some(HeldChunk { content });
        }
        out
    }

    /// The upstream stream ended; emit whatever is held as the terminal
    /// object.
    pub fn finish(&mut self) -> Vec<Value> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let content = self.held.take().map(|held| held.content).unwrap_or_default();
        vec![self.final_value(&content, "stop")]
    }

    fn chunk_value(&self, content: &str) -> Value {
        let mut out = Map::new();
        out.insert("model".to_string(), json!(self.model));
        out.insert("created_at".to_string(), json!(now_rfc3339()));
        match self.endpoint {
            OllamaEndpoint::Chat => {
                out.insert(
                    "message".to_string(),
                    json!({ "role": "assistant", "content": content }),
                );
            }
            _ => {
                out.insert("response".to_string(), json!(content));
            }
        }
        out.insert("done".to_string(), json!(false));
        Value::Object(out)
    }

    fn final_value(&self, content: &str, reason: &str) -> Value {
        let mut value = self.chunk_value(content);
        let out = value.as_object_mut().expect("chunk is an object");
        out.insert("done".to_string(), json!(true));
        out.insert("done_reason".to_string(), json!(reason));

        let total_duration = self
            .started
            .map(|at| at.elapsed().as_nanos() as u64)
            .unwrap_or(0);
        let eval_duration = match (self.first_content, self.last_content) {
            (Some(first), Some(last)) => last.duration_since(first).as_nanos() as u64,
            _ => 0,
        };
        timing_fields(out, total_duration, 0, self.eval_count, eval_duration);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_delta(content: &str) -> String {
        json!({ "choices": [{ "delta": { "content": content } }] }).to_string()
    }

    fn chat_finish(reason: &str) -> String {
        json!({ "choices": [{ "delta": {}, "finish_reason": reason }] }).to_string()
    }

    // ===== Request translation =====

    #[test]
    fn test_generate_request_mapping() {
        let body = json!({
            "model": "llama3",
            "prompt": "Why is the sky blue?",
            "stream": false,
            "options": { "num_predict": 128, "temperature": 0.2, "num_ctx": 4096 }
        });
        let openai = generate_request_to_openai(&body);
        assert_eq!(openai["model"], "llama3");
        assert_eq!(openai["prompt"], "Why is the sky blue?");
        assert_eq!(openai["stream"], false);
        assert_eq!(openai["max_tokens"], 128);
        assert_eq!(openai["temperature"], 0.2);
        // num_ctx is a server-side option with no request equivalent.
        assert!(openai.get("num_ctx").is_none());
    }

    #[test]
    fn test_generate_stream_defaults_to_true() {
        let openai = generate_request_to_openai(&json!({ "model": "m", "prompt": "p" }));
        assert_eq!(openai["stream"], true);
    }

    #[test]
    fn test_chat_request_mapping() {
        let body = json!({
            "model": "llama3",
            "messages": [{ "role": "user", "content": "hi" }],
            "format": "json",
            "options": { "top_p": 0.9 }
        });
        let openai = chat_request_to_openai(&body);
        assert_eq!(openai["messages"][0]["content"], "hi");
        assert_eq!(openai["stream"], true);
        assert_eq!(openai["top_p"], 0.9);
        assert_eq!(openai["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_embeddings_request_uses_prompt_as_input() {
        let openai =
            embeddings_request_to_openai(&json!({ "model": "embed", "prompt": "some text" }));
        assert_eq!(openai["input"], "some text");
        assert!(openai.get("prompt").is_none());
    }

    // ===== Non-streaming response translation =====

    #[test]
    fn test_completion_response_translation() {
        let openai = json!({
            "choices": [{ "text": "The sky is blue.", "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 6, "completion_tokens": 5 }
        });
        let ollama = completion_response_to_ollama("llama3", &openai);
        assert_eq!(ollama["model"], "llama3");
        assert_eq!(ollama["response"], "The sky is blue.");
        assert_eq!(ollama["done"], true);
        assert_eq!(ollama["done_reason"], "stop");
        assert_eq!(ollama["prompt_eval_count"], 6);
        assert_eq!(ollama["eval_count"], 5);
    }

    #[test]
    fn test_chat_response_translation() {
        let openai = json!({
            "choices": [{
                "message": { "role": "assistant", "content": "hello" },
                "finish_reason": "length"
            }]
        });
        let ollama = chat_response_to_ollama("llama3", &openai);
        assert_eq!(ollama["message"]["content"], "hello");
        assert_eq!(ollama["done_reason"], "length");
    }

    #[test]
    fn test_embeddings_response_translation() {
        let openai = json!({ "data": [{ "embedding": [0.1, 0.2, 0.3] }] });
        let ollama = embeddings_response_to_ollama(&openai);
        assert_eq!(ollama["embedding"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_missing_embedding_translates_to_empty_vector() {
        let ollama = embeddings_response_to_ollama(&json!({ "data": [] }));
        assert_eq!(ollama["embedding"].as_array().unwrap().len(), 0);
    }

    // ===== Streaming translation =====

    #[test]
    fn test_deferred_done_holds_one_chunk() {
        let mut translator = StreamTranslator::new(OllamaEndpoint::Chat, "llama3");
        assert!(translator.push_data(&chat_delta("He")).is_empty());

        let second = translator.push_data(&chat_delta("llo"));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0]["message"]["content"], "He");
        assert_eq!(second[0]["done"], false);
    }

    #[test]
    fn test_finish_reason_produces_three_objects_for_two_tokens() {
        let mut translator = StreamTranslator::new(OllamaEndpoint::Chat, "llama3");
        let mut emitted = Vec::new();
        emitted.extend(translator.push_data(&chat_delta("He")));
        emitted.extend(translator.push_data(&chat_delta("llo")));
        emitted.extend(translator.push_data(&chat_finish("stop")));

        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted[0]["message"]["content"], "He");
        assert_eq!(emitted[0]["done"], false);
        assert_eq!(emitted[1]["message"]["content"], "llo");
        assert_eq!(emitted[1]["done"], false);

        let last = &emitted[2];
        assert_eq!(last["done"], true);
        assert_eq!(last["done_reason"], "stop");
        assert_eq!(last["eval_count"], 2);
        assert_eq!(last["load_duration"], 0);
        assert_eq!(last["prompt_eval_count"], 0);
        let total = last["total_duration"].as_u64().unwrap();
        let eval = last["eval_duration"].as_u64().unwrap();
        assert!(total > eval);
    }

    #[test]
    fn test_upstream_end_finalizes_held_chunk() {
        let mut translator = StreamTranslator::new(OllamaEndpoint::Chat, "llama3");
        let _ = translator.push_data(&chat_delta("only"));
        let tail = translator.finish();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0]["message"]["content"], "only");
        assert_eq!(tail[0]["done"], true);
        assert_eq!(tail[0]["done_reason"], "stop");
        assert_eq!(tail[0]["eval_count"], 1);
    }

    #[test]
    fn test_done_marker_finalizes_stream() {
        let mut translator = StreamTranslator::new(OllamaEndpoint::Generate, "llama3");
        let _ = translator.push_data(&json!({ "choices": [{ "text": "hi" }] }).to_string());
        let tail = translator.push_data("[DONE]");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0]["response"], "hi");
        assert_eq!(tail[0]["done"], true);
        assert!(translator.is_finished());
        // Nothing more comes out after the stream is finished.
        assert!(translator.push_data(&chat_delta("late")).is_empty());
        assert!(translator.finish().is_empty());
    }

    #[test]
    fn test_generate_chunks_use_response_field() {
        let mut translator = StreamTranslator::new(OllamaEndpoint::Generate, "llama3");
        let _ = translator.push_data(&json!({ "choices": [{ "text": "a" }] }).to_string());
        let out = translator.push_data(&json!({ "choices": [{ "text": "b" }] }).to_string());
        assert_eq!(out[0]["response"], "a");
        assert!(out[0].get("message").is_none());
    }

    #[test]
    fn test_empty_deltas_do_not_count_as_tokens() {
        let mut translator = StreamTranslator::new(OllamaEndpoint::Chat, "llama3");
        let _ = translator.push_data(&json!({ "choices": [{ "delta": {} }] }).to_string());
        let _ = translator.push_data(&chat_delta("x"));
        let mut emitted = translator.push_data(&chat_finish("stop"));
        let last = emitted.pop().unwrap();
        assert_eq!(last["eval_count"], 1);
    }

    #[test]
    fn test_malformed_event_is_skipped() {
        let mut translator = StreamTranslator::new(OllamaEndpoint::Chat, "llama3");
        assert!(translator.push_data("{ not json").is_empty());
        let _ = translator.push_data(&chat_delta("ok"));
        let tail = translator.finish();
        assert_eq!(tail[0]["message"]["content"], "ok");
    }

    // ===== Shape law =====

    #[test]
    fn test_streaming_final_and_full_translation_share_shape() {
        // The terminal streaming object and the non-streaming translation
        // must expose the same top-level keys with the same primitive types.
        let mut translator = StreamTranslator::new(OllamaEndpoint::Chat, "llama3");
        let _ = translator.push_data(&chat_delta("hi"));
        let streamed = translator.push_data(&chat_finish("stop")).pop().unwrap();

        let full = chat_response_to_ollama(
            "llama3",
            &json!({
                "choices": [{ "message": { "role": "assistant", "content": "hi" }, "finish_reason": "stop" }]
            }),
        );

        let streamed_keys: Vec<&String> = streamed.as_object().unwrap().keys().collect();
        let full_keys: Vec<&String> = full.as_object().unwrap().keys().collect();
        assert_eq!(streamed_keys, full_keys);
        for (key, value) in streamed.as_object().unwrap() {
            let other = &full[key];
            assert_eq!(
                std::mem::discriminant(value),
                std::mem::discriminant(other),
                "type mismatch for key {}",
                key
            );
        }
    }
}
