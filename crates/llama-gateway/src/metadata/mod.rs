//! Model descriptors for the listing endpoints.
//!
//! Descriptors are derived from the GGUF header once and cached on disk
//! keyed by (sanitized model name, file size); a size change invalidates the
//! cache file. Records are immutable after construction — the `state` field
//! is overlaid per call from the running-status predicate.

pub mod gguf;

use std::collections::BTreeMap;
use std::path::PathBuf;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{Config, ModelSpec};

const DEFAULT_CONTEXT_LENGTH: u64 = 4096;

/// Filename fallbacks when the header carries no usable file type.
const QUANT_PATTERNS: &[&str] = &[
    "q2_k", "q3_k_s", "q3_k_m", "q3_k_l", "q4_0", "q4_1", "q4_k_s", "q4_k_m", "q5_0", "q5_1",
    "q5_k_s", "q5_k_m", "q6_k", "q8_0", "bf16", "f16", "f32",
];

fn sanitize_model_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .replace(' ', "_")
}

fn file_basename(spec: &ModelSpec) -> String {
    spec.model_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| spec.name.clone())
}

fn quantization_from_filename(basename: &str) -> Option<String> {
    let lower = basename.to_lowercase();
    QUANT_PATTERNS
        .iter()
        .find(|pattern| lower.contains(*pattern))
        .map(|pattern| pattern.to_uppercase())
}

pub struct MetadataProvider {
    cache_dir: PathBuf,
    records: DashMap<String, Value>,
}

impl MetadataProvider {
    pub fn new(cache_dir: PathBuf) -> Self {
        if let Err(err) = std::fs::create_dir_all(&cache_dir) {
            warn!(
                "could not create metadata cache dir {}: {}",
                cache_dir.display(),
                err
            );
        }
        Self {
            cache_dir,
            records: DashMap::new(),
        }
    }

    /// Descriptor for one model, with the `state` field filled in for this
    /// call.
    pub fn descriptor(&self, spec: &ModelSpec, is_running: bool) -> Value {
        let mut record = match std::fs::metadata(&spec.model_path) {
            Ok(meta) => self.record_for(spec, meta.len()),
            Err(err) => {
                debug!(
                    "cannot stat model file {}: {}",
                    spec.model_path.display(),
                    err
                );
                self.minimal_record(spec, None)
            }
        };
        record["state"] = json!(if is_running { "loaded" } else { "not-loaded" });
        record
    }

    /// Descriptors for every configured model.
    pub fn list(&self, config: &Config, is_running: impl Fn(&str) -> bool) -> Vec<Value> {
        config
            .models
            .values()
            .map(|spec| self.descriptor(spec, is_running(&spec.name)))
            .collect()
    }

    /// Internal model name → external id, as published by the listing
    /// endpoints.
    pub fn id_mapping(&self, config: &Config) -> BTreeMap<String, String> {
        let mut mapping = BTreeMap::new();
        for spec in config.models.values() {
            let record = self.descriptor(spec, false);
            if let Some(id) = record["id"].as_str() {
                mapping.insert(spec.name.clone(), id.to_string());
            }
        }
        mapping
    }

    /// Maps a client-supplied model id back to the internal name. The
    /// external id wins; an id that matches nothing falls back to being an
    /// internal name if one exists.
    pub fn resolve_model_id(&self, config: &Config, requested: &str) -> Option<String> {
        for (internal, external) in self.id_mapping(config) {
            if external == requested {
                return Some(internal);
            }
        }
        if config.models.contains_key(requested) {
            return Some(requested.to_string());
        }
        None
    }

    fn cache_key(&self, spec: &ModelSpec, size: u64) -> String {
        format!("{}_{}", sanitize_model_name(&spec.name), size)
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key))
    }

    fn record_for(&self, spec: &ModelSpec, size: u64) -> Value {
        let key = self.cache_key(spec, size);

        let cached = self.records.get(&key).map(|record| record.clone());
        if let Some(mut record) = cached {
            self.apply_id_override(spec, &key, &mut record);
            return record;
        }

        let cache_path = self.cache_path(&key);
        if let Ok(text) = std::fs::read_to_string(&cache_path) {
            if let Ok(mut record) = serde_json::from_str::<Value>(&text) {
                if record.is_object() {
                    self.apply_id_override(spec, &key, &mut record);
                    self.records.insert(key, record.clone());
                    return record;
                }
            }
            warn!(
                "invalid metadata cache file {}, re-extracting",
                cache_path.display()
            );
        }

        let record = self.extract_record(spec, size);
        self.persist(&key, &record);
        self.records.insert(key, record.clone());
        record
    }

    /// A configured `model_id` takes precedence over whatever the cache says;
    /// a mismatch rewrites the cached record.
    fn apply_id_override(&self, spec: &ModelSpec, key: &str, record: &mut Value) {
        let Some(model_id) = &spec.model_id else {
            return;
        };
        if record["id"].as_str() == Some(model_id.as_str()) {
            return;
        }
        record["id"] = json!(model_id);
        self.persist(key, record);
        self.records.insert(key.to_string(), record.clone());
    }

    fn persist(&self, key: &str, record: &Value) {
        let path = self.cache_path(key);
        match serde_json::to_string_pretty(record) {
            Ok(text) => {
                if let Err(err) = std::fs::write(&path, text) {
                    warn!("failed to write metadata cache {}: {}", path.display(), err);
                }
            }
            Err(err) => warn!("failed to serialize metadata record: {}", err),
        }
    }

    fn extract_record(&self, spec: &ModelSpec, size: u64) -> Value {
        let header = match gguf::read_gguf_header(&spec.model_path) {
            Ok(header) => header,
            Err(err) => {
                warn!(
                    "metadata extraction failed for {}: {}",
                    spec.model_path.display(),
                    err
                );
                return self.minimal_record(spec, Some(size));
            }
        };

        let basename = file_basename(spec);
        let arch = header
            .get_str("general.architecture")
            .unwrap_or("unknown")
            .to_string();

        let id = spec
            .model_id
            .clone()
            .or_else(|| header.get_str("general.name").map(str::to_string))
            .unwrap_or_else(|| basename.clone());

        let model_type = match header.get_str("ggml.model.type") {
            Some(t) if t.eq_ignore_ascii_case("embedding") => "embeddings",
            Some(t) if t.eq_ignore_ascii_case("vlm") => "vlm",
            _ => {
                let lower = basename.to_lowercase();
                if lower.contains("embedding") || lower.contains("embed") {
                    "embeddings"
                } else {
                    "llm"
                }
            }
        };

        let publisher = header
            .get_str("general.quantized_by")
            .or_else(|| header.get_str("general.url"))
            .unwrap_or("local")
            .to_string();

        let mut quantization = header
            .get_u64("general.file_type")
            .map(gguf::file_type_name)
            .or_else(|| quantization_from_filename(&basename))
            .unwrap_or_else(|| "Unknown".to_string());
        if let Some(stripped) = quantization.strip_prefix("MOSTLY_") {
            quantization = stripped.to_string();
        }

        let max_context_length = header
            .get_u64(&format!("{}.context_length", arch))
            .unwrap_or(DEFAULT_CONTEXT_LENGTH);

        json!({
            "id": id,
            "object": "model",
            "type": model_type,
            "publisher": publisher,
            "arch": arch,
            "compatibility_type": "gguf",
            "quantization": quantization,
            "max_context_length": max_context_length,
            "size": size,
            "raw_metadata": Value::Object(header.metadata),
        })
    }

    fn minimal_record(&self, spec: &ModelSpec, size: Option<u64>) -> Value {
        let mut record = json!({
            "id": spec.model_id.clone().unwrap_or_else(|| spec.name.clone()),
            "object": "model",
            "type": "llm",
            "publisher": "local",
            "arch": "unknown",
            "compatibility_type": "unknown",
            "quantization": "unknown",
            "max_context_length": DEFAULT_CONTEXT_LENGTH,
        });
        if let Some(size) = size {
            record["size"] = json!(size);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::gguf::tests::{write_test_gguf, TestValue};
    use super::*;
    use serde_json::json;
    use std::path::Path;

    fn spec_for(name: &str, path: &Path, model_id: Option<&str>) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            model_path: path.to_path_buf(),
            runtime_ref: "default".to_string(),
            model_id: model_id.map(str::to_string),
            has_tools: false,
            parameters: serde_json::Map::new(),
            raw: json!({}),
        }
    }

    fn standard_header() -> Vec<(&'static str, TestValue)> {
        vec![
            ("general.name", TestValue::Str("Meta Llama 3 8B Instruct")),
            ("general.architecture", TestValue::Str("llama")),
            ("general.quantized_by", TestValue::Str("bartowski")),
            ("general.file_type", TestValue::U32(15)),
            ("llama.context_length", TestValue::U32(8192)),
        ]
    }

    #[test]
    fn test_descriptor_derivation_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let model = write_test_gguf(dir.path(), "llama3.Q4_K_M.gguf", &standard_header());
        let provider = MetadataProvider::new(dir.path().join("cache"));
        let spec = spec_for("llama3", &model, None);

        let record = provider.descriptor(&spec, false);
        assert_eq!(record["id"], "Meta Llama 3 8B Instruct");
        assert_eq!(record["object"], "model");
        assert_eq!(record["type"], "llm");
        assert_eq!(record["publisher"], "bartowski");
        assert_eq!(record["arch"], "llama");
        assert_eq!(record["compatibility_type"], "gguf");
        // MOSTLY_Q4_K_M with the prefix stripped.
        assert_eq!(record["quantization"], "Q4_K_M");
        assert_eq!(record["max_context_length"], 8192);
        assert_eq!(record["state"], "not-loaded");
    }

    #[test]
    fn test_state_overlay_follows_running_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let model = write_test_gguf(dir.path(), "m.gguf", &standard_header());
        let provider = MetadataProvider::new(dir.path().join("cache"));
        let spec = spec_for("m", &model, None);

        assert_eq!(provider.descriptor(&spec, true)["state"], "loaded");
        assert_eq!(provider.descriptor(&spec, false)["state"], "not-loaded");
    }

    #[test]
    fn test_cache_file_keyed_by_sanitized_name_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let model = write_test_gguf(dir.path(), "m.gguf", &standard_header());
        let size = std::fs::metadata(&model).unwrap().len();
        let cache_dir = dir.path().join("cache");
        let provider = MetadataProvider::new(cache_dir.clone());
        let spec = spec_for("my model: v2", &model, None);

        provider.descriptor(&spec, false);
        let expected = cache_dir.join(format!("my_model__v2_{}.json", size));
        assert!(expected.exists());
    }

    #[test]
    fn test_size_change_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let model = write_test_gguf(dir.path(), "m.gguf", &standard_header());
        let provider = MetadataProvider::new(dir.path().join("cache"));
        let spec = spec_for("m", &model, None);
        assert_eq!(provider.descriptor(&spec, false)["id"], "Meta Llama 3 8B Instruct");

        // Rewrite the file with a different name and a different size.
        let mut entries = standard_header();
        entries[0] = ("general.name", TestValue::Str("Rebuilt Model With Longer Name"));
        write_test_gguf(dir.path(), "m.gguf", &entries);

        let record = provider.descriptor(&spec, false);
        assert_eq!(record["id"], "Rebuilt Model With Longer Name");
    }

    #[test]
    fn test_model_id_override_wins_and_rewrites_cache() {
        let dir = tempfile::tempdir().unwrap();
        let model = write_test_gguf(dir.path(), "m.gguf", &standard_header());
        let size = std::fs::metadata(&model).unwrap().len();
        let cache_dir = dir.path().join("cache");

        // Seed the cache without an override.
        let provider = MetadataProvider::new(cache_dir.clone());
        let plain = spec_for("m", &model, None);
        provider.descriptor(&plain, false);

        let overridden = spec_for("m", &model, Some("vendor/custom-model.gguf"));
        let record = provider.descriptor(&overridden, false);
        assert_eq!(record["id"], "vendor/custom-model.gguf");

        let cached: Value = serde_json::from_str(
            &std::fs::read_to_string(cache_dir.join(format!("m_{}.json", size))).unwrap(),
        )
        .unwrap();
        assert_eq!(cached["id"], "vendor/custom-model.gguf");
    }

    #[test]
    fn test_non_gguf_file_yields_minimal_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weird.bin");
        std::fs::write(&path, b"not a gguf file at all").unwrap();
        let provider = MetadataProvider::new(dir.path().join("cache"));
        let spec = spec_for("weird", &path, None);

        let record = provider.descriptor(&spec, false);
        assert_eq!(record["id"], "weird");
        assert_eq!(record["arch"], "unknown");
        assert_eq!(record["max_context_length"], 4096);
    }

    #[test]
    fn test_embedding_model_detected_from_filename() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            ("general.architecture", TestValue::Str("nomic-bert")),
            ("nomic-bert.context_length", TestValue::U32(2048)),
        ];
        let model = write_test_gguf(dir.path(), "nomic-embed-text.f16.gguf", &entries);
        let provider = MetadataProvider::new(dir.path().join("cache"));
        let spec = spec_for("embedder", &model, None);

        let record = provider.descriptor(&spec, false);
        assert_eq!(record["type"], "embeddings");
        assert_eq!(record["max_context_length"], 2048);
        // No file_type in the header: quantization falls back to the name.
        assert_eq!(record["quantization"], "F16");
    }

    #[test]
    fn test_id_mapping_and_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let model = write_test_gguf(dir.path(), "m.gguf", &standard_header());
        let provider = MetadataProvider::new(dir.path().join("cache"));

        let doc = json!({
            "models": {
                "internal-name": { "model_path": model.display().to_string() }
            }
        });
        let config = crate::config::Config::from_json(&doc.to_string()).unwrap();

        let mapping = provider.id_mapping(&config);
        assert_eq!(mapping["internal-name"], "Meta Llama 3 8B Instruct");

        // External id resolves to the internal name; the internal name still
        // works as a fallback; garbage resolves to nothing.
        assert_eq!(
            provider.resolve_model_id(&config, "Meta Llama 3 8B Instruct"),
            Some("internal-name".to_string())
        );
        assert_eq!(
            provider.resolve_model_id(&config, "internal-name"),
            Some("internal-name".to_string())
        );
        assert_eq!(provider.resolve_model_id(&config, "missing"), None);
    }

    #[test]
    fn test_sanitize_model_name() {
        assert_eq!(sanitize_model_name("llama 3:8b/it"), "llama_3_8b_it");
        assert_eq!(sanitize_model_name("plain-name.v2"), "plain-name.v2");
    }
}
