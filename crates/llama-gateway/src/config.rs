//! Configuration snapshot and loading.
//!
//! The configuration lives in a single JSON document under the user's config
//! directory. A loaded [`Config`] is immutable; hot reload swaps the whole
//! snapshot atomically through [`ConfigHandle`], so request handlers never
//! observe a half-updated view.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

pub const DEFAULT_RUNTIME: &str = "llama-server";
pub const OPENAI_GATEWAY_PORT: u16 = 1234;
pub const OLLAMA_GATEWAY_PORT: u16 = 11434;

/// `~/.llama-gateway`
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llama-gateway")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.json")
}

pub fn metadata_cache_dir() -> PathBuf {
    config_dir().join("metadata_cache")
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub name: String,
    pub model_path: PathBuf,
    /// Name of the runtime entry this model runs under.
    pub runtime_ref: String,
    /// External id override for the listing endpoints.
    pub model_id: Option<String>,
    pub has_tools: bool,
    /// Extra llama-server flags: `true` passes the bare flag, `false` omits
    /// it, anything else is stringified after the flag.
    pub parameters: serde_json::Map<String, Value>,
    /// The model's config entry as written, used for the fingerprint.
    pub(crate) raw: Value,
}

impl ModelSpec {
    /// 16-hex-char digest of the model's configuration. `serde_json` keeps
    /// object keys sorted, so the digest is stable across reloads.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(&self.raw).unwrap_or_default();
        let digest = Md5::digest(canonical.as_bytes());
        let mut encoded = hex::encode(digest);
        encoded.truncate(16);
        encoded
    }

    pub fn raw_config(&self) -> &Value {
        &self.raw
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSpec {
    pub name: String,
    /// Path (or PATH-resolvable name) of the worker binary.
    pub command: String,
    pub supports_tools: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub models: BTreeMap<String, ModelSpec>,
    pub runtimes: BTreeMap<String, RuntimeSpec>,
    pub default_runtime: String,
    pub concurrent_runners: usize,
    pub ollama_enabled: bool,
    pub openai_enabled: bool,
    /// When set, the OpenAI gateway requires `Authorization: Bearer <key>`.
    pub api_key: Option<String>,
    pub prompt_logging_enabled: bool,
}

// ---- raw on-disk schema ----

fn default_true() -> bool {
    true
}

fn default_runtime_name() -> String {
    DEFAULT_RUNTIME.to_string()
}

fn default_concurrent() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    models: BTreeMap<String, RawModel>,
    #[serde(rename = "llama-runtimes", default)]
    llama_runtimes: BTreeMap<String, RawRuntime>,
    #[serde(default = "default_runtime_name")]
    default_runtime: String,
    #[serde(rename = "concurrentRunners", default = "default_concurrent")]
    concurrent_runners: i64,
    #[serde(default)]
    proxies: RawProxies,
    #[serde(default)]
    logging: RawLogging,
}

#[derive(Debug, Deserialize)]
struct RawModel {
    model_path: String,
    llama_cpp_runtime: Option<String>,
    model_id: Option<String>,
    has_tools: Option<bool>,
    #[serde(default)]
    parameters: serde_json::Map<String, Value>,
}

/// Runtime entries come in two shapes: the legacy bare command string and the
/// object form carrying a tool-support flag. Legacy entries are promoted to
/// the object form with `supports_tools = true`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRuntime {
    Legacy(String),
    Full {
        runtime: String,
        #[serde(default = "default_true")]
        supports_tools: bool,
    },
}

#[derive(Debug, Deserialize, Default)]
struct RawProxies {
    #[serde(default)]
    ollama: RawOllamaProxy,
    #[serde(default)]
    lmstudio: RawLmStudioProxy,
}

#[derive(Debug, Deserialize)]
struct RawOllamaProxy {
    #[serde(default = "default_true")]
    enabled: bool,
}

impl Default for RawOllamaProxy {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Deserialize)]
struct RawLmStudioProxy {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    api_key: Option<String>,
}

impl Default for RawLmStudioProxy {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawLogging {
    #[serde(default)]
    prompt_logging_enabled: bool,
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self> {
        let raw_doc: Value =
            serde_json::from_str(text).context("config file is not valid JSON")?;
        let raw: RawConfig =
            serde_json::from_value(raw_doc.clone()).context("config file has invalid structure")?;

        if raw.concurrent_runners < 1 {
            anyhow::bail!(
                "concurrentRunners must be a positive integer, got {}",
                raw.concurrent_runners
            );
        }

        let mut runtimes = BTreeMap::new();
        for (name, entry) in raw.llama_runtimes {
            let (command, supports_tools) = match entry {
                RawRuntime::Legacy(command) => (command, true),
                RawRuntime::Full {
                    runtime,
                    supports_tools,
                } => (runtime, supports_tools),
            };
            if command.trim().is_empty() {
                warn!("runtime entry '{}' has an empty command, skipping", name);
                continue;
            }
            runtimes.insert(
                name.clone(),
                RuntimeSpec {
                    name,
                    command: command.trim().to_string(),
                    supports_tools,
                },
            );
        }

        let raw_models = raw_doc.get("models").cloned().unwrap_or(Value::Null);
        let mut models = BTreeMap::new();
        for (name, entry) in raw.models {
            if entry.model_path.trim().is_empty() {
                warn!("model '{}' has an empty model_path, skipping", name);
                continue;
            }
            let raw_entry = raw_models.get(&name).cloned().unwrap_or(Value::Null);
            models.insert(
                name.clone(),
                ModelSpec {
                    name: name.clone(),
                    model_path: PathBuf::from(entry.model_path.trim()),
                    runtime_ref: entry
                        .llama_cpp_runtime
                        .unwrap_or_else(|| "default".to_string()),
                    model_id: entry.model_id,
                    has_tools: entry.has_tools.unwrap_or(false),
                    parameters: entry.parameters,
                    raw: raw_entry,
                },
            );
        }

        Ok(Config {
            models,
            runtimes,
            default_runtime: raw.default_runtime,
            concurrent_runners: raw.concurrent_runners as usize,
            ollama_enabled: raw.proxies.ollama.enabled,
            openai_enabled: raw.proxies.lmstudio.enabled,
            api_key: raw.proxies.lmstudio.api_key,
            prompt_logging_enabled: raw.logging.prompt_logging_enabled,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&text)
    }

    /// Creates the config directory and a default document when absent.
    pub fn ensure_exists(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if !path.exists() {
            let default_doc = serde_json::json!({
                "models": {},
                "llama-runtimes": {},
                "default_runtime": DEFAULT_RUNTIME,
                "concurrentRunners": 1,
                "proxies": {
                    "ollama": { "enabled": true },
                    "lmstudio": { "enabled": true, "api_key": null }
                },
                "logging": { "prompt_logging_enabled": false }
            });
            std::fs::write(path, serde_json::to_string_pretty(&default_doc)?)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("created default config at {}", path.display());
        }
        Ok(())
    }

    pub fn model(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    /// Resolves the runtime a model runs under. Unknown references fall back
    /// to the default runtime entry, or to the default runtime name used as a
    /// bare PATH command when no such entry exists.
    pub fn runtime_for(&self, spec: &ModelSpec) -> RuntimeSpec {
        if let Some(rt) = self.runtimes.get(&spec.runtime_ref) {
            return rt.clone();
        }
        if let Some(rt) = self.runtimes.get(&self.default_runtime) {
            return rt.clone();
        }
        RuntimeSpec {
            name: self.default_runtime.clone(),
            command: self.default_runtime.clone(),
            supports_tools: true,
        }
    }
}

/// Shared handle to the current config snapshot. Cloning is cheap; readers
/// call [`ConfigHandle::current`] once per request and keep that `Arc`.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<Config>>,
    path: Arc<PathBuf>,
}

impl ConfigHandle {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(Arc::new(config))),
            path: Arc::new(path),
        }
    }

    pub fn load(path: PathBuf) -> Result<Self> {
        Config::ensure_exists(&path)?;
        let config = Config::load(&path)?;
        Ok(Self::new(config, path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    /// Re-reads the config file and swaps the snapshot. Returns the names of
    /// models whose spec changed or disappeared; the caller is expected to
    /// stop their workers so the next start picks up the new parameters.
    pub fn reload(&self) -> Result<Vec<String>> {
        let fresh = Config::load(&self.path)?;
        let previous = self.inner.load_full();

        let mut changed = Vec::new();
        for (name, old_spec) in &previous.models {
            match fresh.models.get(name) {
                Some(new_spec) if new_spec.raw == old_spec.raw => {}
                _ => changed.push(name.clone()),
            }
        }

        self.inner.store(Arc::new(fresh));
        info!(
            "config reloaded from {} ({} model spec(s) changed)",
            self.path.display(),
            changed.len()
        );
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_config_text() -> &'static str {
        r#"{
            "models": {
                "llama3": {
                    "model_path": "/models/llama3.Q4_K_M.gguf",
                    "llama_cpp_runtime": "cuda",
                    "parameters": { "ctx_size": 8192, "flash_attn": true, "mlock": false }
                },
                "embed": {
                    "model_path": "/models/nomic-embed.gguf",
                    "model_id": "nomic/nomic-embed-text.gguf",
                    "has_tools": false
                }
            },
            "llama-runtimes": {
                "cuda": { "runtime": "/opt/llama/llama-server-cuda", "supports_tools": false },
                "legacy": "/opt/llama/llama-server",
                "broken": "   "
            },
            "default_runtime": "llama-server",
            "concurrentRunners": 2,
            "proxies": {
                "ollama": { "enabled": true },
                "lmstudio": { "enabled": true, "api_key": "secret-key" }
            },
            "logging": { "prompt_logging_enabled": true }
        }"#
    }

    // ===== Loading and promotion =====

    #[test]
    fn test_parse_full_document() {
        let config = Config::from_json(sample_config_text()).unwrap();
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.concurrent_runners, 2);
        assert_eq!(config.default_runtime, "llama-server");
        assert!(config.ollama_enabled);
        assert!(config.openai_enabled);
        assert_eq!(config.api_key.as_deref(), Some("secret-key"));
        assert!(config.prompt_logging_enabled);
    }

    #[test]
    fn test_legacy_runtime_promoted_with_tool_support() {
        let config = Config::from_json(sample_config_text()).unwrap();
        let legacy = &config.runtimes["legacy"];
        assert_eq!(legacy.command, "/opt/llama/llama-server");
        assert!(legacy.supports_tools);
    }

    #[test]
    fn test_object_runtime_keeps_tool_flag() {
        let config = Config::from_json(sample_config_text()).unwrap();
        let cuda = &config.runtimes["cuda"];
        assert_eq!(cuda.command, "/opt/llama/llama-server-cuda");
        assert!(!cuda.supports_tools);
    }

    #[test]
    fn test_empty_runtime_command_skipped() {
        let config = Config::from_json(sample_config_text()).unwrap();
        assert!(!config.runtimes.contains_key("broken"));
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = Config::from_json("{}").unwrap();
        assert!(config.models.is_empty());
        assert_eq!(config.concurrent_runners, 1);
        assert_eq!(config.default_runtime, DEFAULT_RUNTIME);
        assert!(config.ollama_enabled);
        assert!(config.openai_enabled);
        assert!(config.api_key.is_none());
        assert!(!config.prompt_logging_enabled);
    }

    #[test]
    fn test_invalid_concurrency_rejected() {
        let err = Config::from_json(r#"{"concurrentRunners": 0}"#).unwrap_err();
        assert!(err.to_string().contains("concurrentRunners"));
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(Config::from_json("not json").is_err());
    }

    // ===== Runtime resolution =====

    #[test]
    fn test_runtime_for_named_runtime() {
        let config = Config::from_json(sample_config_text()).unwrap();
        let spec = config.model("llama3").unwrap();
        let rt = config.runtime_for(spec);
        assert_eq!(rt.command, "/opt/llama/llama-server-cuda");
    }

    #[test]
    fn test_runtime_for_unknown_reference_falls_back_to_default() {
        let config = Config::from_json(sample_config_text()).unwrap();
        let spec = config.model("embed").unwrap();
        // "default" names no entry; falls back to a bare PATH command.
        let rt = config.runtime_for(spec);
        assert_eq!(rt.command, "llama-server");
        assert!(rt.supports_tools);
    }

    // ===== Fingerprint =====

    #[test]
    fn test_fingerprint_is_16_hex_chars() {
        let config = Config::from_json(sample_config_text()).unwrap();
        let fp = config.model("llama3").unwrap().fingerprint();
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_stable_across_loads() {
        let a = Config::from_json(sample_config_text()).unwrap();
        let b = Config::from_json(sample_config_text()).unwrap();
        assert_eq!(
            a.model("llama3").unwrap().fingerprint(),
            b.model("llama3").unwrap().fingerprint()
        );
    }

    #[test]
    fn test_fingerprint_differs_per_model() {
        let config = Config::from_json(sample_config_text()).unwrap();
        assert_ne!(
            config.model("llama3").unwrap().fingerprint(),
            config.model("embed").unwrap().fingerprint()
        );
    }

    // ===== Hot reload =====

    #[test]
    fn test_reload_reports_changed_models() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, sample_config_text()).unwrap();

        let handle = ConfigHandle::load(path.clone()).unwrap();
        assert_eq!(handle.current().models.len(), 2);

        // Change one model's parameters, drop the other.
        let updated = r#"{
            "models": {
                "llama3": {
                    "model_path": "/models/llama3.Q4_K_M.gguf",
                    "llama_cpp_runtime": "cuda",
                    "parameters": { "ctx_size": 4096 }
                }
            },
            "llama-runtimes": { "cuda": "/opt/llama/llama-server-cuda" }
        }"#;
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(updated.as_bytes()).unwrap();

        let mut changed = handle.reload().unwrap();
        changed.sort();
        assert_eq!(changed, vec!["embed".to_string(), "llama3".to_string()]);
        assert_eq!(handle.current().models.len(), 1);
    }

    #[test]
    fn test_reload_unchanged_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, sample_config_text()).unwrap();

        let handle = ConfigHandle::load(path).unwrap();
        let changed = handle.reload().unwrap();
        assert!(changed.is_empty());
    }

    #[test]
    fn test_ensure_exists_writes_default_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        Config::ensure_exists(&path).unwrap();
        let config = Config::load(&path).unwrap();
        assert!(config.models.is_empty());
        assert_eq!(config.concurrent_runners, 1);
    }
}
