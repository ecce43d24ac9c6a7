//! Layered application configuration and API key handling.
//!
//! Configuration is loaded from JSON files in a config directory:
//! `config.default.json` first, then `config.<environment>.json` on top,
//! where the environment comes from the `MEDICAL_ASSISTANT_ENV` variable.
//! API keys are never stored in config files; they are read from
//! environment variables and checked against per-provider shape patterns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Deployment environment selecting which config file overrides defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
    Testing,
}

impl Environment {
    /// Resolve from the `MEDICAL_ASSISTANT_ENV` variable.
    ///
    /// Invalid or missing values fall back to `Development` with a warning.
    pub fn from_env() -> Self {
        match std::env::var("MEDICAL_ASSISTANT_ENV") {
            Ok(value) => match value.to_lowercase().as_str() {
                "development" => Environment::Development,
                "production" => Environment::Production,
                "testing" => Environment::Testing,
                other => {
                    log::warn!(
                        "Config: invalid MEDICAL_ASSISTANT_ENV '{}', using development",
                        other
                    );
                    Environment::Development
                }
            },
            Err(_) => Environment::Development,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Testing => "testing",
        }
    }
}

/// Retry, circuit breaker and timeout settings for provider API calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base timeout in seconds for provider API calls.
    pub timeout: u64,
    pub max_retries: u32,
    pub initial_retry_delay: f64,
    pub backoff_factor: f64,
    pub max_retry_delay: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            timeout: 60,
            max_retries: 3,
            initial_retry_delay: 1.0,
            backoff_factor: 2.0,
            max_retry_delay: 60.0,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: 60,
        }
    }
}

/// Storage locations and SQLite pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Folder for audio blobs and the database file.
    pub base_folder: PathBuf,
    pub database_name: String,
    pub db_pool_size: u32,
    /// Seconds to wait for a pooled connection before giving up.
    pub db_timeout: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base_folder = dirs::document_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("MedScribe")
            .join("storage");
        Self {
            base_folder,
            database_name: "medscribe.db".to_string(),
            db_pool_size: 5,
            db_timeout: 30,
        }
    }
}

/// Background queue behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Worker pool size override. `None` picks `min(cpus - 1, 6)`.
    pub max_background_workers: Option<usize>,
    pub auto_retry_failed: bool,
    pub max_retry_attempts: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_background_workers: None,
            auto_retry_failed: true,
            max_retry_attempts: 3,
        }
    }
}

/// Deepgram-specific tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepgramConfig {
    pub model: String,
    pub smart_format: bool,
    pub diarize: bool,
}

impl Default for DeepgramConfig {
    fn default() -> Self {
        Self {
            model: "nova-2-medical".to_string(),
            smart_format: true,
            diarize: false,
        }
    }
}

/// ElevenLabs-specific tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevenLabsConfig {
    pub model_id: String,
    pub diarize: bool,
    /// Fixed speaker count; omitted lets the API auto-detect.
    pub num_speakers: Option<u32>,
    /// Re-upload from a temp file when the in-memory upload comes back
    /// empty or truncated.
    pub retry_with_file: bool,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            model_id: "scribe_v1".to_string(),
            diarize: true,
            num_speakers: None,
            retry_with_file: true,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(skip)]
    pub environment: Option<Environment>,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub processing: ProcessingConfig,
    pub deepgram: DeepgramConfig,
    pub elevenlabs: ElevenLabsConfig,
}

impl AppConfig {
    /// Load configuration for the environment selected by
    /// `MEDICAL_ASSISTANT_ENV`.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        Self::load_for(config_dir, Environment::from_env())
    }

    /// Load configuration for an explicit environment.
    ///
    /// Reads `config.default.json` then `config.<env>.json`, deep-merging
    /// the environment file over the defaults. Missing files are treated
    /// as empty objects.
    pub fn load_for(config_dir: &Path, environment: Environment) -> Result<Self, ConfigError> {
        let default_value = load_json_file(&config_dir.join("config.default.json"))?;
        let env_value = load_json_file(
            &config_dir.join(format!("config.{}.json", environment.as_str())),
        )?;

        let merged = merge_values(default_value, env_value);
        let mut config: AppConfig =
            serde_json::from_value(merged).map_err(|source| ConfigError::Parse {
                path: config_dir.join(format!("config.{}.json", environment.as_str())),
                source,
            })?;
        config.environment = Some(environment);
        config.validate()?;

        log::info!(
            "Config: loaded for environment '{}' (storage: {})",
            environment.as_str(),
            config.storage.base_folder.display()
        );
        Ok(config)
    }

    /// Validate numeric ranges and make sure the storage folder exists.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.api.timeout == 0 {
            errors.push("api.timeout must be positive".to_string());
        }
        if self.api.backoff_factor < 1.0 {
            errors.push("api.backoff_factor must be >= 1.0".to_string());
        }
        if self.api.initial_retry_delay < 0.0 {
            errors.push("api.initial_retry_delay must be non-negative".to_string());
        }
        if self.storage.db_pool_size == 0 {
            errors.push("storage.db_pool_size must be positive".to_string());
        }
        if self.storage.db_timeout == 0 {
            errors.push("storage.db_timeout must be positive".to_string());
        }
        if self.storage.database_name.trim().is_empty() {
            errors.push("storage.database_name must not be empty".to_string());
        }
        if self.processing.max_background_workers == Some(0) {
            errors.push("processing.max_background_workers must be >= 1".to_string());
        }

        if !self.storage.base_folder.exists() {
            if let Err(e) = std::fs::create_dir_all(&self.storage.base_folder) {
                errors.push(format!(
                    "Cannot create storage folder {}: {}",
                    self.storage.base_folder.display(),
                    e
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }

    /// Absolute path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.storage.base_folder.join(&self.storage.database_name)
    }

    /// Base provider call timeout as a `Duration`.
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout)
    }
}

fn load_json_file(path: &Path) -> Result<serde_json::Value, ConfigError> {
    if !path.exists() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Deep-merge `override_value` over `base`. Objects merge recursively;
/// everything else is replaced.
fn merge_values(base: serde_json::Value, override_value: serde_json::Value) -> serde_json::Value {
    match (base, override_value) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(override_map)) => {
            for (key, value) in override_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            serde_json::Value::Object(base_map)
        }
        (_, override_value) => override_value,
    }
}

// ============================================================================
// API key retrieval and shape validation
// ============================================================================

/// Environment variable used to hold each provider's API key.
fn api_key_env_var(provider: &str) -> Option<&'static str> {
    match provider.to_lowercase().as_str() {
        "openai" => Some("OPENAI_API_KEY"),
        "deepgram" => Some("DEEPGRAM_API_KEY"),
        "elevenlabs" => Some("ELEVENLABS_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "perplexity" => Some("PERPLEXITY_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "grok" => Some("GROK_API_KEY"),
        _ => None,
    }
}

/// Read a provider's API key from the environment.
///
/// Empty values are treated as absent.
pub fn api_key_from_env(provider: &str) -> Option<String> {
    let var = api_key_env_var(provider)?;
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

const MAX_API_KEY_LENGTH: usize = 200;

fn key_patterns() -> &'static HashMap<&'static str, regex::Regex> {
    static PATTERNS: OnceLock<HashMap<&'static str, regex::Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let mut map = HashMap::new();
        let mut add = |provider: &'static str, pattern: &str| {
            // Patterns are compile-time constants; a failure here is a bug
            // in the table itself.
            map.insert(
                provider,
                regex::Regex::new(pattern).expect("invalid API key pattern"),
            );
        };
        add("openai", r"^sk-[A-Za-z0-9_-]{20,}$");
        add("deepgram", r"^[A-Za-z0-9]{32,}$");
        add("elevenlabs", r"^sk_[A-Za-z0-9]{40,}$");
        add("groq", r"^gsk_[A-Za-z0-9]{52}$");
        add("perplexity", r"^pplx-[a-f0-9]{48}$");
        add("grok", r"^xai-[A-Za-z0-9]+$");
        add("anthropic", r"^sk-ant-[A-Za-z0-9_-]{95,}$");
        map
    })
}

/// Validate an API key's shape for a provider.
///
/// This is a fast reject only: a passing shape does not prove the key is
/// live. Unknown providers only get the generic checks.
pub fn validate_api_key(provider: &str, api_key: &str) -> Result<(), String> {
    if api_key.is_empty() {
        return Err("API key cannot be empty".to_string());
    }
    if api_key.len() > MAX_API_KEY_LENGTH {
        return Err(format!(
            "API key is too long (max {} characters)",
            MAX_API_KEY_LENGTH
        ));
    }

    let api_key = api_key.trim();

    if api_key.starts_with('"') || api_key.ends_with('"') {
        return Err("API key should not include quotes".to_string());
    }
    if api_key.contains(' ') {
        return Err("API key should not contain spaces".to_string());
    }
    if api_key.starts_with('<') || api_key.ends_with('>') {
        return Err("Please replace the placeholder with your actual API key".to_string());
    }

    if let Some(pattern) = key_patterns().get(provider.to_lowercase().as_str()) {
        if !pattern.is_match(api_key) {
            return Err(format!("Invalid {} API key format", provider));
        }
    }

    Ok(())
}
