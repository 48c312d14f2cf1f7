//! Configuration management for Meridian.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use llm_core::LlmProvider;
use llm_core::providers::{
    AnthropicProvider, LoremConfig, LoremProvider, OpenAiProvider, UnifiedBackend,
    UnifiedProvider,
};
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Provider API type.
///
/// Determines which API format to use for communication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderApiType {
    /// Anthropic Messages API (unique streaming format)
    #[default]
    Anthropic,
    /// `OpenAI` Chat Completions API (also used by compatible providers)
    OpenAi,
    /// Google Gemini API
    Google,
    /// Groq API
    Groq,
    /// Mistral API
    Mistral,
    /// Local filler generator for testing without network access
    Lorem,
}

/// Individual provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type", default)]
    pub api_type: ProviderApiType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model used when a request names none, as `provider/model`.
    pub default_model: String,

    /// API configuration.
    pub api: ApiConfig,

    /// Database configuration.
    pub database: DatabaseConfig,

    /// Streaming engine limits.
    pub streaming: StreamingConfig,

    /// Lorem generator settings.
    pub lorem: LoremSettings,

    /// Document tool settings.
    pub tools: ToolsConfig,

    /// Provider definitions by name.
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_model: "anthropic/claude-sonnet-4-20250514".to_string(),
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            streaming: StreamingConfig::default(),
            lorem: LoremSettings::default(),
            tools: ToolsConfig::default(),
            providers: default_providers(),
        }
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, falling back to defaults when absent.
    ///
    /// Providers named in the file are merged over the built-in set.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        for (name, provider) in default_providers() {
            config.providers.entry(name).or_insert(provider);
        }
        Ok(config)
    }

    /// Get the configuration file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Get the config directory path (`~/.config/meridian/`).
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined.
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg_config_home).join("meridian"));
        }

        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;

        Ok(base.config_dir().join("meridian"))
    }

    /// Get the data directory path (`~/.local/share/meridian/`).
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined.
    pub fn data_dir() -> anyhow::Result<PathBuf> {
        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("could not determine data directory"))?;

        Ok(base.data_dir().join("meridian"))
    }

    /// Database file, from `[database]` or the data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured and the data directory
    /// cannot be determined.
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.database.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("meridian.db")),
        }
    }

    /// Create a provider by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the provider is unknown or its API key
    /// is missing.
    pub fn create_provider_by_name(&self, name: &str) -> Result<Arc<dyn LlmProvider>> {
        let config = self.providers.get(name).ok_or_else(|| {
            Error::Config(format!("unknown provider '{name}', check [providers] config"))
        })?;

        let missing_key_error = || {
            Error::Config(format!(
                "no API key configured for provider '{name}', set {}",
                config.api_key_env.as_deref().unwrap_or("its api_key_env")
            ))
        };

        let provider: Arc<dyn LlmProvider> = match config.api_type {
            ProviderApiType::Anthropic => {
                let key = resolve_api_key(config).ok_or_else(missing_key_error)?;
                let provider = AnthropicProvider::new(key)?;
                match &config.base_url {
                    Some(url) => Arc::new(provider.with_base_url(url)),
                    None => Arc::new(provider),
                }
            }
            ProviderApiType::OpenAi => Arc::new(OpenAiProvider::with_config(
                name,
                resolve_api_key(config),
                config.base_url.clone(),
            )),
            ProviderApiType::Google => {
                let key = resolve_api_key(config).ok_or_else(missing_key_error)?;
                Arc::new(UnifiedProvider::new(UnifiedBackend::Google, key)?)
            }
            ProviderApiType::Groq => {
                let key = resolve_api_key(config).ok_or_else(missing_key_error)?;
                Arc::new(UnifiedProvider::new(UnifiedBackend::Groq, key)?)
            }
            ProviderApiType::Mistral => {
                let key = resolve_api_key(config).ok_or_else(missing_key_error)?;
                Arc::new(UnifiedProvider::new(UnifiedBackend::Mistral, key)?)
            }
            ProviderApiType::Lorem => Arc::new(LoremProvider::new(self.lorem.to_config())),
        };

        tracing::debug!(provider = %name, "constructed provider");
        Ok(provider)
    }
}

fn resolve_api_key(config: &ProviderConfig) -> Option<String> {
    config
        .api_key_env
        .as_ref()
        .and_then(|env_name| std::env::var(env_name).ok())
        .filter(|key| !key.is_empty())
}

/// Get the default provider configurations.
fn default_providers() -> HashMap<String, ProviderConfig> {
    let mut providers = HashMap::new();

    providers.insert(
        "anthropic".to_string(),
        ProviderConfig {
            api_type: ProviderApiType::Anthropic,
            base_url: None,
            api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
        },
    );

    providers.insert(
        "openai".to_string(),
        ProviderConfig {
            api_type: ProviderApiType::OpenAi,
            base_url: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
        },
    );

    providers.insert(
        "ollama".to_string(),
        ProviderConfig {
            api_type: ProviderApiType::OpenAi,
            base_url: Some("http://localhost:11434/v1".to_string()),
            api_key_env: None,
        },
    );

    providers.insert(
        "google".to_string(),
        ProviderConfig {
            api_type: ProviderApiType::Google,
            base_url: None,
            api_key_env: Some("GOOGLE_API_KEY".to_string()),
        },
    );

    providers.insert(
        "groq".to_string(),
        ProviderConfig {
            api_type: ProviderApiType::Groq,
            base_url: None,
            api_key_env: Some("GROQ_API_KEY".to_string()),
        },
    );

    providers.insert(
        "mistral".to_string(),
        ProviderConfig {
            api_type: ProviderApiType::Mistral,
            base_url: None,
            api_key_env: Some("MISTRAL_API_KEY".to_string()),
        },
    );

    providers.insert(
        "openrouter".to_string(),
        ProviderConfig {
            api_type: ProviderApiType::OpenAi,
            base_url: Some("https://openrouter.ai/api/v1".to_string()),
            api_key_env: Some("OPENROUTER_API_KEY".to_string()),
        },
    );

    providers.insert(
        "lorem".to_string(),
        ProviderConfig {
            api_type: ProviderApiType::Lorem,
            base_url: None,
            api_key_env: None,
        },
    );

    providers
}

/// API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Host to bind to.
    pub host: String,

    /// Port to bind to.
    pub port: u16,

    /// Bearer token required on `/api` routes.
    /// Can also be set via `MERIDIAN_API_TOKEN` environment variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7890,
            token: None,
        }
    }
}

impl ApiConfig {
    /// Get the API token, preferring env var over config file.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        std::env::var("MERIDIAN_API_TOKEN")
            .ok()
            .or_else(|| self.token.clone())
    }

    /// Generate a new random API token.
    #[must_use]
    pub fn generate_token() -> String {
        use rand::Rng;
        let mut rng = rand::rng();
        let bytes: [u8; 32] = rng.random();
        format!("mer_{}", hex::encode(bytes))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `meridian.db` in the data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Streaming engine limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Provider calls allowed after the first within one turn.
    pub max_tool_rounds: u32,

    /// Deadline for one provider call, in seconds.
    pub provider_timeout_secs: u64,

    /// Deadline for one tool execution, in seconds.
    pub tool_timeout_secs: u64,

    /// Attempts at the terminal commit before giving up.
    pub persist_retries: u32,

    /// How long a finished stream stays available for catchup, in seconds.
    pub retention_secs: u64,

    /// `max_tokens` sent when a request does not set one.
    pub default_max_tokens: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 10,
            provider_timeout_secs: 300,
            tool_timeout_secs: 60,
            persist_retries: 3,
            retention_secs: 600,
            default_max_tokens: 4096,
        }
    }
}

impl StreamingConfig {
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    #[must_use]
    pub const fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Lorem generator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoremSettings {
    pub words_per_second: f64,
    pub response_words: usize,
    pub thinking_words: usize,
}

impl Default for LoremSettings {
    fn default() -> Self {
        let config = LoremConfig::default();
        Self {
            words_per_second: config.words_per_second,
            response_words: config.response_words,
            thinking_words: config.thinking_words,
        }
    }
}

impl LoremSettings {
    #[must_use]
    pub const fn to_config(&self) -> LoremConfig {
        LoremConfig {
            words_per_second: self.words_per_second,
            response_words: self.response_words,
            thinking_words: self.thinking_words,
        }
    }
}

/// Document tool settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Root of the project documents the read-only tools can see.
    /// Document tools are disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents_root: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_providers_exist() {
        let config = Config::default();
        for name in ["anthropic", "openai", "google", "groq", "mistral", "lorem"] {
            assert!(config.providers.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn ollama_has_base_url() {
        let config = Config::default();
        let ollama = &config.providers["ollama"];
        assert_eq!(ollama.api_type, ProviderApiType::OpenAi);
        assert_eq!(
            ollama.base_url.as_deref(),
            Some("http://localhost:11434/v1")
        );
    }

    #[test]
    fn unknown_provider_returns_error() {
        let config = Config::default();
        let result = config.create_provider_by_name("nonexistent");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn missing_key_is_config_error() {
        let mut config = Config::default();
        config.providers.insert(
            "keyless".to_string(),
            ProviderConfig {
                api_type: ProviderApiType::Anthropic,
                base_url: None,
                api_key_env: Some("MERIDIAN_TEST_UNSET_KEY".to_string()),
            },
        );
        let result = config.create_provider_by_name("keyless");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn lorem_needs_no_key() {
        let config = Config::default();
        let provider = config.create_provider_by_name("lorem").unwrap();
        assert_eq!(provider.name(), "lorem");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
default_model = "lorem/lorem-fast"

[streaming]
max_tool_rounds = 3

[providers.local]
type = "openai"
base_url = "http://localhost:8080/v1"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.default_model, "lorem/lorem-fast");
        assert_eq!(config.streaming.max_tool_rounds, 3);
        assert_eq!(config.streaming.provider_timeout_secs, 300);
        assert_eq!(config.api.port, 7890);
        assert!(config.providers.contains_key("local"));
        assert!(config.providers.contains_key("anthropic"));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.streaming, StreamingConfig::default());
    }

    #[test]
    fn generated_tokens_are_prefixed() {
        let token = ApiConfig::generate_token();
        assert!(token.starts_with("mer_"));
        assert_eq!(token.len(), 4 + 64);
    }
}
