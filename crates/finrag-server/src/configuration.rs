use crate::error::{to_env_var, ConfigError};
use config::{Config, Environment};
use finrag::providers::{
    configs::{OllamaProviderConfig, OpenAiProviderConfig, ProviderConfig},
    factory::ProviderType,
    ollama, openai,
};
use finrag::store::embeddings::{OpenAiEmbedderConfig, OPENAI_EMBEDDING_MODEL};
use finrag::store::ingest::{ChunkOptions, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use finrag::tools::retriever::{DEFAULT_DOCUMENT_TITLE, DEFAULT_TOP_K};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const OLLAMA_EMBEDDING_MODEL: &str = "nomic-embed-text";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                env_var: to_env_var("server.host"),
                message: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum ProviderSettings {
    OpenAi {
        #[serde(default = "default_openai_host")]
        host: String,
        api_key: String,
        #[serde(default = "default_model")]
        model: String,
        #[serde(default = "default_temperature")]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
    },
    Ollama {
        #[serde(default = "default_ollama_host")]
        host: String,
        #[serde(default = "default_ollama_model")]
        model: String,
        #[serde(default = "default_temperature")]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
    },
}

impl ProviderSettings {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            ProviderSettings::OpenAi { .. } => ProviderType::OpenAi,
            ProviderSettings::Ollama { .. } => ProviderType::Ollama,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            ProviderSettings::OpenAi { host, .. } | ProviderSettings::Ollama { host, .. } => host,
        }
    }

    // Convert to the finrag ProviderConfig
    pub fn into_config(self) -> ProviderConfig {
        match self {
            ProviderSettings::OpenAi {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
            } => ProviderConfig::OpenAi(OpenAiProviderConfig {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
            }),
            ProviderSettings::Ollama {
                host,
                model,
                temperature,
                max_tokens,
            } => ProviderConfig::Ollama(OllamaProviderConfig {
                host,
                model,
                temperature,
                max_tokens,
            }),
        }
    }
}

/// Where chunk and query embeddings come from. Unset fields follow the chat provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddingSettings {
    /// Run the local fastembed model instead of calling an embedding service
    #[serde(default)]
    pub offline: bool,
    /// Where the local model is downloaded to
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl EmbeddingSettings {
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir
            .as_deref()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).as_ref()))
    }

    /// Client configuration, or `None` when embeddings are computed offline
    pub fn client_config(&self, provider: &ProviderSettings) -> Option<OpenAiEmbedderConfig> {
        if self.offline {
            return None;
        }

        let (api_key, model) = match provider {
            ProviderSettings::OpenAi { api_key, .. } => {
                (Some(api_key.clone()), OPENAI_EMBEDDING_MODEL)
            }
            ProviderSettings::Ollama { .. } => (None, OLLAMA_EMBEDDING_MODEL),
        };

        Some(OpenAiEmbedderConfig {
            host: self
                .host
                .clone()
                .unwrap_or_else(|| provider.host().to_string()),
            api_key: self.api_key.clone().or(api_key),
            model: self.model.clone().unwrap_or_else(|| model.to_string()),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentSettings {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for DocumentSettings {
    fn default() -> Self {
        Self {
            path: None,
            title: default_title(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            top_k: default_top_k(),
        }
    }
}

impl DocumentSettings {
    /// The document path with `~` and environment variables expanded
    pub fn resolved_path(&self) -> Result<PathBuf, ConfigError> {
        let path = self.path.as_deref().ok_or_else(|| ConfigError::MissingEnvVar {
            env_var: to_env_var("document.path"),
        })?;
        let expanded = shellexpand::full(path).map_err(|e| ConfigError::InvalidValue {
            env_var: to_env_var("document.path"),
            message: e.to_string(),
        })?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    pub fn chunk_options(&self) -> ChunkOptions {
        ChunkOptions {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// Tool cycles allowed per question, 0 for no limit
    #[serde(default = "default_max_tool_cycles")]
    pub max_tool_cycles: usize,
    #[serde(default = "default_word_delay_ms")]
    pub word_delay_ms: u64,
    #[serde(default = "default_tool_notice_delay_ms")]
    pub tool_notice_delay_ms: u64,
    #[serde(default = "default_tool_notice")]
    pub tool_notice: bool,
    /// Optional tera template replacing the built-in system directive
    #[serde(default)]
    pub system_prompt_path: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_tool_cycles: default_max_tool_cycles(),
            word_delay_ms: default_word_delay_ms(),
            tool_notice_delay_ms: default_tool_notice_delay_ms(),
            tool_notice: default_tool_notice(),
            system_prompt_path: None,
        }
    }
}

impl AgentSettings {
    pub fn tool_cycle_limit(&self) -> Option<usize> {
        match self.max_tool_cycles {
            0 => None,
            n => Some(n),
        }
    }

    pub fn word_delay(&self) -> Duration {
        Duration::from_millis(self.word_delay_ms)
    }

    /// Pause after the tool notice, or `None` when the notice is disabled
    pub fn tool_notice_delay(&self) -> Option<Duration> {
        self.tool_notice
            .then(|| Duration::from_millis(self.tool_notice_delay_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    pub provider: ProviderSettings,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub document: DocumentSettings,
    #[serde(default)]
    pub agent: AgentSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load_and_validate()
    }

    fn load_and_validate() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("FINRAG")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        // Try to deserialize the configuration
        let result: Result<Self, config::ConfigError> = config.try_deserialize();

        // Handle missing field errors specially
        let settings = match result {
            Ok(settings) => settings,
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                // Handle both NotFound and missing field message variants
                let error_str = err.to_string();
                return if error_str.starts_with("missing field") {
                    // Extract field name from error message "missing field `type`"
                    let field = error_str
                        .trim_start_matches("missing field `")
                        .split('`')
                        .next()
                        .unwrap_or_default();
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                };
            }
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.document.resolved_path()?;
        if self.document.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                env_var: to_env_var("document.chunk_size"),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.document.top_k == 0 {
            return Err(ConfigError::InvalidValue {
                env_var: to_env_var("document.top_k"),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
        "http://localhost:5173".to_string(),
    ]
}

fn default_model() -> String {
    openai::OPENAI_MODEL.to_string()
}

fn default_temperature() -> Option<f32> {
    Some(0.0)
}

fn default_openai_host() -> String {
    openai::OPENAI_HOST.to_string()
}

fn default_ollama_host() -> String {
    ollama::OLLAMA_HOST.to_string()
}

fn default_ollama_model() -> String {
    ollama::OLLAMA_MODEL.to_string()
}

fn default_title() -> String {
    DEFAULT_DOCUMENT_TITLE.to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_max_tool_cycles() -> usize {
    finrag::agent::DEFAULT_MAX_TOOL_CYCLES
}

fn default_word_delay_ms() -> u64 {
    30
}

fn default_tool_notice_delay_ms() -> u64 {
    500
}

fn default_tool_notice() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clean_env() {
        for (key, _) in env::vars() {
            if key.starts_with("FINRAG_") {
                env::remove_var(&key);
            }
        }
    }

    fn set_required(provider: &str) {
        env::set_var("FINRAG_PROVIDER__TYPE", provider);
        env::set_var("FINRAG_DOCUMENT__PATH", "/data/report.txt");
    }

    #[test]
    #[serial]
    fn test_default_settings() {
        clean_env();
        set_required("openai");
        env::set_var("FINRAG_PROVIDER__API_KEY", "test-key");

        let settings = Settings::new().unwrap();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.server.cors_origins.len(), 3);
        assert_eq!(settings.server.cors_origins[2], "http://localhost:5173");

        if let ProviderSettings::OpenAi {
            host,
            api_key,
            model,
            temperature,
            max_tokens,
        } = &settings.provider
        {
            assert_eq!(host, "https://api.openai.com");
            assert_eq!(api_key, "test-key");
            assert_eq!(model, "gpt-4o");
            assert_eq!(*temperature, Some(0.0));
            assert_eq!(*max_tokens, None);
        } else {
            panic!("Expected OpenAI provider");
        }

        assert_eq!(settings.document.title, "Stock Market Performance 2024");
        assert_eq!(settings.document.chunk_options(), ChunkOptions::default());
        assert_eq!(settings.document.top_k, 5);
        assert_eq!(settings.agent.tool_cycle_limit(), Some(10));
        assert_eq!(settings.agent.word_delay(), Duration::from_millis(30));
        assert_eq!(
            settings.agent.tool_notice_delay(),
            Some(Duration::from_millis(500))
        );

        let embedder = settings.embedding.client_config(&settings.provider).unwrap();
        assert_eq!(embedder.host, "https://api.openai.com");
        assert_eq!(embedder.api_key.as_deref(), Some("test-key"));
        assert_eq!(embedder.model, "text-embedding-3-small");

        clean_env();
    }

    #[test]
    #[serial]
    fn test_ollama_settings() {
        clean_env();
        set_required("ollama");
        env::set_var("FINRAG_PROVIDER__HOST", "http://custom.ollama.host");
        env::set_var("FINRAG_PROVIDER__MODEL", "llama3");
        env::set_var("FINRAG_PROVIDER__TEMPERATURE", "0.7");
        env::set_var("FINRAG_PROVIDER__MAX_TOKENS", "2000");

        let settings = Settings::new().unwrap();
        assert_eq!(settings.provider.provider_type(), ProviderType::Ollama);
        let embedder = settings.embedding.client_config(&settings.provider).unwrap();
        assert_eq!(embedder.host, "http://custom.ollama.host");
        assert_eq!(embedder.api_key, None);
        assert_eq!(embedder.model, OLLAMA_EMBEDDING_MODEL);

        if let ProviderSettings::Ollama {
            host,
            model,
            temperature,
            max_tokens,
        } = settings.provider
        {
            assert_eq!(host, "http://custom.ollama.host");
            assert_eq!(model, "llama3");
            assert_eq!(temperature, Some(0.7));
            assert_eq!(max_tokens, Some(2000));
        } else {
            panic!("Expected Ollama provider");
        }

        clean_env();
    }

    #[test]
    #[serial]
    fn test_environment_override() {
        clean_env();
        set_required("openai");
        env::set_var("FINRAG_PROVIDER__API_KEY", "test-key");
        env::set_var("FINRAG_SERVER__PORT", "8080");
        env::set_var(
            "FINRAG_SERVER__CORS_ORIGINS",
            "http://a.example,http://b.example",
        );
        env::set_var("FINRAG_DOCUMENT__TOP_K", "3");
        env::set_var("FINRAG_AGENT__MAX_TOOL_CYCLES", "0");
        env::set_var("FINRAG_AGENT__TOOL_NOTICE", "false");
        env::set_var("FINRAG_EMBEDDING__OFFLINE", "true");
        env::set_var("FINRAG_EMBEDDING__CACHE_DIR", "/var/cache/finrag");

        let settings = Settings::new().unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(
            settings.server.cors_origins,
            vec!["http://a.example", "http://b.example"]
        );
        assert_eq!(settings.document.top_k, 3);
        assert_eq!(settings.agent.tool_cycle_limit(), None);
        assert_eq!(settings.agent.tool_notice_delay(), None);
        assert!(settings.embedding.client_config(&settings.provider).is_none());
        assert_eq!(
            settings.embedding.resolved_cache_dir(),
            Some(PathBuf::from("/var/cache/finrag"))
        );

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_provider_type() {
        clean_env();
        env::set_var("FINRAG_DOCUMENT__PATH", "/data/report.txt");

        match Settings::new() {
            Err(ConfigError::MissingEnvVar { env_var }) => {
                assert_eq!(env_var, "FINRAG_PROVIDER__TYPE")
            }
            other => panic!("Expected MissingEnvVar, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_missing_api_key() {
        clean_env();
        set_required("openai");

        match Settings::new() {
            Err(ConfigError::MissingEnvVar { env_var }) => {
                assert_eq!(env_var, "FINRAG_PROVIDER__API_KEY")
            }
            other => panic!("Expected MissingEnvVar, got {:?}", other),
        }
        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_document_path() {
        clean_env();
        env::set_var("FINRAG_PROVIDER__TYPE", "ollama");

        match Settings::new() {
            Err(ConfigError::MissingEnvVar { env_var }) => {
                assert_eq!(env_var, "FINRAG_DOCUMENT__PATH")
            }
            other => panic!("Expected MissingEnvVar, got {:?}", other),
        }
        clean_env();
    }

    #[test]
    fn test_resolved_path_expands_home() {
        let document = DocumentSettings {
            path: Some("~/reports/2024.txt".to_string()),
            ..DocumentSettings::default()
        };
        let resolved = document.resolved_path().unwrap();
        assert!(!resolved.to_string_lossy().starts_with('~'));
        assert!(resolved.ends_with("reports/2024.txt"));
    }

    #[test]
    fn test_socket_addr_conversion() {
        let server_settings = ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 3000,
            ..ServerSettings::default()
        };
        let addr = server_settings.socket_addr().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:3000");
    }
}
