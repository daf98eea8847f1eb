use crate::models::chat::Provider;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};

/// HTTP listener settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    /// Allowed CORS origins. Empty means any origin.
    pub cors: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 4000,
            cors: Vec::new(),
        }
    }
}

/// Log output format.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Postgres settings. Without a URL the server keeps everything in memory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: Option<String>,
    pub max_connections: u32,
    /// Root of the staged SQL scripts applied at startup.
    pub bootstrap_path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            bootstrap_path: PathBuf::from("scripts/pg"),
        }
    }
}

/// Knobs for the chat streaming pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StreamingSection {
    /// A checkpoint is written every time this many content chunks have been emitted.
    pub checkpoint_interval: usize,
    /// Upper bound on background checkpoint writes in flight.
    pub checkpoint_concurrency: usize,
    /// Deadline for opening the upstream call and for each gap between deltas.
    pub upstream_timeout_secs: u64,
    pub lease_ttl_secs: u64,
    /// Per-channel broadcast buffer.
    pub fanout_capacity: usize,
    pub global_channel: String,
    /// Age after which a stored checkpoint is ignored. Zero disables expiry.
    pub checkpoint_ttl_secs: u64,
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10,
            checkpoint_concurrency: 32,
            upstream_timeout_secs: 120,
            lease_ttl_secs: 300,
            fanout_capacity: 256,
            global_channel: "chat-global".to_string(),
            checkpoint_ttl_secs: 3600,
        }
    }
}

/// Credentials and endpoint for one upstream vendor.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub default_model: Option<String>,
}

impl ProviderSettings {
    fn with_base(base_url: &str) -> Self {
        Self {
            api_key: None,
            base_url: base_url.to_string(),
            default_model: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ProvidersSection {
    pub openai: ProviderSettings,
    pub anthropic: ProviderSettings,
    pub gemini: ProviderSettings,
    pub grok: ProviderSettings,
    pub vercel: ProviderSettings,
    pub meta: ProviderSettings,
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            openai: ProviderSettings::with_base("https://api.openai.com"),
            anthropic: ProviderSettings::with_base("https://api.anthropic.com"),
            gemini: ProviderSettings::with_base("https://generativelanguage.googleapis.com"),
            grok: ProviderSettings::with_base("https://api.x.ai"),
            vercel: ProviderSettings::with_base("https://api.v0.dev"),
            meta: ProviderSettings::with_base("https://api.llama.com"),
        }
    }
}

impl ProvidersSection {
    #[must_use]
    pub const fn get(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::OpenAi => &self.openai,
            Provider::Anthropic => &self.anthropic,
            Provider::Gemini => &self.gemini,
            Provider::Grok => &self.grok,
            Provider::Vercel => &self.vercel,
            Provider::Meta => &self.meta,
        }
    }

    fn get_mut(&mut self, provider: Provider) -> &mut ProviderSettings {
        match provider {
            Provider::OpenAi => &mut self.openai,
            Provider::Anthropic => &mut self.anthropic,
            Provider::Gemini => &mut self.gemini,
            Provider::Grok => &mut self.grok,
            Provider::Vercel => &mut self.vercel,
            Provider::Meta => &mut self.meta,
        }
    }

    /// Environment variable holding the server-wide key for a provider.
    #[must_use]
    pub const fn api_key_env(provider: Provider) -> &'static str {
        match provider {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::Grok => "XAI_API_KEY",
            Provider::Vercel => "V0_API_KEY",
            Provider::Meta => "LLAMA_API_KEY",
        }
    }

    fn apply_env_overrides(&mut self) {
        for provider in Provider::ALL {
            let settings = self.get_mut(provider);
            if settings.api_key.is_none() {
                settings.api_key = env::var(Self::api_key_env(provider))
                    .ok()
                    .filter(|key| !key.trim().is_empty());
            }
        }
    }
}

/// Conversation title generation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TitleSection {
    pub model: String,
    pub max_words: usize,
}

impl Default for TitleSection {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            max_words: 10,
        }
    }
}

/// Object storage used for attachments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StorageSection {
    pub bucket: String,
    pub key_prefix: String,
    pub presign_expiry_secs: u64,
    /// Externally reachable base URL used in upload and download links.
    pub public_url: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            bucket: "slipstream-assets".to_string(),
            key_prefix: "user-assets".to_string(),
            presign_expiry_secs: 3600,
            public_url: "http://localhost:4000".to_string(),
        }
    }
}

/// The main configuration structure for the Slipstream server
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub logging: LoggingSection,
    pub database: DatabaseSection,
    pub streaming: StreamingSection,
    pub providers: ProvidersSection,
    pub title: TitleSection,
    pub storage: StorageSection,
}

impl Config {
    /// Generates a default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::default()
    }

    /// Loads the configuration from a file, environment variables, or defaults.
    ///
    /// # Arguments
    /// * `config_path` - Optional path to a `yaml`/`yml` or `json` configuration file.
    /// * `port_override` - Optional port number to override the configuration.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, uses an unknown
    /// extension, or an environment override is malformed.
    pub fn load_config(
        config_path: Option<PathBuf>,
        port_override: Option<u16>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::with_defaults();

        if let Some(path) = config_path {
            tracing::debug!(path = %path.display(), "loading configuration file");
            let content = fs::read_to_string(&path)?;
            config = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml" | "yml") => serde_yml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                _ => {
                    return Err("Unsupported configuration format. Use 'yaml' or 'json'.".into());
                }
            };
        }

        config.apply_env_overrides()?;

        if let Some(port) = port_override {
            config.server.port = port;
        }

        if config.server.port == 0 {
            return Err("Invalid server port. Must be greater than 0.".into());
        }

        Ok(config)
    }

    /// Environment variables only fill values that are still at their defaults.
    fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let defaults = Self::with_defaults();

        if self.server.port == defaults.server.port {
            if let Ok(port) = env::var("SLIPSTREAM_SERVER_PORT") {
                self.server.port = port.parse().map_err(|_| {
                    "Invalid SLIPSTREAM_SERVER_PORT value: must be a valid number between 1 and 65535"
                })?;
            }
        }
        if self.database.url.is_none() {
            self.database.url = env::var("SLIPSTREAM_DATABASE_URL").ok();
        }
        if self.logging.level == defaults.logging.level {
            if let Ok(level) = env::var("SLIPSTREAM_LOG_LEVEL") {
                self.logging.level = level;
            }
        }
        if self.logging.format == defaults.logging.format {
            if let Ok(format) = env::var("SLIPSTREAM_LOG_FORMAT") {
                self.logging.format = match format.to_ascii_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "text" => LogFormat::Text,
                    _ => return Err("Invalid SLIPSTREAM_LOG_FORMAT value: use 'text' or 'json'".into()),
                };
            }
        }
        if self.streaming.checkpoint_interval == defaults.streaming.checkpoint_interval {
            if let Ok(interval) = env::var("SLIPSTREAM_CHECKPOINT_INTERVAL") {
                self.streaming.checkpoint_interval = interval
                    .parse()
                    .map_err(|_| "Invalid SLIPSTREAM_CHECKPOINT_INTERVAL value: must be a number")?;
            }
        }
        if self.streaming.upstream_timeout_secs == defaults.streaming.upstream_timeout_secs {
            if let Ok(timeout) = env::var("SLIPSTREAM_UPSTREAM_TIMEOUT_SECS") {
                self.streaming.upstream_timeout_secs = timeout.parse().map_err(|_| {
                    "Invalid SLIPSTREAM_UPSTREAM_TIMEOUT_SECS value: must be a number"
                })?;
            }
        }
        if self.storage.bucket == defaults.storage.bucket {
            if let Ok(bucket) = env::var("SLIPSTREAM_STORAGE_BUCKET") {
                self.storage.bucket = bucket;
            }
        }

        self.providers.apply_env_overrides();
        Ok(())
    }

    /// Validate the complete configuration.
    ///
    /// # Errors
    /// Returns every problem found, one message per entry.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Invalid server port. Must be greater than 0.".to_string());
        }
        if self.streaming.checkpoint_interval == 0 {
            errors.push("streaming.checkpoint_interval must be greater than 0".to_string());
        }
        if self.streaming.checkpoint_concurrency == 0 {
            errors.push("streaming.checkpoint_concurrency must be greater than 0".to_string());
        }
        if self.streaming.fanout_capacity == 0 {
            errors.push("streaming.fanout_capacity must be greater than 0".to_string());
        }
        if self.streaming.upstream_timeout_secs == 0 {
            errors.push("streaming.upstream_timeout_secs must be greater than 0".to_string());
        }
        if self.streaming.global_channel.trim().is_empty() {
            errors.push("streaming.global_channel must not be empty".to_string());
        }
        if url::Url::parse(&self.storage.public_url).is_err() {
            errors.push(format!(
                "storage.public_url is not a valid URL: {}",
                self.storage.public_url
            ));
        }
        if self.title.max_words == 0 {
            errors.push("title.max_words must be greater than 0".to_string());
        }
        for provider in Provider::ALL {
            let base = &self.providers.get(provider).base_url;
            if url::Url::parse(base).is_err() {
                errors.push(format!("providers.{provider}.base_url is not a valid URL: {base}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
