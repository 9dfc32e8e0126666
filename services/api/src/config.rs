use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Defines the supported backend providers for the chat model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub live_model: String,
    pub voice_enabled: bool,
    pub voice_name: String,
    pub client_sample_rate: u32,
    pub data_root: PathBuf,
    pub board_base_url: String,
    pub prompts_path: PathBuf,
    pub max_tool_rounds: usize,
    pub agent_cache_capacity: usize,
    pub stream_words_per_chunk: usize,
    pub stream_chunk_delay_ms: u64,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:8000");
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let provider = match var_or("LLM_PROVIDER", "gemini").to_lowercase().as_str() {
            "gemini" => Provider::Gemini,
            "openai" => Provider::OpenAI,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{}' is not one of 'gemini', 'openai'", other),
                ));
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        let default_model = match provider {
            Provider::Gemini => "gemini-2.5-flash-lite",
            Provider::OpenAI => "gpt-4o",
        };
        let chat_model = var_or("CHAT_MODEL", default_model);
        let live_model = var_or("LIVE_MODEL", "models/gemini-live-2.5-flash-preview");

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let client_sample_rate = parse_var("CLIENT_SAMPLE_RATE", 16000u32)?;
        if client_sample_rate == 0 {
            return Err(ConfigError::InvalidValue(
                "CLIENT_SAMPLE_RATE".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        let stream_words_per_chunk = parse_var("STREAM_WORDS_PER_CHUNK", 5usize)?.max(1);

        match provider {
            Provider::OpenAI if openai_api_key.is_none() => {
                return Err(ConfigError::MissingVar(
                    "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                ));
            }
            Provider::Gemini if gemini_api_key.is_none() => {
                return Err(ConfigError::MissingVar(
                    "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                ));
            }
            _ => {}
        }

        Ok(Self {
            bind_address,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            live_model,
            voice_enabled: parse_var("VOICE_ENABLED", true)?,
            voice_name: var_or("VOICE_NAME", "Charon"),
            client_sample_rate,
            data_root: PathBuf::from(var_or("DATA_ROOT", "./data")),
            board_base_url: var_or("BOARD_BASE_URL", "https://iso-clinic-v3.vercel.app"),
            prompts_path: PathBuf::from(var_or("PROMPTS_PATH", "./prompts")),
            max_tool_rounds: parse_var("MAX_TOOL_ROUNDS", 8usize)?,
            agent_cache_capacity: parse_var("AGENT_CACHE_CAPACITY", 256usize)?.max(1),
            stream_words_per_chunk,
            stream_chunk_delay_ms: parse_var("STREAM_CHUNK_DELAY_MS", 50u64)?,
            log_level,
        })
    }

    /// Voice needs both the switch and a Gemini key.
    pub fn voice_available(&self) -> bool {
        self.voice_enabled && self.gemini_api_key.is_some()
    }
}
