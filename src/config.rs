//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **Duration helpers**: Seconds are stored as plain integers and converted on access
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SESSION__INIT_TIMEOUT_SECS=5`, `APP_PROVIDERS__MODE=openai`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each group maps to one layer of the voice service: the HTTP server,
/// the per-session lifecycle, the utterance pipeline, the raw audio format
/// and the external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub pipeline: PipelineConfig,
    pub audio: AudioConfig,
    pub providers: ProvidersConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Session lifecycle settings.
///
/// ## Fields:
/// - `init_timeout_secs`: how long a fresh connection may stay in `Connecting`
/// - `idle_timeout_secs`: how long a `Listening` session may go without any frame
/// - `require_token`: when false the service runs in demo mode and skips the token check
/// - `default_region`: helpline region used when the language tag carries none (`en`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub init_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_concurrent_sessions: usize,
    pub memory_max_turns: usize,
    pub require_token: bool,
    pub default_agent: String,
    pub default_language: String,
    pub default_region: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_concurrent_sessions: 100,
            memory_max_turns: 10,
            require_token: false,
            default_agent: "eve_black_career".to_string(),
            default_language: "en-IN".to_string(),
            default_region: "IN".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Utterance pipeline settings.
///
/// ## Fields:
/// - `call_timeout_secs`: deadline applied to every collaborator call
/// - `history_turns`: how many memory turns are handed to the reply generator
/// - `min_utterance_bytes`: anything shorter is rejected before transcription
/// - `pacing_ms_per_word` / `max_pacing_ms`: pause after each delivered chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub call_timeout_secs: u64,
    pub alert_timeout_secs: u64,
    pub history_turns: usize,
    pub min_utterance_bytes: usize,
    pub max_utterance_bytes: usize,
    pub max_chunks: usize,
    pub pacing_ms_per_word: u64,
    pub max_pacing_ms: u64,
    pub fallback_reply: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            alert_timeout_secs: 5,
            history_turns: 6,
            min_utterance_bytes: 100,
            max_utterance_bytes: 10 * 1024 * 1024,
            max_chunks: 3,
            pacing_ms_per_word: 50,
            max_pacing_ms: 300,
            fallback_reply: "I'm sorry, I couldn't generate a response. Please try again."
                .to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn alert_timeout(&self) -> Duration {
        Duration::from_secs(self.alert_timeout_secs)
    }

    /// Pause inserted after a chunk of `words` words has been sent.
    pub fn pacing_for(&self, words: usize) -> Duration {
        let ms = (self.pacing_ms_per_word * words as u64).min(self.max_pacing_ms);
        Duration::from_millis(ms)
    }
}

/// Format of raw PCM arriving over the socket (used when wrapping it into WAV).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

/// Which collaborator implementations to wire at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    /// Deterministic stand-ins, no network access
    Demo,
    /// OpenAI-compatible HTTP endpoints
    Openai,
}

impl ProviderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMode::Demo => "demo",
            ProviderMode::Openai => "openai",
        }
    }
}

/// External collaborator settings.
///
/// `backend_url` points at the backend that receives safety alerts and
/// serves affect snapshots; leaving it empty disables both integrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub mode: ProviderMode,
    pub api_base: String,
    pub api_key: String,
    pub stt_model: String,
    pub tts_model: String,
    pub llm_model: String,
    pub risk_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub voice_override: String,
    pub backend_url: String,
    pub internal_token: String,
    pub affect_enabled: bool,
    pub agents_file: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Demo,
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            risk_model: "gpt-4o-mini".to_string(),
            temperature: 0.4,
            max_tokens: 250,
            voice_override: String::new(),
            backend_url: String::new(),
            internal_token: String::new(),
            affect_enabled: false,
            agents_file: String::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and OPENAI_API_KEY
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_PROVIDERS__MODE=openai`: Switch to the HTTP collaborators
    /// - `APP_SESSION__REQUIRE_TOKEN=true`: Leave demo mode
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates nesting so field names may keep single underscores
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;

        if config.providers.api_key.is_empty() {
            if let Ok(key) = env::var("OPENAI_API_KEY") {
                config.providers.api_key = key;
            }
        }

        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## Why validate:
    /// A zero timeout or a zero chunk limit would make every session fail in
    /// confusing ways at runtime; failing at startup gives a clear message.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.session.init_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Init timeout must be greater than 0"));
        }

        if self.session.memory_max_turns == 0 {
            return Err(anyhow::anyhow!("Memory must keep at least one turn"));
        }

        if self.pipeline.call_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Collaborator call timeout must be greater than 0"));
        }

        if self.pipeline.max_chunks == 0 {
            return Err(anyhow::anyhow!("Max chunks must be greater than 0"));
        }

        if self.pipeline.min_utterance_bytes > self.pipeline.max_utterance_bytes {
            return Err(anyhow::anyhow!(
                "min_utterance_bytes ({}) exceeds max_utterance_bytes ({})",
                self.pipeline.min_utterance_bytes,
                self.pipeline.max_utterance_bytes
            ));
        }

        if self.pipeline.fallback_reply.trim().is_empty() {
            return Err(anyhow::anyhow!("Fallback reply cannot be empty"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!("Only 16-bit PCM input is supported"));
        }

        if self.providers.mode == ProviderMode::Openai && self.providers.api_key.is_empty() {
            return Err(anyhow::anyhow!(
                "providers.api_key (or OPENAI_API_KEY) is required in openai mode"
            ));
        }

        Ok(())
    }
}
