//! # External Collaborators
//!
//! Every slow or fallible dependency of a voice session is a trait object
//! selected once at startup:
//!
//! | Capability       | `demo` mode                  | `openai` mode                      |
//! |------------------|------------------------------|------------------------------------|
//! | Transcriber      | canned per-language samples  | `/audio/transcriptions`            |
//! | Synthesizer      | tone WAV                     | `/audio/speech`                    |
//! | ReplyGenerator   | reflective template          | `/chat/completions`                |
//! | RiskClassifier   | phrase scan                  | `/chat/completions` JSON verdict   |
//! | SafetyAlerter    | log / backend `/api/alerts/` | log / backend `/api/alerts/`       |
//! | AffectSource     | none / backend emotions      | none / backend emotions            |
//!
//! ## Rust Concepts:
//! - **async-trait**: lets trait methods be `async` while staying object safe
//! - **Arc<dyn Trait>**: one shared implementation used by every session task
//! - **Send + Sync**: required so session tasks can run on any runtime thread

pub mod backend;
pub mod demo;
pub mod openai;
#[cfg(test)]
pub mod testing;

use crate::agents::{AgentDirectory, StaticAgentDirectory};
use crate::audio::processor::AudioProcessor;
use crate::config::{AppConfig, ProviderMode};
use crate::error::ProviderError;
use crate::voice::memory::{AffectSnapshot, ConversationTurn};
use crate::voice::safety::{RiskAssessment, SafetyAlert};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Speech to text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String, ProviderError>;
}

/// Text to speech. Returns a complete audio file (WAV, MP3, ...).
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, language: &str, voice_id: &str) -> Result<Vec<u8>, ProviderError>;
}

/// Everything the reply generator sees for one user turn.
#[derive(Debug, Clone, Copy)]
pub struct ReplyRequest<'a> {
    pub system_prompt: &'a str,
    pub user_text: &'a str,
    /// Oldest first
    pub history: &'a [ConversationTurn],
    pub affect: Option<&'a AffectSnapshot>,
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, request: ReplyRequest<'_>) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait RiskClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<RiskAssessment, ProviderError>;
}

/// Receiver of safety escalations. Callers never wait on it for a reply.
#[async_trait]
pub trait SafetyAlerter: Send + Sync {
    async fn send_alert(&self, alert: &SafetyAlert) -> Result<(), ProviderError>;
}

/// Latest emotion estimate for a user, if one is known.
#[async_trait]
pub trait AffectSource: Send + Sync {
    async fn latest(&self, user_id: &str) -> Result<Option<AffectSnapshot>, ProviderError>;
}

/// The collaborator set shared by all sessions.
#[derive(Clone)]
pub struct VoiceServices {
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub classifier: Arc<dyn RiskClassifier>,
    pub alerter: Arc<dyn SafetyAlerter>,
    pub affect: Option<Arc<dyn AffectSource>>,
    pub agents: Arc<dyn AgentDirectory>,
}

impl VoiceServices {
    /// Wire the implementations named by `providers.mode`.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let providers = &config.providers;

        let agents: Arc<dyn AgentDirectory> = if providers.agents_file.is_empty() {
            Arc::new(StaticAgentDirectory::builtin(&config.session.default_agent))
        } else {
            Arc::new(StaticAgentDirectory::from_file(
                &providers.agents_file,
                &config.session.default_agent,
            )?)
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.pipeline.call_timeout_secs))
            .build()?;

        let alerter: Arc<dyn SafetyAlerter> = if providers.backend_url.is_empty() {
            Arc::new(backend::LogAlerter)
        } else {
            Arc::new(backend::HttpAlerter::new(
                http.clone(),
                &providers.backend_url,
                &providers.internal_token,
            ))
        };

        let affect: Option<Arc<dyn AffectSource>> =
            if providers.affect_enabled && !providers.backend_url.is_empty() {
                Some(Arc::new(backend::HttpAffectSource::new(
                    http.clone(),
                    &providers.backend_url,
                    Duration::from_secs(30),
                )))
            } else {
                None
            };

        let services = match providers.mode {
            ProviderMode::Demo => VoiceServices {
                transcriber: Arc::new(demo::DemoTranscriber),
                synthesizer: Arc::new(demo::ToneSynthesizer::default()),
                generator: Arc::new(demo::ReflectiveGenerator),
                classifier: Arc::new(demo::OfflineClassifier),
                alerter,
                affect,
                agents,
            },
            ProviderMode::Openai => {
                let client = openai::OpenAiClient::new(http, &providers.api_base, &providers.api_key);
                VoiceServices {
                    transcriber: Arc::new(openai::OpenAiTranscriber::new(
                        client.clone(),
                        &providers.stt_model,
                        AudioProcessor::new(config.audio.clone()),
                    )),
                    synthesizer: Arc::new(openai::OpenAiSynthesizer::new(
                        client.clone(),
                        &providers.tts_model,
                        &providers.voice_override,
                    )),
                    generator: Arc::new(openai::OpenAiReplyGenerator::new(
                        client.clone(),
                        &providers.llm_model,
                        providers.temperature,
                        providers.max_tokens,
                    )),
                    classifier: Arc::new(openai::OpenAiRiskClassifier::new(
                        client,
                        &providers.risk_model,
                    )),
                    alerter,
                    affect,
                    agents,
                }
            }
        };

        info!(
            mode = providers.mode.as_str(),
            affect = services.affect.is_some(),
            "Voice collaborators wired"
        );
        Ok(services)
    }
}
