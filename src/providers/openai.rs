//! OpenAI-compatible HTTP collaborators (OpenAI, OpenRouter, local servers speaking the same API).

use super::{ReplyGenerator, ReplyRequest, RiskClassifier, Synthesizer, Transcriber};
use crate::audio::processor::{AudioContainer, AudioProcessor};
use crate::error::ProviderError;
use crate::voice::safety::{parse_classifier_reply, RiskAssessment};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Base URL, key and connection pool shared by the individual capabilities.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Turn a non-success status into an error carrying the body for the logs.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Http(format!("{}: {}", status, body)))
    }

    async fn chat(&self, request: &ChatRequest<'_>) -> Result<String, ProviderError> {
        let response = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let body: ChatResponse = response.json().await?;

        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Malformed("no choices in completion".to_string()))
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct OpenAiTranscriber {
    client: OpenAiClient,
    model: String,
    processor: AudioProcessor,
}

impl OpenAiTranscriber {
    pub fn new(client: OpenAiClient, model: &str, processor: AudioProcessor) -> Self {
        Self {
            client,
            model: model.to_string(),
            processor,
        }
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String, ProviderError> {
        let prepared = self
            .processor
            .prepare_for_upload(audio)
            .map_err(|e| ProviderError::Malformed(format!("could not encode audio: {}", e)))?;
        if prepared.container == AudioContainer::RawPcm {
            debug!(
                seconds = self.processor.pcm_duration_secs(audio.len()),
                "Wrapped raw PCM into WAV"
            );
        }
        debug!(
            container = ?prepared.container,
            bytes = prepared.bytes.len(),
            "Uploading utterance for transcription"
        );

        let part = reqwest::multipart::Part::bytes(prepared.bytes)
            .file_name(prepared.container.file_name())
            .mime_str(prepared.container.mime_type())
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let primary = language.split('-').next().unwrap_or(language).to_string();
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", primary);

        let response = self
            .client
            .http
            .post(self.client.url("audio/transcriptions"))
            .bearer_auth(&self.client.api_key)
            .multipart(form)
            .send()
            .await?;
        let response = OpenAiClient::check(response).await?;
        let body: TranscriptionResponse = response.json().await?;
        Ok(body.text.trim().to_string())
    }
}

pub struct OpenAiSynthesizer {
    client: OpenAiClient,
    model: String,
    /// Replaces the persona voice when the endpoint only knows its own voice names
    voice_override: Option<String>,
}

impl OpenAiSynthesizer {
    pub fn new(client: OpenAiClient, model: &str, voice_override: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
            voice_override: Some(voice_override.to_string()).filter(|v| !v.is_empty()),
        }
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, _language: &str, voice_id: &str) -> Result<Vec<u8>, ProviderError> {
        let voice = self.voice_override.as_deref().unwrap_or(voice_id);
        let response = self
            .client
            .http
            .post(self.client.url("audio/speech"))
            .bearer_auth(&self.client.api_key)
            .json(&SpeechRequest {
                model: &self.model,
                input: text,
                voice,
            })
            .send()
            .await?;
        let response = OpenAiClient::check(response).await?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(ProviderError::Malformed("empty audio body".to_string()));
        }
        Ok(bytes.to_vec())
    }
}

pub struct OpenAiReplyGenerator {
    client: OpenAiClient,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiReplyGenerator {
    pub fn new(client: OpenAiClient, model: &str, temperature: f32, max_tokens: u32) -> Self {
        Self {
            client,
            model: model.to_string(),
            temperature,
            max_tokens,
        }
    }
}

/// System prompt, then alternating user/assistant history, then the new user text.
fn reply_messages<'a>(request: &ReplyRequest<'a>, system: &'a str) -> Vec<ChatMessage<'a>> {
    let mut messages = vec![ChatMessage {
        role: "system",
        content: system,
    }];
    for turn in request.history {
        messages.push(ChatMessage {
            role: "user",
            content: &turn.user_text,
        });
        messages.push(ChatMessage {
            role: "assistant",
            content: &turn.assistant_text,
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: request.user_text,
    });
    messages
}

#[async_trait]
impl ReplyGenerator for OpenAiReplyGenerator {
    async fn generate(&self, request: ReplyRequest<'_>) -> Result<String, ProviderError> {
        let system = match request.affect.and_then(|a| a.guidance()) {
            Some(guidance) => format!("{}\n\n{}", request.system_prompt, guidance),
            None => request.system_prompt.to_string(),
        };

        let reply = self
            .client
            .chat(&ChatRequest {
                model: &self.model,
                messages: reply_messages(&request, &system),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            })
            .await?;
        Ok(reply.trim().to_string())
    }
}

pub struct OpenAiRiskClassifier {
    client: OpenAiClient,
    model: String,
}

impl OpenAiRiskClassifier {
    pub fn new(client: OpenAiClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

fn classification_prompt(text: &str) -> String {
    format!(
        r#"Analyze the following user message for mental health risk.
Return only JSON in this exact format:
{{"risk_level": "none|low|medium|high", "reason": "brief explanation", "urgent": true|false}}

Message: "{}"

Risk levels:
- none: no risk indicators
- low: mild distress, general anxiety or stress
- medium: significant distress, possible self-harm ideation
- high: immediate danger, active self-harm intent, severe crisis"#,
        text.replace('"', "'")
    )
}

#[async_trait]
impl RiskClassifier for OpenAiRiskClassifier {
    async fn classify(&self, text: &str) -> Result<RiskAssessment, ProviderError> {
        let prompt = classification_prompt(text);
        let raw = self
            .client
            .chat(&ChatRequest {
                model: &self.model,
                messages: vec![ChatMessage {
                    role: "user",
                    content: &prompt,
                }],
                temperature: 0.1,
                max_tokens: 150,
            })
            .await?;

        parse_classifier_reply(&raw)
            .ok_or_else(|| ProviderError::Malformed(format!("unparseable verdict: {}", raw)))
    }
}
