//! Deterministic stand-ins used in `demo` mode. No network access.

use super::{ReplyGenerator, ReplyRequest, RiskClassifier, Synthesizer, Transcriber};
use crate::audio::processor::tone_wav;
use crate::error::ProviderError;
use crate::voice::safety::RiskAssessment;
use async_trait::async_trait;

/// Returned for very short recordings, typically a microphone test.
const SHORT_AUDIO_TRANSCRIPT: &str = "Testing speech recognition system";
const SHORT_AUDIO_BYTES: usize = 500;

fn sample_transcripts(language: &str) -> &'static [&'static str] {
    match language.split('-').next().unwrap_or_default() {
        "hi" => &[
            "मुझे अपनी परीक्षाओं पर बहुत दबाव महसूस हो रहा है",
            "मैं बहुत तनाव महसूस कर रहा हूँ",
            "मुझे मानसिक स्वास्थ्य से संबंधित मदद चाहिए",
            "काम बहुत ज्यादा कठिन हो गया है",
        ],
        "ta" => &[
            "எனக்கு வரவிருக்கும் தேர்வுகளில் அதிக அழுத்தம் உள்ளது",
            "நான் மன அழுத்தம் உணர்கிறேன்",
            "எனக்கு உளவியல் ஆலோசனை தேவை",
            "வேலை மிகவும் கடினமாக உள்ளது",
        ],
        _ => &[
            "I'm feeling stressed about my upcoming exams",
            "I need help managing my anxiety",
            "Work is really overwhelming right now",
            "I feel depressed and don't know what to do",
        ],
    }
}

/// Picks a sample sentence from the audio length, so the same recording always gives the same text.
pub struct DemoTranscriber;

#[async_trait]
impl Transcriber for DemoTranscriber {
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String, ProviderError> {
        if audio.len() < SHORT_AUDIO_BYTES {
            return Ok(SHORT_AUDIO_TRANSCRIPT.to_string());
        }
        let samples = sample_transcripts(language);
        Ok(samples[audio.len() % samples.len()].to_string())
    }
}

/// Renders a low tone whose length follows the word count of the text.
pub struct ToneSynthesizer {
    sample_rate: u32,
    frequency_hz: f32,
    amplitude: f32,
}

impl Default for ToneSynthesizer {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            frequency_hz: 200.0,
            amplitude: 3000.0,
        }
    }
}

#[async_trait]
impl Synthesizer for ToneSynthesizer {
    async fn synthesize(&self, text: &str, _language: &str, _voice_id: &str) -> Result<Vec<u8>, ProviderError> {
        let words = text.split_whitespace().count();
        let duration = (words as f32 * 0.3).max(1.0);
        tone_wav(duration, self.sample_rate, self.frequency_hz, self.amplitude)
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

/// Short supportive reply that reflects the user's words back.
pub struct ReflectiveGenerator;

#[async_trait]
impl ReplyGenerator for ReflectiveGenerator {
    async fn generate(&self, request: ReplyRequest<'_>) -> Result<String, ProviderError> {
        let calming = request
            .affect
            .map(|affect| affect.tension() > 0.6)
            .unwrap_or(false);
        let opener = if calming {
            "Let's take one slow breath together first."
        } else {
            "Thank you for sharing that with me."
        };

        let topic: String = request
            .user_text
            .trim()
            .trim_end_matches(['.', '!', '?'])
            .chars()
            .take(80)
            .collect();

        let follow_up = if request.history.is_empty() {
            "What feels most pressing to you right now?"
        } else {
            "How does this connect with what we talked about earlier?"
        };

        Ok(format!(
            "{} It sounds like \"{}\" is weighing on you. {}",
            opener, topic, follow_up
        ))
    }
}

/// Demo mode has no risk model; the safety gate's phrase scan decides.
pub struct OfflineClassifier;

#[async_trait]
impl RiskClassifier for OfflineClassifier {
    async fn classify(&self, _text: &str) -> Result<RiskAssessment, ProviderError> {
        Err(ProviderError::Unavailable("no risk model in demo mode".to_string()))
    }
}
