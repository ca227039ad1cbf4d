//! Scripted collaborators for unit and session tests.

use super::{
    AffectSource, ReplyGenerator, ReplyRequest, RiskClassifier, SafetyAlerter, Synthesizer,
    Transcriber, VoiceServices,
};
use crate::agents::StaticAgentDirectory;
use crate::error::ProviderError;
use crate::voice::memory::AffectSnapshot;
use crate::voice::safety::{AssessmentSource, RiskAssessment, RiskTier, SafetyAlert};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct FixedClassifier {
    tier: RiskTier,
    calls: AtomicUsize,
}

impl FixedClassifier {
    pub fn new(tier: RiskTier) -> Self {
        Self {
            tier,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RiskClassifier for FixedClassifier {
    async fn classify(&self, _text: &str) -> Result<RiskAssessment, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RiskAssessment {
            tier: self.tier,
            reason: "scripted".to_string(),
            urgent: self.tier == RiskTier::High,
            source: AssessmentSource::Classifier,
        })
    }
}

pub struct FailingClassifier;

#[async_trait]
impl RiskClassifier for FailingClassifier {
    async fn classify(&self, _text: &str) -> Result<RiskAssessment, ProviderError> {
        Err(ProviderError::Unavailable("classifier offline".to_string()))
    }
}

/// Returns the same transcript for every utterance, or fails when given `None`.
/// Records the size of every audio snapshot it is handed.
pub struct ScriptedTranscriber {
    text: Option<String>,
    delay: Duration,
    audio_lens: Mutex<Vec<usize>>,
}

impl ScriptedTranscriber {
    pub fn new(text: &str) -> Self {
        Self::delayed(text, Duration::ZERO)
    }

    pub fn delayed(text: &str, delay: Duration) -> Self {
        Self {
            text: Some(text.to_string()),
            delay,
            audio_lens: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            text: None,
            delay: Duration::ZERO,
            audio_lens: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.audio_lens.lock().unwrap().len()
    }

    pub fn audio_lens(&self) -> Vec<usize> {
        self.audio_lens.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, audio: &[u8], _language: &str) -> Result<String, ProviderError> {
        self.audio_lens.lock().unwrap().push(audio.len());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.text
            .clone()
            .ok_or_else(|| ProviderError::Http("503: stt down".to_string()))
    }
}

/// Fixed reply; records the history length of every request.
pub struct RecordingGenerator {
    reply: Option<String>,
    history_lens: Mutex<Vec<usize>>,
}

impl RecordingGenerator {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            history_lens: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            history_lens: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.history_lens.lock().unwrap().len()
    }

    pub fn history_lens(&self) -> Vec<usize> {
        self.history_lens.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplyGenerator for RecordingGenerator {
    async fn generate(&self, request: ReplyRequest<'_>) -> Result<String, ProviderError> {
        self.history_lens.lock().unwrap().push(request.history.len());
        self.reply
            .clone()
            .ok_or_else(|| ProviderError::Malformed("no choices".to_string()))
    }
}

/// Sleeps `delay` per call and returns the text as bytes. Optionally fails one chunk by call number.
pub struct DelayedSynthesizer {
    delay: Duration,
    fail_call: Option<usize>,
    calls: AtomicUsize,
}

impl DelayedSynthesizer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail_call: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(delay: Duration, call: usize) -> Self {
        Self {
            delay,
            fail_call: Some(call),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for DelayedSynthesizer {
    async fn synthesize(&self, text: &str, _language: &str, _voice_id: &str) -> Result<Vec<u8>, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail_call == Some(call) {
            return Err(ProviderError::Http("500: tts down".to_string()));
        }
        Ok(text.as_bytes().to_vec())
    }
}

#[derive(Default)]
pub struct RecordingAlerter {
    alerts: Mutex<Vec<SafetyAlert>>,
}

impl RecordingAlerter {
    pub fn alerts(&self) -> Vec<SafetyAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SafetyAlerter for RecordingAlerter {
    async fn send_alert(&self, alert: &SafetyAlert) -> Result<(), ProviderError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

pub struct FixedAffect(pub AffectSnapshot);

#[async_trait]
impl AffectSource for FixedAffect {
    async fn latest(&self, _user_id: &str) -> Result<Option<AffectSnapshot>, ProviderError> {
        Ok(Some(self.0.clone()))
    }
}

/// Handles to the doubles inside a [`VoiceServices`], for assertions.
pub struct TestDoubles {
    pub transcriber: Arc<ScriptedTranscriber>,
    pub synthesizer: Arc<DelayedSynthesizer>,
    pub generator: Arc<RecordingGenerator>,
    pub classifier: Arc<FixedClassifier>,
    pub alerter: Arc<RecordingAlerter>,
}

impl TestDoubles {
    pub fn new(transcript: &str, reply: &str) -> Self {
        Self {
            transcriber: Arc::new(ScriptedTranscriber::new(transcript)),
            synthesizer: Arc::new(DelayedSynthesizer::new(Duration::from_millis(10))),
            generator: Arc::new(RecordingGenerator::new(reply)),
            classifier: Arc::new(FixedClassifier::new(RiskTier::None)),
            alerter: Arc::new(RecordingAlerter::default()),
        }
    }

    pub fn services(&self) -> VoiceServices {
        VoiceServices {
            transcriber: self.transcriber.clone(),
            synthesizer: self.synthesizer.clone(),
            generator: self.generator.clone(),
            classifier: self.classifier.clone(),
            alerter: self.alerter.clone(),
            affect: None,
            agents: Arc::new(StaticAgentDirectory::builtin("eve_black_career")),
        }
    }
}
