//! # Utterance Pipeline
//!
//! Turns one finished utterance into a spoken reply:
//!
//! ```text
//! audio ─► Transcriber ─► SafetyGate ─┬─ medium/high ─► safety script (+ alert)
//!                                     └─ none/low ────► ReplyGenerator
//!                                                             │
//!              ai_text ◄──────────────────────────────────────┘
//!                 │
//!                 ▼
//!      ResponseChunker ─► Synthesizer (per chunk) ─► ai_audio_chunk … tts_complete
//! ```
//!
//! ## Failure policy:
//! Every collaborator call runs under a deadline and every failure is handled
//! locally: failed transcription ends the turn with an `error` event, a failed
//! classifier falls back to the phrase scan, a failed generator is replaced by a
//! fixed apology, and a failed synthesis skips only that chunk's audio.
//!
//! ## Cancellation:
//! The session's cancel flag is checked before each synthesis call and before
//! each chunk is sent. When it is set delivery stops, no `tts_complete` is sent
//! and the flag is cleared. A synthesis call already in flight is never interrupted.
//!
//! ## Rust Concepts:
//! - **Owned turn data**: the pipeline takes the audio snapshot, a copy of the
//!   history and cloned `Arc`s, so the turn future is `'static` and the session
//!   task can keep reading frames while it runs

use super::chunker::ResponseChunker;
use super::memory::{AffectSnapshot, ConversationTurn};
use super::protocol::{EventSink, OutboundEvent};
use super::safety::{safety_reply, RiskTier, SafetyAlert, SafetyGate};
use super::session::{SessionControl, SessionProfile};
use crate::config::PipelineConfig;
use crate::error::VoiceError;
use crate::providers::{ReplyRequest, VoiceServices};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// What one utterance produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResult {
    Normal(String),
    Safety { tier: RiskTier, script: String },
    Failure(VoiceError),
}

/// How far audio delivery got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Every chunk was handled and `tts_complete` was sent
    Completed { chunks: usize },
    /// A barge-in stopped delivery after `sent` chunks
    Cancelled { sent: usize },
    /// The client went away mid-turn
    Disconnected,
    /// Nothing was spoken (failed turn)
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub result: PipelineResult,
    /// Turn to remember; only set for normal replies
    pub memory_turn: Option<ConversationTurn>,
    pub delivery: Delivery,
}

impl TurnOutcome {
    fn failed(err: VoiceError) -> Self {
        Self {
            result: PipelineResult::Failure(err),
            memory_turn: None,
            delivery: Delivery::Skipped,
        }
    }
}

/// Per-turn handles shared with the session task.
#[derive(Clone)]
pub struct TurnScope {
    pub profile: Arc<SessionProfile>,
    pub control: Arc<SessionControl>,
    pub sink: EventSink,
}

pub struct UtterancePipeline {
    services: VoiceServices,
    gate: SafetyGate,
    chunker: ResponseChunker,
    config: PipelineConfig,
}

impl UtterancePipeline {
    pub fn new(services: VoiceServices, config: PipelineConfig) -> Self {
        Self {
            gate: SafetyGate::new(services.classifier.clone(), config.call_timeout()),
            chunker: ResponseChunker::new(config.max_chunks),
            services,
            config,
        }
    }

    pub fn services(&self) -> &VoiceServices {
        &self.services
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one utterance end to end.
    pub async fn run_utterance(
        &self,
        audio: Vec<u8>,
        history: Vec<ConversationTurn>,
        scope: TurnScope,
    ) -> TurnOutcome {
        let started = Instant::now();
        let profile = &scope.profile;
        let sink = &scope.sink;
        sink.emit(OutboundEvent::processing_voice());

        let text = match self.transcribe(&audio, profile, sink).await {
            Ok(text) => text,
            Err(err) => return TurnOutcome::failed(err),
        };
        sink.emit(OutboundEvent::final_transcript(&text));
        debug!(
            session_id = %profile.session_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transcription done"
        );

        let verdict = self.gate.assess(&text).await;
        let assessment = verdict.assessment;
        if let Some(degraded) = &verdict.degraded {
            warn!(session_id = %profile.session_id, tier = %assessment.tier, "{}", degraded);
        }

        if assessment.tier.requires_escalation() {
            let script = safety_reply(assessment.tier, &profile.language, &profile.region);
            let transcript = if profile.consent { text.as_str() } else { "[withheld]" };
            warn!(
                target: "audit",
                session_id = %profile.session_id,
                user_id = %profile.user_id,
                tier = %assessment.tier,
                reason = %assessment.reason,
                urgent = assessment.urgent,
                transcript,
                "Safety escalation"
            );
            self.dispatch_alert(SafetyAlert::new(&profile.user_id, &profile.session_id, &assessment));

            let delivery = self.deliver(&script, &scope).await;
            return TurnOutcome {
                result: PipelineResult::Safety {
                    tier: assessment.tier,
                    script,
                },
                memory_turn: None,
                delivery,
            };
        }

        let affect = self.affect(profile).await;
        let reply = self.generate(&text, &history, affect.as_ref(), profile).await;
        debug!(
            session_id = %profile.session_id,
            tier = %assessment.tier,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reply ready"
        );

        let delivery = self.deliver(&reply, &scope).await;
        info!(
            session_id = %profile.session_id,
            ?delivery,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Turn finished"
        );

        TurnOutcome {
            memory_turn: Some(ConversationTurn::new(text, reply.clone(), affect)),
            result: PipelineResult::Normal(reply),
            delivery,
        }
    }

    /// Speak a fixed line (greeting, nudge) through the normal delivery path.
    pub async fn announce(&self, text: String, scope: TurnScope) -> TurnOutcome {
        let delivery = self.deliver(&text, &scope).await;
        TurnOutcome {
            result: PipelineResult::Normal(text),
            memory_turn: None,
            delivery,
        }
    }

    async fn transcribe(&self, audio: &[u8], profile: &SessionProfile, sink: &EventSink) -> Result<String, VoiceError> {
        if audio.is_empty() {
            let err = VoiceError::TranscriptionFailed("empty audio buffer".to_string());
            sink.emit(OutboundEvent::error_with(&err, "No audio data received"));
            return Err(err);
        }
        if audio.len() < self.config.min_utterance_bytes {
            let err = VoiceError::TranscriptionFailed(format!(
                "utterance too short: {} bytes",
                audio.len()
            ));
            warn!(session_id = %profile.session_id, "{}", err);
            sink.emit(OutboundEvent::error(&err));
            return Err(err);
        }

        let reason = match timeout(
            self.config.call_timeout(),
            self.services.transcriber.transcribe(audio, &profile.language),
        )
        .await
        {
            Ok(Ok(text)) if !text.trim().is_empty() => return Ok(text.trim().to_string()),
            Ok(Ok(_)) => "empty transcript".to_string(),
            Ok(Err(err)) => err.to_string(),
            Err(_) => "transcriber timed out".to_string(),
        };

        let err = VoiceError::TranscriptionFailed(reason);
        warn!(session_id = %profile.session_id, bytes = audio.len(), "{}", err);
        sink.emit(OutboundEvent::error(&err));
        Err(err)
    }

    async fn affect(&self, profile: &SessionProfile) -> Option<AffectSnapshot> {
        let source = self.services.affect.as_ref()?;
        match timeout(self.config.call_timeout(), source.latest(&profile.user_id)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(err)) => {
                debug!(session_id = %profile.session_id, "Affect unavailable: {}", err);
                None
            }
            Err(_) => {
                debug!(session_id = %profile.session_id, "Affect lookup timed out");
                None
            }
        }
    }

    async fn generate(
        &self,
        text: &str,
        history: &[ConversationTurn],
        affect: Option<&AffectSnapshot>,
        profile: &SessionProfile,
    ) -> String {
        let skip = history.len().saturating_sub(self.config.history_turns);
        let prompt = profile.agent.build_prompt(&profile.language, affect);
        let request = ReplyRequest {
            system_prompt: &prompt,
            user_text: text,
            history: &history[skip..],
            affect,
        };

        let reason = match timeout(self.config.call_timeout(), self.services.generator.generate(request)).await {
            Ok(Ok(reply)) if !reply.trim().is_empty() => return reply.trim().to_string(),
            Ok(Ok(_)) => "empty reply".to_string(),
            Ok(Err(err)) => err.to_string(),
            Err(_) => "generator timed out".to_string(),
        };

        let err = VoiceError::GenerationFailed(reason);
        warn!(session_id = %profile.session_id, "{}, using fallback reply", err);
        self.config.fallback_reply.clone()
    }

    /// Fire-and-forget; the turn never waits for the alert.
    fn dispatch_alert(&self, alert: SafetyAlert) {
        let alerter = self.services.alerter.clone();
        let deadline = self.config.alert_timeout();
        tokio::spawn(async move {
            match timeout(deadline, alerter.send_alert(&alert)).await {
                Ok(Ok(())) => debug!(session_id = %alert.session_id, "Safety alert sent"),
                Ok(Err(err)) => warn!(session_id = %alert.session_id, "Safety alert failed: {}", err),
                Err(_) => warn!(session_id = %alert.session_id, "Safety alert timed out"),
            }
        });
    }

    /// Send the text, then its audio chunk by chunk.
    async fn deliver(&self, text: &str, scope: &TurnScope) -> Delivery {
        let TurnScope { profile, control, sink } = scope;

        control.begin_speaking();
        if !sink.emit(OutboundEvent::ai_text(text)) || !sink.emit(OutboundEvent::generating_tts()) {
            return Delivery::Disconnected;
        }

        let chunks = self.chunker.chunk(text);
        let total = chunks.len();
        let mut sent = 0;

        for chunk in &chunks {
            if control.take_cancel() {
                info!(session_id = %profile.session_id, sent, total, "Delivery cancelled");
                return Delivery::Cancelled { sent };
            }

            let audio = timeout(
                self.config.call_timeout(),
                self.services
                    .synthesizer
                    .synthesize(&chunk.text, &profile.language, &profile.voice_id),
            )
            .await;

            if control.take_cancel() {
                info!(session_id = %profile.session_id, sent, total, "Delivery cancelled");
                return Delivery::Cancelled { sent };
            }

            let reason = match audio {
                Ok(Ok(bytes)) => {
                    if !sink.emit(OutboundEvent::audio_chunk(&bytes, chunk.index, total, &chunk.text)) {
                        return Delivery::Disconnected;
                    }
                    sent += 1;
                    sleep(self.config.pacing_for(chunk.word_count())).await;
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => "synthesizer timed out".to_string(),
            };

            let err = VoiceError::SynthesisFailed {
                chunk_index: chunk.index,
                reason,
            };
            warn!(session_id = %profile.session_id, "{}", err);
            sink.emit(OutboundEvent::error(&err));
        }

        if control.take_cancel() {
            return Delivery::Cancelled { sent };
        }
        sink.emit(OutboundEvent::TtsComplete { total_chunks: total });
        Delivery::Completed { chunks: total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::{
        DelayedSynthesizer, FailingClassifier, FixedAffect, ScriptedTranscriber, TestDoubles,
    };
    use crate::voice::session::SessionState;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn scope(services: &VoiceServices) -> (TurnScope, UnboundedReceiver<OutboundEvent>) {
        let agent = services.agents.resolve("career");
        let profile = SessionProfile {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            voice_id: agent.voice_for("en-IN"),
            agent,
            language: "en-IN".to_string(),
            region: "IN".to_string(),
            consent: false,
            created_at: Utc::now(),
        };
        let control = Arc::new(SessionControl::new());
        control.set_state(SessionState::Processing);
        let (sink, rx) = EventSink::channel();
        (
            TurnScope {
                profile: Arc::new(profile),
                control,
                sink,
            },
            rx,
        )
    }

    fn drain(rx: &mut UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn types(events: &[OutboundEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_turn_event_order() {
        let doubles = TestDoubles::new("I'm stressed about work", "That sounds hard. Let's breathe. What happened?");
        let services = doubles.services();
        let pipeline = UtterancePipeline::new(services.clone(), PipelineConfig::default());
        let (scope, mut rx) = scope(&services);

        let outcome = pipeline.run_utterance(vec![1; 400], Vec::new(), scope.clone()).await;
        assert_eq!(outcome.delivery, Delivery::Completed { chunks: 3 });
        assert!(outcome.memory_turn.is_some());
        assert_eq!(scope.control.state(), SessionState::Speaking);

        let events = drain(&mut rx);
        assert_eq!(
            types(&events),
            vec![
                "processing_voice",
                "final_transcript",
                "ai_text",
                "generating_tts",
                "ai_audio_chunk",
                "ai_audio_chunk",
                "ai_audio_chunk",
                "tts_complete"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_audio_skips_transcriber() {
        let doubles = TestDoubles::new("hello", "hi");
        let services = doubles.services();
        let pipeline = UtterancePipeline::new(services.clone(), PipelineConfig::default());
        let (scope, mut rx) = scope(&services);

        let outcome = pipeline.run_utterance(vec![0; 40], Vec::new(), scope).await;
        assert!(matches!(
            outcome.result,
            PipelineResult::Failure(VoiceError::TranscriptionFailed(_))
        ));
        assert_eq!(doubles.transcriber.calls(), 0);

        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&OutboundEvent::Error {
                message: "Speech recognition failed".to_string(),
                code: "transcription_failed".to_string(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_reports_no_audio() {
        let doubles = TestDoubles::new("hello", "hi");
        let services = doubles.services();
        let pipeline = UtterancePipeline::new(services.clone(), PipelineConfig::default());
        let (scope, mut rx) = scope(&services);

        pipeline.run_utterance(Vec::new(), Vec::new(), scope).await;
        let events = drain(&mut rx);
        match events.last() {
            Some(OutboundEvent::Error { message, .. }) => assert_eq!(message, "No audio data received"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_transcription_is_reported() {
        let doubles = TestDoubles::new("unused", "unused");
        let mut services = doubles.services();
        services.transcriber = Arc::new(ScriptedTranscriber::failing());
        let pipeline = UtterancePipeline::new(services.clone(), PipelineConfig::default());
        let (scope, mut rx) = scope(&services);

        let outcome = pipeline.run_utterance(vec![1; 500], Vec::new(), scope).await;
        assert_eq!(outcome.delivery, Delivery::Skipped);
        assert_eq!(doubles.generator.calls(), 0);
        assert_eq!(types(&drain(&mut rx)), vec!["processing_voice", "error"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_risk_uses_safety_script_and_alerts() {
        let doubles = TestDoubles::new("I want to end it all", "should not be used");
        let services = doubles.services();
        let pipeline = UtterancePipeline::new(services.clone(), PipelineConfig::default());
        let (scope, mut rx) = scope(&services);

        let outcome = pipeline.run_utterance(vec![1; 500], Vec::new(), scope).await;
        match &outcome.result {
            PipelineResult::Safety { tier, script } => {
                assert_eq!(*tier, RiskTier::High);
                assert!(script.contains("AASRA"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(outcome.memory_turn.is_none());
        assert_eq!(doubles.generator.calls(), 0);
        assert_eq!(doubles.classifier.calls(), 0);

        // let the spawned alert task run
        tokio::task::yield_now().await;
        let alerts = doubles.alerter.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].risk_level, RiskTier::High);

        let events = drain(&mut rx);
        let spoken = events.iter().find_map(|e| match e {
            OutboundEvent::AiText { data } => Some(data.text.clone()),
            _ => None,
        });
        assert_eq!(spoken, Some(safety_reply(RiskTier::High, "en-IN", "IN")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifier_outage_still_catches_high_risk() {
        let doubles = TestDoubles::new("I want to kill myself", "unused");
        let mut services = doubles.services();
        services.classifier = Arc::new(FailingClassifier);
        let pipeline = UtterancePipeline::new(services.clone(), PipelineConfig::default());
        let (scope, _rx) = scope(&services);

        let outcome = pipeline.run_utterance(vec![1; 500], Vec::new(), scope).await;
        assert!(matches!(
            outcome.result,
            PipelineResult::Safety { tier: RiskTier::High, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_failure_uses_fallback_reply() {
        let doubles = TestDoubles::new("hello there", "unused");
        let mut services = doubles.services();
        services.generator = Arc::new(crate::providers::testing::RecordingGenerator::failing());
        let pipeline = UtterancePipeline::new(services.clone(), PipelineConfig::default());
        let (scope, _rx) = scope(&services);

        let outcome = pipeline.run_utterance(vec![1; 500], Vec::new(), scope).await;
        assert_eq!(
            outcome.result,
            PipelineResult::Normal(PipelineConfig::default().fallback_reply)
        );
        assert_eq!(
            outcome.memory_turn.map(|t| t.assistant_text),
            Some(PipelineConfig::default().fallback_reply)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_capped() {
        let doubles = TestDoubles::new("hello there", "Hi.");
        let services = doubles.services();
        let pipeline = UtterancePipeline::new(services.clone(), PipelineConfig::default());
        let (scope, _rx) = scope(&services);
        let history: Vec<ConversationTurn> = (0..9).map(|i| ConversationTurn::new(format!("u{}", i), "a", None)).collect();

        pipeline.run_utterance(vec![1; 500], history, scope).await;
        assert_eq!(doubles.generator.history_lens(), vec![6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_affect_snapshot_is_remembered_with_the_turn() {
        let doubles = TestDoubles::new("hello there", "Hi.");
        let mut services = doubles.services();
        let mut scores = std::collections::BTreeMap::new();
        scores.insert("stressed".to_string(), 0.9);
        let snapshot = AffectSnapshot(scores);
        services.affect = Some(Arc::new(FixedAffect(snapshot.clone())));
        let pipeline = UtterancePipeline::new(services.clone(), PipelineConfig::default());
        let (scope, _rx) = scope(&services);

        let outcome = pipeline.run_utterance(vec![1; 500], Vec::new(), scope).await;
        assert_eq!(outcome.memory_turn.and_then(|t| t.affect), Some(snapshot));
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_failure_skips_only_that_chunk() {
        let doubles = TestDoubles::new("hello there", "One. Two. Three.");
        let mut services = doubles.services();
        services.synthesizer = Arc::new(DelayedSynthesizer::failing_on(Duration::from_millis(5), 1));
        let pipeline = UtterancePipeline::new(services.clone(), PipelineConfig::default());
        let (scope, mut rx) = scope(&services);

        let outcome = pipeline.run_utterance(vec![1; 500], Vec::new(), scope).await;
        assert_eq!(outcome.delivery, Delivery::Completed { chunks: 3 });

        let events = drain(&mut rx);
        let indices: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::AiAudioChunk { data } => Some(data.chunk_index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 2]);
        assert!(events.contains(&OutboundEvent::Error {
            message: "Voice synthesis failed for part 2".to_string(),
            code: "synthesis_failed".to_string(),
        }));
        assert_eq!(events.last(), Some(&OutboundEvent::TtsComplete { total_chunks: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_before_next_chunk() {
        let doubles = TestDoubles::new("hello there", "One. Two. Three.");
        let services = doubles.services();
        let pipeline = UtterancePipeline::new(services.clone(), PipelineConfig::default());
        let (scope, mut rx) = scope(&services);
        scope.control.request_cancel();

        let outcome = pipeline.announce("One. Two. Three.".to_string(), scope.clone()).await;
        assert_eq!(outcome.delivery, Delivery::Cancelled { sent: 0 });
        assert!(!scope.control.take_cancel(), "flag is cleared once observed");
        assert_eq!(types(&drain(&mut rx)), vec!["ai_text", "generating_tts"]);
    }
}
