//! # Session State Machine
//!
//! One task per connection drives a session through its lifecycle:
//!
//! ```text
//! Connecting ─► Greeting ─► Listening ─► Processing ─► Speaking ─► Listening ...
//!      │                        ▲                          │
//!      │                        └────────── barge_in ──────┘
//!      └──────────────► Ended (from any state)
//! ```
//!
//! ## Task layout:
//! The session task owns the audio buffer and the conversation memory. At most
//! one turn future (greeting, nudge or utterance) is in flight; the task polls
//! it alongside the inbound frame channel in a `tokio::select!` loop, so control
//! frames such as `barge_in` are handled while a reply is still being spoken.
//!
//! ## Frame handling by state:
//! | Frame             | Greeting      | Listening        | Processing    | Speaking       |
//! |-------------------|---------------|------------------|---------------|----------------|
//! | audio             | dropped       | buffered         | buffered (next utterance) | buffered (next utterance) |
//! | utterance_end     | ignored       | starts a turn    | ignored       | ignored        |
//! | no_speech         | ignored       | speaks a nudge   | ignored       | ignored        |
//! | barge_in          | stops speech  | no-op            | ignored       | stops speech   |
//! | end_session       | ends          | ends             | ends          | ends           |

use super::memory::ConversationMemory;
use super::pipeline::{Delivery, PipelineResult, TurnOutcome, TurnScope, UtterancePipeline};
use super::protocol::{EventSink, InboundFrame, InitRequest, OutboundEvent};
use super::registry::{Admission, SessionRegistry};
use super::safety::region_of;
use crate::agents::{no_speech_prompt, AgentProfile};
use crate::audio::buffer::AudioBuffer;
use crate::config::SessionConfig;
use crate::error::VoiceError;
use crate::state::MetricsHandle;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Greeting,
    Listening,
    Processing,
    Speaking,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Greeting => "greeting",
            SessionState::Listening => "listening",
            SessionState::Processing => "processing",
            SessionState::Speaking => "speaking",
            SessionState::Ended => "ended",
        }
    }
}

/// State shared between a session task, its in-flight turn and the registry.
#[derive(Debug)]
pub struct SessionControl {
    state: RwLock<SessionState>,
    cancel: AtomicBool,
    terminate: Notify,
}

impl SessionControl {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::Connecting),
            cancel: AtomicBool::new(false),
            terminate: Notify::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// `Processing` becomes `Speaking`; any other state is left alone.
    pub fn begin_speaking(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Processing {
            *state = SessionState::Speaking;
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Read and clear the cancel flag.
    pub fn take_cancel(&self) -> bool {
        self.cancel.swap(false, Ordering::SeqCst)
    }

    /// Stop the session from outside its task.
    pub fn terminate(&self) {
        self.request_cancel();
        self.terminate.notify_one();
    }

    pub async fn terminated(&self) {
        self.terminate.notified().await
    }
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything fixed at init time.
#[derive(Debug, Clone)]
pub struct SessionProfile {
    pub session_id: String,
    pub user_id: String,
    pub agent: Arc<AgentProfile>,
    pub language: String,
    /// Helpline region
    pub region: String,
    pub voice_id: String,
    /// Whether transcripts may appear in the audit log
    pub consent: bool,
    pub created_at: DateTime<Utc>,
}

/// Shared dependencies of every session task.
#[derive(Clone)]
pub struct SessionRuntime {
    pub pipeline: Arc<UtterancePipeline>,
    pub registry: Arc<SessionRegistry>,
    pub config: SessionConfig,
    pub metrics: MetricsHandle,
    /// Reported to clients in `connection_established`
    pub demo_mode: bool,
}

type TurnFuture = BoxFuture<'static, TurnOutcome>;

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    End,
}

/// Drive one connection until it ends.
///
/// `frames` closes when the client disconnects. The session ends when the
/// returned future completes, after which `sink` and every clone of it are dropped.
pub async fn run_session(
    runtime: SessionRuntime,
    session_id: String,
    mut frames: mpsc::UnboundedReceiver<InboundFrame>,
    sink: EventSink,
) {
    let control = Arc::new(SessionControl::new());

    let init = match await_init(&runtime, &session_id, &mut frames, &sink).await {
        Some(init) => init,
        None => {
            control.set_state(SessionState::Ended);
            return;
        }
    };

    let profile = match admit(&runtime, &session_id, init, &control, &sink) {
        Ok(profile) => Arc::new(profile),
        Err(err) => {
            warn!(session_id = %session_id, "Session rejected: {}", err);
            sink.emit(OutboundEvent::error(&err));
            control.set_state(SessionState::Ended);
            return;
        }
    };
    runtime.metrics.record(|m| m.sessions_started += 1);

    let mut session = Session {
        memory: ConversationMemory::new(runtime.config.memory_max_turns),
        buffer: AudioBuffer::new(runtime.pipeline.config().max_utterance_bytes),
        queued_utterance: None,
        scope: TurnScope {
            profile,
            control: control.clone(),
            sink,
        },
        runtime,
    };
    session.run(&mut frames).await;
    session.teardown();
}

/// Wait for the `init` frame, ignoring anything else, until the init deadline.
async fn await_init(
    runtime: &SessionRuntime,
    session_id: &str,
    frames: &mut mpsc::UnboundedReceiver<InboundFrame>,
    sink: &EventSink,
) -> Option<InitRequest> {
    let deadline = Instant::now() + runtime.config.init_timeout();
    loop {
        match timeout_at(deadline, frames.recv()).await {
            Ok(Some(InboundFrame::Init(init))) => return Some(init),
            Ok(Some(other)) => {
                debug!(session_id, frame = other.kind(), "Frame before init ignored");
            }
            Ok(None) => {
                info!(session_id, "Client left before init");
                return None;
            }
            Err(_) => {
                warn!(session_id, "No init frame before deadline");
                sink.emit(OutboundEvent::error(&VoiceError::AuthTimeout));
                return None;
            }
        }
    }
}

/// Validate the init frame, build the profile and register the session.
fn admit(
    runtime: &SessionRuntime,
    session_id: &str,
    init: InitRequest,
    control: &Arc<SessionControl>,
    sink: &EventSink,
) -> Result<SessionProfile, VoiceError> {
    let config = &runtime.config;
    let has_token = init.token.as_deref().map_or(false, |t| !t.trim().is_empty());
    if config.require_token && !has_token {
        return Err(VoiceError::AuthRequired);
    }

    let services = runtime.pipeline.services();
    let agent = services
        .agents
        .resolve(init.agent_id.as_deref().unwrap_or(&config.default_agent));
    let language = agent.normalize_language(
        init.lang.as_deref().unwrap_or(&config.default_language),
        &config.default_language,
    );
    let profile = SessionProfile {
        session_id: session_id.to_string(),
        user_id: init
            .user_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("demo_user_{}", session_id)),
        region: region_of(&language).unwrap_or_else(|| config.default_region.clone()),
        voice_id: agent.voice_for(&language),
        language,
        agent,
        consent: init.consent,
        created_at: Utc::now(),
    };

    match runtime.registry.create(profile.clone(), control.clone())? {
        Admission::Created(_) => {}
        Admission::Existing(_) => return Err(VoiceError::SessionConflict(session_id.to_string())),
    }

    info!(
        session_id,
        user_id = %profile.user_id,
        agent = %profile.agent.id,
        language = %profile.language,
        "Session initialized"
    );
    sink.emit(OutboundEvent::ConnectionEstablished {
        session_id: session_id.to_string(),
        agent_name: profile.agent.name.clone(),
        agent_domain: profile.agent.domain.clone(),
        agent_languages: profile.agent.languages.clone(),
        voice_prefs: profile.agent.voice_prefs.clone(),
        demo_mode: runtime.demo_mode,
    });
    Ok(profile)
}

struct Session {
    runtime: SessionRuntime,
    scope: TurnScope,
    buffer: AudioBuffer,
    memory: ConversationMemory,
    /// Audio of an utterance that ended while a cancelled turn was still draining
    queued_utterance: Option<Vec<u8>>,
}

impl Session {
    fn session_id(&self) -> &str {
        &self.scope.profile.session_id
    }

    fn control(&self) -> &SessionControl {
        &self.scope.control
    }

    async fn run(&mut self, frames: &mut mpsc::UnboundedReceiver<InboundFrame>) {
        let control = self.scope.control.clone();
        let idle_timeout = self.runtime.config.idle_timeout();

        control.set_state(SessionState::Greeting);
        let greeting = self.scope.profile.agent.greeting(&self.scope.profile.language);
        let mut in_flight: Option<TurnFuture> = Some(self.announce(greeting));
        let mut idle_deadline = Instant::now() + idle_timeout;

        loop {
            tokio::select! {
                outcome = async {
                    match in_flight.as_mut() {
                        Some(turn) => turn.await,
                        None => std::future::pending().await,
                    }
                }, if in_flight.is_some() => {
                    in_flight = None;
                    self.finish_turn(outcome);
                    if let Some(audio) = self.queued_utterance.take() {
                        in_flight = Some(self.start_utterance(audio));
                    }
                    idle_deadline = Instant::now() + idle_timeout;
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        info!(session_id = %self.session_id(), "Client disconnected");
                        break;
                    };
                    idle_deadline = Instant::now() + idle_timeout;
                    if self.handle_frame(frame, &mut in_flight) == Flow::End {
                        break;
                    }
                }
                _ = sleep_until(idle_deadline), if in_flight.is_none() => {
                    warn!(session_id = %self.session_id(), "Idle timeout");
                    self.scope.sink.emit(OutboundEvent::error(&VoiceError::IdleTimeout));
                    self.scope.sink.emit(OutboundEvent::SessionEnded);
                    break;
                }
                _ = control.terminated() => {
                    info!(session_id = %self.session_id(), "Session terminated externally");
                    self.scope.sink.emit(OutboundEvent::SessionEnded);
                    break;
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: InboundFrame, in_flight: &mut Option<TurnFuture>) -> Flow {
        let state = self.control().state();

        match frame {
            InboundFrame::Audio(bytes) => match state {
                SessionState::Greeting => {
                    debug!(session_id = %self.session_id(), bytes = bytes.len(), "Audio during greeting dropped");
                }
                _ => {
                    if let Err(err) = self.buffer.push(bytes) {
                        warn!(session_id = %self.session_id(), "{}", err);
                        self.scope.sink.emit(OutboundEvent::error(&err));
                    }
                }
            },
            InboundFrame::UtteranceEnd => match state {
                SessionState::Listening if self.queued_utterance.is_none() => {
                    debug!(
                        session_id = %self.session_id(),
                        bytes = self.buffer.len_bytes(),
                        chunks = self.buffer.chunk_count(),
                        "Utterance ended"
                    );
                    let audio = self.buffer.take();
                    if in_flight.is_some() {
                        // a cancelled turn is still draining its last synthesis call
                        self.queued_utterance = Some(audio);
                    } else {
                        *in_flight = Some(self.start_utterance(audio));
                    }
                }
                _ => self.ignore("utterance_end", state),
            },
            InboundFrame::NoSpeech => match state {
                SessionState::Listening if in_flight.is_none() => {
                    debug!(session_id = %self.session_id(), "No speech detected, nudging");
                    self.control().set_state(SessionState::Speaking);
                    let nudge = no_speech_prompt(&self.scope.profile.language).to_string();
                    *in_flight = Some(self.announce(nudge));
                }
                _ => self.ignore("no_speech_detected", state),
            },
            InboundFrame::BargeIn => match state {
                SessionState::Speaking | SessionState::Greeting if in_flight.is_some() => {
                    self.control().request_cancel();
                    self.scope.sink.emit(OutboundEvent::StopTts);
                    self.buffer.clear();
                    self.control().set_state(SessionState::Listening);
                    self.runtime.metrics.record(|m| m.barge_ins += 1);
                    info!(session_id = %self.session_id(), interrupted = state.as_str(), "Barge-in");
                }
                SessionState::Listening => {
                    debug!(session_id = %self.session_id(), "Barge-in with nothing playing");
                }
                _ => self.ignore("barge_in", state),
            },
            InboundFrame::EndSession => {
                info!(session_id = %self.session_id(), "Session ended by client");
                self.scope.sink.emit(OutboundEvent::SessionEnded);
                return Flow::End;
            }
            InboundFrame::Init(_) => self.ignore("init", state),
        }
        Flow::Continue
    }

    fn ignore(&self, frame: &str, state: SessionState) {
        let err = VoiceError::ProtocolViolation(format!("{} not allowed while {}", frame, state.as_str()));
        warn!(session_id = %self.session_id(), "{}", err);
    }

    fn start_utterance(&mut self, audio: Vec<u8>) -> TurnFuture {
        let history = self.memory.recent(self.runtime.pipeline.config().history_turns);
        self.control().take_cancel();
        self.control().set_state(SessionState::Processing);
        self.runtime.metrics.record(|m| m.utterances += 1);

        let pipeline = self.runtime.pipeline.clone();
        let scope = self.scope.clone();
        async move { pipeline.run_utterance(audio, history, scope).await }.boxed()
    }

    fn announce(&self, text: String) -> TurnFuture {
        self.control().take_cancel();
        let pipeline = self.runtime.pipeline.clone();
        let scope = self.scope.clone();
        async move { pipeline.announce(text, scope).await }.boxed()
    }

    fn finish_turn(&mut self, outcome: TurnOutcome) {
        // a barge-in that raced with the end of the turn must not cancel the next one
        self.control().take_cancel();

        match &outcome.result {
            PipelineResult::Failure(VoiceError::TranscriptionFailed(_)) => {
                self.runtime.metrics.record(|m| m.transcription_failures += 1);
            }
            PipelineResult::Safety { .. } => {
                self.runtime.metrics.record(|m| m.safety_escalations += 1);
            }
            _ => {}
        }
        if let Delivery::Completed { .. } | Delivery::Cancelled { .. } = outcome.delivery {
            debug!(session_id = %self.session_id(), delivery = ?outcome.delivery, "Turn delivered");
        }
        if let Some(turn) = outcome.memory_turn {
            self.memory.push(turn);
            debug!(session_id = %self.session_id(), turns = self.memory.len(), "Memory updated");
        }
        self.control().set_state(SessionState::Listening);
    }

    /// Runs exactly once, however the session ended.
    fn teardown(&mut self) {
        self.control().set_state(SessionState::Ended);
        self.buffer.clear();
        self.queued_utterance = None;
        self.memory.clear();
        self.runtime
            .registry
            .release(&self.scope.profile.session_id, &self.scope.control);
        self.runtime.metrics.record(|m| m.sessions_ended += 1);
        info!(session_id = %self.session_id(), "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::providers::testing::{DelayedSynthesizer, ScriptedTranscriber, TestDoubles};
    use crate::voice::safety::{safety_reply, RiskTier};
    use std::time::Duration;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use tokio::task::JoinHandle;

    struct Harness {
        doubles: TestDoubles,
        runtime: SessionRuntime,
    }

    impl Harness {
        fn new(transcript: &str, reply: &str) -> Self {
            Self::with_doubles(TestDoubles::new(transcript, reply), SessionConfig::default())
        }

        fn with_doubles(doubles: TestDoubles, config: SessionConfig) -> Self {
            let pipeline = UtterancePipeline::new(doubles.services(), PipelineConfig::default());
            let runtime = SessionRuntime {
                pipeline: Arc::new(pipeline),
                registry: Arc::new(SessionRegistry::new(config.max_concurrent_sessions)),
                config,
                metrics: MetricsHandle::default(),
                demo_mode: true,
            };
            Self { doubles, runtime }
        }

        fn connect(
            &self,
            session_id: &str,
        ) -> (UnboundedSender<InboundFrame>, UnboundedReceiver<OutboundEvent>, JoinHandle<()>) {
            let (frames_tx, frames_rx) = mpsc::unbounded_channel();
            let (sink, events) = EventSink::channel();
            let task = tokio::spawn(run_session(
                self.runtime.clone(),
                session_id.to_string(),
                frames_rx,
                sink,
            ));
            (frames_tx, events, task)
        }
    }

    fn init(agent: &str, lang: &str) -> InboundFrame {
        InboundFrame::Init(InitRequest {
            agent_id: Some(agent.to_string()),
            lang: Some(lang.to_string()),
            ..InitRequest::default()
        })
    }

    fn kind(event: &OutboundEvent) -> String {
        serde_json::to_value(event).unwrap()["type"]
            .as_str()
            .unwrap()
            .to_string()
    }

    /// Receive events until one of type `until` arrives (inclusive).
    async fn collect_until(events: &mut UnboundedReceiver<OutboundEvent>, until: &str) -> Vec<OutboundEvent> {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = kind(&event) == until;
            seen.push(event);
            if done {
                return seen;
            }
        }
        panic!("stream closed before {}: {:?}", until, seen);
    }

    fn kinds(events: &[OutboundEvent]) -> Vec<String> {
        events.iter().map(kind).collect()
    }

    fn chunk_indices(events: &[OutboundEvent]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::AiAudioChunk { data } => Some(data.chunk_index),
                _ => None,
            })
            .collect()
    }

    async fn connect_and_greet(
        harness: &Harness,
    ) -> (UnboundedSender<InboundFrame>, UnboundedReceiver<OutboundEvent>, JoinHandle<()>) {
        let (frames, mut events, task) = harness.connect("s1");
        frames.send(init("career", "en")).unwrap();
        collect_until(&mut events, "tts_complete").await;
        (frames, events, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_greets_with_resolved_agent() {
        let harness = Harness::new("hello", "Hi.");
        let (frames, mut events, task) = harness.connect("s1");
        frames.send(init("career", "en")).unwrap();

        let greeting = collect_until(&mut events, "tts_complete").await;
        match &greeting[0] {
            OutboundEvent::ConnectionEstablished { agent_name, agent_domain, .. } => {
                assert_eq!(agent_name, "Dr. Evan Black");
                assert_eq!(agent_domain, "career");
            }
            other => panic!("expected connection_established, got {:?}", other),
        }
        assert_eq!(kind(&greeting[1]), "ai_text");
        assert!(!chunk_indices(&greeting).is_empty());

        let handle = harness.runtime.registry.get("s1").unwrap();
        assert_eq!(handle.profile.language, "en-IN");
        assert_eq!(handle.control.state(), SessionState::Listening);

        drop(frames);
        task.await.unwrap();
        assert_eq!(harness.runtime.registry.count(), 0);
        let metrics = harness.runtime.metrics.snapshot();
        assert_eq!((metrics.sessions_started, metrics.sessions_ended), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_timeout_ends_session() {
        let harness = Harness::new("hello", "Hi.");
        let (frames, mut events, task) = harness.connect("s1");
        frames.send(InboundFrame::Audio(vec![1; 10])).unwrap();

        task.await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(OutboundEvent::Error {
                message: "Authentication timeout".to_string(),
                code: "auth_timeout".to_string(),
            })
        );
        assert_eq!(events.recv().await, None);
        assert_eq!(harness.runtime.registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_rejected_when_required() {
        let config = SessionConfig {
            require_token: true,
            ..SessionConfig::default()
        };
        let harness = Harness::with_doubles(TestDoubles::new("hello", "Hi."), config);
        let (frames, mut events, task) = harness.connect("s1");
        frames.send(init("career", "en")).unwrap();

        task.await.unwrap();
        match events.recv().await {
            Some(OutboundEvent::Error { code, .. }) => assert_eq!(code, "auth_required"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_session_id_is_rejected() {
        let harness = Harness::new("hello", "Hi.");
        let (_first_frames, _first_events, _first) = connect_and_greet(&harness).await;

        let (frames, mut events, task) = harness.connect("s1");
        frames.send(init("career", "en")).unwrap();
        task.await.unwrap();
        match events.recv().await {
            Some(OutboundEvent::Error { code, .. }) => assert_eq!(code, "session_conflict"),
            other => panic!("unexpected {:?}", other),
        }
        // the original session is untouched
        assert_eq!(harness.runtime.registry.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_utterance_fails_and_returns_to_listening() {
        let harness = Harness::new("hello", "Hi.");
        let (frames, mut events, _task) = connect_and_greet(&harness).await;

        frames.send(InboundFrame::Audio(vec![1; 40])).unwrap();
        frames.send(InboundFrame::Audio(vec![1; 40])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();

        let turn = collect_until(&mut events, "error").await;
        assert_eq!(kinds(&turn), vec!["processing_voice", "error"]);
        match turn.last() {
            Some(OutboundEvent::Error { code, .. }) => assert_eq!(code, "transcription_failed"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(harness.doubles.transcriber.calls(), 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let handle = harness.runtime.registry.get("s1").unwrap();
        assert_eq!(handle.control.state(), SessionState::Listening);
        assert_eq!(harness.runtime.metrics.snapshot().transcription_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crisis_utterance_gets_safety_script() {
        let harness = Harness::new("I want to end it all", "unused reply");
        let (frames, mut events, _task) = connect_and_greet(&harness).await;

        frames.send(InboundFrame::Audio(vec![1; 800])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();
        let turn = collect_until(&mut events, "tts_complete").await;

        let spoken = turn.iter().find_map(|e| match e {
            OutboundEvent::AiText { data } => Some(data.text.clone()),
            _ => None,
        });
        assert_eq!(spoken, Some(safety_reply(RiskTier::High, "en-IN", "IN")));
        assert_eq!(harness.doubles.generator.calls(), 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(harness.doubles.alerter.alerts().len(), 1);
        assert_eq!(harness.runtime.metrics.snapshot().safety_escalations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_utterance_streams_ordered_chunks() {
        let harness = Harness::new(
            "Work is overwhelming",
            "I hear you. That is a lot. Let's slow down. What matters most today? We can start there.",
        );
        let (frames, mut events, _task) = connect_and_greet(&harness).await;

        frames.send(InboundFrame::Audio(vec![1; 800])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();
        let turn = collect_until(&mut events, "tts_complete").await;

        assert_eq!(
            kinds(&turn),
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
        assert_eq!(chunk_indices(&turn), vec![0, 1, 2]);
        assert_eq!(turn.last(), Some(&OutboundEvent::TtsComplete { total_chunks: 3 }));

        // the exchange is remembered for the next turn
        frames.send(InboundFrame::Audio(vec![1; 800])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();
        collect_until(&mut events, "tts_complete").await;
        assert_eq!(harness.doubles.generator.history_lens(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_stops_delivery() {
        let mut doubles = TestDoubles::new("Tell me more", "One. Two. Three.");
        doubles.synthesizer = Arc::new(DelayedSynthesizer::new(Duration::from_millis(500)));
        let harness = Harness::with_doubles(doubles, SessionConfig::default());
        let (frames, mut events, _task) = connect_and_greet(&harness).await;

        frames.send(InboundFrame::Audio(vec![1; 800])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();
        let before = collect_until(&mut events, "ai_audio_chunk").await;
        assert_eq!(chunk_indices(&before), vec![0]);

        frames.send(InboundFrame::Audio(vec![9; 50])).unwrap();
        frames.send(InboundFrame::BargeIn).unwrap();
        assert_eq!(events.recv().await, Some(OutboundEvent::StopTts));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let mut after = Vec::new();
        while let Ok(event) = events.try_recv() {
            after.push(event);
        }
        assert!(chunk_indices(&after).is_empty(), "no chunk after barge-in: {:?}", after);
        assert!(!kinds(&after).contains(&"tts_complete".to_string()));
        // three greeting chunks plus the one chunk delivered before the barge-in
        assert_eq!(harness.doubles.synthesizer.calls(), 4);

        let handle = harness.runtime.registry.get("s1").unwrap();
        assert_eq!(handle.control.state(), SessionState::Listening);
        assert_eq!(harness.runtime.metrics.snapshot().barge_ins, 1);

        // the session accepts the next utterance normally
        frames.send(InboundFrame::Audio(vec![1; 800])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();
        let next = collect_until(&mut events, "tts_complete").await;
        assert_eq!(chunk_indices(&next), vec![0, 1, 2]);
    }

    /// Barge-in lands while a synthesis call is in flight; the cancelled turn
    /// drains in the background and must not hold up later frames.
    async fn barge_in_mid_synthesis(
        harness: &Harness,
    ) -> (UnboundedSender<InboundFrame>, UnboundedReceiver<OutboundEvent>, JoinHandle<()>) {
        let (frames, mut events, task) = connect_and_greet(harness).await;
        frames.send(InboundFrame::Audio(vec![1; 800])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();
        collect_until(&mut events, "ai_audio_chunk").await;

        // past the pacing pause, inside the second chunk's synthesis call
        tokio::time::sleep(Duration::from_secs(1)).await;
        frames.send(InboundFrame::BargeIn).unwrap();
        assert_eq!(events.recv().await, Some(OutboundEvent::StopTts));
        (frames, events, task)
    }

    fn slow_synthesis_harness() -> Harness {
        let mut doubles = TestDoubles::new("Tell me more", "One. Two. Three.");
        doubles.synthesizer = Arc::new(DelayedSynthesizer::new(Duration::from_secs(20)));
        Harness::with_doubles(doubles, SessionConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_session_not_blocked_by_draining_turn() {
        let harness = slow_synthesis_harness();
        let (frames, mut events, task) = barge_in_mid_synthesis(&harness).await;

        let started = Instant::now();
        frames.send(InboundFrame::Audio(vec![2; 300])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();
        frames.send(InboundFrame::EndSession).unwrap();

        let tail = collect_until(&mut events, "session_ended").await;
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "end_session took {:?}",
            started.elapsed()
        );
        assert!(chunk_indices(&tail).is_empty());
        task.await.unwrap();
        assert_eq!(harness.doubles.transcriber.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_utterance_after_barge_in_runs_once_turn_drains() {
        let harness = slow_synthesis_harness();
        let (frames, mut events, _task) = barge_in_mid_synthesis(&harness).await;

        frames.send(InboundFrame::Audio(vec![2; 300])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();
        // audio after the queued utterance belongs to the one after it
        frames.send(InboundFrame::Audio(vec![3; 150])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();

        let next = collect_until(&mut events, "tts_complete").await;
        assert_eq!(kind(&next[0]), "processing_voice");
        assert_eq!(chunk_indices(&next), vec![0, 1, 2]);
        assert_eq!(harness.doubles.transcriber.audio_lens(), vec![800, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_during_processing_wait_for_next_utterance() {
        let mut doubles = TestDoubles::new("Exams are close", "Let's plan. One step at a time.");
        doubles.transcriber = Arc::new(ScriptedTranscriber::delayed("Exams are close", Duration::from_secs(2)));
        let harness = Harness::with_doubles(doubles, SessionConfig::default());
        let (frames, mut events, _task) = connect_and_greet(&harness).await;

        frames.send(InboundFrame::Audio(vec![1; 800])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();
        collect_until(&mut events, "processing_voice").await;

        frames.send(InboundFrame::Audio(vec![2; 300])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();
        let first = collect_until(&mut events, "tts_complete").await;
        assert_eq!(chunk_indices(&first), vec![0, 1]);
        assert_eq!(harness.doubles.transcriber.audio_lens(), vec![800]);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let handle = harness.runtime.registry.get("s1").unwrap();
        assert_eq!(handle.control.state(), SessionState::Listening);
        assert!(events.try_recv().is_err(), "ignored utterance_end started no turn");

        frames.send(InboundFrame::UtteranceEnd).unwrap();
        collect_until(&mut events, "tts_complete").await;
        assert_eq!(harness.doubles.transcriber.audio_lens(), vec![800, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_barge_in_while_listening_is_noop() {
        let harness = Harness::new("hello there", "Hi.");
        let (frames, mut events, _task) = connect_and_greet(&harness).await;

        frames.send(InboundFrame::Audio(vec![1; 300])).unwrap();
        frames.send(InboundFrame::BargeIn).unwrap();
        frames.send(InboundFrame::Audio(vec![1; 300])).unwrap();
        frames.send(InboundFrame::UtteranceEnd).unwrap();

        let turn = collect_until(&mut events, "tts_complete").await;
        assert!(!kinds(&turn).contains(&"stop_tts".to_string()));
        assert_eq!(harness.doubles.transcriber.calls(), 1);
        assert_eq!(harness.runtime.metrics.snapshot().barge_ins, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_speech_nudge_and_end_session() {
        let harness = Harness::new("hello", "Hi.");
        let (frames, mut events, task) = connect_and_greet(&harness).await;

        frames.send(InboundFrame::NoSpeech).unwrap();
        let nudge = collect_until(&mut events, "tts_complete").await;
        assert_eq!(
            nudge.first(),
            Some(&OutboundEvent::ai_text("Tell me, I'm listening..."))
        );

        frames.send(InboundFrame::EndSession).unwrap();
        assert_eq!(events.recv().await, Some(OutboundEvent::SessionEnded));
        task.await.unwrap();
        assert_eq!(events.recv().await, None);
        assert!(harness.runtime.registry.get("s1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_ends_session() {
        let config = SessionConfig {
            idle_timeout_secs: 30,
            ..SessionConfig::default()
        };
        let harness = Harness::with_doubles(TestDoubles::new("hello", "Hi."), config);
        let (_frames, mut events, task) = connect_and_greet(&harness).await;

        task.await.unwrap();
        match events.recv().await {
            Some(OutboundEvent::Error { code, .. }) => assert_eq!(code, "idle_timeout"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events.recv().await, Some(OutboundEvent::SessionEnded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_remove_terminates_task() {
        let harness = Harness::new("hello", "Hi.");
        let (_frames, mut events, task) = connect_and_greet(&harness).await;

        assert!(harness.runtime.registry.remove("s1"));
        task.await.unwrap();
        assert_eq!(events.recv().await, Some(OutboundEvent::SessionEnded));
        assert_eq!(harness.runtime.metrics.snapshot().sessions_ended, 1);
    }
}
