//! # Voice Stream Protocol
//!
//! Closed message types for both directions of the voice WebSocket. Frames are
//! decoded once at the boundary; everything past this module works with enums.
//!
//! ## Client → Server:
//! - JSON text frames tagged by `type`: `init`, `audio_chunk`, `utterance_end`
//!   (`user_utterance_end` is accepted too), `no_speech_detected`, `barge_in`, `end_session`
//! - Binary frames: raw utterance audio
//!
//! ## Server → Client:
//! - JSON text frames tagged by `type`, see [`OutboundEvent`]

use crate::error::VoiceError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Session parameters carried by the `init` frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InitRequest {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, alias = "agentId", alias = "preferred_agent")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    /// Whether transcripts may be retained in the audit log
    #[serde(default)]
    pub consent: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TextFrame {
    Init(InitRequest),
    AudioChunk {
        audio_data: String,
    },
    #[serde(alias = "user_utterance_end")]
    UtteranceEnd,
    NoSpeechDetected,
    BargeIn,
    EndSession,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Init(InitRequest),
    Audio(Vec<u8>),
    UtteranceEnd,
    NoSpeech,
    BargeIn,
    EndSession,
}

impl InboundFrame {
    /// Decode a JSON text frame.
    pub fn decode_text(text: &str) -> Result<Self, VoiceError> {
        let frame: TextFrame = serde_json::from_str(text)
            .map_err(|e| VoiceError::ProtocolViolation(format!("unrecognized frame: {}", e)))?;

        Ok(match frame {
            TextFrame::Init(init) => InboundFrame::Init(init),
            TextFrame::AudioChunk { audio_data } => InboundFrame::Audio(decode_audio(&audio_data)?),
            TextFrame::UtteranceEnd => InboundFrame::UtteranceEnd,
            TextFrame::NoSpeechDetected => InboundFrame::NoSpeech,
            TextFrame::BargeIn => InboundFrame::BargeIn,
            TextFrame::EndSession => InboundFrame::EndSession,
        })
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::Init(_) => "init",
            InboundFrame::Audio(_) => "audio",
            InboundFrame::UtteranceEnd => "utterance_end",
            InboundFrame::NoSpeech => "no_speech_detected",
            InboundFrame::BargeIn => "barge_in",
            InboundFrame::EndSession => "end_session",
        }
    }
}

/// Base64 audio, with or without a `data:...;base64,` prefix.
fn decode_audio(encoded: &str) -> Result<Vec<u8>, VoiceError> {
    let payload = match encoded.split_once("base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };
    STANDARD
        .decode(payload.trim())
        .map_err(|e| VoiceError::ProtocolViolation(format!("invalid base64 audio: {}", e)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPayload {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioChunkPayload {
    pub audio_base64: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
}

/// Server events, serialized as `{"type": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    ConnectionEstablished {
        session_id: String,
        agent_name: String,
        agent_domain: String,
        agent_languages: Vec<String>,
        voice_prefs: BTreeMap<String, String>,
        demo_mode: bool,
    },
    ProcessingVoice {
        message: String,
    },
    FinalTranscript {
        data: TextPayload,
    },
    AiText {
        data: TextPayload,
    },
    GeneratingTts {
        message: String,
    },
    AiAudioChunk {
        data: AudioChunkPayload,
    },
    TtsComplete {
        total_chunks: usize,
    },
    StopTts,
    SessionEnded,
    Error {
        message: String,
        code: String,
    },
}

impl OutboundEvent {
    pub fn processing_voice() -> Self {
        OutboundEvent::ProcessingVoice {
            message: "Processing your voice...".to_string(),
        }
    }

    pub fn generating_tts() -> Self {
        OutboundEvent::GeneratingTts {
            message: "Generating voice response...".to_string(),
        }
    }

    pub fn final_transcript(text: &str) -> Self {
        OutboundEvent::FinalTranscript {
            data: TextPayload { text: text.to_string() },
        }
    }

    pub fn ai_text(text: &str) -> Self {
        OutboundEvent::AiText {
            data: TextPayload { text: text.to_string() },
        }
    }

    pub fn audio_chunk(audio: &[u8], chunk_index: usize, total_chunks: usize, text: &str) -> Self {
        OutboundEvent::AiAudioChunk {
            data: AudioChunkPayload {
                audio_base64: STANDARD.encode(audio),
                chunk_index,
                total_chunks,
                text: text.to_string(),
            },
        }
    }

    pub fn error(err: &VoiceError) -> Self {
        OutboundEvent::Error {
            message: err.user_message(),
            code: err.code().to_string(),
        }
    }

    /// Error event with a custom message.
    pub fn error_with(err: &VoiceError, message: &str) -> Self {
        OutboundEvent::Error {
            message: message.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Ordered outbound channel of one connection.
///
/// Sending never blocks; it only fails once the connection is gone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<OutboundEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Returns `false` when the client has disconnected.
    pub fn emit(&self, event: OutboundEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
