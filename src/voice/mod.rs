//! # Voice Sessions
//!
//! - **protocol**: inbound frames and outbound events of the voice stream
//! - **session**: the per-connection state machine and its task
//! - **registry**: process-wide map of live sessions
//! - **pipeline**: transcription, safety gate, reply and chunked synthesis for one utterance
//! - **safety**: risk tiers, pattern scan and localized safety scripts
//! - **chunker**: sentence-aligned reply chunks
//! - **memory**: bounded per-session conversation history

pub mod chunker;
pub mod memory;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod safety;
pub mod session;
