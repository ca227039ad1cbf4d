//! # Audio Handling
//!
//! - **buffer**: per-utterance chunk accumulation, owned by one session task
//! - **processor**: container detection, PCM to WAV wrapping, tone rendering

pub mod buffer;
pub mod processor;
