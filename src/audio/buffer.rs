//! # Utterance Audio Buffer
//!
//! Accumulates the raw audio chunks of one in-progress utterance. Chunks are
//! opaque bytes (raw PCM, or a browser container such as WebM/Ogg) and are kept
//! in arrival order until the utterance ends.
//!
//! ## Ownership:
//! A buffer belongs to exactly one session task, so it is a plain owned value
//! with `&mut self` methods rather than a shared `Arc<Mutex<..>>`. The pipeline
//! never sees the buffer itself, only the snapshot returned by [`AudioBuffer::take`].

use crate::error::VoiceError;

/// Ordered byte chunks for a single utterance.
#[derive(Debug)]
pub struct AudioBuffer {
    chunks: Vec<Vec<u8>>,
    total_bytes: usize,
    /// Upper bound for one utterance; protects the process from a client that never stops talking
    max_bytes: usize,
}

impl AudioBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: Vec::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Append one chunk in arrival order.
    ///
    /// ## Returns:
    /// - **Ok(())**: chunk stored (empty chunks are accepted and ignored)
    /// - **Err(ProtocolViolation)**: the utterance would exceed `max_bytes`; the chunk is dropped
    pub fn push(&mut self, chunk: Vec<u8>) -> Result<(), VoiceError> {
        if chunk.is_empty() {
            return Ok(());
        }

        if self.total_bytes + chunk.len() > self.max_bytes {
            return Err(VoiceError::ProtocolViolation(format!(
                "Utterance exceeds {} bytes, audio chunk dropped",
                self.max_bytes
            )));
        }

        self.total_bytes += chunk.len();
        self.chunks.push(chunk);
        Ok(())
    }

    /// Concatenate every chunk into one snapshot and clear the buffer in the same step.
    pub fn take(&mut self) -> Vec<u8> {
        let mut snapshot = Vec::with_capacity(self.total_bytes);
        for chunk in self.chunks.drain(..) {
            snapshot.extend_from_slice(&chunk);
        }
        self.total_bytes = 0;
        snapshot
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    pub fn len_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }
}
