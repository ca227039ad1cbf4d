//! # Audio Format Handling
//!
//! Audio reaching the service is either raw 16-bit little-endian PCM or a
//! compressed container recorded by the browser. Speech-to-text services want
//! a file they can recognise, so raw PCM is wrapped into a WAV container before
//! upload while containers pass through untouched.
//!
//! The same module renders the tone used by the offline synthesizer.

use crate::config::AudioConfig;
use byteorder::{LittleEndian, ReadBytesExt};
use std::f32::consts::PI;
use std::io::Cursor;

/// What kind of payload an utterance snapshot contains, detected from its magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioContainer {
    Wav,
    WebM,
    Ogg,
    Mp3,
    RawPcm,
}

impl AudioContainer {
    /// Detect the container from the first bytes of the payload.
    pub fn detect(data: &[u8]) -> Self {
        if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE" {
            AudioContainer::Wav
        } else if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            AudioContainer::WebM
        } else if data.starts_with(b"OggS") {
            AudioContainer::Ogg
        } else if data.starts_with(b"ID3") || data.starts_with(&[0xFF, 0xFB]) {
            AudioContainer::Mp3
        } else {
            AudioContainer::RawPcm
        }
    }

    /// File name used for multipart uploads; STT services sniff the extension.
    pub fn file_name(&self) -> &'static str {
        match self {
            AudioContainer::Wav | AudioContainer::RawPcm => "audio.wav",
            AudioContainer::WebM => "audio.webm",
            AudioContainer::Ogg => "audio.ogg",
            AudioContainer::Mp3 => "audio.mp3",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioContainer::Wav | AudioContainer::RawPcm => "audio/wav",
            AudioContainer::WebM => "audio/webm",
            AudioContainer::Ogg => "audio/ogg",
            AudioContainer::Mp3 => "audio/mpeg",
        }
    }
}

/// An utterance ready to be uploaded to a transcription service.
#[derive(Debug, Clone)]
pub struct PreparedAudio {
    pub bytes: Vec<u8>,
    pub container: AudioContainer,
}

/// Converts between raw PCM and WAV for the configured input format.
#[derive(Debug, Clone)]
pub struct AudioProcessor {
    format: AudioConfig,
}

impl AudioProcessor {
    pub fn new(format: AudioConfig) -> Self {
        Self { format }
    }

    /// Decode little-endian 16-bit samples. A trailing odd byte is ignored.
    pub fn pcm_samples(&self, data: &[u8]) -> Vec<i16> {
        let mut cursor = Cursor::new(data);
        let mut samples = Vec::with_capacity(data.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        samples
    }

    /// Approximate duration of raw PCM in seconds.
    pub fn pcm_duration_secs(&self, byte_len: usize) -> f64 {
        let bytes_per_second = self.format.sample_rate as usize
            * self.format.channels as usize
            * (self.format.bit_depth as usize / 8);
        if bytes_per_second == 0 {
            return 0.0;
        }
        byte_len as f64 / bytes_per_second as f64
    }

    /// Wrap raw PCM into a WAV file with the configured format.
    pub fn pcm_to_wav(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let samples = self.pcm_samples(data);
        encode_wav(
            samples,
            self.format.sample_rate,
            self.format.channels,
        )
    }

    /// Prepare an utterance snapshot for upload: containers pass through, raw PCM gets a WAV header.
    pub fn prepare_for_upload(&self, data: &[u8]) -> std::io::Result<PreparedAudio> {
        let container = AudioContainer::detect(data);
        let bytes = match container {
            AudioContainer::RawPcm => self.pcm_to_wav(data)?,
            _ => data.to_vec(),
        };
        Ok(PreparedAudio { bytes, container })
    }
}

/// Encode 16-bit samples as a complete WAV file in memory.
pub fn encode_wav(samples: Vec<i16>, sample_rate: u32, channels: u16) -> std::io::Result<Vec<u8>> {
    let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, channels, sample_rate, 16);
    let mut cursor = Cursor::new(Vec::new());
    wav::write(header, &wav::BitDepth::Sixteen(samples), &mut cursor)?;
    Ok(cursor.into_inner())
}

/// Render a mono sine tone as a WAV file.
///
/// Used by the offline synthesizer so clients receive playable audio of a
/// plausible length without any speech engine.
pub fn tone_wav(
    duration_secs: f32,
    sample_rate: u32,
    frequency_hz: f32,
    amplitude: f32,
) -> std::io::Result<Vec<u8>> {
    let total = (duration_secs * sample_rate as f32) as usize;
    let samples = (0..total)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (amplitude * (2.0 * PI * frequency_hz * t).sin()) as i16
        })
        .collect();
    encode_wav(samples, sample_rate, 1)
}
