//! Audio codec support (Opus compression)
//!
//! Voice tracks are carried as Opus, the codec browsers negotiate for WebRTC
//! audio. Frames are mono at 48kHz.

use opus::{Application, Channels, Decoder, Encoder};
use thiserror::Error;

/// Opus clock rate
pub const OPUS_SAMPLE_RATE: u32 = 48000;

/// Frame lengths Opus can encode that fit a whole number of milliseconds
pub const OPUS_FRAME_MS: [u32; 5] = [5, 10, 20, 40, 60];

/// Largest Opus packet we produce
const MAX_PACKET: usize = 4000;

/// Longest frame Opus can hold (120ms at 48kHz)
const MAX_FRAME_SAMPLES: usize = 5760;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Opus error: {0}")]
    OpusError(String),
    #[error("Invalid frame: expected {expected} samples, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },
}

/// Opus voice encoder
pub struct OpusEncoder {
    encoder: Encoder,
    frame_samples: usize,
}

impl OpusEncoder {
    /// Create an encoder for frames of `frame_samples` mono samples at 48kHz
    pub fn new(frame_samples: usize) -> Result<Self, CodecError> {
        let encoder = Encoder::new(OPUS_SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::OpusError(format!("Failed to create encoder: {:?}", e)))?;
        Ok(Self {
            encoder,
            frame_samples,
        })
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Encode exactly one frame
    pub fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>, CodecError> {
        if samples.len() != self.frame_samples {
            return Err(CodecError::InvalidFrame {
                expected: self.frame_samples,
                actual: samples.len(),
            });
        }

        let mut encoded = vec![0u8; MAX_PACKET];
        let encoded_len = self
            .encoder
            .encode_float(samples, &mut encoded)
            .map_err(|e| CodecError::OpusError(format!("Encode failed: {:?}", e)))?;

        encoded.truncate(encoded_len);
        Ok(encoded)
    }
}

/// Opus voice decoder
pub struct OpusDecoder {
    decoder: Decoder,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, CodecError> {
        let decoder = Decoder::new(OPUS_SAMPLE_RATE, Channels::Mono)
            .map_err(|e| CodecError::OpusError(format!("Failed to create decoder: {:?}", e)))?;
        Ok(Self { decoder })
    }

    /// Decode one packet; the frame length comes from the packet itself
    pub fn decode(&mut self, encoded: &[u8]) -> Result<Vec<f32>, CodecError> {
        let mut samples = vec![0f32; MAX_FRAME_SAMPLES];
        let decoded_len = self
            .decoder
            .decode_float(encoded, &mut samples, false)
            .map_err(|e| CodecError::OpusError(format!("Decode failed: {:?}", e)))?;

        samples.truncate(decoded_len);
        Ok(samples)
    }
}
