//! Base64 payload transport for PCM frames

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::pcm;
use crate::error::CodecError;

/// Encodes capture blocks and decodes agent chunks, keeping counters
#[derive(Debug, Default)]
pub struct WireCodec {
    frames_encoded: u64,
    frames_decoded: u64,
    malformed: u64,
    samples_decoded: u64,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode int16 samples as a base64 payload
    pub fn encode_payload(&mut self, samples: &[i16]) -> String {
        self.frames_encoded += 1;
        STANDARD.encode(pcm::encode(samples))
    }

    /// Decode a base64 payload into int16 samples
    pub fn decode_payload(&mut self, payload: &str) -> Result<Vec<i16>, CodecError> {
        let result = STANDARD
            .decode(payload.trim())
            .map_err(|e| CodecError::MalformedFrame(format!("invalid base64: {}", e)))
            .and_then(|bytes| pcm::decode(&bytes));

        match &result {
            Ok(samples) => {
                self.frames_decoded += 1;
                self.samples_decoded += samples.len() as u64;
            }
            Err(_) => self.malformed += 1,
        }
        result
    }

    pub fn stats(&self) -> WireStats {
        WireStats {
            frames_encoded: self.frames_encoded,
            frames_decoded: self.frames_decoded,
            malformed: self.malformed,
            samples_decoded: self.samples_decoded,
        }
    }
}

/// Codec counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireStats {
    pub frames_encoded: u64,
    pub frames_decoded: u64,
    pub malformed: u64,
    pub samples_decoded: u64,
}
