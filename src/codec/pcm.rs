//! Linear PCM frame codec
//!
//! Samples travel as little-endian signed 16-bit integers. No resampling
//! happens here: callers must already be at the session rate.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// Bytes per encoded sample
pub const SAMPLE_WIDTH: usize = 2;

/// Quantize a float sample to int16: `round(clamp(x, -1, 1) * 32767)`
#[inline]
pub fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// Convert an int16 sample back to the float domain
#[inline]
pub fn dequantize(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Quantize a whole float buffer
pub fn quantize_slice(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| quantize(s)).collect()
}

/// Encode int16 samples to wire bytes
pub fn encode(pcm: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(pcm.len() * SAMPLE_WIDTH);
    for &sample in pcm {
        buf.put_i16_le(sample);
    }
    buf.freeze()
}

/// Decode wire bytes to int16 samples
///
/// Fails with `MalformedFrame` when the length is not a whole number of samples.
pub fn decode(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % SAMPLE_WIDTH != 0 {
        return Err(CodecError::MalformedFrame(format!(
            "{} bytes is not a multiple of the {}-byte sample width",
            bytes.len(),
            SAMPLE_WIDTH
        )));
    }

    let mut buf = bytes;
    let mut samples = Vec::with_capacity(bytes.len() / SAMPLE_WIDTH);
    while buf.has_remaining() {
        samples.push(buf.get_i16_le());
    }
    Ok(samples)
}
