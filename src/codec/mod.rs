//! Frame codec: int16 PCM over a base64 transport

pub mod pcm;
pub mod wire;

pub use pcm::{decode, dequantize, encode, quantize, quantize_slice};
pub use wire::{WireCodec, WireStats};
