//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod engine;
pub mod playback;
pub mod render;

pub use buffer::{AudioBlock, PlaybackFrame, PlaybackQueue, TrackId};
pub use capture::{CapturePipeline, CaptureStats};
pub use device::{list_devices, AudioDeviceInfo, Direction};
pub use engine::{AudioIo, CpalIo, DeviceStreams};
pub use playback::{playback_channel, AudioPlayback, PlaybackHandle, PlaybackStats};
pub use render::{OffsetRecord, PlaybackEvent, Renderer};

use std::sync::atomic::{AtomicBool, Ordering};

/// Mic and playback mute flags, read once per block by the audio callbacks
#[derive(Debug, Default)]
pub struct MuteFlags {
    mic: AtomicBool,
    playback: AtomicBool,
}

impl MuteFlags {
    pub fn mic_muted(&self) -> bool {
        self.mic.load(Ordering::Relaxed)
    }

    pub fn set_mic_muted(&self, muted: bool) {
        self.mic.store(muted, Ordering::Relaxed);
    }

    /// Flip the mic flag, returning the new value
    pub fn toggle_mic(&self) -> bool {
        !self.mic.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn playback_muted(&self) -> bool {
        self.playback.load(Ordering::Relaxed)
    }

    pub fn set_playback_muted(&self, muted: bool) {
        self.playback.store(muted, Ordering::Relaxed);
    }

    pub fn toggle_playback(&self) -> bool {
        !self.playback.fetch_xor(true, Ordering::Relaxed)
    }
}
