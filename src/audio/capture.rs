//! Microphone capture pipeline
//!
//! Runs inside the input device callback: downmixes to mono, quantizes,
//! regroups into fixed-size blocks, feeds the mic recorder, and hands
//! unmuted blocks to the network task. Device handling lives in
//! `audio::engine`; this type never touches cpal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audio::buffer::{AudioBlock, BlockAccumulator};
use crate::audio::MuteFlags;
use crate::codec::quantize;
use crate::recording::RecordingTap;

/// Capture pipeline for the session microphone
pub struct CapturePipeline {
    accumulator: BlockAccumulator,
    flags: Arc<MuteFlags>,
    outbound: mpsc::Sender<AudioBlock>,
    tap: Option<RecordingTap>,
    stats: Arc<CaptureStats>,
}

impl CapturePipeline {
    pub fn new(
        block_size: usize,
        flags: Arc<MuteFlags>,
        outbound: mpsc::Sender<AudioBlock>,
        tap: Option<RecordingTap>,
    ) -> Self {
        Self {
            accumulator: BlockAccumulator::new(block_size),
            flags,
            outbound,
            tap,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    /// Process one device callback worth of interleaved float samples
    ///
    /// Only the first channel is kept. Never blocks.
    pub fn process(&mut self, data: &[f32], channels: u16) {
        let channels = channels.max(1) as usize;
        let mono = data.iter().step_by(channels).map(|&s| quantize(s));

        let flags = &self.flags;
        let outbound = &self.outbound;
        let tap = &self.tap;
        let stats = &self.stats;

        self.accumulator.push(mono, |block| {
            stats.blocks_captured.fetch_add(1, Ordering::Relaxed);

            // The recorder sees the true input regardless of mute
            if let Some(tap) = tap {
                tap.mic(block.samples());
            }

            if flags.mic_muted() {
                stats.blocks_muted.fetch_add(1, Ordering::Relaxed);
                return;
            }

            match outbound.try_send(block) {
                Ok(()) => {
                    stats.blocks_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    stats.blocks_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }

    pub fn block_size(&self) -> usize {
        self.accumulator.block_size()
    }

    /// Shared counters, readable after the pipeline moves into a callback
    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }
}

/// Capture counters
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub blocks_captured: AtomicU64,
    pub blocks_sent: AtomicU64,
    pub blocks_muted: AtomicU64,
    pub blocks_dropped: AtomicU64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.blocks_captured.load(Ordering::Relaxed),
            self.blocks_sent.load(Ordering::Relaxed),
            self.blocks_muted.load(Ordering::Relaxed),
            self.blocks_dropped.load(Ordering::Relaxed),
        )
    }
}
