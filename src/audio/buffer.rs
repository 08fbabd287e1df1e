//! Audio blocks, playback frames and the lock-free playback queue
//!
//! The playback queue is the only structure shared between the network
//! context (writer) and the real-time renderer (reader). It is a bounded
//! `ArrayQueue`; when full, the oldest frame is evicted so the renderer
//! never waits and memory stays bounded.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::codec::dequantize;

/// Opaque agent track identifier
pub type TrackId = Arc<str>;

/// Fixed-length run of int16 samples, optionally tagged with a track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlock {
    samples: Arc<[i16]>,
    track_id: Option<TrackId>,
}

impl AudioBlock {
    pub fn new(samples: impl Into<Arc<[i16]>>, track_id: Option<TrackId>) -> Self {
        Self {
            samples: samples.into(),
            track_id,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn track_id(&self) -> Option<&TrackId> {
        self.track_id.as_ref()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// One output-sized frame waiting in the playback queue
///
/// A frame holds samples from a single track. The last frame of an
/// utterance may be shorter than the render block.
#[derive(Debug, Clone)]
pub struct PlaybackFrame {
    pub samples: Box<[f32]>,
    pub track_id: Option<TrackId>,
}

impl PlaybackFrame {
    pub fn new(samples: Vec<f32>, track_id: Option<TrackId>) -> Self {
        Self {
            samples: samples.into_boxed_slice(),
            track_id,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Bounded FIFO of playback frames
pub struct PlaybackQueue {
    queue: ArrayQueue<PlaybackFrame>,
    overflow_count: AtomicUsize,
}

impl PlaybackQueue {
    /// Create a new queue holding at most `capacity` frames
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Append a frame, evicting the oldest one if the queue is full
    ///
    /// Returns the evicted frame, if any.
    pub fn push(&self, frame: PlaybackFrame) -> Option<PlaybackFrame> {
        let evicted = self.queue.force_push(frame);
        if evicted.is_some() {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Take the oldest frame
    pub fn pop(&self) -> Option<PlaybackFrame> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Frames evicted because the queue was full
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a playback queue
pub type SharedPlaybackQueue = Arc<PlaybackQueue>;

/// Create a new shared playback queue
pub fn create_shared_queue(capacity: usize) -> SharedPlaybackQueue {
    Arc::new(PlaybackQueue::new(capacity))
}

/// Write cursor that slices decoded chunks into playback frames
///
/// Owned by the single writer (the network context).
pub struct FrameAssembler {
    frame_size: usize,
    write: Vec<f32>,
    track_id: Option<TrackId>,
    queue: SharedPlaybackQueue,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, queue: SharedPlaybackQueue) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            write: Vec::with_capacity(frame_size),
            track_id: None,
            queue,
        }
    }

    /// Append decoded samples for a track, enqueueing every completed frame
    ///
    /// A change of track first flushes the partial frame so frames never
    /// mix tracks. Returns the number of frames enqueued.
    pub fn write(&mut self, samples: &[i16], track_id: Option<TrackId>) -> usize {
        let mut enqueued = 0;
        if self.track_id != track_id {
            if self.flush() {
                enqueued += 1;
            }
            self.track_id = track_id;
        }

        for &sample in samples {
            self.write.push(dequantize(sample));
            if self.write.len() == self.frame_size {
                self.enqueue();
                enqueued += 1;
            }
        }
        enqueued
    }

    /// Enqueue the partial frame, if any. Returns whether a frame was pushed.
    pub fn flush(&mut self) -> bool {
        if self.write.is_empty() {
            return false;
        }
        self.enqueue();
        true
    }

    /// Drop pending samples if they belong to `track_id`
    pub fn discard_pending(&mut self, track_id: &str) -> usize {
        match &self.track_id {
            Some(current) if current.as_ref() == track_id => {
                let dropped = self.write.len();
                self.write.clear();
                dropped
            }
            _ => 0,
        }
    }

    /// Samples waiting for a full frame
    pub fn pending(&self) -> usize {
        self.write.len()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn enqueue(&mut self) {
        let samples = std::mem::replace(&mut self.write, Vec::with_capacity(self.frame_size));
        let frame = PlaybackFrame::new(samples, self.track_id.clone());
        if self.queue.push(frame).is_some() {
            tracing::warn!(
                "Playback queue full, dropped oldest frame ({} total)",
                self.queue.overflow_count()
            );
        }
    }
}

/// Regroups device-sized capture callbacks into fixed-size blocks
pub struct BlockAccumulator {
    block_size: usize,
    pending: Vec<i16>,
}

impl BlockAccumulator {
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size),
        }
    }

    /// Append samples, calling `emit` once per completed block
    pub fn push(&mut self, samples: impl IntoIterator<Item = i16>, mut emit: impl FnMut(AudioBlock)) {
        for sample in samples {
            self.pending.push(sample);
            if self.pending.len() == self.block_size {
                let block = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_size));
                emit(AudioBlock::new(block, None));
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}
