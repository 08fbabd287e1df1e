//! Agent audio playback: writer side and controller handle
//!
//! `AudioPlayback` lives in the network context and turns decoded chunks
//! into queued frames. `PlaybackHandle` is the cloneable controller-side
//! view used for offset queries and interrupts; both talk to the
//! `Renderer` only through the lock-free queue and the request channel.

use crossbeam_channel::{bounded, Sender};
use dashmap::DashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::audio::buffer::{create_shared_queue, FrameAssembler, SharedPlaybackQueue, TrackId};
use crate::audio::render::{
    OffsetRecord, PlaybackEvent, RenderRequest, RenderShared, Renderer, RequestKind,
};
use crate::audio::MuteFlags;
use crate::config::AudioConfig;
use crate::constants::{DEFAULT_TRACK_ID, NO_INTERRUPT_TRACK_ID, RENDER_REQUEST_CAPACITY};
use crate::error::AudioError;
use crate::recording::RecordingTap;

/// Build a connected playback writer, renderer and event stream
pub fn playback_channel(
    config: &AudioConfig,
    query_timeout: Duration,
    flags: Arc<MuteFlags>,
    tap: Option<RecordingTap>,
) -> (AudioPlayback, Renderer, mpsc::UnboundedReceiver<PlaybackEvent>) {
    let queue = create_shared_queue(config.queue_capacity());
    let (request_tx, request_rx) = bounded(RENDER_REQUEST_CAPACITY);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(RenderShared::default());

    let renderer = Renderer::new(
        queue.clone(),
        request_rx,
        event_tx,
        shared.clone(),
        flags,
        tap,
        config.render_block_size,
    );

    let handle = PlaybackHandle {
        requests: request_tx,
        shared,
        interrupted: Arc::new(DashSet::new()),
        queue: queue.clone(),
        sample_rate: config.sample_rate,
        timeout: query_timeout,
    };

    let playback = AudioPlayback {
        assembler: FrameAssembler::new(config.render_block_size, queue),
        handle,
        chunks_discarded: 0,
    };

    (playback, renderer, event_rx)
}

/// Writer side of the playback path
pub struct AudioPlayback {
    assembler: FrameAssembler,
    handle: PlaybackHandle,
    chunks_discarded: u64,
}

impl AudioPlayback {
    /// Queue a decoded agent chunk
    ///
    /// Chunks for interrupted tracks are dropped silently. Returns whether
    /// the chunk was accepted.
    pub fn add_chunk(&mut self, track_id: Option<&str>, samples: &[i16]) -> bool {
        let track: TrackId = Arc::from(track_id.unwrap_or(DEFAULT_TRACK_ID));
        if self.handle.is_interrupted(&track) {
            self.chunks_discarded += 1;
            tracing::debug!("Discarding chunk for interrupted track {}", track);
            return false;
        }
        self.assembler.write(samples, Some(track));
        true
    }

    /// Push any partial frame to the queue
    pub fn flush(&mut self) -> bool {
        self.assembler.flush()
    }

    /// Drop unqueued samples belonging to an interrupted track
    pub fn discard_pending(&mut self, track_id: &str) -> usize {
        self.assembler.discard_pending(track_id)
    }

    pub fn handle(&self) -> PlaybackHandle {
        self.handle.clone()
    }

    /// Chunks dropped because their track was interrupted
    pub fn chunks_discarded(&self) -> u64 {
        self.chunks_discarded
    }
}

/// Controller-side view of the renderer
#[derive(Clone)]
pub struct PlaybackHandle {
    requests: Sender<RenderRequest>,
    shared: Arc<RenderShared>,
    interrupted: Arc<DashSet<TrackId>>,
    queue: SharedPlaybackQueue,
    sample_rate: u32,
    timeout: Duration,
}

impl PlaybackHandle {
    /// Current track and how much of it has been heard
    ///
    /// `Ok(None)` when nothing has played yet.
    pub async fn query_offset(&self) -> Result<Option<OffsetRecord>, AudioError> {
        self.request(RequestKind::Offset).await
    }

    /// Stop the current track and report how much of it was heard
    ///
    /// Later chunks for the same track are discarded, except for the
    /// reserved non-interruptible track.
    pub async fn interrupt(&self) -> Result<Option<OffsetRecord>, AudioError> {
        let record = self.request(RequestKind::Interrupt).await?;
        if let Some(record) = &record {
            if record.track_id.as_ref() != NO_INTERRUPT_TRACK_ID {
                self.interrupted.insert(record.track_id.clone());
            }
            tracing::info!(
                "Interrupted track {} at {} samples ({:.3}s)",
                record.track_id,
                record.sample_offset,
                record.wall_clock_secs
            );
        }
        Ok(record)
    }

    pub fn is_interrupted(&self, track_id: &str) -> bool {
        track_id != NO_INTERRUPT_TRACK_ID && self.interrupted.contains(track_id)
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Relaxed)
    }

    /// Whether any frame has ever been rendered
    pub fn has_started(&self) -> bool {
        self.shared.started.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            queued_frames: self.queue.len(),
            queue_overflow: self.queue.overflow_count(),
            frames_rendered: self.shared.frames_rendered.load(Ordering::Relaxed),
            frames_discarded: self.shared.frames_discarded.load(Ordering::Relaxed),
            samples_rendered: self.shared.samples_rendered.load(Ordering::Relaxed),
        }
    }

    async fn request(&self, kind: RequestKind) -> Result<Option<OffsetRecord>, AudioError> {
        if !self.has_started() {
            tracing::debug!("{:?} query before playback started", kind);
            return Ok(None);
        }

        let id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .try_send(RenderRequest {
                id,
                kind,
                reply: reply_tx,
            })
            .map_err(|_| AudioError::RendererUnresponsive(id))?;

        let reply = tokio::time::timeout(self.timeout, reply_rx)
            .await
            .map_err(|_| AudioError::RendererUnresponsive(id))?
            .map_err(|_| AudioError::RendererUnresponsive(id))?;

        if reply.request_id != id {
            tracing::warn!("Renderer answered {} for request {}", reply.request_id, id);
            return Err(AudioError::RendererUnresponsive(id));
        }

        let record = reply.position.map(|(track_id, sample_offset)| OffsetRecord {
            request_id: id,
            track_id,
            sample_offset,
            wall_clock_secs: sample_offset as f64 / self.sample_rate as f64,
        });
        tracing::debug!("{:?} {} answered: {:?}", kind, id, record);
        Ok(record)
    }
}

/// Playback counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStats {
    pub queued_frames: usize,
    pub queue_overflow: usize,
    pub frames_rendered: u64,
    pub frames_discarded: u64,
    pub samples_rendered: u64,
}
