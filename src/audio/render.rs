//! Real-time playback renderer
//!
//! The renderer runs inside the output device callback. Each tick it:
//!
//! 1. answers pending offset/interrupt requests (rendezvous with the
//!    controller through a request id and a oneshot reply),
//! 2. drains frames from the playback queue in arrival order, skipping
//!    frames that belong to interrupted tracks,
//! 3. advances the per-track sample offsets by what it actually wrote,
//! 4. feeds the agent recorder with the post-gain output.
//!
//! The offset table is owned here; nothing else writes it.

use crossbeam_channel::Receiver;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::audio::buffer::{PlaybackFrame, SharedPlaybackQueue, TrackId};
use crate::audio::MuteFlags;
use crate::codec::quantize;
use crate::constants::NO_INTERRUPT_TRACK_ID;
use crate::recording::RecordingTap;

/// Answer to an offset or interrupt query
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetRecord {
    pub request_id: Uuid,
    pub track_id: TrackId,
    /// Samples of this track rendered so far
    pub sample_offset: u64,
    /// `sample_offset / sample_rate`
    pub wall_clock_secs: f64,
}

/// Kind of rendezvous request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Offset,
    Interrupt,
}

/// Request posted to the renderer
pub struct RenderRequest {
    pub id: Uuid,
    pub kind: RequestKind,
    pub reply: oneshot::Sender<RenderReply>,
}

/// Renderer answer, echoing the request id
#[derive(Debug, Clone)]
pub struct RenderReply {
    pub request_id: Uuid,
    /// `None` when no track has rendered yet
    pub position: Option<(TrackId, u64)>,
}

/// Playback lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started,
    Stopped,
    Interrupted(Option<TrackId>),
}

/// State the renderer publishes for other contexts
#[derive(Debug, Default)]
pub struct RenderShared {
    pub playing: AtomicBool,
    pub started: AtomicBool,
    pub frames_rendered: AtomicU64,
    pub frames_discarded: AtomicU64,
    pub samples_rendered: AtomicU64,
}

/// Playback renderer, owned by the output callback
pub struct Renderer {
    queue: SharedPlaybackQueue,
    requests: Receiver<RenderRequest>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    shared: Arc<RenderShared>,
    flags: Arc<MuteFlags>,
    tap: Option<RecordingTap>,

    offsets: HashMap<TrackId, u64>,
    interrupted: HashSet<TrackId>,
    current: Option<PlaybackFrame>,
    cursor: usize,
    current_track: Option<TrackId>,

    mono: Vec<f32>,
    tap_buffer: Vec<i16>,
}

impl Renderer {
    pub(crate) fn new(
        queue: SharedPlaybackQueue,
        requests: Receiver<RenderRequest>,
        events: mpsc::UnboundedSender<PlaybackEvent>,
        shared: Arc<RenderShared>,
        flags: Arc<MuteFlags>,
        tap: Option<RecordingTap>,
        block_size: usize,
    ) -> Self {
        Self {
            queue,
            requests,
            events,
            shared,
            flags,
            tap,
            offsets: HashMap::new(),
            interrupted: HashSet::new(),
            current: None,
            cursor: 0,
            current_track: None,
            mono: Vec::with_capacity(block_size),
            tap_buffer: Vec::with_capacity(block_size),
        }
    }

    /// Render one tick of mono samples into `out`
    pub fn render(&mut self, out: &mut [f32]) {
        self.service_requests();

        let gain = if self.flags.playback_muted() { 0.0 } else { 1.0 };
        let mut written = 0;

        while written < out.len() {
            if self.current.is_none() {
                match self.next_frame() {
                    Some(frame) => {
                        self.current = Some(frame);
                        self.cursor = 0;
                    }
                    None => break,
                }
            }
            let Some(frame) = self.current.as_ref() else {
                break;
            };

            let n = (out.len() - written).min(frame.len() - self.cursor);
            for (dst, &src) in out[written..written + n]
                .iter_mut()
                .zip(&frame.samples[self.cursor..self.cursor + n])
            {
                *dst = src * gain;
            }

            if let Some(track) = &frame.track_id {
                *self.offsets.entry(track.clone()).or_insert(0) += n as u64;
                if self.current_track.as_ref() != Some(track) {
                    self.current_track = Some(track.clone());
                }
            }

            self.cursor += n;
            written += n;
            if self.cursor >= frame.len() {
                self.current = None;
                self.shared.frames_rendered.fetch_add(1, Ordering::Relaxed);
            }
        }

        out[written..].fill(0.0);
        self.shared
            .samples_rendered
            .fetch_add(written as u64, Ordering::Relaxed);

        if written > 0 {
            if !self.shared.playing.swap(true, Ordering::Relaxed) {
                self.shared.started.store(true, Ordering::Relaxed);
                let _ = self.events.send(PlaybackEvent::Started);
            }
        } else if self.shared.playing.swap(false, Ordering::Relaxed) {
            let _ = self.events.send(PlaybackEvent::Stopped);
        }

        if let Some(tap) = &self.tap {
            self.tap_buffer.clear();
            self.tap_buffer.extend(out.iter().map(|&s| quantize(s)));
            tap.agent(&self.tap_buffer);
        }
    }

    /// Render into an interleaved device buffer, duplicating mono to every channel
    pub fn render_interleaved(&mut self, data: &mut [f32], channels: u16) {
        let channels = channels.max(1) as usize;
        let frames = data.len() / channels;

        let mut mono = std::mem::take(&mut self.mono);
        mono.resize(frames, 0.0);
        self.render(&mut mono);

        for (slot, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
            slot.fill(sample);
        }
        self.mono = mono;
    }

    /// Requests waiting for the next tick
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Frames waiting in the playback queue
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    /// Rendered samples for a track
    pub fn offset(&self, track_id: &str) -> u64 {
        self.offsets.get(track_id).copied().unwrap_or(0)
    }

    fn next_frame(&mut self) -> Option<PlaybackFrame> {
        loop {
            let frame = self.queue.pop()?;
            let discard = frame
                .track_id
                .as_ref()
                .is_some_and(|track| self.interrupted.contains(track));
            if !discard {
                return Some(frame);
            }
            self.shared.frames_discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn service_requests(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            let position = self
                .current_track
                .as_ref()
                .map(|track| (track.clone(), self.offset(track)));

            let _ = request.reply.send(RenderReply {
                request_id: request.id,
                position,
            });

            if request.kind == RequestKind::Interrupt {
                self.interrupt_current();
            }
        }
    }

    fn interrupt_current(&mut self) {
        let track = self.current_track.clone();
        if let Some(track) = &track {
            if track.as_ref() != NO_INTERRUPT_TRACK_ID {
                self.interrupted.insert(track.clone());
                let drop_current = self
                    .current
                    .as_ref()
                    .and_then(|frame| frame.track_id.as_ref())
                    .is_some_and(|t| t == track);
                if drop_current {
                    self.current = None;
                    self.shared.frames_discarded.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let _ = self.events.send(PlaybackEvent::Interrupted(track));
        if self.shared.playing.swap(false, Ordering::Relaxed) {
            let _ = self.events.send(PlaybackEvent::Stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::playback_channel;
    use crate::audio::AudioPlayback;
    use crate::config::AudioConfig;
    use std::time::Duration;

    fn setup(block: usize) -> (AudioPlayback, Renderer, mpsc::UnboundedReceiver<PlaybackEvent>, Arc<MuteFlags>) {
        let config = AudioConfig {
            render_block_size: block,
            ..AudioConfig::default()
        };
        let flags = Arc::new(MuteFlags::default());
        let (playback, renderer, events) =
            playback_channel(&config, Duration::from_millis(500), flags.clone(), None);
        (playback, renderer, events, flags)
    }

    fn tick(renderer: &mut Renderer, block: usize) -> Vec<f32> {
        let mut out = vec![0.0; block];
        renderer.render(&mut out);
        out
    }

    #[test]
    fn test_offsets_advance_per_rendered_frame() {
        let (mut playback, mut renderer, _events, _) = setup(1024);
        for _ in 0..3 {
            playback.add_chunk(Some("t1"), &[1000; 1024]);
        }

        tick(&mut renderer, 1024);
        assert_eq!(renderer.offset("t1"), 1024);
        tick(&mut renderer, 1024);
        tick(&mut renderer, 1024);
        assert_eq!(renderer.offset("t1"), 3072);

        // Idle ticks do not move the offset
        tick(&mut renderer, 1024);
        assert_eq!(renderer.offset("t1"), 3072);
    }

    #[test]
    fn test_tracks_render_in_arrival_order() {
        let (mut playback, mut renderer, _events, _) = setup(4);
        playback.add_chunk(Some("a"), &[16384; 4]);
        playback.add_chunk(Some("b"), &[-16384; 4]);
        playback.add_chunk(Some("a"), &[16384; 4]);

        assert_eq!(tick(&mut renderer, 4), vec![0.5; 4]);
        assert_eq!(tick(&mut renderer, 4), vec![-0.5; 4]);
        assert_eq!(tick(&mut renderer, 4), vec![0.5; 4]);
        assert_eq!(renderer.offset("a"), 8);
        assert_eq!(renderer.offset("b"), 4);
    }

    #[test]
    fn test_partial_frame_is_zero_padded_and_counts_real_samples() {
        let (mut playback, mut renderer, _events, _) = setup(8);
        playback.add_chunk(Some("t"), &[16384; 5]);
        playback.flush();

        let out = tick(&mut renderer, 8);
        assert_eq!(&out[..5], &[0.5; 5]);
        assert_eq!(&out[5..], &[0.0; 3]);
        assert_eq!(renderer.offset("t"), 5);
    }

    #[test]
    fn test_playback_mute_silences_but_still_counts() {
        let (mut playback, mut renderer, _events, flags) = setup(4);
        flags.set_playback_muted(true);
        playback.add_chunk(Some("t"), &[16384; 4]);

        assert_eq!(tick(&mut renderer, 4), vec![0.0; 4]);
        assert_eq!(renderer.offset("t"), 4);
    }

    #[test]
    fn test_started_and_stopped_events() {
        let (mut playback, mut renderer, mut events, _) = setup(4);

        tick(&mut renderer, 4);
        assert!(events.try_recv().is_err());

        playback.add_chunk(Some("t"), &[1; 4]);
        tick(&mut renderer, 4);
        assert_eq!(events.try_recv().unwrap(), PlaybackEvent::Started);
        tick(&mut renderer, 4);
        assert_eq!(events.try_recv().unwrap(), PlaybackEvent::Stopped);
        assert!(playback.handle().has_started());
        assert!(!playback.handle().is_playing());
    }

    #[test]
    fn test_interleaved_duplicates_channels() {
        let (mut playback, mut renderer, _events, _) = setup(2);
        playback.add_chunk(Some("t"), &[16384, -16384]);

        let mut data = vec![9.0; 4];
        renderer.render_interleaved(&mut data, 2);
        assert_eq!(data, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[tokio::test]
    async fn test_query_before_playback_is_empty() {
        let (playback, _renderer, _events, _) = setup(4);
        let result = playback.handle().query_offset().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_interrupt_reports_heard_samples_and_discards_rest() {
        let (mut playback, mut renderer, mut events, _) = setup(1024);
        for _ in 0..3 {
            playback.add_chunk(Some("t1"), &[1000; 1024]);
        }
        tick(&mut renderer, 1024);
        tick(&mut renderer, 1024);

        let handle = playback.handle();
        let pending = tokio::spawn(async move { handle.interrupt().await });
        while renderer.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        let out = tick(&mut renderer, 1024);

        let record = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(record.track_id.as_ref(), "t1");
        assert_eq!(record.sample_offset, 2048);
        assert!((record.wall_clock_secs - 2048.0 / 44100.0).abs() < 1e-9);

        // Third queued frame was dropped, not rendered
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(renderer.offset("t1"), 2048);

        // A late chunk for the same track never reaches the queue
        playback.add_chunk(Some("t1"), &[1000; 1024]);
        tick(&mut renderer, 1024);
        assert_eq!(renderer.offset("t1"), 2048);

        let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(seen.contains(&PlaybackEvent::Interrupted(Some(Arc::from("t1")))));
        assert!(seen.contains(&PlaybackEvent::Stopped));
    }

    #[tokio::test]
    async fn test_offset_queries_are_monotonic() {
        let (mut playback, mut renderer, _events, _) = setup(256);
        let handle = playback.handle();
        let mut last = 0;

        for _ in 0..5 {
            playback.add_chunk(Some("t"), &[7; 256]);
            tick(&mut renderer, 256);

            let h = handle.clone();
            let pending = tokio::spawn(async move { h.query_offset().await });
            while renderer.pending_requests() == 0 {
                tokio::task::yield_now().await;
            }
            tick(&mut renderer, 256);

            let record = pending.await.unwrap().unwrap().unwrap();
            assert!(record.sample_offset >= last);
            last = record.sample_offset;
        }
        assert_eq!(last, 5 * 256);
    }

    #[tokio::test]
    async fn test_no_interrupt_track_survives_interrupt() {
        let (mut playback, mut renderer, _events, _) = setup(4);
        playback.add_chunk(Some(NO_INTERRUPT_TRACK_ID), &[16384; 8]);
        tick(&mut renderer, 4);

        let handle = playback.handle();
        let pending = tokio::spawn(async move { handle.interrupt().await });
        while renderer.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        let out = tick(&mut renderer, 4);
        pending.await.unwrap().unwrap();

        assert_eq!(out, vec![0.5; 4]);
        assert_eq!(renderer.offset(NO_INTERRUPT_TRACK_ID), 8);
    }

    #[tokio::test]
    async fn test_interrupt_keeps_other_tracks_queued() {
        let (mut playback, mut renderer, _events, _) = setup(4);
        playback.add_chunk(Some("old"), &[16384; 8]);
        playback.add_chunk(Some("new"), &[-16384; 4]);
        tick(&mut renderer, 4);

        let handle = playback.handle();
        let pending = tokio::spawn(async move { handle.interrupt().await });
        while renderer.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        let out = tick(&mut renderer, 4);
        let record = pending.await.unwrap().unwrap().unwrap();

        assert_eq!(record.track_id.as_ref(), "old");
        assert_eq!(record.sample_offset, 4);
        assert_eq!(out, vec![-0.5; 4]);
        assert_eq!(renderer.offset("old"), 4);
    }
}
