//! Session controller and its network driver task
//!
//! `Session` is the caller-facing object. Once started, a spawned driver
//! task owns the transport link, the playback writer, the device streams
//! and the recorders, and multiplexes inbound frames, capture blocks,
//! playback events, caller commands and the speak-stop timer.

use chrono::Utc;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::state::{SessionState, StateCell};
use super::{SessionEvent, Speaker, TranscriptEntry};
use crate::audio::{
    playback_channel, AudioBlock, AudioIo, AudioPlayback, CapturePipeline, CaptureStats,
    DeviceStreams, MuteFlags, OffsetRecord, PlaybackEvent, PlaybackHandle, PlaybackStats,
};
use crate::codec::WireCodec;
use crate::config::ClientConfig;
use crate::constants::{CAPTURE_CHANNEL_CAPACITY, DEVICE_POLL_INTERVAL_MS};
use crate::error::{AudioError, NetworkError, Result, SessionError};
use crate::network::{TransportEvent, TransportLink};
use crate::protocol::{AudioChunk, InboundMessage, OutboundMessage};
use crate::recording::{RecordingSet, Recordings};

enum Command {
    Interrupt(oneshot::Sender<std::result::Result<Option<OffsetRecord>, AudioError>>),
    SendText(String, oneshot::Sender<std::result::Result<(), NetworkError>>),
    Stop(Option<oneshot::Sender<()>>),
}

/// State readable from the caller while the driver runs
#[derive(Default)]
struct SessionShared {
    connected: AtomicBool,
    capture_unavailable: AtomicBool,
    conversation_id: Mutex<Option<String>>,
    transcript: Mutex<Vec<TranscriptEntry>>,
    recordings: Mutex<Option<Recordings>>,
}

/// One duplex voice conversation
pub struct Session {
    config: ClientConfig,
    state: Arc<StateCell>,
    flags: Arc<MuteFlags>,
    shared: Arc<SessionShared>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    playback: Option<PlaybackHandle>,
    capture_stats: Option<Arc<CaptureStats>>,
}

impl Session {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: Arc::new(StateCell::new()),
            flags: Arc::new(MuteFlags::default()),
            shared: Arc::new(SessionShared::default()),
            commands: None,
            playback: None,
            capture_stats: None,
        }
    }

    /// Open the devices, then the transport, and start the driver
    ///
    /// Devices come first so a missing microphone fails the start before
    /// any network traffic. The returned channel carries session events
    /// until `SessionEvent::Closed`.
    pub async fn start<F, A>(
        &mut self,
        connect: F,
        io: &mut A,
    ) -> Result<mpsc::UnboundedReceiver<SessionEvent>>
    where
        F: Future<Output = std::result::Result<TransportLink, NetworkError>>,
        A: AudioIo + ?Sized,
    {
        self.state.transition(SessionState::Connecting)?;
        let audio = self.config.audio.clone();

        let mut recordings = None;
        let mut tap = None;
        if self.config.recording.enabled {
            match RecordingSet::start(audio.sample_rate) {
                Ok((set, recording_tap)) => {
                    recordings = Some(set);
                    tap = Some(recording_tap);
                }
                Err(e) => {
                    self.fail_start();
                    return Err(e.into());
                }
            }
        }

        let (capture_tx, capture_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let capture = CapturePipeline::new(
            audio.capture_block_size,
            self.flags.clone(),
            capture_tx,
            tap.clone(),
        );
        let capture_stats = capture.stats();
        let (playback, renderer, playback_events) = playback_channel(
            &audio,
            Duration::from_millis(self.config.transport.query_timeout_ms),
            self.flags.clone(),
            tap,
        );

        let streams = match io.open(&audio, capture, renderer) {
            Ok(streams) => streams,
            Err(e) => {
                if matches!(e, AudioError::CaptureUnavailable(_)) {
                    tracing::error!("Microphone unavailable: {}", e);
                    self.shared.capture_unavailable.store(true, Ordering::SeqCst);
                }
                self.fail_start();
                return Err(e.into());
            }
        };

        let link = match connect.await {
            Ok(link) => link,
            Err(e) => {
                tracing::error!("Failed to connect: {}", e);
                drop(streams);
                self.fail_start();
                return Err(e.into());
            }
        };

        self.state.transition(SessionState::Active)?;
        self.shared.connected.store(true, Ordering::SeqCst);

        let handle = playback.handle();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            state: self.state.clone(),
            shared: self.shared.clone(),
            flags: self.flags.clone(),
            commands: command_rx,
            events: event_tx,
            outbound: Some(link.outbound),
            inbound: link.inbound,
            capture: capture_rx,
            playback,
            handle: handle.clone(),
            playback_events,
            codec: WireCodec::new(),
            streams,
            recordings,
            speak_stop_delay: Duration::from_millis(self.config.transport.speak_stop_delay_ms),
            speak_stop_at: None,
        };
        tokio::spawn(driver.run());

        self.commands = Some(command_tx);
        self.playback = Some(handle);
        self.capture_stats = Some(capture_stats);
        Ok(event_rx)
    }

    /// Tear the session down; returns once it is Closed
    ///
    /// Safe to call more than once and from any state.
    pub async fn stop(&self) {
        match self.state.get() {
            SessionState::Idle => {
                let _ = self.state.transition(SessionState::Closed);
                return;
            }
            SessionState::Closed => return,
            _ => {}
        }

        let Some(commands) = &self.commands else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if commands.send(Command::Stop(Some(done_tx))).is_ok() {
            // A dropped sender means the driver already finished
            let _ = done_rx.await;
        }
    }

    /// Cut off agent playback and report how much of the track was heard
    pub async fn interrupt(&self) -> Result<Option<OffsetRecord>> {
        self.state.require(SessionState::Active)?;
        let commands = self.commands.as_ref().ok_or(SessionError::DriverGone)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(Command::Interrupt(reply_tx))
            .map_err(|_| SessionError::DriverGone)?;
        let result = reply_rx.await.map_err(|_| SessionError::DriverGone)?;
        Ok(result?)
    }

    /// Current track and its rendered offset; `None` before anything played
    pub async fn query_offset(&self) -> Result<Option<OffsetRecord>> {
        self.state.require(SessionState::Active)?;
        let handle = self.playback.as_ref().ok_or(SessionError::DriverGone)?;
        Ok(handle.query_offset().await?)
    }

    /// Send typed text to the agent
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.state.require(SessionState::Active)?;
        let commands = self.commands.as_ref().ok_or(SessionError::DriverGone)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(Command::SendText(text.into(), reply_tx))
            .map_err(|_| SessionError::DriverGone)?;
        let result = reply_rx.await.map_err(|_| SessionError::DriverGone)?;
        Ok(result?)
    }

    pub fn set_mic_muted(&self, muted: bool) -> Result<()> {
        self.state.require(SessionState::Active)?;
        self.flags.set_mic_muted(muted);
        tracing::info!("Mic {}", if muted { "muted" } else { "unmuted" });
        Ok(())
    }

    /// Returns the new mute state
    pub fn toggle_mic_mute(&self) -> Result<bool> {
        self.state.require(SessionState::Active)?;
        let muted = self.flags.toggle_mic();
        tracing::info!("Mic {}", if muted { "muted" } else { "unmuted" });
        Ok(muted)
    }

    pub fn set_playback_muted(&self, muted: bool) -> Result<()> {
        self.state.require(SessionState::Active)?;
        self.flags.set_playback_muted(muted);
        tracing::info!("Playback {}", if muted { "muted" } else { "unmuted" });
        Ok(())
    }

    /// Returns the new mute state
    pub fn toggle_playback_mute(&self) -> Result<bool> {
        self.state.require(SessionState::Active)?;
        let muted = self.flags.toggle_playback();
        tracing::info!("Playback {}", if muted { "muted" } else { "unmuted" });
        Ok(muted)
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.as_ref().is_some_and(PlaybackHandle::is_playing)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// True when the start failed because the microphone could not be opened
    pub fn capture_unavailable(&self) -> bool {
        self.shared.capture_unavailable.load(Ordering::SeqCst)
    }

    pub fn mic_muted(&self) -> bool {
        self.flags.mic_muted()
    }

    pub fn playback_muted(&self) -> bool {
        self.flags.playback_muted()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.shared.conversation_id.lock().clone()
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.shared.transcript.lock().clone()
    }

    /// Finalized recordings, available once the session has closed
    pub fn recordings(&self) -> Option<Recordings> {
        self.shared.recordings.lock().clone()
    }

    pub fn playback_stats(&self) -> Option<PlaybackStats> {
        self.playback.as_ref().map(PlaybackHandle::stats)
    }

    /// Microphone block counters: captured, sent, muted, dropped
    pub fn capture_stats(&self) -> Option<Arc<CaptureStats>> {
        self.capture_stats.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn fail_start(&self) {
        if let Err(e) = self.state.transition(SessionState::Closed) {
            tracing::warn!("{}", e);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::Stop(None));
        }
    }
}

/// Owns everything a running session touches outside the audio callbacks
struct Driver {
    state: Arc<StateCell>,
    shared: Arc<SessionShared>,
    flags: Arc<MuteFlags>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// `None` once the link is gone
    outbound: Option<mpsc::Sender<OutboundMessage>>,
    inbound: mpsc::Receiver<TransportEvent>,
    capture: mpsc::Receiver<AudioBlock>,
    playback: AudioPlayback,
    handle: PlaybackHandle,
    playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    codec: WireCodec,
    streams: DeviceStreams,
    recordings: Option<RecordingSet>,
    speak_stop_delay: Duration,
    speak_stop_at: Option<Instant>,
}

impl Driver {
    async fn run(mut self) {
        let mut device_poll =
            tokio::time::interval(Duration::from_millis(DEVICE_POLL_INTERVAL_MS));
        device_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let (reason, done) = loop {
            let speak_stop_at = self.speak_stop_at;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Interrupt(reply)) => {
                        let result = self.interrupt().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::SendText(text, reply)) => {
                        let result = self.send(OutboundMessage::Text { text }).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Stop(done)) => break (Some("stopped by client".to_string()), done),
                    None => break (Some("session dropped".to_string()), None),
                },
                event = self.inbound.recv() => match event {
                    Some(TransportEvent::Message(message)) => self.dispatch(message).await,
                    Some(TransportEvent::Malformed(e)) => {
                        tracing::warn!("Dropping malformed frame: {}", e);
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        tracing::info!("Transport closed by remote: {:?}", reason);
                        self.outbound = None;
                        let reason = reason.unwrap_or_else(|| NetworkError::TransportClosed.to_string());
                        break (Some(reason), None);
                    }
                    None => {
                        self.outbound = None;
                        break (Some(NetworkError::TransportClosed.to_string()), None);
                    }
                },
                Some(block) = self.capture.recv() => self.send_block(block).await,
                Some(event) = self.playback_events.recv() => self.on_playback_event(event),
                _ = tokio::time::sleep_until(speak_stop_at.unwrap_or_else(Instant::now)), if speak_stop_at.is_some() => {
                    self.speak_stop().await;
                }
                _ = device_poll.tick() => {
                    if let Some(reason) = self.check_devices() {
                        break (Some(reason), None);
                    }
                }
            }
        };

        self.teardown(reason, done).await;
    }

    async fn dispatch(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Audio(chunk) => self.on_audio(chunk),
            InboundMessage::User(content) => self.on_transcript(Speaker::User, content.text),
            InboundMessage::Ai(content) => self.on_transcript(Speaker::Agent, content.text),
            InboundMessage::UserSpeaking(status) => {
                let speaking = status.is_speaking();
                self.emit(SessionEvent::UserSpeaking(speaking));
                if speaking {
                    let _ = self.interrupt().await;
                }
            }
            InboundMessage::ConversationStart(start) => {
                tracing::info!("Conversation started: {}", start.conversation_id);
                *self.shared.conversation_id.lock() = Some(start.conversation_id.clone());
                self.emit(SessionEvent::ConversationStarted(start.conversation_id));
            }
            InboundMessage::Pause(_) => {
                let _ = self.interrupt().await;
            }
        }
    }

    /// Drain stream errors; returns a close reason when a device is gone
    fn check_devices(&mut self) -> Option<String> {
        while let Some(err) = self.streams.check_errors() {
            self.emit(SessionEvent::DeviceError(err.to_string()));
            match err {
                AudioError::DeviceLost(_) => {
                    tracing::error!("{}", err);
                    return Some(err.to_string());
                }
                other => tracing::warn!("Audio stream error: {}", other),
            }
        }
        None
    }

    fn on_audio(&mut self, chunk: AudioChunk) {
        match self.codec.decode_payload(&chunk.data) {
            Ok(samples) => {
                if self.playback.add_chunk(chunk.track_id.as_deref(), &samples) {
                    self.speak_stop_at = Some(Instant::now() + self.speak_stop_delay);
                }
            }
            Err(e) => tracing::warn!("Dropping malformed audio chunk: {}", e),
        }
    }

    fn on_transcript(&mut self, speaker: Speaker, text: String) {
        let entry = TranscriptEntry {
            speaker,
            text,
            at: Utc::now(),
        };
        tracing::debug!("{:?}: {}", entry.speaker, entry.text);
        self.shared.transcript.lock().push(entry.clone());
        self.emit(SessionEvent::Transcript(entry));
    }

    fn on_playback_event(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started => self.emit(SessionEvent::PlaybackStarted),
            PlaybackEvent::Stopped => self.emit(SessionEvent::PlaybackStopped),
            PlaybackEvent::Interrupted(track) => {
                tracing::debug!("Renderer dropped track {:?}", track);
            }
        }
    }

    async fn interrupt(&mut self) -> std::result::Result<Option<OffsetRecord>, AudioError> {
        let result = self.handle.interrupt().await;
        match &result {
            Ok(record) => {
                if let Some(record) = record {
                    self.playback.discard_pending(&record.track_id);
                }
                self.emit(SessionEvent::Interrupted(record.clone()));
            }
            Err(e) => tracing::warn!("Interrupt failed: {}", e),
        }

        self.speak_stop_at = None;
        if let Err(e) = self.send(OutboundMessage::ai_speak_stop()).await {
            tracing::debug!("Speak-stop mark not sent: {}", e);
        }
        result
    }

    async fn speak_stop(&mut self) {
        self.speak_stop_at = None;
        self.playback.flush();
        tracing::debug!("Agent audio idle");
        if let Err(e) = self.send(OutboundMessage::ai_speak_stop()).await {
            tracing::debug!("Speak-stop mark not sent: {}", e);
        }
    }

    async fn send_block(&mut self, block: AudioBlock) {
        // Blocks queued before a mute are dropped too
        if self.flags.mic_muted() {
            return;
        }
        let payload = self.codec.encode_payload(block.samples());
        if let Err(e) = self.send(OutboundMessage::Media(payload)).await {
            tracing::debug!("Capture block not sent: {}", e);
        }
    }

    async fn send(&mut self, message: OutboundMessage) -> std::result::Result<(), NetworkError> {
        let Some(outbound) = &self.outbound else {
            return Err(NetworkError::TransportClosed);
        };
        if outbound.send(message).await.is_err() {
            self.outbound = None;
            return Err(NetworkError::TransportClosed);
        }
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn teardown(mut self, reason: Option<String>, done: Option<oneshot::Sender<()>>) {
        if let Err(e) = self.state.transition(SessionState::Closing) {
            tracing::warn!("{}", e);
        }

        // Frames still queued count as playing
        if self.handle.is_playing() || self.handle.stats().queued_frames > 0 {
            match self.handle.interrupt().await {
                Ok(record) => tracing::debug!("Stopped playback at {:?}", record),
                Err(e) => tracing::warn!("Interrupt on close failed: {}", e),
            }
        }
        self.speak_stop_at = None;
        if self.outbound.is_some() {
            let _ = self.send(OutboundMessage::ai_speak_stop()).await;
        }

        if let Some(mut set) = self.recordings.take() {
            match tokio::task::spawn_blocking(move || set.finalize()).await {
                Ok(Ok(Some(recordings))) => {
                    *self.shared.recordings.lock() = Some(recordings);
                }
                Ok(Ok(None)) => tracing::info!("Session ended without recorded audio"),
                Ok(Err(e)) => tracing::error!("Failed to finalize recordings: {}", e),
                Err(e) => tracing::error!("Recording finalizer failed: {}", e),
            }
        }

        let mut streams = std::mem::replace(&mut self.streams, DeviceStreams::empty());
        if let Err(e) = tokio::task::spawn_blocking(move || streams.stop()).await {
            tracing::warn!("Failed to stop devices: {}", e);
        }

        // Dropping the sender closes the socket
        self.outbound = None;
        self.shared.connected.store(false, Ordering::SeqCst);

        let stats = self.codec.stats();
        tracing::info!(
            "Session closed ({:?}): {} blocks sent, {} chunks received, {} malformed",
            reason,
            stats.frames_encoded,
            stats.frames_decoded,
            stats.malformed
        );

        if let Err(e) = self.state.transition(SessionState::Closed) {
            tracing::warn!("{}", e);
        }
        self.emit(SessionEvent::Closed { reason });
        if let Some(done) = done {
            let _ = done.send(());
        }
    }
}
