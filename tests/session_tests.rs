//! End-to-end session tests over an in-memory link and hand-driven audio

use parking_lot::Mutex;
use std::future::Future;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use voice_duplex::audio::{AudioIo, CapturePipeline, DeviceStreams, Renderer};
use voice_duplex::codec::{quantize, WireCodec};
use voice_duplex::config::{AudioConfig, ClientConfig};
use voice_duplex::error::{AudioError, NetworkError};
use voice_duplex::network::{RemoteEnd, TransportLink};
use voice_duplex::protocol::{
    AudioChunk, ConversationStart, InboundMessage, Mark, OutboundMessage, TextContent,
};
use voice_duplex::session::Speaker;
use voice_duplex::{Session, SessionEvent, SessionState};

const SAMPLE_RATE: u32 = 44100;

/// Audio "devices" the test ticks by hand
#[derive(Clone, Default)]
struct ManualIo {
    capture: Arc<Mutex<Option<CapturePipeline>>>,
    renderer: Arc<Mutex<Option<Renderer>>>,
}

impl AudioIo for ManualIo {
    fn open(
        &mut self,
        _config: &AudioConfig,
        capture: CapturePipeline,
        renderer: Renderer,
    ) -> Result<DeviceStreams, AudioError> {
        *self.capture.lock() = Some(capture);
        *self.renderer.lock() = Some(renderer);
        Ok(DeviceStreams::empty())
    }
}

impl ManualIo {
    fn tick(&self, samples: usize) -> Vec<f32> {
        let mut out = vec![0.0; samples];
        self.renderer
            .lock()
            .as_mut()
            .expect("renderer not opened")
            .render(&mut out);
        out
    }

    fn speak_into_mic(&self, data: &[f32]) {
        self.capture
            .lock()
            .as_mut()
            .expect("capture not opened")
            .process(data, 1);
    }

    fn queued(&self) -> usize {
        self.renderer.lock().as_ref().map_or(0, Renderer::queued_frames)
    }

    fn pending_requests(&self) -> usize {
        self.renderer.lock().as_ref().map_or(0, Renderer::pending_requests)
    }
}

fn test_config(render_block: usize) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.audio.sample_rate = SAMPLE_RATE;
    config.audio.render_block_size = render_block;
    config.audio.capture_block_size = 256;
    config.transport.query_timeout_ms = 500;
    config.transport.speak_stop_delay_ms = 10_000;
    config.recording.enabled = false;
    config
}

struct Harness {
    session: Session,
    io: ManualIo,
    remote: RemoteEnd,
    events: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
    block: usize,
}

async fn start(config: ClientConfig) -> Harness {
    let block = config.audio.render_block_size;
    let (link, remote) = TransportLink::in_memory(256);
    let mut io = ManualIo::default();
    let mut session = Session::new(config);

    let events = session
        .start(async { Ok::<_, NetworkError>(link) }, &mut io)
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert!(session.is_connected());

    Harness {
        session,
        io,
        remote,
        events,
        block,
    }
}

fn audio_chunk(track: &str, samples: usize, value: i16) -> InboundMessage {
    InboundMessage::Audio(AudioChunk {
        data: WireCodec::new().encode_payload(&vec![value; samples]),
        track_id: Some(track.to_string()),
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

/// Drive `fut` to completion, ticking the renderer whenever a request waits
async fn with_ticks<T>(io: &ManualIo, block: usize, fut: impl Future<Output = T>) -> T {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            _ = tokio::time::sleep(Duration::from_millis(2)) => {
                if io.pending_requests() > 0 {
                    io.tick(block);
                }
            }
        }
    }
}

impl Harness {
    /// Round-trip a transcript line so earlier frames are known to be handled
    async fn sync(&self) {
        let before = self.session.transcript().len();
        self.remote
            .send(InboundMessage::User(TextContent {
                text: "sync".into(),
            }))
            .await
            .unwrap();
        let session = &self.session;
        wait_until(|| session.transcript().len() > before).await;
    }

    async fn next_outbound(&mut self) -> OutboundMessage {
        tokio::time::timeout(Duration::from_secs(2), self.remote.received.recv())
            .await
            .expect("no outbound message")
            .expect("link closed")
    }

    async fn stop(&self) {
        with_ticks(&self.io, self.block, self.session.stop()).await;
    }
}

#[tokio::test]
async fn test_offset_after_three_chunks_is_3072() {
    let h = start(test_config(1024)).await;

    for _ in 0..3 {
        h.remote.send(audio_chunk("t1", 1024, 1000)).await.unwrap();
    }
    let io = &h.io;
    wait_until(|| io.queued() == 3).await;

    for _ in 0..3 {
        h.io.tick(1024);
    }

    let record = with_ticks(&h.io, h.block, h.session.query_offset())
        .await
        .unwrap()
        .expect("track should be active");
    assert_eq!(record.track_id.as_ref(), "t1");
    assert_eq!(record.sample_offset, 3072);
    assert!((record.wall_clock_secs - 3072.0 / SAMPLE_RATE as f64).abs() < 1e-9);

    h.stop().await;
}

#[tokio::test]
async fn test_interrupt_reports_heard_samples_and_discards_late_chunks() {
    let mut h = start(test_config(1024)).await;

    for _ in 0..3 {
        h.remote.send(audio_chunk("t1", 1024, 1000)).await.unwrap();
    }
    let io = &h.io;
    wait_until(|| io.queued() == 3).await;
    h.io.tick(1024);
    h.io.tick(1024);

    let record = with_ticks(&h.io, h.block, h.session.interrupt())
        .await
        .unwrap()
        .expect("track should be active");
    assert_eq!(record.track_id.as_ref(), "t1");
    assert_eq!(record.sample_offset, 2048);

    // The agent is told playback went idle
    assert_eq!(
        h.next_outbound().await,
        OutboundMessage::Mark {
            mark: Mark::AiSpeakStop
        }
    );

    // A fourth chunk for the same track arrives late
    h.remote.send(audio_chunk("t1", 1024, 1000)).await.unwrap();
    h.sync().await;
    assert_eq!(h.io.queued(), 0);
    assert!(h.io.tick(1024).iter().all(|&s| s == 0.0));

    let record = with_ticks(&h.io, h.block, h.session.query_offset())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.sample_offset, 2048);

    let mut interrupted = None;
    while let Ok(event) = h.events.try_recv() {
        if let SessionEvent::Interrupted(record) = event {
            interrupted = record;
        }
    }
    assert_eq!(interrupted.map(|r| r.sample_offset), Some(2048));

    h.stop().await;
}

#[tokio::test]
async fn test_queries_before_playback_are_empty() {
    let h = start(test_config(128)).await;

    assert_eq!(h.session.query_offset().await.unwrap(), None);
    assert_eq!(h.session.interrupt().await.unwrap(), None);
    assert!(!h.session.is_playing());

    h.stop().await;
}

#[tokio::test]
async fn test_mute_gates_all_capture_blocks() {
    let mut h = start(test_config(128)).await;

    h.session.set_mic_muted(true).unwrap();
    for _ in 0..20 {
        h.io.speak_into_mic(&[0.5; 256]);
    }
    assert!(h.session.toggle_mic_mute().is_ok_and(|muted| !muted));
    h.io.speak_into_mic(&[0.5; 256]);

    // The first and only thing on the wire is the unmuted block
    match h.next_outbound().await {
        OutboundMessage::Media(payload) => {
            let samples = WireCodec::new().decode_payload(&payload).unwrap();
            assert_eq!(samples, vec![quantize(0.5); 256]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(50), h.remote.received.recv())
            .await
            .is_err()
    );

    let stats = h.session.capture_stats().expect("capture counters");
    assert_eq!(stats.snapshot(), (21, 1, 20, 0));

    h.stop().await;
}

#[tokio::test]
async fn test_remote_close_tears_down_session() {
    let mut h = start(test_config(128)).await;

    h.remote.close(Some("agent hung up")).await.unwrap();

    let reason = loop {
        match h.events.recv().await {
            Some(SessionEvent::Closed { reason }) => break reason,
            Some(_) => continue,
            None => panic!("event stream ended without Closed"),
        }
    };
    assert_eq!(reason.as_deref(), Some("agent hung up"));
    assert_eq!(h.session.state(), SessionState::Closed);
    assert!(!h.session.is_connected());
    assert!(h.session.set_mic_muted(true).is_err());

    // Stop after close is a no-op
    h.session.stop().await;
    assert_eq!(h.session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_stop_closes_link_and_is_idempotent() {
    let mut h = start(test_config(128)).await;

    h.stop().await;
    h.stop().await;

    assert_eq!(h.session.state(), SessionState::Closed);
    assert!(h.session.interrupt().await.is_err());
    // Only the closing mark, then the channel closes
    assert_eq!(h.next_outbound().await, OutboundMessage::ai_speak_stop());
    assert!(h.remote.received.recv().await.is_none());
}

#[tokio::test]
async fn test_speaking_and_pause_interrupt_playback() {
    for trigger in [
        r#"{"type":"user_speaking","content":{"status":"SPEAKING"}}"#,
        r#"{"type":"pause","content":{}}"#,
        r#"{"type":"pause"}"#,
    ] {
        let mut h = start(test_config(512)).await;

        h.remote.send(audio_chunk("t1", 2048, 500)).await.unwrap();
        let io = &h.io;
        wait_until(|| io.queued() == 4).await;
        h.io.tick(512);

        h.remote.send_text(trigger).await.unwrap();
        let events = &mut h.events;
        let record = with_ticks(&h.io, h.block, async {
            loop {
                if let Some(SessionEvent::Interrupted(record)) = events.recv().await {
                    return record;
                }
            }
        })
        .await;
        assert_eq!(record.map(|r| r.sample_offset), Some(512));
        assert!(h.io.tick(512).iter().all(|&s| s == 0.0));

        h.stop().await;
    }
}

#[tokio::test]
async fn test_close_drops_frames_queued_after_idle() {
    let h = start(test_config(1024)).await;

    h.remote.send(audio_chunk("t1", 1024, 1000)).await.unwrap();
    let io = &h.io;
    wait_until(|| io.queued() == 1).await;
    h.io.tick(1024);
    h.io.tick(1024);
    assert!(!h.session.is_playing());

    // More of the same track arrives while the renderer is idle
    h.remote.send(audio_chunk("t1", 1024, 1000)).await.unwrap();
    wait_until(|| io.queued() == 1).await;
    assert!(!h.session.is_playing());

    h.stop().await;

    assert!(h.io.tick(1024).iter().all(|&s| s == 0.0));
    assert_eq!(h.session.playback_stats().unwrap().frames_discarded, 1);
}

#[tokio::test]
async fn test_no_interrupt_track_keeps_playing() {
    let h = start(test_config(1024)).await;

    h.remote
        .send(audio_chunk("no-interrupt", 2048, 1000))
        .await
        .unwrap();
    let io = &h.io;
    wait_until(|| io.queued() == 2).await;
    h.io.tick(1024);

    let record = with_ticks(&h.io, h.block, h.session.interrupt())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.sample_offset, 1024);

    // The answering tick keeps rendering the rest of the track
    let record = with_ticks(&h.io, h.block, h.session.query_offset())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.sample_offset, 2048);
    assert_eq!(h.session.playback_stats().unwrap().frames_discarded, 0);

    // Later chunks are still accepted
    h.remote
        .send(audio_chunk("no-interrupt", 1024, 1000))
        .await
        .unwrap();
    wait_until(|| io.queued() == 1).await;

    h.stop().await;
}

#[tokio::test]
async fn test_speak_stop_mark_flushes_tail_audio() {
    let mut config = test_config(1024);
    config.transport.speak_stop_delay_ms = 30;
    let mut h = start(config).await;

    // One full frame plus a 476-sample tail
    h.remote.send(audio_chunk("t1", 1500, 1000)).await.unwrap();

    assert_eq!(h.next_outbound().await, OutboundMessage::ai_speak_stop());
    assert_eq!(h.io.queued(), 2);

    h.io.tick(1024);
    h.io.tick(1024);
    let record = with_ticks(&h.io, h.block, h.session.query_offset())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.sample_offset, 1500);

    h.stop().await;
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let h = start(test_config(128)).await;

    h.remote.send_text("{not json").await.unwrap();
    h.remote
        .send(InboundMessage::Audio(AudioChunk {
            data: "###".into(),
            track_id: Some("t1".into()),
        }))
        .await
        .unwrap();
    h.remote
        .send(InboundMessage::Audio(AudioChunk {
            // Three bytes: not a whole number of samples
            data: "AAAA".into(),
            track_id: None,
        }))
        .await
        .unwrap();
    h.sync().await;

    assert_eq!(h.session.state(), SessionState::Active);
    assert_eq!(h.io.queued(), 0);

    h.stop().await;
}

#[tokio::test]
async fn test_text_transcript_and_conversation_id() {
    let mut h = start(test_config(128)).await;

    h.session.send_text("hello agent").await.unwrap();
    assert_eq!(
        h.next_outbound().await,
        OutboundMessage::Text {
            text: "hello agent".into()
        }
    );

    h.remote
        .send(InboundMessage::ConversationStart(ConversationStart {
            conversation_id: "conv-42".into(),
        }))
        .await
        .unwrap();
    h.remote
        .send(InboundMessage::Ai(TextContent {
            text: "hi there".into(),
        }))
        .await
        .unwrap();
    h.sync().await;

    assert_eq!(h.session.conversation_id().as_deref(), Some("conv-42"));
    let transcript = h.session.transcript();
    assert_eq!(transcript[0].speaker, Speaker::Agent);
    assert_eq!(transcript[0].text, "hi there");
    assert_eq!(transcript[1].speaker, Speaker::User);

    h.stop().await;
}

#[tokio::test]
async fn test_playback_mute_silences_but_advances() {
    let h = start(test_config(1024)).await;

    h.session.set_playback_muted(true).unwrap();
    h.remote.send(audio_chunk("t1", 1024, 1000)).await.unwrap();
    let io = &h.io;
    wait_until(|| io.queued() == 1).await;

    assert!(h.io.tick(1024).iter().all(|&s| s == 0.0));
    let record = with_ticks(&h.io, h.block, h.session.query_offset())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.sample_offset, 1024);

    h.stop().await;
}

fn read_wav(bytes: &[u8]) -> Vec<i16> {
    hound::WavReader::new(Cursor::new(bytes))
        .unwrap()
        .into_samples::<i16>()
        .map(|s| s.unwrap())
        .collect()
}

#[tokio::test]
async fn test_recordings_capture_all_three_streams() {
    let mut config = test_config(256);
    config.recording.enabled = true;
    let h = start(config).await;

    // Muted mic input is still recorded
    h.session.set_mic_muted(true).unwrap();
    h.io.speak_into_mic(&[0.25; 1024]);

    h.remote.send(audio_chunk("t1", 512, 1000)).await.unwrap();
    let io = &h.io;
    wait_until(|| io.queued() == 2).await;
    for _ in 0..4 {
        h.io.tick(256);
    }

    h.stop().await;
    let recordings = h.session.recordings().expect("recordings");

    let mic = read_wav(&recordings.mic);
    let agent = read_wav(&recordings.agent);
    let mixed = read_wav(&recordings.mixed);
    assert_eq!(mic, vec![quantize(0.25); 1024]);
    assert_eq!(agent.len(), 1024);
    assert_eq!(&agent[..512], &[1000; 512][..]);
    assert_eq!(mixed.len(), 1024);
    assert_eq!(mixed[0], quantize(0.25) + 1000);
    assert_eq!(mixed[1023], quantize(0.25));

    let dir = tempfile::tempdir().unwrap();
    let paths = recordings.write_to_dir(dir.path(), "call").unwrap();
    assert!(paths.iter().all(|p| p.exists()));
}

#[tokio::test]
async fn test_recordings_without_audio_are_absent() {
    let mut config = test_config(128);
    config.recording.enabled = true;
    let h = start(config).await;

    h.stop().await;
    assert!(h.session.recordings().is_none());
}
