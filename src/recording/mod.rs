//! Session recording: mixed, mic-only and agent-only streams
//!
//! Each stream is accumulated by its own recorder thread fed through a
//! `RecordingTap`. The audio callbacks only ever do a non-blocking channel
//! send. The mixed recorder sums mic and agent samples by position.
//!
//! Stopping is sequenced: the mixed recorder stops first, and its
//! completion event releases the other two, so all three end within one
//! block of each other.

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::RecordingError;

/// How long stop waits for the mixed recorder before releasing the others
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// The three recorded streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Mixed,
    Mic,
    Agent,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Mixed => "mixed",
            StreamKind::Mic => "mic",
            StreamKind::Agent => "agent",
        };
        f.write_str(name)
    }
}

enum RecorderCommand {
    Mic(Vec<i16>),
    Agent(Vec<i16>),
    Stop,
}

/// Cloneable feed into the recorders, handed to the capture and render paths
#[derive(Clone)]
pub struct RecordingTap {
    mixed: Sender<RecorderCommand>,
    mic: Sender<RecorderCommand>,
    agent: Sender<RecorderCommand>,
}

impl RecordingTap {
    /// Feed raw microphone samples
    pub fn mic(&self, samples: &[i16]) {
        let _ = self.mic.send(RecorderCommand::Mic(samples.to_vec()));
        let _ = self.mixed.send(RecorderCommand::Mic(samples.to_vec()));
    }

    /// Feed rendered agent samples
    pub fn agent(&self, samples: &[i16]) {
        let _ = self.agent.send(RecorderCommand::Agent(samples.to_vec()));
        let _ = self.mixed.send(RecorderCommand::Agent(samples.to_vec()));
    }
}

/// Position-aligned mic + agent mix
#[derive(Default)]
struct Mixer {
    mic: VecDeque<i16>,
    agent: VecDeque<i16>,
    out: Vec<i16>,
}

impl Mixer {
    fn push_mic(&mut self, samples: Vec<i16>) {
        self.mic.extend(samples);
        self.drain();
    }

    fn push_agent(&mut self, samples: Vec<i16>) {
        self.agent.extend(samples);
        self.drain();
    }

    fn drain(&mut self) {
        let n = self.mic.len().min(self.agent.len());
        self.out.extend(
            self.mic
                .drain(..n)
                .zip(self.agent.drain(..n))
                .map(|(m, a)| m.saturating_add(a)),
        );
    }

    /// Flush what is left; at most one side still holds samples
    fn finish(mut self) -> Vec<i16> {
        self.drain();
        self.out.extend(self.mic.drain(..));
        self.out.extend(self.agent.drain(..));
        self.out
    }
}

struct Recorder {
    kind: StreamKind,
    commands: Sender<RecorderCommand>,
    handle: Option<JoinHandle<Vec<i16>>>,
}

impl Recorder {
    fn spawn(kind: StreamKind, completions: Sender<StreamKind>) -> Result<Self, RecordingError> {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name(format!("recorder-{}", kind))
            .spawn(move || run_recorder(kind, rx, completions))
            .map_err(|e| RecordingError::Start(e.to_string()))?;

        Ok(Self {
            kind,
            commands: tx,
            handle: Some(handle),
        })
    }

    fn request_stop(&self) {
        let _ = self.commands.send(RecorderCommand::Stop);
    }

    fn join(&mut self) -> Vec<i16> {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(samples)) => samples,
            Some(Err(_)) => {
                tracing::error!("Recorder {} panicked", self.kind);
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}

fn run_recorder(
    kind: StreamKind,
    commands: Receiver<RecorderCommand>,
    completions: Sender<StreamKind>,
) -> Vec<i16> {
    let mut linear = Vec::new();
    let mut mixer = Mixer::default();

    for command in commands.iter() {
        match (kind, command) {
            (_, RecorderCommand::Stop) => break,
            (StreamKind::Mixed, RecorderCommand::Mic(samples)) => mixer.push_mic(samples),
            (StreamKind::Mixed, RecorderCommand::Agent(samples)) => mixer.push_agent(samples),
            (StreamKind::Mic, RecorderCommand::Mic(samples))
            | (StreamKind::Agent, RecorderCommand::Agent(samples)) => linear.extend(samples),
            _ => {}
        }
    }

    let samples = match kind {
        StreamKind::Mixed => mixer.finish(),
        _ => linear,
    };
    tracing::debug!("Recorder {} finished with {} samples", kind, samples.len());
    let _ = completions.send(kind);
    samples
}

/// Raw PCM of the three streams after stop
#[derive(Debug, Clone, Default)]
struct CapturedStreams {
    mixed: Vec<i16>,
    mic: Vec<i16>,
    agent: Vec<i16>,
}

/// The three concurrently running recorders of a session
pub struct RecordingSet {
    sample_rate: u32,
    started_at: DateTime<Utc>,
    mixed: Recorder,
    mic: Recorder,
    agent: Recorder,
    completions: Receiver<StreamKind>,
    captured: Option<CapturedStreams>,
}

impl RecordingSet {
    /// Start all three recorders and return the tap that feeds them
    pub fn start(sample_rate: u32) -> Result<(Self, RecordingTap), RecordingError> {
        let (completion_tx, completion_rx) = unbounded();

        let mixed = Recorder::spawn(StreamKind::Mixed, completion_tx.clone())?;
        let mic = match Recorder::spawn(StreamKind::Mic, completion_tx.clone()) {
            Ok(recorder) => recorder,
            Err(e) => {
                mixed.request_stop();
                return Err(e);
            }
        };
        let agent = match Recorder::spawn(StreamKind::Agent, completion_tx) {
            Ok(recorder) => recorder,
            Err(e) => {
                mixed.request_stop();
                mic.request_stop();
                return Err(e);
            }
        };

        let tap = RecordingTap {
            mixed: mixed.commands.clone(),
            mic: mic.commands.clone(),
            agent: agent.commands.clone(),
        };

        tracing::info!("Recording started at {} Hz", sample_rate);
        let set = Self {
            sample_rate,
            started_at: Utc::now(),
            mixed,
            mic,
            agent,
            completions: completion_rx,
            captured: None,
        };
        Ok((set, tap))
    }

    /// Stop the recorders: mixed first, then mic and agent on its completion
    ///
    /// Idempotent.
    pub fn stop(&mut self) {
        if self.captured.is_some() {
            return;
        }

        self.mixed.request_stop();
        loop {
            match self.completions.recv_timeout(STOP_TIMEOUT) {
                Ok(StreamKind::Mixed) => break,
                Ok(_) => continue,
                Err(_) => {
                    tracing::warn!("Mixed recorder did not complete, stopping the rest");
                    break;
                }
            }
        }
        self.mic.request_stop();
        self.agent.request_stop();

        let captured = CapturedStreams {
            mixed: self.mixed.join(),
            mic: self.mic.join(),
            agent: self.agent.join(),
        };
        tracing::info!(
            "Recording stopped: mixed {} / mic {} / agent {} samples",
            captured.mixed.len(),
            captured.mic.len(),
            captured.agent.len()
        );
        self.captured = Some(captured);
    }

    /// Stop if needed and export the three streams as WAV
    ///
    /// Returns `Ok(None)` when nothing was ever captured, which is distinct
    /// from a recording of silence.
    pub fn finalize(&mut self) -> Result<Option<Recordings>, RecordingError> {
        self.stop();
        let Some(captured) = &self.captured else {
            return Ok(None);
        };
        if captured.mixed.is_empty() && captured.mic.is_empty() && captured.agent.is_empty() {
            tracing::warn!("No recorded data available");
            return Ok(None);
        }

        Ok(Some(Recordings {
            mixed: encode_wav(&captured.mixed, self.sample_rate)?,
            mic: encode_wav(&captured.mic, self.sample_rate)?,
            agent: encode_wav(&captured.agent, self.sample_rate)?,
            lengths: StreamLengths {
                mixed: captured.mixed.len(),
                mic: captured.mic.len(),
                agent: captured.agent.len(),
            },
            sample_rate: self.sample_rate,
            started_at: self.started_at,
        }))
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl Drop for RecordingSet {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sample counts per stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLengths {
    pub mixed: usize,
    pub mic: usize,
    pub agent: usize,
}

/// Finalized session recordings, one WAV blob per stream
#[derive(Debug, Clone)]
pub struct Recordings {
    pub mixed: Vec<u8>,
    pub mic: Vec<u8>,
    pub agent: Vec<u8>,
    pub lengths: StreamLengths,
    pub sample_rate: u32,
    pub started_at: DateTime<Utc>,
}

impl Recordings {
    pub fn get(&self, kind: StreamKind) -> &[u8] {
        match kind {
            StreamKind::Mixed => &self.mixed,
            StreamKind::Mic => &self.mic,
            StreamKind::Agent => &self.agent,
        }
    }

    /// Duration of a stream in seconds
    pub fn duration_secs(&self, kind: StreamKind) -> f64 {
        let samples = match kind {
            StreamKind::Mixed => self.lengths.mixed,
            StreamKind::Mic => self.lengths.mic,
            StreamKind::Agent => self.lengths.agent,
        };
        samples as f64 / self.sample_rate as f64
    }

    /// Write `{stem}-mixed.wav`, `{stem}-mic.wav` and `{stem}-agent.wav`
    pub fn write_to_dir(&self, dir: &Path, stem: &str) -> std::io::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut paths = Vec::with_capacity(3);
        for kind in [StreamKind::Mixed, StreamKind::Mic, StreamKind::Agent] {
            let path = dir.join(format!("{}-{}.wav", stem, kind));
            std::fs::write(&path, self.get(kind))?;
            paths.push(path);
        }
        Ok(paths)
    }
}

/// Encode mono int16 PCM as a WAV blob
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, RecordingError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
