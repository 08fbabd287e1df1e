//! Device stream management
//!
//! Each cpal stream is built and held by a dedicated thread, alive while
//! its running flag is set. The session only sees the `AudioIo` seam, so
//! tests can drive the capture pipeline and renderer by hand.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::capture::CapturePipeline;
use crate::audio::device::{find_device, stream_config, Direction};
use crate::audio::render::Renderer;
use crate::config::AudioConfig;
use crate::error::AudioError;

/// Opens the input and output streams for a session
pub trait AudioIo: Send {
    /// Start capture first, then playback
    ///
    /// An input failure must surface as `AudioError::CaptureUnavailable`.
    fn open(
        &mut self,
        config: &AudioConfig,
        capture: CapturePipeline,
        renderer: Renderer,
    ) -> Result<DeviceStreams, AudioError>;
}

struct StreamThread {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Stream thread {} panicked", self.name);
            }
        }
    }
}

/// Running device streams; dropping them stops the devices
pub struct DeviceStreams {
    streams: Vec<StreamThread>,
    errors: Option<Receiver<AudioError>>,
}

impl DeviceStreams {
    /// No devices, for callers that drive the audio paths themselves
    pub fn empty() -> Self {
        Self {
            streams: Vec::new(),
            errors: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.streams
            .iter()
            .any(|s| s.running.load(Ordering::Relaxed))
    }

    /// Report asynchronous stream errors on `errors`
    ///
    /// For `AudioIo` implementations that manage their own streams.
    pub fn with_errors(mut self, errors: Receiver<AudioError>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Next asynchronous stream error, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.errors.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    /// Stop every stream; safe to call more than once
    pub fn stop(&mut self) {
        for stream in &mut self.streams {
            stream.stop();
        }
    }
}

impl Drop for DeviceStreams {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Real devices through cpal
#[derive(Debug, Default)]
pub struct CpalIo;

impl AudioIo for CpalIo {
    fn open(
        &mut self,
        config: &AudioConfig,
        mut capture: CapturePipeline,
        mut renderer: Renderer,
    ) -> Result<DeviceStreams, AudioError> {
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let mut streams = DeviceStreams {
            streams: Vec::new(),
            errors: Some(error_rx),
        };
        let sample_rate = config.sample_rate;

        let input_name = config.input_device.clone();
        let input_errors = error_tx.clone();
        let input = spawn_stream("capture-mic", move || {
            let device = find_device(input_name.as_deref(), Direction::Input)?;
            let stream_config = stream_config(&device, Direction::Input, sample_rate)?;
            let channels = stream_config.channels;
            device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        capture.process(data, channels);
                    },
                    stream_error_callback(input_errors),
                    None,
                )
                .map_err(|e| AudioError::StreamError(e.to_string()))
        })
        .map_err(|e| AudioError::CaptureUnavailable(e.to_string()))?;
        streams.streams.push(input);

        let output_name = config.output_device.clone();
        let output = spawn_stream("render-agent", move || {
            let device = find_device(output_name.as_deref(), Direction::Output)?;
            let stream_config = stream_config(&device, Direction::Output, sample_rate)?;
            let channels = stream_config.channels;
            device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        renderer.render_interleaved(data, channels);
                    },
                    stream_error_callback(error_tx),
                    None,
                )
                .map_err(|e| AudioError::StreamError(e.to_string()))
        })
        .map_err(|e| AudioError::PlaybackUnavailable(e.to_string()))?;
        streams.streams.push(output);

        tracing::info!("Audio devices opened at {} Hz", sample_rate);
        Ok(streams)
    }
}

fn stream_error_callback(errors: Sender<AudioError>) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        tracing::error!("Stream error: {}", err);
        let err = match err {
            cpal::StreamError::DeviceNotAvailable => AudioError::DeviceLost(err.to_string()),
            other => AudioError::StreamError(other.to_string()),
        };
        let _ = errors.try_send(err);
    }
}

/// Build and play a stream on its own thread, waiting until it is live
fn spawn_stream<F>(name: &str, build: F) -> Result<StreamThread, AudioError>
where
    F: FnOnce() -> Result<cpal::Stream, AudioError> + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let running_for_loop = running.clone();
    let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Keep thread alive while running
            while running_for_loop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(10));
            }
            // Stream is dropped here, stopping the device
        })
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    let mut stream_thread = StreamThread {
        name: name.to_string(),
        running,
        handle: Some(handle),
    };

    match ready_rx.recv() {
        Ok(Ok(())) => {
            tracing::debug!("Stream {} started", name);
            Ok(stream_thread)
        }
        Ok(Err(e)) => {
            stream_thread.stop();
            Err(e)
        }
        Err(_) => {
            stream_thread.stop();
            Err(AudioError::StreamError(format!("{} exited before starting", name)))
        }
    }
}
