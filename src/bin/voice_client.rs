//! Voice Client Application
//!
//! Runs one duplex conversation with the remote agent on the default (or
//! configured) audio devices. Type a line to send it as text, or use:
//!
//! - `/mute`      toggle the microphone
//! - `/playback`  toggle agent playback
//! - `/interrupt` cut off the agent
//! - `/offset`    show how much of the current track was heard
//! - `/quit`      end the session
//!
//! Usage: `voice-client [config.toml] [--list-devices]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_duplex::{
    audio::{list_devices, CpalIo, OffsetRecord},
    config::ClientConfig,
    network::transport,
    session::{Speaker, TranscriptEntry},
    Session, SessionEvent,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voice client");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let list_only = args.iter().any(|a| a == "--list-devices");
    let config_path = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .map(PathBuf::from)
        .or_else(ClientConfig::default_path);

    let config = match &config_path {
        Some(path) => ClientConfig::load_or_default(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };
    config.validate()?;

    print_devices();
    if list_only {
        return Ok(());
    }

    let mut session = Session::new(config.clone());
    let mut io = CpalIo;
    let mut events = match session
        .start(transport::connect(&config.transport), &mut io)
        .await
    {
        Ok(events) => events,
        Err(e) if session.capture_unavailable() => {
            eprintln!("Microphone unavailable. Check permissions and that no other app holds it.");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    tracing::info!("Connected to {}", config.transport.endpoint());
    println!("Session active. Type text to send, /mute, /playback, /interrupt, /offset or /quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
            event = events.recv() => match event {
                Some(SessionEvent::Closed { reason }) => {
                    tracing::info!("Session closed: {}", reason.unwrap_or_default());
                    break;
                }
                Some(event) => print_event(&event),
                None => break,
            },
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    break;
                };
                if !handle_command(&session, line.trim()).await {
                    break;
                }
            }
        }
    }

    session.stop().await;

    if let Some(recordings) = session.recordings() {
        let dir = config
            .recording
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("recordings"));
        let stem = recordings.started_at.format("%Y%m%d-%H%M%S").to_string();
        let paths = recordings
            .write_to_dir(&dir, &stem)
            .with_context(|| format!("Failed to write recordings to {}", dir.display()))?;
        for path in paths {
            println!("Saved {}", path.display());
        }
    }

    tracing::info!("Voice client stopped");
    Ok(())
}

/// Returns false when the session should end
async fn handle_command(session: &Session, line: &str) -> bool {
    match line {
        "" => {}
        "/quit" => return false,
        "/mute" => match session.toggle_mic_mute() {
            Ok(muted) => println!("Mic {}", if muted { "muted" } else { "live" }),
            Err(e) => tracing::warn!("{}", e),
        },
        "/playback" => match session.toggle_playback_mute() {
            Ok(muted) => println!("Playback {}", if muted { "muted" } else { "on" }),
            Err(e) => tracing::warn!("{}", e),
        },
        "/interrupt" => match session.interrupt().await {
            Ok(record) => print_offset("Interrupted", record.as_ref()),
            Err(e) => tracing::warn!("Interrupt failed: {}", e),
        },
        "/offset" => match session.query_offset().await {
            Ok(record) => print_offset("Offset", record.as_ref()),
            Err(e) => tracing::warn!("Offset query failed: {}", e),
        },
        text => {
            if let Err(e) = session.send_text(text).await {
                tracing::warn!("Failed to send text: {}", e);
            }
        }
    }
    true
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Transcript(TranscriptEntry { speaker, text, at }) => {
            let who = match speaker {
                Speaker::User => "you",
                Speaker::Agent => "agent",
            };
            println!("[{}] {}: {}", at.format("%H:%M:%S"), who, text);
        }
        SessionEvent::ConversationStarted(id) => println!("Conversation {}", id),
        SessionEvent::Interrupted(record) => print_offset("Interrupted", record.as_ref()),
        SessionEvent::UserSpeaking(speaking) => tracing::debug!("User speaking: {}", speaking),
        SessionEvent::PlaybackStarted => tracing::debug!("Agent speaking"),
        SessionEvent::PlaybackStopped => tracing::debug!("Agent idle"),
        SessionEvent::DeviceError(e) => eprintln!("Audio device error: {}", e),
        SessionEvent::Closed { .. } => {}
    }
}

fn print_offset(label: &str, record: Option<&OffsetRecord>) {
    match record {
        Some(record) => println!(
            "{}: track {} at {} samples ({:.2}s)",
            label, record.track_id, record.sample_offset, record.wall_clock_secs
        ),
        None => println!("{}: nothing playing", label),
    }
}
