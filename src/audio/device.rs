//! Audio device enumeration and selection

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use crate::error::AudioError;

/// Common rates probed when listing device capabilities
const PROBE_RATES: [u32; 5] = [16000, 24000, 44100, 48000, 96000];

/// Description of an audio endpoint, as shown by `--list-devices`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Direction of a device lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// List all available audio devices on the default host
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = capabilities(&device, Direction::Input);
            devices.push(AudioDeviceInfo {
                is_default: default_input.as_ref() == Some(&name),
                name,
                is_input: true,
                is_output: false,
                sample_rates,
                channels,
            });
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            let Ok(name) = device.name() else { continue };
            let is_default = default_output.as_ref() == Some(&name);

            // Duplex endpoints show up once
            if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                existing.is_output = true;
                existing.is_default |= is_default;
                continue;
            }

            let (sample_rates, channels) = capabilities(&device, Direction::Output);
            devices.push(AudioDeviceInfo {
                name,
                is_input: false,
                is_output: true,
                is_default,
                sample_rates,
                channels,
            });
        }
    }

    devices
}

fn capabilities(device: &cpal::Device, direction: Direction) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device
            .supported_input_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default(),
        Direction::Output => device
            .supported_output_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default(),
    };

    let mut rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        for rate in PROBE_RATES {
            let sample_rate = cpal::SampleRate(rate);
            if sample_rate >= config.min_sample_rate()
                && sample_rate <= config.max_sample_rate()
                && !rates.contains(&rate)
            {
                rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }

    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

/// Find a device by name, or the host default when no name is given
pub fn find_device(name: Option<&str>, direction: Direction) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        let device = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        return device.ok_or_else(|| {
            AudioError::DeviceNotFound(format!("No default {:?} device", direction).to_lowercase())
        });
    };

    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceNotFound(name.to_string()))
}

/// Stream config at the session rate, keeping the device's channel count
pub fn stream_config(
    device: &cpal::Device,
    direction: Direction,
    sample_rate: u32,
) -> Result<cpal::StreamConfig, AudioError> {
    let default = match direction {
        Direction::Input => device.default_input_config(),
        Direction::Output => device.default_output_config(),
    }
    .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;

    if default.sample_format() != cpal::SampleFormat::F32 {
        tracing::debug!(
            "Device default format is {:?}, requesting f32",
            default.sample_format()
        );
    }

    Ok(cpal::StreamConfig {
        channels: default.channels(),
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    })
}
