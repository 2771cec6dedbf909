//! Audio device enumeration and stream configuration

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use super::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
}

/// What the engine asks the device for. Fixed while the engine runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Output device name; `None` picks the system default
    pub device: Option<String>,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub channels: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: 48000,
            buffer_size: 512,
            channels: 2,
        }
    }
}

impl EngineConfig {
    /// Reject values no device could honor before touching the hardware
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(8000..=384_000).contains(&self.sample_rate) {
            return Err(EngineError::UnsupportedConfig(format!(
                "sample rate {} Hz",
                self.sample_rate
            )));
        }
        if !(16..=8192).contains(&self.buffer_size) {
            return Err(EngineError::UnsupportedConfig(format!(
                "buffer size {} frames",
                self.buffer_size
            )));
        }
        if !(1..=32).contains(&self.channels) {
            return Err(EngineError::UnsupportedConfig(format!(
                "{} channels",
                self.channels
            )));
        }
        Ok(())
    }
}

/// Get list of available output devices
pub fn list_output_devices() -> Result<Vec<AudioDeviceInfo>, EngineError> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let devices = host
        .output_devices()
        .map_err(|e| EngineError::DeviceUnavailable(format!("Failed to enumerate devices: {}", e)))?;

    Ok(devices
        .filter_map(|device| device.name().ok())
        .map(|name| AudioDeviceInfo {
            is_default: Some(&name) == default_name.as_ref(),
            name,
        })
        .collect())
}

/// Get output device by name, or default if name is None
pub fn get_output_device(name: Option<&str>) -> Result<cpal::Device, EngineError> {
    let host = cpal::default_host();

    match name {
        Some(device_name) => {
            let mut devices = host.output_devices().map_err(|e| {
                EngineError::DeviceUnavailable(format!("Failed to enumerate devices: {}", e))
            })?;
            devices
                .find(|device| device.name().map_or(false, |n| n == device_name))
                .ok_or_else(|| {
                    EngineError::DeviceUnavailable(format!("Device '{}' not found", device_name))
                })
        }
        None => host
            .default_output_device()
            .ok_or_else(|| EngineError::DeviceUnavailable("No default output device found".to_string())),
    }
}

/// Find a stream configuration that matches `config` exactly.
/// The engine renders f32 only.
pub fn supported_stream_config(
    device: &cpal::Device,
    config: &EngineConfig,
) -> Result<cpal::StreamConfig, EngineError> {
    let supported = device
        .supported_output_configs()
        .map_err(|e| EngineError::DeviceUnavailable(format!("Failed to get supported configs: {}", e)))?;

    let mut rate_ok = false;
    let mut channels_ok = false;
    for range in supported {
        if range.sample_format() != cpal::SampleFormat::F32 {
            continue;
        }
        if range.channels() != config.channels {
            continue;
        }
        channels_ok = true;

        let rate = cpal::SampleRate(config.sample_rate);
        if rate < range.min_sample_rate() || rate > range.max_sample_rate() {
            continue;
        }
        rate_ok = true;

        let buffer_ok = match range.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max } => {
                (*min..=*max).contains(&config.buffer_size)
            }
            cpal::SupportedBufferSize::Unknown => true,
        };
        if buffer_ok {
            return Ok(cpal::StreamConfig {
                channels: config.channels,
                sample_rate: rate,
                buffer_size: cpal::BufferSize::Fixed(config.buffer_size),
            });
        }
    }

    let reason = if !channels_ok {
        format!("{} channels", config.channels)
    } else if !rate_ok {
        format!("sample rate {} Hz", config.sample_rate)
    } else {
        format!("buffer size {} frames", config.buffer_size)
    };
    Err(EngineError::UnsupportedConfig(reason))
}
