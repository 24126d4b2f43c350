//! Output device interface and the cpal-backed implementation
//!
//! The engine consumes the OS audio device through the [`OutputDevice`]
//! trait: enumeration, stream format get/set, start/stop of the I/O
//! callback, format-change notification polling, and exclusive-mode
//! acquisition where a backend supports it. `CpalOutputDevice` is the
//! shipped implementation.

use crate::audio::converter::{OutputSampleFormat, RenderTarget};
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Negotiated format of an output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: OutputSampleFormat,
}

/// Render hook invoked on the device's realtime callback thread.
///
/// Receives the typed output slice for one callback; must fill it
/// completely.
pub type RenderFn = Box<dyn FnMut(RenderTarget<'_>) + Send + 'static>;

/// The OS audio device surface the engine consumes.
pub trait OutputDevice {
    /// Human-readable device name
    fn name(&self) -> String;

    /// Currently negotiated stream format
    fn stream_format(&self) -> StreamFormat;

    /// Frames per callback the device is expected to request
    fn buffer_frames(&self) -> usize;

    /// Renegotiate the stream format. Only valid while stopped.
    fn set_stream_format(&mut self, format: StreamFormat) -> Result<()>;

    /// Register the I/O callback and start the stream.
    fn start(&mut self, render: RenderFn) -> Result<()>;

    /// Suspend callbacks without unregistering them (pause semantics)
    fn pause(&mut self) -> Result<()>;

    /// Resume a paused stream
    fn resume(&mut self) -> Result<()>;

    /// Stop the stream and unregister the callback.
    fn stop(&mut self) -> Result<()>;

    /// Whether the stream is currently running
    fn is_running(&self) -> bool;

    /// Device-initiated stream format change, if one occurred since the
    /// last poll.
    fn poll_format_change(&mut self) -> Option<StreamFormat>;

    /// Whether the stream reported a fatal error since start
    fn has_error(&self) -> bool;

    /// Acquire or release exclusive device access (hog mode).
    ///
    /// Backends without exclusive acquisition report `StreamUnsupported`;
    /// a device already hogged elsewhere reports `DeviceBusy`.
    fn set_exclusive(&mut self, _exclusive: bool) -> Result<()> {
        Err(Error::StreamUnsupported(
            "exclusive mode not supported by this backend".to_string(),
        ))
    }
}

/// List available output device names.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::DeviceUnavailable(format!("failed to enumerate devices: {e}")))?
        .filter_map(|device| device.name().ok())
        .collect();

    debug!("Found {} output devices", devices.len());
    Ok(devices)
}

/// Audio output device backed by cpal.
pub struct CpalOutputDevice {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
    paused: bool,
    /// Set by the stream's error callback; read by the controller
    error_flag: Arc<AtomicBool>,
}

impl CpalOutputDevice {
    /// Open an output device by name, falling back to the default device
    /// when the named one is missing.
    pub fn open(device_name: Option<&str>, buffer_frames: Option<u32>) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name {
            let mut devices = host.output_devices().map_err(|e| {
                Error::DeviceUnavailable(format!("failed to enumerate devices: {e}"))
            })?;

            match devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                Some(dev) => {
                    info!("Found requested audio device: {}", name);
                    dev
                }
                None => {
                    warn!("Requested device '{name}' not found, falling back to default device");
                    host.default_output_device().ok_or_else(|| {
                        Error::DeviceUnavailable(format!(
                            "device '{name}' not found and no default device available"
                        ))
                    })?
                }
            }
        } else {
            host.default_output_device()
                .ok_or_else(|| Error::DeviceUnavailable("no default output device".to_string()))?
        };

        let (mut config, sample_format) = Self::best_config(&device)?;
        if let Some(frames) = buffer_frames {
            config.buffer_size = cpal::BufferSize::Fixed(frames);
        }

        debug!(
            "Audio config: sample_rate={}, channels={}, format={:?}, buffer_size={:?}",
            config.sample_rate.0, config.channels, sample_format, config.buffer_size
        );

        Ok(Self {
            device,
            config,
            sample_format,
            stream: None,
            paused: false,
            error_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Pick the best supported configuration: prefer 44.1kHz stereo f32,
    /// fall back to the device default.
    fn best_config(device: &Device) -> Result<(StreamConfig, SampleFormat)> {
        let mut supported = device
            .supported_output_configs()
            .map_err(|e| Error::DeviceUnavailable(format!("failed to get device configs: {e}")))?;

        let preferred = supported.find(|config| {
            config.channels() == 2
                && config.min_sample_rate().0 <= 44_100
                && config.max_sample_rate().0 >= 44_100
                && config.sample_format() == SampleFormat::F32
        });

        if let Some(config) = preferred {
            let sample_format = config.sample_format();
            let config = config.with_sample_rate(cpal::SampleRate(44_100)).config();
            return Ok((config, sample_format));
        }

        let config = device
            .default_output_config()
            .map_err(|e| Error::DeviceUnavailable(format!("failed to get default config: {e}")))?;

        let sample_format = config.sample_format();
        Ok((config.config(), sample_format))
    }

    fn map_sample_format(format: SampleFormat) -> Result<OutputSampleFormat> {
        match format {
            SampleFormat::F32 => Ok(OutputSampleFormat::F32),
            SampleFormat::I16 => Ok(OutputSampleFormat::I16),
            SampleFormat::U16 => Ok(OutputSampleFormat::U16),
            SampleFormat::I32 => Ok(OutputSampleFormat::I32),
            other => Err(Error::StreamUnsupported(format!(
                "unsupported sample format: {other:?}"
            ))),
        }
    }

    fn build_stream_f32(&self, mut render: RenderFn) -> Result<Stream> {
        let error_flag = Arc::clone(&self.error_flag);
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    render(RenderTarget::F32(data));
                },
                move |err| {
                    error!("Audio stream error: {err}");
                    error_flag.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(format!("failed to build stream: {e}")))
    }

    fn build_stream_i16(&self, mut render: RenderFn) -> Result<Stream> {
        let error_flag = Arc::clone(&self.error_flag);
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    render(RenderTarget::I16(data));
                },
                move |err| {
                    error!("Audio stream error: {err}");
                    error_flag.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(format!("failed to build stream: {e}")))
    }

    fn build_stream_u16(&self, mut render: RenderFn) -> Result<Stream> {
        let error_flag = Arc::clone(&self.error_flag);
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                    render(RenderTarget::U16(data));
                },
                move |err| {
                    error!("Audio stream error: {err}");
                    error_flag.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(format!("failed to build stream: {e}")))
    }

    fn build_stream_i32(&self, mut render: RenderFn) -> Result<Stream> {
        let error_flag = Arc::clone(&self.error_flag);
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [i32], _: &cpal::OutputCallbackInfo| {
                    render(RenderTarget::I32(data));
                },
                move |err| {
                    error!("Audio stream error: {err}");
                    error_flag.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(format!("failed to build stream: {e}")))
    }
}

impl OutputDevice for CpalOutputDevice {
    fn name(&self) -> String {
        self.device.name().unwrap_or_else(|_| "Unknown".to_string())
    }

    fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.config.sample_rate.0,
            channels: self.config.channels,
            // best_config only selects formats map_sample_format accepts
            sample_format: Self::map_sample_format(self.sample_format)
                .unwrap_or(OutputSampleFormat::F32),
        }
    }

    fn buffer_frames(&self) -> usize {
        match self.config.buffer_size {
            cpal::BufferSize::Fixed(frames) => frames as usize,
            cpal::BufferSize::Default => 1024,
        }
    }

    fn set_stream_format(&mut self, format: StreamFormat) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::InvalidArgument(
                "cannot renegotiate stream format while running".to_string(),
            ));
        }

        let supported = self
            .device
            .supported_output_configs()
            .map_err(|e| Error::DeviceUnavailable(format!("failed to get device configs: {e}")))?
            .any(|c| {
                c.channels() == format.channels
                    && c.min_sample_rate().0 <= format.sample_rate
                    && c.max_sample_rate().0 >= format.sample_rate
                    && Self::map_sample_format(c.sample_format()).ok()
                        == Some(format.sample_format)
            });

        if !supported {
            return Err(Error::StreamUnsupported(format!(
                "{}Hz/{}ch/{:?} not supported by {}",
                format.sample_rate,
                format.channels,
                format.sample_format,
                self.name()
            )));
        }

        self.config.sample_rate = cpal::SampleRate(format.sample_rate);
        self.config.channels = format.channels;
        self.sample_format = match format.sample_format {
            OutputSampleFormat::F32 => SampleFormat::F32,
            OutputSampleFormat::I16 => SampleFormat::I16,
            OutputSampleFormat::U16 => SampleFormat::U16,
            OutputSampleFormat::I32 => SampleFormat::I32,
        };

        info!(
            "Stream format set: {}Hz, {} ch, {:?}",
            format.sample_rate, format.channels, format.sample_format
        );
        Ok(())
    }

    fn start(&mut self, render: RenderFn) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        info!("Starting audio stream on '{}'", self.name());
        self.error_flag.store(false, Ordering::SeqCst);

        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream_f32(render)?,
            SampleFormat::I16 => self.build_stream_i16(render)?,
            SampleFormat::U16 => self.build_stream_u16(render)?,
            SampleFormat::I32 => self.build_stream_i32(render)?,
            other => {
                return Err(Error::StreamUnsupported(format!(
                    "unsupported sample format: {other:?}"
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::DeviceUnavailable(format!("failed to start stream: {e}")))?;

        self.stream = Some(stream);
        self.paused = false;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_ref() {
            stream
                .pause()
                .map_err(|e| Error::DeviceUnavailable(format!("failed to pause stream: {e}")))?;
            self.paused = true;
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_ref() {
            stream
                .play()
                .map_err(|e| Error::DeviceUnavailable(format!("failed to resume stream: {e}")))?;
            self.paused = false;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            info!("Stopping audio stream");
            stream
                .pause()
                .map_err(|e| Error::DeviceUnavailable(format!("failed to pause stream: {e}")))?;
            drop(stream);
        }
        self.paused = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.stream.is_some() && !self.paused
    }

    fn poll_format_change(&mut self) -> Option<StreamFormat> {
        // cpal exposes no device property notifications; format changes
        // only arrive through set_stream_format.
        None
    }

    fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::SeqCst)
    }
}

impl Drop for CpalOutputDevice {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices_does_not_panic() {
        // Requires audio hardware to return devices; either outcome is
        // acceptable in CI.
        let result = list_output_devices();
        assert!(result.is_ok() || result.is_err());
    }

    #[test]
    fn test_map_sample_format() {
        assert_eq!(
            CpalOutputDevice::map_sample_format(SampleFormat::F32).unwrap(),
            OutputSampleFormat::F32
        );
        assert_eq!(
            CpalOutputDevice::map_sample_format(SampleFormat::I16).unwrap(),
            OutputSampleFormat::I16
        );
        assert!(CpalOutputDevice::map_sample_format(SampleFormat::U8).is_err());
    }
}
