//! Shared test fixtures: synthetic decoders with predictable samples and
//! a manual output device whose render callback is pumped from the test
//! thread.

#![allow(dead_code)]

use gapless_engine::{
    ChannelLayout, Decoder, EngineConfig, OutputDevice, OutputSampleFormat, RenderFn,
    RenderTarget, Result, SourceBuffer, SourceFormat, StreamFormat,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Engine configuration with short waits so tests settle quickly.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        ring_frames: 8192,
        decode_chunk_frames: 1024,
        decoder_wait: Duration::from_millis(10),
        collector_wait: Duration::from_millis(25),
        mute_ack_timeout: Duration::from_millis(50),
        seek_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(2),
        resampler_chunk_frames: 256,
        max_callback_frames: 2048,
        ..EngineConfig::default()
    }
}

/// Encode a frame index as a sample value, unique per frame and exactly
/// recoverable from the f32 output.
pub fn ramp_value(frame: u64) -> f64 {
    (frame + 1) as f64 * 1e-6
}

/// Recover the frame index from a rendered sample; None for silence or
/// anything that is not a clean ramp value.
pub fn ramp_index(sample: f32) -> Option<u64> {
    if sample <= 0.0 {
        return None;
    }
    let idx = (f64::from(sample) * 1e6).round() as u64;
    if idx == 0 {
        return None;
    }
    Some(idx - 1)
}

/// Decoder producing `ramp_value(frame)` on every channel; each frame is
/// uniquely identifiable at the output.
pub struct RampDecoder {
    channels: u16,
    sample_rate: u32,
    total: u64,
    position: u64,
    seekable: bool,
}

impl RampDecoder {
    pub fn new(sample_rate: u32, channels: u16, total: u64) -> Self {
        Self {
            channels,
            sample_rate,
            total,
            position: 0,
            seekable: true,
        }
    }

    pub fn unseekable(mut self) -> Self {
        self.seekable = false;
        self
    }
}

impl Decoder for RampDecoder {
    fn source_format(&self) -> SourceFormat {
        SourceFormat {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 64,
            layout: ChannelLayout::from_channels(self.channels),
        }
    }

    fn total_frames(&self) -> u64 {
        self.total
    }

    fn current_frame(&self) -> u64 {
        self.position
    }

    fn supports_seeking(&self) -> bool {
        self.seekable
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<u64> {
        assert!(self.seekable);
        self.position = frame.min(self.total);
        Ok(self.position)
    }

    fn read_audio(&mut self, buf: &mut SourceBuffer, frames: usize) -> Result<usize> {
        let n = frames.min((self.total - self.position) as usize);
        let SourceBuffer::F64(samples) = buf else {
            panic!("ramp decoder fills f64 buffers");
        };
        let channels = self.channels as usize;
        for i in 0..n {
            let value = ramp_value(self.position + i as u64);
            for ch in 0..channels {
                samples[i * channels + ch] = value;
            }
        }
        self.position += n as u64;
        Ok(n)
    }

    fn uri(&self) -> Option<&str> {
        Some("test:ramp")
    }
}

/// Mono sine decoder (f32 source path)
pub struct SineDecoder {
    frequency: f64,
    sample_rate: u32,
    total: u64,
    position: u64,
}

impl SineDecoder {
    pub fn new(frequency: f64, sample_rate: u32, total: u64) -> Self {
        Self {
            frequency,
            sample_rate,
            total,
            position: 0,
        }
    }
}

impl Decoder for SineDecoder {
    fn source_format(&self) -> SourceFormat {
        SourceFormat {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            layout: ChannelLayout::Mono,
        }
    }

    fn total_frames(&self) -> u64 {
        self.total
    }

    fn current_frame(&self) -> u64 {
        self.position
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<u64> {
        self.position = frame.min(self.total);
        Ok(self.position)
    }

    fn read_audio(&mut self, buf: &mut SourceBuffer, frames: usize) -> Result<usize> {
        let n = frames.min((self.total - self.position) as usize);
        let SourceBuffer::F32(samples) = buf else {
            panic!("sine decoder fills f32 buffers");
        };
        for i in 0..n {
            let t = (self.position + i as u64) as f64 / f64::from(self.sample_rate);
            samples[i] = (0.5 * (2.0 * std::f64::consts::PI * self.frequency * t).sin()) as f32;
        }
        self.position += n as u64;
        Ok(n)
    }
}

/// Wrapper that sleeps on every read to starve the ring on purpose.
pub struct SlowDecoder<D: Decoder> {
    inner: D,
    delay: Duration,
}

impl<D: Decoder> SlowDecoder<D> {
    pub fn new(inner: D, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl<D: Decoder> Decoder for SlowDecoder<D> {
    fn source_format(&self) -> SourceFormat {
        self.inner.source_format()
    }

    fn total_frames(&self) -> u64 {
        self.inner.total_frames()
    }

    fn current_frame(&self) -> u64 {
        self.inner.current_frame()
    }

    fn supports_seeking(&self) -> bool {
        self.inner.supports_seeking()
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<u64> {
        self.inner.seek_to_frame(frame)
    }

    fn make_buffer(&self, capacity_frames: usize) -> SourceBuffer {
        self.inner.make_buffer(capacity_frames)
    }

    fn read_audio(&mut self, buf: &mut SourceBuffer, frames: usize) -> Result<usize> {
        std::thread::sleep(self.delay);
        self.inner.read_audio(buf, frames)
    }
}

/// Decoder that fails after producing a prefix of its frames.
pub struct FailingDecoder {
    inner: RampDecoder,
    fail_after: u64,
}

impl FailingDecoder {
    pub fn new(sample_rate: u32, total: u64, fail_after: u64) -> Self {
        Self {
            inner: RampDecoder::new(sample_rate, 1, total),
            fail_after,
        }
    }
}

impl Decoder for FailingDecoder {
    fn source_format(&self) -> SourceFormat {
        self.inner.source_format()
    }

    fn total_frames(&self) -> u64 {
        self.inner.total_frames()
    }

    fn current_frame(&self) -> u64 {
        self.inner.current_frame()
    }

    fn supports_seeking(&self) -> bool {
        false
    }

    fn seek_to_frame(&mut self, _frame: u64) -> Result<u64> {
        Err(gapless_engine::Error::SeekUnsupported)
    }

    fn make_buffer(&self, capacity_frames: usize) -> SourceBuffer {
        self.inner.make_buffer(capacity_frames)
    }

    fn read_audio(&mut self, buf: &mut SourceBuffer, frames: usize) -> Result<usize> {
        if self.inner.current_frame() >= self.fail_after {
            return Err(gapless_engine::Error::DecoderFailed(
                "synthetic failure".to_string(),
            ));
        }
        let frames = frames.min((self.fail_after - self.inner.current_frame()) as usize);
        self.inner.read_audio(buf, frames)
    }
}

struct ManualInner {
    render: Option<RenderFn>,
    running: bool,
    format: StreamFormat,
    pending_change: Option<StreamFormat>,
}

/// Output device whose callback the test pumps by hand.
pub struct ManualOutputDevice {
    inner: Arc<Mutex<ManualInner>>,
    error_flag: Arc<AtomicBool>,
    buffer_frames: usize,
}

/// Test-side handle for pumping the device and injecting device events.
#[derive(Clone)]
pub struct ManualDeviceHandle {
    inner: Arc<Mutex<ManualInner>>,
    error_flag: Arc<AtomicBool>,
}

impl ManualOutputDevice {
    pub fn new(format: StreamFormat, buffer_frames: usize) -> (Self, ManualDeviceHandle) {
        let inner = Arc::new(Mutex::new(ManualInner {
            render: None,
            running: false,
            format,
            pending_change: None,
        }));
        let error_flag = Arc::new(AtomicBool::new(false));
        let handle = ManualDeviceHandle {
            inner: Arc::clone(&inner),
            error_flag: Arc::clone(&error_flag),
        };
        (
            Self {
                inner,
                error_flag,
                buffer_frames,
            },
            handle,
        )
    }

    pub fn stereo_f32(sample_rate: u32) -> (Self, ManualDeviceHandle) {
        Self::new(
            StreamFormat {
                sample_rate,
                channels: 2,
                sample_format: OutputSampleFormat::F32,
            },
            512,
        )
    }
}

impl OutputDevice for ManualOutputDevice {
    fn name(&self) -> String {
        "manual test device".to_string()
    }

    fn stream_format(&self) -> StreamFormat {
        self.inner.lock().unwrap().format
    }

    fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    fn set_stream_format(&mut self, format: StreamFormat) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.render.is_none(), "format change while running");
        inner.format = format;
        Ok(())
    }

    fn start(&mut self, render: RenderFn) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.render = Some(render);
        inner.running = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.inner.lock().unwrap().running = false;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.render.is_some() {
            inner.running = true;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.render = None;
        inner.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    fn poll_format_change(&mut self) -> Option<StreamFormat> {
        let mut inner = self.inner.lock().unwrap();
        let change = inner.pending_change.take();
        if let Some(format) = change {
            inner.format = format;
        }
        change
    }

    fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::SeqCst)
    }
}

impl ManualDeviceHandle {
    /// Invoke the render callback for `frames` frames of f32 output.
    ///
    /// Returns the interleaved samples, or None while the device is not
    /// running.
    pub fn pump(&self, frames: usize) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.running {
            return None;
        }
        let channels = inner.format.channels as usize;
        let render = inner.render.as_mut()?;
        let mut buffer = vec![0.0f32; frames * channels];
        render(RenderTarget::F32(&mut buffer));
        Some(buffer)
    }

    pub fn channels(&self) -> usize {
        self.inner.lock().unwrap().format.channels as usize
    }

    /// Simulate a device-initiated stream format change; delivered at the
    /// engine's next `process_device_events`.
    pub fn trigger_format_change(&self, format: StreamFormat) {
        self.inner.lock().unwrap().pending_change = Some(format);
    }

    /// Simulate a fatal stream error.
    pub fn trigger_error(&self) {
        self.error_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    pub fn is_registered(&self) -> bool {
        self.inner.lock().unwrap().render.is_some()
    }
}

/// Poll `predicate` until true or panic after `timeout`.
pub fn wait_for(timeout: Duration, what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}
