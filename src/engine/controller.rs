//! Playback controller
//!
//! The public control surface. Orchestrates the decode, render, and
//! collector sides: owns the output device, builds the pipeline (ring
//! buffer, resampler, output converter, renderer) when the first decoder
//! arrives, serializes all state transitions, and wakes the worker
//! threads. Operations are `&mut self`, so the controller never runs
//! concurrently with itself.

use crate::audio::converter::OutputConverter;
use crate::audio::decoder::Decoder;
use crate::audio::device::{CpalOutputDevice, OutputDevice, RenderFn, StreamFormat};
use crate::audio::resampler::SincResampler;
use crate::audio::types::{CanonicalFormat, MAX_CHANNELS};
use crate::config::EngineConfig;
use crate::engine::collector;
use crate::engine::decoder_state::DecoderFlags;
use crate::engine::renderer::Renderer;
use crate::engine::ring_buffer::FrameRing;
use crate::engine::state::{EngineFlags, EngineShared, Guarded, QueuedDecoder, StatsSnapshot};
use crate::engine::worker;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, RenderEvent};
use ringbuf::{traits::Split, HeapRb};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::{Arc, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of the renderer's lock-free event queue
const RENDER_EVENT_QUEUE: usize = 64;

/// Gapless playback engine.
///
/// Enqueued decoders play back-to-back with sample accuracy; the decode
/// thread keeps a lock-free ring buffer fed, the device's realtime
/// callback drains it through sample-rate and format conversion, and a
/// collector thread retires spent decoders off the realtime path.
pub struct PlaybackEngine {
    shared: Arc<EngineShared>,
    device: Box<dyn OutputDevice>,
    decoder_thread: Option<JoinHandle<()>>,
    collector_thread: Option<JoinHandle<()>>,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: Option<mpsc::Receiver<EngineEvent>>,
    /// Built at pipeline configuration; consumed when the stream starts
    renderer: Option<Renderer>,
    playing: bool,
    stream_started: bool,
}

impl PlaybackEngine {
    /// Create an engine driving the given output device.
    pub fn new(device: Box<dyn OutputDevice>, config: EngineConfig) -> Result<Self> {
        let shared = Arc::new(EngineShared::new(config));
        let (events_tx, events_rx) = mpsc::channel();

        let worker_shared = Arc::clone(&shared);
        let worker_events = events_tx.clone();
        let decoder_thread = std::thread::spawn(move || worker::run(worker_shared, worker_events));

        let collector_shared = Arc::clone(&shared);
        let collector_thread = std::thread::spawn(move || collector::run(collector_shared));

        info!("Playback engine created on device '{}'", device.name());

        Ok(Self {
            shared,
            device,
            decoder_thread: Some(decoder_thread),
            collector_thread: Some(collector_thread),
            events_tx,
            events_rx: Some(events_rx),
            renderer: None,
            playing: false,
            stream_started: false,
        })
    }

    /// Create an engine on the default output device.
    pub fn with_default_device(config: EngineConfig) -> Result<Self> {
        let device = CpalOutputDevice::open(None, None)?;
        Self::new(Box::new(device), config)
    }

    /// Take the engine's event receiver. Available once.
    pub fn events(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.events_rx.take()
    }

    // ========================================
    // Playback control

    /// Start (or resume) playback. Idempotent.
    pub fn play(&mut self) -> Result<()> {
        self.process_device_events()?;

        if self.playing && self.device.is_running() {
            return Ok(());
        }
        self.playing = true;

        if self.stream_started {
            self.device.resume()?;
            self.shared.stats.device_running.store(true, Ordering::Release);
        } else if self.renderer.is_some() {
            self.start_stream()?;
        }
        // With nothing configured yet, the stream starts on first enqueue.
        Ok(())
    }

    /// Suspend the device callback; all state is preserved. Idempotent.
    pub fn pause(&mut self) -> Result<()> {
        if !self.playing && !self.device.is_running() {
            return Ok(());
        }
        self.playing = false;
        if self.stream_started {
            self.device.pause()?;
        }
        self.shared.stats.device_running.store(false, Ordering::Release);
        Ok(())
    }

    /// Toggle between play and pause.
    pub fn play_pause(&mut self) -> Result<()> {
        if self.is_playing() {
            self.pause()
        } else {
            self.play()
        }
    }

    /// Stop playback: cancel and retire all decoders, unregister the
    /// device callback, reset the ring, and zero the counters.
    pub fn stop(&mut self) -> Result<()> {
        info!("Stopping playback");
        self.playing = false;

        {
            let mut guarded = self.lock_guarded()?;
            guarded.queue.clear();
            for idx in 0..self.shared.active.slot_count() {
                if let Some(state) = self.shared.active.get(idx) {
                    state.flags().test_and_set(DecoderFlags::CANCEL_DECODING);
                }
            }
        }
        self.shared.flags.set(EngineFlags::MUTE_OUTPUT);
        self.shared.decoder_sem.notify();

        // Bounded wait for the decode thread to observe cancellation.
        let observed = self.wait_until(self.shared.config.stop_timeout, || {
            let _guard = self.lock_guarded()?;
            for idx in 0..self.shared.active.slot_count() {
                if let Some(state) = self.shared.active.get(idx) {
                    if !state.flags().is_set(DecoderFlags::DECODING_FINISHED) {
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        })?;
        if !observed {
            warn!("Decode thread did not observe cancellation in time");
        }

        if self.stream_started {
            if let Err(e) = self.device.stop() {
                warn!("Device stop failed during engine stop: {e}");
            }
            self.stream_started = false;
        }
        self.shared.stats.device_running.store(false, Ordering::Release);

        // Stream gone, render side quiescent: close out the rendering axis
        // so the collector can reap everything.
        {
            let _guard = self.lock_guarded()?;
            for idx in 0..self.shared.active.slot_count() {
                if let Some(state) = self.shared.active.get(idx) {
                    state.clamp_total_to_decoded();
                    state.flags().test_and_set(DecoderFlags::RENDERING_FINISHED);
                    state.flags().test_and_set(DecoderFlags::DECODING_FINISHED);
                }
            }
        }
        self.shared.collector_sem.notify();

        let drained = self.wait_until(self.shared.config.stop_timeout, || {
            Ok(self.shared.active.is_empty())
        })?;

        self.unconfigure_pipeline()?;
        self.shared.stats.zero_counters();
        self.shared.flags.clear(EngineFlags::MUTE_OUTPUT);
        self.shared.flags.clear(EngineFlags::IS_SEEKING);
        self.shared.seek_failed.store(false, Ordering::Release);

        if !drained {
            return Err(Error::Timeout("active decoders to drain on stop"));
        }
        Ok(())
    }

    /// Whether playback is active (or would be, once audio is queued)
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    // ========================================
    // Queue management

    /// Append a decoder to the playback queue; the engine takes ownership.
    ///
    /// Fails with `FormatUnsupported` when the decoder cannot be carried
    /// by the active pipeline configuration; a failed enqueue leaves the
    /// engine unchanged.
    pub fn enqueue(&mut self, decoder: Box<dyn Decoder>) -> Result<Uuid> {
        self.process_device_events()?;

        let format = decoder.source_format();
        if format.channels == 0 || format.sample_rate == 0 {
            return Err(Error::InvalidArgument(
                "decoder reports an empty format".to_string(),
            ));
        }
        if decoder.total_frames() == 0 {
            return Err(Error::InvalidArgument(
                "decoder reports zero frames".to_string(),
            ));
        }
        if format.channels as usize > MAX_CHANNELS {
            return Err(Error::FormatUnsupported(format!(
                "{} channels exceeds the supported maximum",
                format.channels
            )));
        }

        let active_format = *self
            .shared
            .canonical
            .lock()
            .map_err(|_| Error::poisoned("canonical format"))?;

        match active_format {
            Some(canonical) => {
                if format.channels > canonical.channels {
                    return Err(Error::FormatUnsupported(format!(
                        "decoder has {} channels, pipeline is configured for {}",
                        format.channels, canonical.channels
                    )));
                }
                if format.sample_rate != canonical.sample_rate {
                    return Err(Error::FormatUnsupported(format!(
                        "decoder is {} Hz, pipeline is configured for {} Hz",
                        format.sample_rate, canonical.sample_rate
                    )));
                }
            }
            None => {
                let stream = self.device.stream_format();
                if format.channels > stream.channels {
                    return Err(Error::FormatUnsupported(format!(
                        "decoder has {} channels, device stream has {}",
                        format.channels, stream.channels
                    )));
                }
                self.configure_pipeline(CanonicalFormat {
                    channels: stream.channels,
                    sample_rate: format.sample_rate,
                })?;
            }
        }

        // Arrange device output before committing the decoder so a start
        // failure leaves the engine unchanged.
        if self.playing && !self.stream_started {
            if let Err(e) = self.start_stream() {
                self.maybe_unconfigure_idle();
                return Err(e);
            }
        }

        let id = Uuid::new_v4();
        {
            let mut guarded = self.lock_guarded()?;
            guarded.queue.push_back(QueuedDecoder { id, decoder });
        }
        self.shared.decoder_sem.notify();

        debug!("Enqueued decoder {id}");
        Ok(id)
    }

    /// Open an audio file with the shipped symphonia decoder and enqueue
    /// it.
    pub fn enqueue_file<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<Uuid> {
        let decoder = crate::audio::decoder::SymphoniaDecoder::open(path)?;
        self.enqueue(Box::new(decoder))
    }

    /// Drop all queued decoders that have not yet started decoding.
    pub fn clear_queue(&mut self) -> Result<()> {
        let mut guarded = self.lock_guarded()?;
        let dropped = guarded.queue.len();
        guarded.queue.clear();
        debug!("Cleared {dropped} queued decoders");
        Ok(())
    }

    // ========================================
    // Seeking

    /// Seek the current decoder to an absolute frame.
    ///
    /// Returns once the ring has been flushed and refilled past the
    /// target; a failed seek leaves the position unchanged.
    pub fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
        {
            let _guard = self.lock_guarded()?;
            let state = self
                .shared
                .active
                .current_rendering()
                .ok_or(Error::NotPlaying)?;
            if !state.supports_seeking()? {
                return Err(Error::SeekUnsupported);
            }
            if frame >= state.total_frames() {
                return Err(Error::InvalidArgument(format!(
                    "seek target {frame} beyond total {}",
                    state.total_frames()
                )));
            }

            self.shared.seek_failed.store(false, Ordering::Release);
            self.shared.flags.set(EngineFlags::IS_SEEKING);
            state.request_seek(frame);
        }
        self.shared.decoder_sem.notify();

        let done = self.wait_until(self.shared.config.seek_timeout, || {
            Ok(!self.shared.flags.is_set(EngineFlags::IS_SEEKING))
        })?;
        if !done {
            self.shared.flags.clear(EngineFlags::IS_SEEKING);
            return Err(Error::Timeout("seek to drain and refill"));
        }
        if self.shared.seek_failed.swap(false, Ordering::AcqRel) {
            return Err(Error::DecoderFailed("seek could not be applied".to_string()));
        }
        Ok(())
    }

    /// Seek to a time in seconds on the current decoder.
    pub fn seek_to_time(&mut self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(Error::InvalidArgument(format!("bad seek time {seconds}")));
        }
        let rate = self.canonical_rate()?;
        self.seek_to_frame((seconds * f64::from(rate)) as u64)
    }

    /// Skip forward by `seconds` (default 3 via [`Self::seek_forward_default`]).
    pub fn seek_forward(&mut self, seconds: f64) -> Result<()> {
        let rate = self.canonical_rate()?;
        let skip = (seconds * f64::from(rate)) as u64;
        let current = self.current_frame()?;
        let total = self.total_frames()?;
        let target = current
            .saturating_add(skip)
            .min(total.saturating_sub(1));
        self.seek_to_frame(target)
    }

    /// Skip forward by the conventional 3 seconds.
    pub fn seek_forward_default(&mut self) -> Result<()> {
        self.seek_forward(3.0)
    }

    /// Skip backward by `seconds`.
    pub fn seek_backward(&mut self, seconds: f64) -> Result<()> {
        let rate = self.canonical_rate()?;
        let skip = (seconds * f64::from(rate)) as u64;
        let current = self.current_frame()?;
        self.seek_to_frame(current.saturating_sub(skip))
    }

    /// Skip backward by the conventional 3 seconds.
    pub fn seek_backward_default(&mut self) -> Result<()> {
        self.seek_backward(3.0)
    }

    /// Whether the current decoder supports seeking
    pub fn supports_seeking(&self) -> Result<bool> {
        let _guard = self.lock_guarded()?;
        match self.shared.active.current_rendering() {
            Some(state) => state.supports_seeking(),
            None => Ok(false),
        }
    }

    // ========================================
    // Position queries

    /// Frame position within the current decoder
    pub fn current_frame(&self) -> Result<u64> {
        let _guard = self.lock_guarded()?;
        Ok(self
            .shared
            .active
            .current_rendering()
            .map_or(0, |s| s.frames_rendered()))
    }

    /// Total frames of the current decoder
    pub fn total_frames(&self) -> Result<u64> {
        let _guard = self.lock_guarded()?;
        Ok(self
            .shared
            .active
            .current_rendering()
            .map_or(0, |s| s.total_frames()))
    }

    /// Frames left in the current decoder
    pub fn remaining_frames(&self) -> Result<u64> {
        let _guard = self.lock_guarded()?;
        Ok(self
            .shared
            .active
            .current_rendering()
            .map_or(0, |s| s.total_frames().saturating_sub(s.frames_rendered())))
    }

    /// Position within the current decoder, in seconds
    pub fn current_time(&self) -> Result<f64> {
        Ok(self.current_frame()? as f64 / f64::from(self.canonical_rate()?))
    }

    /// Duration of the current decoder, in seconds
    pub fn total_time(&self) -> Result<f64> {
        Ok(self.total_frames()? as f64 / f64::from(self.canonical_rate()?))
    }

    /// Time left in the current decoder, in seconds
    pub fn remaining_time(&self) -> Result<f64> {
        Ok(self.remaining_frames()? as f64 / f64::from(self.canonical_rate()?))
    }

    /// Location of the currently playing decoder's resource
    pub fn playing_uri(&self) -> Result<Option<String>> {
        let _guard = self.lock_guarded()?;
        Ok(self
            .shared
            .active
            .current_rendering()
            .and_then(|s| s.uri()))
    }

    /// Observability counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats_snapshot()
    }

    // ========================================
    // Volume

    pub fn master_volume(&self) -> f64 {
        self.shared.volume.master()
    }

    pub fn set_master_volume(&mut self, volume: f64) -> Result<()> {
        if !volume.is_finite() {
            return Err(Error::InvalidArgument(format!("bad volume {volume}")));
        }
        self.shared.volume.set_master(volume);
        debug!("Master volume set to {:.2}", self.shared.volume.master());
        Ok(())
    }

    pub fn channel_volume(&self, channel: u16) -> Result<f64> {
        if channel as usize >= MAX_CHANNELS {
            return Err(Error::InvalidArgument(format!("bad channel {channel}")));
        }
        Ok(self.shared.volume.channel(channel as usize))
    }

    pub fn set_channel_volume(&mut self, channel: u16, volume: f64) -> Result<()> {
        if channel as usize >= MAX_CHANNELS {
            return Err(Error::InvalidArgument(format!("bad channel {channel}")));
        }
        if !volume.is_finite() {
            return Err(Error::InvalidArgument(format!("bad volume {volume}")));
        }
        self.shared.volume.set_channel(channel as usize, volume);
        Ok(())
    }

    // ========================================
    // Device and stream management

    /// Name of the current output device
    pub fn output_device_name(&self) -> String {
        self.device.name()
    }

    /// Currently negotiated stream format
    pub fn output_stream_format(&self) -> StreamFormat {
        self.device.stream_format()
    }

    /// Switch to a different output device, rebuilding the converter
    /// chain; rolls back to the prior device if the new one cannot carry
    /// the pipeline.
    pub fn set_output_device(&mut self, new_device: Box<dyn OutputDevice>) -> Result<()> {
        let was_running = self.stream_started && self.playing;
        info!(
            "Switching output device: '{}' -> '{}'",
            self.device.name(),
            new_device.name()
        );

        self.halt_stream()?;
        let old_device = std::mem::replace(&mut self.device, new_device);

        match self.rebuild_pipeline() {
            Ok(()) => {
                if was_running {
                    if let Err(e) = self.start_stream() {
                        warn!("New device failed to start: {e}; rolling back");
                        self.device = old_device;
                        self.rebuild_pipeline()?;
                        self.start_stream()?;
                        return Err(e);
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!("Pipeline rebuild failed on new device: {e}; rolling back");
                self.device = old_device;
                self.rebuild_pipeline()?;
                if was_running {
                    self.start_stream()?;
                }
                Err(e)
            }
        }
    }

    /// Switch to an output device by name (default device when `None`).
    pub fn set_output_device_by_name(&mut self, name: Option<&str>) -> Result<()> {
        let device = CpalOutputDevice::open(name, None)?;
        self.set_output_device(Box::new(device))
    }

    /// Renegotiate the output stream format, rebuilding the converter
    /// chain; rolls back on failure.
    pub fn set_output_stream_format(&mut self, format: StreamFormat) -> Result<()> {
        let was_running = self.stream_started && self.playing;
        let previous = self.device.stream_format();

        self.halt_stream()?;

        if let Err(e) = self.device.set_stream_format(format) {
            let _ = self.device.set_stream_format(previous);
            self.rebuild_pipeline()?;
            if was_running {
                self.start_stream()?;
            }
            return Err(e);
        }

        self.rebuild_pipeline()?;
        if was_running {
            self.start_stream()?;
        }
        Ok(())
    }

    /// Acquire or release exclusive device access (hog mode)
    pub fn set_exclusive(&mut self, exclusive: bool) -> Result<()> {
        self.device.set_exclusive(exclusive)
    }

    /// Service device-side notifications: stream errors stop the engine
    /// and emit `PlaybackInterrupted`; device-initiated format changes
    /// rebuild the converter chain.
    ///
    /// Called internally by control operations; hosts integrating a
    /// notification-driven backend call it when the backend signals.
    pub fn process_device_events(&mut self) -> Result<()> {
        if self.device.has_error() {
            warn!("Output device reported a stream error; stopping");
            let _ = self.events_tx.send(EngineEvent::PlaybackInterrupted);
            self.stop()?;
            return Err(Error::DeviceUnavailable(
                "output stream failed".to_string(),
            ));
        }

        if let Some(format) = self.device.poll_format_change() {
            info!(
                "Device stream format changed: {}Hz/{}ch/{:?}",
                format.sample_rate, format.channels, format.sample_format
            );
            let was_running = self.stream_started && self.playing;
            self.halt_stream()?;
            self.rebuild_pipeline()?;
            if was_running {
                self.start_stream()?;
            }
        }
        Ok(())
    }

    // ========================================
    // Pipeline plumbing

    fn lock_guarded(&self) -> Result<MutexGuard<'_, Guarded>> {
        self.shared
            .guarded
            .lock()
            .map_err(|_| Error::poisoned("controller state"))
    }

    fn canonical_rate(&self) -> Result<u32> {
        let canonical = self
            .shared
            .canonical
            .lock()
            .map_err(|_| Error::poisoned("canonical format"))?;
        Ok(canonical.map_or(44_100, |c| c.sample_rate))
    }

    /// Poll `predicate` until true or `timeout` elapses.
    fn wait_until(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut() -> Result<bool>,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Build the ring, converters, and renderer for a canonical format.
    fn configure_pipeline(&mut self, canonical: CanonicalFormat) -> Result<()> {
        let stream = self.device.stream_format();
        info!(
            "Configuring pipeline: canonical {}Hz/{}ch, stream {}Hz/{}ch/{:?}",
            canonical.sample_rate,
            canonical.channels,
            stream.sample_rate,
            stream.channels,
            stream.sample_format
        );

        let resampler = self.build_resampler(canonical, stream)?;
        let converter = OutputConverter::new(stream.channels);

        let ring = FrameRing::new(canonical.channels, self.shared.config.ring_capacity());
        let (writer, reader) = ring.split();

        let (events_prod, events_cons) = HeapRb::<RenderEvent>::new(RENDER_EVENT_QUEUE).split();

        *self
            .shared
            .ring_writer
            .lock()
            .map_err(|_| Error::poisoned("ring writer"))? = Some(writer);
        *self
            .shared
            .canonical
            .lock()
            .map_err(|_| Error::poisoned("canonical format"))? = Some(canonical);
        *self
            .shared
            .render_events
            .lock()
            .map_err(|_| Error::poisoned("render events"))? = Some(events_cons);

        self.renderer = Some(Renderer::new(
            Arc::clone(&self.shared),
            reader,
            converter,
            resampler,
            canonical.channels,
            stream.channels,
            self.shared.config.max_callback_frames,
            events_prod,
        ));
        Ok(())
    }

    fn build_resampler(
        &self,
        canonical: CanonicalFormat,
        stream: StreamFormat,
    ) -> Result<Option<SincResampler>> {
        if stream.sample_rate == canonical.sample_rate {
            return Ok(None);
        }
        SincResampler::new(
            canonical.sample_rate,
            stream.sample_rate,
            canonical.channels,
            self.shared.config.resampler_chunk_frames,
        )
        .map(Some)
    }

    /// Rebuild the ring and renderer against the current device stream
    /// while preserving the source position of every active decoder. The
    /// canonical format is unchanged (fixed per configuration); only the
    /// rate/format adaptation is rebuilt.
    ///
    /// Precondition: the stream is halted.
    fn rebuild_pipeline(&mut self) -> Result<()> {
        let Some(canonical) = *self
            .shared
            .canonical
            .lock()
            .map_err(|_| Error::poisoned("canonical format"))?
        else {
            // Nothing configured; nothing to rebuild.
            return Ok(());
        };

        let stream = self.device.stream_format();
        let resampler = self.build_resampler(canonical, stream)?;
        let converter = OutputConverter::new(stream.channels);

        let ring = FrameRing::new(canonical.channels, self.shared.config.ring_capacity());
        let (writer, reader) = ring.split();
        let (events_prod, events_cons) = HeapRb::<RenderEvent>::new(RENDER_EVENT_QUEUE).split();

        {
            let _guard = self.lock_guarded()?;

            *self
                .shared
                .ring_writer
                .lock()
                .map_err(|_| Error::poisoned("ring writer"))? = Some(writer);
            self.shared.src_reset.store(true, Ordering::Release);

            // Resume the current decoder from the frame the listener last
            // heard; read-ahead decoders restart from their beginning.
            if let Some(state) = self.shared.active.current_rendering() {
                let position = state.frames_rendered();
                let seek_ok = state.supports_seeking().unwrap_or(false)
                    && state.apply_seek(position).is_ok();
                if !seek_ok {
                    // Frames buffered beyond the decoder's position are
                    // lost; playback resumes where decoding left off.
                    state.resync_after_reset();
                }
                let current_sequence = state.sequence;
                for idx in 0..self.shared.active.slot_count() {
                    if let Some(other) = self.shared.active.get(idx) {
                        if other.sequence > current_sequence {
                            if let Err(e) = other.rewind_for_restart() {
                                warn!("Rewinding decoder {} failed: {e}", other.id);
                            }
                        }
                    }
                }
            }

            *self
                .shared
                .render_events
                .lock()
                .map_err(|_| Error::poisoned("render events"))? = Some(events_cons);
        }

        self.renderer = Some(Renderer::new(
            Arc::clone(&self.shared),
            reader,
            converter,
            resampler,
            canonical.channels,
            stream.channels,
            self.shared.config.max_callback_frames,
            events_prod,
        ));

        self.shared.decoder_sem.notify();
        Ok(())
    }

    /// Tear down the pipeline (stop path).
    fn unconfigure_pipeline(&mut self) -> Result<()> {
        *self
            .shared
            .ring_writer
            .lock()
            .map_err(|_| Error::poisoned("ring writer"))? = None;
        *self
            .shared
            .canonical
            .lock()
            .map_err(|_| Error::poisoned("canonical format"))? = None;
        *self
            .shared
            .render_events
            .lock()
            .map_err(|_| Error::poisoned("render events"))? = None;
        self.renderer = None;
        Ok(())
    }

    /// Drop a pipeline that was configured in this same operation and has
    /// no decoders yet (enqueue rollback).
    fn maybe_unconfigure_idle(&mut self) {
        let idle = self
            .lock_guarded()
            .map(|g| g.queue.is_empty() && self.shared.active.is_empty())
            .unwrap_or(false);
        if idle {
            let _ = self.unconfigure_pipeline();
        }
    }

    /// Hand the renderer to the device and start callbacks.
    fn start_stream(&mut self) -> Result<()> {
        let Some(mut renderer) = self.renderer.take() else {
            return Err(Error::FatalInternal(
                "no renderer available to start".to_string(),
            ));
        };

        let render_fn: RenderFn = Box::new(move |target| renderer.render(target));
        self.device.start(render_fn)?;
        self.stream_started = true;
        self.shared.stats.device_running.store(true, Ordering::Release);
        Ok(())
    }

    /// Fully stop the stream (unregisters the callback and releases the
    /// renderer it owns).
    fn halt_stream(&mut self) -> Result<()> {
        if self.stream_started {
            self.device.stop()?;
            self.stream_started = false;
        }
        self.shared.stats.device_running.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.shared.keep_decoding.store(false, Ordering::Release);
        self.shared.keep_collecting.store(false, Ordering::Release);
        self.shared.decoder_sem.notify();
        self.shared.collector_sem.notify();

        let _ = self.device.stop();
        self.shared.stats.device_running.store(false, Ordering::Release);

        if let Some(handle) = self.decoder_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.collector_thread.take() {
            let _ = handle.join();
        }
    }
}
