//! Shared engine state
//!
//! Everything the four threads touch in common: the controller-mutex
//! guarded section (decoder queue), atomic engine flags, published volume
//! scalars, observability counters, and the wake semaphores. The render
//! callback reads only the lock-free parts.

use crate::audio::types::{CanonicalFormat, MAX_CHANNELS};
use crate::config::EngineConfig;
use crate::engine::decoder_state::ActiveDecoders;
use crate::engine::ring_buffer::RingWriter;
use crate::engine::semaphore::Semaphore;
use crate::events::RenderEvent;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Engine-level flag bits read by the render callback
pub(crate) struct EngineFlags(AtomicU32);

impl EngineFlags {
    /// A seek is in progress; render silence, leave the ring untouched
    pub const IS_SEEKING: u32 = 1 << 0;
    /// Output muted during ring reset; render silence
    pub const MUTE_OUTPUT: u32 = 1 << 1;
    /// Render callback has observed the mute since it was last set
    pub const MUTE_ACK: u32 = 1 << 2;

    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn set(&self, bit: u32) {
        self.0.fetch_or(bit, Ordering::AcqRel);
    }

    pub fn clear(&self, bit: u32) {
        self.0.fetch_and(!bit, Ordering::AcqRel);
    }

    pub fn is_set(&self, bit: u32) -> bool {
        self.0.load(Ordering::Acquire) & bit != 0
    }

    /// True when the renderer must output silence this pass
    pub fn output_muted(&self) -> bool {
        self.0.load(Ordering::Acquire) & (Self::IS_SEEKING | Self::MUTE_OUTPUT) != 0
    }
}

/// Master and per-channel volume scalars.
///
/// Stored as f64 bit patterns in AtomicU64 so the render callback reads
/// them without locks.
pub struct VolumeControl {
    master: AtomicU64,
    channels: [AtomicU64; MAX_CHANNELS],
}

impl VolumeControl {
    pub fn new() -> Self {
        let unity = 1.0f64.to_bits();
        Self {
            master: AtomicU64::new(unity),
            channels: std::array::from_fn(|_| AtomicU64::new(unity)),
        }
    }

    pub fn master(&self) -> f64 {
        f64::from_bits(self.master.load(Ordering::Relaxed))
    }

    pub fn set_master(&self, volume: f64) {
        self.master
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn channel(&self, ch: usize) -> f64 {
        f64::from_bits(self.channels[ch].load(Ordering::Relaxed))
    }

    pub fn set_channel(&self, ch: usize, volume: f64) {
        self.channels[ch].store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Effective gain for one channel
    pub fn gain(&self, ch: usize) -> f64 {
        self.master() * self.channel(ch)
    }
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Observability counters and render-pass bookkeeping
pub struct EngineStats {
    /// Render passes entered (incremented at callback entry)
    pub(crate) passes_started: AtomicU64,
    /// Render passes completed (incremented at callback exit)
    pub(crate) passes_finished: AtomicU64,
    /// Output frames padded with silence because the ring starved
    pub(crate) underrun_frames: AtomicU64,
    /// Output frames produced across the engine's lifetime
    pub(crate) frames_rendered_total: AtomicU64,
    /// Source frames decoded across the engine's lifetime
    pub(crate) frames_decoded_total: AtomicU64,
    /// Whether the device stream is currently running
    pub(crate) device_running: AtomicBool,
}

impl EngineStats {
    pub(crate) fn new() -> Self {
        Self {
            passes_started: AtomicU64::new(0),
            passes_finished: AtomicU64::new(0),
            underrun_frames: AtomicU64::new(0),
            frames_rendered_total: AtomicU64::new(0),
            frames_decoded_total: AtomicU64::new(0),
            device_running: AtomicBool::new(false),
        }
    }

    pub(crate) fn zero_counters(&self) {
        self.underrun_frames.store(0, Ordering::Relaxed);
        self.frames_rendered_total.store(0, Ordering::Relaxed);
        self.frames_decoded_total.store(0, Ordering::Relaxed);
    }

    /// Block until every render pass that had started before this call has
    /// finished, or `timeout` expires.
    ///
    /// A pass beginning after the caller's state change cannot hold stale
    /// pointers, so "all earlier passes finished" is the reclamation
    /// barrier.
    pub(crate) fn wait_render_quiescent(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let started = self.passes_started.load(Ordering::Acquire);
            let finished = self.passes_finished.load(Ordering::Acquire);
            if finished >= started || !self.device_running.load(Ordering::Acquire) {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

/// Point-in-time statistics snapshot
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub underrun_frames: u64,
    pub frames_rendered_total: u64,
    pub frames_decoded_total: u64,
    pub device_running: bool,
}

/// A decoder waiting in the queue, not yet started
pub(crate) struct QueuedDecoder {
    pub id: Uuid,
    pub decoder: Box<dyn crate::audio::decoder::Decoder>,
}

/// State guarded by the controller mutex.
///
/// Slot pointer dereferences by the controller, decode thread, and
/// collector all happen while holding this lock; the collector frees a
/// state only after unlinking it under this lock and then waiting for
/// render quiescence.
pub(crate) struct Guarded {
    pub queue: VecDeque<QueuedDecoder>,
    pub next_sequence: u64,
}

/// State shared by the controller, decode thread, render callback, and
/// collector. The render callback confines itself to the lock-free
/// fields.
pub(crate) struct EngineShared {
    pub config: EngineConfig,
    pub guarded: Mutex<Guarded>,
    pub active: ActiveDecoders,
    pub flags: EngineFlags,
    pub volume: VolumeControl,
    pub stats: EngineStats,
    pub decoder_sem: Semaphore,
    pub collector_sem: Semaphore,
    pub keep_decoding: AtomicBool,
    pub keep_collecting: AtomicBool,
    /// Producer half of the ring; present while a pipeline is configured
    pub ring_writer: Mutex<Option<RingWriter>>,
    /// Canonical format of the configured pipeline
    pub canonical: Mutex<Option<CanonicalFormat>>,
    /// Renderer requests the resampler history be cleared (post-seek)
    pub src_reset: AtomicBool,
    /// Set by the decode thread when a claimed seek could not be applied;
    /// checked and cleared by the controller after its bounded wait
    pub seek_failed: AtomicBool,
    /// Consumer half of the renderer's lock-free event queue; drained by
    /// the decode thread
    pub render_events: Mutex<Option<ringbuf::HeapCons<RenderEvent>>>,
}

impl EngineShared {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            guarded: Mutex::new(Guarded {
                queue: VecDeque::new(),
                next_sequence: 0,
            }),
            active: ActiveDecoders::new(),
            flags: EngineFlags::new(),
            volume: VolumeControl::new(),
            stats: EngineStats::new(),
            decoder_sem: Semaphore::new(),
            collector_sem: Semaphore::new(),
            keep_decoding: AtomicBool::new(true),
            keep_collecting: AtomicBool::new(true),
            ring_writer: Mutex::new(None),
            canonical: Mutex::new(None),
            src_reset: AtomicBool::new(false),
            seek_failed: AtomicBool::new(false),
            render_events: Mutex::new(None),
        }
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            underrun_frames: self.stats.underrun_frames.load(Ordering::Relaxed),
            frames_rendered_total: self.stats.frames_rendered_total.load(Ordering::Relaxed),
            frames_decoded_total: self.stats.frames_decoded_total.load(Ordering::Relaxed),
            device_running: self.stats.device_running.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_set_clear() {
        let flags = EngineFlags::new();
        assert!(!flags.is_set(EngineFlags::MUTE_OUTPUT));

        flags.set(EngineFlags::MUTE_OUTPUT);
        assert!(flags.is_set(EngineFlags::MUTE_OUTPUT));
        assert!(flags.output_muted());

        flags.set(EngineFlags::MUTE_ACK);
        flags.clear(EngineFlags::MUTE_OUTPUT);
        assert!(!flags.output_muted());
        assert!(flags.is_set(EngineFlags::MUTE_ACK));
    }

    #[test]
    fn test_seeking_mutes_output() {
        let flags = EngineFlags::new();
        flags.set(EngineFlags::IS_SEEKING);
        assert!(flags.output_muted());
    }

    #[test]
    fn test_volume_clamping_and_gain() {
        let volume = VolumeControl::new();
        assert_eq!(volume.master(), 1.0);
        assert_eq!(volume.gain(3), 1.0);

        volume.set_master(1.5);
        assert_eq!(volume.master(), 1.0);

        volume.set_master(0.5);
        volume.set_channel(0, 0.5);
        assert_eq!(volume.gain(0), 0.25);
        assert_eq!(volume.gain(1), 0.5);

        volume.set_channel(1, -0.5);
        assert_eq!(volume.channel(1), 0.0);
    }

    #[test]
    fn test_render_quiescence_when_device_stopped() {
        let stats = EngineStats::new();
        stats.passes_started.store(5, Ordering::Relaxed);
        stats.passes_finished.store(4, Ordering::Relaxed);
        // Device not running: a pass cannot be in flight.
        assert!(stats.wait_render_quiescent(std::time::Duration::from_millis(10)));

        stats.device_running.store(true, Ordering::Relaxed);
        assert!(!stats.wait_render_quiescent(std::time::Duration::from_millis(10)));

        stats.passes_finished.store(5, Ordering::Relaxed);
        assert!(stats.wait_render_quiescent(std::time::Duration::from_millis(10)));
    }
}
