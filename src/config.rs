//! Engine configuration
//!
//! Tuning parameters for buffering, decode chunking, and bounded waits.
//! All values are fixed at engine construction; changing them requires a
//! new engine instance.

use std::time::Duration;

/// Number of active decoder slots.
///
/// Ceiling on read-ahead depth: decoding for the next queued decoder may
/// begin while up to seven predecessors are still draining through the
/// ring buffer.
pub const ACTIVE_DECODER_SLOTS: usize = 8;

/// Playback engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Requested ring buffer capacity in frames; rounded up to the next
    /// power of two at configuration time (default: 65_536 ≈ 1.5s @ 44.1kHz)
    pub ring_frames: usize,

    /// Frames pulled from a decoder per decode pass (default: 4096)
    pub decode_chunk_frames: usize,

    /// Decode thread semaphore wait; keeps the loop responsive to queue
    /// changes and shutdown (default: 100ms)
    pub decoder_wait: Duration,

    /// Collector thread semaphore wait (default: 250ms)
    pub collector_wait: Duration,

    /// Bound on waiting for the render callback to acknowledge the mute
    /// flag before a seek resets the ring (default: 250ms)
    pub mute_ack_timeout: Duration,

    /// Bound on waiting for a seek to drain and refill (default: 2s)
    pub seek_timeout: Duration,

    /// Bound on waiting for worker threads to observe cancellation during
    /// stop and shutdown (default: 500ms)
    pub stop_timeout: Duration,

    /// Output frames produced per resampler pass (default: 1024)
    pub resampler_chunk_frames: usize,

    /// Largest device callback the renderer's preallocated scratch can
    /// service in one pass; larger callbacks are processed in slices
    /// (default: 4096)
    pub max_callback_frames: usize,

    /// Startup grace period for underrun reporting: ring starvation this
    /// soon after decoding begins is logged at trace instead of warn
    /// (default: 2s)
    pub underrun_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_frames: 65_536,
            decode_chunk_frames: 4096,
            decoder_wait: Duration::from_millis(100),
            collector_wait: Duration::from_millis(250),
            mute_ack_timeout: Duration::from_millis(250),
            seek_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_millis(500),
            resampler_chunk_frames: 1024,
            max_callback_frames: 4096,
            underrun_grace: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Ring capacity rounded up to the next power of two.
    pub fn ring_capacity(&self) -> usize {
        self.ring_frames.max(2).next_power_of_two()
    }
}
