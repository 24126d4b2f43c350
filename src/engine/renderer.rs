//! Render pass executed on the realtime device callback
//!
//! Per invocation: honor mute/seek flags, pull canonical frames from the
//! ring (through the sample-rate converter when the device rate differs),
//! pad shortfall with silence, apply volume in the canonical domain,
//! convert to the stream's sample format directly into the device buffer,
//! then advance per-decoder rendered-frame counters by timestamp-span
//! intersection and post wake signals.
//!
//! Hard rules on this path: no allocation, no locks, no logging, no
//! channel sends. Cross-thread communication is atomics, a preallocated
//! lock-free event queue, and lock-free semaphore posts.

use crate::audio::converter::{OutputConverter, RenderTarget};
use crate::audio::resampler::SincResampler;
use crate::audio::types::CanonicalBuffer;
use crate::config::ACTIVE_DECODER_SLOTS;
use crate::engine::decoder_state::{DecoderFlags, DecoderState, TIMESTAMP_UNSET};
use crate::engine::ring_buffer::RingReader;
use crate::engine::state::{EngineFlags, EngineShared};
use crate::events::RenderEvent;
use ringbuf::{traits::*, HeapProd};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Renderer owned by the device callback closure
pub(crate) struct Renderer {
    shared: Arc<EngineShared>,
    reader: RingReader,
    converter: OutputConverter,
    /// Present when the canonical rate differs from the device rate
    resampler: Option<SincResampler>,
    /// Canonical-domain staging for one callback slice
    scratch: CanonicalBuffer,
    events: HeapProd<RenderEvent>,
    canonical_channels: usize,
    stream_channels: usize,
}

impl Renderer {
    pub fn new(
        shared: Arc<EngineShared>,
        reader: RingReader,
        converter: OutputConverter,
        resampler: Option<SincResampler>,
        canonical_channels: u16,
        stream_channels: u16,
        max_callback_frames: usize,
        events: HeapProd<RenderEvent>,
    ) -> Self {
        Self {
            shared,
            reader,
            converter,
            resampler,
            scratch: CanonicalBuffer::with_capacity(canonical_channels, max_callback_frames),
            events,
            canonical_channels: canonical_channels as usize,
            stream_channels: stream_channels as usize,
        }
    }

    /// Fill one device callback's worth of output.
    pub fn render(&mut self, mut target: RenderTarget<'_>) {
        let shared = Arc::clone(&self.shared);
        shared.stats.passes_started.fetch_add(1, Ordering::Release);

        let requested = target.frames(self.stream_channels);

        if shared.flags.output_muted() {
            shared.flags.set(EngineFlags::MUTE_ACK);
            self.converter.write_silence(&mut target, 0, requested);
            shared.stats.passes_finished.fetch_add(1, Ordering::Release);
            return;
        }

        if shared.src_reset.swap(false, Ordering::AcqRel) {
            if let Some(rs) = self.resampler.as_mut() {
                rs.reset();
            }
        }

        let read_before = self.reader.read_position();
        let mut produced = 0usize;
        while produced < requested {
            let slice = (requested - produced).min(self.scratch.capacity());
            let missing = self.fill_canonical(slice);

            if missing > 0 && self.expecting_audio() {
                shared
                    .stats
                    .underrun_frames
                    .fetch_add(missing as u64, Ordering::Relaxed);
            }

            for ch in 0..self.canonical_channels {
                let gain = shared.volume.gain(ch);
                if gain != 1.0 {
                    self.scratch.apply_gain(ch, gain, slice);
                }
            }

            self.converter
                .convert(&self.scratch, 0, slice, &mut target, produced);
            produced += slice;
        }
        let read_after = self.reader.read_position();

        shared
            .stats
            .frames_rendered_total
            .fetch_add(requested as u64, Ordering::Relaxed);

        self.advance_decoders(read_before as i64, read_after as i64);

        // Ring space was freed; let the decode thread top it up.
        shared.decoder_sem.post();

        shared.stats.passes_finished.fetch_add(1, Ordering::Release);
    }

    /// Stage `slice` canonical frames into scratch, silence-padding any
    /// shortfall. Returns the frame count that had to be padded (ring
    /// frames for the direct path, source frames for the resampled path).
    fn fill_canonical(&mut self, slice: usize) -> usize {
        match self.resampler.as_mut() {
            None => {
                let n = self.reader.read(&mut self.scratch, 0, slice);
                if n < slice {
                    self.scratch.fill_silence(n, slice);
                }
                slice - n
            }
            Some(rs) => {
                let reader = &mut self.reader;
                let mut filled = 0usize;
                let mut missing = 0usize;
                while filled < slice {
                    if rs.available() == 0 {
                        let mut short = 0usize;
                        let result = rs.produce_chunk(|planes, frames| {
                            let got = reader.read_planes(planes, 0, frames);
                            short = frames - got;
                            got
                        });
                        missing += short;
                        if result.is_err() {
                            // Resampler refused the pass; emit silence for
                            // the remainder rather than failing the device.
                            self.scratch.fill_silence(filled, slice);
                            return missing + (slice - filled);
                        }
                    }
                    filled += rs.take_output(&mut self.scratch, filled, slice - filled);
                }
                missing
            }
        }
    }

    /// Whether an active decoder still owes the output audio (an empty
    /// ring is an underrun only then; otherwise it is idle silence).
    fn expecting_audio(&self) -> bool {
        for idx in 0..self.shared.active.slot_count() {
            if let Some(state) = self.shared.active.get(idx) {
                if !state.flags().is_set(DecoderFlags::RENDERING_FINISHED) {
                    return true;
                }
            }
        }
        false
    }

    /// Advance `frames_rendered` across active decoders in timeline order
    /// for the consumed span `[read_before, read_after)`, firing lifecycle
    /// transitions as decoder boundaries are crossed.
    fn advance_decoders(&mut self, read_before: i64, read_after: i64) {
        if read_after == read_before {
            return;
        }

        // Slot snapshot ordered by sequence; fixed-size, no allocation.
        let mut snapshot: [Option<&DecoderState>; ACTIVE_DECODER_SLOTS] =
            [None; ACTIVE_DECODER_SLOTS];
        let mut count = 0usize;
        for idx in 0..self.shared.active.slot_count() {
            if let Some(state) = self.shared.active.get(idx) {
                snapshot[count] = Some(state);
                count += 1;
            }
        }
        // Insertion sort by enqueue sequence
        for i in 1..count {
            let mut j = i;
            while j > 0
                && snapshot[j - 1].unwrap().sequence > snapshot[j].unwrap().sequence
            {
                snapshot.swap(j - 1, j);
                j -= 1;
            }
        }

        for state in snapshot.iter().take(count).flatten() {
            let ts = state.timestamp();
            if ts == TIMESTAMP_UNSET {
                continue;
            }
            let end = ts + state.total_frames() as i64;
            let lo = ts.max(read_before);
            let hi = end.min(read_after);
            if hi <= lo {
                continue;
            }
            let consumed = (hi - lo) as u64;

            if state.flags().test_and_set(DecoderFlags::RENDERING_STARTED) {
                let _ = self.events.try_push(RenderEvent::RenderingStarted(state.id));
            }

            let rendered = state.add_frames_rendered(consumed);
            if rendered >= state.total_frames()
                && state.flags().test_and_set(DecoderFlags::RENDERING_FINISHED)
            {
                let _ = self.events.try_push(RenderEvent::RenderingFinished(state.id));
                self.shared.collector_sem.post();
            }
        }
    }
}
