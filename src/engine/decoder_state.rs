//! Per-decoder state and the active slot array
//!
//! A `DecoderState` is a passive record: the decode thread advances
//! `frames_decoded`, the render callback advances `frames_rendered`, the
//! collector tears the record down once both finished flags are set. All
//! counters that cross threads are atomic; the decoder handle and its
//! conversion scratch sit behind a mutex that only the decode thread and
//! collector touch.
//!
//! `ActiveDecoders` is a fixed array of atomic slot pointers. Slots are
//! claimed by compare-and-swap from empty by the decode thread and
//! cleared by the collector; the fixed size keeps the claim lock-free and
//! the render path allocation-free.

use crate::audio::decoder::{convert_to_canonical, Decoder, SourceBuffer};
use crate::audio::types::{CanonicalBuffer, SourceFormat};
use crate::config::ACTIVE_DECODER_SLOTS;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Sentinel: no seek requested
pub const SEEK_NONE: u64 = u64::MAX;

/// Sentinel: decoder has not yet written to the ring timeline
pub const TIMESTAMP_UNSET: i64 = i64::MAX;

/// Atomic lifecycle flag bitset with test-and-set semantics
pub struct DecoderFlags(AtomicU32);

impl DecoderFlags {
    pub const DECODING_STARTED: u32 = 1 << 0;
    pub const DECODING_FINISHED: u32 = 1 << 1;
    pub const RENDERING_STARTED: u32 = 1 << 2;
    pub const RENDERING_FINISHED: u32 = 1 << 3;
    pub const CANCEL_DECODING: u32 = 1 << 4;

    fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Set `bit`; returns true if this call made the transition
    pub fn test_and_set(&self, bit: u32) -> bool {
        self.0.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    pub fn clear(&self, bit: u32) {
        self.0.fetch_and(!bit, Ordering::AcqRel);
    }

    pub fn is_set(&self, bit: u32) -> bool {
        self.0.load(Ordering::Acquire) & bit != 0
    }
}

/// Decode-thread-side mutable half: the decoder handle plus conversion
/// scratch sized for one decode chunk.
pub(crate) struct DecodeSide {
    pub decoder: Option<Box<dyn Decoder>>,
    pub source_buf: SourceBuffer,
    pub chunk: CanonicalBuffer,
}

impl std::fmt::Debug for DecoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderState")
            .field("id", &self.id)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Per-decoder record shared across the engine's threads
pub struct DecoderState {
    pub id: Uuid,
    /// Monotonic enqueue order; the stable ordering key across seeks
    pub sequence: u64,
    source_format: SourceFormat,
    /// Source length in frames; clamped down to `frames_decoded` when the
    /// decoder finishes early (error, cancellation, truncated source) so
    /// the renderer's completion check still converges
    total_frames: AtomicU64,
    /// Source frames pulled from the decoder (decode thread writes)
    frames_decoded: AtomicU64,
    /// This decoder's frames consumed by the render callback
    frames_rendered: AtomicU64,
    /// Ring-timeline offset of this decoder's first frame; negative after
    /// a seek (the consumed span counts from the seek target)
    timestamp: AtomicI64,
    flags: DecoderFlags,
    seek_request: AtomicU64,
    decode_side: Mutex<DecodeSide>,
}

impl DecoderState {
    pub(crate) fn new(
        id: Uuid,
        sequence: u64,
        decoder: Box<dyn Decoder>,
        canonical_channels: u16,
        chunk_frames: usize,
    ) -> Self {
        let source_format = decoder.source_format();
        let total_frames = decoder.total_frames();

        Self {
            id,
            sequence,
            source_format,
            total_frames: AtomicU64::new(total_frames),
            frames_decoded: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            timestamp: AtomicI64::new(TIMESTAMP_UNSET),
            flags: DecoderFlags::new(),
            seek_request: AtomicU64::new(SEEK_NONE),
            decode_side: Mutex::new(DecodeSide {
                source_buf: decoder.make_buffer(chunk_frames),
                chunk: CanonicalBuffer::with_capacity(canonical_channels, chunk_frames),
                decoder: Some(decoder),
            }),
        }
    }

    pub fn source_format(&self) -> SourceFormat {
        self.source_format
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Acquire)
    }

    /// Clamp the effective length to what was actually decoded.
    ///
    /// Called when decoding finishes short of the reported length; without
    /// this the renderer would wait forever for frames that will never
    /// arrive.
    pub(crate) fn clamp_total_to_decoded(&self) {
        let decoded = self.frames_decoded();
        if decoded < self.total_frames() {
            self.total_frames.store(decoded, Ordering::Release);
        }
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Acquire)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    pub(crate) fn add_frames_rendered(&self, frames: u64) -> u64 {
        self.frames_rendered.fetch_add(frames, Ordering::AcqRel) + frames
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp.load(Ordering::Acquire)
    }

    pub(crate) fn set_timestamp(&self, ts: i64) {
        self.timestamp.store(ts, Ordering::Release);
    }

    pub fn flags(&self) -> &DecoderFlags {
        &self.flags
    }

    /// Post a seek target; claimed by the decode thread
    pub(crate) fn request_seek(&self, frame: u64) {
        self.seek_request.store(frame, Ordering::Release);
    }

    /// Claim a pending seek request, if any
    pub(crate) fn take_seek_request(&self) -> Option<u64> {
        match self.seek_request.swap(SEEK_NONE, Ordering::AcqRel) {
            SEEK_NONE => None,
            frame => Some(frame),
        }
    }

    pub(crate) fn has_seek_request(&self) -> bool {
        self.seek_request.load(Ordering::Acquire) != SEEK_NONE
    }

    pub(crate) fn decode_side(&self) -> Result<MutexGuard<'_, DecodeSide>> {
        self.decode_side
            .lock()
            .map_err(|_| Error::poisoned("decoder state"))
    }

    /// Whether the underlying decoder supports seeking
    pub fn supports_seeking(&self) -> Result<bool> {
        let side = self.decode_side()?;
        Ok(side.decoder.as_ref().is_some_and(|d| d.supports_seeking()))
    }

    /// Reposition the underlying decoder and reset decode counters.
    ///
    /// Ring-timeline bookkeeping: after the accompanying ring reset the
    /// consumed span restarts at zero, so the timestamp becomes the
    /// negated seek target and `frames_rendered` is pre-set to it; the
    /// renderer's span intersection then continues to count correctly.
    pub(crate) fn apply_seek(&self, frame: u64) -> Result<u64> {
        let mut side = self.decode_side()?;
        let decoder = side
            .decoder
            .as_mut()
            .ok_or_else(|| Error::FatalInternal("decoder already detached".to_string()))?;

        let reached = decoder.seek_to_frame(frame)?;
        self.frames_decoded.store(reached, Ordering::Release);
        self.frames_rendered.store(reached, Ordering::Release);
        self.timestamp
            .store(-(reached as i64), Ordering::Release);

        debug!(
            "Decoder {} repositioned to frame {} (requested {})",
            self.id, reached, frame
        );
        Ok(reached)
    }

    /// Rebase the render timeline after a ring reset when the decoder
    /// itself could not be repositioned: rendering resumes at whatever the
    /// decoder produces next.
    pub(crate) fn resync_after_reset(&self) {
        let decoded = self.frames_decoded();
        self.frames_rendered.store(decoded, Ordering::Release);
        self.timestamp.store(-(decoded as i64), Ordering::Release);
    }

    /// Rewind a read-ahead decoder whose buffered frames were destroyed by
    /// a ring reset; it will be re-decoded from the start.
    pub(crate) fn rewind_for_restart(&self) -> Result<()> {
        let mut side = self.decode_side()?;
        if let Some(decoder) = side.decoder.as_mut() {
            if decoder.supports_seeking() {
                decoder.seek_to_frame(0)?;
            }
            let resume = decoder.current_frame();
            self.frames_decoded.store(resume, Ordering::Release);
            self.frames_rendered.store(resume, Ordering::Release);
        }
        self.timestamp.store(TIMESTAMP_UNSET, Ordering::Release);
        self.flags.clear(DecoderFlags::DECODING_FINISHED);
        Ok(())
    }

    /// Pull one chunk from the decoder and convert it to canonical form.
    ///
    /// Returns the frame count staged in the chunk scratch (0 at EOF).
    /// Mono sources are duplicated across all canonical channels; other
    /// narrow sources pad the remaining channels with silence.
    pub(crate) fn decode_chunk(&self, max_frames: usize) -> Result<usize> {
        let mut side = self.decode_side()?;
        let side = &mut *side;
        let decoder = side
            .decoder
            .as_mut()
            .ok_or_else(|| Error::FatalInternal("decoder already detached".to_string()))?;

        let frames = decoder.read_audio(&mut side.source_buf, max_frames)?;
        if frames == 0 {
            return Ok(0);
        }

        let src_channels = self.source_format.channels as usize;
        side.chunk.clear();
        convert_to_canonical(&side.source_buf, src_channels, frames, &mut side.chunk, 0);

        let canonical_channels = side.chunk.channel_count();
        if src_channels < canonical_channels {
            if src_channels == 1 {
                let (first, rest) = side.chunk.planes_mut().split_at_mut(1);
                for plane in rest {
                    plane[..frames].copy_from_slice(&first[0][..frames]);
                }
            } else {
                for ch in src_channels..canonical_channels {
                    side.chunk.channel_mut(ch)[..frames].fill(0.0);
                }
            }
        }

        self.frames_decoded.fetch_add(frames as u64, Ordering::AcqRel);
        Ok(frames)
    }

    /// Borrow the staged chunk for writing into the ring.
    ///
    /// Separate from `decode_chunk` so the caller controls how long the
    /// decode-side lock is held.
    pub(crate) fn with_chunk<R>(&self, f: impl FnOnce(&CanonicalBuffer) -> R) -> Result<R> {
        let side = self.decode_side()?;
        Ok(f(&side.chunk))
    }

    /// Detach the decoder handle for closing (collector only)
    pub(crate) fn detach_decoder(&self) -> Option<Box<dyn Decoder>> {
        self.decode_side.lock().ok()?.decoder.take()
    }

    /// Location of the underlying resource, when there is one
    pub fn uri(&self) -> Option<String> {
        let side = self.decode_side.lock().ok()?;
        side.decoder.as_ref()?.uri().map(str::to_string)
    }
}

/// Fixed-size array of atomic decoder-state slots.
///
/// Reclamation protocol: the decode thread, controller, and collector
/// dereference slot pointers only while holding the controller mutex
/// (`EngineShared::guarded`); the render callback dereferences them
/// lock-free, which is sound because the collector frees a state only
/// after unlinking it under the controller mutex and then waiting for
/// render quiescence (`EngineStats::wait_render_quiescent`).
pub struct ActiveDecoders {
    slots: [AtomicPtr<DecoderState>; ACTIVE_DECODER_SLOTS],
}

impl ActiveDecoders {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
        }
    }

    /// Claim an empty slot for `state` via compare-and-swap.
    ///
    /// Returns the state back when every slot is occupied.
    pub(crate) fn claim(&self, state: Box<DecoderState>) -> std::result::Result<(), Box<DecoderState>> {
        let ptr = Box::into_raw(state);
        for slot in &self.slots {
            if slot
                .compare_exchange(
                    std::ptr::null_mut(),
                    ptr,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
        // No slot free; take ownership back.
        Err(unsafe { Box::from_raw(ptr) })
    }

    /// Borrow the state in slot `idx`, if occupied.
    ///
    /// Callers must follow the reclamation protocol above; the returned
    /// borrow is valid only for the duration the caller's side of the
    /// protocol guarantees (the held controller mutex, or the current
    /// render pass).
    pub(crate) fn get(&self, idx: usize) -> Option<&DecoderState> {
        let ptr = self.slots[idx].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Count of occupied slots
    pub(crate) fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.load(Ordering::Acquire).is_null())
            .count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The state currently being decoded: lowest sequence without
    /// `DECODING_FINISHED`.
    pub(crate) fn current_decoding(&self) -> Option<&DecoderState> {
        self.min_by_sequence(|s| !s.flags().is_set(DecoderFlags::DECODING_FINISHED))
    }

    /// The state currently rendering (or next to render): lowest sequence
    /// without `RENDERING_FINISHED`.
    pub(crate) fn current_rendering(&self) -> Option<&DecoderState> {
        self.min_by_sequence(|s| !s.flags().is_set(DecoderFlags::RENDERING_FINISHED))
    }

    fn min_by_sequence(&self, keep: impl Fn(&DecoderState) -> bool) -> Option<&DecoderState> {
        let mut best: Option<&DecoderState> = None;
        for idx in 0..self.slots.len() {
            if let Some(state) = self.get(idx) {
                if keep(state) && best.map_or(true, |b| state.sequence < b.sequence) {
                    best = Some(state);
                }
            }
        }
        best
    }

    /// Unlink one slot whose state has both finished flags set.
    ///
    /// Returns the owning box; the caller must wait for render quiescence
    /// before dropping it.
    pub(crate) fn unlink_finished(&self) -> Option<Box<DecoderState>> {
        for slot in &self.slots {
            let ptr = slot.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }
            let state = unsafe { &*ptr };
            if state.flags.is_set(DecoderFlags::DECODING_FINISHED)
                && state.flags.is_set(DecoderFlags::RENDERING_FINISHED)
                && slot
                    .compare_exchange(ptr, std::ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return Some(unsafe { Box::from_raw(ptr) });
            }
        }
        None
    }
}

impl Default for ActiveDecoders {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveDecoders {
    fn drop(&mut self) {
        // Threads are joined before the engine's shared state drops; any
        // remaining slots are exclusively ours now.
        for slot in &self.slots {
            let ptr = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}
