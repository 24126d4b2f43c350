//! Lock-free ring buffer for deinterleaved audio frames
//!
//! Single-producer single-consumer circular buffer of planar f64 frames
//! shared between the decode thread (writer) and the render callback
//! (reader). Operations never allocate, never block, and never fail;
//! short reads and writes return the actually-transferred count.
//!
//! Capacity is rounded up to a power of two so wrap is a mask. The two
//! 64-bit cursors count absolute frames since the last reset and double
//! as the write/read timeline: a decoder's `timestamp` is the value of
//! `write_position()` at the moment its first frame was written.
//!
//! Cursor publication uses release/acquire so the payload written before
//! a cursor store is visible to the side that loads it.

use crate::audio::types::CanonicalBuffer;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct RingShared {
    /// Channel-major sample storage: channel `c` occupies
    /// `storage[c * capacity .. (c + 1) * capacity]`.
    storage: Box<[UnsafeCell<f64>]>,
    capacity: u64,
    mask: u64,
    channels: usize,
    /// Absolute frames written since reset. Stored by the writer only.
    write_pos: AtomicU64,
    /// Absolute frames read since reset. Stored by the reader only.
    read_pos: AtomicU64,
}

// The cursors partition the storage into a writer-owned region
// [write_pos, read_pos + capacity) and a reader-owned region
// [read_pos, write_pos); each side touches cells only inside its own
// region, bounded by a cursor value the other side published.
unsafe impl Sync for RingShared {}
unsafe impl Send for RingShared {}

impl RingShared {
    #[inline]
    fn frames_readable(&self, write: u64, read: u64) -> u64 {
        write - read
    }

    #[inline]
    fn frames_writable(&self, write: u64, read: u64) -> u64 {
        self.capacity - (write - read)
    }

    /// Copy `count` frames of channel `ch` out of the ring starting at
    /// absolute position `pos`.
    ///
    /// Safety: caller must own the region `[pos, pos + count)` on the
    /// reader side.
    unsafe fn copy_out(&self, ch: usize, pos: u64, dst: &mut [f64], count: usize) {
        let base = ch as u64 * self.capacity;
        let idx = (pos & self.mask) as usize;
        let first = count.min((self.capacity - (pos & self.mask)) as usize);
        for i in 0..first {
            dst[i] = *self.storage[base as usize + idx + i].get();
        }
        for i in first..count {
            dst[i] = *self.storage[base as usize + (i - first)].get();
        }
    }

    /// Copy `count` frames of channel `ch` into the ring starting at
    /// absolute position `pos`.
    ///
    /// Safety: caller must own the region `[pos, pos + count)` on the
    /// writer side.
    unsafe fn copy_in(&self, ch: usize, pos: u64, src: &[f64], count: usize) {
        let base = ch as u64 * self.capacity;
        let idx = (pos & self.mask) as usize;
        let first = count.min((self.capacity - (pos & self.mask)) as usize);
        for i in 0..first {
            *self.storage[base as usize + idx + i].get() = src[i];
        }
        for i in first..count {
            *self.storage[base as usize + (i - first)].get() = src[i];
        }
    }
}

/// Ring buffer of deinterleaved f64 frames.
///
/// Split into a [`RingWriter`] for the decode thread and a [`RingReader`]
/// for the render callback; ownership of the halves enforces the
/// single-writer single-reader discipline.
pub struct FrameRing {
    shared: Arc<RingShared>,
}

impl FrameRing {
    /// Create a ring with `channels` planes and room for at least
    /// `capacity_frames` frames (rounded up to a power of two).
    pub fn new(channels: u16, capacity_frames: usize) -> Self {
        let capacity = capacity_frames.max(2).next_power_of_two() as u64;
        let cells = capacity as usize * channels as usize;
        let storage = (0..cells)
            .map(|_| UnsafeCell::new(0.0f64))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shared: Arc::new(RingShared {
                storage,
                capacity,
                mask: capacity - 1,
                channels: channels as usize,
                write_pos: AtomicU64::new(0),
                read_pos: AtomicU64::new(0),
            }),
        }
    }

    /// Split into the producer and consumer halves.
    pub fn split(self) -> (RingWriter, RingReader) {
        let writer = RingWriter {
            shared: Arc::clone(&self.shared),
        };
        let reader = RingReader {
            shared: self.shared,
        };
        (writer, reader)
    }
}

/// Producer half, owned by the decode thread.
pub struct RingWriter {
    shared: Arc<RingShared>,
}

impl RingWriter {
    /// Frame capacity (power of two)
    pub fn capacity(&self) -> usize {
        self.shared.capacity as usize
    }

    /// Channel plane count
    pub fn channels(&self) -> usize {
        self.shared.channels
    }

    /// Frames the writer could currently transfer without overwriting
    pub fn frames_writable(&self) -> usize {
        let w = self.shared.write_pos.load(Ordering::Relaxed);
        let r = self.shared.read_pos.load(Ordering::Acquire);
        self.shared.frames_writable(w, r) as usize
    }

    /// Absolute write position: total frames written since reset.
    pub fn write_position(&self) -> u64 {
        self.shared.write_pos.load(Ordering::Relaxed)
    }

    /// Write up to `count` frames from `src` starting at `src_offset`.
    ///
    /// Returns the number of frames actually written (short on a full
    /// ring). Never blocks, never allocates.
    pub fn write(&mut self, src: &CanonicalBuffer, src_offset: usize, count: usize) -> usize {
        debug_assert_eq!(src.channel_count(), self.shared.channels);

        let w = self.shared.write_pos.load(Ordering::Relaxed);
        let r = self.shared.read_pos.load(Ordering::Acquire);
        let n = count.min(self.shared.frames_writable(w, r) as usize);
        if n == 0 {
            return 0;
        }

        for ch in 0..self.shared.channels {
            let plane = &src.planes()[ch][src_offset..src_offset + n];
            unsafe { self.shared.copy_in(ch, w, plane, n) };
        }

        self.shared.write_pos.store(w + n as u64, Ordering::Release);
        n
    }

    /// Zero both cursors and clear the payload.
    ///
    /// Callable only while the reader is provably outside `read` (render
    /// callback muted-and-acknowledged, or the device stopped); the engine
    /// guarantees this before seeking or stopping.
    pub fn reset(&mut self) {
        for cell in self.shared.storage.iter() {
            unsafe { *cell.get() = 0.0 };
        }
        self.shared.read_pos.store(0, Ordering::Release);
        self.shared.write_pos.store(0, Ordering::Release);
    }
}

// Each half is moved to exactly one thread; the shared storage is guarded
// by the cursor protocol above.
unsafe impl Send for RingWriter {}

/// Consumer half, owned by the render callback.
pub struct RingReader {
    shared: Arc<RingShared>,
}

impl RingReader {
    /// Frames currently buffered and readable
    pub fn frames_readable(&self) -> usize {
        let r = self.shared.read_pos.load(Ordering::Relaxed);
        let w = self.shared.write_pos.load(Ordering::Acquire);
        self.shared.frames_readable(w, r) as usize
    }

    /// Absolute read position: total frames consumed since reset.
    pub fn read_position(&self) -> u64 {
        self.shared.read_pos.load(Ordering::Relaxed)
    }

    /// Read up to `count` frames into `dst` starting at `dst_offset`.
    ///
    /// Returns the number of frames actually read (short on an empty
    /// ring). Never blocks, never allocates.
    pub fn read(&mut self, dst: &mut CanonicalBuffer, dst_offset: usize, count: usize) -> usize {
        debug_assert_eq!(dst.channel_count(), self.shared.channels);
        self.read_planes(dst.planes_mut(), dst_offset, count)
    }

    /// Read up to `count` frames directly into per-channel planes.
    ///
    /// `planes` must hold one plane per ring channel with room for
    /// `dst_offset + count` frames each.
    pub fn read_planes(&mut self, planes: &mut [Vec<f64>], dst_offset: usize, count: usize) -> usize {
        debug_assert_eq!(planes.len(), self.shared.channels);

        let r = self.shared.read_pos.load(Ordering::Relaxed);
        let w = self.shared.write_pos.load(Ordering::Acquire);
        let n = count.min(self.shared.frames_readable(w, r) as usize);
        if n == 0 {
            return 0;
        }

        for (ch, plane) in planes.iter_mut().enumerate() {
            let dst = &mut plane[dst_offset..dst_offset + n];
            unsafe { self.shared.copy_out(ch, r, dst, n) };
        }

        self.shared.read_pos.store(r + n as u64, Ordering::Release);
        n
    }
}

unsafe impl Send for RingReader {}
