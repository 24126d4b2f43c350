//! Core audio data types
//!
//! The engine's internal canonical representation is deinterleaved
//! (planar) 64-bit float PCM, normalized to [-1.0, +1.0), at a channel
//! count and sample rate fixed for the lifetime of one ring-buffer
//! configuration.

use serde::Serialize;

/// Upper bound on channel planes any pipeline configuration may carry.
///
/// Lets render-path code use fixed-size on-stack slice arrays instead of
/// allocating.
pub const MAX_CHANNELS: usize = 32;

/// Channel layout of a source or the canonical pipeline.
///
/// Only the arrangements the engine distinguishes; anything beyond stereo
/// is treated as discrete ordered channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    Mono,
    Stereo,
    /// N discrete channels in source order
    Discrete(u16),
}

impl ChannelLayout {
    /// Channel count for this layout
    pub fn channels(&self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::Discrete(n) => *n,
        }
    }

    /// Layout for a raw channel count
    pub fn from_channels(channels: u16) -> Self {
        match channels {
            1 => ChannelLayout::Mono,
            2 => ChannelLayout::Stereo,
            n => ChannelLayout::Discrete(n),
        }
    }
}

/// Source format metadata reported by a decoder
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    pub layout: ChannelLayout,
}

/// Canonical pipeline format: the ring buffer's channel count and rate.
///
/// Fixed per configuration; a decoder that cannot be expressed in this
/// format is rejected at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalFormat {
    pub channels: u16,
    pub sample_rate: u32,
}

/// Deinterleaved f64 audio scratch buffer.
///
/// One `Vec<f64>` per channel, all the same capacity. `frames` is the
/// count of valid frames; capacity is fixed at construction so render-path
/// users never reallocate.
#[derive(Debug, Clone)]
pub struct CanonicalBuffer {
    channels: Vec<Vec<f64>>,
    frames: usize,
}

impl CanonicalBuffer {
    /// Allocate a buffer of `channel_count` planes with room for
    /// `capacity_frames` frames each, initially holding zero valid frames.
    pub fn with_capacity(channel_count: u16, capacity_frames: usize) -> Self {
        let channels = (0..channel_count)
            .map(|_| vec![0.0f64; capacity_frames])
            .collect();
        Self { channels, frames: 0 }
    }

    /// Number of channel planes
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Valid frame count
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Frame capacity per channel
    pub fn capacity(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Mark `frames` frames as valid. Callers fill the planes first.
    ///
    /// # Panics
    /// Panics if `frames` exceeds capacity.
    pub fn set_frames(&mut self, frames: usize) {
        assert!(frames <= self.capacity());
        self.frames = frames;
    }

    /// Valid portion of one channel plane
    pub fn channel(&self, ch: usize) -> &[f64] {
        &self.channels[ch][..self.frames]
    }

    /// Mutable full-capacity plane for one channel
    pub fn channel_mut(&mut self, ch: usize) -> &mut [f64] {
        &mut self.channels[ch]
    }

    /// Full-capacity planes, for APIs that take `&[Vec<f64>]`
    pub fn planes(&self) -> &[Vec<f64>] {
        &self.channels
    }

    /// Mutable full-capacity planes
    pub fn planes_mut(&mut self) -> &mut [Vec<f64>] {
        &mut self.channels
    }

    /// Zero-fill frames `[from, to)` on every channel.
    pub fn fill_silence(&mut self, from: usize, to: usize) {
        for plane in &mut self.channels {
            plane[from..to].fill(0.0);
        }
        if to > self.frames {
            self.frames = to;
        }
    }

    /// Scale frames `[0, frames)` of channel `ch` by `gain`.
    pub fn apply_gain(&mut self, ch: usize, gain: f64, frames: usize) {
        for sample in &mut self.channels[ch][..frames] {
            *sample *= gain;
        }
    }

    /// Reset to zero valid frames (capacity retained).
    pub fn clear(&mut self) {
        self.frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_layout_counts() {
        assert_eq!(ChannelLayout::Mono.channels(), 1);
        assert_eq!(ChannelLayout::Stereo.channels(), 2);
        assert_eq!(ChannelLayout::Discrete(6).channels(), 6);
        assert_eq!(ChannelLayout::from_channels(2), ChannelLayout::Stereo);
        assert_eq!(ChannelLayout::from_channels(5), ChannelLayout::Discrete(5));
    }

    #[test]
    fn test_canonical_buffer_shape() {
        let buf = CanonicalBuffer::with_capacity(2, 1024);
        assert_eq!(buf.channel_count(), 2);
        assert_eq!(buf.capacity(), 1024);
        assert_eq!(buf.frames(), 0);
    }

    #[test]
    fn test_fill_and_read_back() {
        let mut buf = CanonicalBuffer::with_capacity(2, 16);
        buf.channel_mut(0)[..4].copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);
        buf.channel_mut(1)[..4].copy_from_slice(&[-0.1, -0.2, -0.3, -0.4]);
        buf.set_frames(4);

        assert_eq!(buf.channel(0), &[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(buf.channel(1), &[-0.1, -0.2, -0.3, -0.4]);
    }

    #[test]
    fn test_fill_silence_extends_frames() {
        let mut buf = CanonicalBuffer::with_capacity(1, 8);
        buf.channel_mut(0)[..2].copy_from_slice(&[0.5, 0.5]);
        buf.set_frames(2);

        buf.fill_silence(2, 6);
        assert_eq!(buf.frames(), 6);
        assert_eq!(buf.channel(0), &[0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_apply_gain() {
        let mut buf = CanonicalBuffer::with_capacity(1, 4);
        buf.channel_mut(0).copy_from_slice(&[1.0, -1.0, 0.5, 0.25]);
        buf.set_frames(4);

        buf.apply_gain(0, 0.5, 4);
        assert_eq!(buf.channel(0), &[0.5, -0.5, 0.25, 0.125]);
    }

    #[test]
    #[should_panic]
    fn test_set_frames_beyond_capacity_panics() {
        let mut buf = CanonicalBuffer::with_capacity(1, 4);
        buf.set_frames(5);
    }
}
