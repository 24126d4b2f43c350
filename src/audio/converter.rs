//! Final PCM conversion from canonical buffers to output stream formats
//!
//! Pure conversion: a fixed source (canonical planar f64) to a fixed
//! destination (one output stream's interleaved sample format), chosen at
//! configuration time so the render path performs no dispatch decisions
//! beyond a single match. Samples are clamped to [-1.0, 1.0] before
//! scaling to prevent clipping wrap.

use crate::audio::types::CanonicalBuffer;
use serde::Serialize;

/// Output stream sample formats the engine can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSampleFormat {
    F32,
    I16,
    U16,
    I32,
}

/// Typed interleaved destination slice for one render pass.
///
/// The device backend hands the renderer the variant matching the
/// stream's negotiated sample format.
pub enum RenderTarget<'a> {
    F32(&'a mut [f32]),
    I16(&'a mut [i16]),
    U16(&'a mut [u16]),
    I32(&'a mut [i32]),
}

impl RenderTarget<'_> {
    /// Frame capacity of the destination for `channels` channels
    pub fn frames(&self, channels: usize) -> usize {
        let samples = match self {
            RenderTarget::F32(s) => s.len(),
            RenderTarget::I16(s) => s.len(),
            RenderTarget::U16(s) => s.len(),
            RenderTarget::I32(s) => s.len(),
        };
        samples / channels
    }

    /// Sample format of this destination
    pub fn sample_format(&self) -> OutputSampleFormat {
        match self {
            RenderTarget::F32(_) => OutputSampleFormat::F32,
            RenderTarget::I16(_) => OutputSampleFormat::I16,
            RenderTarget::U16(_) => OutputSampleFormat::U16,
            RenderTarget::I32(_) => OutputSampleFormat::I32,
        }
    }
}

/// Converter for one output stream: canonical planar f64 in, the stream's
/// interleaved sample format out.
#[derive(Debug, Clone, Copy)]
pub struct OutputConverter {
    channels: usize,
}

impl OutputConverter {
    pub fn new(channels: u16) -> Self {
        Self {
            channels: channels as usize,
        }
    }

    /// Convert `frames` frames from `src`, writing interleaved samples
    /// into `dst` starting at frame `dst_frame_offset`.
    pub fn convert(
        &self,
        src: &CanonicalBuffer,
        src_frame_offset: usize,
        frames: usize,
        dst: &mut RenderTarget<'_>,
        dst_frame_offset: usize,
    ) {
        match dst {
            RenderTarget::F32(out) => {
                self.interleave(src, src_frame_offset, frames, &mut **out, dst_frame_offset, |s| {
                    s as f32
                });
            }
            RenderTarget::I16(out) => {
                self.interleave(src, src_frame_offset, frames, &mut **out, dst_frame_offset, |s| {
                    (s * f64::from(i16::MAX)) as i16
                });
            }
            RenderTarget::U16(out) => {
                self.interleave(src, src_frame_offset, frames, &mut **out, dst_frame_offset, |s| {
                    ((s + 1.0) * 32_767.5) as u16
                });
            }
            RenderTarget::I32(out) => {
                self.interleave(src, src_frame_offset, frames, &mut **out, dst_frame_offset, |s| {
                    (s * f64::from(i32::MAX)) as i32
                });
            }
        }
    }

    /// Fill `frames` frames of `dst` with silence starting at
    /// `dst_frame_offset`.
    pub fn write_silence(&self, dst: &mut RenderTarget<'_>, dst_frame_offset: usize, frames: usize) {
        let start = dst_frame_offset * self.channels;
        let end = start + frames * self.channels;
        match dst {
            RenderTarget::F32(out) => out[start..end].fill(0.0),
            RenderTarget::I16(out) => out[start..end].fill(0),
            // Unsigned silence sits at mid-scale
            RenderTarget::U16(out) => out[start..end].fill(32_768),
            RenderTarget::I32(out) => out[start..end].fill(0),
        }
    }

    fn interleave<T: Copy>(
        &self,
        src: &CanonicalBuffer,
        src_offset: usize,
        frames: usize,
        dst: &mut [T],
        dst_offset: usize,
        scale: impl Fn(f64) -> T,
    ) {
        for ch in 0..self.channels {
            // Canonical channel count may exceed a narrow stream; missing
            // channels render silence via the clamp of 0.0.
            let plane = if ch < src.channel_count() {
                Some(&src.planes()[ch][src_offset..src_offset + frames])
            } else {
                None
            };
            for i in 0..frames {
                let sample = plane.map_or(0.0, |p| p[i]).clamp(-1.0, 1.0);
                dst[(dst_offset + i) * self.channels + ch] = scale(sample);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(frames: usize, values: &[(f64, f64)]) -> CanonicalBuffer {
        let mut buf = CanonicalBuffer::with_capacity(2, frames);
        for (i, (l, r)) in values.iter().enumerate() {
            buf.channel_mut(0)[i] = *l;
            buf.channel_mut(1)[i] = *r;
        }
        buf.set_frames(values.len());
        buf
    }

    #[test]
    fn test_f32_conversion_interleaves() {
        let src = canonical(4, &[(0.5, -0.5), (0.25, -0.25)]);
        let mut out = [0.0f32; 4];
        let conv = OutputConverter::new(2);
        conv.convert(&src, 0, 2, &mut RenderTarget::F32(&mut out), 0);
        assert_eq!(out, [0.5, -0.5, 0.25, -0.25]);
    }

    #[test]
    fn test_i16_scaling_and_clamp() {
        let src = canonical(2, &[(1.5, -1.5)]);
        let mut out = [0i16; 2];
        let conv = OutputConverter::new(2);
        conv.convert(&src, 0, 1, &mut RenderTarget::I16(&mut out), 0);
        assert_eq!(out, [i16::MAX, -i16::MAX]);
    }

    #[test]
    fn test_u16_offset_encoding() {
        let src = canonical(2, &[(0.0, 1.0)]);
        let mut out = [0u16; 2];
        let conv = OutputConverter::new(2);
        conv.convert(&src, 0, 1, &mut RenderTarget::U16(&mut out), 0);
        assert_eq!(out[0], 32_767);
        assert_eq!(out[1], u16::MAX);
    }

    #[test]
    fn test_silence_fill() {
        let conv = OutputConverter::new(2);
        let mut out = [1.0f32; 8];
        conv.write_silence(&mut RenderTarget::F32(&mut out), 1, 2);
        assert_eq!(out, [1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);

        let mut out = [0u16; 2];
        conv.write_silence(&mut RenderTarget::U16(&mut out), 0, 1);
        assert_eq!(out, [32_768, 32_768]);
    }

    #[test]
    fn test_offsets_address_correct_frames() {
        let src = canonical(4, &[(0.1, 0.2), (0.3, 0.4)]);
        let mut out = [9.0f32; 8];
        let conv = OutputConverter::new(2);
        conv.convert(&src, 1, 1, &mut RenderTarget::F32(&mut out), 2);
        assert_eq!(out[4], 0.3f32);
        assert_eq!(out[5], 0.4f32);
        assert_eq!(out[0], 9.0);
    }

    #[test]
    fn test_missing_canonical_channels_render_silence() {
        let mut mono = CanonicalBuffer::with_capacity(1, 2);
        mono.channel_mut(0)[..2].copy_from_slice(&[0.5, 0.5]);
        mono.set_frames(2);

        let conv = OutputConverter::new(2);
        let mut out = [9.0f32; 4];
        conv.convert(&mono, 0, 2, &mut RenderTarget::F32(&mut out), 0);
        assert_eq!(out, [0.5, 0.0, 0.5, 0.0]);
    }
}
