//! Render-side sample-rate conversion using rubato
//!
//! Bridges the canonical (source) rate to the device stream rate. The
//! converter is configured once per pipeline configuration and then driven
//! from the render callback, so every buffer is preallocated and the
//! processing call itself never allocates. Input is pulled on demand from
//! a caller-supplied fill function reading the ring; shortfall is padded
//! with silence (underrun behavior).
//!
//! Quality: fixed-output sinc interpolation with a linear-phase
//! Blackman-Harris window, the high-quality setting.

use crate::audio::types::{CanonicalBuffer, MAX_CHANNELS};
use crate::error::{Error, Result};
use rubato::{
    Resampler as RubatoResampler, SincFixedOut, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Streaming sinc resampler with preallocated buffers and output carry.
pub struct SincResampler {
    inner: SincFixedOut<f64>,
    channels: usize,
    /// Input staging planes, length `input_frames_max`
    input: Vec<Vec<f64>>,
    /// Output planes, length `output_frames_max`
    output: Vec<Vec<f64>>,
    /// Valid output frames carried between render passes
    out_len: usize,
    out_pos: usize,
}

impl SincResampler {
    /// Build a resampler for the `source_rate` → `device_rate` transform
    /// producing `chunk_out` output frames per pass.
    pub fn new(source_rate: u32, device_rate: u32, channels: u16, chunk_out: usize) -> Result<Self> {
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let inner = SincFixedOut::<f64>::new(
            f64::from(device_rate) / f64::from(source_rate),
            1.0,
            params,
            chunk_out,
            channels as usize,
        )
        .map_err(|e| {
            Error::StreamUnsupported(format!(
                "resampler init failed: {source_rate}Hz -> {device_rate}Hz: {e}"
            ))
        })?;

        let in_max = inner.input_frames_max();
        let out_max = inner.output_frames_max();

        debug!(
            "Sinc resampler: {}Hz -> {}Hz, {} ch, chunk_out={}, in_max={}",
            source_rate, device_rate, channels, chunk_out, in_max
        );

        Ok(Self {
            inner,
            channels: channels as usize,
            input: (0..channels).map(|_| vec![0.0; in_max]).collect(),
            output: (0..channels).map(|_| vec![0.0; out_max]).collect(),
            out_len: 0,
            out_pos: 0,
        })
    }

    /// Carried output frames not yet taken
    pub fn available(&self) -> usize {
        self.out_len - self.out_pos
    }

    /// Drop carried output and clear the filter history (after a seek or
    /// ring reset).
    pub fn reset(&mut self) {
        self.inner.reset();
        self.out_len = 0;
        self.out_pos = 0;
    }

    /// Run one resampler pass.
    ///
    /// `fill(planes, frames)` must write up to `frames` frames of input
    /// into the leading portion of each plane and return the count
    /// actually provided; the remainder is padded with silence. Returns
    /// the number of output frames now available.
    pub fn produce_chunk(
        &mut self,
        fill: impl FnOnce(&mut [Vec<f64>], usize) -> usize,
    ) -> Result<usize> {
        debug_assert_eq!(self.available(), 0);

        let needed = self.inner.input_frames_next();
        let got = fill(&mut self.input, needed);
        if got < needed {
            for plane in &mut self.input {
                plane[got..needed].fill(0.0);
            }
        }

        let mut refs: [&[f64]; MAX_CHANNELS] = [&[]; MAX_CHANNELS];
        for (r, plane) in refs.iter_mut().zip(self.input.iter()) {
            *r = &plane[..needed];
        }

        let (_consumed, produced) = self
            .inner
            .process_into_buffer(&refs[..self.channels], &mut self.output, None)
            .map_err(|e| Error::FatalInternal(format!("resampler process failed: {e}")))?;

        self.out_len = produced;
        self.out_pos = 0;
        Ok(produced)
    }

    /// Move up to `max` carried output frames into `dst` at `dst_offset`.
    pub fn take_output(
        &mut self,
        dst: &mut CanonicalBuffer,
        dst_offset: usize,
        max: usize,
    ) -> usize {
        let n = self.available().min(max);
        for ch in 0..self.channels {
            let src = &self.output[ch][self.out_pos..self.out_pos + n];
            dst.channel_mut(ch)[dst_offset..dst_offset + n].copy_from_slice(src);
        }
        self.out_pos += n;
        n
    }
}
