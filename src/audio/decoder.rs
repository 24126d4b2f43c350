//! Decoder interface and the symphonia-backed implementation
//!
//! A decoder is an opaque, finite, non-restartable source of PCM frames in
//! some source format; seeking is the only way back. The engine consumes
//! decoders exclusively through the [`Decoder`] trait. `SymphoniaDecoder`
//! is the shipped production implementation (MP3, FLAC, AAC, Vorbis, WAV
//! and friends per the enabled symphonia features).

use crate::audio::types::{CanonicalBuffer, ChannelLayout, SourceFormat};
use crate::error::{Error, Result};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder as SymDecoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, warn};

/// Interleaved source-format sample storage filled by `read_audio`.
///
/// One variant per supported source sample encoding; 24-bit samples are
/// carried sign-extended in an i32.
#[derive(Debug, Clone)]
pub enum SourceBuffer {
    I16(Vec<i16>),
    I24(Vec<i32>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl SourceBuffer {
    /// Allocate storage matching a source format with room for
    /// `capacity_frames` frames.
    ///
    /// The variant is chosen from `bits_per_sample`: 16 → I16, 24 → I24,
    /// 64 → F64, anything else → F32 (the common decoded form).
    pub fn for_format(format: &SourceFormat, capacity_frames: usize) -> Self {
        let samples = capacity_frames * format.channels as usize;
        match format.bits_per_sample {
            16 => SourceBuffer::I16(vec![0; samples]),
            24 => SourceBuffer::I24(vec![0; samples]),
            64 => SourceBuffer::F64(vec![0.0; samples]),
            _ => SourceBuffer::F32(vec![0.0; samples]),
        }
    }

    /// Sample capacity of the backing storage
    pub fn capacity_samples(&self) -> usize {
        match self {
            SourceBuffer::I16(v) => v.len(),
            SourceBuffer::I24(v) | SourceBuffer::I32(v) => v.len(),
            SourceBuffer::F32(v) => v.len(),
            SourceBuffer::F64(v) => v.len(),
        }
    }
}

/// Convert an interleaved source-format frame span into canonical
/// deinterleaved f64, normalized to [-1.0, +1.0).
///
/// Writes `frames` frames into the first `channels` planes of `dst`
/// starting at `dst_offset`; `dst` may have additional planes (the caller
/// decides how to populate them).
pub fn convert_to_canonical(
    src: &SourceBuffer,
    channels: usize,
    frames: usize,
    dst: &mut CanonicalBuffer,
    dst_offset: usize,
) {
    debug_assert!(dst.channel_count() >= channels);

    match src {
        SourceBuffer::I16(v) => deinterleave(v, channels, frames, dst, dst_offset, |s| {
            f64::from(s) / 32_768.0
        }),
        SourceBuffer::I24(v) => deinterleave(v, channels, frames, dst, dst_offset, |s| {
            f64::from(s) / 8_388_608.0
        }),
        SourceBuffer::I32(v) => deinterleave(v, channels, frames, dst, dst_offset, |s| {
            f64::from(s) / 2_147_483_648.0
        }),
        SourceBuffer::F32(v) => {
            deinterleave(v, channels, frames, dst, dst_offset, f64::from)
        }
        SourceBuffer::F64(v) => deinterleave(v, channels, frames, dst, dst_offset, |s| s),
    }

    if dst_offset + frames > dst.frames() {
        dst.set_frames(dst_offset + frames);
    }
}

fn deinterleave<S: Copy>(
    src: &[S],
    channels: usize,
    frames: usize,
    dst: &mut CanonicalBuffer,
    dst_offset: usize,
    to_f64: impl Fn(S) -> f64,
) {
    for ch in 0..channels {
        let plane = dst.channel_mut(ch);
        for i in 0..frames {
            plane[dst_offset + i] = to_f64(src[i * channels + ch]);
        }
    }
}

/// An opaque source of PCM frames plus metadata.
///
/// Finite and non-restartable: once `read_audio` returns 0 at EOF, only
/// `seek_to_frame` (where supported) can move the position. The source
/// format is fixed for the decoder's lifetime.
pub trait Decoder: Send {
    /// Source format metadata (fixed per decoder)
    fn source_format(&self) -> SourceFormat;

    /// Total frame count of the source
    fn total_frames(&self) -> u64;

    /// Next frame `read_audio` would produce
    fn current_frame(&self) -> u64;

    /// Whether `seek_to_frame` is usable
    fn supports_seeking(&self) -> bool;

    /// Reposition so the next read produces `frame`. Returns the frame
    /// actually reached.
    fn seek_to_frame(&mut self, frame: u64) -> Result<u64>;

    /// Allocate the buffer variant this decoder fills.
    ///
    /// Defaults to the variant implied by the source format's bit depth;
    /// decoders whose output encoding differs from their source encoding
    /// override it.
    fn make_buffer(&self, capacity_frames: usize) -> SourceBuffer {
        SourceBuffer::for_format(&self.source_format(), capacity_frames)
    }

    /// Produce up to `frames` frames of source-format PCM into `buf`.
    ///
    /// Returns the frame count actually produced; 0 means end of stream.
    fn read_audio(&mut self, buf: &mut SourceBuffer, frames: usize) -> Result<usize>;

    /// Location of the underlying resource, when there is one
    fn uri(&self) -> Option<&str> {
        None
    }
}

/// Streaming audio decoder backed by symphonia.
///
/// Decodes packet-at-a-time, carrying the undelivered remainder of the
/// last packet between `read_audio` calls. Seeking uses the container's
/// accurate seek followed by decode-and-skip to the exact frame.
pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn SymDecoder>,
    track_id: u32,
    source_format: SourceFormat,
    total_frames: u64,
    current_frame: u64,
    /// Interleaved f32 remainder of the last decoded packet
    leftover: Vec<f32>,
    leftover_offset: usize,
    sample_buf: Option<SampleBuffer<f32>>,
    eof: bool,
    uri: String,
}

impl SymphoniaDecoder {
    /// Open an audio file and prepare its default audio track for
    /// streaming decode.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| Error::DecoderFailed(format!("probe failed: {e}")))?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::DecoderFailed("no audio track found".to_string()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| Error::DecoderFailed("sample rate not reported".to_string()))?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| Error::DecoderFailed("channel count not reported".to_string()))?;
        let total_frames = codec_params.n_frames.ok_or_else(|| {
            Error::FormatUnsupported("source length unknown; the engine requires finite decoders".to_string())
        })?;
        let bits_per_sample = codec_params.bits_per_sample.unwrap_or(32);

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| Error::DecoderFailed(format!("decoder creation failed: {e}")))?;

        debug!(
            "Opened {}: {} Hz, {} ch, {} frames",
            path.display(),
            sample_rate,
            channels,
            total_frames
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            source_format: SourceFormat {
                channels,
                sample_rate,
                bits_per_sample,
                layout: ChannelLayout::from_channels(channels),
            },
            total_frames,
            current_frame: 0,
            leftover: Vec::new(),
            leftover_offset: 0,
            sample_buf: None,
            eof: false,
            uri: path.display().to_string(),
        })
    }

    /// Decode the next packet of our track into `leftover`.
    ///
    /// Returns false at end of stream.
    fn decode_next_packet(&mut self) -> Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    return Ok(false);
                }
                Err(e) => {
                    return Err(Error::DecoderFailed(format!("packet read failed: {e}")));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let capacity = decoded.capacity() as u64;

                    let needs_new = self
                        .sample_buf
                        .as_ref()
                        .map_or(true, |b| b.capacity() < decoded.frames() * spec.channels.count());
                    if needs_new {
                        self.sample_buf = Some(SampleBuffer::<f32>::new(capacity, spec));
                    }

                    let sample_buf = self.sample_buf.as_mut().unwrap();
                    sample_buf.copy_interleaved_ref(decoded);

                    self.leftover.clear();
                    self.leftover.extend_from_slice(sample_buf.samples());
                    self.leftover_offset = 0;
                    return Ok(true);
                }
                Err(e) => {
                    // Skip undecodable packets, as the probe loop does
                    warn!("Decode error, skipping packet: {e}");
                    continue;
                }
            }
        }
    }

    /// Decode and discard until `current_frame == target`.
    fn skip_to_frame(&mut self, target: u64) -> Result<()> {
        let channels = self.source_format.channels as usize;
        while self.current_frame < target {
            let available =
                (self.leftover.len() - self.leftover_offset) / channels;
            if available == 0 {
                if !self.decode_next_packet()? {
                    break;
                }
                continue;
            }
            let skip = available.min((target - self.current_frame) as usize);
            self.leftover_offset += skip * channels;
            self.current_frame += skip as u64;
        }
        Ok(())
    }
}

impl Decoder for SymphoniaDecoder {
    fn source_format(&self) -> SourceFormat {
        self.source_format
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn current_frame(&self) -> u64 {
        self.current_frame
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn make_buffer(&self, capacity_frames: usize) -> SourceBuffer {
        // Packets are delivered as f32 regardless of the source bit depth.
        SourceBuffer::F32(vec![0.0; capacity_frames * self.source_format.channels as usize])
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<u64> {
        if frame > self.total_frames {
            return Err(Error::InvalidArgument(format!(
                "seek target {frame} beyond total {}",
                self.total_frames
            )));
        }

        let seconds = frame as f64 / f64::from(self.source_format.sample_rate);
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(seconds),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| {
                warn!("Seek failed: {e}");
                Error::SeekUnsupported
            })?;

        // Container seeks land at or before the requested timestamp;
        // decode-and-skip covers the remainder for sample accuracy.
        self.decoder.reset();
        self.leftover.clear();
        self.leftover_offset = 0;
        self.eof = false;
        self.current_frame = seeked.actual_ts.min(frame);
        self.skip_to_frame(frame)?;

        Ok(self.current_frame)
    }

    fn read_audio(&mut self, buf: &mut SourceBuffer, frames: usize) -> Result<usize> {
        let channels = self.source_format.channels as usize;
        let SourceBuffer::F32(out) = buf else {
            return Err(Error::InvalidArgument(
                "symphonia decoder produces f32 samples".to_string(),
            ));
        };

        let mut produced = 0usize;
        while produced < frames {
            let available = (self.leftover.len() - self.leftover_offset) / channels;
            if available == 0 {
                if self.eof || !self.decode_next_packet()? {
                    break;
                }
                continue;
            }

            let take = available.min(frames - produced);
            let start = self.leftover_offset;
            let end = start + take * channels;
            out[produced * channels..produced * channels + take * channels]
                .copy_from_slice(&self.leftover[start..end]);
            self.leftover_offset = end;
            produced += take;
        }

        self.current_frame += produced as u64;
        Ok(produced)
    }

    fn uri(&self) -> Option<&str> {
        Some(&self.uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_nonexistent_file() {
        let result = SymphoniaDecoder::open("/nonexistent/file.flac");
        assert!(result.is_err());
    }

    #[test]
    fn test_source_buffer_variant_selection() {
        let format = SourceFormat {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            layout: ChannelLayout::Stereo,
        };
        assert!(matches!(
            SourceBuffer::for_format(&format, 64),
            SourceBuffer::I16(_)
        ));

        let format = SourceFormat {
            bits_per_sample: 24,
            ..format
        };
        assert!(matches!(
            SourceBuffer::for_format(&format, 64),
            SourceBuffer::I24(_)
        ));

        let format = SourceFormat {
            bits_per_sample: 32,
            ..format
        };
        let buf = SourceBuffer::for_format(&format, 64);
        assert!(matches!(buf, SourceBuffer::F32(_)));
        assert_eq!(buf.capacity_samples(), 128);
    }

    #[test]
    fn test_convert_i16_normalization() {
        let src = SourceBuffer::I16(vec![0, i16::MIN, i16::MAX, 0]);
        let mut dst = CanonicalBuffer::with_capacity(2, 4);
        convert_to_canonical(&src, 2, 2, &mut dst, 0);

        assert_eq!(dst.channel(0), &[0.0, f64::from(i16::MAX) / 32_768.0]);
        assert_eq!(dst.channel(1), &[-1.0, 0.0]);
    }

    #[test]
    fn test_convert_deinterleaves() {
        let src = SourceBuffer::F64(vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3]);
        let mut dst = CanonicalBuffer::with_capacity(2, 8);
        convert_to_canonical(&src, 2, 3, &mut dst, 0);

        assert_eq!(dst.channel(0), &[0.1, 0.2, 0.3]);
        assert_eq!(dst.channel(1), &[-0.1, -0.2, -0.3]);
    }

    #[test]
    fn test_convert_with_offset_appends() {
        let first = SourceBuffer::F32(vec![0.5, 0.5]);
        let second = SourceBuffer::F32(vec![0.25, 0.25]);
        let mut dst = CanonicalBuffer::with_capacity(1, 8);

        convert_to_canonical(&first, 1, 2, &mut dst, 0);
        convert_to_canonical(&second, 1, 2, &mut dst, 2);

        assert_eq!(dst.channel(0), &[0.5, 0.5, 0.25, 0.25]);
    }

    #[test]
    fn test_convert_i24_and_i32_scale() {
        let src = SourceBuffer::I24(vec![8_388_607, -8_388_608]);
        let mut dst = CanonicalBuffer::with_capacity(1, 2);
        convert_to_canonical(&src, 1, 2, &mut dst, 0);
        assert!(dst.channel(0)[0] < 1.0 && dst.channel(0)[0] > 0.999);
        assert_eq!(dst.channel(0)[1], -1.0);

        let src = SourceBuffer::I32(vec![i32::MAX, i32::MIN]);
        let mut dst = CanonicalBuffer::with_capacity(1, 2);
        convert_to_canonical(&src, 1, 2, &mut dst, 0);
        assert!(dst.channel(0)[0] < 1.0);
        assert_eq!(dst.channel(0)[1], -1.0);
    }
}
