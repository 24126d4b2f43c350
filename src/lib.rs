//! # Gapless audio playback engine
//!
//! Feeds a hardware output device from a queue of decoders with
//! sample-accurate, gapless transitions between successive sources.
//!
//! **Architecture:** a decode thread pulls source frames through the
//! [`Decoder`] trait, converts them to canonical deinterleaved f64, and
//! writes them into a lock-free ring buffer; the device's realtime
//! callback drains the ring through sample-rate conversion (rubato) and
//! final PCM conversion into the stream's format (cpal); a collector
//! thread retires spent decoders off the realtime path. The
//! [`PlaybackEngine`] controller serializes play/pause/stop, seeking,
//! queueing, volume, and device selection.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;

pub use audio::converter::{OutputConverter, OutputSampleFormat, RenderTarget};
pub use audio::decoder::{Decoder, SourceBuffer, SymphoniaDecoder};
pub use audio::device::{
    list_output_devices, CpalOutputDevice, OutputDevice, RenderFn, StreamFormat,
};
pub use audio::types::{CanonicalBuffer, CanonicalFormat, ChannelLayout, SourceFormat};
pub use config::EngineConfig;
pub use engine::controller::PlaybackEngine;
pub use engine::StatsSnapshot;
pub use error::{Error, Result};
pub use events::EngineEvent;
