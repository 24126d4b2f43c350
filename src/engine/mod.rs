//! Playback engine internals: the lock-free ring buffer, per-decoder
//! state machine, and the decode/render/collector threads behind the
//! [`controller::PlaybackEngine`] control surface.

pub mod controller;
pub mod decoder_state;
pub mod ring_buffer;

mod collector;
mod renderer;
mod semaphore;
mod state;
mod worker;

pub use state::StatsSnapshot;
