//! Engine events
//!
//! Asynchronous notifications emitted by the engine's worker threads and
//! forwarded to the caller over a channel. The render callback itself
//! never touches the channel; it pushes compact records into a lock-free
//! queue that the decode thread drains and forwards.

use serde::Serialize;
use uuid::Uuid;

/// Asynchronous engine notifications
///
/// Delivered in the order produced. `RenderingStarted` for a decoder is
/// never delivered before `RenderingFinished` of its predecessor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The render callback consumed the first frame of this decoder
    RenderingStarted { decoder_id: Uuid },

    /// The render callback consumed the final frame of this decoder
    RenderingFinished { decoder_id: Uuid },

    /// A decoder hit a fatal error; its slot was finished and playback
    /// proceeds with the next queued decoder
    DecoderError { decoder_id: Uuid, message: String },

    /// The output device disappeared or its stream failed; the engine
    /// stopped itself
    PlaybackInterrupted,
}

/// Compact render-thread event record.
///
/// Pushed by the render callback into a preallocated SPSC queue; must be
/// `Copy` so the hot path never allocates.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RenderEvent {
    RenderingStarted(Uuid),
    RenderingFinished(Uuid),
}

impl From<RenderEvent> for EngineEvent {
    fn from(ev: RenderEvent) -> Self {
        match ev {
            RenderEvent::RenderingStarted(decoder_id) => {
                EngineEvent::RenderingStarted { decoder_id }
            }
            RenderEvent::RenderingFinished(decoder_id) => {
                EngineEvent::RenderingFinished { decoder_id }
            }
        }
    }
}
