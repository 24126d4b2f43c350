//! Error types for the playback engine
//!
//! Defines engine-specific error types using thiserror for clear error
//! propagation from controller operations. Worker threads never surface
//! errors synchronously; decoder failures become async diagnostic events.

use thiserror::Error;

/// Main error type for the playback engine
#[derive(Error, Debug)]
pub enum Error {
    /// A decoder's source format cannot be carried by the current pipeline
    /// configuration (channel count or sample rate mismatch).
    #[error("Format unsupported: {0}")]
    FormatUnsupported(String),

    /// Output device missing, disappeared, or failed to open
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Output device is exclusively held by another process
    #[error("Device busy: exclusive access held elsewhere")]
    DeviceBusy,

    /// No converter chain is constructible for a stream format
    #[error("Stream format unsupported: {0}")]
    StreamUnsupported(String),

    /// Decoder reported a fatal error
    #[error("Decoder failed: {0}")]
    DecoderFailed(String),

    /// The current decoder does not support seeking
    #[error("Seeking not supported by the current decoder")]
    SeekUnsupported,

    /// A bounded wait expired (thread shutdown, seek completion, quiescence)
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Caller supplied an out-of-range or nonsensical argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation requires active playback
    #[error("Not playing")]
    NotPlaying,

    /// A synchronization primitive failed (poisoned mutex); the engine is
    /// in an undefined state and should be dropped.
    #[error("Fatal internal error: {0}")]
    FatalInternal(String),

    /// File I/O errors from decoder sources
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a poisoned-lock failure into `FatalInternal`.
    ///
    /// Controller operations surface lock failures instead of panicking;
    /// the render path never acquires a lock so this cannot occur there.
    pub(crate) fn poisoned(what: &str) -> Self {
        Error::FatalInternal(format!("{what} mutex poisoned"))
    }
}
