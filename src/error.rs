//! Error types for veilmux.

use std::sync::Arc;

use thiserror::Error;

/// Main error type for all veilmux operations.
///
/// The enum is `Clone` because a single session-fatal error is fanned out to
/// every live stream; I/O errors are therefore held behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// I/O error on the underlying physical connection.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// Protocol violation (malformed frame, window overrun, etc.).
    /// Fatal to the session: framing state is unrecoverable once desynchronized.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session-frame payload failed to decrypt or authenticate.
    #[error("Decrypt error: {0}")]
    Decrypt(String),

    /// The OS random source failed while drawing a padding length.
    #[error("Random source failure: {0}")]
    RandomSource(String),

    /// A caller attempted to send a single data frame larger than allowed.
    #[error("Data frame payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Unknown frame type tag encountered while parsing a session frame.
    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Invalid session configuration (bad client-init length, zero window).
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No free stream ID remains in the 16-bit space.
    #[error("All stream IDs are in use")]
    IdsExhausted,

    /// The session was already closed.
    #[error("Session closed")]
    SessionClosed,

    /// The stream was closed (RST sent or received).
    #[error("Stream closed")]
    StreamClosed,

    /// Synthesized failure delivered to streams on session teardown when the
    /// originating direction reported no concrete error.
    #[error("Broken pipe")]
    BrokenPipe,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// Whether this error is an I/O error of the given kind.
    pub fn is_io_kind(&self, kind: std::io::ErrorKind) -> bool {
        matches!(self, Error::Io(e) if e.kind() == kind)
    }
}

/// Result type alias using veilmux's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
