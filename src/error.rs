//! Error types for the session engine.

use std::io;

use thiserror::Error;

use crate::frame::RstStatus;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while framing, compressing or moving frames.
///
/// Everything except [`Error::Reset`], [`Error::StreamFinished`] and
/// [`Error::NotOpened`] is fatal to the connection it came from: the reader loop and the output drain turn those
/// into a single abort.
#[derive(Debug, Error)]
pub enum Error {
    /// Control frame carries a protocol version other than the one we speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    /// Declared frame length exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Control frame type we do not know how to handle.
    #[error("unexpected control frame type {0}")]
    UnknownFrameType(u16),

    /// Frame body is shorter than its type requires, or otherwise inconsistent.
    #[error("malformed {frame} frame: {reason}")]
    Malformed {
        frame: &'static str,
        reason: &'static str,
    },

    /// Frame references a stream id that was never opened on this connection.
    #[error("stream {0} not found")]
    UnknownStream(u32),

    /// SYN_STREAM carries an id that is or was already in use.
    #[error("stream id {0} already used")]
    DuplicateStream(u32),

    /// Header block deflate/inflate failure.
    #[error("header compression failed: {0}")]
    Compression(String),

    /// Connection has been aborted or the peer closed the transport.
    #[error("connection closed")]
    Closed,

    /// Stream was reset by the peer or locally.
    #[error("stream reset: {0}")]
    Reset(RstStatus),

    /// Write attempted after this side already half-closed the stream.
    #[error("stream already finished")]
    StreamFinished,

    /// Write attempted on a stream that has no id yet.
    #[error("stream not opened yet")]
    NotOpened,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn malformed(frame: &'static str, reason: &'static str) -> Self {
        Error::Malformed { frame, reason }
    }

    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Reset(_) | Error::StreamFinished | Error::NotOpened)
    }
}

impl From<flate2::CompressError> for Error {
    fn from(e: flate2::CompressError) -> Self {
        Error::Compression(e.to_string())
    }
}

impl From<flate2::DecompressError> for Error {
    fn from(e: flate2::DecompressError) -> Self {
        Error::Compression(e.to_string())
    }
}
