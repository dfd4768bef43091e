//! Error types for the codec layer.
//!
//! - [`FramingError`]: the byte stream cannot be split into frames (bad magic, malformed length,
//!   truncated chunk).
//! - [`ProtocolError`]: a frame was delimited but its contents break the protocol (bad start
//!   line, unsupported version, forbidden header combination).
//! - [`EofError`]: the peer closed the connection.
//! - [`CodecError`]: wraps the above plus I/O.
//!
//! Every decode error is fatal to the connection: once framing is lost there
//! is no boundary to resynchronise on.

use std::io;

use thiserror::Error;

/// Frame boundary errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Length prefix exceeds the configured maximum.
    #[error("frame exceeds max length: {size} > {max}")]
    OversizedFrame {
        /// Length announced by the prefix.
        size: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// Length prefix is malformed.
    #[error("invalid frame length encoding")]
    InvalidLengthEncoding,

    /// Magic flag set but the magic word is wrong.
    #[error("bad magic word {0:#06x}")]
    BadMagic(u16),

    /// Frame type bits hold an unknown value.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// A field ran past the end of its frame.
    #[error("truncated frame: {0}")]
    Truncated(&'static str),

    /// A chunk size line or terminator is malformed.
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    /// The first bytes of a connection match no registered protocol.
    #[error("no protocol recognises the connection preamble")]
    UnknownProtocol,
}

/// Semantic errors inside a delimited frame.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Request or status line does not parse.
    #[error("malformed start line: {0:?}")]
    MalformedStartLine(String),

    /// Version is not supported.
    #[error("unsupported protocol version: {version}")]
    UnsupportedVersion {
        /// Version as it appeared on the wire.
        version: String,
    },

    /// Header line does not parse.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// `Content-Length` values disagree or do not parse.
    #[error("invalid content length: {0:?}")]
    InvalidContentLength(String),

    /// `Content-Length` sent alongside chunked transfer coding.
    #[error("content-length is not allowed with chunked transfer encoding")]
    LengthWithChunked,

    /// Field that may not appear in a trailer.
    #[error("forbidden trailer field {0:?}")]
    ForbiddenTrailer(String),

    /// A required element of the frame is missing.
    #[error("missing required field: {field}")]
    MissingField {
        /// Name of the missing element.
        field: &'static str,
    },

    /// Message type bits hold an unknown value.
    #[error("unknown message type: {type_id}")]
    UnknownMessageType {
        /// Rejected value.
        type_id: u8,
    },

    /// Codec byte names no known codec.
    #[error("unknown body codec {0}")]
    UnknownCodec(u8),

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
}

/// End-of-stream conditions.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EofError {
    /// Peer closed at a frame boundary.
    #[error("connection closed cleanly at frame boundary")]
    CleanClose,

    /// Peer closed with a partial frame buffered.
    #[error("premature EOF with {bytes_received} bytes of an incomplete frame")]
    MidFrame {
        /// Bytes buffered when the peer closed.
        bytes_received: usize,
    },
}

/// Top-level codec error.
///
/// ```
/// use kgnet::codec::{CodecError, FramingError};
///
/// let err = CodecError::from(FramingError::BadMagic(0x1234));
/// assert_eq!(err.error_type(), "framing");
/// assert!(!err.is_clean_close());
/// ```
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame boundary error.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Protocol violation.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// End of stream.
    #[error("EOF: {0}")]
    Eof(#[from] EofError),
}

impl CodecError {
    /// Whether the peer closed at a frame boundary.
    #[must_use]
    pub fn is_clean_close(&self) -> bool { matches!(self, Self::Eof(EofError::CleanClose)) }

    /// Category name for logs and metrics.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Framing(_) => "framing",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
            Self::Eof(_) => "eof",
        }
    }
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e,
            CodecError::Framing(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CodecError::Protocol(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CodecError::Eof(e) => io::Error::new(io::ErrorKind::UnexpectedEof, e),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
