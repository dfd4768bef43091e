//! Canonical error and result types for the crate.
//!
//! Component errors (codec, executor, router, timer, payload) keep their own
//! enums; [`Error`] is the surface returned by connection, buffer, body and
//! handler APIs and converts from each of them.

use std::io;

use thiserror::Error;

use crate::{
    codec::{CodecError, PayloadError},
    executor::ExecutorError,
    router::RouterError,
};

/// Top-level error type exposed by `kgnet`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A seek or slice referenced bytes outside `[0, len]`.
    #[error("position {pos} out of range [0, {len}]")]
    OutOfRange {
        /// Requested position.
        pos: i64,
        /// Length of the buffer at the time of the request.
        len: usize,
    },

    /// The body variant cannot fulfil the operation.
    #[error("operation not supported: {0}")]
    NotSupport(&'static str),

    /// The body or stream was closed before the read completed.
    #[error("stream closed")]
    Closed,

    /// A non-blocking read found no data.
    #[error("operation would block")]
    WouldBlock,

    /// Fewer bytes were available than required.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// `open` was called on a connection that is already open.
    #[error("connection {0} is already open")]
    AlreadyOpen(u32),

    /// A write or send was attempted after `close`.
    #[error("connection {0} is closed")]
    ConnectionClosed(u32),

    /// Sequence ID zero is reserved.
    #[error("sequence id 0 is reserved")]
    InvalidSeqId,

    /// No protocol is bound to the connection.
    #[error("no protocol bound to connection {0}")]
    Unbound(u32),

    /// A handler reported an application status.
    #[error("status {code}: {info}")]
    Status {
        /// Status code sent to the peer.
        code: i32,
        /// Human readable status text.
        info: String,
    },

    /// Payload encoding or decoding failed.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// The wire codec rejected a frame.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The executor refused a task.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Route registration or resolution failed.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build an application status error.
    #[must_use]
    pub fn status(code: i32, info: impl Into<String>) -> Self {
        Self::Status {
            code,
            info: info.into(),
        }
    }

    /// Whether the error leaves the connection unusable.
    ///
    /// Decode failures and socket errors are fatal; everything else aborts
    /// only the current traversal.
    #[must_use]
    pub fn is_fatal(&self) -> bool { matches!(self, Self::Codec(_) | Self::Io(_)) }

    /// Status code reported to the peer when this error ends a request.
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Status { code, .. } => *code,
            Self::Router(RouterError::NoRoute(_)) => 404,
            Self::Payload(_) => 400,
            Self::ConnectionClosed(_) | Self::Closed => 503,
            _ => 500,
        }
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
