//! Error types for client assembly.

use std::io;

use crate::executor::ExecutorError;

/// Errors emitted while building a [`Client`](super::Client).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The transport or timing wheel could not be started.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// The callback executor could not be started.
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
    /// No protocol is registered under the requested name.
    #[error("unknown protocol {0}")]
    UnknownProtocol(String),
}
