//! Errors raised while assembling or running a [`Server`](super::Server).

use std::io;

use thiserror::Error;

use crate::{executor::ExecutorError, router::RouterError};

/// Errors that may occur while building or running the server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// Binding or starting the transport failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// A route could not be registered.
    #[error("routing error: {0}")]
    Route(#[from] RouterError),
    /// The callback executor could not be started.
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
    /// Listening failed.
    #[error("listen error: {0}")]
    Listen(#[from] crate::error::Error),
}
