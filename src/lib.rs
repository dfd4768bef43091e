#![doc(html_root_url = "https://docs.rs/kgnet/latest")]
//! Public API for the `kgnet` library.
//!
//! `kgnet` is a TCP networking runtime. Sockets feed a [`filter`] chain whose
//! first stage detects the protocol and decodes frames ([`codec`]) and whose
//! last stage assembles [`packet`]s and runs them on an [`executor`]. Inbound
//! requests are matched by the [`router`] and served by [`handler`]s;
//! responses to outbound calls are correlated by the [`caller`].
//!
//! [`server::Server`] and [`client::Client`] assemble these pieces.

pub mod attr;
pub mod buffer;
pub mod caller;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod filter;
pub mod handler;
pub mod metrics;
pub mod packet;
pub mod panic;
pub mod prelude;
pub mod processor;
pub mod router;
pub mod server;
pub mod timer;
pub mod transport;

pub use error::{Error, Result};
pub use metrics::{CALL_TIMEOUTS, CONNECTIONS_ACTIVE, Direction, ERRORS_TOTAL, FRAMES_PROCESSED};
