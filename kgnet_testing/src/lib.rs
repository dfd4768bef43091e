//! Test support for `kgnet`.
//!
//! - [`logger`] serialises access to a captured [`logtest::Logger`];
//! - [`frames_to_bytes`] and [`decode_all`] drive a protocol's codec over
//!   in-memory bytes;
//! - [`spawn_echo_server`] starts a server answering RPC `onPing` and HTTP
//!   `/echo`, and [`black_hole_listener`] accepts connections that never
//!   reply.
//!
//! ```rust
//! use kgnet::codec::{Frame, rpc::RpcProtocol};
//! use kgnet::packet::Request;
//! use kgnet_testing::{decode_all, frames_to_bytes};
//!
//! let packet = Request::new("onPing").into_packet();
//! let frame = Frame::header(0, packet.ident, packet.header, None, true);
//! let bytes = frames_to_bytes(&RpcProtocol, true, vec![frame]).unwrap();
//! assert_eq!(decode_all(&RpcProtocol, false, &bytes).unwrap().len(), 1);
//! ```

pub mod codec;
pub mod logging;
pub mod servers;

pub use codec::{decode_all, frames_to_bytes};
pub use logging::{LoggerHandle, logger};
pub use servers::{EchoServer, black_hole_listener, spawn_echo_server, test_config, unused_addr};

/// Result type for fallible tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;
