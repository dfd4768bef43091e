//! Protocol detection and frame codecs.
//!
//! A [`Protocol`] recognises its own traffic from the first bytes of a
//! connection and creates a per-connection [`FrameCodec`]. Codecs are
//! stateful: [`FrameCodec::decode`] consumes bytes from the connection's read
//! buffer and returns `Ok(None)` until a whole frame is available, and
//! [`FrameCodec::encode`] turns a [`Frame`] into wire bytes.
//!
//! Two protocols ship with the crate and are registered by default:
//! [`rpc::RpcProtocol`] (length-delimited binary frames) and
//! [`http1::Http1Protocol`].

pub mod error;
mod filter;
pub mod http1;
pub mod payload;
pub mod rpc;
pub mod varint;

use std::{
    fmt,
    sync::{Arc, LazyLock, PoisonError, RwLock},
};

pub use error::{CodecError, EofError, FramingError, ProtocolError};
pub use filter::CodecFilter;
pub use payload::PayloadError;

use crate::{
    buffer::Buffer,
    packet::{HeaderMap, Identifier},
};

/// Largest frame accepted by the RPC codec (16 MiB).
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Position of a frame within its message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    /// Carries the identifier and headers; always first.
    Header = 0,
    /// Carries body bytes.
    Data = 1,
    /// Carries trailers; always last.
    Trailer = 2,
}

/// Smallest unit produced and consumed by a codec.
///
/// For a multi-frame message exactly one Header frame comes first and exactly
/// one frame sets `end`. Trailer frames always set `end`.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Frame type.
    pub kind: FrameType,
    /// Last frame of the message.
    pub end: bool,
    /// Per-connection stream.
    pub stream_id: u32,
    /// Message metadata, present on Header frames.
    pub ident: Option<Identifier>,
    /// Headers, present on Header frames.
    pub header: Option<HeaderMap>,
    /// Trailers, present on Trailer frames.
    pub trailer: Option<HeaderMap>,
    /// Body bytes.
    pub payload: Option<Buffer>,
}

impl Frame {
    /// Header frame.
    #[must_use]
    pub fn header(
        stream_id: u32,
        ident: Identifier,
        header: HeaderMap,
        payload: Option<Buffer>,
        end: bool,
    ) -> Self {
        Self {
            kind: FrameType::Header,
            end,
            stream_id,
            ident: Some(ident),
            header: Some(header),
            trailer: None,
            payload,
        }
    }

    /// Data frame.
    #[must_use]
    pub fn data(stream_id: u32, payload: Option<Buffer>, end: bool) -> Self {
        Self {
            kind: FrameType::Data,
            end,
            stream_id,
            ident: None,
            header: None,
            trailer: None,
            payload,
        }
    }

    /// Trailer frame; always ends the message.
    #[must_use]
    pub fn trailer(stream_id: u32, trailer: HeaderMap) -> Self {
        Self {
            kind: FrameType::Trailer,
            end: true,
            stream_id,
            ident: None,
            header: None,
            trailer: Some(trailer),
            payload: None,
        }
    }

    /// Bytes of payload carried.
    #[must_use]
    pub fn payload_len(&self) -> usize { self.payload.as_ref().map_or(0, Buffer::available) }
}

/// Outcome of inspecting the first bytes of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Detection {
    /// The bytes belong to this protocol.
    Matched,
    /// The bytes cannot belong to this protocol.
    Rejected,
    /// More bytes are needed to decide.
    Incomplete,
}

/// A wire protocol.
pub trait Protocol: Send + Sync {
    /// Unique name.
    fn name(&self) -> &'static str;

    /// Inspect the first bytes of a connection without consuming them.
    fn detect(&self, data: &[u8]) -> Detection;

    /// Create codec state for one connection.
    fn new_codec(&self, is_client: bool) -> Box<dyn FrameCodec>;
}

/// Per-connection codec state.
pub trait FrameCodec: Send {
    /// Decode the next frame from the cursor of `buf`.
    ///
    /// Consumed bytes are left behind the cursor; the caller discards them.
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Any error leaves the stream unframed and is fatal.
    fn decode(&mut self, buf: &mut Buffer) -> Result<Option<Frame>, CodecError>;

    /// Decode after the peer has closed.
    ///
    /// The default decodes whatever is complete and fails if bytes remain.
    ///
    /// # Errors
    ///
    /// Returns [`EofError::MidFrame`] when a partial frame is buffered.
    fn decode_eof(&mut self, buf: &mut Buffer) -> Result<Option<Frame>, CodecError> {
        if buf.available() == 0 {
            return Ok(None);
        }
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => Err(EofError::MidFrame {
                bytes_received: buf.available(),
            }
            .into()),
        }
    }

    /// Encode `frame` to wire bytes.
    ///
    /// # Errors
    ///
    /// Fails if the frame cannot be represented in this protocol.
    fn encode(&mut self, frame: Frame) -> Result<Buffer, CodecError>;
}

static REGISTRY: LazyLock<RwLock<Vec<Arc<dyn Protocol>>>> =
    LazyLock::new(|| RwLock::new(default_protocols()));

fn default_protocols() -> Vec<Arc<dyn Protocol>> {
    vec![Arc::new(rpc::RpcProtocol), Arc::new(http1::Http1Protocol)]
}

/// Register `protocol`, replacing any with the same name.
pub fn register(protocol: Arc<dyn Protocol>) {
    let mut protocols = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    protocols.retain(|p| p.name() != protocol.name());
    protocols.push(protocol);
}

/// Registered protocol named `name`.
#[must_use]
pub fn lookup(name: &str) -> Option<Arc<dyn Protocol>> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .find(|p| p.name() == name)
        .cloned()
}

/// Snapshot of the registered protocols in registration order.
#[must_use]
pub fn protocols() -> Vec<Arc<dyn Protocol>> {
    REGISTRY.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Restore the built-in protocol set.
#[doc(hidden)]
pub fn reset_registry() {
    *REGISTRY.write().unwrap_or_else(PoisonError::into_inner) = default_protocols();
}

/// Number of leading bytes handed to [`Protocol::detect`].
pub const DETECT_PEEK: usize = 16;

/// Selects a protocol for a connection from its first bytes.
#[derive(Clone)]
pub struct Detector {
    protocols: Vec<Arc<dyn Protocol>>,
}

/// Result of [`Detector::detect`].
#[derive(Clone)]
pub enum Detected {
    /// A protocol claimed the bytes.
    Protocol(Arc<dyn Protocol>),
    /// Some protocol needs more bytes.
    NeedMore,
    /// Every protocol rejected the bytes.
    Unknown,
}

impl Detector {
    /// Detector over `protocols`, tried in order.
    #[must_use]
    pub fn new(protocols: Vec<Arc<dyn Protocol>>) -> Self { Self { protocols } }

    /// Detector over the global registry.
    #[must_use]
    pub fn from_registry() -> Self { Self::new(protocols()) }

    /// Try each protocol in order.
    #[must_use]
    pub fn detect(&self, data: &[u8]) -> Detected {
        let mut need_more = false;
        for protocol in &self.protocols {
            match protocol.detect(data) {
                Detection::Matched => return Detected::Protocol(Arc::clone(protocol)),
                Detection::Incomplete => need_more = true,
                Detection::Rejected => {}
            }
        }
        if need_more {
            Detected::NeedMore
        } else {
            Detected::Unknown
        }
    }
}

impl Default for Detector {
    fn default() -> Self { Self::from_registry() }
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.protocols.iter().map(|p| p.name())).finish()
    }
}

#[cfg(test)]
mod tests;
