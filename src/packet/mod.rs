//! Logical messages and their metadata.
//!
//! A [`Packet`] is what the processor assembles from one or more frames: an
//! [`Identifier`], header and trailer maps, and a [`Body`]. [`Request`] and
//! [`Response`] wrap a packet and expose the fields relevant to each side.

mod body;
mod header;

use std::{fmt, str::FromStr, sync::OnceLock};

pub use body::{Body, FileBody, StreamBody, StreamWriter};
pub use header::HeaderMap;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    codec::payload,
    error::{Error, Result},
};

/// Default protocol version for RPC messages.
pub const RPC_VERSION: u32 = 1;
/// `HTTP/1.1` packed as `major << 8 | minor`.
pub const HTTP_11: u32 = 0x0101;
/// `HTTP/1.0` packed as `major << 8 | minor`.
pub const HTTP_10: u32 = 0x0100;

/// HTTP-style request method.
///
/// `Any` only appears in routes, where it matches every method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Any,
}

impl Method {
    /// Wire token.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
            Self::Any => "ANY",
        }
    }

    /// Every method a request can carry.
    pub const REQUEST_METHODS: [Self; 9] = [
        Self::Get,
        Self::Head,
        Self::Post,
        Self::Put,
        Self::Delete,
        Self::Connect,
        Self::Options,
        Self::Trace,
        Self::Patch,
    ];
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::REQUEST_METHODS
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or(Error::NotSupport("unknown method"))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Kind of message carried by an RPC header frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

/// Serialisation applied to a message body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CodecType {
    /// Opaque bytes.
    #[default]
    Raw = 0,
    /// `serde_json`.
    Json = 1,
    /// `bincode` in serde mode with the standard configuration.
    Bincode = 2,
    /// UTF-8 text.
    Text = 3,
}

impl CodecType {
    /// Decode the low four bits of a codec byte.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v & 0x0f {
            0 => Some(Self::Raw),
            1 => Some(Self::Json),
            2 => Some(Self::Bincode),
            3 => Some(Self::Text),
            _ => None,
        }
    }

    /// HTTP `Content-Type` for this codec.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Raw => "application/octet-stream",
            Self::Json => "application/json",
            Self::Bincode => "application/x-bincode",
            Self::Text => "text/plain; charset=utf-8",
        }
    }

    /// Codec implied by an HTTP `Content-Type`; unknown types are raw.
    #[must_use]
    pub fn from_content_type(value: &str) -> Self {
        let mime = value.split(';').next().unwrap_or_default().trim();
        match mime.to_ascii_lowercase().as_str() {
            "application/json" => Self::Json,
            "application/x-bincode" => Self::Bincode,
            m if m.starts_with("text/") => Self::Text,
            _ => Self::Raw,
        }
    }
}

/// Path parameters bound by a route template.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    /// Value bound to `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Bind `name` to `value`.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// `(name, value)` pairs in binding order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    /// Whether nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

/// Per-message metadata.
#[derive(Clone, Debug)]
pub struct Identifier {
    /// Protocol version.
    pub version: u32,
    /// Request or response.
    pub is_request: bool,
    /// Request expects no response.
    pub oneway: bool,
    /// Correlates a request with its response. Zero means unassigned.
    pub seq_id: u32,
    /// Numeric route. Zero means absent.
    pub cmd_id: u32,
    /// HTTP method; `None` for RPC messages.
    pub method: Option<Method>,
    /// RPC service name.
    pub service: String,
    uri: String,
    uri_parts: OnceLock<(String, String)>,
    /// Parameters bound by the router.
    pub params: Params,
    /// Body serialisation.
    pub codec: CodecType,
    /// Response status code.
    pub status_code: i32,
    /// Response status text.
    pub status_info: String,
}

impl Default for Identifier {
    fn default() -> Self {
        Self {
            version: RPC_VERSION,
            is_request: true,
            oneway: false,
            seq_id: 0,
            cmd_id: 0,
            method: None,
            service: String::new(),
            uri: String::new(),
            uri_parts: OnceLock::new(),
            params: Params::default(),
            codec: CodecType::Raw,
            status_code: 200,
            status_info: String::new(),
        }
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.is_request == other.is_request
            && self.oneway == other.oneway
            && self.seq_id == other.seq_id
            && self.cmd_id == other.cmd_id
            && self.method == other.method
            && self.service == other.service
            && self.uri == other.uri
            && self.params == other.params
            && self.codec == other.codec
            && self.status_code == other.status_code
            && self.status_info == other.status_info
    }
}

impl Identifier {
    /// Request identifier for `uri`.
    #[must_use]
    pub fn request(uri: impl Into<String>) -> Self {
        let mut id = Self::default();
        id.set_uri(uri);
        id
    }

    /// Response identifier answering `req`.
    #[must_use]
    pub fn reply_to(req: &Self) -> Self {
        Self {
            version: req.version,
            is_request: false,
            seq_id: req.seq_id,
            codec: req.codec,
            ..Self::default()
        }
    }

    /// Raw request target.
    #[must_use]
    pub fn uri(&self) -> &str { &self.uri }

    /// Replace the request target.
    pub fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = uri.into();
        self.uri_parts = OnceLock::new();
    }

    fn parts(&self) -> &(String, String) {
        self.uri_parts.get_or_init(|| match self.uri.split_once('?') {
            Some((path, query)) => (path.to_owned(), query.to_owned()),
            None => (self.uri.clone(), String::new()),
        })
    }

    /// Path component of the URI, parsed on first use.
    #[must_use]
    pub fn path(&self) -> &str { &self.parts().0 }

    /// Query component of the URI without the `?`.
    #[must_use]
    pub fn query(&self) -> &str { &self.parts().1 }

    /// Message type implied by the flags and status.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match (self.is_request, self.oneway) {
            (true, true) => MessageType::Oneway,
            (true, false) => MessageType::Call,
            (false, _) if (200..300).contains(&self.status_code) => MessageType::Reply,
            (false, _) => MessageType::Exception,
        }
    }

    /// Set the request/oneway flags for `mt`.
    pub fn set_message_type(&mut self, mt: MessageType) {
        self.is_request = matches!(mt, MessageType::Call | MessageType::Oneway);
        self.oneway = mt == MessageType::Oneway;
    }
}

/// A logical message.
#[derive(Debug, Default)]
pub struct Packet {
    /// Message metadata.
    pub ident: Identifier,
    /// Leading headers.
    pub header: HeaderMap,
    /// Headers sent after a streamed body.
    pub trailer: HeaderMap,
    /// Payload.
    pub body: Body,
    /// Per-connection stream the packet travels on. Zero until assigned.
    pub stream_id: u32,
}

impl Packet {
    /// Packet with `ident` and an empty body.
    #[must_use]
    pub fn new(ident: Identifier) -> Self {
        Self {
            ident,
            ..Self::default()
        }
    }

    /// Copy of the packet if its body can be replayed.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        Some(Self {
            ident: self.ident.clone(),
            header: self.header.clone(),
            trailer: self.trailer.clone(),
            body: self.body.try_clone()?,
            stream_id: self.stream_id,
        })
    }
}

/// Request view of a [`Packet`].
#[derive(Debug, Default)]
pub struct Request(Packet);

impl Request {
    /// RPC request for `uri`.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self { Self(Packet::new(Identifier::request(uri))) }

    /// HTTP request for `method` and `uri`.
    #[must_use]
    pub fn http(method: Method, uri: impl Into<String>) -> Self {
        let mut req = Self::new(uri);
        req.0.ident.method = Some(method);
        req.0.ident.version = HTTP_11;
        req
    }

    /// RPC request routed by numeric command.
    #[must_use]
    pub fn command(cmd_id: u32) -> Self {
        let mut req = Self::default();
        req.0.ident.cmd_id = cmd_id;
        req
    }

    /// Wrap a packet; its request flag is forced on.
    #[must_use]
    pub fn from_packet(mut packet: Packet) -> Self {
        packet.ident.is_request = true;
        Self(packet)
    }

    /// Set the service name.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.0.ident.service = service.into();
        self
    }

    /// Set the body codec.
    #[must_use]
    pub fn with_codec(mut self, codec: CodecType) -> Self {
        self.0.ident.codec = codec;
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.0.body = body.into();
        self
    }

    /// Add a header value.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.header.add(key, value);
        self
    }

    /// Mark the request oneway.
    #[must_use]
    pub fn oneway(mut self) -> Self {
        self.0.ident.oneway = true;
        self
    }

    /// Serialise `value` with `codec` as the body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Payload`] if encoding fails.
    pub fn with_value<T: Serialize>(mut self, codec: CodecType, value: &T) -> Result<Self> {
        self.0.body = Body::from_buffer(payload::encode(codec, value)?);
        self.0.ident.codec = codec;
        Ok(self)
    }

    /// Metadata.
    #[must_use]
    pub fn ident(&self) -> &Identifier { &self.0.ident }

    /// Mutable metadata.
    pub fn ident_mut(&mut self) -> &mut Identifier { &mut self.0.ident }

    /// Method, `None` for RPC requests.
    #[must_use]
    pub fn method(&self) -> Option<Method> { self.0.ident.method }

    /// Raw target.
    #[must_use]
    pub fn uri(&self) -> &str { self.0.ident.uri() }

    /// Target path.
    #[must_use]
    pub fn path(&self) -> &str { self.0.ident.path() }

    /// Target query.
    #[must_use]
    pub fn query(&self) -> &str { self.0.ident.query() }

    /// Parameters bound by the router.
    #[must_use]
    pub fn params(&self) -> &Params { &self.0.ident.params }

    /// Sequence id.
    #[must_use]
    pub fn seq_id(&self) -> u32 { self.0.ident.seq_id }

    /// Numeric command.
    #[must_use]
    pub fn cmd_id(&self) -> u32 { self.0.ident.cmd_id }

    /// Service name.
    #[must_use]
    pub fn service(&self) -> &str { &self.0.ident.service }

    /// Body codec.
    #[must_use]
    pub fn codec(&self) -> CodecType { self.0.ident.codec }

    /// Whether no response is expected.
    #[must_use]
    pub fn is_oneway(&self) -> bool { self.0.ident.oneway }

    /// Headers.
    #[must_use]
    pub fn header(&self) -> &HeaderMap { &self.0.header }

    /// Mutable headers.
    pub fn header_mut(&mut self) -> &mut HeaderMap { &mut self.0.header }

    /// Trailers.
    #[must_use]
    pub fn trailer(&self) -> &HeaderMap { &self.0.trailer }

    /// Body.
    pub fn body_mut(&mut self) -> &mut Body { &mut self.0.body }

    /// Body.
    #[must_use]
    pub fn body(&self) -> &Body { &self.0.body }

    /// Deserialise the whole body with the request codec.
    ///
    /// # Errors
    ///
    /// Returns body read errors or [`Error::Payload`].
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<T> {
        let buf = self.0.body.read_all()?;
        Ok(payload::decode(self.0.ident.codec, &buf)?)
    }

    /// Underlying packet.
    #[must_use]
    pub fn packet(&self) -> &Packet { &self.0 }

    /// Underlying packet.
    pub fn packet_mut(&mut self) -> &mut Packet { &mut self.0 }

    /// Unwrap the packet.
    #[must_use]
    pub fn into_packet(self) -> Packet { self.0 }

    /// Copy of the request if its body can be replayed.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> { self.0.try_clone().map(Self) }
}

/// Response view of a [`Packet`].
#[derive(Debug)]
pub struct Response(Packet);

impl Default for Response {
    fn default() -> Self {
        let mut packet = Packet::default();
        packet.ident.is_request = false;
        Self(packet)
    }
}

impl Response {
    /// Empty `200` response answering `req`.
    #[must_use]
    pub fn for_request(req: &Request) -> Self {
        let mut packet = Packet::new(Identifier::reply_to(req.ident()));
        packet.stream_id = req.0.stream_id;
        Self(packet)
    }

    /// Response with `code` and `info` answering `req`.
    #[must_use]
    pub fn status_for(req: &Request, code: i32, info: impl Into<String>) -> Self {
        Self::for_request(req).with_status(code, info)
    }

    /// Wrap a packet; its request flag is forced off.
    #[must_use]
    pub fn from_packet(mut packet: Packet) -> Self {
        packet.ident.is_request = false;
        Self(packet)
    }

    /// Set status code and text.
    #[must_use]
    pub fn with_status(mut self, code: i32, info: impl Into<String>) -> Self {
        self.0.ident.status_code = code;
        self.0.ident.status_info = info.into();
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.0.body = body.into();
        self
    }

    /// Set the body codec.
    #[must_use]
    pub fn with_codec(mut self, codec: CodecType) -> Self {
        self.0.ident.codec = codec;
        self
    }

    /// Add a header value.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.header.add(key, value);
        self
    }

    /// Serialise `value` with the response codec as the body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Payload`] if encoding fails.
    pub fn with_value<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.0.body = Body::from_buffer(payload::encode(self.0.ident.codec, value)?);
        Ok(self)
    }

    /// Metadata.
    #[must_use]
    pub fn ident(&self) -> &Identifier { &self.0.ident }

    /// Mutable metadata.
    pub fn ident_mut(&mut self) -> &mut Identifier { &mut self.0.ident }

    /// Status code.
    #[must_use]
    pub fn status_code(&self) -> i32 { self.0.ident.status_code }

    /// Status text.
    #[must_use]
    pub fn status_info(&self) -> &str { &self.0.ident.status_info }

    /// Sequence id of the answered request.
    #[must_use]
    pub fn seq_id(&self) -> u32 { self.0.ident.seq_id }

    /// Body codec.
    #[must_use]
    pub fn codec(&self) -> CodecType { self.0.ident.codec }

    /// Headers.
    #[must_use]
    pub fn header(&self) -> &HeaderMap { &self.0.header }

    /// Mutable headers.
    pub fn header_mut(&mut self) -> &mut HeaderMap { &mut self.0.header }

    /// Trailers.
    #[must_use]
    pub fn trailer(&self) -> &HeaderMap { &self.0.trailer }

    /// Body.
    #[must_use]
    pub fn body(&self) -> &Body { &self.0.body }

    /// Body.
    pub fn body_mut(&mut self) -> &mut Body { &mut self.0.body }

    /// Deserialise the whole body with the response codec.
    ///
    /// # Errors
    ///
    /// Returns body read errors or [`Error::Payload`].
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<T> {
        let buf = self.0.body.read_all()?;
        Ok(payload::decode(self.0.ident.codec, &buf)?)
    }

    /// Whether the status is `2xx`.
    #[must_use]
    pub fn is_success(&self) -> bool { (200..300).contains(&self.0.ident.status_code) }

    /// Underlying packet.
    #[must_use]
    pub fn packet(&self) -> &Packet { &self.0 }

    /// Underlying packet.
    pub fn packet_mut(&mut self) -> &mut Packet { &mut self.0 }

    /// Unwrap the packet.
    #[must_use]
    pub fn into_packet(self) -> Packet { self.0 }
}

impl From<Request> for Packet {
    fn from(req: Request) -> Self { req.0 }
}

impl From<Response> for Packet {
    fn from(resp: Response) -> Self { resp.0 }
}
