//! HTTP/1.x framing.
//!
//! The decoder is a per-connection state machine fed from the connection's
//! read buffer. Messages with a known length become a single Header frame
//! carrying the whole body. Chunked messages become a Header frame with
//! `end` unset, one Data frame per chunk and a closing Trailer frame.
//! Responses without a length or chunking run until the peer closes.
//!
//! Servers decode requests and encode responses; clients do the reverse.
//! A client codec remembers the method and sequence ID of each request it
//! encodes so responses are matched in order and `HEAD` replies are known
//! to carry no body. Interim `1xx` responses other than `101` are consumed
//! without producing a frame.
//!
//! A server codec writes responses in request order. A response encoded
//! ahead of an earlier request's response is held back until every
//! response before it has been written.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt::Write as _,
};

use super::{
    Detection,
    Frame,
    FrameCodec,
    FrameType,
    MAX_FRAME_LENGTH,
    Protocol,
    error::{CodecError, EofError, FramingError, ProtocolError},
};
use crate::{
    buffer::Buffer,
    packet::{CodecType, HTTP_10, HTTP_11, HeaderMap, Identifier, Method},
};

/// Longest start, header or chunk-size line accepted.
pub const MAX_LINE: usize = 64 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";
const TRANSFER_ENCODING: &str = "Transfer-Encoding";
const CONTENT_TYPE: &str = "Content-Type";
const TRAILER: &str = "Trailer";
const FORBIDDEN_TRAILERS: [&str; 3] = [TRANSFER_ENCODING, TRAILER, CONTENT_LENGTH];

/// The HTTP/1.0 and HTTP/1.1 protocol.
#[derive(Clone, Copy, Debug, Default)]
pub struct Http1Protocol;

impl Protocol for Http1Protocol {
    fn name(&self) -> &'static str { "http1" }

    fn detect(&self, data: &[u8]) -> Detection {
        const RESPONSE: &[u8] = b"HTTP/1.";
        let tokens = Method::REQUEST_METHODS
            .iter()
            .map(|m| m.as_str().as_bytes())
            .chain(std::iter::once(RESPONSE));
        let mut incomplete = false;
        for token in tokens {
            if data.len() <= token.len() {
                incomplete |= token.starts_with(data);
                continue;
            }
            if data.starts_with(token) && (token == RESPONSE || data[token.len()] == b' ') {
                return Detection::Matched;
            }
        }
        if incomplete {
            Detection::Incomplete
        } else {
            Detection::Rejected
        }
    }

    fn new_codec(&self, is_client: bool) -> Box<dyn FrameCodec> { Box::new(Http1Codec::new(is_client)) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Ident,
    Header,
    Body { len: usize },
    Chunk,
    ChunkData { left: usize },
    Trailer,
    CloseDelimited,
}

/// Responses waiting for earlier requests to be answered, keyed by
/// request sequence ID.
#[derive(Debug, Default)]
struct Replies {
    next: u32,
    held: BTreeMap<u32, (Buffer, bool)>,
    streams: HashMap<u32, u32>,
}

impl Replies {
    fn new() -> Self {
        Self {
            next: 1,
            ..Self::default()
        }
    }

    /// Order the encoded bytes of `frame` behind earlier responses.
    fn order(&mut self, frame: &Frame, out: Buffer) -> Buffer {
        let seq = match frame.kind {
            FrameType::Header => match &frame.ident {
                Some(ident) if !ident.is_request && ident.seq_id != 0 => {
                    if !frame.end {
                        self.streams.insert(frame.stream_id, ident.seq_id);
                    }
                    ident.seq_id
                }
                _ => return out,
            },
            FrameType::Data | FrameType::Trailer => {
                let seq = if frame.end {
                    self.streams.remove(&frame.stream_id)
                } else {
                    self.streams.get(&frame.stream_id).copied()
                };
                let Some(seq) = seq else {
                    return out;
                };
                seq
            }
        };
        if seq > self.next {
            let (held, done) = self.held.entry(seq).or_insert_with(|| (Buffer::new(), false));
            held.append_buffer(out);
            *done |= frame.end;
            tracing::trace!(seq_id = seq, waiting_for = self.next, "response held for ordering");
            return Buffer::new();
        }
        if seq < self.next || !frame.end {
            return out;
        }
        let mut out = out;
        self.next = self.next.wrapping_add(1).max(1);
        while let Some(entry) = self.held.first_entry() {
            if *entry.key() != self.next {
                break;
            }
            let (held, done) = entry.remove();
            out.append_buffer(held);
            if !done {
                break;
            }
            self.next = self.next.wrapping_add(1).max(1);
        }
        out.rewind();
        out
    }
}

/// Per-connection HTTP/1 codec.
#[derive(Debug)]
pub struct Http1Codec {
    is_client: bool,
    state: State,
    lines: Vec<String>,
    head: Option<(Identifier, HeaderMap)>,
    stream_id: u32,
    next_seq: u32,
    next_stream: u32,
    sent: VecDeque<(Option<Method>, u32)>,
    head_request: bool,
    trailers: Vec<String>,
    replies: Replies,
}

impl Http1Codec {
    /// Codec for the client (`true`) or server side of a connection.
    #[must_use]
    pub fn new(is_client: bool) -> Self {
        Self {
            is_client,
            state: State::Ident,
            lines: Vec::new(),
            head: None,
            stream_id: 0,
            next_seq: 0,
            next_stream: 0,
            sent: VecDeque::new(),
            head_request: false,
            trailers: Vec::new(),
            replies: Replies::new(),
        }
    }

    fn next_line(buf: &mut Buffer, what: &'static str) -> Result<Option<String>, CodecError> {
        let Some(line) = buf.read_line() else {
            if buf.available() > MAX_LINE {
                return Err(ProtocolError::MalformedHeader(format!("{what} line too long")).into());
            }
            return Ok(None);
        };
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf8(what).into())
    }

    fn parse_version(v: &str) -> Result<u32, ProtocolError> {
        match v {
            "HTTP/1.1" => Ok(HTTP_11),
            "HTTP/1.0" => Ok(HTTP_10),
            other => Err(ProtocolError::UnsupportedVersion {
                version: other.to_owned(),
            }),
        }
    }

    fn parse_request_line(&mut self, line: &str) -> Result<Identifier, ProtocolError> {
        let malformed = || ProtocolError::MalformedStartLine(line.to_owned());
        let mut parts = line.splitn(3, ' ');
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        let method: Method = method.parse().map_err(|_| malformed())?;
        if target.is_empty() {
            return Err(malformed());
        }
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        let mut ident = Identifier::request(target);
        ident.method = Some(method);
        ident.version = Self::parse_version(version)?;
        ident.seq_id = self.next_seq;
        self.head_request = false;
        Ok(ident)
    }

    fn parse_status_line(&mut self, line: &str) -> Result<Identifier, ProtocolError> {
        let malformed = || ProtocolError::MalformedStartLine(line.to_owned());
        let mut parts = line.splitn(3, ' ');
        let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
            return Err(malformed());
        };
        if code.len() != 3 {
            return Err(malformed());
        }
        let status_code: i32 = code.parse().map_err(|_| malformed())?;
        let (method, seq_id) = if is_interim(status_code) {
            self.sent.front().copied().unwrap_or((None, 0))
        } else {
            self.sent.pop_front().unwrap_or((None, 0))
        };
        self.head_request = method == Some(Method::Head);
        let mut ident = Identifier::default();
        ident.version = Self::parse_version(version)?;
        ident.is_request = false;
        ident.seq_id = seq_id;
        ident.status_code = status_code;
        ident.status_info = parts.next().unwrap_or_default().to_owned();
        Ok(ident)
    }

    fn parse_fields(lines: &[String]) -> Result<HeaderMap, ProtocolError> {
        let mut header = HeaderMap::new();
        for line in lines {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::MalformedHeader(line.clone()))?;
            if key.is_empty() || key.bytes().any(|b| b.is_ascii_whitespace()) {
                return Err(ProtocolError::MalformedHeader(line.clone()));
            }
            header.add(canonical_key(key), value.trim());
        }
        Ok(header)
    }

    fn push_line(&mut self, line: String) -> Result<(), ProtocolError> {
        if line.starts_with([' ', '\t']) {
            let Some(last) = self.lines.last_mut() else {
                return Err(ProtocolError::MalformedHeader(line));
            };
            last.push(' ');
            last.push_str(line.trim());
        } else {
            self.lines.push(line);
        }
        Ok(())
    }

    /// Apply message framing rules once the header block is complete.
    ///
    /// Returns the Header frame when it can be emitted before the body.
    fn finish_head(&mut self) -> Result<Option<Frame>, CodecError> {
        let Some((mut ident, _)) = self.head.take() else {
            return Err(ProtocolError::MissingField { field: "start line" }.into());
        };
        let mut header = Self::parse_fields(&std::mem::take(&mut self.lines))?;

        let chunked = header
            .get_all(TRANSFER_ENCODING)
            .iter()
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case("chunked"));
        let mut length = None;
        for value in header.get_all(CONTENT_LENGTH).iter().flat_map(|v| v.split(',')) {
            let n: usize = value
                .trim()
                .parse()
                .map_err(|_| ProtocolError::InvalidContentLength(value.to_owned()))?;
            if length.is_some_and(|prev| prev != n) {
                return Err(ProtocolError::InvalidContentLength(value.to_owned()).into());
            }
            length = Some(n);
        }
        if chunked && length.is_some() {
            return Err(ProtocolError::LengthWithChunked.into());
        }
        let mut trailers = Vec::new();
        for name in header.get_all(TRAILER).iter().flat_map(|v| v.split(',')) {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if FORBIDDEN_TRAILERS.iter().any(|f| f.eq_ignore_ascii_case(name)) {
                return Err(ProtocolError::ForbiddenTrailer(name.to_owned()).into());
            }
            trailers.push(canonical_key(name));
        }
        if !ident.is_request && is_interim(ident.status_code) {
            tracing::trace!(status = ident.status_code, "interim response skipped");
            self.state = State::Ident;
            return Ok(None);
        }
        self.trailers = trailers;
        header.del(CONTENT_LENGTH);
        header.del(TRANSFER_ENCODING);
        if let Some(ct) = header.get(CONTENT_TYPE) {
            ident.codec = CodecType::from_content_type(ct);
        }

        self.next_stream = self.next_stream.wrapping_add(1);
        self.stream_id = self.next_stream;
        let stream_id = self.stream_id;

        let no_body = !ident.is_request
            && (self.head_request || has_no_body(ident.status_code));
        let frame = if no_body {
            self.state = State::Ident;
            Frame::header(stream_id, ident, header, None, true)
        } else if chunked {
            self.state = State::Chunk;
            Frame::header(stream_id, ident, header, None, false)
        } else {
            match length {
                Some(0) => {
                    self.state = State::Ident;
                    Frame::header(stream_id, ident, header, None, true)
                }
                Some(len) if len > MAX_FRAME_LENGTH => {
                    return Err(FramingError::OversizedFrame {
                        size: len,
                        max: MAX_FRAME_LENGTH,
                    }
                    .into());
                }
                Some(len) => {
                    self.state = State::Body { len };
                    self.head = Some((ident, header));
                    return Ok(None);
                }
                None if ident.is_request => {
                    self.state = State::Ident;
                    Frame::header(stream_id, ident, header, None, true)
                }
                None => {
                    self.state = State::CloseDelimited;
                    Frame::header(stream_id, ident, header, None, false)
                }
            }
        };
        Ok(Some(frame))
    }

    fn parse_chunk_size(line: &str) -> Result<usize, FramingError> {
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size, 16).map_err(|_| FramingError::MalformedChunk(line.to_owned()))?;
        if size > MAX_FRAME_LENGTH {
            return Err(FramingError::MalformedChunk(format!(
                "chunk size {size} exceeds {MAX_FRAME_LENGTH}"
            )));
        }
        Ok(size)
    }

    /// Trailer frame holding only the fields the `Trailer` header declared.
    fn trailer_frame(&mut self) -> Result<Frame, CodecError> {
        let fields = Self::parse_fields(&std::mem::take(&mut self.lines))?;
        let declared = std::mem::take(&mut self.trailers);
        let mut trailer = HeaderMap::new();
        for (key, values) in fields.iter() {
            if !declared.iter().any(|d| d.eq_ignore_ascii_case(key)) {
                tracing::debug!(stream_id = self.stream_id, field = key, "undeclared trailer field dropped");
                continue;
            }
            for value in values {
                trailer.add(key, value.as_str());
            }
        }
        self.state = State::Ident;
        Ok(Frame::trailer(self.stream_id, trailer))
    }
}

/// Informational statuses followed by the final response.
fn is_interim(status: i32) -> bool { (100..200).contains(&status) && status != 101 }

/// Status codes whose responses never carry a body.
fn has_no_body(status: i32) -> bool { (100..200).contains(&status) || status == 204 || status == 304 }

/// `content-type` becomes `Content-Type`.
#[must_use]
pub fn canonical_key(key: &str) -> String {
    let mut upper = true;
    key.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

/// Standard reason phrase for `status`.
#[must_use]
pub fn reason_phrase(status: i32) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

fn version_str(version: u32) -> &'static str {
    if version == HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

fn is_framing_header(key: &str) -> bool {
    key.eq_ignore_ascii_case(CONTENT_LENGTH) || key.eq_ignore_ascii_case(TRANSFER_ENCODING)
}

fn write_fields(out: &mut String, fields: &HeaderMap) {
    for (key, values) in fields.iter() {
        if is_framing_header(key) {
            continue;
        }
        for value in values {
            let _ = write!(out, "{key}: {value}\r\n");
        }
    }
}

fn chunk(out: &mut Buffer, payload: Option<Buffer>) {
    let Some(payload) = payload.filter(|p| p.available() > 0) else {
        return;
    };
    out.append(format!("{:x}\r\n", payload.available()).as_bytes());
    out.append_buffer(payload);
    out.append(b"\r\n");
}

impl Http1Codec {
    fn encode_head(&mut self, frame: &Frame) -> Result<String, CodecError> {
        let ident = frame.ident.as_ref().ok_or(ProtocolError::MissingField {
            field: "identifier",
        })?;
        let mut out = String::with_capacity(128);
        if ident.is_request {
            let method = ident
                .method
                .filter(|m| *m != Method::Any)
                .ok_or(ProtocolError::MissingField { field: "method" })?;
            let target = if ident.uri().is_empty() { "/" } else { ident.uri() };
            let _ = write!(out, "{method} {target} {}\r\n", version_str(ident.version));
            if self.is_client {
                self.sent.push_back((Some(method), ident.seq_id));
            }
        } else {
            let reason = if ident.status_info.is_empty() {
                reason_phrase(ident.status_code)
            } else {
                ident.status_info.as_str()
            };
            let _ = write!(
                out,
                "{} {} {reason}\r\n",
                version_str(ident.version),
                ident.status_code
            );
        }
        let header = frame.header.as_ref();
        if let Some(header) = header {
            write_fields(&mut out, header);
        }
        if ident.codec != CodecType::Raw && !header.is_some_and(|h| h.contains(CONTENT_TYPE)) {
            let _ = write!(out, "{CONTENT_TYPE}: {}\r\n", ident.codec.content_type());
        }
        let len = frame.payload_len();
        if !frame.end {
            let _ = write!(out, "{TRANSFER_ENCODING}: chunked\r\n");
        } else if !(ident.is_request || has_no_body(ident.status_code)) || len > 0 {
            let _ = write!(out, "{CONTENT_LENGTH}: {len}\r\n");
        }
        out.push_str("\r\n");
        Ok(out)
    }
}

impl FrameCodec for Http1Codec {
    fn decode(&mut self, buf: &mut Buffer) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.state {
                State::Ident => {
                    let Some(line) = Self::next_line(buf, "start line")? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        continue;
                    }
                    let ident = if self.is_client {
                        self.parse_status_line(&line)?
                    } else {
                        self.parse_request_line(&line)?
                    };
                    self.head = Some((ident, HeaderMap::new()));
                    self.state = State::Header;
                }
                State::Header => {
                    let Some(line) = Self::next_line(buf, "header")? else {
                        return Ok(None);
                    };
                    if !line.is_empty() {
                        self.push_line(line)?;
                        continue;
                    }
                    if let Some(frame) = self.finish_head()? {
                        tracing::trace!(stream_id = frame.stream_id, end = frame.end, "decoded http head");
                        return Ok(Some(frame));
                    }
                }
                State::Body { len } => {
                    if buf.available() < len {
                        return Ok(None);
                    }
                    let payload = buf.read_n(len).map_err(|_| FramingError::Truncated("body"))?;
                    let Some((ident, header)) = self.head.take() else {
                        return Err(ProtocolError::MissingField { field: "start line" }.into());
                    };
                    self.state = State::Ident;
                    return Ok(Some(Frame::header(self.stream_id, ident, header, Some(payload), true)));
                }
                State::Chunk => {
                    let Some(line) = Self::next_line(buf, "chunk size")? else {
                        return Ok(None);
                    };
                    self.state = match Self::parse_chunk_size(&line)? {
                        0 => State::Trailer,
                        left => State::ChunkData { left },
                    };
                }
                State::ChunkData { left } => {
                    let need = left
                        .checked_add(2)
                        .ok_or_else(|| FramingError::MalformedChunk(format!("chunk size {left} overflows")))?;
                    if buf.available() < need {
                        return Ok(None);
                    }
                    let payload = buf.read_n(left).map_err(|_| FramingError::Truncated("chunk"))?;
                    let mut crlf = [0_u8; 2];
                    buf.read(&mut crlf);
                    if &crlf != b"\r\n" {
                        return Err(FramingError::MalformedChunk("missing CRLF after chunk data".into()).into());
                    }
                    self.state = State::Chunk;
                    return Ok(Some(Frame::data(self.stream_id, Some(payload), false)));
                }
                State::Trailer => {
                    let Some(line) = Self::next_line(buf, "trailer")? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        return self.trailer_frame().map(Some);
                    }
                    self.push_line(line)?;
                }
                State::CloseDelimited => {
                    let n = buf.available();
                    if n == 0 {
                        return Ok(None);
                    }
                    let payload = buf.read_n(n).map_err(|_| FramingError::Truncated("body"))?;
                    return Ok(Some(Frame::data(self.stream_id, Some(payload), false)));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut Buffer) -> Result<Option<Frame>, CodecError> {
        if self.state == State::CloseDelimited {
            let n = buf.available();
            let payload = if n == 0 {
                None
            } else {
                Some(buf.read_n(n).map_err(|_| FramingError::Truncated("body"))?)
            };
            self.state = State::Ident;
            return Ok(Some(Frame::data(self.stream_id, payload, true)));
        }
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if self.state == State::Ident && buf.available() == 0 {
            return Ok(None);
        }
        Err(EofError::MidFrame {
            bytes_received: buf.available(),
        }
        .into())
    }

    fn encode(&mut self, mut frame: Frame) -> Result<Buffer, CodecError> {
        let mut out = Buffer::new();
        match frame.kind {
            FrameType::Header => {
                let head = self.encode_head(&frame)?;
                out.append(head.as_bytes());
                if frame.end {
                    if let Some(payload) = frame.payload.take() {
                        out.append_buffer(payload);
                    }
                } else {
                    chunk(&mut out, frame.payload.take());
                }
            }
            FrameType::Data => {
                chunk(&mut out, frame.payload.take());
                if frame.end {
                    out.append(b"0\r\n\r\n");
                }
            }
            FrameType::Trailer => {
                let mut tail = String::from("0\r\n");
                if let Some(trailer) = &frame.trailer {
                    write_fields(&mut tail, trailer);
                }
                tail.push_str("\r\n");
                out.append(tail.as_bytes());
            }
        }
        out.rewind();
        if self.is_client {
            return Ok(out);
        }
        Ok(self.replies.order(&frame, out))
    }
}

#[cfg(test)]
#[path = "http1_tests.rs"]
mod tests;
