//! Length-delimited binary RPC protocol.
//!
//! ```text
//! Length    varint              bytes after the prefix
//! Flags     u16 big-endian
//!   0x8000  magic word present
//!   0x4000  version present
//!   0x2000  end of message
//!   0x1000  request routed by CmdID instead of URI
//!   11-10   frame type (0 Header, 1 Data, 2 Trailer)
//!   9-8     message type (0 Oneway, 1 Call, 2 Reply, 3 Exception)
//! Magic     u16 big-endian 0x4B47 (when flagged)
//! StreamID  varint
//! ```
//!
//! Header frames continue with `[Version]`, a codec byte, the SeqID, the
//! message-type fields (CmdID or URI for requests, status code and text for
//! exceptions), a header count and length-prefixed key/value strings. Any
//! remaining bytes are payload. Trailer frames carry only the header section.
//!
//! Multi-value headers are joined with `0x00`. The service name travels as
//! the `x-service` header.

use bytes::Buf;

use super::{
    Detection,
    Frame,
    FrameCodec,
    FrameType,
    MAX_FRAME_LENGTH,
    Protocol,
    error::{CodecError, FramingError, ProtocolError},
    varint::{self, MAX_U32_LEN, put_str, put_uvarint, read_str, read_u32, read_uvarint},
};
use crate::{
    buffer::Buffer,
    packet::{CodecType, HeaderMap, Identifier, MessageType, RPC_VERSION},
};

/// Magic word carried by header frames.
pub const MAGIC_WORD: u16 = 0x4B47;

const FLAG_MAGIC: u16 = 0x8000;
const FLAG_VERSION: u16 = 0x4000;
const FLAG_END: u16 = 0x2000;
const FLAG_CMD: u16 = 0x1000;

/// Header carrying [`Identifier::service`].
pub const SERVICE_HEADER: &str = "x-service";

/// The RPC protocol.
#[derive(Clone, Copy, Debug, Default)]
pub struct RpcProtocol;

impl Protocol for RpcProtocol {
    fn name(&self) -> &'static str { "rpc" }

    fn detect(&self, data: &[u8]) -> Detection {
        let (_, used) = match varint::uvarint(data) {
            Err(_) => return Detection::Rejected,
            Ok(None) if data.len() >= MAX_U32_LEN => return Detection::Rejected,
            Ok(None) => return Detection::Incomplete,
            Ok(Some(v)) => v,
        };
        let Some(flags) = data.get(used..used + 2) else {
            return Detection::Incomplete;
        };
        if u16::from_be_bytes([flags[0], flags[1]]) & FLAG_MAGIC == 0 {
            return Detection::Rejected;
        }
        match data.get(used + 2..used + 4) {
            None => Detection::Incomplete,
            Some(m) if u16::from_be_bytes([m[0], m[1]]) == MAGIC_WORD => Detection::Matched,
            Some(_) => Detection::Rejected,
        }
    }

    fn new_codec(&self, _is_client: bool) -> Box<dyn FrameCodec> { Box::new(RpcCodec::new()) }
}

/// Per-connection RPC codec. Stateless between frames.
#[derive(Clone, Copy, Debug)]
pub struct RpcCodec {
    max_frame_length: usize,
}

impl Default for RpcCodec {
    fn default() -> Self { Self::new() }
}

impl RpcCodec {
    /// Codec accepting frames up to [`MAX_FRAME_LENGTH`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }

    /// Codec accepting frames up to `max` bytes.
    #[must_use]
    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            max_frame_length: max,
        }
    }
}

/// Two bits on the wire, so oneway takes the otherwise unused value 0.
fn message_type_bits(mt: MessageType) -> u16 {
    match mt {
        MessageType::Oneway => 0,
        MessageType::Call => 1,
        MessageType::Reply => 2,
        MessageType::Exception => 3,
    }
}

fn message_type_from_bits(bits: u16) -> MessageType {
    match bits & 0x3 {
        0 => MessageType::Oneway,
        1 => MessageType::Call,
        2 => MessageType::Reply,
        _ => MessageType::Exception,
    }
}

fn put_headers(out: &mut Vec<u8>, header: &HeaderMap, service: Option<&str>) {
    let skip = |key: &str| service.is_some() && key == SERVICE_HEADER;
    let count = header.keys().filter(|k| !skip(k)).count() + usize::from(service.is_some());
    put_uvarint(out, count as u64);
    for (key, values) in header.iter() {
        if skip(key) {
            continue;
        }
        put_str(out, key);
        put_str(out, &values.join("\0"));
    }
    if let Some(service) = service {
        put_str(out, SERVICE_HEADER);
        put_str(out, service);
    }
}

fn read_headers(buf: &mut Buffer) -> Result<HeaderMap, CodecError> {
    let count = read_uvarint(buf)?;
    if count > buf.available() as u64 {
        return Err(FramingError::Truncated("header count").into());
    }
    let mut header = HeaderMap::new();
    for _ in 0..count {
        let key = read_str(buf, "header key")?;
        let value = read_str(buf, "header value")?;
        for part in value.split('\0') {
            header.add(key.clone(), part);
        }
    }
    Ok(header)
}

fn read_u16(buf: &mut Buffer, field: &'static str) -> Result<u16, FramingError> {
    if buf.available() < 2 {
        return Err(FramingError::Truncated(field));
    }
    Ok(buf.get_u16())
}

impl RpcCodec {
    fn encode_header(head: &mut Vec<u8>, frame: &Frame) -> Result<u16, CodecError> {
        let ident = frame.ident.as_ref().ok_or(ProtocolError::MissingField {
            field: "identifier",
        })?;
        let mt = ident.message_type();
        let mut flags = FLAG_MAGIC | message_type_bits(mt) << 8;
        if ident.version != RPC_VERSION {
            flags |= FLAG_VERSION;
        }
        let by_cmd = matches!(mt, MessageType::Call | MessageType::Oneway) && ident.cmd_id != 0;
        if by_cmd {
            flags |= FLAG_CMD;
        }
        if flags & FLAG_VERSION != 0 {
            put_uvarint(head, u64::from(ident.version));
        }
        head.push(ident.codec as u8);
        put_uvarint(head, u64::from(ident.seq_id));
        match mt {
            MessageType::Call | MessageType::Oneway if by_cmd => {
                put_uvarint(head, u64::from(ident.cmd_id));
            }
            MessageType::Call | MessageType::Oneway => put_str(head, ident.uri()),
            MessageType::Reply => {}
            MessageType::Exception => {
                put_uvarint(head, varint::zigzag(i64::from(ident.status_code)));
                put_str(head, &ident.status_info);
            }
        }
        let service = (!ident.service.is_empty()).then_some(ident.service.as_str());
        put_headers(head, frame.header.as_ref().unwrap_or(&HeaderMap::new()), service);
        Ok(flags)
    }

    fn decode_header(buf: &mut Buffer, flags: u16) -> Result<(Identifier, HeaderMap), CodecError> {
        let version = if flags & FLAG_VERSION == 0 {
            RPC_VERSION
        } else {
            read_u32(buf)?
        };
        if buf.available() == 0 {
            return Err(FramingError::Truncated("codec").into());
        }
        let codec_byte = buf.get_u8();
        let codec = CodecType::from_u8(codec_byte).ok_or(ProtocolError::UnknownCodec(codec_byte))?;
        let mut ident = Identifier::default();
        ident.version = version;
        ident.codec = codec;
        ident.seq_id = read_u32(buf)?;
        let mt = message_type_from_bits(flags >> 8);
        ident.set_message_type(mt);
        match mt {
            MessageType::Call | MessageType::Oneway if flags & FLAG_CMD != 0 => {
                ident.cmd_id = read_u32(buf)?;
            }
            MessageType::Call | MessageType::Oneway => ident.set_uri(read_str(buf, "uri")?),
            MessageType::Reply => {}
            MessageType::Exception => {
                ident.status_code = i32::try_from(varint::unzigzag(read_uvarint(buf)?))
                    .map_err(|_| FramingError::InvalidLengthEncoding)?;
                ident.status_info = read_str(buf, "status info")?;
            }
        }
        let mut header = read_headers(buf)?;
        if let Some(mut service) = header.del(SERVICE_HEADER) {
            ident.service = service.swap_remove(0);
        }
        Ok((ident, header))
    }

    fn parse(mut buf: Buffer) -> Result<Frame, CodecError> {
        let flags = read_u16(&mut buf, "flags")?;
        if flags & FLAG_MAGIC != 0 {
            let magic = read_u16(&mut buf, "magic")?;
            if magic != MAGIC_WORD {
                return Err(FramingError::BadMagic(magic).into());
            }
        }
        let end = flags & FLAG_END != 0;
        let stream_id = read_u32(&mut buf)?;
        let kind_bits = ((flags >> 10) & 0x3) as u8;
        let mut frame = match kind_bits {
            0 => {
                let (ident, header) = Self::decode_header(&mut buf, flags)?;
                Frame::header(stream_id, ident, header, None, end)
            }
            1 => Frame::data(stream_id, None, end),
            2 => Frame::trailer(stream_id, read_headers(&mut buf)?),
            other => return Err(FramingError::UnknownFrameType(other).into()),
        };
        if frame.kind != FrameType::Trailer && buf.available() > 0 {
            let rest = buf.available();
            frame.payload = Some(buf.read_n(rest).map_err(|_| FramingError::Truncated("payload"))?);
        }
        Ok(frame)
    }
}

impl FrameCodec for RpcCodec {
    fn decode(&mut self, buf: &mut Buffer) -> Result<Option<Frame>, CodecError> {
        let mut head = [0_u8; MAX_U32_LEN];
        let n = buf.peek(&mut head);
        let Some((len, used)) = varint::uvarint(&head[..n])? else {
            if n == MAX_U32_LEN {
                return Err(FramingError::InvalidLengthEncoding.into());
            }
            return Ok(None);
        };
        let len = usize::try_from(len).map_err(|_| FramingError::InvalidLengthEncoding)?;
        if len > self.max_frame_length {
            return Err(FramingError::OversizedFrame {
                size: len,
                max: self.max_frame_length,
            }
            .into());
        }
        if buf.available() < used + len {
            return Ok(None);
        }
        buf.advance(used);
        let body = buf
            .read_n(len)
            .map_err(|_| FramingError::Truncated("frame"))?;
        let frame = Self::parse(body)?;
        tracing::trace!(
            stream_id = frame.stream_id,
            kind = ?frame.kind,
            end = frame.end,
            len,
            "decoded rpc frame"
        );
        Ok(Some(frame))
    }

    fn encode(&mut self, frame: Frame) -> Result<Buffer, CodecError> {
        let mut head = Vec::with_capacity(32);
        let mut flags = (frame.kind as u16) << 10;
        if frame.end || frame.kind == FrameType::Trailer {
            flags |= FLAG_END;
        }
        let mut fields = Vec::with_capacity(32);
        match frame.kind {
            FrameType::Header => flags |= Self::encode_header(&mut fields, &frame)?,
            FrameType::Data => {}
            FrameType::Trailer => {
                put_headers(&mut fields, frame.trailer.as_ref().unwrap_or(&HeaderMap::new()), None);
            }
        }
        head.extend_from_slice(&flags.to_be_bytes());
        if flags & FLAG_MAGIC != 0 {
            head.extend_from_slice(&MAGIC_WORD.to_be_bytes());
        }
        put_uvarint(&mut head, u64::from(frame.stream_id));
        head.extend_from_slice(&fields);

        let mut out = Buffer::new();
        out.append(&head);
        if frame.kind != FrameType::Trailer
            && let Some(payload) = frame.payload
        {
            out.append_buffer(payload);
        }
        if out.len() > self.max_frame_length {
            return Err(FramingError::OversizedFrame {
                size: out.len(),
                max: self.max_frame_length,
            }
            .into());
        }
        let mut prefix = Vec::with_capacity(MAX_U32_LEN);
        put_uvarint(&mut prefix, out.len() as u64);
        out.prepend(&prefix);
        out.rewind();
        Ok(out)
    }
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;
