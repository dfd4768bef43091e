//! Filter binding the frame codecs into a connection's chain.

use std::sync::Arc;

use super::{CodecError, DETECT_PEEK, Detected, Detector, Frame, FramingError, Protocol, http1::Http1Protocol};
use crate::{
    buffer::Buffer,
    error::{Error, Result},
    filter::{Filter, FilterContext, Payload},
    metrics::{self, Direction},
    packet::Packet,
    transport::Connection,
};

/// Turns inbound bytes into frames and outbound frames and packets into
/// bytes.
///
/// Unbound connections are bound to the first protocol the detector
/// recognises. Each decoded frame is passed to the rest of the chain in
/// arrival order. Outbound frames are queued on the connection as soon as
/// they are encoded.
#[derive(Clone, Debug, Default)]
pub struct CodecFilter {
    detector: Detector,
}

impl CodecFilter {
    /// Name in the chain.
    pub const NAME: &'static str = "codec";

    /// Filter detecting protocols with the global registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Filter detecting protocols with `detector`.
    #[must_use]
    pub fn with_detector(detector: Detector) -> Self { Self { detector } }

    fn bind(&self, conn: &Connection, eof: bool) -> Result<bool> {
        let mut head = [0u8; DETECT_PEEK];
        let n = {
            let mut buf = conn.read_buf();
            buf.rewind();
            buf.peek(&mut head)
        };
        if n == 0 {
            return Ok(false);
        }
        match self.detector.detect(&head[..n]) {
            Detected::Protocol(protocol) => {
                tracing::debug!(conn_id = conn.id(), protocol = protocol.name(), "protocol detected");
                conn.bind(protocol);
                Ok(true)
            }
            Detected::NeedMore if !eof => Ok(false),
            Detected::NeedMore | Detected::Unknown => Err(CodecError::from(FramingError::UnknownProtocol).into()),
        }
    }

    fn decode_next(conn: &Connection, eof: bool) -> Result<Option<Frame>> {
        let mut buf = conn.read_buf();
        let mut codec = conn.codec();
        let codec = codec.as_mut().ok_or(Error::Unbound(conn.id()))?;
        buf.rewind();
        let frame = if eof {
            codec.decode_eof(&mut buf)
        } else {
            codec.decode(&mut buf)
        };
        buf.discard();
        Ok(frame?)
    }

    /// Encode `frames` and queue the bytes under one hold of the codec, so
    /// wire order matches the order the codec saw the frames in.
    fn write_frames(conn: &Connection, frames: Vec<Frame>) -> Result<()> {
        let mut codec = conn.codec();
        let codec = codec.as_mut().ok_or(Error::Unbound(conn.id()))?;
        let mut out = Buffer::new();
        for frame in frames {
            out.append_buffer(codec.encode(frame)?);
        }
        out.rewind();
        conn.enqueue(out)
    }

    /// Frames for `packet`. HTTP/1 messages with trailers declare the
    /// trailer names in a `Trailer` header unless the packet already does.
    fn packet_frames(mut packet: Packet, http1: bool) -> Result<Vec<Frame>> {
        let body = packet.body.read_fast(false)?;
        let stream_id = packet.stream_id;
        if packet.trailer.is_empty() {
            return Ok(vec![Frame::header(stream_id, packet.ident, packet.header, body, true)]);
        }
        if http1 && !packet.header.contains("Trailer") {
            let names: Vec<&str> = packet.trailer.keys().collect();
            packet.header.set("Trailer", names.join(", "));
        }
        let mut frames = vec![Frame::header(stream_id, packet.ident, packet.header, None, false)];
        if body.is_some() {
            frames.push(Frame::data(stream_id, body, false));
        }
        frames.push(Frame::trailer(stream_id, packet.trailer));
        Ok(frames)
    }
}

impl Filter for CodecFilter {
    fn name(&self) -> &str { Self::NAME }

    fn handle_read(&self, ctx: &mut FilterContext) -> Result<()> {
        let conn = Arc::clone(ctx.conn());
        let eof = match ctx.take_payload() {
            Payload::Bytes(buf) => {
                conn.read_buf().append_buffer(buf);
                false
            }
            Payload::Eof => true,
            other => {
                ctx.set_payload(other);
                return Ok(());
            }
        };
        ctx.abort();
        if conn.protocol().is_none() && !self.bind(&conn, eof)? {
            return Ok(());
        }
        while let Some(frame) = Self::decode_next(&conn, eof)? {
            metrics::inc_frames(Direction::Inbound);
            tracing::trace!(
                conn_id = conn.id(),
                stream_id = frame.stream_id,
                kind = ?frame.kind,
                end = frame.end,
                "frame decoded"
            );
            ctx.fire_next(Payload::Frame(frame))?;
        }
        ctx.abort();
        Ok(())
    }

    fn handle_write(&self, ctx: &mut FilterContext) -> Result<()> {
        let conn = Arc::clone(ctx.conn());
        let frames = match ctx.take_payload() {
            Payload::Frame(frame) => vec![frame],
            Payload::Packet(packet) => {
                let http1 = conn.protocol().is_some_and(|p| p.name() == Http1Protocol.name());
                Self::packet_frames(packet, http1)?
            }
            other => {
                ctx.set_payload(other);
                return Ok(());
            }
        };
        Self::write_frames(&conn, frames)
    }
}

#[cfg(test)]
#[path = "filter_tests.rs"]
mod tests;
