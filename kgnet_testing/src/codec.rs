//! Drive a protocol's codec without a socket.

use kgnet::{
    buffer::Buffer,
    codec::{CodecError, Frame, Protocol},
};

/// Encode `frames` with a fresh codec and concatenate the wire bytes.
///
/// # Errors
///
/// Returns the first encode error.
pub fn frames_to_bytes(
    protocol: &dyn Protocol,
    is_client: bool,
    frames: impl IntoIterator<Item = Frame>,
) -> Result<Vec<u8>, CodecError> {
    let mut codec = protocol.new_codec(is_client);
    let mut out = Vec::new();
    for frame in frames {
        out.extend(codec.encode(frame)?.bytes());
    }
    Ok(out)
}

/// Decode every complete frame in `bytes`, treating the end of `bytes` as
/// the end of the connection.
///
/// # Errors
///
/// Returns the first decode error, including a partial trailing frame.
pub fn decode_all(protocol: &dyn Protocol, is_client: bool, bytes: &[u8]) -> Result<Vec<Frame>, CodecError> {
    let mut codec = protocol.new_codec(is_client);
    let mut buf = Buffer::from_slice(bytes);
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(&mut buf)? {
        frames.push(frame);
    }
    while let Some(frame) = codec.decode_eof(&mut buf)? {
        frames.push(frame);
    }
    Ok(frames)
}
