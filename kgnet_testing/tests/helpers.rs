//! Integration coverage for the `kgnet_testing` helpers.

use std::time::Duration;

use kgnet::{
    codec::{Frame, FrameType, http1::Http1Protocol, rpc::RpcProtocol},
    packet::{Method, Request},
};
use kgnet_testing::{TestResult, black_hole_listener, decode_all, frames_to_bytes, spawn_echo_server, test_config};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

#[test]
fn codec_drivers_round_trip_a_streamed_request() -> TestResult {
    let packet = Request::http(Method::Post, "/upload").into_packet();
    let frames = vec![
        Frame::header(1, packet.ident, packet.header, None, false),
        Frame::data(1, Some(kgnet::buffer::Buffer::from_slice(b"abc")), true),
    ];
    let bytes = frames_to_bytes(&Http1Protocol, true, frames)?;
    assert!(bytes.starts_with(b"POST /upload HTTP/1.1\r\n"));
    let decoded = decode_all(&Http1Protocol, false, &bytes)?;
    assert_eq!(decoded[0].kind, FrameType::Header);
    let body: Vec<u8> = decoded
        .iter()
        .filter_map(|f| f.payload.as_ref())
        .flat_map(kgnet::buffer::Buffer::bytes)
        .collect();
    assert_eq!(body, b"abc");
    assert!(decoded.last().is_some_and(|f| f.end));
    Ok(())
}

#[test]
fn truncated_rpc_frames_fail_at_eof() -> TestResult {
    let packet = Request::new("onPing").into_packet();
    let bytes = frames_to_bytes(
        &RpcProtocol,
        true,
        vec![Frame::header(0, packet.ident, packet.header, None, true)],
    )?;
    assert!(decode_all(&RpcProtocol, false, &bytes[..bytes.len() - 1]).is_err());
    Ok(())
}

#[tokio::test]
async fn echo_server_answers_http() -> TestResult {
    let echo = spawn_echo_server(test_config()).await?;
    let mut stream = TcpStream::connect(echo.addr).await?;
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nHost: t\r\nContent-Length: 2\r\n\r\nhi")
        .await?;
    let mut seen = Vec::new();
    let mut buf = [0u8; 256];
    while !seen.ends_with(b"\r\n\r\nhi") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await??;
        assert!(n > 0, "server closed early");
        seen.extend_from_slice(&buf[..n]);
    }
    assert!(seen.starts_with(b"HTTP/1.1 200"));
    echo.stop().await;
    Ok(())
}

#[tokio::test]
async fn black_hole_accepts_but_never_replies() -> TestResult {
    let (addr, _stop) = black_hole_listener().await?;
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(b"anything").await?;
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut buf)).await;
    assert!(read.is_err(), "black hole replied");
    Ok(())
}
