//! Tests for the codec filter's write path.

use std::{sync::Arc, thread};

use super::CodecFilter;
use crate::{
    buffer::Buffer,
    codec::{Frame, FrameCodec, Protocol, http1::Http1Protocol, rpc::RpcProtocol},
    filter::{Filter, FilterChain},
    packet::{HeaderMap, Identifier, Method, Request},
    transport::Connection,
};

fn bound_conn(is_client: bool, protocol: Arc<dyn Protocol>) -> Arc<Connection> {
    let chain = FilterChain::new(vec![Arc::new(CodecFilter::new()) as Arc<dyn Filter>]);
    let conn = Connection::new(is_client, chain, None);
    conn.bind(protocol);
    conn
}

fn drain(conn: &Connection) -> Buffer {
    let mut wire = Buffer::new();
    for buf in conn.take_writes() {
        wire.append_buffer(buf);
    }
    wire.rewind();
    wire
}

#[test]
fn concurrent_http_senders_keep_responses_matched() {
    let conn = bound_conn(true, Arc::new(Http1Protocol));
    let senders: Vec<_> = (1..=8_u32)
        .map(|t| {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                for i in 0..16 {
                    let seq = t * 100 + i;
                    let mut req = Request::http(Method::Get, format!("/{seq}"));
                    req.ident_mut().seq_id = seq;
                    conn.send_request(req).expect("send");
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().expect("sender thread");
    }

    let mut wire = drain(&conn);
    let mut server = Http1Protocol.new_codec(false);
    let mut replies = Buffer::new();
    let mut requests = 0;
    while let Some(frame) = server.decode(&mut wire).expect("decode request") {
        let ident = frame.ident.expect("identifier");
        let reply = Identifier::reply_to(&ident);
        let body = Buffer::from(ident.uri());
        replies.append_buffer(
            server
                .encode(Frame::header(frame.stream_id, reply, HeaderMap::new(), Some(body), true))
                .expect("encode reply"),
        );
        requests += 1;
    }
    assert_eq!(requests, 128);
    replies.rewind();

    let mut codec = conn.codec();
    let client = codec.as_mut().expect("bound codec");
    let mut responses = 0;
    while let Some(frame) = client.decode(&mut replies).expect("decode reply") {
        let seq = frame.ident.as_ref().expect("identifier").seq_id;
        let body = frame.payload.expect("body").bytes();
        assert_eq!(body, format!("/{seq}").into_bytes());
        responses += 1;
    }
    assert_eq!(responses, 128);
}

#[test]
fn http_packet_with_trailers_declares_them() {
    let conn = bound_conn(true, Arc::new(Http1Protocol));
    let mut req = Request::http(Method::Post, "/up").with_body("abc");
    req.packet_mut().trailer.set("X-Sum", "6");
    conn.send_request(req).expect("send");

    let mut wire = drain(&conn);
    let text = String::from_utf8(wire.bytes()).expect("ascii");
    assert!(text.contains("Trailer: X-Sum\r\n"), "{text:?}");
    let mut server = Http1Protocol.new_codec(false);
    let mut trailer = None;
    while let Some(frame) = server.decode(&mut wire).expect("decode") {
        trailer = frame.trailer.or(trailer);
    }
    assert_eq!(trailer.as_ref().and_then(|t| t.get("X-Sum")), Some("6"));
}

#[test]
fn rpc_packet_with_trailers_adds_no_header() {
    let conn = bound_conn(true, Arc::new(RpcProtocol));
    let mut req = Request::new("onPing").with_body("abc");
    req.packet_mut().trailer.set("checksum", "x");
    conn.send_request(req).expect("send");

    let mut wire = drain(&conn);
    let mut server = RpcProtocol.new_codec(false);
    let head = server.decode(&mut wire).expect("decode").expect("head");
    assert!(head.header.is_none_or(|h| !h.contains("Trailer")));
}
