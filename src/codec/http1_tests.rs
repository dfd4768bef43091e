//! Unit tests for the HTTP/1 codec.

use proptest::prelude::*;
use rstest::rstest;

use super::{Http1Codec, Http1Protocol, canonical_key};
use crate::{
    buffer::Buffer,
    codec::{
        CodecError,
        Detection,
        Frame,
        FrameCodec,
        FrameType,
        FramingError,
        MAX_FRAME_LENGTH,
        Protocol,
        ProtocolError,
    },
    packet::{CodecType, HTTP_10, HeaderMap, Identifier, Method},
};

fn decode_all(codec: &mut Http1Codec, wire: &[u8]) -> Vec<Frame> {
    let mut buf = Buffer::from(wire);
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(&mut buf).expect("decode") {
        frames.push(frame);
    }
    frames
}

fn decode_err(wire: &str) -> CodecError {
    let mut buf = Buffer::from(wire);
    let mut codec = Http1Codec::new(false);
    loop {
        match codec.decode(&mut buf) {
            Ok(Some(_)) => {}
            Ok(None) => panic!("expected a decode error"),
            Err(e) => return e,
        }
    }
}

fn payloads(frames: &[Frame]) -> Vec<Vec<u8>> {
    frames
        .iter()
        .filter_map(|f| f.payload.as_ref().map(Buffer::bytes))
        .collect()
}

#[rstest]
#[case(b"GET / HTTP/1.1\r\n", Detection::Matched)]
#[case(b"DELETE /x HTTP/1.1", Detection::Matched)]
#[case(b"HTTP/1.1 200 OK", Detection::Matched)]
#[case(b"PO", Detection::Incomplete)]
#[case(b"", Detection::Incomplete)]
#[case(b"GETX / HTTP/1.1", Detection::Rejected)]
#[case(&[0x05, 0x80, 0x00, 0x4b, 0x47], Detection::Rejected)]
fn detects_method_tokens(#[case] data: &[u8], #[case] expected: Detection) {
    assert_eq!(Http1Protocol.detect(data), expected);
}

#[rstest]
#[case("content-type", "Content-Type")]
#[case("X-REQUEST-ID", "X-Request-Id")]
#[case("host", "Host")]
fn canonicalises_keys(#[case] raw: &str, #[case] expected: &str) {
    assert_eq!(canonical_key(raw), expected);
}

#[test]
fn sized_request_is_one_frame() {
    let wire = b"POST /echo?x=1 HTTP/1.1\r\nHost: a\r\ncontent-type: application/json\r\nContent-Length: 4\r\n\r\n\"hi\"";
    let frames = decode_all(&mut Http1Codec::new(false), wire);
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert!(frame.end);
    assert_eq!(frame.kind, FrameType::Header);
    let ident = frame.ident.as_ref().expect("identifier");
    assert_eq!(ident.method, Some(Method::Post));
    assert_eq!(ident.path(), "/echo");
    assert_eq!(ident.query(), "x=1");
    assert_eq!(ident.codec, CodecType::Json);
    assert_ne!(ident.seq_id, 0);
    let header = frame.header.as_ref().expect("headers");
    assert_eq!(header.get("Host"), Some("a"));
    assert!(!header.contains("Content-Length"));
    assert_eq!(payloads(&frames), [b"\"hi\"".to_vec()]);
}

#[test]
fn chunked_upload_yields_one_frame_per_chunk() {
    let wire = b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\nTrailer: X-Sum\r\n\r\n\
2\r\nAB\r\n2;ext=1\r\nCD\r\n2\r\nEF\r\n0\r\nX-Sum: 6\r\n\r\n";
    let frames = decode_all(&mut Http1Codec::new(false), wire);
    let kinds: Vec<_> = frames.iter().map(|f| (f.kind, f.end)).collect();
    assert_eq!(
        kinds,
        [
            (FrameType::Header, false),
            (FrameType::Data, false),
            (FrameType::Data, false),
            (FrameType::Data, false),
            (FrameType::Trailer, true),
        ]
    );
    assert_eq!(payloads(&frames), [b"AB".to_vec(), b"CD".to_vec(), b"EF".to_vec()]);
    let trailer = frames[4].trailer.as_ref().expect("trailer");
    assert_eq!(trailer.get("X-Sum"), Some("6"));
    let stream_id = frames[0].stream_id;
    assert!(frames.iter().all(|f| f.stream_id == stream_id));
}

#[test]
fn byte_at_a_time_input_decodes_identically() {
    let wire = b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nAB\r\n0\r\n\r\n\
GET /next HTTP/1.1\r\nContent-Length: 3\r\n\r\nxyz";
    let whole = decode_all(&mut Http1Codec::new(false), wire);

    let mut codec = Http1Codec::new(false);
    let mut buf = Buffer::new();
    let mut frames = Vec::new();
    for byte in wire {
        buf.append(&[*byte]);
        buf.rewind();
        while let Some(frame) = codec.decode(&mut buf).expect("decode") {
            frames.push(frame);
        }
        buf.discard();
    }
    assert_eq!(frames, whole);
    assert_eq!(frames.len(), 4);
}

#[test]
fn folded_header_lines_are_joined() {
    let wire = b"GET / HTTP/1.1\r\nX-Long: one\r\n  two\r\n\ttwo-b\r\n\r\n";
    let frames = decode_all(&mut Http1Codec::new(false), wire);
    let header = frames[0].header.as_ref().expect("headers");
    assert_eq!(header.get("X-Long"), Some("one two two-b"));
}

#[test]
fn agreeing_duplicate_lengths_are_accepted() {
    let wire = b"POST / HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 2\r\n\r\nok";
    let frames = decode_all(&mut Http1Codec::new(false), wire);
    assert_eq!(payloads(&frames), [b"ok".to_vec()]);
}

#[rstest]
#[case("POST / HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 3\r\n\r\n")]
#[case("POST / HTTP/1.1\r\nContent-Length: two\r\n\r\n")]
fn conflicting_lengths_are_rejected(#[case] wire: &str) {
    assert!(matches!(
        decode_err(wire),
        CodecError::Protocol(ProtocolError::InvalidContentLength(_))
    ));
}

#[test]
fn length_with_chunked_is_rejected() {
    let err = decode_err("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 2\r\n\r\n");
    assert!(matches!(err, CodecError::Protocol(ProtocolError::LengthWithChunked)));
}

#[test]
fn forbidden_trailer_names_are_rejected() {
    let err = decode_err("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nTrailer: Content-Length\r\n\r\n");
    assert!(matches!(
        err,
        CodecError::Protocol(ProtocolError::ForbiddenTrailer(name)) if name == "Content-Length"
    ));
}

#[test]
fn undeclared_trailer_fields_are_dropped() {
    let wire = b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\nTrailer: x-sum\r\n\r\n\
1\r\na\r\n0\r\nX-Sum: 1\r\nX-Extra: 2\r\n\r\n\
POST /v HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\nX-Sum: 3\r\n\r\n";
    let frames = decode_all(&mut Http1Codec::new(false), wire);
    let trailers: Vec<&HeaderMap> = frames.iter().filter_map(|f| f.trailer.as_ref()).collect();
    assert_eq!(trailers.len(), 2);
    assert_eq!(trailers[0].get("X-Sum"), Some("1"));
    assert!(!trailers[0].contains("X-Extra"));
    assert!(trailers[1].is_empty(), "nothing was declared: {:?}", trailers[1]);
}

#[rstest]
#[case("ffffffffffffffff")]
#[case("1000001")]
fn oversized_chunk_sizes_are_rejected(#[case] size: &str) {
    let err = decode_err(&format!("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n{size}\r\n"));
    assert!(matches!(err, CodecError::Framing(FramingError::MalformedChunk(_))), "{err:?}");
}

#[test]
fn content_length_beyond_frame_limit_is_rejected() {
    let size = MAX_FRAME_LENGTH + 1;
    let err = decode_err(&format!("POST / HTTP/1.1\r\nContent-Length: {size}\r\n\r\n"));
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::OversizedFrame { size: s, max }) if s == size && max == MAX_FRAME_LENGTH
    ));
}

#[rstest]
#[case("GET / HTTP/2.0\r\n")]
#[case("GET /\r\n")]
#[case("FETCH / HTTP/1.1\r\n")]
fn bad_start_lines_are_rejected(#[case] wire: &str) {
    assert!(matches!(decode_err(wire), CodecError::Protocol(_)));
}

#[test]
fn malformed_chunk_size_is_rejected() {
    let err = decode_err("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n");
    assert!(matches!(err, CodecError::Framing(FramingError::MalformedChunk(_))));
}

fn client_with_request(method: Method, seq_id: u32) -> Http1Codec {
    let mut codec = Http1Codec::new(true);
    let mut ident = Identifier::request("/r");
    ident.method = Some(method);
    ident.seq_id = seq_id;
    codec
        .encode(Frame::header(1, ident, HeaderMap::new(), None, true))
        .expect("encode request");
    codec
}

#[test]
fn responses_match_requests_in_order() {
    let mut codec = Http1Codec::new(true);
    for seq in [11, 12] {
        let mut ident = Identifier::request("/r");
        ident.method = Some(Method::Get);
        ident.seq_id = seq;
        codec
            .encode(Frame::header(1, ident, HeaderMap::new(), None, true))
            .expect("encode");
    }
    let frames = decode_all(
        &mut codec,
        b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\naHTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
    );
    let seen: Vec<_> = frames
        .iter()
        .map(|f| {
            let ident = f.ident.as_ref().expect("identifier");
            (ident.seq_id, ident.status_code)
        })
        .collect();
    assert_eq!(seen, [(11, 200), (12, 404)]);
    assert_eq!(frames[1].ident.as_ref().expect("identifier").status_info, "Not Found");
}

#[test]
fn interim_responses_are_skipped() {
    let mut codec = client_with_request(Method::Post, 7);
    let frames = decode_all(
        &mut codec,
        b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 103 Early Hints\r\nLink: </a>\r\n\r\n\
HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    );
    assert_eq!(frames.len(), 1);
    let ident = frames[0].ident.as_ref().expect("identifier");
    assert_eq!((ident.seq_id, ident.status_code), (7, 200));
    assert!(frames[0].end);
    assert_eq!(payloads(&frames), [b"ok".to_vec()]);
}

#[test]
fn switching_protocols_is_a_final_response() {
    let mut codec = client_with_request(Method::Get, 4);
    let frames = decode_all(&mut codec, b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: x\r\n\r\n");
    assert_eq!(frames.len(), 1);
    let ident = frames[0].ident.as_ref().expect("identifier");
    assert_eq!((ident.seq_id, ident.status_code), (4, 101));
}

fn reply(seq_id: u32, body: Option<&str>, end: bool) -> Frame {
    let mut ident = Identifier::default();
    ident.is_request = false;
    ident.seq_id = seq_id;
    Frame::header(seq_id, ident, HeaderMap::new(), body.map(Buffer::from), end)
}

fn text(buf: &Buffer) -> String { String::from_utf8(buf.bytes()).expect("ascii") }

#[test]
fn server_writes_responses_in_request_order() {
    let mut codec = Http1Codec::new(false);
    let frames = decode_all(&mut codec, b"GET /slow HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\n");
    let seqs: Vec<u32> = frames.iter().filter_map(|f| f.ident.as_ref()).map(|i| i.seq_id).collect();
    assert_eq!(seqs, [1, 2]);

    let early = codec.encode(reply(2, Some("fast"), true)).expect("encode");
    assert_eq!(early.available(), 0, "second response waits for the first");
    let wire = text(&codec.encode(reply(1, Some("slow"), true)).expect("encode"));
    let slow = wire.find("slow").expect("first body");
    let fast = wire.find("fast").expect("second body");
    assert!(slow < fast, "{wire:?}");

    let mut client = Http1Codec::new(true);
    for seq in [21, 22] {
        let mut ident = Identifier::request("/r");
        ident.method = Some(Method::Get);
        ident.seq_id = seq;
        client
            .encode(Frame::header(1, ident, HeaderMap::new(), None, true))
            .expect("encode request");
    }
    let decoded = decode_all(&mut client, wire.as_bytes());
    assert_eq!(payloads(&decoded), [b"slow".to_vec(), b"fast".to_vec()]);
}

#[test]
fn held_response_follows_a_streamed_predecessor() {
    let mut codec = Http1Codec::new(false);
    decode_all(&mut codec, b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

    let head = codec.encode(reply(1, None, false)).expect("encode");
    assert!(text(&head).contains("Transfer-Encoding: chunked"));
    assert_eq!(codec.encode(reply(2, Some("second"), true)).expect("encode").available(), 0);
    let chunk = codec.encode(Frame::data(1, Some(Buffer::from("first")), false)).expect("encode");
    assert_eq!(text(&chunk), "5\r\nfirst\r\n");

    let tail = text(&codec.encode(Frame::data(1, None, true)).expect("encode"));
    assert!(tail.starts_with("0\r\n\r\nHTTP/1.1 200"), "{tail:?}");
    assert!(tail.ends_with("second"), "{tail:?}");

    let late = codec.encode(reply(5, Some("x"), true)).expect("encode");
    assert_eq!(late.available(), 0, "responses ahead of their request are held");
    let unsequenced = codec.encode(reply(0, Some("y"), true)).expect("encode");
    assert!(text(&unsequenced).ends_with('y'));
}

#[test]
fn head_response_may_announce_a_large_length() {
    let mut codec = client_with_request(Method::Head, 3);
    let wire = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", MAX_FRAME_LENGTH * 4);
    let frames = decode_all(&mut codec, wire.as_bytes());
    assert_eq!(frames.len(), 1);
    assert!(frames[0].end);
}

#[test]
fn head_response_carries_no_body() {
    let mut codec = client_with_request(Method::Head, 3);
    let frames = decode_all(&mut codec, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
    assert_eq!(frames.len(), 1);
    assert!(frames[0].end);
    assert!(frames[0].payload.is_none());
}

#[rstest]
#[case(204)]
#[case(304)]
fn bodiless_statuses_end_at_headers(#[case] status: i32) {
    let mut codec = client_with_request(Method::Get, 3);
    let wire = format!("HTTP/1.1 {status} X\r\nContent-Length: 10\r\n\r\n");
    let frames = decode_all(&mut codec, wire.as_bytes());
    assert_eq!(frames.len(), 1);
    assert!(frames[0].end);
}

#[test]
fn close_delimited_response_ends_at_eof() {
    let mut codec = client_with_request(Method::Get, 5);
    let mut buf = Buffer::from("HTTP/1.0 200 OK\r\n\r\npart-one");
    let head = codec.decode(&mut buf).expect("decode").expect("head");
    assert!(!head.end);
    assert_eq!(head.ident.as_ref().expect("identifier").version, HTTP_10);
    let data = codec.decode(&mut buf).expect("decode").expect("data");
    assert_eq!(data.payload.expect("payload").bytes(), b"part-one");
    assert!(codec.decode(&mut buf).expect("decode").is_none());

    let last = codec.decode_eof(&mut buf).expect("eof").expect("final frame");
    assert!(last.end);
    assert!(last.payload.is_none());
    assert!(codec.decode_eof(&mut buf).expect("eof").is_none());
}

#[test]
fn eof_mid_message_is_an_error() {
    let mut codec = Http1Codec::new(false);
    let mut buf = Buffer::from("POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nab");
    assert!(codec.decode(&mut buf).expect("decode").is_none());
    assert!(matches!(codec.decode_eof(&mut buf), Err(CodecError::Eof(_))));
}

#[test]
fn encodes_sized_response() {
    let mut ident = Identifier::default();
    ident.is_request = false;
    let mut header = HeaderMap::new();
    header.set("Server", "kgnet");
    let wire = Http1Codec::new(false)
        .encode(Frame::header(1, ident, header, Some(Buffer::from("hi")), true))
        .expect("encode")
        .bytes();
    assert_eq!(wire, b"HTTP/1.1 200 OK\r\nServer: kgnet\r\nContent-Length: 2\r\n\r\nhi");
}

#[test]
fn encodes_chunked_message_with_trailer() {
    let mut codec = Http1Codec::new(true);
    let mut ident = Identifier::request("/upload");
    ident.method = Some(Method::Post);
    ident.codec = CodecType::Text;
    let mut wire = Vec::new();
    for frame in [
        Frame::header(1, ident, std::iter::once(("Trailer", "X-Sum")).collect(), None, false),
        Frame::data(1, Some(Buffer::from("AB")), false),
        Frame::data(1, Some(Buffer::from("CDEFGHIJKLMNOPQ")), false),
        Frame::trailer(1, std::iter::once(("X-Sum", "17")).collect()),
    ] {
        wire.extend(codec.encode(frame).expect("encode").bytes());
    }
    let text = String::from_utf8(wire.clone()).expect("ascii");
    assert!(text.starts_with("POST /upload HTTP/1.1\r\nTrailer: X-Sum\r\nContent-Type: text/plain"));
    assert!(text.contains("Transfer-Encoding: chunked\r\n\r\n2\r\nAB\r\nf\r\nCDEFGHIJKLMNOPQ\r\n"));
    assert!(text.ends_with("0\r\nX-Sum: 17\r\n\r\n"));

    let frames = decode_all(&mut Http1Codec::new(false), &wire);
    assert_eq!(payloads(&frames), [b"AB".to_vec(), b"CDEFGHIJKLMNOPQ".to_vec()]);
    assert_eq!(frames.last().and_then(|f| f.trailer.as_ref()).and_then(|t| t.get("X-Sum")), Some("17"));
}

#[test]
fn request_without_method_cannot_be_encoded() {
    let err = Http1Codec::new(true)
        .encode(Frame::header(1, Identifier::request("/"), HeaderMap::new(), None, true))
        .expect_err("method required");
    assert!(matches!(err, CodecError::Protocol(ProtocolError::MissingField { field: "method" })));
}

fn method_strategy() -> impl Strategy<Value = Method> {
    prop::sample::select(vec![Method::Get, Method::Post, Method::Put, Method::Delete, Method::Patch])
}

proptest! {
    #[test]
    fn requests_survive_encoding(
        method in method_strategy(),
        path in "/[a-z0-9/]{0,16}",
        fields in prop::collection::vec(("X-[A-Z][a-z]{0,6}", "[!-~]{1,12}"), 0..4),
        body in prop::collection::vec(any::<u8>(), 0..128),
        chunked in any::<bool>(),
    ) {
        let header: HeaderMap = fields.into_iter().collect();
        let mut ident = Identifier::request(path.clone());
        ident.method = Some(method);
        let mut client = Http1Codec::new(true);
        let mut wire = Vec::new();
        let body_buf = (!body.is_empty()).then(|| Buffer::from(body.clone()));
        if chunked {
            wire.extend(client.encode(Frame::header(1, ident, header.clone(), None, false)).expect("encode").bytes());
            wire.extend(client.encode(Frame::data(1, body_buf, true)).expect("encode").bytes());
        } else {
            wire.extend(client.encode(Frame::header(1, ident, header.clone(), body_buf, true)).expect("encode").bytes());
        }

        let frames = decode_all(&mut Http1Codec::new(false), &wire);
        let head = frames.first().expect("head");
        let decoded = head.ident.as_ref().expect("identifier");
        prop_assert_eq!(decoded.method, Some(method));
        prop_assert_eq!(decoded.uri(), path.as_str());
        prop_assert_eq!(head.header.as_ref().expect("headers"), &header);
        prop_assert_eq!(payloads(&frames).concat(), body);
        prop_assert!(frames.last().expect("frame").end);
    }
}
