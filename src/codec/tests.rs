//! Unit tests for protocol detection and the protocol registry.

use std::sync::Arc;

use rstest::rstest;
use serial_test::serial;

use super::*;

struct Fixed(&'static str, Detection);

impl Protocol for Fixed {
    fn name(&self) -> &'static str { self.0 }

    fn detect(&self, _data: &[u8]) -> Detection { self.1 }

    fn new_codec(&self, is_client: bool) -> Box<dyn FrameCodec> { http1::Http1Protocol.new_codec(is_client) }
}

fn detected_name(detected: &Detected) -> Option<&'static str> {
    match detected {
        Detected::Protocol(p) => Some(p.name()),
        Detected::NeedMore | Detected::Unknown => None,
    }
}

#[rstest]
#[case(b"GET / HTTP/1.1\r\n", Some("http1"))]
#[case(&[0x05, 0x80, 0x00, 0x4b, 0x47, 0x00], Some("rpc"))]
fn default_detector_picks_protocol(#[case] data: &[u8], #[case] expected: Option<&str>) {
    let detector = Detector::new(default_protocols());
    assert_eq!(detected_name(&detector.detect(data)), expected);
}

#[test]
fn short_prefix_needs_more_bytes() {
    let detector = Detector::new(default_protocols());
    assert!(matches!(detector.detect(b"PU"), Detected::NeedMore));
}

#[test]
fn garbage_is_unknown() {
    let detector = Detector::new(default_protocols());
    assert!(matches!(detector.detect(b"\x01\x02\x03\x04\x05\x06\x07"), Detected::Unknown));
}

#[test]
fn first_match_wins_over_later_incomplete() {
    let detector = Detector::new(vec![
        Arc::new(Fixed("a", Detection::Incomplete)),
        Arc::new(Fixed("b", Detection::Matched)),
    ]);
    assert_eq!(detected_name(&detector.detect(b"x")), Some("b"));
}

#[test]
#[serial]
fn registering_replaces_by_name() {
    register(Arc::new(Fixed("rpc", Detection::Rejected)));
    let names: Vec<_> = protocols().iter().map(|p| p.name()).collect();
    assert_eq!(names, ["http1", "rpc"]);
    assert!(matches!(
        Detector::from_registry().detect(&[0x05, 0x80, 0x00, 0x4b, 0x47]),
        Detected::Unknown
    ));
    reset_registry();
    assert!(lookup("rpc").is_some());
    assert_eq!(protocols().len(), 2);
}

#[test]
#[serial]
fn lookup_misses_unknown_names() {
    reset_registry();
    assert!(lookup("smtp").is_none());
}

#[test]
fn frame_constructors_set_end_rules() {
    assert!(Frame::trailer(1, HeaderMap::new()).end);
    assert_eq!(Frame::data(1, Some(Buffer::from("abc")), false).payload_len(), 3);
    let head = Frame::header(2, Identifier::request("/"), HeaderMap::new(), None, false);
    assert_eq!(head.kind, FrameType::Header);
    assert_eq!(head.payload_len(), 0);
}
