//! Unit tests for packet assembly and stream tasks.

use std::sync::{
    Arc,
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use rstest::{fixture, rstest};

use super::*;
use crate::{
    buffer::Buffer,
    error::Error,
    executor::Inline,
    filter::FilterChain,
    packet::{HeaderMap, Identifier},
};

#[derive(Default)]
struct Sink {
    packets: Mutex<Vec<Packet>>,
    more: AtomicUsize,
}

impl Callback for Sink {
    fn on_packet(&self, _conn: &Arc<Connection>, packet: Packet) {
        self.packets.lock().expect("sink lock").push(packet);
    }

    fn on_more_data(&self, _conn: &Arc<Connection>, _stream_id: u32) { self.more.fetch_add(1, Ordering::SeqCst); }
}

struct To(Option<Arc<Sink>>);

impl Dispatch for To {
    fn resolve(&self, _conn: &Arc<Connection>, _packet: &mut Packet) -> Option<Arc<dyn Callback>> {
        self.0.as_ref().map(|sink| Arc::clone(sink) as Arc<dyn Callback>)
    }
}

struct Harness {
    sink: Arc<Sink>,
    processor: Arc<Processor>,
    chain: FilterChain,
    conn: Arc<Connection>,
}

impl Harness {
    fn feed(&self, frame: Frame) { self.chain.fire_read(&self.conn, Payload::Frame(frame)); }

    fn packets(&self) -> std::sync::MutexGuard<'_, Vec<Packet>> { self.sink.packets.lock().expect("sink lock") }
}

#[fixture]
fn harness() -> Harness {
    let sink = Arc::new(Sink::default());
    let processor = Arc::new(Processor::new(Arc::new(Inline), Arc::new(To(Some(Arc::clone(&sink))))));
    let chain = FilterChain::new(vec![processor.clone() as Arc<dyn Filter>]);
    let conn = Connection::new(false, chain.clone(), None);
    Harness {
        sink,
        processor,
        chain,
        conn,
    }
}

fn head(stream_id: u32, payload: Option<&str>, end: bool) -> Frame {
    Frame::header(
        stream_id,
        Identifier::request("/upload"),
        HeaderMap::new(),
        payload.map(Buffer::from),
        end,
    )
}

#[test]
fn task_id_packs_connection_and_stream() {
    assert_eq!(task_id(1, 2), 0x1_0000_0002);
    assert_eq!(task_id(0, u32::MAX), u64::from(u32::MAX));
}

#[rstest]
fn complete_header_runs_simple_task(harness: Harness) {
    harness.feed(head(3, Some("hi"), true));
    let mut packets = harness.packets();
    assert_eq!(packets.len(), 1);
    let packet = &mut packets[0];
    assert_eq!(packet.stream_id, 3);
    assert_eq!(packet.ident.uri(), "/upload");
    let body = packet.body.read_fast(false).expect("read").expect("buffer");
    assert_eq!(body.bytes(), b"hi");
    assert_eq!(harness.processor.active_streams(), 0);
}

#[rstest]
fn streamed_message_fills_body_in_order(harness: Harness) {
    harness.feed(head(5, None, false));
    assert_eq!(harness.processor.active_streams(), 1);
    for chunk in ["AB", "CD", "EF"] {
        harness.feed(Frame::data(5, Some(Buffer::from(chunk)), false));
    }
    let mut trailer = HeaderMap::new();
    trailer.add("X-Checksum", "abc");
    harness.feed(Frame::trailer(5, trailer));
    assert_eq!(harness.processor.active_streams(), 0);
    assert_eq!(harness.sink.more.load(Ordering::SeqCst), 4);

    let mut packets = harness.packets();
    assert_eq!(packets.len(), 1, "on_packet runs once per message");
    let body = &mut packets[0].body;
    let mut chunks = Vec::new();
    while let Some(buf) = body.read_fast(false).expect("read") {
        chunks.push(buf.bytes());
    }
    assert_eq!(chunks, [b"AB".to_vec(), b"CD".to_vec(), b"EF".to_vec()]);
    let Body::Stream(stream) = body else {
        panic!("expected a stream body");
    };
    let trailer = stream.trailer().expect("trailer");
    assert_eq!(trailer.get("X-Checksum"), Some("abc"));
}

#[rstest]
fn data_end_flag_flushes_stream(harness: Harness) {
    harness.feed(head(7, Some("A"), false));
    harness.feed(Frame::data(7, Some(Buffer::from("B")), true));
    let mut packets = harness.packets();
    let body = packets[0].body.read_all().expect("read all");
    assert_eq!(body.bytes(), b"AB");
    assert!(packets[0].body.is_ended());
}

#[rstest]
fn frames_for_unknown_streams_are_dropped(harness: Harness) {
    harness.feed(Frame::data(9, Some(Buffer::from("x")), true));
    assert!(harness.packets().is_empty());
    assert_eq!(harness.processor.active_streams(), 0);
}

#[rstest]
fn close_aborts_open_streams(harness: Harness) {
    harness.feed(head(11, None, false));
    harness.chain.fire_close(&harness.conn);
    assert_eq!(harness.processor.active_streams(), 0);
    let mut packets = harness.packets();
    assert!(matches!(packets[0].body.read_fast(false), Err(Error::Closed)));
}

#[test]
fn unresolved_packets_are_dropped() {
    let processor = Arc::new(Processor::new(Arc::new(Inline), Arc::new(To(None))));
    let chain = FilterChain::new(vec![processor.clone() as Arc<dyn Filter>]);
    let conn = Connection::new(false, chain.clone(), None);
    chain.fire_read(&conn, Payload::Frame(head(1, None, false)));
    assert_eq!(processor.active_streams(), 0);
}

#[test]
fn stream_task_phases_coalesce_posts() {
    let (_body, writer) = StreamBody::channel();
    let task = StreamTask {
        conn: Connection::new(false, FilterChain::default(), None),
        stream_id: 1,
        callback: Arc::new(Sink::default()),
        writer,
        packet: Mutex::new(None),
        phase: Mutex::new(Phase::Idle),
    };
    assert!(task.schedule(), "idle task is posted");
    assert!(!task.schedule(), "running task only records pending work");
    assert_eq!(*task.phase(), Phase::RunningWithPending);
    task.run();
    assert_eq!(*task.phase(), Phase::Idle);
    assert!(task.schedule());
}
