//! Tests for the chunked buffer and its pool.

use std::io::{self, SeekFrom};

use bytes::Buf;
use proptest::prelude::*;
use rstest::rstest;

use super::{Block, Buffer, MAX_CLASS, MIN_CLASS, Pool};
use crate::error::Error;

fn chunked(parts: &[&[u8]]) -> Buffer {
    let mut buf = Buffer::new();
    for part in parts {
        buf.append_buffer(Buffer::from_slice(part));
    }
    buf.rewind();
    buf
}

#[test]
fn seek_read_and_discard() {
    let mut buf = Buffer::new();
    buf.write(b"Hello, World");
    buf.seek(SeekFrom::Start(7)).expect("seek");
    let word = buf.read_n(5).expect("read_n");
    assert_eq!(word.bytes(), b"World");

    buf.seek(SeekFrom::Start(7)).expect("seek back");
    buf.discard();
    assert_eq!(buf.len(), 5);
    assert_eq!(buf.pos(), 0);
    assert_eq!(buf.bytes(), b"World");
}

#[rstest]
#[case(SeekFrom::Start(13))]
#[case(SeekFrom::Current(-1))]
#[case(SeekFrom::End(1))]
fn seeking_outside_bounds_fails(#[case] target: SeekFrom) {
    let mut buf = Buffer::from_slice(b"Hello, World");
    let err = buf.seek(target).expect_err("out of range");
    assert!(matches!(err, Error::OutOfRange { len: 12, .. }));
    assert_eq!(buf.pos(), 0);
}

#[test]
fn seek_end_anchor_is_inclusive() {
    let mut buf = Buffer::from_slice(b"abc");
    assert_eq!(buf.seek(SeekFrom::End(0)).expect("end"), 3);
    assert_eq!(buf.available(), 0);
    assert_eq!(buf.seek(SeekFrom::Current(-2)).expect("back"), 1);
    assert_eq!(buf.read_byte(), Some(b'b'));
}

#[test]
fn new_buffer_has_no_storage() {
    let buf = Buffer::new();
    assert_eq!(buf.chunk_count(), 0);
    assert_eq!(buf.cap(), 0);
}

#[test]
fn grow_uses_chunk_size_floor() {
    let mut buf = Buffer::with_chunk_size(1024);
    buf.grow(10);
    assert!(buf.cap() >= 1024);
    buf.grow(5000);
    assert_eq!(buf.chunk_count(), 2);
}

#[test]
fn reads_span_chunks() {
    let mut buf = chunked(&[b"ab", b"cd", b"ef"]);
    assert_eq!(buf.chunk_count(), 3);
    let mut out = [0_u8; 5];
    assert_eq!(buf.read(&mut out), 5);
    assert_eq!(&out, b"abcde");
    assert_eq!(buf.read_byte(), Some(b'f'));
    assert_eq!(buf.read_byte(), None);
}

#[test]
fn peek_does_not_move_cursor() {
    let buf = chunked(&[b"xy", b"z"]);
    let mut out = [0_u8; 3];
    assert_eq!(buf.peek(&mut out), 3);
    assert_eq!(buf.peek_byte(), Some(b'x'));
    assert_eq!(buf.peek_n(3).expect("peek_n").bytes(), b"xyz");
    assert_eq!(buf.pos(), 0);
}

#[test]
fn read_n_shares_blocks() {
    let mut buf = Buffer::from_slice(b"shared bytes");
    let head = buf.read_n(6).expect("read_n");
    assert_eq!(head.bytes(), b"shared");
    assert_eq!(head.chunk_count(), 1);
    assert_eq!(buf.bytes(), b" bytes");
}

#[test]
fn read_n_past_available_fails() {
    let mut buf = Buffer::from_slice(b"abc");
    assert!(matches!(buf.read_n(4), Err(Error::OutOfRange { .. })));
    assert_eq!(buf.pos(), 0);
}

#[test]
fn writes_to_shared_block_copy_first() {
    let mut buf = Buffer::from_slice(b"abcdef");
    let slice = buf.peek_n(6).expect("peek_n");
    buf.write(b"XY");
    assert_eq!(slice.bytes(), b"abcdef");
    buf.rewind();
    assert_eq!(buf.bytes(), b"XYcdef");
}

#[test]
fn write_overwrites_then_extends() {
    let mut buf = chunked(&[b"aa", b"bb"]);
    buf.seek(SeekFrom::Start(3)).expect("seek");
    buf.write(b"ZZZ");
    assert_eq!(buf.len(), 6);
    buf.rewind();
    assert_eq!(buf.bytes(), b"aabZZZ");
}

#[test]
fn append_moves_cursor_to_end() {
    let mut buf = Buffer::from_slice(b"ab");
    buf.append(b"cd");
    assert_eq!(buf.pos(), 4);
    assert_eq!(buf.available(), 0);
}

#[test]
fn prepend_keeps_cursor_on_same_byte() {
    let mut buf = Buffer::from_slice(b"world");
    buf.seek(SeekFrom::Start(1)).expect("seek");
    buf.prepend(b"hello ");
    assert_eq!(buf.pos(), 7);
    assert_eq!(buf.peek_byte(), Some(b'o'));
    buf.rewind();
    assert_eq!(buf.bytes(), b"hello world");
}

#[test]
fn prepend_buffer_links_without_copy() {
    let mut body = Buffer::from_slice(b"payload");
    body.seek_end();
    body.prepend_buffer(Buffer::from_slice(&[7]));
    assert_eq!(body.chunk_count(), 2);
    body.rewind();
    assert_eq!(body.bytes(), b"\x07payload");
}

#[test]
fn read_line_strips_terminators() {
    let mut buf = chunked(&[b"GET / HT", b"TP/1.1\r\nHost: x\n", b"partial"]);
    assert_eq!(buf.read_line().as_deref(), Some(&b"GET / HTTP/1.1"[..]));
    assert_eq!(buf.read_line().as_deref(), Some(&b"Host: x"[..]));
    assert_eq!(buf.read_line(), None);
    assert_eq!(buf.bytes(), b"partial");
}

#[test]
fn index_byte_is_relative_to_cursor() {
    let mut buf = chunked(&[b"a;b", b"c;d"]);
    assert_eq!(buf.index_byte(b';'), Some(1));
    buf.seek(SeekFrom::Start(2)).expect("seek");
    assert_eq!(buf.index_byte(b';'), Some(2));
    assert_eq!(buf.index_byte(b'!'), None);
}

#[test]
fn discard_releases_consumed_blocks() {
    let block_probe = Buffer::from_slice(b"first");
    let mut buf = Buffer::new();
    buf.append_buffer(block_probe.clone());
    buf.append_buffer(Buffer::from_slice(b"second"));
    buf.seek(SeekFrom::Start(5)).expect("seek");
    buf.discard();
    assert_eq!(buf.chunk_count(), 1);
    assert_eq!(buf.bytes(), b"second");
    assert_eq!(block_probe.chunks.front().map(|c| c.block.ref_count()), Some(1));
}

#[test]
fn write_n_reserves_contiguous_tail() {
    let mut buf = Buffer::from_slice(b"ab");
    buf.write_n(3).copy_from_slice(b"cde");
    buf.rewind();
    assert_eq!(buf.bytes(), b"abcde");
}

#[test]
fn read_from_once_appends_at_tail() {
    let mut buf = Buffer::with_chunk_size(4);
    let mut src = io::Cursor::new(b"0123456789".to_vec());
    let n = buf.read_from_once(&mut src).expect("read");
    assert!(n > 0);
    assert_eq!(buf.len(), n);
    buf.rewind();
    assert_eq!(buf.bytes(), b"0123456789"[..n].to_vec());
}

struct Trickle {
    out: Vec<u8>,
    budget: usize,
}

impl io::Write for Trickle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(2).min(self.budget);
        self.budget -= n;
        self.out.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

#[test]
fn write_to_stops_at_would_block_with_progress() {
    let mut buf = chunked(&[b"abc", b"def"]);
    let mut sink = Trickle {
        out: Vec::new(),
        budget: 4,
    };
    assert_eq!(buf.write_to(&mut sink).expect("partial"), 4);
    assert_eq!(sink.out, b"abcd");
    assert_eq!(buf.bytes(), b"ef");
    let err = buf.write_to(&mut sink).expect_err("blocked");
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
}

#[test]
fn buf_trait_walks_chunks() {
    let mut buf = chunked(&[b"ab", b"cd"]);
    assert_eq!(buf.remaining(), 4);
    assert_eq!(buf.chunk(), b"ab");
    buf.advance(3);
    assert_eq!(buf.chunk(), b"d");
    assert_eq!(buf.get_u8(), b'd');
}

#[rstest]
#[case(1, MIN_CLASS)]
#[case(65, 128)]
#[case(1024, 1024)]
#[case(MAX_CLASS, MAX_CLASS)]
#[case(MAX_CLASS + 1, MAX_CLASS + 1)]
fn pool_rounds_to_power_of_two(#[case] request: usize, #[case] class: usize) {
    assert_eq!(Pool::class_size(request), class);
    assert_eq!(super::pool().get(request).len(), class);
}

#[test]
fn pool_ignores_foreign_sizes() {
    let pool = super::pool();
    let before = pool.idle(100_000);
    pool.put(vec![0; 100_000]);
    assert_eq!(pool.idle(100_000), before);
}

#[test]
fn block_refcount_tracks_handles() {
    let block = Block::new(10);
    let second = block.clone();
    assert_eq!(block.ref_count(), 2);
    drop(second);
    assert_eq!(block.ref_count(), 1);
    assert_eq!(block.size(), MIN_CLASS);
}

proptest! {
    #[test]
    fn read_n_then_rest_reassembles(
        parts in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..8),
        split in any::<prop::sample::Index>(),
    ) {
        let original: Vec<u8> = parts.concat();
        let slices: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        let mut buf = chunked(&slices);
        let k = split.index(original.len() + 1);
        let head = buf.read_n(k).expect("split within bounds");
        let mut joined = head.bytes();
        joined.extend(buf.bytes());
        prop_assert_eq!(joined, original);
    }
}
