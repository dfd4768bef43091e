//! Pooled, ref-counted, non-contiguous byte buffer.
//!
//! A [`Buffer`] is a chain of chunks, each viewing a slice of a shared
//! [`Block`]. A single cursor marks the read/write position. Slicing with
//! [`Buffer::read_n`] or [`Buffer::peek_n`] shares blocks rather than
//! copying, and writes into a shared block copy that chunk first.
//!
//! The chunk chain is a `VecDeque` indexed by position, so the cursor is a
//! `(node, offset)` pair rather than a pointer into a linked list.
//!
//! ```
//! use std::io::SeekFrom;
//!
//! use kgnet::buffer::Buffer;
//!
//! let mut buf = Buffer::new();
//! buf.append(b"Hello, World");
//! buf.seek(SeekFrom::Start(7)).unwrap();
//! assert_eq!(buf.read_n(5).unwrap().bytes(), b"World");
//! ```

mod pool;

use std::{
    collections::VecDeque,
    fmt,
    io::{self, Read, SeekFrom, Write},
};

use bytes::Buf;
pub use pool::{Block, MAX_CLASS, MIN_CLASS, Pool, global as pool};

use crate::error::{Error, Result};

/// Chunk size used by [`Buffer::new`] when growing.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

#[derive(Clone)]
struct Chunk {
    block: Block,
    start: usize,
    len: usize,
}

impl Chunk {
    fn data(&self) -> &[u8] { &self.block.as_slice()[self.start..self.start + self.len] }

    fn spare(&self) -> usize {
        if self.block.is_unique() {
            self.block.size() - self.start - self.len
        } else {
            0
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Cursor {
    node: usize,
    offset: usize,
}

/// Non-contiguous byte buffer with a single cursor.
///
/// Invariant: `pos <= len <= cap`.
#[derive(Clone)]
pub struct Buffer {
    chunks: VecDeque<Chunk>,
    cursor: Cursor,
    pos: usize,
    len: usize,
    chunk_size: usize,
}

impl Default for Buffer {
    fn default() -> Self { Self::new() }
}

impl Buffer {
    /// Create an empty buffer with no backing storage.
    #[must_use]
    pub fn new() -> Self { Self::with_chunk_size(DEFAULT_CHUNK_SIZE) }

    /// Create an empty buffer that grows in chunks of `chunk_size` bytes.
    #[must_use]
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            cursor: Cursor::default(),
            pos: 0,
            len: 0,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Create a buffer holding a copy of `data`, positioned at the start.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.append(data);
        buf.rewind();
        buf
    }

    /// Total bytes held.
    #[must_use]
    pub fn len(&self) -> usize { self.len }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Cursor position.
    #[must_use]
    pub fn pos(&self) -> usize { self.pos }

    /// Bytes between the cursor and the end.
    #[must_use]
    pub fn available(&self) -> usize { self.len - self.pos }

    /// Bytes that can be held without growing.
    #[must_use]
    pub fn cap(&self) -> usize { self.len + self.tail_spare() }

    /// Number of chunks in the chain.
    #[must_use]
    pub fn chunk_count(&self) -> usize { self.chunks.len() }

    /// Growth step used when the tail has no spare room.
    #[must_use]
    pub fn chunk_size(&self) -> usize { self.chunk_size }

    fn tail_spare(&self) -> usize { self.chunks.back().map_or(0, Chunk::spare) }

    fn end_cursor(&self) -> Cursor {
        self.chunks.back().map_or(Cursor::default(), |last| Cursor {
            node: self.chunks.len() - 1,
            offset: last.len,
        })
    }

    fn locate(&self, pos: usize) -> Cursor {
        if pos >= self.len {
            return self.end_cursor();
        }
        let mut acc = 0;
        for (node, chunk) in self.chunks.iter().enumerate() {
            if pos < acc + chunk.len {
                return Cursor {
                    node,
                    offset: pos - acc,
                };
            }
            acc += chunk.len;
        }
        self.end_cursor()
    }

    fn normalize_cursor(&mut self) {
        while let Some(chunk) = self.chunks.get(self.cursor.node) {
            if self.cursor.offset < chunk.len || self.cursor.node + 1 >= self.chunks.len() {
                break;
            }
            self.cursor.node += 1;
            self.cursor.offset = 0;
        }
    }

    fn drop_empty_tail(&mut self) {
        if self.chunks.back().is_some_and(|c| c.len == 0) {
            self.chunks.pop_back();
        }
    }

    /// Append a fresh chunk of `max(n, chunk_size)` bytes of capacity.
    pub fn grow(&mut self, n: usize) {
        self.chunks.push_back(Chunk {
            block: Block::new(n.max(self.chunk_size)),
            start: 0,
            len: 0,
        });
    }

    /// Move the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the target lies outside `[0, len]`.
    pub fn seek(&mut self, from: SeekFrom) -> Result<u64> {
        let len = i64::try_from(self.len).unwrap_or(i64::MAX);
        let pos = i64::try_from(self.pos).unwrap_or(i64::MAX);
        let target = match from {
            SeekFrom::Start(n) => i64::try_from(n).unwrap_or(i64::MAX),
            SeekFrom::Current(delta) => pos.saturating_add(delta),
            SeekFrom::End(delta) => len.saturating_add(delta),
        };
        let Ok(target) = usize::try_from(target) else {
            return Err(Error::OutOfRange {
                pos: target,
                len: self.len,
            });
        };
        if target > self.len {
            return Err(Error::OutOfRange {
                pos: i64::try_from(target).unwrap_or(i64::MAX),
                len: self.len,
            });
        }
        self.pos = target;
        self.cursor = self.locate(target);
        Ok(target as u64)
    }

    /// Move the cursor to the start.
    pub fn rewind(&mut self) {
        self.pos = 0;
        self.cursor = self.locate(0);
    }

    /// Move the cursor to the end.
    pub fn seek_end(&mut self) {
        self.pos = self.len;
        self.cursor = self.end_cursor();
    }

    fn copy_out(&self, mut cur: Cursor, dst: &mut [u8]) -> (usize, Cursor) {
        let mut n = 0;
        while n < dst.len() {
            let Some(chunk) = self.chunks.get(cur.node) else {
                break;
            };
            if cur.offset >= chunk.len {
                if cur.node + 1 >= self.chunks.len() {
                    break;
                }
                cur.node += 1;
                cur.offset = 0;
                continue;
            }
            let k = (chunk.len - cur.offset).min(dst.len() - n);
            dst[n..n + k].copy_from_slice(&chunk.data()[cur.offset..cur.offset + k]);
            cur.offset += k;
            n += k;
        }
        (n, cur)
    }

    fn slice_out(&self, mut cur: Cursor, n: usize) -> (Self, Cursor) {
        let mut out = Self::with_chunk_size(self.chunk_size);
        let mut left = n;
        while left > 0 {
            let Some(chunk) = self.chunks.get(cur.node) else {
                break;
            };
            if cur.offset >= chunk.len {
                cur.node += 1;
                cur.offset = 0;
                continue;
            }
            let k = (chunk.len - cur.offset).min(left);
            out.chunks.push_back(Chunk {
                block: chunk.block.clone(),
                start: chunk.start + cur.offset,
                len: k,
            });
            out.len += k;
            cur.offset += k;
            left -= k;
        }
        (out, cur)
    }

    /// Copy bytes at the cursor into `dst`, advancing. Returns the count.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let (n, cur) = self.copy_out(self.cursor, dst);
        self.cursor = cur;
        self.pos += n;
        n
    }

    /// Copy bytes at the cursor into `dst` without advancing.
    #[must_use]
    pub fn peek(&self, dst: &mut [u8]) -> usize { self.copy_out(self.cursor, dst).0 }

    /// Read one byte.
    pub fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0_u8];
        (self.read(&mut byte) == 1).then_some(byte[0])
    }

    /// Peek one byte.
    #[must_use]
    pub fn peek_byte(&self) -> Option<u8> {
        let mut byte = [0_u8];
        (self.peek(&mut byte) == 1).then_some(byte[0])
    }

    /// Take the next `n` bytes as a buffer sharing this buffer's blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if fewer than `n` bytes are available.
    pub fn read_n(&mut self, n: usize) -> Result<Self> {
        self.check_available(n)?;
        let (out, cur) = self.slice_out(self.cursor, n);
        self.cursor = cur;
        self.pos += n;
        Ok(out)
    }

    /// Like [`Buffer::read_n`] without advancing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if fewer than `n` bytes are available.
    pub fn peek_n(&self, n: usize) -> Result<Self> {
        self.check_available(n)?;
        Ok(self.slice_out(self.cursor, n).0)
    }

    fn check_available(&self, n: usize) -> Result<()> {
        if n > self.available() {
            return Err(Error::OutOfRange {
                pos: i64::try_from(self.pos.saturating_add(n)).unwrap_or(i64::MAX),
                len: self.len,
            });
        }
        Ok(())
    }

    /// Offset from the cursor of the first `byte`, if present.
    #[must_use]
    pub fn index_byte(&self, byte: u8) -> Option<usize> {
        let mut dist = 0;
        for (node, chunk) in self.chunks.iter().enumerate().skip(self.cursor.node) {
            let from = if node == self.cursor.node {
                self.cursor.offset
            } else {
                0
            };
            if from >= chunk.len {
                continue;
            }
            let data = &chunk.data()[from..];
            if let Some(at) = data.iter().position(|b| *b == byte) {
                return Some(dist + at);
            }
            dist += data.len();
        }
        None
    }

    /// Read through the next `\n`, returning the line without its terminator.
    ///
    /// Returns `None` without moving the cursor if no full line is buffered.
    pub fn read_line(&mut self) -> Option<Vec<u8>> {
        let at = self.index_byte(b'\n')?;
        let mut line = vec![0; at + 1];
        self.read(&mut line);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    fn make_unique(&mut self, node: usize) {
        let Some(chunk) = self.chunks.get(node) else {
            return;
        };
        if chunk.block.is_unique() {
            return;
        }
        let mut block = Block::new(chunk.len);
        if let Some(bytes) = block.get_mut() {
            bytes[..chunk.len].copy_from_slice(chunk.data());
        }
        let len = chunk.len;
        self.chunks[node] = Chunk {
            block,
            start: 0,
            len,
        };
    }

    fn extend_tail(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        if self.tail_spare() == 0 {
            self.drop_empty_tail();
            self.grow(data.len());
        }
        let last = self.chunks.len() - 1;
        let chunk = &mut self.chunks[last];
        let off = chunk.start + chunk.len;
        let k = (chunk.block.size() - off).min(data.len());
        let Some(bytes) = chunk.block.get_mut() else {
            return 0;
        };
        bytes[off..off + k].copy_from_slice(&data[..k]);
        chunk.len += k;
        let offset = chunk.len;
        self.len += k;
        self.pos = self.len;
        self.cursor = Cursor { node: last, offset };
        k
    }

    /// Write `src` at the cursor, overwriting existing bytes and extending
    /// past the end as needed.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let mut n = 0;
        while n < src.len() {
            if self.pos < self.len {
                self.normalize_cursor();
                let node = self.cursor.node;
                self.make_unique(node);
                let offset = self.cursor.offset;
                let chunk = &mut self.chunks[node];
                let k = (chunk.len - offset).min(src.len() - n);
                let start = chunk.start + offset;
                if let Some(bytes) = chunk.block.get_mut() {
                    bytes[start..start + k].copy_from_slice(&src[n..n + k]);
                }
                self.cursor.offset += k;
                self.pos += k;
                n += k;
            } else {
                let k = self.extend_tail(&src[n..]);
                if k == 0 {
                    self.grow(src.len() - n);
                }
                n += k;
            }
        }
        n
    }

    /// Write one byte at the cursor.
    pub fn write_byte(&mut self, byte: u8) { self.write(&[byte]); }

    /// Reserve `n` contiguous bytes at the tail and return them for writing.
    ///
    /// The cursor moves to the end.
    pub fn write_n(&mut self, n: usize) -> &mut [u8] {
        self.seek_end();
        if n == 0 {
            return &mut [];
        }
        if self.tail_spare() < n {
            self.drop_empty_tail();
            self.grow(n);
        }
        let last = self.chunks.len() - 1;
        let (off, new_len) = {
            let chunk = &self.chunks[last];
            (chunk.start + chunk.len, chunk.len + n)
        };
        self.len += n;
        self.pos = self.len;
        self.cursor = Cursor {
            node: last,
            offset: new_len,
        };
        let chunk = &mut self.chunks[last];
        chunk.len = new_len;
        match chunk.block.get_mut() {
            Some(bytes) => &mut bytes[off..off + n],
            None => &mut [],
        }
    }

    /// Append a copy of `data` at the tail and move the cursor to the end.
    pub fn append(&mut self, data: &[u8]) {
        self.seek_end();
        let mut n = 0;
        while n < data.len() {
            let k = self.extend_tail(&data[n..]);
            if k == 0 {
                self.grow(data.len() - n);
            }
            n += k;
        }
    }

    fn readable_chunks(other: Self) -> impl Iterator<Item = Chunk> {
        let Cursor { node, offset } = other.cursor;
        other
            .chunks
            .into_iter()
            .enumerate()
            .skip(node)
            .filter_map(move |(i, mut chunk)| {
                if i == node {
                    chunk.start += offset.min(chunk.len);
                    chunk.len -= offset.min(chunk.len);
                }
                (chunk.len > 0).then_some(chunk)
            })
    }

    /// Link the unread bytes of `other` at the tail without copying and move
    /// the cursor to the end.
    pub fn append_buffer(&mut self, other: Self) {
        self.drop_empty_tail();
        for chunk in Self::readable_chunks(other) {
            self.len += chunk.len;
            self.chunks.push_back(chunk);
        }
        self.seek_end();
    }

    /// Insert a copy of `data` at the head. The cursor stays on the same byte.
    pub fn prepend(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut block = Block::new(data.len());
        if let Some(bytes) = block.get_mut() {
            bytes[..data.len()].copy_from_slice(data);
        }
        self.chunks.push_front(Chunk {
            block,
            start: 0,
            len: data.len(),
        });
        self.len += data.len();
        self.pos += data.len();
        self.cursor = self.locate(self.pos);
    }

    /// Link the unread bytes of `other` at the head without copying. The
    /// cursor stays on the same byte.
    pub fn prepend_buffer(&mut self, other: Self) {
        let chunks: Vec<Chunk> = Self::readable_chunks(other).collect();
        let added: usize = chunks.iter().map(|c| c.len).sum();
        for chunk in chunks.into_iter().rev() {
            self.chunks.push_front(chunk);
        }
        self.len += added;
        self.pos += added;
        self.cursor = self.locate(self.pos);
    }

    /// Drop every byte before the cursor and reset the cursor to zero.
    ///
    /// Chunks ending at or before the cursor release their block reference.
    pub fn discard(&mut self) {
        let mut left = self.pos;
        while left > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len <= left {
                left -= front.len;
                self.chunks.pop_front();
            } else {
                front.start += left;
                front.len -= left;
                left = 0;
            }
        }
        self.len -= self.pos;
        self.pos = 0;
        self.cursor = self.locate(0);
    }

    /// Release every chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.pos = 0;
        self.len = 0;
        self.cursor = Cursor::default();
    }

    /// Move the contents out, leaving an empty buffer with the same chunk size.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::replace(self, Self::with_chunk_size(self.chunk_size))
    }

    /// Write the unread bytes to `dst`, advancing past what was written.
    ///
    /// A `WouldBlock` after partial progress is reported as that progress.
    ///
    /// # Errors
    ///
    /// Propagates write errors from `dst`.
    pub fn write_to<W: Write + ?Sized>(&mut self, dst: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while self.available() > 0 {
            match dst.write(Buf::chunk(self)) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.advance(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Perform a single read from `src` into tail storage.
    ///
    /// # Errors
    ///
    /// Propagates read errors from `src`.
    pub fn read_from_once<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<usize> {
        let want = self.chunk_size;
        let n = src.read(self.spare_mut(want))?;
        self.commit(n);
        Ok(n)
    }

    /// Spare tail storage, growing by at least `min` bytes if there is none.
    ///
    /// Bytes written here become visible after [`Buffer::commit`].
    pub fn spare_mut(&mut self, min: usize) -> &mut [u8] {
        self.seek_end();
        if self.tail_spare() == 0 {
            self.drop_empty_tail();
            self.grow(min.max(1));
        }
        let last = self.chunks.len() - 1;
        let chunk = &mut self.chunks[last];
        let off = chunk.start + chunk.len;
        match chunk.block.get_mut() {
            Some(bytes) => &mut bytes[off..],
            None => &mut [],
        }
    }

    /// Mark `n` bytes of spare storage as written.
    pub fn commit(&mut self, n: usize) {
        let n = n.min(self.tail_spare());
        if n == 0 {
            return;
        }
        let last = self.chunks.len() - 1;
        self.chunks[last].len += n;
        self.len += n;
        self.seek_end();
    }

    /// Copy of the unread bytes.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.available());
        for slice in self.chunks() {
            out.extend_from_slice(slice);
        }
        out
    }

    /// Unread bytes as a sequence of contiguous slices.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        let Cursor { node, offset } = self.cursor;
        self.chunks
            .iter()
            .enumerate()
            .skip(node)
            .map(move |(i, c)| {
                if i == node {
                    &c.data()[offset.min(c.len)..]
                } else {
                    c.data()
                }
            })
            .filter(|s| !s.is_empty())
    }
}

impl Buf for Buffer {
    fn remaining(&self) -> usize { self.available() }

    fn chunk(&self) -> &[u8] { self.chunks().next().unwrap_or(&[]) }

    fn advance(&mut self, cnt: usize) {
        let mut left = cnt.min(self.available());
        self.pos += left;
        while left > 0 {
            let Some(chunk) = self.chunks.get(self.cursor.node) else {
                break;
            };
            let room = chunk.len - self.cursor.offset.min(chunk.len);
            if room == 0 {
                self.cursor.node += 1;
                self.cursor.offset = 0;
                continue;
            }
            let k = room.min(left);
            self.cursor.offset += k;
            left -= k;
        }
    }
}

impl Read for Buffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { Ok(Buffer::read(self, buf)) }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { Ok(Buffer::write(self, buf)) }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

impl io::Seek for Buffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Buffer::seek(self, pos).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.available() == other.available() && self.bytes() == other.bytes()
    }
}

impl Eq for Buffer {}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self { Self::from_slice(data) }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self { Self::from_slice(&data) }
}

impl From<&str> for Buffer {
    fn from(data: &str) -> Self { Self::from_slice(data.as_bytes()) }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("pos", &self.pos)
            .field("len", &self.len)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests;
