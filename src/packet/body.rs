//! Message bodies.
//!
//! | Variant  | Reads        | [`Body::buffer`]  | Ended when                |
//! |----------|--------------|-------------------|---------------------------|
//! | `Empty`  | EOF at once  | `Ok(None)`        | always                    |
//! | `Buffer` | once         | the buffer        | after the first read      |
//! | `Stream` | many, FIFO   | `NotSupport`      | flushed or closed         |
//! | `File`   | many chunks  | `NotSupport`      | the file is consumed      |

use std::{
    collections::VecDeque,
    fmt,
    fs::File,
    io,
    path::Path,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use crate::{
    buffer::{Buffer, DEFAULT_CHUNK_SIZE},
    error::{Error, Result},
    packet::HeaderMap,
};

/// Message payload.
#[derive(Default)]
pub enum Body {
    /// No payload.
    #[default]
    Empty,
    /// A single buffer, `None` once read.
    Buffer(Option<Buffer>),
    /// Buffers pushed by a [`StreamWriter`].
    Stream(StreamBody),
    /// Chunks read from an open file.
    File(FileBody),
}

impl Body {
    /// Body holding `buf`.
    #[must_use]
    pub fn from_buffer(buf: Buffer) -> Self { Self::Buffer(Some(buf)) }

    /// Body streaming the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::File(FileBody::new(File::open(path)?, DEFAULT_CHUNK_SIZE)))
    }

    /// Next buffer of the body, or `None` at EOF.
    ///
    /// With `blocking` false a stream body that has no data yet fails with
    /// [`Error::WouldBlock`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when a stream body was closed before it
    /// ended, [`Error::WouldBlock`] as above, or the file read error.
    pub fn read_fast(&mut self, blocking: bool) -> Result<Option<Buffer>> {
        match self {
            Self::Empty => Ok(None),
            Self::Buffer(buf) => Ok(buf.take()),
            Self::Stream(stream) => stream.read(blocking),
            Self::File(file) => file.read_chunk().map_err(Error::from),
        }
    }

    /// The whole buffered payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupport`] for stream and file bodies.
    pub fn buffer(&self) -> Result<Option<&Buffer>> {
        match self {
            Self::Empty => Ok(None),
            Self::Buffer(buf) => Ok(buf.as_ref()),
            Self::Stream(_) => Err(Error::NotSupport("buffer() on a stream body")),
            Self::File(_) => Err(Error::NotSupport("buffer() on a file body")),
        }
    }

    /// Read every remaining buffer, blocking on stream bodies.
    ///
    /// # Errors
    ///
    /// Propagates [`Body::read_fast`] errors.
    pub fn read_all(&mut self) -> Result<Buffer> {
        let mut out = Buffer::new();
        while let Some(buf) = self.read_fast(true)? {
            out.append_buffer(buf);
        }
        out.rewind();
        Ok(out)
    }

    /// Whether no further data will be produced.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Buffer(buf) => buf.is_none(),
            Self::Stream(stream) => stream.is_ended(),
            Self::File(file) => file.ended,
        }
    }

    /// Whether the body is sent as a sequence of frames.
    #[must_use]
    pub fn is_streaming(&self) -> bool { matches!(self, Self::Stream(_) | Self::File(_)) }

    /// Copy of an empty or buffered body; stream and file bodies cannot be
    /// replayed.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Empty => Some(Self::Empty),
            Self::Buffer(buf) => Some(Self::Buffer(buf.clone())),
            Self::Stream(_) | Self::File(_) => None,
        }
    }
}

impl From<Buffer> for Body {
    fn from(buf: Buffer) -> Self { Self::from_buffer(buf) }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self { Self::from_buffer(Buffer::from(bytes)) }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self { Self::from_buffer(Buffer::from(s)) }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Buffer(buf) => f.debug_tuple("Buffer").field(buf).finish(),
            Self::Stream(s) => f.debug_tuple("Stream").field(s).finish(),
            Self::File(_) => f.write_str("File"),
        }
    }
}

#[derive(Default)]
struct StreamState {
    queue: VecDeque<Buffer>,
    trailer: Option<HeaderMap>,
    ended: bool,
    closed: bool,
}

#[derive(Default)]
struct StreamShared {
    state: Mutex<StreamState>,
    ready: Condvar,
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reading half of a single-producer, single-consumer buffer queue.
#[derive(Clone)]
pub struct StreamBody {
    shared: Arc<StreamShared>,
}

impl StreamBody {
    /// Create a connected reader and writer.
    #[must_use]
    pub fn channel() -> (Self, StreamWriter) {
        let shared = Arc::new(StreamShared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            StreamWriter { shared },
        )
    }

    fn read(&self, blocking: bool) -> Result<Option<Buffer>> {
        let mut state = self.shared.lock();
        loop {
            if let Some(buf) = state.queue.pop_front() {
                return Ok(Some(buf));
            }
            if state.ended {
                return Ok(None);
            }
            if state.closed {
                return Err(Error::Closed);
            }
            if !blocking {
                return Err(Error::WouldBlock);
            }
            state = self
                .shared
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Whether the writer has flushed or closed.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        let state = self.shared.lock();
        state.ended || state.closed
    }

    /// Buffers queued and not yet read.
    #[must_use]
    pub fn pending(&self) -> usize { self.shared.lock().queue.len() }

    /// Trailers delivered by [`StreamWriter::finish`].
    #[must_use]
    pub fn trailer(&self) -> Option<HeaderMap> { self.shared.lock().trailer.clone() }
}

impl fmt::Debug for StreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("StreamBody")
            .field("pending", &state.queue.len())
            .field("ended", &state.ended)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Writing half of a [`StreamBody`].
///
/// Dropping an unflushed writer closes the stream.
pub struct StreamWriter {
    shared: Arc<StreamShared>,
}

impl StreamWriter {
    /// Queue `buf` for the reader.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`flush`](Self::flush) or
    /// [`close`](Self::close).
    pub fn write(&self, buf: Buffer) -> Result<()> {
        let mut state = self.shared.lock();
        if state.ended || state.closed {
            return Err(Error::Closed);
        }
        state.queue.push_back(buf);
        drop(state);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Mark the end of the stream; the reader sees EOF after the queue.
    pub fn flush(&self) {
        self.shared.lock().ended = true;
        self.shared.ready.notify_all();
    }

    /// Attach trailers and end the stream.
    pub fn finish(&self, trailer: HeaderMap) {
        let mut state = self.shared.lock();
        if !state.closed {
            state.trailer = Some(trailer);
            state.ended = true;
        }
        drop(state);
        self.shared.ready.notify_all();
    }

    /// Abort the stream; the reader fails with [`Error::Closed`] once the
    /// queue is drained.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if !state.ended {
            state.closed = true;
        }
        drop(state);
        self.shared.ready.notify_all();
    }

    /// Whether the stream has been flushed or closed.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        let state = self.shared.lock();
        state.ended || state.closed
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) { self.close(); }
}

impl fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter").finish_non_exhaustive()
    }
}

/// File read in fixed-size chunks.
pub struct FileBody {
    file: File,
    chunk_size: usize,
    ended: bool,
}

impl FileBody {
    /// Stream `file` in chunks of `chunk_size` bytes.
    #[must_use]
    pub fn new(file: File, chunk_size: usize) -> Self {
        Self {
            file,
            chunk_size: chunk_size.max(1),
            ended: false,
        }
    }

    fn read_chunk(&mut self) -> io::Result<Option<Buffer>> {
        if self.ended {
            return Ok(None);
        }
        let mut buf = Buffer::with_chunk_size(self.chunk_size);
        if buf.read_from_once(&mut self.file)? == 0 {
            self.ended = true;
            return Ok(None);
        }
        buf.rewind();
        Ok(Some(buf))
    }
}
