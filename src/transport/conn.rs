//! Connection state shared by the transports, the filter chain and user
//! code.

use std::{
    collections::VecDeque,
    fmt,
    mem,
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        OnceLock,
        PoisonError,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
};

use crate::{
    attr::AttributeMap,
    buffer::Buffer,
    codec::{Frame, FrameCodec, Protocol},
    error::{Error, Result},
    executor::{Executor, PerTask, Task},
    filter::{FilterChain, Payload},
    metrics::{self, Direction},
    packet::{Body, HeaderMap, Packet, Request},
};

static NEXT_CONN_ID: AtomicU32 = AtomicU32::new(1);

/// Lifecycle of a connection.
///
/// `Connecting → Open → Closing → Closed`. After `Closing` reads are
/// ignored and the write queue drains before the socket closes. After
/// `Closed` pending writes are dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnStatus {
    /// Finalised.
    Closed = 0,
    /// Created, socket not yet attached.
    Connecting = 1,
    /// Reading and writing.
    Open = 2,
    /// Draining writes.
    Closing = 3,
}

impl ConnStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Open,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Transport-side handle driving the socket of one connection.
pub(crate) trait Driver: Send + Sync {
    /// The write queue is non-empty or the connection started closing.
    fn wake(&self);

    /// Release the socket.
    fn shutdown(&self);
}

/// One socket and its per-connection state.
pub struct Connection {
    id: u32,
    is_client: bool,
    status: AtomicU8,
    opened: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    remote_addr: OnceLock<SocketAddr>,
    tag: Option<String>,
    chain: FilterChain,
    read_buf: Mutex<Buffer>,
    codec: Mutex<Option<Box<dyn FrameCodec>>>,
    protocol: OnceLock<Arc<dyn Protocol>>,
    queue: Mutex<VecDeque<Buffer>>,
    driver: OnceLock<Arc<dyn Driver>>,
    attrs: AttributeMap,
    next_stream: AtomicU32,
}

impl Connection {
    /// A connection in the `Connecting` state with no socket.
    ///
    /// Transports attach a socket and open it. Detached connections are
    /// useful to drive a filter chain directly.
    #[must_use]
    pub fn new(is_client: bool, chain: FilterChain, tag: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            is_client,
            status: AtomicU8::new(ConnStatus::Connecting as u8),
            opened: AtomicBool::new(false),
            local_addr: OnceLock::new(),
            remote_addr: OnceLock::new(),
            tag,
            chain,
            read_buf: Mutex::new(Buffer::new()),
            codec: Mutex::new(None),
            protocol: OnceLock::new(),
            queue: Mutex::new(VecDeque::new()),
            driver: OnceLock::new(),
            attrs: AttributeMap::new(),
            next_stream: AtomicU32::new(if is_client { 1 } else { 2 }),
        })
    }

    /// Process-unique identifier.
    #[must_use]
    pub fn id(&self) -> u32 { self.id }

    /// Whether this side dialled.
    #[must_use]
    pub fn is_client(&self) -> bool { self.is_client }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnStatus { ConnStatus::from_u8(self.status.load(Ordering::Acquire)) }

    /// Whether the connection accepts reads and writes.
    #[must_use]
    pub fn is_open(&self) -> bool { self.status() == ConnStatus::Open }

    /// Local socket address, once attached.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.local_addr.get().copied() }

    /// Peer socket address, once attached.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr.get().copied() }

    /// Transport tag.
    #[must_use]
    pub fn tag(&self) -> Option<&str> { self.tag.as_deref() }

    /// Per-connection attributes.
    #[must_use]
    pub fn attrs(&self) -> &AttributeMap { &self.attrs }

    /// Filter chain handling this connection's events.
    #[must_use]
    pub fn chain(&self) -> &FilterChain { &self.chain }

    /// Protocol bound to this connection, if any.
    #[must_use]
    pub fn protocol(&self) -> Option<&Arc<dyn Protocol>> { self.protocol.get() }

    /// Bind `protocol`; later calls are ignored.
    pub fn bind(&self, protocol: Arc<dyn Protocol>) {
        let codec = protocol.new_codec(self.is_client);
        if self.protocol.set(protocol).is_ok() {
            *self.codec() = Some(codec);
        }
    }

    pub(crate) fn read_buf(&self) -> MutexGuard<'_, Buffer> {
        self.read_buf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn codec(&self) -> MutexGuard<'_, Option<Box<dyn FrameCodec>>> {
        self.codec.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Buffer>> { self.queue.lock().unwrap_or_else(PoisonError::into_inner) }

    pub(crate) fn attach(&self, local: SocketAddr, remote: SocketAddr, driver: Arc<dyn Driver>) {
        let _ = self.local_addr.set(local);
        let _ = self.remote_addr.set(remote);
        let _ = self.driver.set(driver);
    }

    /// Move from `Connecting` to `Open` and run the open hooks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyOpen`] unless the connection is connecting.
    pub fn open(self: &Arc<Self>) -> Result<()> {
        self.status
            .compare_exchange(
                ConnStatus::Connecting as u8,
                ConnStatus::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::AlreadyOpen(self.id))?;
        self.opened.store(true, Ordering::Release);
        metrics::inc_connections();
        tracing::info!(
            conn_id = self.id,
            client = self.is_client,
            peer = ?self.remote_addr(),
            "connection opened"
        );
        self.chain.fire_open(self);
        if !self.queue().is_empty() {
            self.wake();
        }
        Ok(())
    }

    fn wake(&self) {
        if let Some(driver) = self.driver.get() {
            driver.wake();
        }
    }

    /// Next outbound stream ID: odd for clients, even for servers.
    pub fn next_stream_id(&self) -> u32 {
        let id = self.next_stream.fetch_add(2, Ordering::Relaxed);
        if id == 0 {
            self.next_stream.fetch_add(2, Ordering::Relaxed)
        } else {
            id
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.status() {
            ConnStatus::Connecting | ConnStatus::Open => Ok(()),
            ConnStatus::Closing | ConnStatus::Closed => Err(Error::ConnectionClosed(self.id)),
        }
    }

    /// Send a message through the write hooks.
    ///
    /// Buffered bodies are encoded at once. Stream and file bodies are sent
    /// as a Header frame followed by Data frames pumped from a separate
    /// thread, ending with the packet's trailers or the stream's.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closing or a write hook fails.
    pub fn send(self: &Arc<Self>, mut packet: Packet) -> Result<()> {
        self.ensure_writable()?;
        if packet.stream_id == 0 {
            packet.stream_id = self.next_stream_id();
        }
        if !packet.body.is_streaming() {
            return self.chain.fire_write(self, Payload::Packet(packet));
        }
        let stream_id = packet.stream_id;
        let body = mem::take(&mut packet.body);
        let trailer = mem::take(&mut packet.trailer);
        self.send_frame(Frame::header(stream_id, packet.ident, packet.header, None, false))?;
        let conn = Arc::clone(self);
        PerTask::default().post(Task::new(move || conn.pump_body(stream_id, body, trailer)))?;
        Ok(())
    }

    /// Send a request.
    ///
    /// # Errors
    ///
    /// As for [`send`](Self::send).
    pub fn send_request(self: &Arc<Self>, request: Request) -> Result<()> { self.send(request.into_packet()) }

    fn pump_body(self: &Arc<Self>, stream_id: u32, mut body: Body, trailer: HeaderMap) {
        loop {
            match body.read_fast(true) {
                Ok(Some(buf)) => {
                    if let Err(e) = self.send_frame(Frame::data(stream_id, Some(buf), false)) {
                        tracing::debug!(conn_id = self.id, stream_id, error = %e, "body pump stopped");
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(conn_id = self.id, stream_id, error = %e, "body read failed");
                    break;
                }
            }
        }
        let trailer = match (&body, trailer.is_empty()) {
            (Body::Stream(stream), true) => stream.trailer().unwrap_or_default(),
            _ => trailer,
        };
        let end = if trailer.is_empty() {
            Frame::data(stream_id, None, true)
        } else {
            Frame::trailer(stream_id, trailer)
        };
        if let Err(e) = self.send_frame(end) {
            tracing::debug!(conn_id = self.id, stream_id, error = %e, "stream end not sent");
        }
    }

    /// Send one frame through the write hooks.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closing or a write hook fails.
    pub fn send_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        self.ensure_writable()?;
        self.chain.fire_write(self, Payload::Frame(frame))
    }

    /// Send raw bytes through the write hooks.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closing or a write hook fails.
    pub fn write(self: &Arc<Self>, buf: Buffer) -> Result<()> {
        self.ensure_writable()?;
        self.chain.fire_write(self, Payload::Bytes(buf))
    }

    /// Start an outbound streamed message with `request` as its head.
    ///
    /// # Errors
    ///
    /// Fails if the Header frame cannot be sent.
    pub fn open_stream(self: &Arc<Self>, request: Request) -> Result<OutboundStream> {
        let packet = request.into_packet();
        let stream_id = if packet.stream_id == 0 {
            self.next_stream_id()
        } else {
            packet.stream_id
        };
        self.send_frame(Frame::header(stream_id, packet.ident, packet.header, None, false))?;
        Ok(OutboundStream {
            conn: Arc::clone(self),
            stream_id,
            finished: false,
        })
    }

    /// Queue encoded bytes for the socket without running any hooks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] once closing has started.
    pub fn enqueue(&self, buf: Buffer) -> Result<()> {
        self.ensure_writable()?;
        if buf.available() == 0 {
            return Ok(());
        }
        self.queue().push_back(buf);
        metrics::inc_frames(Direction::Outbound);
        self.wake();
        Ok(())
    }

    /// Buffers waiting for the socket.
    #[must_use]
    pub fn pending_writes(&self) -> usize { self.queue().len() }

    pub(crate) fn take_writes(&self) -> VecDeque<Buffer> { mem::take(&mut *self.queue()) }

    /// Start closing: queued writes drain, then the socket closes.
    pub fn close(self: &Arc<Self>) {
        let moved = [ConnStatus::Open, ConnStatus::Connecting].into_iter().any(|from| {
            self.status
                .compare_exchange(
                    from as u8,
                    ConnStatus::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        });
        if !moved {
            return;
        }
        tracing::debug!(conn_id = self.id, pending = self.pending_writes(), "connection closing");
        if self.driver.get().is_some() {
            self.wake();
        } else {
            self.finalize();
        }
    }

    /// Close at once, dropping queued writes.
    pub fn close_with_error(self: &Arc<Self>) {
        if self.status() == ConnStatus::Closed {
            return;
        }
        self.status.store(ConnStatus::Closing as u8, Ordering::Release);
        self.finalize();
    }

    /// Mark closed, release queued writes, run the close hooks and release
    /// the socket. Runs once.
    pub(crate) fn finalize(self: &Arc<Self>) {
        if self.status.swap(ConnStatus::Closed as u8, Ordering::AcqRel) == ConnStatus::Closed as u8 {
            return;
        }
        let dropped = self.take_writes().len();
        if self.opened.load(Ordering::Acquire) {
            metrics::dec_connections();
            tracing::info!(conn_id = self.id, dropped, "connection closed");
            self.chain.fire_close(self);
        }
        if let Some(driver) = self.driver.get() {
            driver.shutdown();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("is_client", &self.is_client)
            .field("status", &self.status())
            .field("local_addr", &self.local_addr())
            .field("remote_addr", &self.remote_addr())
            .field("tag", &self.tag)
            .field("protocol", &self.protocol().map(|p| p.name()))
            .finish_non_exhaustive()
    }
}

/// Body of a message being written frame by frame.
///
/// Dropping an unfinished stream ends it without trailers.
pub struct OutboundStream {
    conn: Arc<Connection>,
    stream_id: u32,
    finished: bool,
}

impl OutboundStream {
    /// Stream ID of the message.
    #[must_use]
    pub fn stream_id(&self) -> u32 { self.stream_id }

    /// Send `buf` as a Data frame.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closing or the frame cannot be encoded.
    pub fn write(&mut self, buf: Buffer) -> Result<()> {
        self.conn.send_frame(Frame::data(self.stream_id, Some(buf), false))
    }

    /// End the message with `trailer`.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closing or the frame cannot be encoded.
    pub fn finish(mut self, trailer: HeaderMap) -> Result<()> {
        self.finished = true;
        self.conn.send_frame(Frame::trailer(self.stream_id, trailer))
    }

    /// End the message without trailers.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closing or the frame cannot be encoded.
    pub fn end(mut self) -> Result<()> {
        self.finished = true;
        self.conn.send_frame(Frame::data(self.stream_id, None, true))
    }
}

impl Drop for OutboundStream {
    fn drop(&mut self) {
        if !self.finished && self.conn.is_open() {
            let _ = self.conn.send_frame(Frame::data(self.stream_id, None, true));
        }
    }
}

impl fmt::Debug for OutboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundStream")
            .field("conn_id", &self.conn.id())
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}
