//! Non-blocking reactor transport on `mio`.
//!
//! A pool of worker pollers owns the connections; a separate poller owns
//! the listeners and hands accepted sockets to the workers round-robin.
//! Each poller thread waits in the platform multiplexer, reads until the
//! socket would block and writes until the queue drains, keeping `WRITABLE`
//! interest only while bytes are pending.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read},
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        Weak,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use mio::{
    Events,
    Interest,
    Poll,
    Token,
    Waker,
    event::Event,
    net::{TcpListener, TcpStream},
};
use tokio::sync::{Notify, oneshot};

use super::{
    ConnStatus,
    Connection,
    Driver,
    Tran,
    TranOptions,
    connect,
    new_client_conn,
    open_listener,
    report_dial,
};
use crate::{
    buffer::Buffer,
    error::{Error, Result},
    executor::{Executor, PerTask, Task},
    filter::{FilterChain, Payload},
};

const WAKER: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 1024;

/// How long [`Tran::close`] waits for queued writes to drain.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

enum Command {
    Attach {
        token: Token,
        conn: Arc<Connection>,
        stream: TcpStream,
    },
    Listen {
        token: Token,
        listener: TcpListener,
    },
    Dirty(Token),
    Release(Token),
    Stop,
}

struct Poller {
    name: String,
    waker: Waker,
    commands: Mutex<Vec<Command>>,
    next_token: AtomicUsize,
    poll: Mutex<Option<Poll>>,
}

impl Poller {
    fn new(name: String) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        Ok(Self {
            name,
            waker,
            commands: Mutex::new(Vec::new()),
            next_token: AtomicUsize::new(0),
            poll: Mutex::new(Some(poll)),
        })
    }

    fn token(&self) -> Token { Token(self.next_token.fetch_add(1, Ordering::Relaxed)) }

    fn send(&self, command: Command) {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner).push(command);
        if let Err(e) = self.waker.wake() {
            tracing::error!(poller = %self.name, error = %e, "failed to wake poller");
        }
    }

    fn start(self: &Arc<Self>, inner: Weak<Inner>, chunk: usize) -> io::Result<()> {
        let Some(poll) = self.poll.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Ok(());
        };
        let mut looper = Looper {
            poll,
            shared: Arc::clone(self),
            inner,
            conns: HashMap::new(),
            listeners: HashMap::new(),
            scratch: vec![0; chunk],
        };
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || looper.run())?;
        Ok(())
    }
}

struct ReactorDriver {
    poller: Arc<Poller>,
    token: Token,
}

impl Driver for ReactorDriver {
    fn wake(&self) { self.poller.send(Command::Dirty(self.token)); }

    fn shutdown(&self) { self.poller.send(Command::Release(self.token)); }
}

struct Entry {
    conn: Arc<Connection>,
    stream: TcpStream,
    outgoing: VecDeque<Buffer>,
    writing: bool,
}

impl Entry {
    /// Write until the queue drains or the socket would block. Returns
    /// whether everything was written.
    fn flush(&mut self) -> io::Result<bool> {
        self.outgoing.extend(self.conn.take_writes());
        while let Some(buf) = self.outgoing.front_mut() {
            if buf.available() == 0 {
                self.outgoing.pop_front();
                continue;
            }
            match buf.write_to(&mut self.stream) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn read_ready(&mut self, scratch: &mut [u8]) {
        let conn = Arc::clone(&self.conn);
        loop {
            match self.stream.read(scratch) {
                Ok(0) => {
                    if conn.is_open() {
                        conn.chain().fire_read(&conn, Payload::Eof);
                    }
                    conn.close();
                    return;
                }
                Ok(n) => {
                    if conn.is_open() {
                        conn.chain().fire_read(&conn, Payload::Bytes(Buffer::from_slice(&scratch[..n])));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    conn.chain().fire_error(&conn, e.into());
                    conn.close_with_error();
                    return;
                }
            }
        }
    }
}

struct Looper {
    poll: Poll,
    shared: Arc<Poller>,
    inner: Weak<Inner>,
    conns: HashMap<Token, Entry>,
    listeners: HashMap<Token, TcpListener>,
    scratch: Vec<u8>,
}

impl Looper {
    fn run(&mut self) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        tracing::debug!(poller = %self.shared.name, "poller started");
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(poller = %self.shared.name, error = %e, "poll failed");
                break;
            }
            for event in &events {
                match event.token() {
                    WAKER => {}
                    token if self.listeners.contains_key(&token) => self.accept(token),
                    token => self.conn_event(token, event),
                }
            }
            if !self.run_commands() {
                break;
            }
        }
        for entry in self.conns.values() {
            entry.conn.close_with_error();
        }
        self.conns.clear();
        self.listeners.clear();
        tracing::debug!(poller = %self.shared.name, "poller stopped");
    }

    fn run_commands(&mut self) -> bool {
        loop {
            let commands = std::mem::take(&mut *self.shared.commands.lock().unwrap_or_else(PoisonError::into_inner));
            if commands.is_empty() {
                return true;
            }
            for command in commands {
                match command {
                    Command::Attach { token, conn, mut stream } => {
                        if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                            conn.chain().fire_error(&conn, e.into());
                            conn.close_with_error();
                            continue;
                        }
                        self.conns.insert(token, Entry {
                            conn,
                            stream,
                            outgoing: VecDeque::new(),
                            writing: false,
                        });
                        self.flush(token);
                    }
                    Command::Listen { token, mut listener } => {
                        match self.poll.registry().register(&mut listener, token, Interest::READABLE) {
                            Ok(()) => {
                                self.listeners.insert(token, listener);
                            }
                            Err(e) => log::error!("failed to register listener: {e}"),
                        }
                    }
                    Command::Dirty(token) => self.flush(token),
                    Command::Release(token) => self.release(token),
                    Command::Stop => return false,
                }
            }
        }
    }

    fn accept(&mut self, token: Token) {
        let Some(listener) = self.listeners.get(&token) else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let Some(inner) = self.inner.upgrade() else {
                        return;
                    };
                    let conn = Connection::new(false, inner.chain.clone(), inner.options.tag.clone());
                    if let Err(e) = inner
                        .options
                        .socket
                        .apply_stream(&stream)
                        .map_err(Error::from)
                        .and_then(|()| inner.adopt(Arc::clone(&conn), stream))
                    {
                        tracing::warn!(%peer, error = %e, "failed to start connection");
                        conn.close_with_error();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let local_addr = listener.local_addr().ok();
                    log::warn!("accept error: error={e:?}, local_addr={local_addr:?}");
                    return;
                }
            }
        }
    }

    fn conn_event(&mut self, token: Token, event: &Event) {
        let Self { conns, scratch, .. } = self;
        let Some(entry) = conns.get_mut(&token) else {
            return;
        };
        if event.is_readable() || event.is_read_closed() {
            entry.read_ready(scratch);
        }
        if event.is_error() {
            let err = match entry.stream.take_error() {
                Ok(Some(e)) | Err(e) => e,
                Ok(None) => io::ErrorKind::ConnectionReset.into(),
            };
            entry.conn.chain().fire_error(&entry.conn, err.into());
            entry.conn.close_with_error();
            return;
        }
        if event.is_writable() {
            self.flush(token);
        }
    }

    fn flush(&mut self, token: Token) {
        let Some(entry) = self.conns.get_mut(&token) else {
            return;
        };
        match entry.flush() {
            Ok(drained) => {
                if entry.writing == drained {
                    let interest = if drained {
                        Interest::READABLE
                    } else {
                        Interest::READABLE | Interest::WRITABLE
                    };
                    if let Err(e) = self.poll.registry().reregister(&mut entry.stream, token, interest) {
                        tracing::warn!(conn_id = entry.conn.id(), error = %e, "reregister failed");
                    }
                    entry.writing = !drained;
                }
                if drained && entry.conn.status() == ConnStatus::Closing {
                    let conn = Arc::clone(&entry.conn);
                    conn.finalize();
                }
            }
            Err(e) => {
                let conn = Arc::clone(&entry.conn);
                conn.chain().fire_error(&conn, e.into());
                conn.close_with_error();
            }
        }
    }

    fn release(&mut self, token: Token) {
        let Some(mut entry) = self.conns.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut entry.stream);
        let _ = entry.stream.shutdown(std::net::Shutdown::Both);
        if let Some(inner) = self.inner.upgrade() {
            inner.forget(entry.conn.id());
        }
    }
}

/// Transport driving sockets from a pool of `mio` pollers.
pub struct ReactorTran {
    inner: Arc<Inner>,
}

struct Inner {
    options: TranOptions,
    chain: FilterChain,
    workers: Vec<Arc<Poller>>,
    acceptor: Arc<Poller>,
    next_worker: AtomicUsize,
    conns: DashMap<u32, Arc<Connection>>,
    idle: Notify,
}

impl ReactorTran {
    /// Transport with `pollers` worker pollers; zero means one per CPU.
    ///
    /// # Errors
    ///
    /// Fails if a poller cannot be created or its thread cannot start.
    pub fn new(options: TranOptions, chain: FilterChain, pollers: usize) -> io::Result<Self> {
        let pollers = if pollers == 0 {
            thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            pollers
        };
        let workers = (0..pollers)
            .map(|i| Poller::new(format!("kgnet-poller-{i}")).map(Arc::new))
            .collect::<io::Result<Vec<_>>>()?;
        let acceptor = Arc::new(Poller::new("kgnet-acceptor".to_owned())?);
        let chunk = options.read_chunk_or_default();
        let inner = Arc::new(Inner {
            options,
            chain,
            workers,
            acceptor,
            next_worker: AtomicUsize::new(0),
            conns: DashMap::new(),
            idle: Notify::new(),
        });
        for poller in inner.workers.iter().chain(std::iter::once(&inner.acceptor)) {
            poller.start(Arc::downgrade(&inner), chunk)?;
        }
        Ok(Self { inner })
    }

    /// Number of worker pollers.
    #[must_use]
    pub fn pollers(&self) -> usize { self.inner.workers.len() }

    /// Open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize { self.inner.conns.len() }
}

impl Inner {
    fn pick_worker(&self) -> &Arc<Poller> {
        let i = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[i]
    }

    fn adopt(&self, conn: Arc<Connection>, stream: TcpStream) -> Result<()> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let poller = self.pick_worker();
        let token = poller.token();
        conn.attach(
            local,
            peer,
            Arc::new(ReactorDriver {
                poller: Arc::clone(poller),
                token,
            }),
        );
        self.conns.insert(conn.id(), Arc::clone(&conn));
        conn.open()?;
        poller.send(Command::Attach { token, conn, stream });
        Ok(())
    }

    fn forget(&self, id: u32) {
        self.conns.remove(&id);
        if self.conns.is_empty() {
            self.idle.notify_waiters();
        }
    }

    fn finish_dial(&self, conn: &Arc<Connection>, addr: &str) -> Result<()> {
        let outcome = connect(&self.options, addr)
            .map(TcpStream::from_std)
            .map_err(Error::from)
            .and_then(|stream| self.adopt(Arc::clone(conn), stream));
        match &outcome {
            Ok(()) => report_dial(&self.options, Ok(conn)),
            Err(e) => {
                tracing::debug!(conn_id = conn.id(), error = %e, "dial failed");
                report_dial(&self.options, Err(e));
                conn.close_with_error();
            }
        }
        outcome
    }

    fn stop(&self) {
        for poller in self.workers.iter().chain(std::iter::once(&self.acceptor)) {
            poller.send(Command::Stop);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) { self.stop(); }
}

#[async_trait]
impl Tran for ReactorTran {
    async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::from_std(open_listener(&self.inner.options, addr)?);
        let local = listener.local_addr()?;
        log::info!("listening on {local}");
        let token = self.inner.acceptor.token();
        self.inner.acceptor.send(Command::Listen { token, listener });
        Ok(local)
    }

    async fn dial(&self, addr: &str) -> Result<Arc<Connection>> {
        let conn = new_client_conn(&self.inner.options, &self.inner.chain);
        let inner = Arc::clone(&self.inner);
        let pending = Arc::clone(&conn);
        let addr = addr.to_owned();
        if self.inner.options.dial_nonblocking {
            PerTask::default().post(Task::new(move || {
                let _ = inner.finish_dial(&pending, &addr);
            }))?;
            return Ok(conn);
        }
        let (tx, rx) = oneshot::channel();
        PerTask::default().post(Task::new(move || {
            let _ = tx.send(inner.finish_dial(&pending, &addr));
        }))?;
        rx.await.map_err(|_| Error::ConnectionClosed(conn.id()))??;
        Ok(conn)
    }

    async fn close(&self) {
        self.inner.acceptor.send(Command::Stop);
        let conns: Vec<_> = self.inner.conns.iter().map(|e| Arc::clone(e.value())).collect();
        for conn in conns {
            conn.close();
        }
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.conns.is_empty() {
                break;
            }
            if tokio::time::timeout(CLOSE_GRACE, idle).await.is_err() {
                tracing::warn!(remaining = self.inner.conns.len(), "closing undrained connections");
                let conns: Vec<_> = self.inner.conns.iter().map(|e| Arc::clone(e.value())).collect();
                for conn in conns {
                    conn.close_with_error();
                }
                break;
            }
        }
        self.inner.stop();
    }

    fn filters(&self) -> &FilterChain { &self.inner.chain }

    fn options(&self) -> &TranOptions { &self.inner.options }
}
