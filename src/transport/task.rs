//! Task-per-connection transport on tokio.
//!
//! Every connection owns a read task and a write task. The read task hands
//! each socket read to the filter chain; the write task sleeps on a
//! [`Notify`] until the connection queues bytes or starts closing, then
//! drains the queue into the socket.

use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener,
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::Notify,
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

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
    config::BackoffConfig,
    error::{Error, Result},
    filter::{FilterChain, Payload},
};

/// Transport running two tokio tasks per connection.
///
/// Must be used from within a tokio runtime.
pub struct TaskTran {
    inner: Arc<Inner>,
}

struct Inner {
    options: TranOptions,
    chain: FilterChain,
    backoff: BackoffConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    conns: DashMap<u32, Arc<Connection>>,
}

struct TaskDriver {
    notify: Notify,
    cancel: CancellationToken,
}

impl Driver for TaskDriver {
    fn wake(&self) { self.notify.notify_one(); }

    fn shutdown(&self) { self.cancel.cancel(); }
}

impl TaskTran {
    /// Transport running `chain` with `options`.
    #[must_use]
    pub fn new(options: TranOptions, chain: FilterChain) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                chain,
                backoff: BackoffConfig::default(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                conns: DashMap::new(),
            }),
        }
    }

    /// Back-off applied when `accept` fails.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.backoff = backoff.normalized();
        }
        self
    }

    /// Open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize { self.inner.conns.len() }
}

#[async_trait]
impl Tran for TaskTran {
    async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::from_std(open_listener(&self.inner.options, addr)?)?;
        let local = listener.local_addr()?;
        log::info!("listening on {local}");
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(accept_loop(listener, inner));
        Ok(local)
    }

    async fn dial(&self, addr: &str) -> Result<Arc<Connection>> {
        let conn = new_client_conn(&self.inner.options, &self.inner.chain);
        if self.inner.options.dial_nonblocking {
            let inner = Arc::clone(&self.inner);
            let pending = Arc::clone(&conn);
            let addr = addr.to_owned();
            self.inner.tracker.spawn(async move {
                let _ = inner.finish_dial(pending, addr).await;
            });
            return Ok(conn);
        }
        self.inner.finish_dial(Arc::clone(&conn), addr.to_owned()).await?;
        Ok(conn)
    }

    async fn close(&self) {
        self.inner.shutdown.cancel();
        let conns: Vec<_> = self.inner.conns.iter().map(|e| Arc::clone(e.value())).collect();
        for conn in conns {
            conn.close();
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    fn filters(&self) -> &FilterChain { &self.inner.chain }

    fn options(&self) -> &TranOptions { &self.inner.options }
}

impl Inner {
    async fn finish_dial(self: &Arc<Self>, conn: Arc<Connection>, addr: String) -> Result<()> {
        let options = self.options.clone();
        let dialled = tokio::task::spawn_blocking(move || connect(&options, &addr))
            .await
            .map_err(io::Error::other)
            .and_then(|r| r);
        let outcome = match dialled {
            Ok(stream) => TcpStream::from_std(stream)
                .map_err(Error::from)
                .and_then(|stream| self.start(Arc::clone(&conn), stream)),
            Err(e) => Err(e.into()),
        };
        match &outcome {
            Ok(()) => report_dial(&self.options, Ok(&conn)),
            Err(e) => {
                tracing::debug!(conn_id = conn.id(), error = %e, "dial failed");
                report_dial(&self.options, Err(e));
                conn.close_with_error();
            }
        }
        outcome
    }

    fn start(self: &Arc<Self>, conn: Arc<Connection>, stream: TcpStream) -> Result<()> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let driver = Arc::new(TaskDriver {
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        });
        conn.attach(local, peer, Arc::clone(&driver) as Arc<dyn Driver>);
        self.conns.insert(conn.id(), Arc::clone(&conn));
        conn.open()?;
        let chunk = self.options.read_chunk_or_default();
        self.tracker.spawn(read_loop(Arc::clone(&conn), reader, driver.cancel.clone(), chunk));
        self.tracker.spawn(write_loop(conn, writer, driver, Arc::clone(self)));
        Ok(())
    }

    fn accepted(self: &Arc<Self>, stream: TcpStream) -> Result<()> {
        self.options.socket.apply_stream(&stream)?;
        let conn = Connection::new(false, self.chain.clone(), self.options.tag.clone());
        self.start(conn, stream)
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<Inner>) {
    let mut delay = inner.backoff.initial_delay;
    while let Some(next) = accept_iteration(&listener, &inner, delay).await {
        delay = next;
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn accept_iteration(listener: &TcpListener, inner: &Arc<Inner>, delay: Duration) -> Option<Duration> {
    select! {
        biased;

        () = inner.shutdown.cancelled() => None,
        res = listener.accept() => Some(match res {
            Ok((stream, peer)) => {
                if let Err(e) = inner.accepted(stream) {
                    tracing::warn!(%peer, error = %e, "failed to start connection");
                }
                inner.backoff.initial_delay
            }
            Err(e) => {
                let local_addr = listener.local_addr().ok();
                log::warn!("accept error: error={e:?}, local_addr={local_addr:?}");
                sleep(delay).await;
                (delay * 2).min(inner.backoff.max_delay)
            }
        }),
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn read_loop(conn: Arc<Connection>, mut reader: OwnedReadHalf, cancel: CancellationToken, chunk: usize) {
    let mut scratch = vec![0u8; chunk];
    loop {
        let read = select! {
            biased;

            () = cancel.cancelled() => return,
            res = reader.read(&mut scratch) => res,
        };
        match read {
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
            Err(e) => {
                conn.chain().fire_error(&conn, e.into());
                conn.close_with_error();
                return;
            }
        }
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn write_loop(conn: Arc<Connection>, mut writer: OwnedWriteHalf, driver: Arc<TaskDriver>, inner: Arc<Inner>) {
    loop {
        let batch = conn.take_writes();
        if batch.is_empty() {
            match conn.status() {
                ConnStatus::Closing => {
                    let _ = writer.shutdown().await;
                    conn.finalize();
                    break;
                }
                ConnStatus::Closed => break,
                ConnStatus::Connecting | ConnStatus::Open => {}
            }
            select! {
                biased;

                () = driver.cancel.cancelled() => break,
                () = driver.notify.notified() => {}
            }
            continue;
        }
        for mut buf in batch {
            if let Err(e) = writer.write_all_buf(&mut buf).await {
                conn.chain().fire_error(&conn, e.into());
                conn.close_with_error();
                inner.conns.remove(&conn.id());
                return;
            }
        }
    }
    inner.conns.remove(&conn.id());
}
