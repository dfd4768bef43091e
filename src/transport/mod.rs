//! Socket transports.
//!
//! A [`Tran`] listens for and dials TCP connections and feeds their bytes
//! through a [`FilterChain`]. Two implementations share the
//! [`Connection`] type:
//!
//! - [`TaskTran`] runs one tokio read task and one write task per
//!   connection;
//! - [`ReactorTran`] runs a pool of `mio` pollers performing non-blocking
//!   reads and writes.
//!
//! Neither blocks callers of [`Connection::send`] on the socket: writes are
//! queued and drained by the transport.

mod conn;
mod options;
mod reactor;
mod task;

use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
pub use conn::{ConnStatus, Connection, OutboundStream};
pub(crate) use conn::Driver;
pub use options::{DialCallback, Network, SocketOptions, TranOptions};
pub use reactor::ReactorTran;
use socket2::{Socket, Type};
pub use task::TaskTran;

use crate::{
    config::{BackoffConfig, TransportKind},
    error::Result,
    filter::FilterChain,
};

/// Backlog passed to `listen(2)`.
pub const LISTEN_BACKLOG: i32 = 1024;

/// A transport for one filter chain.
#[async_trait]
pub trait Tran: Send + Sync {
    /// Start accepting on `addr` and return the bound address.
    ///
    /// # Errors
    ///
    /// Fails if the address does not resolve or cannot be bound.
    async fn listen(&self, addr: &str) -> Result<SocketAddr>;

    /// Connect to `addr`.
    ///
    /// With [`TranOptions::dial_nonblocking`] the connection is returned in
    /// the `Connecting` state and the dial callback reports the outcome.
    ///
    /// # Errors
    ///
    /// Fails if a blocking dial fails.
    async fn dial(&self, addr: &str) -> Result<Arc<Connection>>;

    /// Stop listening and close every connection.
    async fn close(&self);

    /// Chain run for every connection.
    fn filters(&self) -> &FilterChain;

    /// Options shared by every connection.
    fn options(&self) -> &TranOptions;
}

/// Creates listening sockets.
pub trait Listen: Send + Sync {
    /// Bind and listen on `addr`.
    ///
    /// # Errors
    ///
    /// Any socket error.
    fn listen(&self, addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpListener>;
}

/// Creates connected sockets.
pub trait Dial: Send + Sync {
    /// Connect to `addr`, waiting at most `timeout` when non-zero.
    ///
    /// # Errors
    ///
    /// Any socket error, or `TimedOut`.
    fn dial(&self, addr: SocketAddr, timeout: Duration, options: &SocketOptions) -> io::Result<TcpStream>;
}

/// Plain TCP listener built with `socket2`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpListen;

impl Listen for TcpListen {
    fn listen(&self, addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpListener> {
        let socket = Socket::new(Network::domain(&addr), Type::STREAM, None)?;
        socket.set_reuse_address(options.reuseaddr_or(true))?;
        options.apply_before_connect(&socket)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket.into())
    }
}

/// Plain TCP dialer built with `socket2`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpDial;

impl Dial for TcpDial {
    fn dial(&self, addr: SocketAddr, timeout: Duration, options: &SocketOptions) -> io::Result<TcpStream> {
        let socket = Socket::new(Network::domain(&addr), Type::STREAM, None)?;
        options.apply_before_connect(&socket)?;
        if timeout.is_zero() {
            socket.connect(&addr.into())?;
        } else {
            socket.connect_timeout(&addr.into(), timeout)?;
        }
        let stream: TcpStream = socket.into();
        options.apply_stream(&stream)?;
        Ok(stream)
    }
}

/// Resolve `addr` and keep the first address of `network`'s family.
///
/// # Errors
///
/// Returns `AddrNotAvailable` when nothing of the right family resolves.
pub fn resolve(network: Network, addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .find(|a| network.accepts(a))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {network:?} address for {addr}"),
            )
        })
}

/// Listen with the transport's listener factory.
pub(crate) fn open_listener(options: &TranOptions, addr: &str) -> io::Result<TcpListener> {
    let addr = resolve(options.network, addr)?;
    let listener = options.listener().listen(addr, &options.socket)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Dial with the transport's dialer, leaving the stream non-blocking.
pub(crate) fn connect(options: &TranOptions, addr: &str) -> io::Result<TcpStream> {
    let addr = resolve(options.network, addr)?;
    let stream = options.dialer().dial(addr, options.dial_timeout, &options.socket)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Construct the transport selected by `kind`.
///
/// # Errors
///
/// Returns an error if reactor poller threads cannot be started.
pub fn new_tran(
    kind: TransportKind,
    options: TranOptions,
    chain: FilterChain,
    backoff: BackoffConfig,
) -> io::Result<Arc<dyn Tran>> {
    Ok(match kind {
        TransportKind::Task => Arc::new(TaskTran::new(options, chain).with_backoff(backoff)),
        TransportKind::Reactor { pollers } => Arc::new(ReactorTran::new(options, chain, pollers)?),
    })
}

/// Create the connection object for a dial and bind the configured
/// protocol.
pub(crate) fn new_client_conn(options: &TranOptions, chain: &FilterChain) -> Arc<Connection> {
    let conn = Connection::new(true, chain.clone(), options.tag.clone());
    if let Some(protocol) = &options.protocol {
        conn.bind(Arc::clone(protocol));
    }
    conn
}

/// Report a finished dial to the configured callback.
pub(crate) fn report_dial(options: &TranOptions, outcome: std::result::Result<&Arc<Connection>, &crate::error::Error>) {
    if let Some(callback) = &options.dial_callback {
        callback(outcome);
    }
}
