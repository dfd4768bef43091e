//! Transport and socket options.

use std::{fmt, io, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use socket2::{Domain, SockRef, Socket, TcpKeepalive};

use super::{Dial, Listen, conn::Connection};
use crate::{codec::Protocol, error::Error};

/// Socket family selected by the `network` option.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Network {
    /// IPv4 or IPv6, whichever the address resolves to.
    #[default]
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl Network {
    /// Whether `addr` belongs to this family.
    #[must_use]
    pub fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => addr.is_ipv4(),
            Self::Tcp6 => addr.is_ipv6(),
        }
    }

    pub(crate) fn domain(addr: &SocketAddr) -> Domain { Domain::for_address(*addr) }
}

impl FromStr for Network {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network {other:?}"),
            )),
        }
    }
}

/// Socket options applied to accepted and dialled sockets.
///
/// ```
/// use std::time::Duration;
///
/// use kgnet::transport::SocketOptions;
///
/// let options = SocketOptions::default()
///     .nodelay(true)
///     .keepalive(Some(Duration::from_secs(30)));
/// assert_ne!(options, SocketOptions::default());
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketOptions {
    nodelay: Option<bool>,
    keepalive: Option<Option<Duration>>,
    linger: Option<Option<Duration>>,
    send_buffer_size: Option<usize>,
    recv_buffer_size: Option<usize>,
    reuseaddr: Option<bool>,
}

impl SocketOptions {
    /// Configure `TCP_NODELAY`.
    #[must_use]
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = Some(enabled);
        self
    }

    /// Enable keep-alive probes after `idle`, or disable them with `None`.
    #[must_use]
    pub fn keepalive(mut self, idle: Option<Duration>) -> Self {
        self.keepalive = Some(idle);
        self
    }

    /// Configure `SO_LINGER`.
    #[must_use]
    pub fn linger(mut self, duration: Option<Duration>) -> Self {
        self.linger = Some(duration);
        self
    }

    /// Configure `SO_SNDBUF`.
    #[must_use]
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Configure `SO_RCVBUF`.
    #[must_use]
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Configure `SO_REUSEADDR` on listening sockets.
    #[must_use]
    pub fn reuseaddr(mut self, enabled: bool) -> Self {
        self.reuseaddr = Some(enabled);
        self
    }

    /// Whether `SO_REUSEADDR` is requested; listeners default to `true`.
    #[must_use]
    pub fn reuseaddr_or(&self, default: bool) -> bool { self.reuseaddr.unwrap_or(default) }

    /// Apply the options that must precede `bind` or `connect`.
    pub(crate) fn apply_before_connect(&self, socket: &Socket) -> io::Result<()> {
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }

    /// Apply per-connection options to an established stream.
    pub(crate) fn apply_stream<S>(&self, stream: &S) -> io::Result<()>
    where
        S: NoDelay,
        for<'a> SockRef<'a>: From<&'a S>,
    {
        if let Some(enabled) = self.nodelay {
            stream.set_nodelay(enabled)?;
        }
        let sock = SockRef::from(stream);
        if let Some(keepalive) = self.keepalive {
            match keepalive {
                Some(idle) => {
                    sock.set_keepalive(true)?;
                    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
                }
                None => sock.set_keepalive(false)?,
            }
        }
        if let Some(linger) = self.linger {
            sock.set_linger(linger)?;
        }
        Ok(())
    }
}

/// TCP streams of the supported runtimes.
pub(crate) trait NoDelay {
    fn set_nodelay(&self, enabled: bool) -> io::Result<()>;
}

impl NoDelay for std::net::TcpStream {
    fn set_nodelay(&self, enabled: bool) -> io::Result<()> { Self::set_nodelay(self, enabled) }
}

impl NoDelay for tokio::net::TcpStream {
    fn set_nodelay(&self, enabled: bool) -> io::Result<()> { Self::set_nodelay(self, enabled) }
}

impl NoDelay for mio::net::TcpStream {
    fn set_nodelay(&self, enabled: bool) -> io::Result<()> { Self::set_nodelay(self, enabled) }
}

/// Invoked once a dial completes, with the open connection or the failure.
pub type DialCallback = Arc<dyn Fn(Result<&Arc<Connection>, &Error>) + Send + Sync>;

/// Options shared by every connection of a transport.
#[derive(Clone, Default)]
pub struct TranOptions {
    /// Opaque label copied to every connection.
    pub tag: Option<String>,
    /// Socket family.
    pub network: Network,
    /// Deadline for a blocking dial; zero means none.
    pub dial_timeout: Duration,
    /// Invoked after each dial.
    pub dial_callback: Option<DialCallback>,
    /// Return from `dial` at once and connect in the background.
    pub dial_nonblocking: bool,
    /// Listener factory; defaults to [`super::TcpListen`].
    pub listen: Option<Arc<dyn Listen>>,
    /// Dialer; defaults to [`super::TcpDial`].
    pub dial: Option<Arc<dyn Dial>>,
    /// Socket options.
    pub socket: SocketOptions,
    /// Protocol bound to dialled connections. Accepted connections detect
    /// theirs from the first bytes.
    pub protocol: Option<Arc<dyn Protocol>>,
    /// Scratch size for socket reads.
    pub read_chunk: usize,
}

impl TranOptions {
    /// Set the connection tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Set the socket family.
    #[must_use]
    pub fn network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    /// Set the dial deadline.
    #[must_use]
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the post-dial callback.
    #[must_use]
    pub fn dial_callback(mut self, callback: DialCallback) -> Self {
        self.dial_callback = Some(callback);
        self
    }

    /// Connect in the background.
    #[must_use]
    pub fn dial_nonblocking(mut self, enabled: bool) -> Self {
        self.dial_nonblocking = enabled;
        self
    }

    /// Replace the listener factory.
    #[must_use]
    pub fn listen_with(mut self, listen: Arc<dyn Listen>) -> Self {
        self.listen = Some(listen);
        self
    }

    /// Replace the dialer.
    #[must_use]
    pub fn dial_with(mut self, dial: Arc<dyn Dial>) -> Self {
        self.dial = Some(dial);
        self
    }

    /// Set socket options.
    #[must_use]
    pub fn socket(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    /// Bind dialled connections to `protocol`.
    #[must_use]
    pub fn protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Set the socket read size.
    #[must_use]
    pub fn read_chunk(mut self, size: usize) -> Self {
        self.read_chunk = size;
        self
    }

    pub(crate) fn read_chunk_or_default(&self) -> usize {
        if self.read_chunk == 0 {
            crate::buffer::DEFAULT_CHUNK_SIZE * 4
        } else {
            self.read_chunk
        }
    }

    pub(crate) fn listener(&self) -> Arc<dyn Listen> {
        self.listen
            .clone()
            .unwrap_or_else(|| Arc::new(super::TcpListen))
    }

    pub(crate) fn dialer(&self) -> Arc<dyn Dial> { self.dial.clone().unwrap_or_else(|| Arc::new(super::TcpDial)) }
}

impl fmt::Debug for TranOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranOptions")
            .field("tag", &self.tag)
            .field("network", &self.network)
            .field("dial_timeout", &self.dial_timeout)
            .field("dial_nonblocking", &self.dial_nonblocking)
            .field("socket", &self.socket)
            .field("protocol", &self.protocol.as_ref().map(|p| p.name()))
            .finish_non_exhaustive()
    }
}
