//! Request-issuing runtime.
//!
//! A [`Client`] dials one connection per remote address and reuses it
//! until it closes. Calls are correlated by sequence ID through a
//! [`Caller`], time out on a timing wheel and may be retried under a
//! [`RetryPolicy`].
//!
//! ```no_run
//! use kgnet::{client::{CallOptions, Client}, packet::Request};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::builder().build()?;
//! let resp = client
//!     .call("127.0.0.1:8888", Request::new("onPing").with_body("x"), CallOptions::default())
//!     .await?;
//! assert!(resp.is_some_and(|r| r.is_success()));
//! # Ok(())
//! # }
//! ```

pub mod error;

use std::{fmt, sync::Arc, time::Duration};

use dashmap::DashMap;
pub use error::ClientError;
use tokio::sync::{Mutex, oneshot};

use crate::{
    caller::{Caller, ConnRetryer, ResponseCallback, RetryPolicy, Retryer, next_seq_id},
    codec::{self, CodecFilter, Protocol, rpc::RpcProtocol},
    config::{CallDefaults, RuntimeConfig},
    error::{Error, Result},
    executor::Executor,
    filter::{Filter, FilterChain},
    handler::{Dispatcher, Middleware, Route, Routes},
    packet::{Request, Response},
    processor::Processor,
    router::RouteKey,
    timer::TimingWheel,
    transport::{Connection, Tran, TranOptions, new_tran},
};

/// Per-call settings. Zero durations fall back to the client's
/// [`CallDefaults`].
#[derive(Default)]
#[must_use]
pub struct CallOptions {
    /// Time allowed for a response, per attempt.
    pub call_timeout: Duration,
    /// Time allowed to establish a new connection.
    pub dial_timeout: Duration,
    /// Completion callback. When set, [`Client::call`] returns as soon as
    /// the request is sent.
    pub callback: Option<ResponseCallback>,
    /// Decides whether a timed-out call is retried.
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl CallOptions {
    /// Set the per-attempt timeout.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the dial timeout.
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Complete the call through `callback` instead of the returned future.
    pub fn callback(mut self, callback: impl FnOnce(Response) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Retry timed-out attempts while `policy` allows.
    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("call_timeout", &self.call_timeout)
            .field("dial_timeout", &self.dial_timeout)
            .field("callback", &self.callback.is_some())
            .field("retry_policy", &self.retry_policy.is_some())
            .finish()
    }
}

/// Configures a [`Client`].
#[must_use]
pub struct ClientBuilder {
    config: RuntimeConfig,
    options: TranOptions,
    routes: Routes,
    filters: Vec<Arc<dyn Filter>>,
    protocol: String,
    wheel: Option<TimingWheel>,
}

impl Default for ClientBuilder {
    fn default() -> Self { Self::new() }
}

impl ClientBuilder {
    /// Builder speaking the RPC protocol with default configuration.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            options: TranOptions::default(),
            routes: Routes::new(),
            filters: Vec::new(),
            protocol: RpcProtocol.name().to_owned(),
            wheel: None,
        }
    }

    /// Replace the runtime configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the transport options.
    pub fn options(mut self, options: TranOptions) -> Self {
        self.options = options;
        self
    }

    /// Speak the registered protocol `name` on dialled connections.
    pub fn protocol(mut self, name: impl Into<String>) -> Self {
        self.protocol = name.into();
        self
    }

    /// Serve requests the peer sends back on client connections.
    ///
    /// # Errors
    ///
    /// Returns the router's registration error.
    pub fn route(mut self, key: RouteKey, route: Route) -> std::result::Result<Self, crate::router::RouterError> {
        self.routes.add(key, route)?;
        Ok(self)
    }

    /// Add middleware for requests served on client connections.
    pub fn wrap(mut self, mw: impl Middleware + 'static) -> Self {
        self.routes.wrap(mw);
        self
    }

    /// Add a filter between the codec and the processor.
    pub fn filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Time calls out on `wheel` instead of a wheel owned by the client.
    pub fn wheel(mut self, wheel: TimingWheel) -> Self {
        self.wheel = Some(wheel);
        self
    }

    /// Start the executor, timing wheel and transport.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownProtocol`] for an unregistered
    /// protocol, or an error if worker threads cannot be started.
    pub fn build(self) -> std::result::Result<Client, ClientError> {
        let protocol =
            codec::lookup(&self.protocol).ok_or_else(|| ClientError::UnknownProtocol(self.protocol.clone()))?;
        let executor = self.config.executor.build()?;
        let wheel = match self.wheel {
            Some(wheel) => wheel,
            None => TimingWheel::start(self.config.wheel, Arc::clone(&executor))?,
        };
        let caller = Caller::new(wheel.clone());
        let processor = Arc::new(Processor::new(
            Arc::clone(&executor),
            Arc::new(Dispatcher::new(self.routes, Some(caller.clone()))),
        ));
        let mut filters: Vec<Arc<dyn Filter>> = vec![Arc::new(CodecFilter::new())];
        filters.extend(self.filters);
        filters.push(processor as Arc<dyn Filter>);
        let mut options = self.options.protocol(protocol);
        if options.dial_timeout.is_zero() {
            options.dial_timeout = self.config.calls.dial_timeout;
        }
        if options.read_chunk == 0 {
            options.read_chunk = self.config.buffer.chunk_size;
        }
        let tran = new_tran(self.config.transport, options, FilterChain::new(filters), self.config.backoff)?;
        Ok(Client {
            tran,
            executor,
            wheel,
            caller,
            defaults: self.config.calls,
            conns: DashMap::new(),
            dialing: Mutex::new(()),
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("protocol", &self.protocol)
            .field("filters", &self.filters.len())
            .finish_non_exhaustive()
    }
}

/// Issues requests over reused connections.
pub struct Client {
    tran: Arc<dyn Tran>,
    executor: Arc<dyn Executor>,
    wheel: TimingWheel,
    caller: Caller,
    defaults: CallDefaults,
    conns: DashMap<String, Arc<Connection>>,
    dialing: Mutex<()>,
}

impl Client {
    /// Start configuring a client.
    pub fn builder() -> ClientBuilder { ClientBuilder::new() }

    /// Open connection to `addr`, dialling if none is open.
    ///
    /// # Errors
    ///
    /// Returns the dial error, or an I/O timeout if `dial_timeout` elapses.
    pub async fn connect(&self, addr: &str, dial_timeout: Duration) -> Result<Arc<Connection>> {
        if let Some(conn) = self.reusable(addr) {
            return Ok(conn);
        }
        let _guard = self.dialing.lock().await;
        if let Some(conn) = self.reusable(addr) {
            return Ok(conn);
        }
        let timeout = self.defaults.dial_timeout_or_default(dial_timeout);
        let conn = if timeout.is_zero() {
            self.tran.dial(addr).await?
        } else {
            tokio::time::timeout(timeout, self.tran.dial(addr))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"))??
        };
        tracing::debug!(conn_id = conn.id(), addr, "dialled");
        self.conns.insert(addr.to_owned(), Arc::clone(&conn));
        Ok(conn)
    }

    fn reusable(&self, addr: &str) -> Option<Arc<Connection>> {
        let conn = self.conns.get(addr).map(|e| Arc::clone(e.value()))?;
        if conn.is_open() {
            return Some(conn);
        }
        self.conns.remove_if(addr, |_, c| Arc::ptr_eq(c, &conn));
        None
    }

    /// Send `req` to `addr`.
    ///
    /// Returns the response, or `None` when the request is oneway or a
    /// callback was supplied. A call that times out completes with status
    /// `408`.
    ///
    /// # Errors
    ///
    /// Returns dial and send failures. Failures after the request is sent
    /// are reported as responses.
    pub async fn call(&self, addr: &str, req: Request, opts: CallOptions) -> Result<Option<Response>> {
        let conn = self.connect(addr, opts.dial_timeout).await?;
        self.call_on(&conn, req, opts).await
    }

    /// Send `req` on `conn`. See [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// As for [`call`](Self::call).
    pub async fn call_on(&self, conn: &Arc<Connection>, mut req: Request, opts: CallOptions) -> Result<Option<Response>> {
        if req.seq_id() == 0 {
            req.ident_mut().seq_id = next_seq_id();
        }
        if req.is_oneway() {
            conn.send_request(req)?;
            return Ok(None);
        }
        let seq_id = req.seq_id();
        let timeout = self.defaults.call_timeout_or_default(opts.call_timeout);
        let retryer = opts
            .retry_policy
            .map(|policy| Arc::new(ConnRetryer::new(conn, policy)) as Arc<dyn Retryer>);
        if let Some(callback) = opts.callback {
            self.caller.register(&req, callback, timeout, retryer)?;
            return self.send(conn, seq_id, req).map(|()| None);
        }
        let (tx, rx) = oneshot::channel();
        let callback: ResponseCallback = Box::new(move |resp| {
            let _ = tx.send(resp);
        });
        self.caller.register(&req, callback, timeout, retryer)?;
        self.send(conn, seq_id, req)?;
        rx.await.map(Some).map_err(|_| Error::Closed)
    }

    fn send(&self, conn: &Arc<Connection>, seq_id: u32, req: Request) -> Result<()> {
        let sent = conn.send_request(req);
        if sent.is_err() {
            self.caller.unregister(seq_id);
        }
        sent
    }

    /// Calls awaiting a response.
    #[must_use]
    pub fn outstanding(&self) -> usize { self.caller.len() }

    /// Transport carrying the connections.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Tran> { &self.tran }

    /// Close every connection and stop background work.
    pub async fn close(&self) {
        self.conns.clear();
        self.tran.close().await;
        self.wheel.shutdown();
        self.executor.shutdown();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connections", &self.conns.len())
            .field("caller", &self.caller)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}
