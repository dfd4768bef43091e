//! Request-serving runtime.
//!
//! A [`Server`] owns a transport whose connections run the chain
//! `[codec, user filters…, processor]`. Inbound protocols are detected per
//! connection, so one listener serves RPC and HTTP/1 clients alike.
//!
//! ```no_run
//! use kgnet::{
//!     handler::{Route, handler_fn},
//!     packet::Response,
//!     router::RouteKey,
//!     server::Server,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), kgnet::server::ServerError> {
//! let server = Server::builder()
//!     .route(
//!         RouteKey::service("", "onPing"),
//!         Route::new(handler_fn(|_ctx, req| Ok(Response::for_request(&req).with_body("pong")))),
//!     )?
//!     .build()?;
//! server.run("127.0.0.1:8888").await
//! # }
//! ```

pub mod error;

use std::{fmt, future::Future, net::SocketAddr, sync::Arc};

pub use error::ServerError;
use log::info;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{CodecFilter, Detector},
    config::RuntimeConfig,
    executor::Executor,
    filter::{Filter, FilterChain},
    handler::{Dispatcher, Endpoint, Middleware, Route, Routes},
    processor::Processor,
    router::RouteKey,
    transport::{Tran, TranOptions, new_tran},
};

/// Configures a [`Server`].
#[must_use]
pub struct ServerBuilder {
    config: RuntimeConfig,
    options: TranOptions,
    routes: Routes,
    filters: Vec<Arc<dyn Filter>>,
    detector: Option<Detector>,
}

impl Default for ServerBuilder {
    fn default() -> Self { Self::new() }
}

impl ServerBuilder {
    /// Builder with default configuration and no routes.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            options: TranOptions::default(),
            routes: Routes::new(),
            filters: Vec::new(),
            detector: None,
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

    /// Register `route` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Route`] if the key is already taken or the
    /// template is invalid.
    pub fn route(mut self, key: RouteKey, route: Route) -> Result<Self, ServerError> {
        self.routes.add(key, route)?;
        Ok(self)
    }

    /// Register `endpoint` under `key` with no route middleware.
    ///
    /// # Errors
    ///
    /// As for [`route`](Self::route).
    pub fn handle(self, key: RouteKey, endpoint: impl Endpoint + 'static) -> Result<Self, ServerError> {
        self.route(key, Route::new(endpoint))
    }

    /// Route used when nothing matches. Without one, unmatched requests
    /// are answered with `404`.
    pub fn no_route(mut self, route: Route) -> Self {
        self.routes.set_no_route(route);
        self
    }

    /// Add middleware run for every route.
    pub fn wrap(mut self, mw: impl Middleware + 'static) -> Self {
        self.routes.wrap(mw);
        self
    }

    /// Add a filter between the codec and the processor.
    pub fn filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Detect inbound protocols with `detector` instead of the registry.
    pub fn detector(mut self, detector: Detector) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Start the executor and transport.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Executor`] or [`ServerError::Io`] if worker
    /// threads cannot be started.
    pub fn build(self) -> Result<Server, ServerError> {
        let executor = self.config.executor.build()?;
        let processor = Arc::new(Processor::new(
            Arc::clone(&executor),
            Arc::new(Dispatcher::new(self.routes, None)),
        ));
        let codec = self.detector.map_or_else(CodecFilter::new, CodecFilter::with_detector);
        let mut filters: Vec<Arc<dyn Filter>> = vec![Arc::new(codec)];
        filters.extend(self.filters);
        filters.push(Arc::clone(&processor) as Arc<dyn Filter>);
        let chain = FilterChain::new(filters);
        let mut options = self.options;
        if options.read_chunk == 0 {
            options.read_chunk = self.config.buffer.chunk_size;
        }
        let tran = new_tran(self.config.transport, options, chain, self.config.backoff)?;
        Ok(Server {
            tran,
            executor,
            processor,
            shutdown: CancellationToken::new(),
        })
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("options", &self.options)
            .field("routes", &self.routes)
            .field("filters", &self.filters.len())
            .finish_non_exhaustive()
    }
}

/// A running request server.
pub struct Server {
    tran: Arc<dyn Tran>,
    executor: Arc<dyn Executor>,
    processor: Arc<Processor>,
    shutdown: CancellationToken,
}

impl Server {
    /// Start configuring a server.
    pub fn builder() -> ServerBuilder { ServerBuilder::new() }

    /// Accept connections on `addr` in the background. May be called for
    /// several addresses.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Listen`] if the address cannot be bound.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr, ServerError> { Ok(self.tran.listen(addr).await?) }

    /// Serve `addr` until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Listen`] if the address cannot be bound.
    pub async fn run(self, addr: &str) -> Result<(), ServerError> {
        self.run_with_shutdown(addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await
    }

    /// Serve `addr` until `shutdown` resolves or [`Server::shutdown_token`]
    /// is cancelled, then close every connection.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Listen`] if the address cannot be bound.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub async fn run_with_shutdown<S>(self, addr: &str, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        let local = self.listen(addr).await?;
        info!("server ready: local_addr={local}");
        select! {
            () = shutdown => {},
            () = self.shutdown.cancelled() => {},
        }
        self.shutdown().await;
        Ok(())
    }

    /// Token that stops [`run_with_shutdown`](Self::run_with_shutdown) when
    /// cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    /// Stop accepting, close every connection and stop the executor.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tran.close().await;
        self.executor.shutdown();
        info!("server stopped");
    }

    /// Transport serving the connections.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Tran> { &self.tran }

    /// Inbound streams still receiving frames.
    #[must_use]
    pub fn active_streams(&self) -> usize { self.processor.active_streams() }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("options", self.tran.options())
            .field("processor", &self.processor)
            .finish_non_exhaustive()
    }
}
