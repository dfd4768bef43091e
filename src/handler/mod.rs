//! Request handlers, middleware and dispatch.
//!
//! Every handler shape is promoted to an [`Endpoint`], the canonical
//! `(Context, Request) -> Result<Response>` form:
//!
//! - [`handler_fn`] wraps a closure of exactly that shape;
//! - [`responder`] ignores the request: `(Context) -> Result<Response>`;
//! - [`consumer`] produces no body: `(Context, Request) -> Result<()>`;
//! - [`typed`] decodes the body with the request's codec and encodes the
//!   result the same way: `(Context, In) -> Result<Out>`.
//!
//! A [`Route`] wraps an endpoint in [`Middleware`]. The [`Dispatcher`]
//! plugs routes into the [`Processor`](crate::processor::Processor): it
//! runs requests through the router and hands responses to the
//! [`Caller`].

use std::{fmt, marker::PhantomData, net::SocketAddr, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    attr::AttributeMap,
    caller::Caller,
    error::{Error, Result},
    packet::{Identifier, Packet, Request, Response},
    panic,
    processor::{Callback, Dispatch},
    router::{RouteKey, Router, RouterError},
    transport::Connection,
};

/// Per-request state shared by middleware and the endpoint.
pub struct Context {
    conn: Arc<Connection>,
    attrs: AttributeMap,
}

impl Context {
    /// Context for a request arriving on `conn`.
    #[must_use]
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            attrs: AttributeMap::new(),
        }
    }

    /// Connection the request arrived on.
    #[must_use]
    pub fn conn(&self) -> &Arc<Connection> { &self.conn }

    /// Peer address, when the connection has one.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.conn.remote_addr() }

    /// Values middleware passes to later stages of this request.
    #[must_use]
    pub fn attrs(&self) -> &AttributeMap { &self.attrs }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("conn_id", &self.conn.id())
            .field("attrs", &self.attrs)
            .finish()
    }
}

/// Canonical request handler.
pub trait Endpoint: Send + Sync {
    /// Handle `req`.
    ///
    /// # Errors
    ///
    /// Any error; it is answered with [`Error::status_code`].
    fn call(&self, ctx: &mut Context, req: Request) -> Result<Response>;
}

/// Endpoint from a `(Context, Request) -> Result<Response>` closure.
#[derive(Clone, Copy)]
pub struct HandlerFn<F>(F);

/// Wrap `f` as an [`Endpoint`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&mut Context, Request) -> Result<Response> + Send + Sync,
{
    HandlerFn(f)
}

impl<F> Endpoint for HandlerFn<F>
where
    F: Fn(&mut Context, Request) -> Result<Response> + Send + Sync,
{
    fn call(&self, ctx: &mut Context, req: Request) -> Result<Response> { (self.0)(ctx, req) }
}

/// Endpoint that answers without looking at the request.
#[derive(Clone, Copy)]
pub struct Responder<F>(F);

/// Wrap `f`, which builds a response from the context alone.
pub fn responder<F>(f: F) -> Responder<F>
where
    F: Fn(&mut Context) -> Result<Response> + Send + Sync,
{
    Responder(f)
}

impl<F> Endpoint for Responder<F>
where
    F: Fn(&mut Context) -> Result<Response> + Send + Sync,
{
    fn call(&self, ctx: &mut Context, _req: Request) -> Result<Response> { (self.0)(ctx) }
}

/// Endpoint answering an empty `200` once the closure succeeds.
#[derive(Clone, Copy)]
pub struct Consumer<F>(F);

/// Wrap `f`, which consumes the request and produces no body.
pub fn consumer<F>(f: F) -> Consumer<F>
where
    F: Fn(&mut Context, Request) -> Result<()> + Send + Sync,
{
    Consumer(f)
}

impl<F> Endpoint for Consumer<F>
where
    F: Fn(&mut Context, Request) -> Result<()> + Send + Sync,
{
    fn call(&self, ctx: &mut Context, req: Request) -> Result<Response> {
        let resp = Response::for_request(&req);
        (self.0)(ctx, req)?;
        Ok(resp)
    }
}

/// Endpoint over typed messages.
pub struct Typed<In, Out, F> {
    f: F,
    _types: PhantomData<fn(In) -> Out>,
}

/// Wrap `f`, decoding its input from the request body and encoding its
/// output as the response body, both with the request's codec.
pub fn typed<In, Out, F>(f: F) -> Typed<In, Out, F>
where
    In: DeserializeOwned,
    Out: Serialize,
    F: Fn(&mut Context, In) -> Result<Out> + Send + Sync,
{
    Typed {
        f,
        _types: PhantomData,
    }
}

impl<In, Out, F> Endpoint for Typed<In, Out, F>
where
    In: DeserializeOwned,
    Out: Serialize,
    F: Fn(&mut Context, In) -> Result<Out> + Send + Sync,
{
    fn call(&self, ctx: &mut Context, mut req: Request) -> Result<Response> {
        let input: In = req.decode()?;
        let output = (self.f)(ctx, input)?;
        Response::for_request(&req).with_value(&output)
    }
}

impl Endpoint for Arc<dyn Endpoint> {
    fn call(&self, ctx: &mut Context, req: Request) -> Result<Response> { (**self).call(ctx, req) }
}

/// Wraps endpoint invocation.
pub trait Middleware: Send + Sync {
    /// Handle `req`, usually by calling `next.run` with it.
    ///
    /// # Errors
    ///
    /// Errors from later stages, or the middleware's own rejection.
    fn handle(&self, ctx: &mut Context, req: Request, next: Next<'_>) -> Result<Response>;
}

impl<F> Middleware for F
where
    F: Fn(&mut Context, Request, Next<'_>) -> Result<Response> + Send + Sync,
{
    fn handle(&self, ctx: &mut Context, req: Request, next: Next<'_>) -> Result<Response> { self(ctx, req, next) }
}

/// The remaining middleware and the endpoint after the current stage.
pub struct Next<'a> {
    outer: &'a [Arc<dyn Middleware>],
    inner: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    fn new(outer: &'a [Arc<dyn Middleware>], inner: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Endpoint) -> Self {
        Self { outer, inner, endpoint }
    }

    /// Run the rest of the pipeline.
    ///
    /// # Errors
    ///
    /// Whatever the next stage returns.
    pub fn run(self, ctx: &mut Context, req: Request) -> Result<Response> {
        if let Some((mw, outer)) = self.outer.split_first() {
            return mw.handle(ctx, req, Next::new(outer, self.inner, self.endpoint));
        }
        if let Some((mw, inner)) = self.inner.split_first() {
            return mw.handle(ctx, req, Next::new(&[], inner, self.endpoint));
        }
        self.endpoint.call(ctx, req)
    }
}

/// An endpoint and the middleware registered for it.
#[derive(Clone)]
pub struct Route {
    endpoint: Arc<dyn Endpoint>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Route {
    /// Route to `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Endpoint + 'static) -> Self {
        Self {
            endpoint: Arc::new(endpoint),
            middleware: Vec::new(),
        }
    }

    /// Add `mw` inside any middleware already registered.
    #[must_use]
    pub fn with(mut self, mw: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(mw));
        self
    }

    /// Run `req` through `global` middleware, then this route's middleware,
    /// then the endpoint.
    ///
    /// # Errors
    ///
    /// Whatever the pipeline returns.
    pub fn call(&self, global: &[Arc<dyn Middleware>], ctx: &mut Context, req: Request) -> Result<Response> {
        Next::new(global, &self.middleware, &*self.endpoint).run(ctx, req)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

struct RouteCallback {
    route: Arc<Route>,
    global: Arc<[Arc<dyn Middleware>]>,
}

impl RouteCallback {
    fn execute(&self, conn: &Arc<Connection>, packet: Packet) -> Option<Response> {
        let reply = Identifier::reply_to(&packet.ident);
        let stream_id = packet.stream_id;
        let req = Request::from_packet(packet);
        let oneway = req.is_oneway();
        let mut ctx = Context::new(Arc::clone(conn));
        let outcome = panic::catch(|| self.route.call(&self.global, &mut ctx, req));
        let mut resp = match outcome {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                tracing::debug!(conn_id = conn.id(), seq_id = reply.seq_id, error = %e, "handler failed");
                reply_with(&reply, stream_id).with_status(e.status_code(), e.to_string())
            }
            Err(panic) => {
                tracing::error!(conn_id = conn.id(), seq_id = reply.seq_id, panic = %panic, "handler panicked");
                reply_with(&reply, stream_id).with_status(500, "Internal Server Error")
            }
        };
        if oneway {
            return None;
        }
        let ident = resp.ident_mut();
        ident.seq_id = reply.seq_id;
        ident.version = reply.version;
        ident.is_request = false;
        resp.packet_mut().stream_id = stream_id;
        Some(resp)
    }
}

fn reply_with(reply: &Identifier, stream_id: u32) -> Response {
    let mut packet = Packet::new(reply.clone());
    packet.stream_id = stream_id;
    Response::from_packet(packet)
}

impl Callback for RouteCallback {
    fn on_packet(&self, conn: &Arc<Connection>, packet: Packet) {
        let Some(resp) = self.execute(conn, packet) else {
            return;
        };
        if let Err(e) = conn.send(resp.into_packet()) {
            tracing::warn!(conn_id = conn.id(), error = %e, "failed to send response");
        }
    }
}

struct Reject(RouterError);

impl Callback for Reject {
    fn on_packet(&self, conn: &Arc<Connection>, packet: Packet) {
        if packet.ident.oneway {
            return;
        }
        let status = Error::from(self.0.clone()).status_code();
        let resp = reply_with(&Identifier::reply_to(&packet.ident), packet.stream_id).with_status(status, self.0.to_string());
        if let Err(e) = conn.send(resp.into_packet()) {
            tracing::warn!(conn_id = conn.id(), error = %e, "failed to send rejection");
        }
    }
}

/// Routes and global middleware under construction.
#[derive(Default)]
pub struct Routes {
    router: Router<Arc<Route>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Routes {
    /// No routes.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register `route` under `key`.
    ///
    /// # Errors
    ///
    /// Returns the router's registration error.
    pub fn add(&mut self, key: RouteKey, route: Route) -> std::result::Result<(), RouterError> {
        self.router.insert(key, Arc::new(route))
    }

    /// Route used when nothing matches.
    pub fn set_no_route(&mut self, route: Route) { self.router.set_no_route(Arc::new(route)); }

    /// Add global middleware inside any already registered.
    pub fn wrap(&mut self, mw: impl Middleware + 'static) { self.middleware.push(Arc::new(mw)); }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize { self.router.len() }

    /// Whether no route is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.router.is_empty() }
}

impl fmt::Debug for Routes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routes")
            .field("routes", &self.router.len())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

/// Sends requests to routes and responses to waiting calls.
pub struct Dispatcher {
    router: Router<Arc<Route>>,
    middleware: Arc<[Arc<dyn Middleware>]>,
    caller: Option<Caller>,
}

impl Dispatcher {
    /// Dispatcher over `routes`, completing calls registered on `caller`.
    #[must_use]
    pub fn new(routes: Routes, caller: Option<Caller>) -> Self {
        Self {
            router: routes.router,
            middleware: routes.middleware.into(),
            caller,
        }
    }
}

impl Dispatch for Dispatcher {
    fn resolve(&self, conn: &Arc<Connection>, packet: &mut Packet) -> Option<Arc<dyn Callback>> {
        if !packet.ident.is_request {
            return self.caller.as_ref()?.resolve(packet);
        }
        match self.router.resolve(&packet.ident) {
            Ok(found) => {
                packet.ident.params = found.params;
                Some(Arc::new(RouteCallback {
                    route: found.value,
                    global: Arc::clone(&self.middleware),
                }))
            }
            Err(e) => {
                tracing::debug!(conn_id = conn.id(), seq_id = packet.ident.seq_id, error = %e, "request not routed");
                Some(Arc::new(Reject(e)))
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.router.len())
            .field("caller", &self.caller)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
