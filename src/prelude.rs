//! Optional convenience imports for common `kgnet` workflows.
//!
//! Kept small; specialised APIs live in their owning modules.
//!
//! # Examples
//!
//! ```rust,no_run
//! use kgnet::prelude::*;
//!
//! fn build() -> std::result::Result<Server, ServerError> {
//!     Server::builder()
//!         .handle(
//!             RouteKey::path(Method::Get, "/hello"),
//!             handler_fn(|_ctx, req| Ok(Response::for_request(&req).with_body("hi"))),
//!         )?
//!         .build()
//! }
//! ```

pub use crate::{
    client::{CallOptions, Client, ClientError},
    config::RuntimeConfig,
    error::{Error, Result},
    handler::{Context, Endpoint, Middleware, Next, Route, consumer, handler_fn, responder, typed},
    packet::{CodecType, Method, Request, Response},
    router::RouteKey,
    server::{Server, ServerError},
};
