//! Ordered pipeline of hooks over connection events.
//!
//! A [`FilterChain`] is shared by every connection of a transport. Each
//! event creates a [`FilterContext`] that walks the chain: open, close, read
//! and error events run front to back, write events run back to front. A
//! hook that returns without steering the context lets the chain advance to
//! the next filter. Hooks may instead:
//!
//! - call [`FilterContext::next`] or [`FilterContext::fire_next`] to run the
//!   rest of the chain before continuing their own work;
//! - call [`FilterContext::abort`] to stop propagation;
//! - call [`FilterContext::jump`] or [`FilterContext::jump_by`] to continue
//!   at another filter;
//! - call [`FilterContext::detach`] to take the rest of the traversal to
//!   another thread and finish it later with [`FilterContext::resume`].
//!
//! When a write traversal finishes holding [`Payload::Bytes`], the bytes
//! are queued on the connection.
//!
//! A hook error stops the traversal and runs `handle_error` from the
//! failing filter back to the front of the chain. Errors raised while
//! handling an error are logged and dropped.

use std::{fmt, mem, sync::Arc};

use crate::{
    attr::AttributeMap,
    buffer::Buffer,
    codec::Frame,
    error::{Error, Result},
    metrics,
    packet::Packet,
    transport::Connection,
};

/// Connection event driving a traversal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The connection opened.
    Open,
    /// The connection closed.
    Close,
    /// Bytes or end-of-stream arrived.
    Read,
    /// An outbound message is on its way to the socket.
    Write,
    /// An error surfaced from the transport.
    Error,
}

impl Event {
    fn is_backward(self) -> bool { self == Self::Write }
}

/// Value carried through a traversal.
#[derive(Debug, Default)]
pub enum Payload {
    /// Nothing.
    #[default]
    None,
    /// Raw bytes: socket input on reads, encoded output on writes.
    Bytes(Buffer),
    /// The peer closed its side of the connection.
    Eof,
    /// A decoded or to-be-encoded frame.
    Frame(Frame),
    /// A whole outbound message.
    Packet(Packet),
}

/// Hooks over connection events. Every hook defaults to passing through.
pub trait Filter: Send + Sync {
    /// Name used by [`FilterContext::jump_by`].
    fn name(&self) -> &str;

    /// Connection opened.
    ///
    /// # Errors
    ///
    /// An error runs the error hooks.
    fn handle_open(&self, _ctx: &mut FilterContext) -> Result<()> { Ok(()) }

    /// Connection closed.
    ///
    /// # Errors
    ///
    /// An error runs the error hooks.
    fn handle_close(&self, _ctx: &mut FilterContext) -> Result<()> { Ok(()) }

    /// Inbound payload.
    ///
    /// # Errors
    ///
    /// An error runs the error hooks.
    fn handle_read(&self, _ctx: &mut FilterContext) -> Result<()> { Ok(()) }

    /// Outbound payload.
    ///
    /// # Errors
    ///
    /// An error runs the error hooks.
    fn handle_write(&self, _ctx: &mut FilterContext) -> Result<()> { Ok(()) }

    /// An error is in [`FilterContext::error`].
    ///
    /// # Errors
    ///
    /// Errors from this hook are logged and dropped.
    fn handle_error(&self, _ctx: &mut FilterContext) -> Result<()> { Ok(()) }
}

/// Immutable, cheaply cloned list of filters.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Arc<[Arc<dyn Filter>]>,
}

impl FilterChain {
    /// Chain running `filters` in order.
    #[must_use]
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self {
            filters: filters.into(),
        }
    }

    /// Number of filters.
    #[must_use]
    pub fn len(&self) -> usize { self.filters.len() }

    /// Whether the chain has no filters.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.filters.is_empty() }

    /// Index of the filter named `name`.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> { self.filters.iter().position(|f| f.name() == name) }

    /// Filter names in chain order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> { self.filters.iter().map(|f| f.name()).collect() }

    /// Run `event` with `payload` over `conn`.
    ///
    /// # Errors
    ///
    /// Returns the hook error if no error hook took it with
    /// [`FilterContext::take_error`].
    pub fn fire(&self, conn: &Arc<Connection>, event: Event, payload: Payload) -> Result<()> {
        let mut ctx = FilterContext::new(Arc::clone(conn), self.clone(), event, payload);
        ctx.start()
    }

    /// Run the open hooks.
    pub fn fire_open(&self, conn: &Arc<Connection>) { self.fire_logged(conn, Event::Open, Payload::None); }

    /// Run the close hooks.
    pub fn fire_close(&self, conn: &Arc<Connection>) { self.fire_logged(conn, Event::Close, Payload::None); }

    /// Run the read hooks over inbound bytes or end-of-stream.
    pub fn fire_read(&self, conn: &Arc<Connection>, payload: Payload) { self.fire_logged(conn, Event::Read, payload); }

    /// Run the write hooks over an outbound payload.
    ///
    /// # Errors
    ///
    /// Returns hook errors not taken by an error hook.
    pub fn fire_write(&self, conn: &Arc<Connection>, payload: Payload) -> Result<()> {
        self.fire(conn, Event::Write, payload)
    }

    /// Deliver a transport error to every filter, front to back.
    pub fn fire_error(&self, conn: &Arc<Connection>, err: Error) {
        let mut ctx = FilterContext::new(Arc::clone(conn), self.clone(), Event::Error, Payload::None);
        ctx.error = Some(err);
        ctx.run_error_hooks(0..self.len());
        if let Some(err) = ctx.error.take() {
            tracing::debug!(conn_id = conn.id(), error = %err, "transport error");
        }
    }

    fn fire_logged(&self, conn: &Arc<Connection>, event: Event, payload: Payload) {
        if let Err(e) = self.fire(conn, event, payload) {
            tracing::warn!(conn_id = conn.id(), ?event, error = %e, "filter error");
        }
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_list().entries(self.names()).finish() }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Auto,
    Handled,
    Abort,
    Jump(usize),
}

/// State of one traversal.
pub struct FilterContext {
    conn: Arc<Connection>,
    chain: FilterChain,
    event: Event,
    payload: Payload,
    error: Option<Error>,
    attrs: AttributeMap,
    step: usize,
    control: Control,
    failed_at: Option<usize>,
}

impl FilterContext {
    fn new(conn: Arc<Connection>, chain: FilterChain, event: Event, payload: Payload) -> Self {
        Self {
            conn,
            chain,
            event,
            payload,
            error: None,
            attrs: AttributeMap::new(),
            step: 0,
            control: Control::Auto,
            failed_at: None,
        }
    }

    /// Connection the event belongs to.
    #[must_use]
    pub fn conn(&self) -> &Arc<Connection> { &self.conn }

    /// Event being delivered.
    #[must_use]
    pub fn event(&self) -> Event { self.event }

    /// Current payload.
    #[must_use]
    pub fn payload(&self) -> &Payload { &self.payload }

    /// Mutable payload.
    pub fn payload_mut(&mut self) -> &mut Payload { &mut self.payload }

    /// Take the payload, leaving [`Payload::None`].
    pub fn take_payload(&mut self) -> Payload { mem::take(&mut self.payload) }

    /// Replace the payload.
    pub fn set_payload(&mut self, payload: Payload) { self.payload = payload; }

    /// Error being handled, during `handle_error`.
    #[must_use]
    pub fn error(&self) -> Option<&Error> { self.error.as_ref() }

    /// Claim the error so it is not reported further.
    pub fn take_error(&mut self) -> Option<Error> { self.error.take() }

    /// Attributes scoped to this traversal.
    #[must_use]
    pub fn attrs(&self) -> &AttributeMap { &self.attrs }

    /// Chain index of the filter currently running.
    #[must_use]
    pub fn index(&self) -> usize { self.index_at(self.step) }

    fn index_at(&self, step: usize) -> usize {
        if self.event.is_backward() {
            self.chain.len().saturating_sub(step + 1)
        } else {
            step
        }
    }

    fn step_of(&self, index: usize) -> usize {
        if self.event.is_backward() {
            self.chain.len().saturating_sub(index + 1)
        } else {
            index
        }
    }

    /// Run the rest of the chain now. The chain does not advance again when
    /// the calling hook returns.
    ///
    /// # Errors
    ///
    /// Returns the first hook error from the rest of the chain.
    pub fn next(&mut self) -> Result<()> {
        let step = self.step;
        let result = self.run(step + 1);
        self.step = step;
        self.control = Control::Handled;
        result
    }

    /// Replace the payload and run the rest of the chain. May be called
    /// repeatedly, once per produced payload.
    ///
    /// # Errors
    ///
    /// Returns the first hook error from the rest of the chain.
    pub fn fire_next(&mut self, payload: Payload) -> Result<()> {
        self.payload = payload;
        self.next()
    }

    /// Stop propagation after the current hook.
    pub fn abort(&mut self) { self.control = Control::Abort; }

    /// Continue at chain index `index` after the current hook.
    pub fn jump(&mut self, index: usize) {
        if index < self.chain.len() {
            self.control = Control::Jump(self.step_of(index));
        } else {
            self.control = Control::Abort;
        }
    }

    /// Continue at the filter named `name`; returns `false` if absent.
    pub fn jump_by(&mut self, name: &str) -> bool {
        match self.chain.position(name) {
            Some(index) => {
                self.jump(index);
                true
            }
            None => false,
        }
    }

    /// Move the rest of the traversal into a new context.
    ///
    /// The current traversal stops after this hook. The returned context
    /// owns the payload and continues after the current filter when
    /// [`resume`](Self::resume) is called, on any thread.
    #[must_use]
    pub fn detach(&mut self) -> Self {
        self.control = Control::Abort;
        Self {
            conn: Arc::clone(&self.conn),
            chain: self.chain.clone(),
            event: self.event,
            payload: self.take_payload(),
            error: None,
            attrs: AttributeMap::new(),
            step: self.step,
            control: Control::Handled,
            failed_at: None,
        }
    }

    /// Continue a detached traversal after the filter that detached it.
    ///
    /// # Errors
    ///
    /// Returns hook errors not taken by an error hook.
    pub fn resume(mut self) -> Result<()> {
        let step = self.step + 1;
        self.drive(step)
    }

    fn start(&mut self) -> Result<()> { self.drive(0) }

    fn drive(&mut self, step: usize) -> Result<()> {
        let Err(err) = self.run(step) else {
            return Ok(());
        };
        let fatal = err.is_fatal() && self.event != Event::Write;
        tracing::debug!(conn_id = self.conn.id(), event = ?self.event, error = %err, "filter hook failed");
        metrics::inc_errors();
        let failed = self.failed_at.unwrap_or_else(|| self.index());
        self.error = Some(err);
        let event = self.event;
        self.event = Event::Error;
        self.run_error_hooks((0..=failed).rev());
        self.event = event;
        let err = self.error.take();
        if fatal {
            if let Some(err) = &err {
                tracing::warn!(conn_id = self.conn.id(), error = %err, "closing connection");
            }
            self.conn.close_with_error();
        }
        err.map_or(Ok(()), Err)
    }

    fn run_error_hooks(&mut self, indexes: impl Iterator<Item = usize>) {
        let len = self.chain.len();
        for index in indexes.filter(|&i| i < len) {
            self.step = index;
            self.control = Control::Auto;
            let filter = Arc::clone(&self.chain.filters[index]);
            if let Err(e) = filter.handle_error(self) {
                tracing::debug!(conn_id = self.conn.id(), filter = filter.name(), error = %e, "error hook failed");
            }
            if matches!(self.control, Control::Abort | Control::Handled) {
                break;
            }
        }
    }

    fn run(&mut self, mut step: usize) -> Result<()> {
        while step < self.chain.len() {
            self.step = step;
            self.control = Control::Auto;
            let filter = Arc::clone(&self.chain.filters[self.index_at(step)]);
            let result = match self.event {
                Event::Open => filter.handle_open(self),
                Event::Close => filter.handle_close(self),
                Event::Read => filter.handle_read(self),
                Event::Write => filter.handle_write(self),
                Event::Error => filter.handle_error(self),
            };
            if let Err(e) = result {
                self.failed_at.get_or_insert(self.index_at(step));
                return Err(e);
            }
            match self.control {
                Control::Auto => step += 1,
                Control::Handled | Control::Abort => return Ok(()),
                Control::Jump(target) => step = target,
            }
        }
        if self.event == Event::Write
            && let Payload::Bytes(buf) = self.take_payload()
        {
            self.conn.enqueue(buf)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FilterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterContext")
            .field("conn_id", &self.conn.id())
            .field("event", &self.event)
            .field("index", &self.index())
            .finish_non_exhaustive()
    }
}
