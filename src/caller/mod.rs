//! Client-side request multiplexer.
//!
//! A [`Caller`] keeps one slot per outstanding request, keyed by sequence
//! ID. A response arriving through [`Caller::find`] and the slot's timeout
//! race for the slot; whichever removes it first completes the call, so a
//! callback runs exactly once.
//!
//! On timeout the slot's [`Retryer`] decides whether to try again. A retry
//! moves the slot to a fresh sequence ID, so a late answer to the previous
//! attempt finds nothing and is dropped.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use crate::{
    error::{Error, Result},
    metrics,
    packet::{Packet, Request, Response},
    processor::Callback,
    timer::{TimerId, TimingWheel},
    transport::Connection,
};

/// Status delivered when a call times out.
pub const STATUS_TIMEOUT: i32 = 408;
/// Status delivered when a retransmission cannot be sent.
pub const STATUS_BAD_GATEWAY: i32 = 502;

static SEQ_ID: AtomicU32 = AtomicU32::new(0);

/// Next process-wide sequence ID. Zero is never returned.
pub fn next_seq_id() -> u32 {
    loop {
        let id = SEQ_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id != 0 {
            return id;
        }
    }
}

/// Restart the sequence counter so the next ID is `last + 1`.
#[doc(hidden)]
pub fn reset_seq_ids(last: u32) { SEQ_ID.store(last, Ordering::Relaxed); }

/// Completion of a call.
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send>;

/// Decides whether a timed-out request is tried again.
pub trait RetryPolicy: Send + Sync {
    /// Whether retry number `attempt` (starting at 1) of `req` may run.
    fn allow(&self, req: &Request, attempt: u32) -> bool;
}

/// Allows up to `n` retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxAttempts(pub u32);

impl RetryPolicy for MaxAttempts {
    fn allow(&self, _req: &Request, attempt: u32) -> bool { attempt <= self.0 }
}

impl<F> RetryPolicy for F
where
    F: Fn(&Request, u32) -> bool + Send + Sync,
{
    fn allow(&self, req: &Request, attempt: u32) -> bool { self(req, attempt) }
}

/// Policy plus the means to resend.
pub trait Retryer: Send + Sync {
    /// Whether retry number `attempt` may run.
    fn allow(&self, req: &Request, attempt: u32) -> bool;

    /// Send `req` again under its new sequence ID.
    ///
    /// # Errors
    ///
    /// Any send failure; the call then completes with status 502.
    fn retransmit(&self, req: Request) -> Result<()>;
}

/// Resends on the connection that carried the first attempt.
pub struct ConnRetryer {
    conn: Weak<Connection>,
    policy: Arc<dyn RetryPolicy>,
}

impl ConnRetryer {
    /// Retryer resending on `conn` while `policy` allows.
    #[must_use]
    pub fn new(conn: &Arc<Connection>, policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            conn: Arc::downgrade(conn),
            policy,
        }
    }
}

impl Retryer for ConnRetryer {
    fn allow(&self, req: &Request, attempt: u32) -> bool { self.policy.allow(req, attempt) }

    fn retransmit(&self, req: Request) -> Result<()> {
        let conn = self.conn.upgrade().ok_or(Error::Closed)?;
        conn.send_request(req)
    }
}

struct Slot {
    callback: ResponseCallback,
    timer: Option<TimerId>,
    timeout: Duration,
    request: Option<Request>,
    retryer: Option<Arc<dyn Retryer>>,
    attempt: u32,
}

struct Inner {
    slots: Mutex<HashMap<u32, Slot>>,
    wheel: TimingWheel,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<u32, Slot>> { self.slots.lock().unwrap_or_else(PoisonError::into_inner) }

    fn arm(this: &Arc<Self>, seq_id: u32, timeout: Duration) -> Option<TimerId> {
        if timeout.is_zero() {
            return None;
        }
        let weak = Arc::downgrade(this);
        Some(this.wheel.new_delayer(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                Self::on_timeout(&inner, seq_id);
            }
        }))
    }

    fn on_timeout(this: &Arc<Self>, seq_id: u32) {
        let Some(mut slot) = this.slots().remove(&seq_id) else {
            return;
        };
        let attempt = slot.attempt + 1;
        let retry = match (&slot.retryer, &slot.request) {
            (Some(retryer), Some(req)) if retryer.allow(req, attempt) => Some(Arc::clone(retryer)),
            _ => None,
        };
        let Some(retryer) = retry else {
            tracing::debug!(seq_id, attempts = slot.attempt, "call timed out");
            metrics::inc_call_timeouts();
            let resp = timeout_response(slot.request.as_ref(), seq_id, STATUS_TIMEOUT, "Request Timeout");
            (slot.callback)(resp);
            return;
        };
        let new_seq = next_seq_id();
        let resend = slot.request.as_mut().and_then(|req| {
            req.ident_mut().seq_id = new_seq;
            req.try_clone()
        });
        slot.attempt = attempt;
        slot.timer = Self::arm(this, new_seq, slot.timeout);
        this.slots().insert(new_seq, slot);
        tracing::debug!(old_seq = seq_id, seq_id = new_seq, attempt, "retrying call");
        let sent = resend.map_or(Err(Error::NotSupport("request cannot be replayed")), |req| retryer.retransmit(req));
        if let Err(e) = sent {
            tracing::debug!(seq_id = new_seq, error = %e, "retransmission failed");
            let Some(slot) = this.slots().remove(&new_seq) else {
                return;
            };
            if let Some(timer) = slot.timer {
                this.wheel.stop(timer);
            }
            let resp = timeout_response(slot.request.as_ref(), new_seq, STATUS_BAD_GATEWAY, "Bad Gateway");
            (slot.callback)(resp);
        }
    }
}

fn timeout_response(req: Option<&Request>, seq_id: u32, code: i32, info: &str) -> Response {
    let mut resp = match req {
        Some(req) => Response::status_for(req, code, info),
        None => Response::default().with_status(code, info),
    };
    resp.ident_mut().seq_id = seq_id;
    resp
}

/// Outstanding-call registry.
#[derive(Clone)]
pub struct Caller {
    inner: Arc<Inner>,
}

impl Caller {
    /// Registry timing calls out on `wheel`.
    #[must_use]
    pub fn new(wheel: TimingWheel) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                wheel,
            }),
        }
    }

    /// Register a call for `req` under its sequence ID.
    ///
    /// A zero `timeout` never times out. Requests with stream or file bodies
    /// are never retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSeqId`] when the request's sequence ID is zero.
    pub fn register(
        &self,
        req: &Request,
        callback: ResponseCallback,
        timeout: Duration,
        retryer: Option<Arc<dyn Retryer>>,
    ) -> Result<()> {
        let seq_id = req.seq_id();
        if seq_id == 0 {
            return Err(Error::InvalidSeqId);
        }
        let request = if retryer.is_some() { req.try_clone() } else { None };
        let slot = Slot {
            callback,
            timer: Inner::arm(&self.inner, seq_id, timeout),
            timeout,
            request,
            retryer,
            attempt: 0,
        };
        if let Some(old) = self.inner.slots().insert(seq_id, slot)
            && let Some(timer) = old.timer
        {
            tracing::warn!(seq_id, "sequence id registered twice");
            self.inner.wheel.stop(timer);
        }
        Ok(())
    }

    /// Remove the call for `seq_id` without completing it.
    pub fn unregister(&self, seq_id: u32) -> bool { self.find(seq_id).is_some() }

    /// Take the callback waiting on `seq_id` and stop its timer.
    ///
    /// Returns `None` for unknown IDs, including calls that already timed
    /// out.
    #[must_use]
    pub fn find(&self, seq_id: u32) -> Option<ResponseCallback> {
        let slot = self.inner.slots().remove(&seq_id)?;
        if let Some(timer) = slot.timer {
            self.inner.wheel.stop(timer);
        }
        Some(slot.callback)
    }

    /// Callback adapter delivering the response for `packet`, if a call
    /// waits on it.
    #[must_use]
    pub fn resolve(&self, packet: &Packet) -> Option<Arc<dyn Callback>> {
        let seq_id = packet.ident.seq_id;
        match self.find(seq_id) {
            Some(callback) => Some(Arc::new(Reply(Mutex::new(Some(callback))))),
            None => {
                tracing::debug!(seq_id, "late or unknown response dropped");
                None
            }
        }
    }

    /// Outstanding calls.
    #[must_use]
    pub fn len(&self) -> usize { self.inner.slots().len() }

    /// Whether no call is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl fmt::Debug for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caller").field("outstanding", &self.len()).finish()
    }
}

struct Reply(Mutex<Option<ResponseCallback>>);

impl Callback for Reply {
    fn on_packet(&self, _conn: &Arc<Connection>, packet: Packet) {
        let callback = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(callback) = callback {
            callback(Response::from_packet(packet));
        }
    }
}

#[cfg(test)]
mod tests;
