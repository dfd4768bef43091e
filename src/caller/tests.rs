//! Tests for call registration, timeouts and retries.

use std::sync::{Arc, Mutex};

use rstest::{fixture, rstest};
use serial_test::serial;

use super::*;
use crate::{config::WheelConfig, executor::Inline, timer::ManualClock};

const TIMEOUT: Duration = Duration::from_millis(50);

struct Harness {
    clock: Arc<ManualClock>,
    wheel: TimingWheel,
    caller: Caller,
}

impl Harness {
    fn at(&self, ms: u64) {
        self.clock.set(ms);
        self.wheel.tick();
    }
}

#[fixture]
fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(0));
    let wheel = TimingWheel::with_clock(WheelConfig::default(), clock.clone(), Arc::new(Inline));
    Harness {
        clock,
        caller: Caller::new(wheel.clone()),
        wheel,
    }
}

type Delivered = Arc<Mutex<Vec<Response>>>;

fn recorder() -> (Delivered, ResponseCallback) {
    let seen: Delivered = Arc::default();
    let sink = Arc::clone(&seen);
    (seen, Box::new(move |resp| sink.lock().expect("delivered lock").push(resp)))
}

fn request() -> Request {
    let mut req = Request::new("onPing").with_body("x");
    req.ident_mut().seq_id = next_seq_id();
    req
}

#[derive(Default)]
struct Recording {
    allowed: u32,
    fail: bool,
    sent: Mutex<Vec<u32>>,
}

impl Retryer for Recording {
    fn allow(&self, req: &Request, attempt: u32) -> bool { MaxAttempts(self.allowed).allow(req, attempt) }

    fn retransmit(&self, req: Request) -> Result<()> {
        if self.fail {
            return Err(Error::Closed);
        }
        self.sent.lock().expect("sent lock").push(req.seq_id());
        Ok(())
    }
}

#[rstest]
fn find_returns_registered_callback(harness: Harness) {
    let req = request();
    let (seen, callback) = recorder();
    harness.caller.register(&req, callback, TIMEOUT, None).expect("register");
    let callback = harness.caller.find(req.seq_id()).expect("registered");
    assert!(harness.caller.find(req.seq_id()).is_none(), "slot is removed");
    assert!(harness.wheel.is_empty(), "timer is stopped");
    callback(Response::for_request(&req));
    assert_eq!(seen.lock().expect("delivered lock").len(), 1);
}

#[rstest]
fn zero_sequence_id_is_rejected(harness: Harness) {
    let (_, callback) = recorder();
    let err = harness
        .caller
        .register(&Request::new("x"), callback, TIMEOUT, None)
        .expect_err("zero seq id");
    assert!(matches!(err, Error::InvalidSeqId));
    assert!(harness.caller.is_empty());
}

#[rstest]
fn timeout_delivers_408_once(harness: Harness) {
    let req = request();
    let (seen, callback) = recorder();
    harness.caller.register(&req, callback, TIMEOUT, None).expect("register");
    harness.at(49);
    assert!(seen.lock().expect("delivered lock").is_empty());
    harness.at(50);
    harness.at(200);
    let seen = seen.lock().expect("delivered lock");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status_code(), STATUS_TIMEOUT);
    assert_eq!(seen[0].seq_id(), req.seq_id());
    assert!(harness.caller.find(req.seq_id()).is_none(), "late responses find nothing");
}

#[rstest]
fn retry_rotates_sequence_id_then_times_out(harness: Harness) {
    let req = request();
    let retryer = Arc::new(Recording {
        allowed: 1,
        ..Recording::default()
    });
    let (seen, callback) = recorder();
    harness
        .caller
        .register(&req, callback, TIMEOUT, Some(retryer.clone()))
        .expect("register");

    harness.at(50);
    let sent = retryer.sent.lock().expect("sent lock").clone();
    assert_eq!(sent.len(), 1, "one retransmission");
    assert_ne!(sent[0], req.seq_id());
    assert!(harness.caller.find(req.seq_id()).is_none(), "old id is retired");
    assert_eq!(harness.caller.len(), 1);
    assert!(seen.lock().expect("delivered lock").is_empty());

    harness.at(100);
    let seen = seen.lock().expect("delivered lock");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status_code(), STATUS_TIMEOUT);
    assert_eq!(seen[0].seq_id(), sent[0]);
    assert!(harness.caller.is_empty());
}

#[rstest]
fn response_after_retry_completes_call(harness: Harness) {
    let req = request();
    let retryer = Arc::new(Recording {
        allowed: 3,
        ..Recording::default()
    });
    let (seen, callback) = recorder();
    harness
        .caller
        .register(&req, callback, TIMEOUT, Some(retryer.clone()))
        .expect("register");
    harness.at(50);
    let new_seq = retryer.sent.lock().expect("sent lock")[0];
    let callback = harness.caller.find(new_seq).expect("rotated slot");
    callback(Response::for_request(&req));
    harness.at(500);
    assert_eq!(seen.lock().expect("delivered lock").len(), 1);
    assert_eq!(retryer.sent.lock().expect("sent lock").len(), 1);
}

#[rstest]
fn failed_retransmission_completes_with_502(harness: Harness) {
    let req = request();
    let retryer = Arc::new(Recording {
        allowed: 1,
        fail: true,
        ..Recording::default()
    });
    let (seen, callback) = recorder();
    harness
        .caller
        .register(&req, callback, TIMEOUT, Some(retryer))
        .expect("register");
    harness.at(50);
    let seen = seen.lock().expect("delivered lock");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status_code(), STATUS_BAD_GATEWAY);
    assert!(harness.caller.is_empty());
    assert!(harness.wheel.is_empty());
}

#[rstest]
fn zero_timeout_never_expires(harness: Harness) {
    let req = request();
    let (seen, callback) = recorder();
    harness
        .caller
        .register(&req, callback, Duration::ZERO, None)
        .expect("register");
    harness.at(60_000);
    assert!(seen.lock().expect("delivered lock").is_empty());
    assert!(harness.caller.unregister(req.seq_id()));
}

#[rstest]
fn resolve_wraps_callback_for_processor(harness: Harness) {
    let req = request();
    let (seen, callback) = recorder();
    harness.caller.register(&req, callback, TIMEOUT, None).expect("register");
    let packet = Response::for_request(&req).with_body("pong").into_packet();
    let reply = harness.caller.resolve(&packet).expect("waiting call");
    let conn = Connection::new(true, crate::filter::FilterChain::default(), None);
    reply.on_packet(&conn, packet);
    let seen = seen.lock().expect("delivered lock");
    assert_eq!(seen[0].seq_id(), req.seq_id());
    assert!(harness.caller.resolve(&Response::for_request(&req).into_packet()).is_none());
}

#[test]
#[serial]
fn sequence_ids_skip_zero_on_wrap() {
    reset_seq_ids(u32::MAX - 1);
    let ids = [next_seq_id(), next_seq_id(), next_seq_id()];
    assert!(!ids.contains(&0));
}

#[test]
fn max_attempts_counts_retries() {
    let req = Request::new("x");
    assert!(MaxAttempts(2).allow(&req, 1));
    assert!(MaxAttempts(2).allow(&req, 2));
    assert!(!MaxAttempts(2).allow(&req, 3));
    assert!(!MaxAttempts(0).allow(&req, 1));
}

#[rstest]
#[tracing_test::traced_test]
fn retries_and_timeouts_are_logged(harness: Harness) {
    let req = request();
    let retryer = Arc::new(Recording {
        allowed: 1,
        ..Recording::default()
    });
    let (_, callback) = recorder();
    harness
        .caller
        .register(&req, callback, TIMEOUT, Some(retryer))
        .expect("register");
    harness.at(50);
    assert!(logs_contain("retrying call"));
    harness.at(100);
    assert!(logs_contain("call timed out"));
}
