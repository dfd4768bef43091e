//! Tests for handler adapters, middleware and dispatch.

use std::sync::{Arc, Mutex};

use rstest::{fixture, rstest};
use serde::{Deserialize, Serialize};

use super::*;
use crate::{
    filter::{Filter, FilterChain, FilterContext, Payload},
    packet::{CodecType, Method},
};

#[derive(Default)]
struct Capture {
    sent: Mutex<Vec<Packet>>,
}

impl Filter for Capture {
    fn name(&self) -> &str { "capture" }

    fn handle_write(&self, ctx: &mut FilterContext) -> Result<()> {
        if let Payload::Packet(packet) = ctx.take_payload() {
            self.sent.lock().expect("capture lock").push(packet);
        }
        ctx.abort();
        Ok(())
    }
}

struct Peer {
    capture: Arc<Capture>,
    conn: Arc<Connection>,
}

impl Peer {
    fn sent(&self) -> Vec<Response> {
        std::mem::take(&mut *self.capture.sent.lock().expect("capture lock"))
            .into_iter()
            .map(Response::from_packet)
            .collect()
    }

    fn deliver(&self, dispatcher: &Dispatcher, mut packet: Packet) {
        let callback = dispatcher.resolve(&self.conn, &mut packet).expect("callback");
        callback.on_packet(&self.conn, packet);
    }
}

#[fixture]
fn peer() -> Peer {
    let capture = Arc::new(Capture::default());
    let conn = Connection::new(false, FilterChain::new(vec![capture.clone() as Arc<dyn Filter>]), None);
    Peer { capture, conn }
}

fn call(seq_id: u32, uri: &str) -> Packet {
    let mut req = Request::new(uri);
    req.ident_mut().seq_id = seq_id;
    req.into_packet()
}

fn dispatcher(routes: Vec<(RouteKey, Route)>) -> Dispatcher {
    let mut table = Routes::new();
    for (key, route) in routes {
        table.add(key, route).expect("register");
    }
    Dispatcher::new(table, None)
}

fn ok(body: &'static str) -> Route {
    Route::new(handler_fn(move |_ctx, req| Ok(Response::for_request(&req).with_body(body))))
}

#[rstest]
fn response_echoes_sequence_and_stream(peer: Peer) {
    let dispatcher = dispatcher(vec![(RouteKey::service("", "onPing"), ok("pong"))]);
    let mut packet = call(41, "onPing");
    packet.stream_id = 6;
    peer.deliver(&dispatcher, packet);
    let mut sent = peer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq_id(), 41);
    assert_eq!(sent[0].packet().stream_id, 6);
    assert!(!sent[0].ident().is_request);
    assert_eq!(sent[0].body_mut().read_all().expect("body").bytes(), b"pong");
}

#[rstest]
fn unknown_route_is_answered_with_404(peer: Peer) {
    let dispatcher = dispatcher(Vec::new());
    peer.deliver(&dispatcher, call(3, "missing"));
    let sent = peer.sent();
    assert_eq!(sent[0].status_code(), 404);
    assert_eq!(sent[0].seq_id(), 3);
}

#[rstest]
fn handler_error_maps_to_status(peer: Peer) {
    let route = Route::new(handler_fn(|_ctx, _req| Err(Error::status(403, "forbidden"))));
    let dispatcher = dispatcher(vec![(RouteKey::service("", "secret"), route)]);
    peer.deliver(&dispatcher, call(5, "secret"));
    assert_eq!(peer.sent()[0].status_code(), 403);
}

#[rstest]
fn handler_panic_answers_500(peer: Peer) {
    let route = Route::new(handler_fn(|_ctx, _req| -> Result<Response> { panic!("handler exploded") }));
    let dispatcher = dispatcher(vec![(RouteKey::service("", "boom"), route)]);
    peer.deliver(&dispatcher, call(9, "boom"));
    let sent = peer.sent();
    assert_eq!(sent[0].status_code(), 500);
    assert_eq!(sent[0].seq_id(), 9);
}

#[rstest]
fn oneway_requests_get_no_response(peer: Peer) {
    let dispatcher = dispatcher(vec![(RouteKey::service("", "log"), ok("ignored"))]);
    let mut req = Request::new("log").oneway();
    req.ident_mut().seq_id = 2;
    peer.deliver(&dispatcher, req.into_packet());
    let mut missing = Request::new("nowhere").oneway();
    missing.ident_mut().seq_id = 4;
    peer.deliver(&dispatcher, missing.into_packet());
    assert!(peer.sent().is_empty());
}

#[rstest]
fn path_parameters_reach_the_handler(peer: Peer) {
    let route = Route::new(handler_fn(|_ctx, req| {
        let x = req.params().get("x").unwrap_or_default().to_owned();
        Ok(Response::for_request(&req).with_body(x.as_str()))
    }));
    let dispatcher = dispatcher(vec![(RouteKey::path(Method::Get, "/a/:x"), route)]);
    let mut req = Request::http(Method::Get, "/a/b");
    req.ident_mut().seq_id = 1;
    peer.deliver(&dispatcher, req.into_packet());
    let mut sent = peer.sent();
    assert_eq!(sent[0].body_mut().read_all().expect("body").bytes(), b"b");
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
struct Text {
    text: String,
}

#[rstest]
fn typed_endpoint_round_trips_json(peer: Peer) {
    let route = Route::new(typed(|_ctx, msg: Text| {
        Ok(Text {
            text: format!("pong:{}", msg.text),
        })
    }));
    let dispatcher = dispatcher(vec![(RouteKey::service("", "onPing"), route)]);
    let mut req = Request::new("onPing")
        .with_value(CodecType::Json, &Text { text: "x".into() })
        .expect("encode");
    req.ident_mut().seq_id = 8;
    peer.deliver(&dispatcher, req.into_packet());
    let mut sent = peer.sent();
    assert_eq!(sent[0].codec(), CodecType::Json);
    let reply: Text = sent[0].decode().expect("decode");
    assert_eq!(reply.text, "pong:x");
}

#[rstest]
fn typed_endpoint_rejects_bad_payload_with_400(peer: Peer) {
    let route = Route::new(typed(|_ctx, msg: Text| Ok(msg)));
    let dispatcher = dispatcher(vec![(RouteKey::service("", "onPing"), route)]);
    let mut req = Request::new("onPing").with_codec(CodecType::Json).with_body("not json");
    req.ident_mut().seq_id = 8;
    peer.deliver(&dispatcher, req.into_packet());
    assert_eq!(peer.sent()[0].status_code(), 400);
}

#[rstest]
fn responder_and_consumer_shapes(peer: Peer) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let dispatcher = dispatcher(vec![
        (
            RouteKey::service("", "hello"),
            Route::new(responder(|_ctx| Ok(Response::default().with_body("hi")))),
        ),
        (
            RouteKey::service("", "store"),
            Route::new(consumer(move |_ctx, req| {
                log.lock().expect("seen lock").push(req.uri().to_owned());
                Ok(())
            })),
        ),
    ]);
    peer.deliver(&dispatcher, call(1, "hello"));
    peer.deliver(&dispatcher, call(2, "store"));
    let mut sent = peer.sent();
    assert_eq!(sent[0].seq_id(), 1, "seq id is fixed up for responders");
    assert_eq!(sent[0].body_mut().read_all().expect("body").bytes(), b"hi");
    assert_eq!(sent[1].seq_id(), 2);
    assert_eq!(sent[1].status_code(), 200);
    assert_eq!(*seen.lock().expect("seen lock"), ["store"]);
}

type Order = Arc<Mutex<Vec<&'static str>>>;

struct Tracer(&'static str, Order);

impl Middleware for Tracer {
    fn handle(&self, ctx: &mut Context, req: Request, next: Next<'_>) -> Result<Response> {
        self.1.lock().expect("order lock").push(self.0);
        next.run(ctx, req)
    }
}

struct Deny;

impl Middleware for Deny {
    fn handle(&self, _ctx: &mut Context, req: Request, _next: Next<'_>) -> Result<Response> {
        Ok(Response::for_request(&req).with_status(401, "Unauthorized"))
    }
}

#[rstest]
fn middleware_runs_global_then_route_outermost_first(peer: Peer) {
    let order = Order::default();
    let route = Route::new(handler_fn({
        let order = Arc::clone(&order);
        move |_ctx, req| {
            order.lock().expect("order lock").push("endpoint");
            Ok(Response::for_request(&req))
        }
    }))
    .with(Tracer("route-outer", Arc::clone(&order)))
    .with(Tracer("route-inner", Arc::clone(&order)));
    let mut routes = Routes::new();
    routes.add(RouteKey::service("", "m"), route).expect("register");
    routes.wrap(Tracer("global", Arc::clone(&order)));
    let dispatcher = Dispatcher::new(routes, None);
    peer.deliver(&dispatcher, call(1, "m"));
    assert_eq!(
        *order.lock().expect("order lock"),
        ["global", "route-outer", "route-inner", "endpoint"]
    );
}

#[rstest]
fn middleware_can_short_circuit(peer: Peer) {
    let dispatcher = dispatcher(vec![(RouteKey::service("", "m"), ok("secret").with(Deny))]);
    peer.deliver(&dispatcher, call(1, "m"));
    assert_eq!(peer.sent()[0].status_code(), 401);
}

#[rstest]
fn responses_complete_waiting_calls(peer: Peer) {
    let clock = Arc::new(crate::timer::ManualClock::new(0));
    let wheel = crate::timer::TimingWheel::with_clock(
        crate::config::WheelConfig::default(),
        clock,
        Arc::new(crate::executor::Inline),
    );
    let caller = Caller::new(wheel);
    let mut req = Request::new("onPing");
    req.ident_mut().seq_id = 77;
    let got = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&got);
    caller
        .register(
            &req,
            Box::new(move |resp| *slot.lock().expect("slot lock") = Some(resp.seq_id())),
            std::time::Duration::from_secs(1),
            None,
        )
        .expect("register");
    let dispatcher = Dispatcher::new(Routes::new(), Some(caller.clone()));
    peer.deliver(&dispatcher, Response::for_request(&req).into_packet());
    assert_eq!(*got.lock().expect("slot lock"), Some(77));
    assert!(caller.is_empty());

    let mut late = Response::for_request(&req).into_packet();
    assert!(dispatcher.resolve(&peer.conn, &mut late).is_none(), "late responses are dropped");
}
