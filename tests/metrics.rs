#![cfg(feature = "metrics")]
//! Counters and gauges recorded by `kgnet`.
//!
//! Uses `metrics_util::debugging::DebuggingRecorder` scoped to the test
//! thread, so work under test runs on an inline executor.

use std::{sync::Arc, time::Duration};

use kgnet::{
    caller::{Caller, next_seq_id},
    config::WheelConfig,
    executor::Inline,
    metrics::{self, CALL_TIMEOUTS, CONNECTIONS_ACTIVE, Direction, FRAMES_PROCESSED},
    packet::Request,
    timer::{ManualClock, TimingWheel},
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use rstest::rstest;

fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

fn counter(snapshotter: &Snapshotter, name: &str, label: Option<(&str, &str)>) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(k, _, _, _)| {
            k.key().name() == name
                && label.is_none_or(|(key, value)| k.key().labels().any(|l| l.key() == key && l.value() == value))
        })
        .map(|(_, _, _, v)| match v {
            DebugValue::Counter(c) => c,
            _ => 0,
        })
        .sum()
}

#[rstest]
#[case(Direction::Inbound, "inbound")]
#[case(Direction::Outbound, "outbound")]
fn frame_counter_is_labelled_by_direction(#[case] direction: Direction, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    ::metrics::with_local_recorder(&recorder, || {
        metrics::inc_frames(direction);
        metrics::inc_frames(direction);
    });
    assert_eq!(counter(&snapshotter, FRAMES_PROCESSED, Some(("direction", label))), 2);
}

#[test]
fn connection_gauge_tracks_open_connections() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    ::metrics::with_local_recorder(&recorder, || {
        metrics::inc_connections();
        metrics::inc_connections();
        metrics::dec_connections();
    });
    let gauge = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find(|(k, _, _, _)| k.key().name() == CONNECTIONS_ACTIVE)
        .map(|(_, _, _, v)| v);
    assert!(matches!(gauge, Some(DebugValue::Gauge(g)) if (g.into_inner() - 1.0).abs() < f64::EPSILON));
}

#[test]
fn expired_calls_count_as_timeouts() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    let clock = Arc::new(ManualClock::new(0));
    let wheel = TimingWheel::with_clock(WheelConfig::default(), clock.clone(), Arc::new(Inline));
    let caller = Caller::new(wheel.clone());
    let mut req = Request::new("onPing");
    req.ident_mut().seq_id = next_seq_id();
    caller
        .register(&req, Box::new(|_| {}), Duration::from_millis(10), None)
        .expect("register");
    ::metrics::with_local_recorder(&recorder, || {
        clock.set(10);
        wheel.tick();
    });
    assert_eq!(counter(&snapshotter, CALL_TIMEOUTS, None), 1);
    assert!(caller.is_empty());
}
