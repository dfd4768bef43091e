//! Metric helpers for `kgnet`.
//!
//! Thin wrappers over the [`metrics`](https://docs.rs/metrics) facade. With
//! the `metrics` feature disabled every helper is a no-op.

/// Gauge tracking open connections.
pub const CONNECTIONS_ACTIVE: &str = "kgnet_connections_active";
/// Counter of frames passed through a codec.
pub const FRAMES_PROCESSED: &str = "kgnet_frames_processed_total";
/// Counter of errors surfaced by the filter chain or executors.
pub const ERRORS_TOTAL: &str = "kgnet_errors_total";
/// Counter of calls completed by a local timeout.
pub const CALL_TIMEOUTS: &str = "kgnet_call_timeouts_total";

/// Direction of a frame relative to this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Decoded from the socket.
    Inbound,
    /// Encoded for the socket.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

#[cfg(feature = "metrics")]
mod imp {
    use metrics::{counter, gauge};

    use super::{CALL_TIMEOUTS, CONNECTIONS_ACTIVE, Direction, ERRORS_TOTAL, FRAMES_PROCESSED};

    pub fn inc_connections() { gauge!(CONNECTIONS_ACTIVE).increment(1.0); }

    pub fn dec_connections() { gauge!(CONNECTIONS_ACTIVE).decrement(1.0); }

    pub fn inc_frames(direction: Direction) {
        counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(1);
    }

    pub fn inc_errors() { counter!(ERRORS_TOTAL).increment(1); }

    pub fn inc_call_timeouts() { counter!(CALL_TIMEOUTS).increment(1); }
}

#[cfg(not(feature = "metrics"))]
mod imp {
    use super::Direction;

    pub fn inc_connections() {}

    pub fn dec_connections() {}

    pub fn inc_frames(_direction: Direction) {}

    pub fn inc_errors() {}

    pub fn inc_call_timeouts() {}
}

/// Increment the active connections gauge.
pub fn inc_connections() { imp::inc_connections(); }

/// Decrement the active connections gauge.
pub fn dec_connections() { imp::dec_connections(); }

/// Record a processed frame.
pub fn inc_frames(direction: Direction) { imp::inc_frames(direction); }

/// Record an error occurrence.
pub fn inc_errors() { imp::inc_errors(); }

/// Record a call that ended in a local timeout.
pub fn inc_call_timeouts() { imp::inc_call_timeouts(); }
