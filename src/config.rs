//! Runtime configuration.
//!
//! Every struct has documented defaults, builder-style setters and a
//! `normalized()` clamp applied before use. All of them deserialize with
//! `serde`; durations are written as integer milliseconds.
//!
//! ```
//! use kgnet::config::RuntimeConfig;
//!
//! let cfg: RuntimeConfig = serde_json::from_str(
//!     r#"{"executor":{"kind":"hashed","workers":4},"wheel":{"precision":2}}"#,
//! )
//! .unwrap();
//! assert_eq!(cfg.wheel.precision.as_millis(), 2);
//! assert_eq!(cfg.buffer.chunk_size, 1024);
//! ```

use std::time::Duration;

use serde::Deserialize;

pub use crate::executor::ExecutorKind;

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Buffer growth settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bytes read from a socket at a time; each read lands in the
    /// connection buffer as one chunk. Default 1024.
    pub chunk_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::buffer::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Timing wheel shape.
///
/// # Default Values
/// - `precision`: 1 millisecond
/// - `slots`: 1024 per level
/// - `initial_wheels`: 3 levels (about 12 days at 1 ms)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WheelConfig {
    /// Length of one tick.
    #[serde(with = "millis")]
    pub precision: Duration,
    /// Buckets per level, rounded up to a power of two.
    pub slots: usize,
    /// Levels allocated up front.
    pub initial_wheels: usize,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            precision: Duration::from_millis(1),
            slots: 1024,
            initial_wheels: 3,
        }
    }
}

impl WheelConfig {
    /// Set the tick length.
    #[must_use]
    pub fn precision(mut self, precision: Duration) -> Self {
        self.precision = precision;
        self
    }

    /// Clamp to a tick of at least 1 ms, a power-of-two slot count of at
    /// least 4, and at least one level.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.precision = self.precision.max(Duration::from_millis(1));
        self.slots = self.slots.clamp(4, 1 << 16).next_power_of_two();
        self.initial_wheels = self.initial_wheels.max(1);
        self
    }
}

/// Exponential back-off for failed `accept()` calls.
///
/// # Default Values
/// - `initial_delay`: 10 milliseconds
/// - `max_delay`: 1 second
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Ceiling once delays have doubled.
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Clamp both delays to at least 1 ms and order them.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use kgnet::config::BackoffConfig;
    ///
    /// let cfg = BackoffConfig {
    ///     initial_delay: Duration::from_millis(5),
    ///     max_delay: Duration::ZERO,
    /// }
    /// .normalized();
    /// assert_eq!(cfg.initial_delay, Duration::from_millis(1));
    /// assert_eq!(cfg.max_delay, Duration::from_millis(5));
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }
}

/// Defaults substituted for zero-valued call options.
///
/// # Default Values
/// - `call_timeout`: 5 seconds
/// - `dial_timeout`: 3 seconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CallDefaults {
    /// Time allowed for a response.
    #[serde(with = "millis")]
    pub call_timeout: Duration,
    /// Time allowed for a blocking dial.
    #[serde(with = "millis")]
    pub dial_timeout: Duration,
}

impl Default for CallDefaults {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(3),
        }
    }
}

impl CallDefaults {
    /// `value`, or the default call timeout if it is zero.
    #[must_use]
    pub fn call_timeout_or_default(&self, value: Duration) -> Duration {
        if value.is_zero() { self.call_timeout } else { value }
    }

    /// `value`, or the default dial timeout if it is zero.
    #[must_use]
    pub fn dial_timeout_or_default(&self, value: Duration) -> Duration {
        if value.is_zero() { self.dial_timeout } else { value }
    }
}

/// Which transport drives sockets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportKind {
    /// A read task and a write task per connection on the tokio runtime.
    #[default]
    Task,
    /// Non-blocking sockets multiplexed over poller threads.
    Reactor {
        /// Worker pollers; zero means one per CPU.
        #[serde(default)]
        pollers: usize,
    },
}

/// Aggregate configuration consumed by the server and client builders.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Executor running callbacks.
    pub executor: ExecutorKind,
    /// Transport implementation.
    pub transport: TransportKind,
    /// Timing wheel shape.
    pub wheel: WheelConfig,
    /// Buffer growth.
    pub buffer: BufferConfig,
    /// Call defaults.
    pub calls: CallDefaults,
    /// Accept back-off.
    pub backoff: BackoffConfig,
}
