//! Hierarchical timing wheel.
//!
//! Level `i` has `slots` buckets, each spanning `slots^i` ticks; a timer sits
//! on the lowest level whose higher-order tick bits match the current tick.
//! Advancing past a level boundary cascades the next bucket of the level
//! above into lower levels. Levels are appended when a timer lies beyond the
//! top level's span.
//!
//! Fired timers are posted to the wheel's executor as one batch and never
//! run on the ticking thread. Stopped timers are removed from the live index
//! and skipped when their bucket comes due.

mod clock;

use std::{
    fmt, io,
    sync::{
        Arc, Mutex, OnceLock, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::{
    config::WheelConfig,
    executor::{Executor, Pooled, Task},
};

/// Identifier returned when a timer is scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Raw numeric id.
    #[must_use]
    pub fn get(self) -> u64 { self.0 }
}

/// Lifecycle of a timer.
///
/// `Idle -> Timing -> Exec -> Stopping -> Idle`; tickers return from `Exec`
/// to `Timing` after each firing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerStatus {
    /// Not scheduled.
    Idle,
    /// Waiting in a bucket.
    Timing,
    /// Handed to the executor.
    Exec,
    /// Stopped while in `Exec`; the firing site finishes reclamation.
    Stopping,
}

type Callback = Box<dyn Fn() + Send + Sync>;

struct Timer {
    id: TimerId,
    expires: AtomicU64,
    interval: u64,
    callback: Callback,
    status: Mutex<TimerStatus>,
}

impl Timer {
    fn status(&self) -> std::sync::MutexGuard<'_, TimerStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct WheelState {
    levels: Vec<Vec<Vec<Arc<Timer>>>>,
    tick: u64,
}

struct Inner {
    state: Mutex<WheelState>,
    timers: DashMap<TimerId, Arc<Timer>>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn Executor>,
    precision_ms: u64,
    bits: u32,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

/// Handle to a timing wheel. Clones share the same wheel.
#[derive(Clone)]
pub struct TimingWheel {
    inner: Arc<Inner>,
}

static DEFAULT_WHEEL: OnceLock<TimingWheel> = OnceLock::new();

/// Process-wide wheel ticking on a monotonic clock, created on first use.
///
/// # Errors
///
/// Returns an error if the ticking thread cannot be started.
pub fn default_wheel() -> io::Result<TimingWheel> {
    if let Some(wheel) = DEFAULT_WHEEL.get() {
        return Ok(wheel.clone());
    }
    let workers = thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get);
    let wheel = TimingWheel::start(WheelConfig::default(), Arc::new(Pooled::new(workers)))?;
    // A racing initialiser may win; the losing wheel's thread exits once
    // its last handle drops.
    Ok(DEFAULT_WHEEL.get_or_init(|| wheel).clone())
}

impl TimingWheel {
    /// Create a wheel driven by `clock`. Nothing ticks until [`TimingWheel::tick`]
    /// is called.
    #[must_use]
    pub fn with_clock(
        config: WheelConfig,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let config = config.normalized();
        let bits = config.slots.trailing_zeros();
        let precision_ms = u64::try_from(config.precision.as_millis())
            .unwrap_or(1)
            .max(1);
        let tick = clock.now_ms() / precision_ms;
        let levels = (0..config.initial_wheels)
            .map(|_| empty_level(config.slots))
            .collect();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(WheelState { levels, tick }),
                timers: DashMap::new(),
                clock,
                executor,
                precision_ms,
                bits,
                next_id: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Create a wheel on a [`MonotonicClock`] and start a thread that ticks it
    /// once per precision period.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(config: WheelConfig, executor: Arc<dyn Executor>) -> io::Result<Self> {
        let precision = config.normalized().precision;
        let wheel = Self::with_clock(config, Arc::new(MonotonicClock::new()), executor);
        let weak: Weak<Inner> = Arc::downgrade(&wheel.inner);
        thread::Builder::new()
            .name("kgnet-wheel".into())
            .spawn(move || {
                loop {
                    thread::sleep(precision);
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    if inner.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    Inner::tick(&inner);
                }
                debug!("timing wheel thread exiting");
            })?;
        Ok(wheel)
    }

    /// Schedule `callback` at absolute clock time `expires_ms`.
    pub fn new_timer(&self, expires_ms: u64, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.schedule(expires_ms, 0, Box::new(callback))
    }

    /// Schedule `callback` after `delay`.
    pub fn new_delayer(&self, delay: Duration, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        let expires = self.now_ms().saturating_add(duration_ms(delay));
        self.schedule(expires, 0, Box::new(callback))
    }

    /// Schedule `callback` every `interval` until stopped.
    pub fn new_ticker(
        &self,
        interval: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> TimerId {
        let interval = duration_ms(interval).max(1);
        let expires = self.now_ms().saturating_add(interval);
        self.schedule(expires, interval, Box::new(callback))
    }

    fn schedule(&self, expires: u64, interval: u64, callback: Callback) -> TimerId {
        let id = TimerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let timer = Arc::new(Timer {
            id,
            expires: AtomicU64::new(expires),
            interval,
            callback,
            status: Mutex::new(TimerStatus::Timing),
        });
        self.inner.timers.insert(id, Arc::clone(&timer));
        Inner::arm(&self.inner, timer);
        id
    }

    /// Stop a timer.
    ///
    /// A timer waiting in a bucket is cancelled; a timer whose callback is
    /// running is marked [`TimerStatus::Stopping`] so it is not re-armed.
    /// Returns `false` if the id is unknown or already finished.
    pub fn stop(&self, id: TimerId) -> bool {
        let Some((_, timer)) = self.inner.timers.remove(&id) else {
            return false;
        };
        let mut status = timer.status();
        match *status {
            TimerStatus::Timing => {
                *status = TimerStatus::Idle;
                true
            }
            TimerStatus::Exec => {
                *status = TimerStatus::Stopping;
                true
            }
            TimerStatus::Idle | TimerStatus::Stopping => false,
        }
    }

    /// Status of a live timer.
    #[must_use]
    pub fn status(&self, id: TimerId) -> Option<TimerStatus> {
        self.inner.timers.get(&id).map(|t| *t.status())
    }

    /// Number of live timers.
    #[must_use]
    pub fn len(&self) -> usize { self.inner.timers.len() }

    /// Whether no timers are live.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.inner.timers.is_empty() }

    /// Number of wheel levels currently allocated.
    #[must_use]
    pub fn levels(&self) -> usize { self.inner.lock_state().levels.len() }

    /// Current time on the wheel's clock.
    #[must_use]
    pub fn now_ms(&self) -> u64 { self.inner.clock.now_ms() }

    /// Advance to the clock's current time, firing everything now due.
    pub fn tick(&self) { Inner::tick(&self.inner); }

    /// Stop the ticking thread. Live timers never fire afterwards.
    pub fn shutdown(&self) { self.inner.stopped.store(true, Ordering::Release); }
}

impl fmt::Debug for TimingWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimingWheel")
            .field("timers", &self.len())
            .field("precision_ms", &self.inner.precision_ms)
            .finish_non_exhaustive()
    }
}

fn empty_level(slots: usize) -> Vec<Vec<Arc<Timer>>> { (0..slots).map(|_| Vec::new()).collect() }

fn duration_ms(d: Duration) -> u64 { u64::try_from(d.as_millis()).unwrap_or(u64::MAX) }

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, WheelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slots(&self) -> usize { 1 << self.bits }

    fn mask(&self) -> u64 { (1_u64 << self.bits) - 1 }

    fn arm(this: &Arc<Self>, timer: Arc<Timer>) {
        let mut due = Vec::new();
        {
            let mut state = this.lock_state();
            this.place(&mut state, timer, &mut due);
        }
        Self::fire(this, due);
    }

    fn place(&self, state: &mut WheelState, timer: Arc<Timer>, due: &mut Vec<Arc<Timer>>) {
        let expires = timer.expires.load(Ordering::Acquire) / self.precision_ms;
        if expires <= state.tick {
            due.push(timer);
            return;
        }
        let mut level = 0_u32;
        loop {
            let shift = self.bits * (level + 1);
            if shift >= u64::BITS || expires >> shift == state.tick >> shift {
                break;
            }
            level += 1;
        }
        let level = level as usize;
        while state.levels.len() <= level {
            state.levels.push(empty_level(self.slots()));
            debug!(levels = state.levels.len(), "timing wheel grew");
        }
        let shift = self.bits * u32::try_from(level).unwrap_or(u32::MAX);
        let slot = usize::try_from(expires.checked_shr(shift).unwrap_or(0) & self.mask()).unwrap_or(0);
        state.levels[level][slot].push(timer);
    }

    fn step(&self, state: &mut WheelState, due: &mut Vec<Arc<Timer>>) {
        state.tick += 1;
        let tick = state.tick;
        let mut top = 0;
        for level in 1..state.levels.len() {
            let span_bits = self.bits * u32::try_from(level).unwrap_or(u32::MAX);
            let low = 1_u64.checked_shl(span_bits).map_or(u64::MAX, |span| span - 1);
            if tick & low != 0 {
                break;
            }
            top = level;
        }
        for level in (1..=top).rev() {
            let shift = self.bits * u32::try_from(level).unwrap_or(u32::MAX);
            let slot = usize::try_from(tick.checked_shr(shift).unwrap_or(0) & self.mask()).unwrap_or(0);
            let bucket = std::mem::take(&mut state.levels[level][slot]);
            for timer in bucket {
                self.place(state, timer, due);
            }
        }
        let slot = usize::try_from(tick & self.mask()).unwrap_or(0);
        due.append(&mut state.levels[0][slot]);
    }

    fn rebuild(&self, state: &mut WheelState, tick: u64, due: &mut Vec<Arc<Timer>>) {
        let drained: Vec<Arc<Timer>> = state
            .levels
            .iter_mut()
            .flat_map(|level| level.iter_mut().flat_map(std::mem::take))
            .collect();
        state.tick = tick;
        let mut kept = 0_usize;
        for timer in drained {
            if *timer.status() == TimerStatus::Timing {
                kept += 1;
                self.place(state, timer, due);
            }
        }
        warn!(tick, kept, "clock moved backwards; timing wheel rebuilt");
    }

    fn tick(this: &Arc<Self>) {
        let target = this.clock.now_ms() / this.precision_ms;
        let mut due = Vec::new();
        {
            let mut state = this.lock_state();
            if target < state.tick {
                this.rebuild(&mut state, target, &mut due);
            } else if this.timers.is_empty() {
                state.tick = target;
            } else {
                while state.tick < target {
                    this.step(&mut state, &mut due);
                }
            }
        }
        Self::fire(this, due);
    }

    fn fire(this: &Arc<Self>, due: Vec<Arc<Timer>>) {
        let batch: Vec<Arc<Timer>> = due
            .into_iter()
            .filter(|timer| {
                let mut status = timer.status();
                if *status == TimerStatus::Timing {
                    *status = TimerStatus::Exec;
                    true
                } else {
                    false
                }
            })
            .collect();
        if batch.is_empty() {
            return;
        }
        let inner = Arc::clone(this);
        let task = Task::new(move || {
            for timer in batch {
                Self::invoke(&inner, &timer);
            }
        });
        if let Err(e) = this.executor.post(task) {
            warn!(error = %e, "dropping fired timers");
        }
    }

    fn invoke(this: &Arc<Self>, timer: &Arc<Timer>) {
        if *timer.status() == TimerStatus::Exec {
            if let Err(panic) = crate::panic::catch(|| (timer.callback)()) {
                warn!(timer = timer.id.get(), panic = %panic, "timer callback panicked");
            }
        }
        let mut status = timer.status();
        if *status == TimerStatus::Exec && timer.interval > 0 && !this.stopped.load(Ordering::Acquire) {
            *status = TimerStatus::Timing;
            drop(status);
            let next = this.clock.now_ms().saturating_add(timer.interval);
            timer.expires.store(next, Ordering::Release);
            Self::arm(this, Arc::clone(timer));
            return;
        }
        *status = TimerStatus::Idle;
        drop(status);
        this.timers.remove(&timer.id);
    }
}
