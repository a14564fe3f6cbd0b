//! Periodic callback sources.
//!
//! A [`Clock`] knows nothing about beats or tempo: it fires registered
//! callbacks at fixed intervals and hands each one the *intended* time of the
//! tick so that downstream audio can be scheduled sample-accurately, no matter
//! how late the dispatching thread actually woke up.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

mod realtime;

pub use realtime::ThreadClock;

/// Shortest interval a registration may use. A zero interval would never let
/// the tick index advance past the current instant.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// One firing of a repeating registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTick {
    /// Logical index of the tick since the clock was last started.
    pub index: u64,
    /// Intended trigger time, measured from the clock's time origin.
    pub time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub u64);

pub type TickCallback = Arc<dyn Fn(ClockTick) + Send + Sync>;

/// Monotonic, lookahead-capable periodic callback source.
pub trait Clock: Send + Sync {
    /// Registers `callback` to run once per `interval` while the clock runs.
    fn schedule_repeating(&self, interval: Duration, callback: TickCallback) -> RegistrationId;

    /// Removes a single registration. Unknown ids are ignored.
    fn cancel(&self, id: RegistrationId);

    /// Removes every registration. Idempotent.
    fn cancel_all(&self);

    /// Starts producing ticks from index 0, the first one `delay` from now.
    fn start_after(&self, delay: Duration);

    /// Starts producing ticks from index 0 immediately.
    fn start(&self) {
        self.start_after(Duration::ZERO);
    }

    /// Halts tick production while keeping registrations.
    fn pause(&self);

    fn is_running(&self) -> bool;

    /// Current position of the clock relative to its time origin.
    fn now(&self) -> Duration;
}

struct Registration {
    id: RegistrationId,
    interval: Duration,
    origin: Duration,
    next_index: u64,
    callback: TickCallback,
}

impl Registration {
    fn next_time(&self) -> Duration {
        tick_time(self.origin, self.interval, self.next_index)
    }
}

/// Bookkeeping shared by every clock implementation. Callers pop one due tick
/// at a time and invoke the callback after releasing their lock.
#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    running: bool,
    registrations: Vec<Registration>,
}

impl Registry {
    pub(crate) fn insert(
        &mut self,
        interval: Duration,
        callback: TickCallback,
        now: Duration,
    ) -> RegistrationId {
        let id = RegistrationId(self.next_id);
        self.next_id += 1;
        self.registrations.push(Registration {
            id,
            interval: interval.max(MIN_INTERVAL),
            origin: now,
            next_index: 0,
            callback,
        });
        id
    }

    pub(crate) fn remove(&mut self, id: RegistrationId) {
        self.registrations.retain(|registration| registration.id != id);
    }

    pub(crate) fn clear(&mut self) {
        self.registrations.clear();
    }

    pub(crate) fn start(&mut self, origin: Duration) {
        self.running = true;
        for registration in &mut self.registrations {
            registration.origin = origin;
            registration.next_index = 0;
        }
    }

    pub(crate) fn pause(&mut self) {
        self.running = false;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    /// Returns the earliest tick scheduled at or before `horizon`, advancing
    /// its registration. Ties resolve in registration order.
    pub(crate) fn pop_due(&mut self, horizon: Duration) -> Option<(TickCallback, ClockTick)> {
        if !self.running {
            return None;
        }

        let registration = self
            .registrations
            .iter_mut()
            .filter(|registration| registration.next_time() <= horizon)
            .min_by_key(|registration| (registration.next_time(), registration.id))?;

        let tick = ClockTick {
            index: registration.next_index,
            time: registration.next_time(),
        };
        registration.next_index += 1;
        Some((Arc::clone(&registration.callback), tick))
    }

    /// Time of the next tick of any registration, if the clock is running.
    pub(crate) fn next_due(&self) -> Option<Duration> {
        if !self.running {
            return None;
        }
        self.registrations
            .iter()
            .map(Registration::next_time)
            .min()
    }
}

/// Tick times are derived from the origin rather than accumulated, so
/// rounding never compounds into drift.
fn tick_time(origin: Duration, interval: Duration, index: u64) -> Duration {
    let offset = interval.as_nanos().saturating_mul(u128::from(index));
    origin + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX))
}

fn lock_registry<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Registry updates never panic halfway, so a poisoned guard still holds
    // consistent data.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deterministic clock that only moves when told to.
///
/// Used for offline rendering and as the fake clock in tests. Clones share the
/// same timeline, so a test can keep a handle while the scheduler owns another.
#[derive(Clone, Default)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    registry: Registry,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward by `by`, firing every tick that falls inside the
    /// window in chronological order. Returns the number of ticks fired.
    ///
    /// Callbacks run without the clock lock held, so they may reconfigure the
    /// clock; registrations added along the way are honoured within the same
    /// window.
    pub fn advance(&self, by: Duration) -> usize {
        let target = lock_registry(&self.inner).now + by;
        let mut fired = 0;

        loop {
            let due = {
                let mut state = lock_registry(&self.inner);
                match state.registry.pop_due(target) {
                    Some((callback, tick)) => {
                        state.now = state.now.max(tick.time);
                        Some((callback, tick))
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };

            match due {
                Some((callback, tick)) => {
                    callback(tick);
                    fired += 1;
                }
                None => break,
            }
        }

        fired
    }

    /// Number of live registrations.
    pub fn registrations(&self) -> usize {
        lock_registry(&self.inner).registry.registrations.len()
    }
}

impl Clock for ManualClock {
    fn schedule_repeating(&self, interval: Duration, callback: TickCallback) -> RegistrationId {
        let mut state = lock_registry(&self.inner);
        let now = state.now;
        state.registry.insert(interval, callback, now)
    }

    fn cancel(&self, id: RegistrationId) {
        lock_registry(&self.inner).registry.remove(id);
    }

    fn cancel_all(&self) {
        lock_registry(&self.inner).registry.clear();
    }

    fn start_after(&self, delay: Duration) {
        let mut state = lock_registry(&self.inner);
        let origin = state.now + delay;
        state.registry.start(origin);
    }

    fn pause(&self) {
        lock_registry(&self.inner).registry.pause();
    }

    fn is_running(&self) -> bool {
        lock_registry(&self.inner).registry.is_running()
    }

    fn now(&self) -> Duration {
        lock_registry(&self.inner).now
    }
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_registry(&self.inner);
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("running", &state.registry.running)
            .field("registrations", &state.registry.registrations.len())
            .finish()
    }
}
