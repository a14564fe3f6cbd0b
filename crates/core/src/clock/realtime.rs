use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{lock_registry, Clock, RegistrationId, Registry, TickCallback};

/// Real-time clock backed by a worker thread.
///
/// The worker wakes every half lookahead window and dispatches every tick due
/// before `now + lookahead`. Callbacks therefore run early, never late, and
/// receive the nominal tick time so the audio stage can place the sound
/// exactly even if the thread was descheduled for a while.
pub struct ThreadClock {
    shared: Arc<Shared>,
    control: Sender<Control>,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    epoch: Instant,
    lookahead: Duration,
    registry: Mutex<Registry>,
}

impl Shared {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

enum Control {
    Wake,
    Shutdown,
}

impl ThreadClock {
    pub const DEFAULT_LOOKAHEAD: Duration = Duration::from_millis(100);

    pub fn new() -> Self {
        Self::with_lookahead(Self::DEFAULT_LOOKAHEAD)
    }

    pub fn with_lookahead(lookahead: Duration) -> Self {
        let shared = Arc::new(Shared {
            epoch: Instant::now(),
            lookahead,
            registry: Mutex::new(Registry::default()),
        });
        let (control, rx) = crossbeam_channel::unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("metrodrone-clock".to_string())
            .spawn(move || run_worker(&worker_shared, &rx))
            .map_err(|err| tracing::error!(%err, "failed to spawn clock worker"))
            .ok();

        Self {
            shared,
            control,
            worker,
        }
    }

    pub fn lookahead(&self) -> Duration {
        self.shared.lookahead
    }

    fn wake(&self) {
        let _ = self.control.send(Control::Wake);
    }
}

impl Default for ThreadClock {
    fn default() -> Self {
        Self::new()
    }
}

fn run_worker(shared: &Shared, rx: &Receiver<Control>) {
    let poll = (shared.lookahead / 2).max(Duration::from_millis(1));
    tracing::debug!(?poll, lookahead = ?shared.lookahead, "clock worker started");

    loop {
        let horizon = shared.now() + shared.lookahead;
        loop {
            let due = lock_registry(&shared.registry).pop_due(horizon);
            match due {
                Some((callback, tick)) => callback(tick),
                None => break,
            }
        }

        let sleep = lock_registry(&shared.registry)
            .next_due()
            .map(|next| next.saturating_sub(shared.now() + shared.lookahead))
            .map_or(poll, |until_due| until_due.clamp(Duration::from_millis(1), poll));

        match rx.recv_timeout(sleep) {
            Ok(Control::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::debug!("clock worker stopped");
}

impl Clock for ThreadClock {
    fn schedule_repeating(&self, interval: Duration, callback: TickCallback) -> RegistrationId {
        let now = self.shared.now();
        let id = lock_registry(&self.shared.registry).insert(interval, callback, now);
        self.wake();
        id
    }

    fn cancel(&self, id: RegistrationId) {
        lock_registry(&self.shared.registry).remove(id);
    }

    fn cancel_all(&self) {
        lock_registry(&self.shared.registry).clear();
    }

    fn start_after(&self, delay: Duration) {
        let origin = self.shared.now() + delay;
        lock_registry(&self.shared.registry).start(origin);
        self.wake();
    }

    fn pause(&self) {
        lock_registry(&self.shared.registry).pause();
    }

    fn is_running(&self) -> bool {
        lock_registry(&self.shared.registry).is_running()
    }

    fn now(&self) -> Duration {
        self.shared.now()
    }
}

impl Drop for ThreadClock {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for ThreadClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadClock")
            .field("lookahead", &self.shared.lookahead)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::ClockTick;

    #[test]
    fn dispatches_drift_free_ticks_ahead_of_time() {
        let clock = ThreadClock::with_lookahead(Duration::from_millis(40));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let timebase = Arc::clone(&clock.shared);
        clock.schedule_repeating(
            Duration::from_millis(20),
            Arc::new(move |tick: ClockTick| {
                sink.lock().unwrap().push((tick, timebase.now()));
            }),
        );
        clock.start();
        thread::sleep(Duration::from_millis(150));
        clock.pause();

        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 5);
        let origin = seen[0].0.time;
        for (tick, _) in seen.iter() {
            assert_eq!(tick.time - origin, Duration::from_millis(20) * tick.index as u32);
        }
        assert!(seen.iter().any(|(tick, dispatched)| *dispatched < tick.time));
    }

    #[test]
    fn pause_stops_dispatch() {
        let clock = ThreadClock::with_lookahead(Duration::from_millis(10));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        clock.schedule_repeating(
            Duration::from_millis(5),
            Arc::new(move |_: ClockTick| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        clock.start();
        thread::sleep(Duration::from_millis(40));
        clock.pause();
        thread::sleep(Duration::from_millis(10));
        let after_pause = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(40));

        assert!(after_pause > 0);
        assert_eq!(count.load(Ordering::SeqCst), after_pause);
        assert!(!clock.is_running());
    }
}
