//! Countdown timer and stopwatch, each driving a private clock.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::clock::{Clock, ClockTick, RegistrationId, TickCallback};
use crate::sound::{SoundId, SoundPool};
use crate::{MetrodroneError, Result};

const TIMER_TICK: Duration = Duration::from_secs(1);

/// Resolution of the stopwatch.
pub const STOPWATCH_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct TimerState {
    configured: u64,
    remaining: u64,
    running: bool,
    finished: bool,
    generation: u64,
    registration: Option<RegistrationId>,
}

/// One-second countdown that sounds the alarm once when it reaches zero.
pub struct Timer {
    clock: Arc<dyn Clock>,
    pool: SoundPool,
    state: Arc<Mutex<TimerState>>,
}

impl Timer {
    pub fn new(clock: Arc<dyn Clock>, pool: SoundPool) -> Self {
        Self {
            clock,
            pool,
            state: Arc::new(Mutex::new(TimerState::default())),
        }
    }

    /// Sets the countdown length, stopping a running countdown.
    pub fn set(&self, seconds: u64) -> Result<()> {
        let mut state = self.lock()?;
        self.halt(&mut state);
        state.configured = seconds;
        state.remaining = seconds;
        state.finished = false;
        Ok(())
    }

    /// Resumes counting down from the remaining time. Does nothing while
    /// running or when no time is left.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.running || state.remaining == 0 {
            return Ok(());
        }

        self.halt(&mut state);
        state.running = true;
        state.finished = false;
        let callback = timer_tick(
            Arc::clone(&self.state),
            self.pool.clone(),
            Arc::downgrade(&self.clock),
            state.generation,
        );
        state.registration = Some(self.clock.schedule_repeating(TIMER_TICK, callback));
        self.clock.start_after(TIMER_TICK);
        tracing::debug!(remaining = state.remaining, "timer started");
        Ok(())
    }

    /// Pauses the countdown, keeping the remaining time.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock()?;
        self.halt(&mut state);
        Ok(())
    }

    /// Stops and rewinds to the last value passed to [`Timer::set`].
    pub fn reset(&self) -> Result<()> {
        let mut state = self.lock()?;
        self.halt(&mut state);
        state.remaining = state.configured;
        state.finished = false;
        Ok(())
    }

    pub fn remaining(&self) -> u64 {
        self.lock().map(|state| state.remaining).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.lock().map(|state| state.running).unwrap_or(false)
    }

    pub fn has_finished(&self) -> bool {
        self.lock().map(|state| state.finished).unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, TimerState>> {
        self.state
            .lock()
            .map_err(|_| MetrodroneError::Poisoned("timer"))
    }

    fn halt(&self, state: &mut TimerState) {
        self.clock.pause();
        self.clock.cancel_all();
        state.registration = None;
        state.running = false;
        state.generation += 1;
    }
}

fn timer_tick(
    shared: Arc<Mutex<TimerState>>,
    pool: SoundPool,
    clock: Weak<dyn Clock>,
    generation: u64,
) -> TickCallback {
    Arc::new(move |_: ClockTick| {
        {
            let Ok(mut state) = shared.lock() else {
                tracing::error!("timer lock poisoned, skipping tick");
                return;
            };
            if !state.running || state.generation != generation {
                return;
            }
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining > 0 {
                return;
            }
            state.running = false;
            state.finished = true;
            state.generation += 1;
            // Halted under the lock so a restart racing this tick keeps the
            // registration it installs.
            if let (Some(clock), Some(id)) = (clock.upgrade(), state.registration.take()) {
                clock.pause();
                clock.cancel(id);
            }
        }

        tracing::info!("timer finished");
        if !pool.trigger(&SoundId::alarm(), None) {
            tracing::warn!("alarm sound not ready");
        }
    })
}

#[derive(Debug, Default)]
struct StopwatchState {
    elapsed: Duration,
    laps: Vec<Duration>,
    running: bool,
    generation: u64,
}

/// Free-running stopwatch with lap recording.
pub struct Stopwatch {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<StopwatchState>>,
}

impl Stopwatch {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(StopwatchState::default())),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.running {
            return Ok(());
        }

        self.halt(&mut state);
        state.running = true;
        let shared = Arc::clone(&self.state);
        let generation = state.generation;
        self.clock.schedule_repeating(
            STOPWATCH_TICK,
            Arc::new(move |_: ClockTick| {
                if let Ok(mut state) = shared.lock() {
                    if state.running && state.generation == generation {
                        state.elapsed += STOPWATCH_TICK;
                    }
                }
            }),
        );
        self.clock.start_after(STOPWATCH_TICK);
        Ok(())
    }

    /// Stops counting; elapsed time is kept.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock()?;
        self.halt(&mut state);
        Ok(())
    }

    /// Stops and clears elapsed time and laps.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.lock()?;
        self.halt(&mut state);
        state.elapsed = Duration::ZERO;
        state.laps.clear();
        Ok(())
    }

    /// Records the current elapsed time as a lap and returns it.
    pub fn lap(&self) -> Result<Duration> {
        let mut state = self.lock()?;
        let elapsed = state.elapsed;
        state.laps.push(elapsed);
        Ok(elapsed)
    }

    pub fn laps(&self) -> Vec<Duration> {
        self.lock().map(|state| state.laps.clone()).unwrap_or_default()
    }

    pub fn elapsed(&self) -> Duration {
        self.lock().map(|state| state.elapsed).unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.lock().map(|state| state.running).unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StopwatchState>> {
        self.state
            .lock()
            .map_err(|_| MetrodroneError::Poisoned("stopwatch"))
    }

    fn halt(&self, state: &mut StopwatchState) {
        self.clock.pause();
        self.clock.cancel_all();
        state.running = false;
        state.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::ManualClock;
    use crate::sound::{Cue, Mixer, SoundGroup, SoundOutput, SoundSource, ToneSpec};

    fn timer_rig() -> (ManualClock, Arc<Mutex<Mixer>>, Timer) {
        let clock = ManualClock::new();
        let mixer = Arc::new(Mutex::new(Mixer::new(8_000)));
        let pool = SoundPool::new(8_000, Arc::clone(&mixer));
        let handle = pool.load(
            SoundId::alarm(),
            SoundGroup::Alarm,
            SoundSource::Tone(ToneSpec::click(880.0)),
        );
        handle.wait(Duration::from_secs(5));
        let timer = Timer::new(Arc::new(clock.clone()), pool);
        (clock, mixer, timer)
    }

    fn alarms(mixer: &Mutex<Mixer>) -> usize {
        mixer
            .lock()
            .unwrap()
            .played()
            .iter()
            .filter(|cue| cue.id == SoundId::alarm())
            .count()
    }

    #[test]
    fn counts_down_and_sounds_alarm_once() {
        let (clock, mixer, timer) = timer_rig();
        timer.set(3).unwrap();
        timer.start().unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(timer.remaining(), 1);
        assert!(!timer.has_finished());

        clock.advance(Duration::from_secs(1));
        assert_eq!(timer.remaining(), 0);
        assert!(timer.has_finished());
        assert!(!timer.is_running());

        clock.advance(Duration::from_secs(10));
        assert_eq!(alarms(&mixer), 1);
        assert_eq!(clock.registrations(), 0);
        assert!(!clock.is_running());
    }

    #[test]
    fn stop_keeps_remaining_and_start_resumes() {
        let (clock, mixer, timer) = timer_rig();
        timer.set(5).unwrap();
        timer.start().unwrap();
        clock.advance(Duration::from_secs(2));
        timer.stop().unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(timer.remaining(), 3);

        timer.start().unwrap();
        clock.advance(Duration::from_secs(3));
        assert!(timer.has_finished());
        assert_eq!(alarms(&mixer), 1);
    }

    #[test]
    fn reset_rewinds_to_configured_length() {
        let (clock, _mixer, timer) = timer_rig();
        timer.set(4).unwrap();
        timer.start().unwrap();
        clock.advance(Duration::from_secs(4));
        assert!(timer.has_finished());

        timer.reset().unwrap();
        assert_eq!(timer.remaining(), 4);
        assert!(!timer.has_finished());
        assert!(!timer.is_running());
    }

    #[test]
    fn zero_length_timer_does_not_start() {
        let (clock, mixer, timer) = timer_rig();
        timer.start().unwrap();
        assert!(!timer.is_running());
        assert_eq!(clock.advance(Duration::from_secs(5)), 0);
        assert_eq!(alarms(&mixer), 0);
    }

    #[test]
    fn stopwatch_accumulates_across_runs() {
        let clock = ManualClock::new();
        let stopwatch = Stopwatch::new(Arc::new(clock.clone()));
        stopwatch.start().unwrap();
        clock.advance(Duration::from_millis(1_000));
        assert_eq!(stopwatch.elapsed(), Duration::from_millis(1_000));

        stopwatch.stop().unwrap();
        clock.advance(Duration::from_millis(500));
        assert_eq!(stopwatch.elapsed(), Duration::from_millis(1_000));

        stopwatch.start().unwrap();
        clock.advance(Duration::from_millis(250));
        assert_eq!(stopwatch.elapsed(), Duration::from_millis(1_250));
    }

    #[test]
    fn laps_are_append_only_until_reset() {
        let clock = ManualClock::new();
        let stopwatch = Stopwatch::new(Arc::new(clock.clone()));
        stopwatch.start().unwrap();

        clock.advance(Duration::from_millis(300));
        assert_eq!(stopwatch.lap().unwrap(), Duration::from_millis(300));
        clock.advance(Duration::from_millis(200));
        stopwatch.lap().unwrap();

        assert_eq!(
            stopwatch.laps(),
            vec![Duration::from_millis(300), Duration::from_millis(500)]
        );

        stopwatch.reset().unwrap();
        assert!(stopwatch.laps().is_empty());
        assert_eq!(stopwatch.elapsed(), Duration::ZERO);
        assert!(!stopwatch.is_running());
    }

    /// Output that restarts the timer from inside the first alarm cue.
    struct RestartOnAlarm {
        timer: Arc<Mutex<Option<Arc<Timer>>>>,
        alarms: Arc<AtomicUsize>,
    }

    impl SoundOutput for RestartOnAlarm {
        fn submit(&mut self, cue: Cue) {
            let Cue::Play { id, .. } = cue else { return };
            if id != SoundId::alarm() || self.alarms.fetch_add(1, Ordering::SeqCst) > 0 {
                return;
            }
            if let Some(timer) = self.timer.lock().unwrap().clone() {
                timer.set(2).unwrap();
                timer.start().unwrap();
            }
        }
    }

    #[test]
    fn restart_from_the_alarm_keeps_its_registration() {
        let clock = ManualClock::new();
        let slot = Arc::new(Mutex::new(None));
        let alarms = Arc::new(AtomicUsize::new(0));
        let pool = SoundPool::new(
            8_000,
            RestartOnAlarm {
                timer: Arc::clone(&slot),
                alarms: Arc::clone(&alarms),
            },
        );
        let handle = pool.load(
            SoundId::alarm(),
            SoundGroup::Alarm,
            SoundSource::Tone(ToneSpec::click(880.0)),
        );
        handle.wait(Duration::from_secs(5));
        let timer = Arc::new(Timer::new(Arc::new(clock.clone()), pool));
        *slot.lock().unwrap() = Some(Arc::clone(&timer));

        timer.set(1).unwrap();
        timer.start().unwrap();
        clock.advance(Duration::from_secs(1));

        assert_eq!(alarms.load(Ordering::SeqCst), 1);
        assert!(timer.is_running());
        assert_eq!(timer.remaining(), 2);
        assert_eq!(clock.registrations(), 1);

        clock.advance(Duration::from_secs(2));
        assert!(timer.has_finished());
        assert_eq!(alarms.load(Ordering::SeqCst), 2);
        assert_eq!(clock.registrations(), 0);
    }
}
