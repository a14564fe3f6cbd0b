//! Beat scheduler: turns a tempo into clock ticks, voices a count-in, and
//! keeps an optional external task locked to the beat grid.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, ClockTick, RegistrationId, TickCallback};
use crate::config::DEFAULT_BPM;
use crate::sound::{SoundId, SoundPool, COUNTDOWN_VOICES};
use crate::{MetrodroneError, Result};

/// Pause between tearing down a running schedule and restarting it after a
/// reconfiguration.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(50);

/// Milliseconds between quarter-note beats at `bpm`.
pub fn beat_interval_ms(bpm: u32) -> f64 {
    60_000.0 / f64::from(bpm.max(1))
}

/// Quarter-note beat interval at `bpm`.
pub fn beat_interval(bpm: u32) -> Duration {
    Duration::from_secs_f64(beat_interval_ms(bpm) / 1000.0)
}

/// When the count-in is voiced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CountdownMode {
    /// Prepend the count-in to every cycle.
    #[default]
    Every,
    /// Only count in before the first cycle after a start.
    First,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CountdownConfig {
    pub click_count: u32,
    pub mode: CountdownMode,
}

impl CountdownConfig {
    pub fn new(click_count: u32, mode: CountdownMode) -> Self {
        Self { click_count, mode }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.click_count > 0
    }
}

pub type TaskCallback = Arc<dyn Fn() + Send + Sync>;

/// Periodic callback supplied by an external module, fired at the start of
/// every cycle.
#[derive(Clone)]
pub struct ScheduledTask {
    interval_in_beats: u32,
    callback: TaskCallback,
}

impl ScheduledTask {
    pub fn new(interval_in_beats: u32, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            interval_in_beats,
            callback: Arc::new(callback),
        }
    }

    pub fn interval_in_beats(&self) -> u32 {
        self.interval_in_beats
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("interval_in_beats", &self.interval_in_beats)
            .finish()
    }
}

/// Position inside the current count-in plus main cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeatCycleState {
    beat_counter: u64,
}

impl BeatCycleState {
    pub fn beat_counter(&self) -> u64 {
        self.beat_counter
    }

    fn advance(&mut self) {
        self.beat_counter += 1;
    }

    fn reset(&mut self) {
        self.beat_counter = 0;
    }
}

/// Sound to voice on a beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatAction {
    /// Count-in voice with this index.
    CountIn(usize),
    Click,
}

/// Everything the tick handler decides for one beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeatPlan {
    pub fire_task: bool,
    pub action: BeatAction,
}

/// Decides what happens on beat `counter`.
///
/// With a task of `m` beats and a count-in of `k`, `Every` mode runs cycles of
/// `m + k` beats whose first `k` beats are counted in, firing the task at the
/// start of each cycle. `First` mode counts in once, then runs plain `m`-beat
/// cycles. Without a task the count-in is voiced once after a start and every
/// later beat is a click.
pub fn plan_beat(counter: u64, task_interval: Option<u32>, countdown: CountdownConfig) -> BeatPlan {
    let count_in = u64::from(countdown.click_count);
    let count_in_action = |position: u64| BeatAction::CountIn(position as usize);

    let Some(main) = task_interval.filter(|beats| *beats > 0).map(u64::from) else {
        let action = if counter < count_in {
            count_in_action(counter)
        } else {
            BeatAction::Click
        };
        return BeatPlan {
            fire_task: false,
            action,
        };
    };

    match countdown.mode {
        CountdownMode::Every => {
            let position = counter % (main + count_in);
            BeatPlan {
                fire_task: position == 0,
                action: if position < count_in {
                    count_in_action(position)
                } else {
                    BeatAction::Click
                },
            }
        }
        CountdownMode::First => {
            if counter < count_in {
                BeatPlan {
                    fire_task: counter == 0,
                    action: count_in_action(counter),
                }
            } else {
                let into_main = counter - count_in;
                BeatPlan {
                    fire_task: counter == 0 || (into_main >= main && into_main % main == 0),
                    action: BeatAction::Click,
                }
            }
        }
    }
}

/// Serialises tick dispatch against stop and reconfiguration.
///
/// A tick holds the gate from its first state check until its sound has been
/// submitted, and every state change that tears down a registration holds it
/// too. Once such a change returns, no tick of the old generation can still
/// invoke the task or emit a sound. The dispatching thread may re-enter, so a
/// task callback can reconfigure the scheduler.
#[derive(Default)]
struct DispatchGate {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

struct GateGuard<'a> {
    gate: &'a DispatchGate,
}

impl DispatchGate {
    /// Blocks until no other thread holds the gate. Returns `None` when the
    /// current thread already holds it.
    fn enter(&self) -> Option<GateGuard<'_>> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if *owner == Some(me) {
            return None;
        }
        while owner.is_some() {
            owner = self
                .released
                .wait(owner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *owner = Some(me);
        Some(GateGuard { gate: self })
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut owner = self
            .gate
            .owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *owner = None;
        self.gate.released.notify_all();
    }
}

struct SchedulerState {
    bpm: u32,
    countdown: CountdownConfig,
    task: Option<ScheduledTask>,
    cycle: BeatCycleState,
    running: bool,
    /// Bumped whenever a registration is torn down; ticks carrying an older
    /// generation are ignored.
    generation: u64,
    registration: Option<RegistrationId>,
}

/// Metronome state machine driving a [`Clock`].
///
/// Stopped until [`BeatScheduler::start`]; every tick while running voices a
/// click or count-in voice through the [`SoundPool`] and, at cycle starts,
/// invokes the registered [`ScheduledTask`] before any sound is chosen.
/// Reconfiguring a running scheduler cancels its clock registration first
/// and restarts the cycle at beat 0 after a short settling delay.
pub struct BeatScheduler {
    clock: Arc<dyn Clock>,
    pool: SoundPool,
    settle: Duration,
    state: Arc<Mutex<SchedulerState>>,
    gate: Arc<DispatchGate>,
}

impl BeatScheduler {
    pub fn new(clock: Arc<dyn Clock>, pool: SoundPool) -> Self {
        Self {
            clock,
            pool,
            settle: DEFAULT_SETTLE,
            state: Arc::new(Mutex::new(SchedulerState {
                bpm: DEFAULT_BPM,
                countdown: CountdownConfig::disabled(),
                task: None,
                cycle: BeatCycleState::default(),
                running: false,
                generation: 0,
                registration: None,
            })),
            gate: Arc::new(DispatchGate::default()),
        }
    }

    /// Overrides the settling delay used when restarting after a change.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn start(&self) -> Result<()> {
        let _gate = self.gate.enter();
        let mut state = self.lock()?;
        if state.running {
            return Ok(());
        }
        self.install(&mut state, Duration::ZERO);
        Ok(())
    }

    /// Stops the clock and resets the cycle. Calling it while stopped does
    /// nothing.
    pub fn stop(&self) -> Result<()> {
        let _gate = self.gate.enter();
        let mut state = self.lock()?;
        if !state.running {
            return Ok(());
        }
        self.halt(&mut state);
        tracing::info!("beat scheduler stopped");
        Ok(())
    }

    /// Flips between running and stopped; returns the new running state.
    pub fn toggle(&self) -> Result<bool> {
        if self.is_running() {
            self.stop()?;
            Ok(false)
        } else {
            self.start()?;
            Ok(true)
        }
    }

    /// Changes the tempo. Range checks belong to the caller; see
    /// [`crate::config::clamp_bpm`].
    pub fn set_tempo(&self, bpm: u32) -> Result<()> {
        self.reconfigure(|_| false, |state| state.bpm = bpm)
    }

    pub fn set_countdown(&self, countdown: CountdownConfig) -> Result<()> {
        self.reconfigure(|_| false, |state| state.countdown = countdown)
    }

    /// Registers, replaces or clears the external task. A task with a zero
    /// interval is dropped, leaving the plain metronome cycle.
    pub fn set_schedule(&self, task: Option<ScheduledTask>) -> Result<()> {
        let task = task.filter(|task| {
            let valid = task.interval_in_beats > 0;
            if !valid {
                tracing::warn!("ignoring task with a zero beat interval");
            }
            valid
        });

        let clearing = task.is_none();
        self.reconfigure(
            |state| clearing && state.task.is_none(),
            |state| state.task = task,
        )
    }

    pub fn is_running(&self) -> bool {
        self.lock().map(|state| state.running).unwrap_or(false)
    }

    pub fn current_bpm(&self) -> u32 {
        self.lock().map(|state| state.bpm).unwrap_or(DEFAULT_BPM)
    }

    pub fn countdown(&self) -> CountdownConfig {
        self.lock()
            .map(|state| state.countdown)
            .unwrap_or_default()
    }

    pub fn has_task(&self) -> bool {
        self.lock().map(|state| state.task.is_some()).unwrap_or(false)
    }

    /// Beats voiced since the current cycle was (re)started.
    pub fn beat_counter(&self) -> u64 {
        self.lock()
            .map(|state| state.cycle.beat_counter())
            .unwrap_or(0)
    }

    pub fn beat_interval(&self) -> Duration {
        beat_interval(self.current_bpm())
    }

    fn lock(&self) -> Result<MutexGuard<'_, SchedulerState>> {
        self.state
            .lock()
            .map_err(|_| MetrodroneError::Poisoned("beat scheduler"))
    }

    /// Applies a change, restarting after the settling delay when running.
    /// Nothing happens when `unchanged` holds for the current state.
    fn reconfigure(
        &self,
        unchanged: impl FnOnce(&SchedulerState) -> bool,
        apply: impl FnOnce(&mut SchedulerState),
    ) -> Result<()> {
        let _gate = self.gate.enter();
        let mut state = self.lock()?;
        if unchanged(&state) {
            return Ok(());
        }
        let was_running = state.running;
        if was_running {
            self.halt(&mut state);
        }
        apply(&mut state);
        if was_running {
            self.install(&mut state, self.settle);
        }
        Ok(())
    }

    /// Cancels the clock registration and resets the cycle.
    fn halt(&self, state: &mut SchedulerState) {
        self.clock.pause();
        if let Some(id) = state.registration.take() {
            self.clock.cancel(id);
        }
        self.clock.cancel_all();
        state.generation += 1;
        state.running = false;
        state.cycle.reset();
    }

    /// Installs a fresh registration at the current tempo and starts the clock
    /// after `delay`. Any previous registration is cancelled first.
    fn install(&self, state: &mut SchedulerState, delay: Duration) {
        self.halt(state);

        let interval = beat_interval(state.bpm);
        let callback = tick_handler(
            Arc::clone(&self.state),
            Arc::clone(&self.gate),
            self.pool.clone(),
            state.generation,
        );
        state.registration = Some(self.clock.schedule_repeating(interval, callback));
        state.running = true;
        self.clock.start_after(delay);

        tracing::info!(
            bpm = state.bpm,
            interval_ms = beat_interval_ms(state.bpm),
            count_in = state.countdown.click_count,
            task_beats = state.task.as_ref().map(|task| task.interval_in_beats),
            ?delay,
            "beat scheduler started"
        );
    }
}

impl fmt::Debug for BeatScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeatScheduler")
            .field("bpm", &self.current_bpm())
            .field("running", &self.is_running())
            .field("beat_counter", &self.beat_counter())
            .finish()
    }
}

fn tick_handler(
    state: Arc<Mutex<SchedulerState>>,
    gate: Arc<DispatchGate>,
    pool: SoundPool,
    generation: u64,
) -> TickCallback {
    Arc::new(move |tick| {
        let _gate = gate.enter();
        on_tick(&state, &pool, generation, tick);
    })
}

fn on_tick(shared: &Mutex<SchedulerState>, pool: &SoundPool, generation: u64, tick: ClockTick) {
    let current = |state: &SchedulerState| state.running && state.generation == generation;

    let (plan, task) = {
        let Ok(state) = shared.lock() else {
            tracing::error!("beat scheduler lock poisoned, skipping tick");
            return;
        };
        if !current(&state) {
            return;
        }
        let interval = state.task.as_ref().map(|task| task.interval_in_beats);
        let plan = plan_beat(state.cycle.beat_counter(), interval, state.countdown);
        let task = plan
            .fire_task
            .then(|| state.task.as_ref().map(|task| Arc::clone(&task.callback)))
            .flatten();
        (plan, task)
    };

    // The task hears about the cycle start before the beat is voiced, and
    // without the state lock held so it may query or reconfigure us. The
    // dispatch gate keeps other threads from clearing it in the meantime.
    if let Some(callback) = task {
        callback();
    }

    let sound = {
        let Ok(mut state) = shared.lock() else {
            return;
        };
        if !current(&state) {
            return;
        }
        let sound = match plan.action {
            BeatAction::CountIn(voice) if voice < COUNTDOWN_VOICES => {
                let id = SoundId::countdown(voice);
                if pool.is_ready(&id) {
                    id
                } else {
                    SoundId::click()
                }
            }
            BeatAction::CountIn(_) | BeatAction::Click => SoundId::click(),
        };
        tracing::trace!(beat = state.cycle.beat_counter(), %sound, at = ?tick.time, "beat");
        state.cycle.advance();
        sound
    };

    // Still inside the dispatch gate, so a concurrent stop cannot return
    // before this cue is submitted.
    pool.trigger(&sound, Some(tick.time));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::clock::{ManualClock, ThreadClock};
    use crate::sound::{Cue, LoadState, Mixer, SoundGroup, SoundOutput, SoundSource, ToneSpec};

    const WAIT: Duration = Duration::from_secs(5);

    struct Rig {
        clock: ManualClock,
        mixer: Arc<Mutex<Mixer>>,
        pool: SoundPool,
        scheduler: BeatScheduler,
    }

    impl Rig {
        fn new(countdown_voices: usize) -> Self {
            let clock = ManualClock::new();
            let mixer = Arc::new(Mutex::new(Mixer::new(8_000)));
            let pool = SoundPool::new(8_000, Arc::clone(&mixer));
            let tone = SoundSource::Tone(ToneSpec::click(1000.0));

            pool.load_all(vec![crate::sound::SoundAsset {
                id: SoundId::click(),
                group: SoundGroup::Metronome,
                source: tone.clone(),
            }]);
            pool.load_all(
                (0..countdown_voices)
                    .map(|voice| crate::sound::SoundAsset {
                        id: SoundId::countdown(voice),
                        group: SoundGroup::Countdown,
                        source: tone.clone(),
                    })
                    .collect(),
            );
            assert!(pool.wait_for_group(SoundGroup::Metronome, WAIT));
            if countdown_voices > 0 {
                assert!(pool.wait_for_group(SoundGroup::Countdown, WAIT));
            }

            let scheduler = BeatScheduler::new(Arc::new(clock.clone()), pool.clone());
            Self {
                clock,
                mixer,
                pool,
                scheduler,
            }
        }

        fn played(&self) -> Vec<(String, Duration)> {
            self.mixer
                .lock()
                .unwrap()
                .played()
                .iter()
                .map(|cue| (cue.id.to_string(), cue.at.unwrap_or_default()))
                .collect()
        }
    }

    #[test]
    fn interval_matches_formula_across_tempo_range() {
        for bpm in 40..=240 {
            assert_eq!(beat_interval_ms(bpm), 60_000.0 / bpm as f64);
            let nanos = beat_interval(bpm).as_nanos() as f64;
            assert!((nanos - 60e9 / bpm as f64).abs() <= 2.0, "bpm {bpm}");
        }
    }

    #[test]
    fn plain_metronome_clicks_every_500ms_at_120_bpm() {
        let rig = Rig::new(0);
        rig.scheduler.set_tempo(120).unwrap();
        rig.scheduler.start().unwrap();
        rig.clock.advance(Duration::from_millis(4_750));

        let played = rig.played();
        assert_eq!(played.len(), 10);
        for (beat, (id, at)) in played.iter().enumerate() {
            assert_eq!(id, "click");
            assert_eq!(*at, Duration::from_millis(500) * beat as u32);
        }
        assert_eq!(rig.scheduler.beat_counter(), 10);
    }

    #[test]
    fn task_and_count_in_share_a_twelve_beat_cycle() {
        let rig = Rig::new(4);
        let fired_on = Arc::new(Mutex::new(Vec::new()));
        let mixer = Arc::clone(&rig.mixer);
        let log = Arc::clone(&fired_on);
        rig.scheduler.set_tempo(90).unwrap();
        rig.scheduler
            .set_countdown(CountdownConfig::new(4, CountdownMode::Every))
            .unwrap();
        rig.scheduler
            .set_schedule(Some(ScheduledTask::new(8, move || {
                let beats_so_far = mixer.lock().unwrap().played().len();
                log.lock().unwrap().push(beats_so_far);
            })))
            .unwrap();
        rig.scheduler.start().unwrap();

        let interval = beat_interval(90);
        rig.clock.advance(interval * 35);

        assert_eq!(*fired_on.lock().unwrap(), vec![0, 12, 24]);
        let ids: Vec<String> = rig.played().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids.len(), 36);
        for (beat, id) in ids.iter().enumerate() {
            let position = beat % 12;
            if position < 4 {
                assert_eq!(id, &format!("countdown-{position}"), "beat {beat}");
            } else {
                assert_eq!(id, "click", "beat {beat}");
            }
        }
    }

    #[test]
    fn missing_countdown_voices_fall_back_to_click() {
        let rig = Rig::new(2);
        rig.scheduler
            .set_countdown(CountdownConfig::new(3, CountdownMode::Every))
            .unwrap();
        rig.scheduler
            .set_schedule(Some(ScheduledTask::new(1, || {})))
            .unwrap();
        rig.scheduler.start().unwrap();
        rig.clock.advance(rig.scheduler.beat_interval() * 3);

        let ids: Vec<String> = rig.played().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["countdown-0", "countdown-1", "click", "click"]);
    }

    #[test]
    fn task_fires_once_per_cycle_for_many_shapes() {
        for (main, count_in) in [(1_u32, 0_u32), (3, 0), (4, 2), (7, 7), (2, 9)] {
            let rig = Rig::new(0);
            let fired = Arc::new(Mutex::new(Vec::new()));
            let log = Arc::clone(&fired);
            let clock = rig.clock.clone();
            let interval = rig.scheduler.beat_interval();
            rig.scheduler
                .set_countdown(CountdownConfig::new(count_in, CountdownMode::Every))
                .unwrap();
            rig.scheduler
                .set_schedule(Some(ScheduledTask::new(main, move || {
                    let beat = clock.now().as_nanos() / interval.as_nanos();
                    log.lock().unwrap().push(beat as u64);
                })))
                .unwrap();
            rig.scheduler.start().unwrap();

            let cycle = u64::from(main + count_in);
            rig.clock.advance(interval * (cycle as u32 * 5 - 1));

            let expected: Vec<u64> = (0..5).map(|n| n * cycle).collect();
            assert_eq!(*fired.lock().unwrap(), expected, "m={main} k={count_in}");
        }
    }

    #[test]
    fn first_mode_counts_in_only_once() {
        let rig = Rig::new(4);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        rig.scheduler
            .set_countdown(CountdownConfig::new(2, CountdownMode::First))
            .unwrap();
        rig.scheduler
            .set_schedule(Some(ScheduledTask::new(3, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        rig.scheduler.start().unwrap();
        rig.clock.advance(rig.scheduler.beat_interval() * 10);

        let ids: Vec<String> = rig.played().into_iter().map(|(id, _)| id).collect();
        assert_eq!(&ids[..3], &["countdown-0", "countdown-1", "click"]);
        assert!(ids[2..].iter().all(|id| id == "click"));
        // Cycle starts at beats 0, 5 and 8.
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn count_in_without_task_leads_into_free_clicks() {
        let plan: Vec<BeatAction> = (0..6)
            .map(|beat| plan_beat(beat, None, CountdownConfig::new(2, CountdownMode::Every)).action)
            .collect();
        assert_eq!(
            plan,
            vec![
                BeatAction::CountIn(0),
                BeatAction::CountIn(1),
                BeatAction::Click,
                BeatAction::Click,
                BeatAction::Click,
                BeatAction::Click,
            ]
        );
        assert!((0..6).all(|beat| !plan_beat(beat, None, CountdownConfig::default()).fire_task));
    }

    #[test]
    fn zero_interval_task_degrades_to_plain_metronome() {
        let rig = Rig::new(0);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        rig.scheduler
            .set_schedule(Some(ScheduledTask::new(0, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        assert!(!rig.scheduler.has_task());

        rig.scheduler.start().unwrap();
        rig.clock.advance(rig.scheduler.beat_interval() * 4);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(rig.played().len(), 5);
    }

    #[test]
    fn stop_is_idempotent() {
        let rig = Rig::new(0);
        rig.scheduler.start().unwrap();
        rig.clock.advance(rig.scheduler.beat_interval() * 3);

        rig.scheduler.stop().unwrap();
        let once = (rig.scheduler.is_running(), rig.scheduler.beat_counter());
        rig.scheduler.stop().unwrap();
        let twice = (rig.scheduler.is_running(), rig.scheduler.beat_counter());

        assert_eq!(once, (false, 0));
        assert_eq!(once, twice);
        assert_eq!(rig.clock.registrations(), 0);
        assert_eq!(rig.clock.advance(Duration::from_secs(10)), 0);
    }

    #[test]
    fn tempo_change_restarts_cycle_with_new_interval() {
        let rig = Rig::new(0);
        rig.scheduler.set_tempo(120).unwrap();
        rig.scheduler.start().unwrap();
        rig.clock.advance(Duration::from_millis(1_200));
        assert_eq!(rig.scheduler.beat_counter(), 3);

        let changed_at = rig.clock.now();
        rig.scheduler.set_tempo(60).unwrap();
        assert_eq!(rig.scheduler.beat_counter(), 0);
        assert!(rig.scheduler.is_running());
        assert_eq!(rig.clock.registrations(), 1);

        rig.clock.advance(DEFAULT_SETTLE + Duration::from_millis(2_000));
        let after: Vec<Duration> = rig
            .played()
            .into_iter()
            .skip(3)
            .map(|(_, at)| at - changed_at)
            .collect();
        assert_eq!(
            after,
            vec![
                DEFAULT_SETTLE,
                DEFAULT_SETTLE + Duration::from_millis(1_000),
                DEFAULT_SETTLE + Duration::from_millis(2_000),
            ]
        );
        assert_eq!(rig.scheduler.beat_counter(), 3);
    }

    #[test]
    fn reconfiguring_while_stopped_only_stores_state() {
        let rig = Rig::new(0);
        rig.scheduler.set_tempo(200).unwrap();
        rig.scheduler
            .set_countdown(CountdownConfig::new(4, CountdownMode::First))
            .unwrap();

        assert!(!rig.scheduler.is_running());
        assert_eq!(rig.clock.registrations(), 0);
        assert_eq!(rig.scheduler.current_bpm(), 200);
        assert_eq!(rig.scheduler.countdown().click_count, 4);
    }

    #[test]
    fn task_may_reconfigure_the_scheduler_from_its_callback() {
        let rig = Rig::new(0);
        let scheduler = Arc::new(rig.scheduler);
        let handle = Arc::clone(&scheduler);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        scheduler
            .set_schedule(Some(ScheduledTask::new(4, move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                    handle.set_tempo(60).unwrap();
                }
            })))
            .unwrap();
        scheduler.start().unwrap();
        rig.clock.advance(Duration::from_millis(2_000));

        // Second cycle start retuned the tempo; that tick was abandoned and
        // the new cycle begins after the settling delay.
        assert_eq!(scheduler.current_bpm(), 60);
        assert_eq!(rig.mixer.lock().unwrap().played().len(), 4);
        rig.clock.advance(DEFAULT_SETTLE);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.beat_counter(), 1);
    }

    #[test]
    fn toggle_flips_running_state() {
        let rig = Rig::new(0);
        assert!(rig.scheduler.toggle().unwrap());
        assert!(rig.scheduler.is_running());
        assert!(!rig.scheduler.toggle().unwrap());
        assert!(!rig.scheduler.is_running());
        assert!(rig.pool.is_ready(&SoundId::click()));
    }

    /// Counts play cues, and separately those submitted while `stopped` is set.
    struct CueAudit {
        stopped: Arc<AtomicBool>,
        played: Arc<AtomicUsize>,
        stale: Arc<AtomicUsize>,
    }

    impl SoundOutput for CueAudit {
        fn submit(&mut self, cue: Cue) {
            if matches!(cue, Cue::Play { .. }) {
                self.played.fetch_add(1, Ordering::SeqCst);
                if self.stopped.load(Ordering::SeqCst) {
                    self.stale.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Scheduler on a real clock ticking every 5 ms with no settling delay.
    fn threaded_scheduler(output: impl SoundOutput + 'static) -> BeatScheduler {
        let pool = SoundPool::new(8_000, output);
        let click = pool.load(
            SoundId::click(),
            SoundGroup::Metronome,
            SoundSource::Tone(ToneSpec::click(1000.0)),
        );
        assert_eq!(click.wait(WAIT), LoadState::Ready);

        let clock = ThreadClock::with_lookahead(Duration::from_millis(4));
        let scheduler = BeatScheduler::new(Arc::new(clock), pool).with_settle(Duration::ZERO);
        scheduler.set_tempo(12_000).unwrap();
        scheduler
    }

    #[test]
    fn no_click_follows_stop_on_a_threaded_clock() {
        let stopped = Arc::new(AtomicBool::new(false));
        let played = Arc::new(AtomicUsize::new(0));
        let stale = Arc::new(AtomicUsize::new(0));
        let scheduler = threaded_scheduler(CueAudit {
            stopped: Arc::clone(&stopped),
            played: Arc::clone(&played),
            stale: Arc::clone(&stale),
        });

        for _ in 0..40 {
            stopped.store(false, Ordering::SeqCst);
            scheduler.start().unwrap();
            thread::sleep(Duration::from_millis(7));
            scheduler.stop().unwrap();
            stopped.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(3));
        }

        assert!(played.load(Ordering::SeqCst) > 0);
        assert_eq!(stale.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cleared_task_is_never_invoked_on_a_threaded_clock() {
        let cleared = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let late = Arc::new(AtomicUsize::new(0));
        let scheduler = threaded_scheduler(Mixer::new(8_000));
        scheduler.start().unwrap();

        for _ in 0..40 {
            cleared.store(false, Ordering::SeqCst);
            let (flag, call_count, late_count) =
                (Arc::clone(&cleared), Arc::clone(&calls), Arc::clone(&late));
            scheduler
                .set_schedule(Some(ScheduledTask::new(1, move || {
                    call_count.fetch_add(1, Ordering::SeqCst);
                    if flag.load(Ordering::SeqCst) {
                        late_count.fetch_add(1, Ordering::SeqCst);
                    }
                })))
                .unwrap();
            thread::sleep(Duration::from_millis(7));
            scheduler.set_schedule(None).unwrap();
            cleared.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(3));
        }
        scheduler.stop().unwrap();

        assert!(calls.load(Ordering::SeqCst) > 0);
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clearing_an_absent_task_leaves_a_running_cycle_alone() {
        let rig = Rig::new(0);
        rig.scheduler.start().unwrap();
        rig.clock.advance(rig.scheduler.beat_interval() * 2);

        rig.scheduler.set_schedule(None).unwrap();
        assert_eq!(rig.scheduler.beat_counter(), 3);
        assert!(rig.scheduler.is_running());
    }
}
