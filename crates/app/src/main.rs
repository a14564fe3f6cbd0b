use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use metrodrone_core::config::clamp_bpm;
use metrodrone_core::scheduler::beat_interval;
use metrodrone_core::sound::loader::write_wav;
use metrodrone_core::sound::{standard_assets, SampleBuffer};
use metrodrone_core::{
    AppConfig, BeatScheduler, Clock, CountdownMode, DroneVoiceManager,
    ManualClock, MetrodroneError, Mixer, PitchClass, ScheduledTask, SoundGroup, SoundPool,
    Stopwatch, ThreadClock, Timer, TracingOutput,
};
use tracing_subscriber::EnvFilter;

const LOAD_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> metrodrone_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Metronome { beat, seconds } => run_metronome(&config, &beat, seconds),
        Commands::Render {
            beat,
            beats,
            output,
        } => run_render(&config, &beat, beats, &output),
        Commands::Drone {
            pitch,
            switch_to,
            seconds,
            output,
        } => run_drone(&config, pitch, switch_to, seconds, &output),
        Commands::Timer { seconds } => run_timer(&config, seconds),
        Commands::Stopwatch { seconds, laps } => run_stopwatch(&config, seconds, laps),
    }
}

fn run_metronome(config: &AppConfig, beat: &BeatArgs, seconds: u64) -> metrodrone_core::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(ThreadClock::with_lookahead(config.audio.lookahead()));
    let pool = load_pool(config, TracingOutput, &[SoundGroup::Metronome, SoundGroup::Countdown])?;
    let scheduler = configure_scheduler(config, beat, clock, pool)?;

    scheduler.start()?;
    thread::sleep(Duration::from_secs(seconds));
    scheduler.stop()?;
    tracing::info!("metronome finished");
    Ok(())
}

fn run_render(
    config: &AppConfig,
    beat: &BeatArgs,
    beats: u32,
    output: &Path,
) -> metrodrone_core::Result<()> {
    if beats == 0 {
        return Err(MetrodroneError::InvalidInput("render needs at least one beat"));
    }

    let clock = ManualClock::new();
    let mixer = Arc::new(Mutex::new(Mixer::new(config.audio.sample_rate)));
    let pool = load_pool(
        config,
        Arc::clone(&mixer),
        &[SoundGroup::Metronome, SoundGroup::Countdown],
    )?;
    let scheduler = configure_scheduler(config, beat, Arc::new(clock.clone()), pool)?;

    scheduler.start()?;
    let interval = beat_interval(scheduler.current_bpm());
    let fired = clock.advance(interval * (beats - 1));
    scheduler.stop()?;

    let buffer = render_mixer(&mixer, interval * beats)?;
    write_wav(output, &buffer)?;
    tracing::info!(beats = fired, output = %output.display(), "click track rendered");
    Ok(())
}

fn run_drone(
    config: &AppConfig,
    pitch: PitchClass,
    switch_to: Option<PitchClass>,
    seconds: u64,
    output: &Path,
) -> metrodrone_core::Result<()> {
    let mixer = Arc::new(Mutex::new(Mixer::new(config.audio.sample_rate)));
    let pool = load_pool(config, Arc::clone(&mixer), &[SoundGroup::Drone])?;
    let mut drone = DroneVoiceManager::new(pool);

    drone.set_active_voice(pitch);
    if !drone.set_playing(true) {
        return Err(MetrodroneError::msg("drone tones failed to load"));
    }

    let total = Duration::from_secs(seconds);
    let buffer = match switch_to {
        Some(next) => {
            let mut first = render_mixer(&mixer, total / 2)?;
            drone.set_active_voice(next);
            let second = render_mixer(&mixer, total - total / 2)?;
            first.data.extend(second.data);
            first
        }
        None => render_mixer(&mixer, total)?,
    };
    drone.set_playing(false);

    write_wav(output, &buffer)?;
    tracing::info!(%pitch, switch_to = ?switch_to, output = %output.display(), "drone rendered");
    Ok(())
}

fn run_timer(config: &AppConfig, seconds: u64) -> metrodrone_core::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(ThreadClock::with_lookahead(config.audio.lookahead()));
    let pool = load_pool(config, TracingOutput, &[SoundGroup::Alarm])?;
    let timer = Timer::new(clock, pool);

    timer.set(seconds)?;
    timer.start()?;
    let mut shown = seconds;
    while !timer.has_finished() {
        thread::sleep(Duration::from_millis(100));
        let remaining = timer.remaining();
        if remaining != shown {
            tracing::info!(remaining, "timer");
            shown = remaining;
        }
        if !timer.is_running() && !timer.has_finished() {
            break;
        }
    }
    Ok(())
}

fn run_stopwatch(config: &AppConfig, seconds: u64, laps: u32) -> metrodrone_core::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(ThreadClock::with_lookahead(config.audio.lookahead()));
    let stopwatch = Stopwatch::new(clock);
    let splits = laps.max(1);
    let split = Duration::from_secs(seconds) / splits;

    stopwatch.start()?;
    for _ in 0..splits {
        thread::sleep(split);
        let lap = stopwatch.lap()?;
        tracing::info!(lap_ms = lap.as_millis() as u64, "lap");
    }
    stopwatch.stop()?;
    tracing::info!(
        elapsed_ms = stopwatch.elapsed().as_millis() as u64,
        laps = stopwatch.laps().len(),
        "stopwatch finished"
    );
    Ok(())
}

/// Loads the standard sound set into a fresh pool and waits for `groups`.
fn load_pool(
    config: &AppConfig,
    output: impl metrodrone_core::sound::SoundOutput + 'static,
    groups: &[SoundGroup],
) -> metrodrone_core::Result<SoundPool> {
    let pool = SoundPool::new(config.audio.sample_rate, output);
    pool.load_all(standard_assets(&config.sounds));
    config.volume.apply(&pool)?;

    for group in groups {
        if !pool.wait_for_group(*group, LOAD_TIMEOUT) {
            tracing::warn!(%group, "sounds not ready, continuing without them");
        }
    }
    Ok(pool)
}

fn configure_scheduler(
    config: &AppConfig,
    beat: &BeatArgs,
    clock: Arc<dyn Clock>,
    pool: SoundPool,
) -> metrodrone_core::Result<BeatScheduler> {
    let scheduler = BeatScheduler::new(clock, pool).with_settle(config.audio.settle());

    let requested = beat.bpm.unwrap_or(config.metronome.bpm);
    let bpm = clamp_bpm(requested);
    if bpm != requested {
        tracing::warn!(requested, bpm, "tempo out of range, clamped");
    }
    scheduler.set_tempo(bpm)?;

    let mut countdown = config.metronome.countdown;
    if let Some(count_in) = beat.count_in {
        countdown.click_count = count_in;
    }
    if let Some(mode) = beat.countdown_mode {
        countdown.mode = mode;
    }
    scheduler.set_countdown(countdown)?;

    if let Some(every) = beat.task_every {
        let cycles = AtomicU64::new(0);
        scheduler.set_schedule(Some(ScheduledTask::new(every, move || {
            let cycle = cycles.fetch_add(1, Ordering::Relaxed);
            tracing::info!(cycle, "cycle start");
        })))?;
    }
    Ok(scheduler)
}

fn render_mixer(mixer: &Mutex<Mixer>, duration: Duration) -> metrodrone_core::Result<SampleBuffer> {
    let mut mixer = mixer
        .lock()
        .map_err(|_| MetrodroneError::Poisoned("mixer"))?;
    Ok(mixer.render_duration(duration))
}

fn parse_countdown_mode(value: &str) -> Result<CountdownMode, String> {
    match value {
        "every" => Ok(CountdownMode::Every),
        "first" => Ok(CountdownMode::First),
        other => Err(format!("unknown countdown mode `{other}`, expected `every` or `first`")),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Metronome, count-in and drone practice tool", long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct BeatArgs {
    /// Tempo in beats per minute, clamped to 40..=240.
    #[arg(long)]
    bpm: Option<u32>,
    /// Number of count-in beats voiced before each cycle.
    #[arg(long)]
    count_in: Option<u32>,
    /// Count in before every cycle or only the first.
    #[arg(long, value_parser = parse_countdown_mode)]
    countdown_mode: Option<CountdownMode>,
    /// Fire a cycle-start task every N beats.
    #[arg(long)]
    task_every: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the metronome in real time, logging every cue.
    Metronome {
        #[command(flatten)]
        beat: BeatArgs,
        /// How long to run.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Render a click track to a WAV file.
    Render {
        #[command(flatten)]
        beat: BeatArgs,
        #[arg(long, default_value_t = 16)]
        beats: u32,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Render a drone, optionally switching pitch halfway, to a WAV file.
    Drone {
        #[arg(long, default_value = "A")]
        pitch: PitchClass,
        #[arg(long)]
        switch_to: Option<PitchClass>,
        #[arg(long, default_value_t = 4)]
        seconds: u64,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Count down and sound the alarm.
    Timer {
        #[arg(long)]
        seconds: u64,
    },
    /// Run the stopwatch, recording evenly spaced laps.
    Stopwatch {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        #[arg(long, default_value_t = 1)]
        laps: u32,
    },
}
