//! Core library for the Metrodrone practice tool.
//!
//! A drift-free [`clock::Clock`] drives the [`scheduler::BeatScheduler`],
//! which voices clicks and count-ins through the [`sound::SoundPool`] and keeps
//! an optional external task locked to the beat. The same pool feeds the
//! monophonic [`drone::DroneVoiceManager`] and the alarm of [`timer::Timer`].

pub mod clock;
pub mod config;
pub mod drone;
pub mod error;
pub mod scheduler;
pub mod sound;
pub mod timer;

pub use clock::{Clock, ClockTick, ManualClock, RegistrationId, ThreadClock};
pub use config::{AppConfig, AudioConfig, MetronomeConfig, VolumeConfig};
pub use drone::{DroneVoiceManager, PitchClass};
pub use error::{MetrodroneError, Result};
pub use scheduler::{BeatScheduler, CountdownConfig, CountdownMode, ScheduledTask};
pub use sound::{Mixer, SoundGroup, SoundId, SoundPool, TracingOutput};
pub use timer::{Stopwatch, Timer};
