use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::CountdownConfig;
use crate::sound::{SoundGroup, SoundPool};
use crate::Result;

pub const MIN_BPM: u32 = 40;
pub const MAX_BPM: u32 = 240;
pub const DEFAULT_BPM: u32 = 120;

/// Quietest and loudest accepted group volume, in decibels.
pub const MIN_VOLUME_DB: f32 = -40.0;
pub const MAX_VOLUME_DB: f32 = 0.0;

/// Clamps a tempo into the supported range.
pub fn clamp_bpm(bpm: u32) -> u32 {
    bpm.clamp(MIN_BPM, MAX_BPM)
}

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub metronome: MetronomeConfig,
    pub volume: VolumeConfig,
    /// Sound id to WAV file. Sounds without an entry are synthesized.
    pub sounds: BTreeMap<String, PathBuf>,
}

impl AppConfig {
    /// Reads a JSON config file. The result is already validated.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        Ok(config.validated())
    }

    /// Brings out-of-range values back into range.
    pub fn validated(mut self) -> Self {
        let bpm = clamp_bpm(self.metronome.bpm);
        if bpm != self.metronome.bpm {
            tracing::warn!(requested = self.metronome.bpm, bpm, "tempo out of range, clamped");
            self.metronome.bpm = bpm;
        }
        self.audio.sample_rate = self.audio.sample_rate.max(1);
        self.volume = self.volume.clamped();
        self
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// How far ahead of real time the threaded clock dispatches ticks.
    pub lookahead_ms: u64,
    /// Pause before the scheduler restarts after a reconfiguration.
    pub settle_ms: u64,
}

impl AudioConfig {
    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            lookahead_ms: 100,
            settle_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetronomeConfig {
    pub bpm: u32,
    pub countdown: CountdownConfig,
}

impl Default for MetronomeConfig {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            countdown: CountdownConfig::default(),
        }
    }
}

/// Per-group volume in decibels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub metronome_db: f32,
    pub countdown_db: f32,
    pub drone_db: f32,
    pub alarm_db: f32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            metronome_db: 0.0,
            countdown_db: 0.0,
            drone_db: -12.0,
            alarm_db: 0.0,
        }
    }
}

impl VolumeConfig {
    fn clamped(self) -> Self {
        let clamp = |db: f32| {
            if db.is_nan() {
                MAX_VOLUME_DB
            } else {
                db.clamp(MIN_VOLUME_DB, MAX_VOLUME_DB)
            }
        };
        Self {
            metronome_db: clamp(self.metronome_db),
            countdown_db: clamp(self.countdown_db),
            drone_db: clamp(self.drone_db),
            alarm_db: clamp(self.alarm_db),
        }
    }

    pub fn for_group(&self, group: SoundGroup) -> f32 {
        match group {
            SoundGroup::Metronome => self.metronome_db,
            SoundGroup::Countdown => self.countdown_db,
            SoundGroup::Drone => self.drone_db,
            SoundGroup::Alarm => self.alarm_db,
        }
    }

    /// Applies every group volume to `pool`. Volumes of sounds still loading
    /// take effect once they are ready.
    pub fn apply(&self, pool: &SoundPool) -> Result<()> {
        for group in [
            SoundGroup::Metronome,
            SoundGroup::Countdown,
            SoundGroup::Drone,
            SoundGroup::Alarm,
        ] {
            pool.set_volume(group, self.for_group(group))?;
        }
        Ok(())
    }
}
