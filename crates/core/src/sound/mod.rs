//! Sound resources: identifiers, sources, decoded buffers and the pool that
//! owns them.

use std::collections::BTreeMap;
use std::f32::consts::PI;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::drone::PitchClass;

pub mod loader;
pub mod mixer;
pub mod pool;

pub use mixer::{Cue, Mixer, PlayedCue, SoundOutput, TracingOutput};
pub use pool::{LoadHandle, SoundPool};

/// Number of distinct count-in voices shipped with the application.
pub const COUNTDOWN_VOICES: usize = 7;

/// Octave the synthesized drone tones are pitched in.
pub const DRONE_OCTAVE: i32 = 3;

/// Identifier of a single sound resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SoundId(String);

impl SoundId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn click() -> Self {
        Self::new("click")
    }

    pub fn countdown(voice: usize) -> Self {
        Self(format!("countdown-{voice}"))
    }

    pub fn alarm() -> Self {
        Self::new("alarm")
    }

    pub fn drone(pitch: PitchClass) -> Self {
        Self(format!("drone-{}", pitch.name()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SoundId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Named group of resources sharing a volume control and a readiness signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SoundGroup {
    Metronome,
    Countdown,
    Alarm,
    Drone,
}

impl fmt::Display for SoundGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SoundGroup::Metronome => "metronome",
            SoundGroup::Countdown => "countdown",
            SoundGroup::Alarm => "alarm",
            SoundGroup::Drone => "drone",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadState {
    Loading,
    Ready,
    Failed,
}

/// Where a resource's audio comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SoundSource {
    /// WAV file decoded on the loader thread.
    Wav(PathBuf),
    /// Tone synthesized on the loader thread.
    Tone(ToneSpec),
}

/// Parameters of a synthesized sine tone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToneSpec {
    pub frequency_hz: f32,
    pub duration_ms: f32,
    pub amplitude: f32,
    /// Exponential decay rate over the tone's length; 0 keeps it sustained.
    pub decay: f32,
}

impl ToneSpec {
    /// Short percussive blip used for clicks and count-in voices.
    pub fn click(frequency_hz: f32) -> Self {
        Self {
            frequency_hz,
            duration_ms: 30.0,
            amplitude: 0.6,
            decay: 8.0,
        }
    }

    /// Sustained tone meant to be looped. The rendered length is rounded to a
    /// whole number of periods, so the waveform stays continuous across the
    /// loop point.
    pub fn sustained(frequency_hz: f32) -> Self {
        Self {
            frequency_hz,
            duration_ms: 2000.0,
            amplitude: 0.35,
            decay: 0.0,
        }
    }

    /// Renders the tone at `sample_rate`.
    pub fn synthesize(&self, sample_rate: u32) -> SampleBuffer {
        let rate = f64::from(sample_rate.max(1));
        let frequency = f64::from(self.frequency_hz);
        let seconds = f64::from(self.duration_ms) / 1000.0;

        let len = if self.decay > 0.0 || frequency <= 0.0 {
            (seconds * rate).round().max(1.0) as usize
        } else {
            let periods = (seconds * frequency).round().max(1.0);
            (periods * rate / frequency).round().max(1.0) as usize
        };

        let data = (0..len)
            .map(|i| {
                // Phase is reduced in f64 so long tones keep their pitch.
                let phase = (i as f64 * frequency / rate).fract() * 2.0 * std::f64::consts::PI;
                let envelope = if self.decay > 0.0 {
                    (-(i as f32 / len as f32) * self.decay).exp()
                } else {
                    1.0
                };
                phase.sin() as f32 * envelope * self.amplitude
            })
            .collect();

        SampleBuffer { sample_rate, data }
    }
}

/// Decoded mono audio at the pool sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub sample_rate: u32,
    pub data: Vec<f32>,
}

impl SampleBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Converts decibels to a linear amplitude factor.
pub fn db_to_gain(decibels: f32) -> f32 {
    10.0_f32.powf(decibels / 20.0)
}

/// One entry of the standard asset set.
#[derive(Debug, Clone, PartialEq)]
pub struct SoundAsset {
    pub id: SoundId,
    pub group: SoundGroup,
    pub source: SoundSource,
}

/// Builds the standard asset set: the click, seven count-in voices, the alarm
/// and twelve drone tones. Ids present in `overrides` load from the given WAV
/// file instead of the synthesized default.
pub fn standard_assets(overrides: &BTreeMap<String, PathBuf>) -> Vec<SoundAsset> {
    let mut assets = vec![SoundAsset {
        id: SoundId::click(),
        group: SoundGroup::Metronome,
        source: SoundSource::Tone(ToneSpec::click(1000.0)),
    }];

    // Count-in voices step down a semitone each so they stay distinguishable.
    assets.extend((0..COUNTDOWN_VOICES).map(|voice| SoundAsset {
        id: SoundId::countdown(voice),
        group: SoundGroup::Countdown,
        source: SoundSource::Tone(ToneSpec::click(
            1500.0 * 2.0_f32.powf(-(voice as f32) / 12.0),
        )),
    }));

    assets.push(SoundAsset {
        id: SoundId::alarm(),
        group: SoundGroup::Alarm,
        source: SoundSource::Tone(ToneSpec {
            frequency_hz: 880.0,
            duration_ms: 1200.0,
            amplitude: 0.5,
            decay: 3.0,
        }),
    });

    assets.extend(PitchClass::ALL.iter().map(|pitch| SoundAsset {
        id: SoundId::drone(*pitch),
        group: SoundGroup::Drone,
        source: SoundSource::Tone(ToneSpec::sustained(pitch.frequency(DRONE_OCTAVE))),
    }));

    for asset in &mut assets {
        if let Some(path) = overrides.get(asset.id.as_str()) {
            asset.source = SoundSource::Wav(path.clone());
        }
    }

    assets
}
