use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::sound::{SoundGroup, SoundId, SoundPool};
use crate::MetrodroneError;

/// One of the twelve equal-tempered pitch classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PitchClass {
    C,
    CSharp,
    D,
    DSharp,
    E,
    F,
    FSharp,
    G,
    GSharp,
    A,
    ASharp,
    B,
}

impl PitchClass {
    pub const ALL: [PitchClass; 12] = [
        PitchClass::C,
        PitchClass::CSharp,
        PitchClass::D,
        PitchClass::DSharp,
        PitchClass::E,
        PitchClass::F,
        PitchClass::FSharp,
        PitchClass::G,
        PitchClass::GSharp,
        PitchClass::A,
        PitchClass::ASharp,
        PitchClass::B,
    ];

    /// Semitones above C.
    pub fn semitone(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            PitchClass::C => "C",
            PitchClass::CSharp => "C#",
            PitchClass::D => "D",
            PitchClass::DSharp => "D#",
            PitchClass::E => "E",
            PitchClass::F => "F",
            PitchClass::FSharp => "F#",
            PitchClass::G => "G",
            PitchClass::GSharp => "G#",
            PitchClass::A => "A",
            PitchClass::ASharp => "A#",
            PitchClass::B => "B",
        }
    }

    /// Equal-tempered frequency in `octave`, with A4 at 440 Hz.
    pub fn frequency(self, octave: i32) -> f32 {
        let midi = (octave + 1) * 12 + self.semitone();
        440.0 * 2.0_f32.powf((midi - 69) as f32 / 12.0)
    }
}

impl fmt::Display for PitchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PitchClass {
    type Err = MetrodroneError;

    /// Accepts sharps (`C#`) and flats (`Db`), case-insensitively.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut chars = value.trim().chars();
        let letter = chars
            .next()
            .ok_or(MetrodroneError::InvalidInput("empty pitch name"))?;
        let natural = match letter.to_ascii_uppercase() {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return Err(MetrodroneError::msg(format!("unknown pitch `{value}`"))),
        };
        let accidental = match chars.as_str() {
            "" => 0,
            "#" | "s" | "sharp" => 1,
            "b" | "flat" => -1,
            _ => return Err(MetrodroneError::msg(format!("unknown pitch `{value}`"))),
        };
        let index = (natural + accidental + 12) % 12;
        Ok(Self::ALL[index as usize])
    }
}

/// Monophonic selector over the twelve drone tones.
///
/// At most one voice is started at any time. Switching pitch while playing
/// stops the previous voice before the new one starts; any overlap is only the
/// release tail of the old voice in the output stage.
#[derive(Debug)]
pub struct DroneVoiceManager {
    pool: SoundPool,
    active: PitchClass,
    playing: bool,
}

impl DroneVoiceManager {
    pub fn new(pool: SoundPool) -> Self {
        Self {
            pool,
            active: PitchClass::A,
            playing: false,
        }
    }

    /// Whether every drone tone has finished loading.
    pub fn is_ready(&self) -> bool {
        self.pool.is_group_ready(SoundGroup::Drone)
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn active_voice(&self) -> PitchClass {
        self.active
    }

    /// Voices whose looping playback is currently started.
    pub fn started_voices(&self) -> Vec<PitchClass> {
        PitchClass::ALL
            .into_iter()
            .filter(|pitch| self.pool.is_started(&SoundId::drone(*pitch)))
            .collect()
    }

    /// Selects the drone pitch. While playing, the previous voice is stopped
    /// and the new one started; while stopped, the pitch is only recorded.
    pub fn set_active_voice(&mut self, pitch: PitchClass) {
        self.stop_all_except(Some(pitch));
        self.active = pitch;
        if self.playing {
            self.start_active();
        }
        tracing::debug!(%pitch, playing = self.playing, "drone voice selected");
    }

    /// Starts or stops the drone. Starting is refused until every drone tone
    /// is loaded; the return value reports whether the drone is playing.
    pub fn set_playing(&mut self, playing: bool) -> bool {
        if !playing {
            self.stop_all_except(None);
            self.playing = false;
            return false;
        }

        if !self.is_ready() {
            tracing::debug!("drone start ignored, tones still loading");
            return self.playing;
        }

        self.stop_all_except(Some(self.active));
        self.playing = true;
        self.start_active();
        true
    }

    fn start_active(&self) {
        let id = SoundId::drone(self.active);
        if !self.pool.is_started(&id) {
            self.pool.trigger_and_loop(&id);
        }
    }

    fn stop_all_except(&self, keep: Option<PitchClass>) {
        for pitch in PitchClass::ALL {
            if Some(pitch) != keep {
                self.pool.stop(&SoundId::drone(pitch));
            }
        }
    }
}
