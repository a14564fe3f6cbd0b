//! Output stage the sound pool submits cues to.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{SampleBuffer, SoundId};

/// Release applied when a voice is stopped, in milliseconds.
const RELEASE_MS: f32 = 20.0;

/// Instruction from the pool to the output stage.
#[derive(Debug, Clone)]
pub enum Cue {
    Play {
        id: SoundId,
        buffer: Arc<SampleBuffer>,
        gain: f32,
        /// Clock time the sound should become audible; `None` means now.
        at: Option<Duration>,
        looping: bool,
    },
    Stop {
        id: SoundId,
    },
    Gain {
        id: SoundId,
        gain: f32,
    },
}

/// Anything able to turn cues into sound.
pub trait SoundOutput: Send {
    fn submit(&mut self, cue: Cue);
}

impl<T: SoundOutput> SoundOutput for Arc<Mutex<T>> {
    fn submit(&mut self, cue: Cue) {
        match self.lock() {
            Ok(mut output) => output.submit(cue),
            Err(_) => tracing::error!("sound output lock has been poisoned"),
        }
    }
}

/// Output that only reports cues through `tracing`. Useful when no audio
/// device is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingOutput;

impl SoundOutput for TracingOutput {
    fn submit(&mut self, cue: Cue) {
        match cue {
            Cue::Play {
                id, gain, at, looping, ..
            } => tracing::info!(%id, gain, ?at, looping, "play"),
            Cue::Stop { id } => tracing::info!(%id, "stop"),
            Cue::Gain { id, gain } => tracing::debug!(%id, gain, "gain"),
        }
    }
}

/// Record of a one-shot or looped playback request.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayedCue {
    pub id: SoundId,
    pub at: Option<Duration>,
    pub looping: bool,
}

#[derive(Debug)]
struct ActiveVoice {
    id: SoundId,
    buffer: Arc<SampleBuffer>,
    gain: f32,
    start_frame: u64,
    position: usize,
    looping: bool,
    /// Remaining and total release frames once the voice is stopping.
    release: Option<(usize, usize)>,
}

/// Sample-accurate software mixer.
///
/// Cues carrying a clock time start on the frame that time maps to, so the
/// mixer's frame 0 corresponds to the clock's time origin. Cues for a time
/// already rendered start on the next rendered frame.
#[derive(Debug)]
pub struct Mixer {
    sample_rate: u32,
    frame: u64,
    voices: Vec<ActiveVoice>,
    history: Vec<PlayedCue>,
    stops: Vec<SoundId>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            frame: 0,
            voices: Vec::new(),
            history: Vec::new(),
            stops: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Every play request received, in submission order.
    pub fn played(&self) -> &[PlayedCue] {
        &self.history
    }

    /// Every stop request received, in submission order.
    pub fn stopped(&self) -> &[SoundId] {
        &self.stops
    }

    /// Number of voices still sounding (or scheduled to).
    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Mixes the next `out.len()` frames into `out`, overwriting it.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let block_start = self.frame;

        for voice in &mut self.voices {
            for (offset, sample) in out.iter_mut().enumerate() {
                let global = block_start + offset as u64;
                if global < voice.start_frame {
                    continue;
                }
                let Some(value) = voice.next_sample() else {
                    break;
                };
                *sample += value;
            }
        }

        self.voices.retain(|voice| !voice.finished());
        self.frame += out.len() as u64;
    }

    /// Renders `duration` worth of audio into a new buffer.
    pub fn render_duration(&mut self, duration: Duration) -> SampleBuffer {
        let frames = (duration.as_secs_f64() * f64::from(self.sample_rate)).round() as usize;
        let mut data = vec![0.0; frames];
        self.render(&mut data);
        SampleBuffer {
            sample_rate: self.sample_rate,
            data,
        }
    }

    fn frame_for(&self, at: Option<Duration>) -> u64 {
        at.map(|time| (time.as_secs_f64() * f64::from(self.sample_rate)).round() as u64)
            .map_or(self.frame, |frame| frame.max(self.frame))
    }
}

impl ActiveVoice {
    fn next_sample(&mut self) -> Option<f32> {
        if self.finished() {
            return None;
        }
        if self.position >= self.buffer.len() {
            if !self.looping {
                return None;
            }
            self.position = 0;
        }

        let mut value = self.buffer.data[self.position] * self.gain;
        self.position += 1;

        if let Some((remaining, total)) = self.release.as_mut() {
            value *= *remaining as f32 / (*total).max(1) as f32;
            *remaining = remaining.saturating_sub(1);
        }
        Some(value)
    }

    fn finished(&self) -> bool {
        let released = matches!(self.release, Some((0, _)));
        let exhausted = !self.looping && self.position >= self.buffer.len();
        released || exhausted || self.buffer.is_empty()
    }
}

impl SoundOutput for Mixer {
    fn submit(&mut self, cue: Cue) {
        match cue {
            Cue::Play {
                id,
                buffer,
                gain,
                at,
                looping,
            } => {
                self.history.push(PlayedCue {
                    id: id.clone(),
                    at,
                    looping,
                });
                let start_frame = self.frame_for(at);
                self.voices.push(ActiveVoice {
                    id,
                    buffer,
                    gain,
                    start_frame,
                    position: 0,
                    looping,
                    release: None,
                });
            }
            Cue::Stop { id } => {
                let release = ((RELEASE_MS / 1000.0) * self.sample_rate as f32) as usize;
                for voice in self.voices.iter_mut().filter(|v| v.id == id) {
                    if voice.release.is_none() {
                        voice.release = Some((release, release));
                    }
                }
                self.stops.push(id);
            }
            Cue::Gain { id, gain } => {
                for voice in self.voices.iter_mut().filter(|v| v.id == id) {
                    voice.gain = gain;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(len: usize) -> Arc<SampleBuffer> {
        Arc::new(SampleBuffer {
            sample_rate: 1000,
            data: vec![1.0; len],
        })
    }

    fn play(id: &str, len: usize, at: Option<Duration>, looping: bool) -> Cue {
        Cue::Play {
            id: SoundId::from(id),
            buffer: constant(len),
            gain: 0.5,
            at,
            looping,
        }
    }

    #[test]
    fn places_cues_on_their_frame() {
        let mut mixer = Mixer::new(1000);
        mixer.submit(play("click", 3, Some(Duration::from_millis(5)), false));

        let mut out = vec![0.0; 10];
        mixer.render(&mut out);

        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.5, 0.5, 0.0, 0.0]);
        assert_eq!(mixer.active_voices(), 0);
    }

    #[test]
    fn voices_spanning_blocks_continue() {
        let mut mixer = Mixer::new(1000);
        mixer.submit(play("click", 6, Some(Duration::from_millis(2)), false));

        let mut first = vec![0.0; 4];
        let mut second = vec![0.0; 6];
        mixer.render(&mut first);
        mixer.render(&mut second);

        assert_eq!(first, vec![0.0, 0.0, 0.5, 0.5]);
        assert_eq!(second, vec![0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn stop_releases_looping_voice() {
        let mut mixer = Mixer::new(1000);
        mixer.submit(play("drone-A", 4, None, true));

        let mut out = vec![0.0; 100];
        mixer.render(&mut out);
        assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-6));

        mixer.submit(Cue::Stop {
            id: SoundId::from("drone-A"),
        });
        mixer.render(&mut out);

        assert!(out[0] > 0.4);
        assert!(out[10] < out[0]);
        assert_eq!(out[30], 0.0);
        assert_eq!(mixer.active_voices(), 0);
        assert_eq!(mixer.stopped(), &[SoundId::from("drone-A")]);
    }

    #[test]
    fn gain_cue_updates_sounding_voice() {
        let mut mixer = Mixer::new(1000);
        mixer.submit(play("drone-C", 4, None, true));
        mixer.submit(Cue::Gain {
            id: SoundId::from("drone-C"),
            gain: 0.25,
        });

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert_eq!(out, vec![0.25; 4]);
    }

    #[test]
    fn late_cues_start_immediately() {
        let mut mixer = Mixer::new(1000);
        let mut out = vec![0.0; 10];
        mixer.render(&mut out);

        mixer.submit(play("click", 2, Some(Duration::from_millis(3)), false));
        mixer.render(&mut out);
        assert_eq!(&out[..3], &[0.5, 0.5, 0.0]);
        assert_eq!(mixer.played()[0].at, Some(Duration::from_millis(3)));
    }
}
