//! Background decoding of sound resources.
//!
//! Loading never blocks the caller: jobs go through a channel to a worker
//! thread, which decodes or synthesizes the audio and reports the result back
//! to the pool that queued it.

use std::path::Path;
use std::sync::Weak;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;

use super::pool::PoolShared;
use super::{SampleBuffer, SoundId, SoundSource};
use crate::{MetrodroneError, Result};

pub(crate) struct LoadJob {
    pub id: SoundId,
    /// Registration the job belongs to; stale results are discarded.
    pub token: u64,
    pub source: SoundSource,
}

/// Handle to the loader worker. Dropping it closes the job queue, which lets
/// the worker drain and exit.
pub(crate) struct SampleLoader {
    jobs: Option<Sender<LoadJob>>,
    worker: Option<JoinHandle<()>>,
}

impl SampleLoader {
    pub(crate) fn spawn(sample_rate: u32, pool: Weak<PoolShared>) -> Self {
        let (jobs, rx) = crossbeam_channel::unbounded::<LoadJob>();
        let worker = thread::Builder::new()
            .name("metrodrone-loader".to_string())
            .spawn(move || {
                for job in rx {
                    let result = load_source(&job.source, sample_rate);
                    // The pool may have been dropped while the job was queued.
                    let Some(pool) = pool.upgrade() else { break };
                    pool.finish_load(&job.id, job.token, result);
                }
            })
            .map_err(|err| tracing::error!(%err, "failed to spawn sample loader"))
            .ok();

        Self {
            jobs: Some(jobs),
            worker,
        }
    }

    /// Queues a job; returns it back if the worker is gone.
    pub(crate) fn submit(&self, job: LoadJob) -> std::result::Result<(), LoadJob> {
        match &self.jobs {
            Some(jobs) if self.worker.is_some() => jobs.send(job).map_err(|err| err.into_inner()),
            _ => Err(job),
        }
    }
}

impl Drop for SampleLoader {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            // The last pool handle can be released from the worker itself.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

/// Produces the audio for `source` at `sample_rate`.
pub fn load_source(source: &SoundSource, sample_rate: u32) -> Result<SampleBuffer> {
    match source {
        SoundSource::Wav(path) => decode_wav(path, sample_rate),
        SoundSource::Tone(spec) => Ok(spec.synthesize(sample_rate)),
    }
}

/// Decodes a WAV file into a mono buffer at `target_rate`.
pub fn decode_wav(path: &Path, target_rate: u32) -> Result<SampleBuffer> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 / max))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    let channels = usize::from(spec.channels.max(1));
    let mono: Vec<f32> = if channels == 1 {
        samples
    } else {
        samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    if mono.is_empty() {
        return Err(MetrodroneError::msg(format!(
            "`{}` contains no audio",
            path.display()
        )));
    }

    let data = resample_linear(&mono, spec.sample_rate, target_rate);
    tracing::debug!(path = %path.display(), frames = data.len(), "decoded wav");
    Ok(SampleBuffer {
        sample_rate: target_rate,
        data,
    })
}

fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || source_rate == 0 || target_rate == 0 {
        return samples.to_vec();
    }

    let ratio = f64::from(target_rate) / f64::from(source_rate);
    let out_len = (samples.len() as f64 * ratio).ceil() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let src_pos = i as f64 / ratio;
            let idx = src_pos.floor() as usize;
            if idx >= last {
                samples[last]
            } else {
                let frac = (src_pos - idx as f64) as f32;
                samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
            }
        })
        .collect()
}

/// Writes a mono buffer as 32-bit float WAV.
pub fn write_wav(path: &Path, buffer: &SampleBuffer) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in &buffer.data {
        writer.write_sample(*sample)?;
    }
    writer.finalize()?;
    Ok(())
}
