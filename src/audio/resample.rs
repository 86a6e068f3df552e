use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::audioadapter::Adapter;
use rubato::{Fft, FixedSync, Resampler as RubatoResampler};

use crate::error::{RecitalError, Result};

const CHUNK_SIZE: usize = 1024;

/// Mix interleaved multi-channel samples down to mono.
#[must_use]
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    let ch = channels as usize;
    interleaved
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Converts mono audio from one sample rate to another.
///
/// The filter delay is compensated: output frame `n` lines up with input time
/// `n / target_rate`, and `finish` flushes the tail so the total output length
/// is `input_len * target_rate / source_rate`.
pub struct Resampler {
    inner: Option<Fft<f32>>,
    input_buf: Vec<f32>,
    source_rate: u32,
    target_rate: u32,
    /// Leading output frames still to discard.
    skip: usize,
    frames_in: u64,
    frames_out: u64,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self> {
        let inner = if source_rate == target_rate {
            None
        } else {
            Some(
                Fft::new(
                    source_rate as usize,
                    target_rate as usize,
                    CHUNK_SIZE,
                    2, // sub_chunks
                    1,
                    FixedSync::Input,
                )
                .map_err(|e| RecitalError::Resample(format!("failed to create resampler: {e}")))?,
            )
        };
        let skip = inner.as_ref().map_or(0, |r| r.output_delay());

        Ok(Self {
            inner,
            input_buf: Vec::new(),
            source_rate,
            target_rate,
            skip,
            frames_in: 0,
            frames_out: 0,
        })
    }

    /// Feed mono samples and return whatever output is ready.
    pub fn process(&mut self, mono: &[f32]) -> Result<Vec<f32>> {
        if self.inner.is_none() {
            return Ok(mono.to_vec());
        }

        self.input_buf.extend_from_slice(mono);
        self.frames_in += mono.len() as u64;

        let output = self.drain()?;
        self.frames_out += output.len() as u64;
        Ok(output)
    }

    /// Flush the filter with silence and return the rest of the output.
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        let Some(frames_needed) = self.inner.as_ref().map(|r| r.input_frames_next()) else {
            return Ok(Vec::new());
        };

        let total = self.frames_in * u64::from(self.target_rate) / u64::from(self.source_rate);
        let owed = total.saturating_sub(self.frames_out) as usize;

        let mut output = Vec::with_capacity(owed);
        while output.len() < owed {
            let padding = frames_needed - self.input_buf.len() % frames_needed;
            self.input_buf.resize(self.input_buf.len() + padding, 0.0);
            output.extend(self.drain()?);
        }
        output.truncate(owed);

        self.frames_out += output.len() as u64;
        Ok(output)
    }

    /// Run every complete chunk of pending input through the filter.
    fn drain(&mut self) -> Result<Vec<f32>> {
        let Some(ref mut resampler) = self.inner else {
            return Ok(Vec::new());
        };

        let mut output = Vec::new();
        let frames_needed = resampler.input_frames_next();

        while self.input_buf.len() >= frames_needed {
            let chunk: Vec<f32> = self.input_buf.drain(..frames_needed).collect();
            let input_data = vec![chunk];
            let input_buf = SequentialSliceOfVecs::new(&input_data, 1, frames_needed)
                .map_err(|e| RecitalError::Resample(format!("buffer error: {e}")))?;
            let result = resampler
                .process(&input_buf, 0, None)
                .map_err(|e| RecitalError::Resample(format!("resample error: {e}")))?;
            let out_frames = result.frames();
            for frame in 0..out_frames {
                output.push(result.read_sample(0, frame).unwrap_or(0.0));
            }
        }

        let skipped = self.skip.min(output.len());
        output.drain(..skipped);
        self.skip -= skipped;

        Ok(output)
    }
}

/// Resample a complete mono buffer.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if source_rate == target_rate {
        return Ok(samples.to_vec());
    }

    let mut resampler = Resampler::new(source_rate, target_rate)?;
    let mut output = resampler.process(samples)?;
    output.extend(resampler.finish()?);
    Ok(output)
}
