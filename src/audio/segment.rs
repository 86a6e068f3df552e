use std::io::Cursor;

use hound::{SampleFormat, WavReader};

use crate::error::{RecitalError, Result};

use super::resample::{downmix, resample};

/// Sample rate every segment is decoded to.
pub const SAMPLE_RATE: u32 = 24000;

/// Decoded mono audio for one chunk, ready to be scheduled.
#[derive(Debug)]
pub struct AudioSegment {
    pub index: usize,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub duration_secs: f64,
}

impl AudioSegment {
    #[must_use]
    pub fn from_samples(index: usize, samples: Vec<f32>, sample_rate: u32) -> Self {
        let duration_secs = samples.len() as f64 / f64::from(sample_rate);
        Self {
            index,
            samples,
            sample_rate,
            duration_secs,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decode a synthesis payload into a 24kHz mono segment.
///
/// WAV containers are recognized by their `RIFF` header; anything else is
/// taken as raw 16-bit little-endian PCM at 24kHz.
pub fn decode_payload(index: usize, payload: &[u8]) -> Result<AudioSegment> {
    let samples = if payload.starts_with(b"RIFF") {
        decode_wav(payload)?
    } else {
        decode_pcm16(payload)?
    };

    Ok(AudioSegment::from_samples(index, samples, SAMPLE_RATE))
}

fn decode_pcm16(payload: &[u8]) -> Result<Vec<f32>> {
    if payload.len() % 2 != 0 {
        return Err(RecitalError::Decode(format!(
            "PCM payload has odd length {}",
            payload.len()
        )));
    }

    Ok(payload
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect())
}

fn decode_wav(payload: &[u8]) -> Result<Vec<f32>> {
    let reader = WavReader::new(Cursor::new(payload))
        .map_err(|e| RecitalError::Decode(format!("invalid WAV payload: {e}")))?;

    let spec = reader.spec();

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, _) => reader
            .into_samples::<f32>()
            .map(|s| s.map_err(|e| RecitalError::Decode(format!("WAV read error: {e}"))))
            .collect::<Result<Vec<f32>>>()?,
        (SampleFormat::Int, 16) => reader
            .into_samples::<i16>()
            .map(|s| {
                s.map(|v| f32::from(v) / 32768.0)
                    .map_err(|e| RecitalError::Decode(format!("WAV read error: {e}")))
            })
            .collect::<Result<Vec<f32>>>()?,
        (SampleFormat::Int, bits) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| {
                    s.map(|v| v as f32 / scale)
                        .map_err(|e| RecitalError::Decode(format!("WAV read error: {e}")))
                })
                .collect::<Result<Vec<f32>>>()?
        }
    };

    let mono = downmix(&interleaved, spec.channels);

    if spec.sample_rate == SAMPLE_RATE {
        Ok(mono)
    } else {
        tracing::debug!(
            "resampling WAV payload from {}Hz to {SAMPLE_RATE}Hz",
            spec.sample_rate
        );
        resample(&mono, spec.sample_rate, SAMPLE_RATE)
            .map_err(|e| RecitalError::Decode(format!("failed to resample WAV payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use hound::{WavSpec, WavWriter};

    use super::*;

    fn wav_bytes(sample_rate: u32, channels: u16, frames: usize) -> Vec<u8> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap_or_else(|e| panic!("{e}"));
            for _ in 0..frames * channels as usize {
                writer
                    .write_sample(i16::MAX / 2)
                    .unwrap_or_else(|e| panic!("{e}"));
            }
            writer.finalize().unwrap_or_else(|e| panic!("{e}"));
        }
        cursor.into_inner()
    }

    #[test]
    fn one_second_of_pcm() {
        let payload = vec![0u8; 48000];
        let segment = decode_payload(3, &payload).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(segment.index, 3);
        assert_eq!(segment.samples.len(), 24000);
        assert!((segment.duration_secs - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn pcm_sample_scaling() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&i16::MIN.to_le_bytes());
        payload.extend_from_slice(&0i16.to_le_bytes());
        payload.extend_from_slice(&16384i16.to_le_bytes());
        let segment = decode_payload(0, &payload).unwrap_or_else(|e| panic!("{e}"));
        assert!((segment.samples[0] + 1.0).abs() < f32::EPSILON);
        assert!(segment.samples[1].abs() < f32::EPSILON);
        assert!((segment.samples[2] - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn odd_length_pcm_is_decode_error() {
        let err = decode_payload(0, &[1, 2, 3])
            .err()
            .unwrap_or_else(|| panic!("expected decode error"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn wav_mono_24k() {
        let payload = wav_bytes(24000, 1, 12000);
        let segment = decode_payload(0, &payload).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(segment.samples.len(), 12000);
        assert!((segment.duration_secs - 0.5).abs() < 1e-9);
        assert!((segment.samples[0] - 0.5).abs() < 0.001);
    }

    #[test]
    fn wav_stereo_48k_is_normalized() {
        let payload = wav_bytes(48000, 2, 48000);
        let segment = decode_payload(0, &payload).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(segment.sample_rate, SAMPLE_RATE);
        assert_eq!(segment.samples.len(), 24000);
    }

    #[test]
    fn truncated_wav_is_decode_error() {
        let payload = b"RIFF\x10\x00\x00\x00WAVE".to_vec();
        let err = decode_payload(0, &payload)
            .err()
            .unwrap_or_else(|| panic!("expected decode error"));
        assert!(matches!(err, RecitalError::Decode(_)));
    }
}
