//! Audio payload handling for recording submissions.
//!
//! Submitted audio arrives either as already-encoded WAV bytes or as raw
//! PCM samples from a capture layer. Providers upload from an in-memory
//! WAV buffer, so both shapes normalize through [`AudioData::to_wav_bytes`].

use hound::{WavSpec, WavWriter};
use std::io::Cursor;

/// Errors that can occur while preparing audio for upload.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Audio encoding error: {0}")]
    Encoding(String),

    #[error("Empty audio payload")]
    Empty,
}

/// Audio attached to a recording submission.
#[derive(Debug, Clone)]
pub enum AudioData {
    /// Pre-encoded WAV bytes, uploaded as-is.
    Wav(Vec<u8>),
    /// Raw interleaved 16-bit PCM samples, encoded on demand.
    Pcm {
        samples: Vec<i16>,
        sample_rate: u32,
        channels: u16,
    },
}

impl AudioData {
    /// Produce WAV bytes suitable for a provider upload.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, AudioError> {
        match self {
            AudioData::Wav(bytes) => {
                if bytes.is_empty() {
                    return Err(AudioError::Empty);
                }
                Ok(bytes.clone())
            }
            AudioData::Pcm {
                samples,
                sample_rate,
                channels,
            } => {
                if samples.is_empty() {
                    return Err(AudioError::Empty);
                }

                let spec = WavSpec {
                    channels: *channels,
                    sample_rate: *sample_rate,
                    bits_per_sample: 16,
                    sample_format: hound::SampleFormat::Int,
                };

                let mut cursor = Cursor::new(Vec::new());
                {
                    let mut writer = WavWriter::new(&mut cursor, spec)
                        .map_err(|e| AudioError::Encoding(e.to_string()))?;
                    for &sample in samples {
                        writer
                            .write_sample(sample)
                            .map_err(|e| AudioError::Encoding(e.to_string()))?;
                    }
                    writer
                        .finalize()
                        .map_err(|e| AudioError::Encoding(e.to_string()))?;
                }
                Ok(cursor.into_inner())
            }
        }
    }

    /// Payload size in bytes, used for timeout scaling.
    pub fn byte_len(&self) -> usize {
        match self {
            AudioData::Wav(bytes) => bytes.len(),
            // 16-bit samples, ignoring the 44-byte header.
            AudioData::Pcm { samples, .. } => samples.len() * 2,
        }
    }

    /// Approximate audio duration, if derivable from the payload shape.
    pub fn approx_duration_secs(&self) -> Option<f64> {
        match self {
            AudioData::Wav(_) => None,
            AudioData::Pcm {
                samples,
                sample_rate,
                channels,
            } => {
                if *sample_rate == 0 || *channels == 0 {
                    return None;
                }
                Some(samples.len() as f64 / (*sample_rate as f64 * *channels as f64))
            }
        }
    }

    /// Mono 16 kHz silence of the given length, handy for connection tests.
    pub fn silence(duration_secs: f64) -> Self {
        let sample_rate = 16_000u32;
        let count = (sample_rate as f64 * duration_secs).max(1.0) as usize;
        AudioData::Pcm {
            samples: vec![0i16; count],
            sample_rate,
            channels: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_to_wav_roundtrip() {
        let audio = AudioData::Pcm {
            samples: vec![0, 100, -100, 3000],
            sample_rate: 16_000,
            channels: 1,
        };
        let wav = audio.to_wav_bytes().unwrap();

        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 100, -100, 3000]);
    }

    #[test]
    fn test_empty_payloads_rejected() {
        assert!(matches!(
            AudioData::Wav(Vec::new()).to_wav_bytes(),
            Err(AudioError::Empty)
        ));
        assert!(matches!(
            AudioData::Pcm {
                samples: Vec::new(),
                sample_rate: 16_000,
                channels: 1
            }
            .to_wav_bytes(),
            Err(AudioError::Empty)
        ));
    }

    #[test]
    fn test_duration_estimate() {
        let audio = AudioData::silence(1.0);
        let duration = audio.approx_duration_secs().unwrap();
        assert!((duration - 1.0).abs() < 0.01);
    }
}
