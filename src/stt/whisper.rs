//! Local Whisper STT provider (whisper.cpp bindings).
//!
//! Final fallback in the failover chain: runs fully offline and requires
//! no API key, only a downloaded model file. Expects 16 kHz audio.

use super::SttProvider;
use crate::audio::AudioData;
use crate::error::ApiError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

const EXPECTED_SAMPLE_RATE: u32 = 16_000;

/// Local Whisper provider backed by whisper.cpp.
pub struct LocalWhisperProvider {
    context: Arc<WhisperContext>,
    model_path: PathBuf,
}

impl LocalWhisperProvider {
    /// Load the model at `model_path`. Fails when the file is missing or
    /// not a valid ggml model.
    pub fn new(model_path: PathBuf) -> Result<Self, ApiError> {
        let context = WhisperContext::new_with_params(
            &model_path.to_string_lossy(),
            WhisperContextParameters::default(),
        )
        .map_err(|e| {
            ApiError::InvalidInput(format!(
                "Failed to load Whisper model {}: {}",
                model_path.display(),
                e
            ))
        })?;

        Ok(Self {
            context: Arc::new(context),
            model_path,
        })
    }

    pub fn model_path(&self) -> &PathBuf {
        &self.model_path
    }

    /// Normalize the payload to mono f32 samples at 16 kHz.
    fn to_mono_f32(audio: &AudioData) -> Result<Vec<f32>, ApiError> {
        match audio {
            AudioData::Pcm {
                samples,
                sample_rate,
                channels,
            } => {
                if *sample_rate != EXPECTED_SAMPLE_RATE {
                    return Err(ApiError::InvalidInput(format!(
                        "Local Whisper expects {} Hz audio, got {} Hz",
                        EXPECTED_SAMPLE_RATE, sample_rate
                    )));
                }
                Ok(downmix(samples, *channels as usize))
            }
            AudioData::Wav(bytes) => {
                let mut reader = hound::WavReader::new(std::io::Cursor::new(bytes))
                    .map_err(|e| ApiError::InvalidInput(format!("Invalid WAV payload: {}", e)))?;
                let spec = reader.spec();
                if spec.sample_rate != EXPECTED_SAMPLE_RATE {
                    return Err(ApiError::InvalidInput(format!(
                        "Local Whisper expects {} Hz audio, got {} Hz",
                        EXPECTED_SAMPLE_RATE, spec.sample_rate
                    )));
                }
                let samples: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
                let samples = samples
                    .map_err(|e| ApiError::InvalidInput(format!("Invalid WAV payload: {}", e)))?;
                Ok(downmix(&samples, spec.channels as usize))
            }
        }
    }
}

fn downmix(samples: &[i16], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.iter().map(|&s| s as f32 / 32768.0).collect();
    }
    samples
        .chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| s as f32 / 32768.0).sum();
            sum / frame.len() as f32
        })
        .collect()
}

#[async_trait]
impl SttProvider for LocalWhisperProvider {
    fn provider_name(&self) -> &'static str {
        "whisper"
    }

    fn requires_api_key(&self) -> bool {
        false
    }

    fn is_configured(&self) -> bool {
        // The model loaded at construction time.
        true
    }

    async fn transcribe(&self, audio: &AudioData) -> Result<String, ApiError> {
        let samples = Self::to_mono_f32(audio)?;
        let context = Arc::clone(&self.context);

        // whisper.cpp inference is CPU-bound; keep it off the async runtime.
        let text = tokio::task::spawn_blocking(move || -> Result<String, ApiError> {
            let mut state = context
                .create_state()
                .map_err(|e| ApiError::ServiceUnavailable(format!("Whisper state: {}", e)))?;

            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_print_special(false);

            state
                .full(params, &samples)
                .map_err(|e| ApiError::ServiceUnavailable(format!("Whisper inference: {}", e)))?;

            let segments = state
                .full_n_segments()
                .map_err(|e| ApiError::ServiceUnavailable(format!("Whisper segments: {}", e)))?;

            let mut text = String::new();
            for i in 0..segments {
                if let Ok(segment) = state.full_get_segment_text(i) {
                    text.push_str(segment.trim());
                    text.push(' ');
                }
            }
            Ok(text.trim().to_string())
        })
        .await
        .map_err(|e| ApiError::ServiceUnavailable(format!("Whisper task failed: {}", e)))??;

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo_averages_frames() {
        let samples = vec![16384i16, -16384, 8192, 8192];
        let mono = downmix(&samples, 2);
        assert_eq!(mono.len(), 2);
        assert!(mono[0].abs() < 0.001);
        assert!((mono[1] - 0.25).abs() < 0.001);
    }

    #[test]
    fn test_rejects_wrong_sample_rate() {
        let audio = AudioData::Pcm {
            samples: vec![0; 100],
            sample_rate: 44_100,
            channels: 1,
        };
        assert!(matches!(
            LocalWhisperProvider::to_mono_f32(&audio),
            Err(ApiError::InvalidInput(_))
        ));
    }
}
