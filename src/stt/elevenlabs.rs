//! ElevenLabs Scribe STT provider implementation.
//!
//! Uploads from an in-memory WAV buffer. Buffer uploads have been observed
//! to come back truncated or empty on some responses, so the provider can
//! optionally re-upload the same audio from a temporary file
//! (`retry_with_file`).

use super::{
    format_diarized_transcript, scaled_timeout, SttProvider, TranscriptionResult, WordInfo,
};
use crate::audio::AudioData;
use crate::config::ElevenLabsConfig;
use crate::error::{retry_after_from_headers, ApiError};
use crate::resilience::Resilience;
use async_trait::async_trait;
use reqwest::multipart;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const SPEECH_TO_TEXT_URL: &str = "https://api.elevenlabs.io/v1/speech-to-text";

/// ElevenLabs Scribe provider for speech-to-text with diarization.
pub struct ElevenLabsProvider {
    client: reqwest::Client,
    api_key: String,
    config: ElevenLabsConfig,
    resilience: Arc<Resilience>,
    base_timeout: Duration,
}

impl ElevenLabsProvider {
    pub fn new(
        api_key: String,
        config: ElevenLabsConfig,
        resilience: Arc<Resilience>,
        base_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            config,
            resilience,
            base_timeout,
        }
    }

    fn build_form(&self, wav: &[u8]) -> Result<multipart::Form, ApiError> {
        let part = multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| ApiError::InvalidInput(format!("Failed to create multipart: {}", e)))?;

        let mut form = multipart::Form::new()
            .part("file", part)
            .text("model_id", self.config.model_id.clone());

        if self.config.diarize {
            form = form.text("diarize", "true");
            if let Some(num_speakers) = self.config.num_speakers {
                form = form.text("num_speakers", num_speakers.to_string());
            }
        }

        Ok(form)
    }

    /// One raw API attempt; resilience wrapping happens in the callers.
    async fn request(&self, wav: &[u8], timeout: Duration) -> Result<serde_json::Value, ApiError> {
        let response = self
            .client
            .post(SPEECH_TO_TEXT_URL)
            .timeout(timeout)
            .header("xi-api-key", &self.api_key)
            .multipart(self.build_form(wav)?)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_from_headers(response.headers());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let mut err = ApiError::from_status(status, format!("ElevenLabs: {}", body));
            if let ApiError::RateLimit {
                retry_after: hint, ..
            } = &mut err
            {
                *hint = retry_after;
            }
            return Err(err);
        }

        Ok(response.json().await?)
    }

    async fn call_api(&self, audio: &AudioData) -> Result<serde_json::Value, ApiError> {
        let wav = Arc::new(
            audio
                .to_wav_bytes()
                .map_err(|e| ApiError::InvalidInput(e.to_string()))?,
        );
        let timeout = scaled_timeout(self.base_timeout, wav.len());

        let result = self
            .resilience
            .api_call(self.provider_name(), || {
                let wav = Arc::clone(&wav);
                async move { self.request(&wav, timeout).await }
            })
            .await?;

        let text = result["text"].as_str().unwrap_or("");
        if !text.trim().is_empty() || !self.config.retry_with_file {
            return Ok(result);
        }

        // Empty transcript from the buffer upload: route the same bytes
        // through a temp file once before giving up.
        log::warn!("elevenlabs: empty transcript from buffer upload, retrying from temp file");
        let file_bytes = match Self::roundtrip_through_temp_file(&wav) {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::warn!("elevenlabs: temp file fallback unavailable: {}", e);
                return Ok(result);
            }
        };

        self.resilience
            .api_call(self.provider_name(), || {
                let wav = Arc::clone(&file_bytes);
                async move { self.request(&wav, timeout).await }
            })
            .await
    }

    fn roundtrip_through_temp_file(wav: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(wav)?;
        file.flush()?;
        std::fs::read(file.path())
    }

    fn parse_words(result: &serde_json::Value) -> Vec<WordInfo> {
        result["words"]
            .as_array()
            .map(|words| {
                words
                    .iter()
                    .filter(|w| w["type"].as_str() != Some("spacing"))
                    .map(|w| WordInfo {
                        word: w["text"].as_str().unwrap_or("").to_string(),
                        start: w["start"].as_f64(),
                        end: w["end"].as_f64(),
                        speaker: w["speaker_id"]
                            .as_str()
                            .and_then(|s| s.strip_prefix("speaker_"))
                            .and_then(|s| s.parse().ok()),
                        confidence: None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn transcript_from(&self, result: &serde_json::Value) -> (String, Vec<WordInfo>) {
        let words = Self::parse_words(result);
        let text = if self.config.diarize && words.iter().any(|w| w.speaker.is_some()) {
            format_diarized_transcript(&words)
        } else {
            result["text"].as_str().unwrap_or("").trim().to_string()
        };
        (text, words)
    }
}

#[async_trait]
impl SttProvider for ElevenLabsProvider {
    fn provider_name(&self) -> &'static str {
        "elevenlabs"
    }

    fn supports_diarization(&self) -> bool {
        true
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn transcribe(&self, audio: &AudioData) -> Result<String, ApiError> {
        let result = self.call_api(audio).await?;
        let (text, _) = self.transcript_from(&result);
        Ok(text)
    }

    async fn transcribe_with_result(&self, audio: &AudioData) -> TranscriptionResult {
        let value = match self.call_api(audio).await {
            Ok(value) => value,
            Err(err) => {
                log::error!("elevenlabs: transcription failed: {}", err);
                return TranscriptionResult::failure_result(err.to_string());
            }
        };

        let (text, words) = self.transcript_from(&value);
        if text.is_empty() {
            return TranscriptionResult::failure_result("Transcription returned empty result");
        }

        let mut result = TranscriptionResult::success_result(text)
            .with_duration(audio.approx_duration_secs());
        result.confidence = value["language_probability"].as_f64();
        result.words = words;
        result.metadata.insert(
            "model_id".to_string(),
            serde_json::Value::String(self.config.model_id.clone()),
        );
        if let Some(language) = value["language_code"].as_str() {
            result.metadata.insert(
                "language_code".to_string(),
                serde_json::Value::String(language.to_string()),
            );
        }
        result
    }
}
