//! Deepgram STT provider implementation.
//!
//! Uses the prerecorded listen endpoint with the medical-grade nova-2
//! model family. Supports optional speaker diarization.

use super::{
    format_diarized_transcript, scaled_timeout, SttProvider, TranscriptionResult, WordInfo,
};
use crate::audio::AudioData;
use crate::config::DeepgramConfig;
use crate::error::{retry_after_from_headers, ApiError};
use crate::resilience::Resilience;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;

const LISTEN_URL: &str = "https://api.deepgram.com/v1/listen";

/// Deepgram API provider for speech-to-text.
pub struct DeepgramProvider {
    client: reqwest::Client,
    api_key: String,
    config: DeepgramConfig,
    resilience: Arc<Resilience>,
    base_timeout: Duration,
}

impl DeepgramProvider {
    pub fn new(
        api_key: String,
        config: DeepgramConfig,
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

    /// Create a provider with a custom HTTP client (for tests).
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn with_client(
        client: reqwest::Client,
        api_key: String,
        config: DeepgramConfig,
        resilience: Arc<Resilience>,
        base_timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_key,
            config,
            resilience,
            base_timeout,
        }
    }

    /// Build the listen URL with model and formatting query parameters.
    fn listen_url(&self) -> Result<Url, ApiError> {
        let mut url = Url::parse(LISTEN_URL)
            .map_err(|e| ApiError::InvalidInput(format!("Invalid Deepgram base URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("model", &self.config.model)
            .append_pair("smart_format", if self.config.smart_format { "true" } else { "false" })
            .append_pair("punctuate", "true")
            .append_pair("diarize", if self.config.diarize { "true" } else { "false" });

        Ok(url)
    }

    /// One raw API attempt; retries and circuit breaking live in the
    /// resilience layer above.
    async fn request(&self, wav: &[u8], timeout: Duration) -> Result<serde_json::Value, ApiError> {
        let response = self
            .client
            .post(self.listen_url()?)
            .timeout(timeout)
            .header(AUTHORIZATION, format!("Token {}", self.api_key))
            .header(CONTENT_TYPE, "audio/wav")
            .body(wav.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_from_headers(response.headers());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let mut err = ApiError::from_status(status, format!("Deepgram: {}", body));
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

        self.resilience
            .api_call(self.provider_name(), || {
                let wav = Arc::clone(&wav);
                async move { self.request(&wav, timeout).await }
            })
            .await
    }

    fn parse_words(alternative: &serde_json::Value) -> Vec<WordInfo> {
        alternative["words"]
            .as_array()
            .map(|words| {
                words
                    .iter()
                    .map(|w| WordInfo {
                        word: w["punctuated_word"]
                            .as_str()
                            .or_else(|| w["word"].as_str())
                            .unwrap_or("")
                            .to_string(),
                        start: w["start"].as_f64(),
                        end: w["end"].as_f64(),
                        speaker: w["speaker"].as_u64().map(|s| s as u32),
                        confidence: w["confidence"].as_f64(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn transcript_from(&self, result: &serde_json::Value) -> (String, Option<f64>, Vec<WordInfo>) {
        // Response structure:
        // { "results": { "channels": [{ "alternatives": [{ "transcript": ..., "words": [...] }] }] } }
        let alternative = &result["results"]["channels"][0]["alternatives"][0];
        let words = Self::parse_words(alternative);
        let confidence = alternative["confidence"].as_f64();

        let text = if self.config.diarize && words.iter().any(|w| w.speaker.is_some()) {
            format_diarized_transcript(&words)
        } else {
            alternative["transcript"].as_str().unwrap_or("").to_string()
        };

        (text, confidence, words)
    }
}

#[async_trait]
impl SttProvider for DeepgramProvider {
    fn provider_name(&self) -> &'static str {
        "deepgram"
    }

    fn supports_diarization(&self) -> bool {
        true
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn transcribe(&self, audio: &AudioData) -> Result<String, ApiError> {
        let result = self.call_api(audio).await?;
        let (text, _, _) = self.transcript_from(&result);
        Ok(text)
    }

    async fn transcribe_with_result(&self, audio: &AudioData) -> TranscriptionResult {
        let value = match self.call_api(audio).await {
            Ok(value) => value,
            Err(err) => {
                log::error!("deepgram: transcription failed: {}", err);
                return TranscriptionResult::failure_result(err.to_string());
            }
        };

        let (text, confidence, words) = self.transcript_from(&value);
        if text.is_empty() {
            return TranscriptionResult::failure_result("Transcription returned empty result");
        }

        let mut result = TranscriptionResult::success_result(text)
            .with_duration(audio.approx_duration_secs());
        result.confidence = confidence;
        result.words = words;
        result.metadata.insert(
            "model".to_string(),
            serde_json::Value::String(self.config.model.clone()),
        );
        result
    }
}
