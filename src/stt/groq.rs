//! Groq Whisper API STT provider implementation.

use super::{scaled_timeout, SttProvider};
use crate::audio::AudioData;
use crate::config::api_key_from_env;
use crate::error::{retry_after_from_headers, ApiError};
use crate::resilience::Resilience;
use async_trait::async_trait;
use reqwest::multipart;
use std::sync::Arc;
use std::time::Duration;

const TRANSCRIPTIONS_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const DEFAULT_MODEL: &str = "whisper-large-v3-turbo";

/// Groq Whisper API provider for speech-to-text.
pub struct GroqProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    resilience: Arc<Resilience>,
    base_timeout: Duration,
}

impl GroqProvider {
    pub fn new(
        api_key: String,
        model: Option<String>,
        resilience: Arc<Resilience>,
        base_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            resilience,
            base_timeout,
        }
    }

    /// Create a provider reading its key from `GROQ_API_KEY`.
    pub fn from_env(resilience: Arc<Resilience>, base_timeout: Duration) -> Self {
        Self::new(
            api_key_from_env("groq").unwrap_or_default(),
            None,
            resilience,
            base_timeout,
        )
    }

    /// One raw API attempt; resilience wrapping happens in `transcribe`.
    async fn request(&self, wav: &[u8], timeout: Duration) -> Result<serde_json::Value, ApiError> {
        let part = multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| ApiError::InvalidInput(format!("Failed to create multipart: {}", e)))?;

        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "json");

        let response = self
            .client
            .post(TRANSCRIPTIONS_URL)
            .timeout(timeout)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_from_headers(response.headers());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let mut err = ApiError::from_status(status, format!("Groq: {}", body));
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
}

#[async_trait]
impl SttProvider for GroqProvider {
    fn provider_name(&self) -> &'static str {
        "groq"
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn transcribe(&self, audio: &AudioData) -> Result<String, ApiError> {
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

        Ok(result["text"].as_str().unwrap_or("").trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;

    #[test]
    fn test_provider_creation() {
        let provider = GroqProvider::new(
            "test-key".to_string(),
            None,
            Arc::new(Resilience::new(&ApiConfig::default())),
            Duration::from_secs(60),
        );
        assert_eq!(provider.provider_name(), "groq");
        assert_eq!(provider.model, DEFAULT_MODEL);
        assert!(provider.requires_api_key());
        assert!(provider.is_configured());
    }

    #[test]
    fn test_provider_with_custom_model() {
        let provider = GroqProvider::new(
            "test-key".to_string(),
            Some("distil-whisper-large-v3-en".to_string()),
            Arc::new(Resilience::new(&ApiConfig::default())),
            Duration::from_secs(60),
        );
        assert_eq!(provider.model, "distil-whisper-large-v3-en");
    }
}
