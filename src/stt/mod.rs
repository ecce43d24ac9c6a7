//! Speech-to-Text (STT) provider abstraction and implementations.
//!
//! This module provides a trait-based abstraction for STT providers plus a
//! failover manager that tries providers in declared order and tracks
//! per-provider health.

mod deepgram;
mod elevenlabs;
mod failover;
mod groq;

#[cfg(feature = "local-whisper")]
mod whisper;

pub use deepgram::DeepgramProvider;
pub use elevenlabs::ElevenLabsProvider;
pub use failover::{default_provider_chain, ProviderStatus, SttFailoverManager};
pub use groq::GroqProvider;

#[cfg(feature = "local-whisper")]
pub use whisper::LocalWhisperProvider;

use crate::audio::AudioData;
use crate::error::ApiError;
use async_trait::async_trait;
use std::time::Duration;

/// Word-level transcription data, populated by providers that return it.
#[derive(Debug, Clone)]
pub struct WordInfo {
    pub word: String,
    pub start: Option<f64>,
    pub end: Option<f64>,
    /// Speaker id when the provider diarized the audio.
    pub speaker: Option<u32>,
    pub confidence: Option<f64>,
}

/// Structured result from a transcription operation.
///
/// Provides a consistent shape across providers, including failover
/// metadata and error information.
#[derive(Debug, Clone, Default)]
pub struct TranscriptionResult {
    pub text: String,
    pub success: bool,
    pub error: Option<String>,
    /// Confidence score (0.0-1.0) if the provider reports one.
    pub confidence: Option<f64>,
    pub duration_seconds: Option<f64>,
    pub words: Vec<WordInfo>,
    /// Provider-specific extras; the failover manager adds `provider` and
    /// `failover_attempts` here.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TranscriptionResult {
    pub fn success_result(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            success: true,
            ..Default::default()
        }
    }

    pub fn failure_result(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration_seconds: Option<f64>) -> Self {
        self.duration_seconds = duration_seconds;
        self
    }

    /// Provider recorded by the failover manager, if any.
    pub fn provider(&self) -> Option<&str> {
        self.metadata.get("provider").and_then(|v| v.as_str())
    }
}

/// Trait for Speech-to-Text providers.
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Unique lowercase identifier (e.g. "deepgram").
    fn provider_name(&self) -> &'static str;

    /// Whether this provider can label different speakers.
    fn supports_diarization(&self) -> bool {
        false
    }

    /// Whether an API key is required. Local providers override to `false`.
    fn requires_api_key(&self) -> bool {
        true
    }

    /// Whether the provider has everything it needs to be called.
    fn is_configured(&self) -> bool;

    /// Check that the provider is usable. Never returns an error.
    async fn test_connection(&self) -> bool {
        if self.requires_api_key() && !self.is_configured() {
            log::warn!("{}: API key not configured", self.provider_name());
            return false;
        }
        true
    }

    /// Transcribe audio to text.
    ///
    /// Returns an empty string for soft failures (e.g. silence); errors are
    /// reserved for failed calls.
    async fn transcribe(&self, audio: &AudioData) -> Result<String, ApiError>;

    /// Transcribe audio and return a structured result.
    ///
    /// The default wraps [`SttProvider::transcribe`]; providers with
    /// word-level output override it.
    async fn transcribe_with_result(&self, audio: &AudioData) -> TranscriptionResult {
        match self.transcribe(audio).await {
            Ok(text) if !text.is_empty() => TranscriptionResult::success_result(text)
                .with_duration(audio.approx_duration_secs()),
            Ok(_) => TranscriptionResult::failure_result("Transcription returned empty result"),
            Err(err) => {
                log::error!("{}: transcription failed: {}", self.provider_name(), err);
                TranscriptionResult::failure_result(err.to_string())
            }
        }
    }
}

/// Scale a provider call timeout with the upload size:
/// `max(base, audio_kb / 500 × 60s)`.
pub fn scaled_timeout(base: Duration, audio_bytes: usize) -> Duration {
    let audio_kb = audio_bytes as f64 / 1024.0;
    let scaled = Duration::from_secs_f64(audio_kb / 500.0 * 60.0);
    base.max(scaled)
}

/// Group diarized words into paragraphs labeled `Speaker <id>:`.
///
/// Consecutive words from the same speaker join into one paragraph; words
/// without speaker information are skipped.
pub fn format_diarized_transcript(words: &[WordInfo]) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current_speaker: Option<u32> = None;
    let mut current_words: Vec<&str> = Vec::new();

    for info in words {
        let Some(speaker) = info.speaker else {
            continue;
        };

        if current_speaker != Some(speaker) {
            if let Some(prev) = current_speaker {
                if !current_words.is_empty() {
                    paragraphs.push(format!("Speaker {}: {}", prev, current_words.join(" ")));
                }
            }
            current_speaker = Some(speaker);
            current_words.clear();
        }

        if !info.word.trim().is_empty() {
            current_words.push(info.word.trim());
        }
    }

    if let Some(prev) = current_speaker {
        if !current_words.is_empty() {
            paragraphs.push(format!("Speaker {}: {}", prev, current_words.join(" ")));
        }
    }

    paragraphs.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct MockProvider;

    #[async_trait]
    impl SttProvider for MockProvider {
        fn provider_name(&self) -> &'static str {
            "mock"
        }

        fn is_configured(&self) -> bool {
            true
        }

        async fn transcribe(&self, _audio: &AudioData) -> Result<String, ApiError> {
            Ok("test transcript".to_string())
        }
    }

    struct EmptyProvider;

    #[async_trait]
    impl SttProvider for EmptyProvider {
        fn provider_name(&self) -> &'static str {
            "empty"
        }

        fn is_configured(&self) -> bool {
            true
        }

        async fn transcribe(&self, _audio: &AudioData) -> Result<String, ApiError> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_default_with_result_wraps_transcribe() {
        let provider: Arc<dyn SttProvider> = Arc::new(MockProvider);
        let result = provider
            .transcribe_with_result(&AudioData::silence(0.5))
            .await;
        assert!(result.success);
        assert_eq!(result.text, "test transcript");
        assert!(result.duration_seconds.is_some());
    }

    #[tokio::test]
    async fn test_empty_transcript_is_soft_failure() {
        let provider: Arc<dyn SttProvider> = Arc::new(EmptyProvider);
        let result = provider
            .transcribe_with_result(&AudioData::silence(0.5))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn test_connection_test_never_errors_without_key() {
        struct Unconfigured;

        #[async_trait]
        impl SttProvider for Unconfigured {
            fn provider_name(&self) -> &'static str {
                "unconfigured"
            }

            fn is_configured(&self) -> bool {
                false
            }

            async fn transcribe(&self, _audio: &AudioData) -> Result<String, ApiError> {
                Err(ApiError::Authentication("no key".into()))
            }
        }

        assert!(!Unconfigured.test_connection().await);
    }

    #[test]
    fn test_scaled_timeout_grows_with_audio_size() {
        let base = Duration::from_secs(60);
        // Small upload keeps the base timeout.
        assert_eq!(scaled_timeout(base, 100 * 1024), base);
        // 1000 KB → 2 minutes.
        assert_eq!(
            scaled_timeout(base, 1000 * 1024),
            Duration::from_secs_f64(120.0)
        );
    }

    #[test]
    fn test_diarized_formatting_groups_speakers() {
        let word = |w: &str, speaker: Option<u32>| WordInfo {
            word: w.to_string(),
            start: None,
            end: None,
            speaker,
            confidence: None,
        };

        let words = vec![
            word("Hello", Some(0)),
            word("there.", Some(0)),
            word("Hi", Some(1)),
            word("doctor.", Some(1)),
            word("Sit", Some(0)),
            word("down.", Some(0)),
        ];

        let formatted = format_diarized_transcript(&words);
        assert_eq!(
            formatted,
            "Speaker 0: Hello there.\n\nSpeaker 1: Hi doctor.\n\nSpeaker 0: Sit down."
        );
    }

    #[test]
    fn test_diarized_formatting_skips_unlabeled_words() {
        let words = vec![WordInfo {
            word: "orphan".to_string(),
            start: None,
            end: None,
            speaker: None,
            confidence: None,
        }];
        assert_eq!(format_diarized_transcript(&words), "");
    }
}
