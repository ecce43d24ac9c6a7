//! Live integration tests for STT providers.
//!
//! These hit real provider APIs and are ignored by default. Run with
//! `cargo test -- --ignored` when `DEEPGRAM_API_KEY`, `GROQ_API_KEY`, or
//! `ELEVENLABS_API_KEY` are set.

use crate::audio::AudioData;
use crate::config::{api_key_from_env, ApiConfig, DeepgramConfig, ElevenLabsConfig};
use crate::resilience::Resilience;
use crate::stt::{DeepgramProvider, ElevenLabsProvider, GroqProvider, SttProvider};
use std::sync::Arc;
use std::time::Duration;

fn resilience() -> Arc<Resilience> {
    Arc::new(Resilience::new(&ApiConfig::default()))
}

#[tokio::test]
#[ignore] // Run with `cargo test -- --ignored` when you have API keys
async fn test_deepgram_transcription_live() {
    let Some(api_key) = api_key_from_env("deepgram") else {
        eprintln!("Skipping Deepgram live test: DEEPGRAM_API_KEY not set");
        return;
    };

    let provider = DeepgramProvider::new(
        api_key,
        DeepgramConfig::default(),
        resilience(),
        Duration::from_secs(60),
    );

    // One second of silence; may transcribe to an empty string.
    let result = provider.transcribe(&AudioData::silence(1.0)).await;
    assert!(result.is_ok(), "Deepgram transcription failed: {:?}", result);
}

#[tokio::test]
#[ignore] // Run with `cargo test -- --ignored` when you have API keys
async fn test_groq_transcription_live() {
    let Some(api_key) = api_key_from_env("groq") else {
        eprintln!("Skipping Groq live test: GROQ_API_KEY not set");
        return;
    };

    let provider = GroqProvider::new(api_key, None, resilience(), Duration::from_secs(60));

    let result = provider.transcribe(&AudioData::silence(1.0)).await;
    assert!(result.is_ok(), "Groq transcription failed: {:?}", result);
}

#[tokio::test]
#[ignore] // Run with `cargo test -- --ignored` when you have API keys
async fn test_elevenlabs_transcription_live() {
    let Some(api_key) = api_key_from_env("elevenlabs") else {
        eprintln!("Skipping ElevenLabs live test: ELEVENLABS_API_KEY not set");
        return;
    };

    let provider = ElevenLabsProvider::new(
        api_key,
        ElevenLabsConfig {
            // Silence carries no speakers worth labelling.
            diarize: false,
            ..Default::default()
        },
        resilience(),
        Duration::from_secs(60),
    );

    let result = provider.transcribe(&AudioData::silence(1.0)).await;
    assert!(
        result.is_ok(),
        "ElevenLabs transcription failed: {:?}",
        result
    );
}

#[tokio::test]
#[ignore]
async fn test_connection_checks_live() {
    let providers: Vec<Arc<dyn SttProvider>> = vec![
        Arc::new(DeepgramProvider::new(
            api_key_from_env("deepgram").unwrap_or_default(),
            DeepgramConfig::default(),
            resilience(),
            Duration::from_secs(10),
        )),
        Arc::new(GroqProvider::new(
            api_key_from_env("groq").unwrap_or_default(),
            None,
            resilience(),
            Duration::from_secs(10),
        )),
    ];

    for provider in providers {
        let ok = provider.test_connection().await;
        eprintln!("{}: connection test = {}", provider.provider_name(), ok);
    }
}
