//! STT provider failover manager.
//!
//! Tries providers in declared order until one succeeds, tracking which
//! providers are currently healthy and temporarily skipping ones that keep
//! failing.

use super::{DeepgramProvider, ElevenLabsProvider, GroqProvider, SttProvider, TranscriptionResult};
use crate::audio::AudioData;
use crate::config::{api_key_from_env, validate_api_key, AppConfig};
use crate::resilience::Resilience;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DEFAULT_MAX_FAILURES_BEFORE_SKIP: u32 = 3;
const DEFAULT_SKIP_DURATION: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct ProviderHealth {
    failure_count: u32,
    skip_until: Option<Instant>,
}

/// Read-only health snapshot for one provider.
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub configured: bool,
    pub failure_count: u32,
    pub temporarily_disabled: bool,
    /// Seconds until the provider is tried again, when disabled.
    pub disabled_for_secs: Option<f64>,
    pub last_successful: bool,
}

struct FailoverState {
    health: HashMap<&'static str, ProviderHealth>,
    last_successful: Option<&'static str>,
}

/// Routes transcription across multiple STT providers with automatic
/// failover and per-provider health tracking.
pub struct SttFailoverManager {
    providers: Vec<Arc<dyn SttProvider>>,
    max_failures_before_skip: u32,
    skip_duration: Duration,
    state: Mutex<FailoverState>,
}

impl SttFailoverManager {
    /// Create a manager over an ordered provider list (primary first).
    pub fn new(providers: Vec<Arc<dyn SttProvider>>) -> Self {
        Self::with_policy(
            providers,
            DEFAULT_MAX_FAILURES_BEFORE_SKIP,
            DEFAULT_SKIP_DURATION,
        )
    }

    pub fn with_policy(
        providers: Vec<Arc<dyn SttProvider>>,
        max_failures_before_skip: u32,
        skip_duration: Duration,
    ) -> Self {
        if providers.is_empty() {
            log::error!("Failover: no STT providers configured");
        }
        Self {
            providers,
            max_failures_before_skip,
            skip_duration,
            state: Mutex::new(FailoverState {
                health: HashMap::new(),
                last_successful: None,
            }),
        }
    }

    /// Transcribe with automatic failover, returning plain text.
    ///
    /// Returns an empty string when every provider fails.
    pub async fn transcribe(&self, audio: &AudioData) -> String {
        let result = self.transcribe_with_result(audio).await;
        if result.success {
            result.text
        } else {
            String::new()
        }
    }

    /// Transcribe with automatic failover, returning a structured result.
    ///
    /// Providers are tried in declared order; each configured, non-skipped
    /// provider is attempted at most once per call. The returned result is
    /// annotated with `provider` and `failover_attempts`.
    pub async fn transcribe_with_result(&self, audio: &AudioData) -> TranscriptionResult {
        let mut errors: Vec<String> = Vec::new();
        let mut providers_tried: Vec<&'static str> = Vec::new();

        for provider in &self.providers {
            let name = provider.provider_name();

            if let Some(remaining) = self.skip_remaining(name) {
                log::debug!(
                    "Failover: skipping {} (temporarily disabled for {:.0}s)",
                    name,
                    remaining.as_secs_f64()
                );
                continue;
            }

            if !provider.is_configured() {
                log::debug!("Failover: skipping {} (not configured)", name);
                continue;
            }

            providers_tried.push(name);
            log::info!("Failover: attempting transcription with {}", name);

            let mut result = provider.transcribe_with_result(audio).await;
            if result.success && !result.text.is_empty() {
                self.record_success(name);
                result.metadata.insert(
                    "provider".to_string(),
                    serde_json::Value::String(name.to_string()),
                );
                result.metadata.insert(
                    "failover_attempts".to_string(),
                    serde_json::Value::from(providers_tried.len()),
                );
                return result;
            }

            let error = result
                .error
                .unwrap_or_else(|| "Empty transcription".to_string());
            log::warn!("Failover: transcription failed with {}: {}", name, error);
            errors.push(format!("{}: {}", name, error));
            self.record_failure(name);
        }

        let summary = if errors.is_empty() {
            "No configured providers available".to_string()
        } else {
            errors.join("; ")
        };
        log::error!("Failover: all STT providers failed: {}", summary);

        let mut result =
            TranscriptionResult::failure_result(format!("All providers failed: {}", summary));
        result.metadata.insert(
            "providers_tried".to_string(),
            serde_json::Value::from(
                providers_tried
                    .iter()
                    .map(|name| serde_json::Value::String(name.to_string()))
                    .collect::<Vec<_>>(),
            ),
        );
        result
    }

    fn skip_remaining(&self, name: &str) -> Option<Duration> {
        let state = self.state.lock().expect("failover lock poisoned");
        let skip_until = state.health.get(name)?.skip_until?;
        let now = Instant::now();
        if now < skip_until {
            Some(skip_until - now)
        } else {
            None
        }
    }

    fn record_success(&self, name: &'static str) {
        let mut state = self.state.lock().expect("failover lock poisoned");
        let health = state.health.entry(name).or_default();
        health.failure_count = 0;
        health.skip_until = None;
        state.last_successful = Some(name);
        log::debug!("Failover: {} succeeded, reset failure count", name);
    }

    fn record_failure(&self, name: &'static str) {
        let mut state = self.state.lock().expect("failover lock poisoned");
        let health = state.health.entry(name).or_default();
        health.failure_count += 1;

        if health.failure_count >= self.max_failures_before_skip {
            health.skip_until = Some(Instant::now() + self.skip_duration);
            log::warn!(
                "Failover: {} has failed {} times, temporarily disabled for {:.0}s",
                name,
                health.failure_count,
                self.skip_duration.as_secs_f64()
            );
        }
    }

    /// Current health of every provider, in declared order.
    pub fn provider_status(&self) -> HashMap<String, ProviderStatus> {
        let state = self.state.lock().expect("failover lock poisoned");
        let now = Instant::now();

        self.providers
            .iter()
            .map(|provider| {
                let name = provider.provider_name();
                let health = state.health.get(name);
                let skip_until = health.and_then(|h| h.skip_until);
                let disabled = skip_until.map(|until| now < until).unwrap_or(false);

                (
                    name.to_string(),
                    ProviderStatus {
                        configured: provider.is_configured(),
                        failure_count: health.map(|h| h.failure_count).unwrap_or(0),
                        temporarily_disabled: disabled,
                        disabled_for_secs: skip_until.and_then(|until| {
                            if now < until {
                                Some((until - now).as_secs_f64())
                            } else {
                                None
                            }
                        }),
                        last_successful: state.last_successful == Some(name),
                    },
                )
            })
            .collect()
    }

    /// Re-enable a provider after fixing a configuration issue.
    pub fn reset_provider(&self, name: &str) {
        let mut state = self.state.lock().expect("failover lock poisoned");
        if let Some(health) = state.health.get_mut(name) {
            health.failure_count = 0;
            health.skip_until = None;
        }
        log::info!("Failover: reset failure tracking for {}", name);
    }

    /// Reset failure tracking for every provider.
    pub fn reset_all(&self) {
        let mut state = self.state.lock().expect("failover lock poisoned");
        state.health.clear();
        log::info!("Failover: reset failure tracking for all providers");
    }

    /// Names of providers that are configured and not temporarily disabled.
    pub fn available_providers(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|p| p.is_configured())
            .filter(|p| self.skip_remaining(p.provider_name()).is_none())
            .map(|p| p.provider_name().to_string())
            .collect()
    }

    /// Run `test_connection` on every provider.
    pub async fn test_all_providers(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for provider in &self.providers {
            let ok = provider.test_connection().await;
            results.insert(provider.provider_name().to_string(), ok);
        }
        results
    }
}

/// Build the default provider chain from configuration and environment
/// API keys, in failover order: Deepgram (medical-grade) → Groq →
/// ElevenLabs.
///
/// Providers whose key is missing or fails the shape check are left out
/// with a log line. The local Whisper fallback (when the `local-whisper`
/// feature is enabled) is appended by the caller, since it needs a model
/// path rather than a key.
pub fn default_provider_chain(
    config: &AppConfig,
    resilience: &Arc<Resilience>,
) -> Vec<Arc<dyn SttProvider>> {
    let base_timeout = config.api_timeout();
    let mut providers: Vec<Arc<dyn SttProvider>> = Vec::new();

    let usable_key = |provider: &str| -> Option<String> {
        let key = api_key_from_env(provider)?;
        match validate_api_key(provider, &key) {
            Ok(()) => Some(key),
            Err(reason) => {
                log::warn!("Failover: rejecting {} API key: {}", provider, reason);
                None
            }
        }
    };

    if let Some(key) = usable_key("deepgram") {
        providers.push(Arc::new(DeepgramProvider::new(
            key,
            config.deepgram.clone(),
            Arc::clone(resilience),
            base_timeout,
        )));
        log::info!("Failover: added deepgram to failover chain");
    }

    if let Some(key) = usable_key("groq") {
        providers.push(Arc::new(GroqProvider::new(
            key,
            None,
            Arc::clone(resilience),
            base_timeout,
        )));
        log::info!("Failover: added groq to failover chain");
    }

    if let Some(key) = usable_key("elevenlabs") {
        providers.push(Arc::new(ElevenLabsProvider::new(
            key,
            config.elevenlabs.clone(),
            Arc::clone(resilience),
            base_timeout,
        )));
        log::info!("Failover: added elevenlabs to failover chain");
    }

    if providers.is_empty() {
        log::warn!("Failover: no cloud STT providers configured from environment");
    }

    providers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProvider {
        name: &'static str,
        configured: bool,
        fail: bool,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn ok(name: &'static str) -> Self {
            Self {
                name,
                configured: true,
                fail: false,
                calls: AtomicU32::new(0),
            }
        }

        fn failing(name: &'static str) -> Self {
            Self {
                name,
                configured: true,
                fail: true,
                calls: AtomicU32::new(0),
            }
        }

        fn unconfigured(name: &'static str) -> Self {
            Self {
                name,
                configured: false,
                fail: false,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SttProvider for ScriptedProvider {
        fn provider_name(&self) -> &'static str {
            self.name
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn transcribe(&self, _audio: &AudioData) -> Result<String, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ApiError::ServiceUnavailable("down".into()))
            } else {
                Ok("ok".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_failover_to_secondary() {
        let primary = Arc::new(ScriptedProvider::failing("primary"));
        let secondary = Arc::new(ScriptedProvider::ok("secondary"));
        let manager =
            SttFailoverManager::new(vec![primary.clone(), secondary.clone()]);

        let result = manager
            .transcribe_with_result(&AudioData::silence(0.2))
            .await;

        assert!(result.success);
        assert_eq!(result.text, "ok");
        assert_eq!(result.provider(), Some("secondary"));
        assert_eq!(
            result.metadata["failover_attempts"],
            serde_json::Value::from(2)
        );
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_providers_are_skipped() {
        let skipped = Arc::new(ScriptedProvider::unconfigured("skipped"));
        let fallback = Arc::new(ScriptedProvider::ok("fallback"));
        let manager = SttFailoverManager::new(vec![skipped.clone(), fallback]);

        let result = manager
            .transcribe_with_result(&AudioData::silence(0.2))
            .await;

        assert!(result.success);
        assert_eq!(result.provider(), Some("fallback"));
        // Failover attempts only count providers actually tried.
        assert_eq!(
            result.metadata["failover_attempts"],
            serde_json::Value::from(1)
        );
        assert_eq!(skipped.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repeated_failures_disable_provider() {
        let flaky = Arc::new(ScriptedProvider::failing("flaky"));
        let stable = Arc::new(ScriptedProvider::ok("stable"));
        let manager = SttFailoverManager::with_policy(
            vec![flaky.clone(), stable],
            3,
            Duration::from_secs(300),
        );

        for _ in 0..3 {
            let result = manager
                .transcribe_with_result(&AudioData::silence(0.2))
                .await;
            assert!(result.success);
        }

        let status = manager.provider_status();
        assert!(status["flaky"].temporarily_disabled);
        assert_eq!(status["flaky"].failure_count, 3);
        assert!(status["stable"].last_successful);

        // The disabled provider is bypassed entirely on the next call.
        let before = flaky.calls.load(Ordering::SeqCst);
        let result = manager
            .transcribe_with_result(&AudioData::silence(0.2))
            .await;
        assert!(result.success);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), before);
        assert_eq!(
            result.metadata["failover_attempts"],
            serde_json::Value::from(1)
        );

        assert_eq!(manager.available_providers(), vec!["stable".to_string()]);
    }

    #[tokio::test]
    async fn test_all_providers_failing_returns_error_summary() {
        let a = Arc::new(ScriptedProvider::failing("alpha"));
        let b = Arc::new(ScriptedProvider::failing("beta"));
        let manager = SttFailoverManager::new(vec![a, b]);

        let result = manager
            .transcribe_with_result(&AudioData::silence(0.2))
            .await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("alpha"));
        assert!(error.contains("beta"));

        assert_eq!(manager.transcribe(&AudioData::silence(0.2)).await, "");
    }

    #[test]
    fn test_default_chain_only_holds_configured_providers() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            storage: crate::config::StorageConfig {
                base_folder: dir.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        };
        let resilience = Arc::new(Resilience::new(&config.api));

        // Whatever the surrounding environment provides, every provider in
        // the chain must be fully configured.
        let chain = default_provider_chain(&config, &resilience);
        for provider in chain {
            assert!(provider.is_configured());
        }
    }

    #[tokio::test]
    async fn test_reset_provider_reenables() {
        let flaky = Arc::new(ScriptedProvider::failing("flaky"));
        let manager =
            SttFailoverManager::with_policy(vec![flaky], 1, Duration::from_secs(300));

        let _ = manager
            .transcribe_with_result(&AudioData::silence(0.2))
            .await;
        assert!(manager.provider_status()["flaky"].temporarily_disabled);

        manager.reset_provider("flaky");
        assert!(!manager.provider_status()["flaky"].temporarily_disabled);
        assert_eq!(manager.available_providers(), vec!["flaky".to_string()]);
    }
}
