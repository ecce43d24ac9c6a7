//! Shared fixtures: scripted STT providers, canned generators, and a
//! queue harness wired to a temp database.

use crate::audio::AudioData;
use crate::db::{Database, NewRecording};
use crate::error::ApiError;
use crate::generators::{DocumentGenerator, GeneratorError};
use crate::queue::{ProcessingQueue, QueueConfig, TaskSnapshot};
use crate::stt::{SttFailoverManager, SttProvider};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// STT provider driven by a script of responses.
///
/// Each call pops the next scripted response; once the script is
/// exhausted the fallback response repeats. An optional gate semaphore
/// (created with zero permits) blocks calls until the test releases them.
pub struct ScriptedStt {
    name: &'static str,
    script: Mutex<VecDeque<Result<String, String>>>,
    fallback: Result<String, String>,
    gate: Option<Arc<tokio::sync::Semaphore>>,
    pub calls: AtomicU32,
}

impl ScriptedStt {
    pub fn always_ok(name: &'static str, text: &str) -> Self {
        Self {
            name,
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(text.to_string()),
            gate: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn always_failing(name: &'static str, message: &str) -> Self {
        Self {
            name,
            script: Mutex::new(VecDeque::new()),
            fallback: Err(message.to_string()),
            gate: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Fail `failures` times, then return `text` forever.
    pub fn flaky(name: &'static str, failures: usize, text: &str) -> Self {
        let script = (0..failures)
            .map(|_| Err("transient outage".to_string()))
            .collect();
        Self {
            name,
            script: Mutex::new(script),
            fallback: Ok(text.to_string()),
            gate: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Block every call until the test adds permits to the returned gate.
    pub fn gated(name: &'static str, text: &str) -> (Self, Arc<tokio::sync::Semaphore>) {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let provider = Self {
            name,
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(text.to_string()),
            gate: Some(Arc::clone(&gate)),
            calls: AtomicU32::new(0),
        };
        (provider, gate)
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SttProvider for ScriptedStt {
    fn provider_name(&self) -> &'static str {
        self.name
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn transcribe(&self, _audio: &AudioData) -> Result<String, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .expect("test gate closed")
                .forget();
        }

        let next = self
            .script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next.map_err(ApiError::ServiceUnavailable)
    }
}

/// Generator returning canned documents.
pub struct CannedGenerator {
    pub soap: String,
    pub referral: String,
    pub letter: String,
    pub soap_calls: AtomicU32,
}

impl CannedGenerator {
    pub fn new(soap: &str) -> Self {
        Self {
            soap: soap.to_string(),
            referral: "Referral paragraph.".to_string(),
            letter: "Dear colleague,".to_string(),
            soap_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl DocumentGenerator for CannedGenerator {
    async fn generate_soap(
        &self,
        _transcript: &str,
        _context: &str,
    ) -> Result<String, GeneratorError> {
        self.soap_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.soap.clone())
    }

    async fn generate_referral(
        &self,
        _soap_note: &str,
        _conditions_hint: &str,
    ) -> Result<String, GeneratorError> {
        Ok(self.referral.clone())
    }

    async fn generate_letter(
        &self,
        _content: &str,
        _recipient_type: &str,
        _specs: &str,
    ) -> Result<String, GeneratorError> {
        Ok(self.letter.clone())
    }
}

/// A queue wired to a temp database with fast retry delays.
pub struct Harness {
    pub queue: ProcessingQueue,
    pub db: Arc<Database>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    pub fn build(
        providers: Vec<Arc<dyn SttProvider>>,
        generators: Arc<dyn DocumentGenerator>,
        configure: impl FnOnce(&mut QueueConfig),
    ) -> Self {
        Self::build_with_failover(SttFailoverManager::new(providers), generators, configure)
    }

    pub fn build_with_failover(
        failover: SttFailoverManager,
        generators: Arc<dyn DocumentGenerator>,
        configure: impl FnOnce(&mut QueueConfig),
    ) -> Self {
        Self::init_logging();
        let dir = tempfile::tempdir().expect("create temp dir");
        let db = Arc::new(
            Database::open(&dir.path().join("test.db"), 3, Duration::from_secs(5))
                .expect("open test db"),
        );

        let mut config = QueueConfig {
            storage_folder: dir.path().join("storage"),
            retry_base_delay: Duration::from_millis(10),
            ..Default::default()
        };
        configure(&mut config);

        let queue = ProcessingQueue::new(
            Arc::clone(&db),
            Arc::new(failover),
            generators,
            config,
        );

        Self {
            queue,
            db,
            _dir: dir,
        }
    }

    /// Insert a recording row and return its id.
    pub fn new_recording(&self, patient_name: &str) -> i64 {
        self.db
            .add_recording(NewRecording {
                filename: format!("{}.wav", patient_name.to_lowercase()),
                patient_name: patient_name.to_string(),
                ..Default::default()
            })
            .expect("insert recording")
    }

    /// Poll until the task reaches a terminal state.
    pub async fn wait_for_terminal(&self, task_id: &str) -> TaskSnapshot {
        for _ in 0..1000 {
            if let Some(snapshot) = self.queue.get_task_status(task_id) {
                if snapshot.status.is_terminal() {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} did not reach a terminal state in time", task_id);
    }

    /// Poll until the task is observed in `processing`.
    pub async fn wait_for_processing(&self, task_id: &str) {
        for _ in 0..1000 {
            if let Some(snapshot) = self.queue.get_task_status(task_id) {
                if snapshot.started_at.is_some() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} never started processing", task_id);
    }
}

/// One-second mono silence, the canonical test payload.
pub fn silence() -> AudioData {
    AudioData::silence(1.0)
}
