//! Background processing queue for consultation recordings.
//!
//! Submissions are deduplicated, prioritized and dispatched to a bounded
//! worker pool so the operator can start the next consultation while
//! earlier recordings transcribe and generate documents in the background.
//!
//! One dispatcher task drains the priority heap; workers are bounded by a
//! semaphore sized to the worker count. Each task carries a cancellation
//! token checked between executor steps. Failed tasks retry with
//! exponential backoff on a detached sleep task, re-entering the heap at a
//! higher priority.

mod executor;
mod task;

pub use task::{
    BatchCallback, BatchEvent, BatchExtras, BatchSnapshot, CompletionCallback, ErrorCallback,
    ProcessOptions, QueueStats, QueueStatus, RecordingTaskData, StatusCallback, TaskArtifacts,
    TaskSnapshot, TaskStatus,
};

use crate::audio::AudioData;
use crate::config::AppConfig;
use crate::db::{Database, DbError, ProcessingStatus};
use crate::generators::{DocumentGenerator, GeneratorError};
use crate::stt::SttFailoverManager;
use chrono::Utc;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use task::{BatchState, RecordingTask};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Maximum recordings accepted in one batch submission.
pub const MAX_BATCH_SIZE: usize = 100;

/// Errors raised while processing a task.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Audio save failed: {0}")]
    AudioSave(String),

    #[error("{0}")]
    Generation(#[from] GeneratorError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Task cancelled")]
    Cancelled,
}

impl ProcessingError {
    /// Whether the queue-level retry policy may re-enqueue after this
    /// error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessingError::Transcription(_) => true,
            ProcessingError::Generation(err) => err.is_retryable(),
            ProcessingError::AudioSave(_)
            | ProcessingError::Database(_)
            | ProcessingError::Input(_)
            | ProcessingError::Cancelled => false,
        }
    }
}

/// Tuning for the processing queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Worker pool size override. Defaults to `min(cpus - 1, 6)`, at
    /// least 1.
    pub max_workers: Option<usize>,
    pub auto_retry_failed: bool,
    pub max_retry_attempts: u32,
    /// Folder audio blobs are persisted into before transcription.
    pub storage_folder: PathBuf,
    /// Terminal-task history kept per outcome before pruning oldest.
    pub max_completed_tasks: usize,
    /// First retry delay; doubles per attempt up to `retry_max_delay`.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            auto_retry_failed: true,
            max_retry_attempts: 3,
            storage_folder: std::env::temp_dir().join("medscribe-storage"),
            max_completed_tasks: 1000,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            max_workers: config.processing.max_background_workers,
            auto_retry_failed: config.processing.auto_retry_failed,
            max_retry_attempts: config.processing.max_retry_attempts,
            storage_folder: config.storage.base_folder.clone(),
            ..Default::default()
        }
    }
}

/// Heap entry: smaller priority first, FIFO within a priority.
#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    seq: u64,
    task_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the smallest (priority, seq)
        // pops first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct CallbackSinks {
    status: Mutex<Option<StatusCallback>>,
    completion: Mutex<Option<CompletionCallback>>,
    error: Mutex<Option<ErrorCallback>>,
    batch: Mutex<Option<BatchCallback>>,
}

#[derive(Default)]
struct QueueState {
    active: HashMap<String, RecordingTask>,
    completed: HashMap<String, RecordingTask>,
    failed: HashMap<String, RecordingTask>,
    cancelled: HashMap<String, RecordingTask>,
    batches: HashMap<String, BatchState>,
    recording_to_task: HashMap<i64, String>,
    stats: QueueStats,
}

pub(crate) struct QueueCore {
    pub(crate) db: Arc<Database>,
    pub(crate) stt: Arc<SttFailoverManager>,
    pub(crate) generators: Arc<dyn DocumentGenerator>,
    pub(crate) config: QueueConfig,
    state: Mutex<QueueState>,
    heap: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    workers: usize,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    seq: AtomicU64,
    callbacks: CallbackSinks,
}

/// Manages background processing of medical recordings.
///
/// Deduplication: the queue tracks live recordings by `recording_id`. A
/// recording that is already queued or processing is not queued again
/// until it completes or fails.
pub struct ProcessingQueue {
    core: Arc<QueueCore>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessingQueue {
    /// Create the queue and start its dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        db: Arc<Database>,
        stt: Arc<SttFailoverManager>,
        generators: Arc<dyn DocumentGenerator>,
        config: QueueConfig,
    ) -> Self {
        let workers = config.max_workers.unwrap_or_else(default_worker_count).max(1);

        let core = Arc::new(QueueCore {
            db,
            stt,
            generators,
            config,
            state: Mutex::new(QueueState::default()),
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            workers,
            semaphore: Arc::new(Semaphore::new(workers)),
            shutdown: CancellationToken::new(),
            seq: AtomicU64::new(0),
            callbacks: CallbackSinks::default(),
        });

        let dispatcher = spawn_dispatcher(Arc::clone(&core));
        log::info!("Queue: initialized with {} workers", workers);

        Self {
            core,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    // ------------------------------------------------------------------
    // Callback registration
    // ------------------------------------------------------------------

    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.core.callbacks.status.lock().expect("queue lock poisoned") = Some(callback);
    }

    pub fn set_completion_callback(&self, callback: CompletionCallback) {
        *self
            .core
            .callbacks
            .completion
            .lock()
            .expect("queue lock poisoned") = Some(callback);
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.core.callbacks.error.lock().expect("queue lock poisoned") = Some(callback);
    }

    pub fn set_batch_callback(&self, callback: BatchCallback) {
        *self.core.callbacks.batch.lock().expect("queue lock poisoned") = Some(callback);
    }

    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    /// Add a recording to the processing queue.
    ///
    /// Returns `None` when the recording is already queued or processing
    /// (deduplication); the duplicate is counted in the stats and, for
    /// batched submissions, treated as already completed in the batch
    /// accounting.
    pub fn add_recording(&self, data: RecordingTaskData) -> Option<String> {
        let core = &self.core;
        let recording_id = data.recording_id;
        let priority = data.priority;
        let batch_id = data.batch_id.clone();

        let task_id = {
            let mut state = core.state.lock().expect("queue lock poisoned");

            if let Some(existing) = state.recording_to_task.get(&recording_id).cloned() {
                if let Some(task) = state.active.get(&existing) {
                    log::warn!(
                        "Queue: recording {} already queued as task {} (status: {}), skipping duplicate",
                        recording_id,
                        existing,
                        task.status.as_str()
                    );
                    state.stats.total_deduplicated += 1;

                    // A deduplicated batch member still counts toward the
                    // batch, as already-done work.
                    if let Some(batch_id) = &batch_id {
                        if let Some(batch) = state.batches.get_mut(batch_id) {
                            batch.total += 1;
                            batch.completed += 1;
                        }
                    }
                    drop(state);
                    if let Some(batch_id) = &batch_id {
                        core.handle_batch_progress(batch_id);
                    }
                    return None;
                }
                // Stale mapping from a task that already left the queue.
                state.recording_to_task.remove(&recording_id);
            }

            let task_id = Uuid::new_v4().to_string();
            let task = RecordingTask::new(task_id.clone(), data);

            state.stats.total_queued += 1;
            state.recording_to_task.insert(recording_id, task_id.clone());

            if let Some(batch_id) = &batch_id {
                let batch = state.batches.entry(batch_id.clone()).or_default();
                batch.total += 1;
                batch.task_ids.push(task_id.clone());
            }

            state.active.insert(task_id.clone(), task);
            task_id
        };

        core.push_entry(priority, task_id.clone());
        core.notify_status(&task_id, TaskStatus::Queued);
        log::info!(
            "Queue: recording {} added to queue as task {}",
            recording_id,
            task_id
        );

        Some(task_id)
    }

    /// Add multiple recordings as a batch.
    ///
    /// Fails with an input error when the batch exceeds
    /// [`MAX_BATCH_SIZE`]. Returns the batch id.
    pub fn add_batch_recordings(
        &self,
        recordings: Vec<RecordingTaskData>,
        batch_options: Option<serde_json::Value>,
    ) -> Result<String, ProcessingError> {
        if recordings.len() > MAX_BATCH_SIZE {
            let message = format!(
                "Batch size {} exceeds maximum allowed ({})",
                recordings.len(),
                MAX_BATCH_SIZE
            );
            log::error!("Queue: {}", message);
            return Err(ProcessingError::Input(message));
        }

        let batch_id = Uuid::new_v4().to_string();
        let total = recordings.len();
        let batch_priority = batch_options
            .as_ref()
            .and_then(|options| options.get("priority"))
            .and_then(|value| value.as_i64())
            .map(|value| value as i32);

        log::info!("Queue: adding batch {} with {} recordings", batch_id, total);

        {
            let mut state = self.core.state.lock().expect("queue lock poisoned");
            state.batches.insert(
                batch_id.clone(),
                BatchState {
                    announced: false,
                    started_at: Some(Utc::now()),
                    options: batch_options.clone(),
                    ..Default::default()
                },
            );
        }

        // Durable ledger row; queue accounting continues even if this
        // write fails.
        if let Err(e) = self
            .core
            .db
            .upsert_batch(&batch_id, total as u32, batch_options.as_ref())
        {
            log::warn!("Queue: failed to persist batch {}: {}", batch_id, e);
        }

        for mut data in recordings {
            data.batch_id = Some(batch_id.clone());
            if let Some(priority) = batch_priority {
                data.priority = priority;
            }
            data.batch_options = batch_options.clone();
            let _ = self.add_recording(data);
        }

        {
            let mut state = self.core.state.lock().expect("queue lock poisoned");
            if let Some(batch) = state.batches.get_mut(&batch_id) {
                batch.announced = true;
            }
        }
        self.core
            .notify_batch(BatchEvent::Started, &batch_id, 0, total as u32, &BatchExtras::default());

        // An entirely-deduplicated batch is already complete.
        self.core.handle_batch_progress(&batch_id);

        Ok(batch_id)
    }

    /// Re-queue a failed recording from its persisted row.
    ///
    /// Returns `None` unless the recording exists and is in `failed`
    /// status. Artifacts that already exist are not regenerated.
    pub fn reprocess_failed_recording(&self, recording_id: i64) -> Option<String> {
        let recording = match self.core.db.get_recording(recording_id) {
            Ok(Some(recording)) => recording,
            Ok(None) => {
                log::error!("Queue: recording {} not found", recording_id);
                return None;
            }
            Err(e) => {
                log::error!("Queue: failed to load recording {}: {}", recording_id, e);
                return None;
            }
        };

        if recording.processing_status != ProcessingStatus::Failed {
            log::warn!(
                "Queue: recording {} is not in failed status (current: {})",
                recording_id,
                recording.processing_status.as_str()
            );
            return None;
        }

        let audio_data = recording
            .audio_path
            .as_deref()
            .filter(|path| std::path::Path::new(path).exists())
            .and_then(|path| match std::fs::read(path) {
                Ok(bytes) => {
                    log::info!("Queue: loaded audio from {} for reprocessing", path);
                    Some(AudioData::Wav(bytes))
                }
                Err(e) => {
                    // Continue without audio; a transcript may be available.
                    log::error!("Queue: failed to load audio from {}: {}", path, e);
                    None
                }
            });

        if let Err(e) = self.core.db.reset_for_reprocess(recording_id) {
            log::error!(
                "Queue: failed to reset recording {} for reprocessing: {}",
                recording_id,
                e
            );
            return None;
        }

        let context = recording
            .metadata
            .as_ref()
            .and_then(|m| m.get("context"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let has = |field: &Option<String>| field.as_deref().is_some_and(|s| !s.is_empty());

        let data = RecordingTaskData {
            recording_id,
            audio_data,
            transcript: recording.transcript.clone().filter(|t| !t.is_empty()),
            patient_name: recording.patient_name.clone(),
            context,
            process_options: ProcessOptions {
                generate_soap: !has(&recording.soap_note),
                generate_referral: !has(&recording.referral),
                generate_letter: !has(&recording.letter),
            },
            // Manual reprocess jumps ahead of routine submissions.
            priority: 3,
            batch_id: None,
            batch_options: None,
        };

        let task_id = self.add_recording(data);
        if let Some(task_id) = &task_id {
            log::info!(
                "Queue: recording {} queued for reprocessing as task {}",
                recording_id,
                task_id
            );
        }
        task_id
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Attempt to cancel a queued or processing task.
    ///
    /// A queued task is cancelled synchronously. A processing task gets a
    /// cooperative cancellation request; the call reports success only if
    /// the worker had not begun its first step.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        enum Outcome {
            Removed { recording_id: i64, batch_id: Option<String> },
            Requested(bool),
            NotFound,
        }

        let outcome = {
            let mut state = self.core.state.lock().expect("queue lock poisoned");
            let status = state.active.get(task_id).map(|task| task.status);
            match status {
                Some(TaskStatus::Queued) => {
                    let mut task = state
                        .active
                        .remove(task_id)
                        .expect("task disappeared under lock");
                    task.status = TaskStatus::Cancelled;
                    task.terminal_at = Some(Utc::now());

                    let recording_id = task.data.recording_id;
                    let batch_id = task.data.batch_id.clone();
                    state.recording_to_task.remove(&recording_id);
                    state.stats.total_cancelled += 1;
                    if let Some(batch_id) = &batch_id {
                        if let Some(batch) = state.batches.get_mut(batch_id) {
                            batch.cancelled += 1;
                        }
                    }
                    state.cancelled.insert(task_id.to_string(), task);
                    Outcome::Removed {
                        recording_id,
                        batch_id,
                    }
                }
                Some(TaskStatus::Processing) => {
                    let task = state
                        .active
                        .get(task_id)
                        .expect("task disappeared under lock");
                    task.cancel_token.cancel();
                    // Success only when the worker has not begun its first
                    // step; later cancellation is observed between steps.
                    Outcome::Requested(task.started_at.is_none())
                }
                _ => Outcome::NotFound,
            }
        };

        match outcome {
            Outcome::Removed {
                recording_id,
                batch_id,
            } => {
                if let Err(e) = self.core.db.mark_cancelled(recording_id) {
                    log::warn!(
                        "Queue: failed to mark recording {} cancelled: {}",
                        recording_id,
                        e
                    );
                }
                self.core.notify_status(task_id, TaskStatus::Cancelled);
                if let Some(batch_id) = &batch_id {
                    self.core.handle_batch_progress(batch_id);
                }
                log::info!("Queue: task {} cancelled", task_id);
                true
            }
            Outcome::Requested(success) => {
                log::info!(
                    "Queue: cancellation requested for running task {} (immediate: {})",
                    task_id,
                    success
                );
                success
            }
            Outcome::NotFound => false,
        }
    }

    /// Cancel every cancellable task in a batch. Returns the count
    /// cancelled.
    pub fn cancel_batch(&self, batch_id: &str) -> usize {
        let task_ids = {
            let state = self.core.state.lock().expect("queue lock poisoned");
            match state.batches.get(batch_id) {
                Some(batch) => batch.task_ids.clone(),
                None => {
                    log::warn!("Queue: batch {} not found for cancellation", batch_id);
                    return 0;
                }
            }
        };

        log::info!(
            "Queue: attempting to cancel batch {} with {} tasks",
            batch_id,
            task_ids.len()
        );

        let cancelled = task_ids
            .iter()
            .filter(|task_id| self.cancel_task(task_id))
            .count();

        log::info!("Queue: cancelled {} tasks in batch {}", cancelled, batch_id);
        cancelled
    }

    // ------------------------------------------------------------------
    // Status queries
    // ------------------------------------------------------------------

    /// Current queue status and statistics.
    pub fn get_status(&self) -> QueueStatus {
        let state = self.core.state.lock().expect("queue lock poisoned");
        let queue_size = self.core.heap.lock().expect("queue lock poisoned").len();
        QueueStatus {
            queue_size,
            active_tasks: state.active.len(),
            completed_tasks: state.completed.len(),
            failed_tasks: state.failed.len(),
            cancelled_tasks: state.cancelled.len(),
            stats: state.stats.clone(),
            workers: self.core.workers,
        }
    }

    /// Read-only snapshot of one task, wherever it currently lives.
    pub fn get_task_status(&self, task_id: &str) -> Option<TaskSnapshot> {
        let state = self.core.state.lock().expect("queue lock poisoned");
        state
            .active
            .get(task_id)
            .or_else(|| state.completed.get(task_id))
            .or_else(|| state.failed.get(task_id))
            .or_else(|| state.cancelled.get(task_id))
            .map(|task| task.snapshot())
    }

    /// Read-only snapshot of one batch.
    pub fn get_batch_status(&self, batch_id: &str) -> Option<BatchSnapshot> {
        let state = self.core.state.lock().expect("queue lock poisoned");
        state.batches.get(batch_id).map(|batch| BatchSnapshot {
            batch_id: batch_id.to_string(),
            total: batch.total,
            completed: batch.completed,
            failed: batch.failed,
            cancelled: batch.cancelled,
            in_progress: batch
                .total
                .saturating_sub(batch.completed + batch.failed + batch.cancelled),
            started_at: batch.started_at,
            completed_at: batch.completed_at,
            duration_secs: batch.duration_secs,
            options: batch.options.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Shut down the queue.
    ///
    /// With `wait = true`, in-flight tasks drain to completion. With
    /// `wait = false`, their cancellation tokens fire and the pool drains
    /// whatever acknowledges promptly.
    pub async fn shutdown(&self, wait: bool) {
        log::info!("Queue: shutting down...");
        self.core.shutdown.cancel();

        if !wait {
            let state = self.core.state.lock().expect("queue lock poisoned");
            for task in state.active.values() {
                task.cancel_token.cancel();
            }
        }

        let handle = self.dispatcher.lock().expect("queue lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Workers hold permits while running; owning every permit means the
        // pool has drained.
        let _ = self
            .core
            .semaphore
            .acquire_many(self.core.workers as u32)
            .await;
        self.core.semaphore.close();

        log::info!("Queue: shutdown complete");
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).clamp(1, 6))
        .unwrap_or(4)
}

fn spawn_dispatcher(core: Arc<QueueCore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::info!("Queue: dispatcher started");
        loop {
            tokio::select! {
                _ = core.shutdown.cancelled() => break,
                _ = core.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }

            while let Some(entry) = core.pop_entry() {
                let permit = match Arc::clone(&core.semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        log::warn!("Queue: worker pool shut down, exiting dispatcher");
                        return;
                    }
                };

                if core.shutdown.is_cancelled() {
                    // Leave the remaining entries unprocessed; shutdown wins.
                    drop(permit);
                    log::info!("Queue: dispatcher stopping with entries still queued");
                    return;
                }

                // Entries are tombstones once their task was cancelled or
                // re-queued; only dispatch tasks still marked queued.
                let should_run = {
                    let mut state = core.state.lock().expect("queue lock poisoned");
                    match state.active.get_mut(&entry.task_id) {
                        Some(task) if task.status == TaskStatus::Queued => {
                            task.status = TaskStatus::Processing;
                            true
                        }
                        _ => false,
                    }
                };
                if !should_run {
                    drop(permit);
                    continue;
                }

                let worker_core = Arc::clone(&core);
                let task_id = entry.task_id;
                tokio::spawn(async move {
                    let _permit = permit;
                    executor::run(worker_core, task_id).await;
                });
            }
        }
        log::info!("Queue: dispatcher stopped");
    })
}

impl QueueCore {
    fn push_entry(&self, priority: i32, task_id: String) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.heap
            .lock()
            .expect("queue lock poisoned")
            .push(QueueEntry {
                priority,
                seq,
                task_id,
            });
        self.notify.notify_one();
    }

    fn pop_entry(&self) -> Option<QueueEntry> {
        self.heap.lock().expect("queue lock poisoned").pop()
    }

    // ------------------------------------------------------------------
    // Terminal transitions (called from workers)
    // ------------------------------------------------------------------

    pub(crate) fn mark_completed(
        &self,
        task_id: &str,
        artifacts: TaskArtifacts,
        processing_time: Duration,
    ) {
        let elapsed = processing_time.as_secs_f64();
        let (snapshot, recording_id, batch_id) = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let Some(mut task) = state.active.remove(task_id) else {
                return;
            };

            task.status = TaskStatus::Completed;
            task.terminal_at = Some(Utc::now());
            task.processing_time = Some(elapsed);
            task.result = Some(artifacts);

            let recording_id = task.data.recording_id;
            let batch_id = task.data.batch_id.clone();
            state.recording_to_task.remove(&recording_id);

            state.stats.total_processed += 1;
            let n = state.stats.total_processed;
            let avg = state.stats.processing_time_avg;
            state.stats.processing_time_avg = if n <= 1 {
                elapsed
            } else {
                (avg * (n - 1) as f64 + elapsed) / n as f64
            };

            if let Some(batch_id) = &batch_id {
                if let Some(batch) = state.batches.get_mut(batch_id) {
                    batch.completed += 1;
                }
            }

            let snapshot = task.snapshot();
            state.completed.insert(task_id.to_string(), task);
            prune_terminal_tasks(&mut state, self.config.max_completed_tasks);
            (snapshot, recording_id, batch_id)
        };

        if let Err(e) = self.db.mark_completed(recording_id) {
            log::warn!(
                "Queue: failed to mark recording {} completed: {}",
                recording_id,
                e
            );
        }

        if let Some(result) = &snapshot.result {
            self.notify_completion(task_id, &snapshot, result);
        }
        self.notify_status(task_id, TaskStatus::Completed);

        if let Some(batch_id) = &batch_id {
            self.handle_batch_progress(batch_id);
        }

        log::info!("Queue: task {} completed in {:.2} seconds", task_id, elapsed);
    }

    pub(crate) fn mark_failed(&self, task_id: &str, error_message: &str) {
        let (snapshot, recording_id, batch_id) = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let Some(mut task) = state.active.remove(task_id) else {
                return;
            };

            task.status = TaskStatus::Failed;
            task.terminal_at = Some(Utc::now());
            task.last_error = Some(error_message.to_string());

            let recording_id = task.data.recording_id;
            let batch_id = task.data.batch_id.clone();
            // Removal permits explicit reprocessing of the failed row.
            state.recording_to_task.remove(&recording_id);
            state.stats.total_failed += 1;

            if let Some(batch_id) = &batch_id {
                if let Some(batch) = state.batches.get_mut(batch_id) {
                    batch.failed += 1;
                }
            }

            let snapshot = task.snapshot();
            state.failed.insert(task_id.to_string(), task);
            prune_terminal_tasks(&mut state, self.config.max_completed_tasks);
            (snapshot, recording_id, batch_id)
        };

        if let Err(e) = self.db.mark_failed(recording_id, error_message) {
            log::warn!(
                "Queue: failed to mark recording {} failed: {}",
                recording_id,
                e
            );
        }

        self.notify_error(task_id, &snapshot, error_message);
        self.notify_status(task_id, TaskStatus::Failed);

        if let Some(batch_id) = &batch_id {
            self.handle_batch_progress(batch_id);
        }

        log::error!("Queue: task {} failed: {}", task_id, error_message);
    }

    /// Terminal transition for a worker that observed its cancellation
    /// token mid-run. Artifacts already persisted are preserved.
    pub(crate) fn mark_cancelled_from_worker(&self, task_id: &str) {
        let (recording_id, batch_id) = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let Some(mut task) = state.active.remove(task_id) else {
                return;
            };

            task.status = TaskStatus::Cancelled;
            task.terminal_at = Some(Utc::now());

            let recording_id = task.data.recording_id;
            let batch_id = task.data.batch_id.clone();
            state.recording_to_task.remove(&recording_id);
            state.stats.total_cancelled += 1;

            if let Some(batch_id) = &batch_id {
                if let Some(batch) = state.batches.get_mut(batch_id) {
                    batch.cancelled += 1;
                }
            }

            state.cancelled.insert(task_id.to_string(), task);
            prune_terminal_tasks(&mut state, self.config.max_completed_tasks);
            (recording_id, batch_id)
        };

        if let Err(e) = self.db.mark_cancelled(recording_id) {
            log::warn!(
                "Queue: failed to mark recording {} cancelled: {}",
                recording_id,
                e
            );
        }

        self.notify_status(task_id, TaskStatus::Cancelled);
        if let Some(batch_id) = &batch_id {
            self.handle_batch_progress(batch_id);
        }

        log::info!("Queue: task {} cancelled during processing", task_id);
    }

    // ------------------------------------------------------------------
    // Retry
    // ------------------------------------------------------------------

    pub(crate) fn should_retry(&self, task_id: &str) -> bool {
        if !self.config.auto_retry_failed {
            return false;
        }
        let state = self.state.lock().expect("queue lock poisoned");
        state
            .active
            .get(task_id)
            .map(|task| task.retry_count < self.config.max_retry_attempts)
            .unwrap_or(false)
    }

    /// Re-enqueue a failed task after an exponential backoff, one priority
    /// level ahead of its peers.
    pub(crate) fn retry_task(self: &Arc<Self>, task_id: &str, error_message: &str) {
        let info = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let info = state.active.get_mut(task_id).map(|task| {
                task.retry_count += 1;
                task.last_error = Some(error_message.to_string());
                task.status = TaskStatus::Queued;
                task.started_at = None;
                (
                    task.data.recording_id,
                    task.retry_count,
                    task.data.priority - 1,
                    retry_delay(
                        self.config.retry_base_delay,
                        self.config.retry_max_delay,
                        task.retry_count,
                    ),
                )
            });
            if info.is_some() {
                state.stats.total_retried += 1;
            }
            info
        };
        let Some((recording_id, retry_count, priority, delay)) = info else {
            return;
        };

        if let Err(e) = self.db.set_retry_count(recording_id, retry_count) {
            log::warn!(
                "Queue: failed to persist retry count for recording {}: {}",
                recording_id,
                e
            );
        }

        log::info!(
            "Queue: retrying task {} (attempt {}) after {:.1} seconds",
            task_id,
            retry_count,
            delay.as_secs_f64()
        );

        let core = Arc::clone(self);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !core.shutdown.is_cancelled() {
                core.push_entry(priority, task_id);
            }
        });
    }

    // ------------------------------------------------------------------
    // Batch progress
    // ------------------------------------------------------------------

    /// Update durable batch counters, emit progress, and close out the
    /// batch once every member reached a terminal state.
    pub(crate) fn handle_batch_progress(&self, batch_id: &str) {
        struct Progress {
            total: u32,
            completed: u32,
            failed: u32,
            cancelled: u32,
            just_completed: bool,
            duration_secs: Option<f64>,
        }

        let progress = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let Some(batch) = state.batches.get_mut(batch_id) else {
                return;
            };
            if !batch.announced {
                // Members are still being added; the submit path reports
                // once the batch start event has fired.
                return;
            }

            let terminal = batch.completed + batch.failed + batch.cancelled;
            let done = batch.total > 0 && terminal >= batch.total;
            let just_completed = done && batch.completed_at.is_none();
            if just_completed {
                let now = Utc::now();
                batch.completed_at = Some(now);
                batch.duration_secs = batch
                    .started_at
                    .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
            }

            Progress {
                total: batch.total,
                completed: batch.completed,
                failed: batch.failed,
                cancelled: batch.cancelled,
                just_completed,
                duration_secs: batch.duration_secs,
            }
        };

        if let Err(e) =
            self.db
                .update_batch_progress(batch_id, progress.completed, progress.failed)
        {
            log::warn!("Queue: failed to update batch {} progress: {}", batch_id, e);
        }

        let extras = BatchExtras {
            failed: progress.failed,
            cancelled: progress.cancelled,
            duration_secs: progress.duration_secs,
        };

        self.notify_batch(
            BatchEvent::Progress,
            batch_id,
            progress.completed + progress.failed + progress.cancelled,
            progress.total,
            &extras,
        );

        if progress.just_completed {
            if let Err(e) = self
                .db
                .complete_batch(batch_id, progress.completed, progress.failed)
            {
                log::warn!("Queue: failed to mark batch {} completed: {}", batch_id, e);
            }

            self.notify_batch(
                BatchEvent::Completed,
                batch_id,
                progress.completed,
                progress.total,
                &extras,
            );

            log::info!(
                "Queue: batch {} completed: {} successful, {} failed, {} cancelled, {:.2}s",
                batch_id,
                progress.completed,
                progress.failed,
                progress.cancelled,
                progress.duration_secs.unwrap_or(0.0)
            );
        }
    }

    // ------------------------------------------------------------------
    // Callback dispatch
    // ------------------------------------------------------------------

    pub(crate) fn notify_status(&self, task_id: &str, status: TaskStatus) {
        let callback = self
            .callbacks
            .status
            .lock()
            .expect("queue lock poisoned")
            .clone();
        let Some(callback) = callback else { return };
        let queue_size = self.state.lock().expect("queue lock poisoned").active.len();
        invoke_guarded("status", || callback(task_id, status, queue_size));
    }

    fn notify_completion(&self, task_id: &str, task: &TaskSnapshot, result: &TaskArtifacts) {
        let callback = self
            .callbacks
            .completion
            .lock()
            .expect("queue lock poisoned")
            .clone();
        let Some(callback) = callback else { return };
        invoke_guarded("completion", || callback(task_id, task, result));
    }

    fn notify_error(&self, task_id: &str, task: &TaskSnapshot, message: &str) {
        let callback = self
            .callbacks
            .error
            .lock()
            .expect("queue lock poisoned")
            .clone();
        let Some(callback) = callback else { return };
        invoke_guarded("error", || callback(task_id, task, message));
    }

    fn notify_batch(
        &self,
        event: BatchEvent,
        batch_id: &str,
        current: u32,
        total: u32,
        extras: &BatchExtras,
    ) {
        let callback = self
            .callbacks
            .batch
            .lock()
            .expect("queue lock poisoned")
            .clone();
        let Some(callback) = callback else { return };
        invoke_guarded("batch", || callback(event, batch_id, current, total, extras));
    }

    /// Clone the fields the executor needs for one run.
    pub(crate) fn task_input(&self, task_id: &str) -> Option<executor::TaskInput> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.active.get_mut(task_id).map(|task| {
            task.started_at = Some(Utc::now());
            executor::TaskInput {
                recording_id: task.data.recording_id,
                audio_data: task.data.audio_data.clone(),
                transcript: task.data.transcript.clone().unwrap_or_default(),
                patient_name: task.data.patient_name.clone(),
                context: task.data.context.clone(),
                options: task.data.process_options,
                cancel_token: task.cancel_token.clone(),
            }
        })
    }
}

/// A callback must never take the worker down with it.
fn invoke_guarded<F: FnOnce()>(kind: &str, f: F) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        log::error!("Queue: {} callback panicked; continuing", kind);
    }
}

fn retry_delay(base: Duration, cap: Duration, retry_count: u32) -> Duration {
    let factor = 2f64.powi(retry_count.min(16) as i32);
    base.mul_f64(factor).min(cap)
}

fn prune_terminal_tasks(state: &mut QueueState, limit: usize) {
    for map in [
        &mut state.completed,
        &mut state.failed,
        &mut state.cancelled,
    ] {
        if map.len() <= limit {
            continue;
        }
        let mut by_age: Vec<(String, chrono::DateTime<Utc>)> = map
            .iter()
            .map(|(id, task)| {
                (
                    id.clone(),
                    task.terminal_at.unwrap_or(chrono::DateTime::<Utc>::MIN_UTC),
                )
            })
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        let excess = map.len() - limit;
        for (id, _) in by_age.into_iter().take(excess) {
            map.remove(&id);
        }
        log::debug!("Queue: pruned {} old terminal tasks", excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_orders_by_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(QueueEntry {
            priority: 5,
            seq: 0,
            task_id: "first-normal".into(),
        });
        heap.push(QueueEntry {
            priority: 5,
            seq: 1,
            task_id: "second-normal".into(),
        });
        heap.push(QueueEntry {
            priority: 3,
            seq: 2,
            task_id: "urgent".into(),
        });
        heap.push(QueueEntry {
            priority: 4,
            seq: 3,
            task_id: "retry".into(),
        });

        let order: Vec<String> = std::iter::from_fn(|| heap.pop().map(|e| e.task_id)).collect();
        assert_eq!(order, vec!["urgent", "retry", "first-normal", "second-normal"]);
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);
        assert_eq!(retry_delay(base, cap, 1), Duration::from_secs(1));
        assert_eq!(retry_delay(base, cap, 2), Duration::from_secs(2));
        assert_eq!(retry_delay(base, cap, 3), Duration::from_secs(4));
        // 0.5 × 2^10 = 512s, clamped to 30s.
        assert_eq!(retry_delay(base, cap, 10), cap);
    }

    #[test]
    fn test_default_worker_count_is_bounded() {
        let workers = default_worker_count();
        assert!(workers >= 1);
        assert!(workers <= 6);
    }

    #[test]
    fn test_processing_error_retryability() {
        assert!(ProcessingError::Transcription("stt down".into()).is_retryable());
        assert!(!ProcessingError::Input("too big".into()).is_retryable());
        assert!(!ProcessingError::Cancelled.is_retryable());
        assert!(!ProcessingError::AudioSave("disk full".into()).is_retryable());

        let retryable_generation = ProcessingError::Generation(GeneratorError::Api(
            crate::error::ApiError::ServiceUnavailable("down".into()),
        ));
        assert!(retryable_generation.is_retryable());

        let invalid_generation =
            ProcessingError::Generation(GeneratorError::Invalid("empty".into()));
        assert!(!invalid_generation.is_retryable());
    }
}
