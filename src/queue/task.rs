//! Task, batch and callback types for the processing queue.

use crate::audio::AudioData;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Which artifacts to generate for a recording.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOptions {
    pub generate_soap: bool,
    pub generate_referral: bool,
    pub generate_letter: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            generate_soap: true,
            generate_referral: false,
            generate_letter: false,
        }
    }
}

/// A recording submission, as accepted by `ProcessingQueue::add_recording`.
#[derive(Debug, Clone)]
pub struct RecordingTaskData {
    /// Database id of the recording row this task processes.
    pub recording_id: i64,
    /// Captured audio; `None` when a transcript is already available.
    pub audio_data: Option<AudioData>,
    /// Existing transcript. When present, transcription is skipped.
    pub transcript: Option<String>,
    pub patient_name: String,
    /// Consultation context injected into the SOAP prompt.
    pub context: String,
    pub process_options: ProcessOptions,
    /// 0-10; lower values are dispatched sooner.
    pub priority: i32,
    pub batch_id: Option<String>,
    pub batch_options: Option<serde_json::Value>,
}

impl RecordingTaskData {
    pub fn new(recording_id: i64) -> Self {
        Self {
            recording_id,
            audio_data: None,
            transcript: None,
            patient_name: "Patient".to_string(),
            context: String::new(),
            process_options: ProcessOptions::default(),
            priority: 5,
            batch_id: None,
            batch_options: None,
        }
    }

    pub fn with_audio(mut self, audio: AudioData) -> Self {
        self.audio_data = Some(audio);
        self
    }

    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcript = Some(transcript.into());
        self
    }

    pub fn with_patient_name(mut self, name: impl Into<String>) -> Self {
        self.patient_name = name.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_options(mut self, options: ProcessOptions) -> Self {
        self.process_options = options;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// In-memory lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Artifacts produced by a completed task.
#[derive(Debug, Clone, Default)]
pub struct TaskArtifacts {
    pub success: bool,
    pub transcript: String,
    pub soap_note: String,
    pub referral: String,
    pub letter: String,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock processing time in seconds.
    pub processing_time: Option<f64>,
    /// Transcription metadata (provider used, failover attempts, ...).
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// In-flight handle for one recording, owned by the queue.
#[derive(Debug)]
pub(crate) struct RecordingTask {
    pub task_id: String,
    pub data: RecordingTaskData,
    pub status: TaskStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the task reaches a terminal state; pruning key.
    pub terminal_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub processing_time: Option<f64>,
    pub result: Option<TaskArtifacts>,
    pub cancel_token: CancellationToken,
}

impl RecordingTask {
    pub fn new(task_id: String, data: RecordingTaskData) -> Self {
        Self {
            task_id,
            data,
            status: TaskStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            terminal_at: None,
            retry_count: 0,
            last_error: None,
            processing_time: None,
            result: None,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Read-only copy without the audio payload.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            recording_id: self.data.recording_id,
            patient_name: self.data.patient_name.clone(),
            status: self.status,
            priority: self.data.priority,
            batch_id: self.data.batch_id.clone(),
            queued_at: self.queued_at,
            started_at: self.started_at,
            terminal_at: self.terminal_at,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            processing_time: self.processing_time,
            result: self.result.clone(),
        }
    }
}

/// Read-only view of a task, returned from status queries and callbacks.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub recording_id: i64,
    pub patient_name: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub batch_id: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub processing_time: Option<f64>,
    pub result: Option<TaskArtifacts>,
}

/// In-memory accounting for one batch.
#[derive(Debug)]
pub(crate) struct BatchState {
    /// Whether the batch `started` event has fired. Progress reporting
    /// waits for it so events arrive in order while members are still
    /// being added.
    pub announced: bool,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
    pub task_ids: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub options: Option<serde_json::Value>,
}

impl Default for BatchState {
    fn default() -> Self {
        Self {
            // Ad-hoc batches (members submitted directly with a batch id)
            // report immediately; `add_batch_recordings` flips this off
            // until its start event has fired.
            announced: true,
            total: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            task_ids: Vec::new(),
            started_at: None,
            completed_at: None,
            duration_secs: None,
            options: None,
        }
    }
}

/// Read-only view of a batch.
#[derive(Debug, Clone)]
pub struct BatchSnapshot {
    pub batch_id: String,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
    pub in_progress: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub options: Option<serde_json::Value>,
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub total_queued: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_deduplicated: u64,
    pub total_cancelled: u64,
    /// Running average of wall-clock processing time, in seconds.
    pub processing_time_avg: f64,
}

/// Snapshot returned by `ProcessingQueue::get_status`.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub stats: QueueStats,
    pub workers: usize,
}

/// Lifecycle events reported through the batch callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    Started,
    Progress,
    Completed,
}

impl BatchEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchEvent::Started => "started",
            BatchEvent::Progress => "progress",
            BatchEvent::Completed => "completed",
        }
    }
}

/// Extra counters attached to batch callback invocations.
#[derive(Debug, Clone, Default)]
pub struct BatchExtras {
    pub failed: u32,
    pub cancelled: u32,
    pub duration_secs: Option<f64>,
}

/// Called on every task status change: `(task_id, status, active_count)`.
pub type StatusCallback = Arc<dyn Fn(&str, TaskStatus, usize) + Send + Sync>;

/// Called when a task completes: `(task_id, task, result)`.
pub type CompletionCallback = Arc<dyn Fn(&str, &TaskSnapshot, &TaskArtifacts) + Send + Sync>;

/// Called when a task fails terminally: `(task_id, task, message)`.
pub type ErrorCallback = Arc<dyn Fn(&str, &TaskSnapshot, &str) + Send + Sync>;

/// Called on batch lifecycle events:
/// `(event, batch_id, current, total, extras)`.
pub type BatchCallback = Arc<dyn Fn(BatchEvent, &str, u32, u32, &BatchExtras) + Send + Sync>;
