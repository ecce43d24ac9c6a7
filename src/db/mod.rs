//! Durable storage for recordings and batches.
//!
//! The [`Database`] facade owns all writes to the recording store. Queue
//! code never touches SQL directly; it goes through the methods here so
//! status transitions and timestamps stay consistent.

pub mod migrations;
pub mod pool;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub use pool::{DbConnection, DbPool};

/// Errors from the persistence layer. Not retryable; they surface to the
/// caller and mark the task failed.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Database I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of a persisted recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            "cancelled" => Some(ProcessingStatus::Cancelled),
            _ => None,
        }
    }
}

/// One persisted consultation recording.
#[derive(Debug, Clone)]
pub struct Recording {
    pub id: i64,
    pub filename: String,
    pub patient_name: String,
    pub audio_path: Option<String>,
    pub transcript: Option<String>,
    pub soap_note: Option<String>,
    pub referral: Option<String>,
    pub letter: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub processing_status: ProcessingStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a new recording row.
#[derive(Debug, Clone, Default)]
pub struct NewRecording {
    pub filename: String,
    pub patient_name: String,
    pub audio_path: Option<String>,
    pub transcript: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// One row of the durable batch ledger.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub batch_id: String,
    pub total_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub options: Option<serde_json::Value>,
    pub status: String,
}

/// Pooled database facade.
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date.
    pub fn open(path: &Path, pool_size: u32, timeout: Duration) -> Result<Self, DbError> {
        let pool = pool::build_pool(path, pool_size, timeout)?;
        let mut conn = pool.get()?;
        migrations::migrate(&mut conn)?;
        Ok(Self { pool })
    }

    /// Borrow a connection from the pool.
    pub fn conn(&self) -> Result<DbConnection, DbError> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside a transaction: commit on `Ok`, rollback on `Err`.
    ///
    /// The connection returns to the pool either way.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, DbError>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Recording CRUD
    // ------------------------------------------------------------------

    /// Insert a new recording with status `pending`, returning its id.
    pub fn add_recording(&self, new: NewRecording) -> Result<i64, DbError> {
        let now = Utc::now();
        let metadata = new
            .metadata
            .as_ref()
            .map(|value| value.to_string());

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO recordings
                (filename, patient_name, audio_path, transcript, metadata,
                 processing_status, retry_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)
            "#,
            params![
                new.filename,
                new.patient_name,
                new.audio_path,
                new.transcript,
                metadata,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Load a recording by id.
    pub fn get_recording(&self, id: i64) -> Result<Option<Recording>, DbError> {
        let conn = self.conn()?;
        let recording = conn
            .query_row(
                "SELECT * FROM recordings WHERE id = ?1",
                params![id],
                row_to_recording,
            )
            .optional()?;
        Ok(recording)
    }

    /// All recordings in a given status, newest first.
    pub fn recordings_with_status(
        &self,
        status: ProcessingStatus,
    ) -> Result<Vec<Recording>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM recordings WHERE processing_status = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![status.as_str()], row_to_recording)?;
        let mut recordings = Vec::new();
        for row in rows {
            recordings.push(row?);
        }
        Ok(recordings)
    }

    pub fn set_transcript(&self, id: i64, transcript: &str) -> Result<(), DbError> {
        self.update_text_column(id, "transcript", transcript)
    }

    pub fn set_soap_note(&self, id: i64, soap_note: &str) -> Result<(), DbError> {
        self.update_text_column(id, "soap_note", soap_note)
    }

    pub fn set_referral(&self, id: i64, referral: &str) -> Result<(), DbError> {
        self.update_text_column(id, "referral", referral)
    }

    pub fn set_letter(&self, id: i64, letter: &str) -> Result<(), DbError> {
        self.update_text_column(id, "letter", letter)
    }

    pub fn set_audio_path(&self, id: i64, audio_path: &str) -> Result<(), DbError> {
        self.update_text_column(id, "audio_path", audio_path)
    }

    pub fn set_retry_count(&self, id: i64, retry_count: u32) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE recordings SET retry_count = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, retry_count, Utc::now()],
        )?;
        Ok(())
    }

    /// Transition to `processing` and stamp `processing_started_at`.
    pub fn mark_processing(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE recordings
            SET processing_status = 'processing', processing_started_at = ?2,
                updated_at = ?2
            WHERE id = ?1
            "#,
            params![id, Utc::now()],
        )?;
        Ok(())
    }

    /// Transition to `completed` and stamp `processing_completed_at`.
    pub fn mark_completed(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE recordings
            SET processing_status = 'completed', processing_completed_at = ?2,
                error_message = NULL, updated_at = ?2
            WHERE id = ?1
            "#,
            params![id, Utc::now()],
        )?;
        Ok(())
    }

    /// Transition to `failed` with a terminal error message.
    pub fn mark_failed(&self, id: i64, error_message: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE recordings
            SET processing_status = 'failed', error_message = ?2, updated_at = ?3
            WHERE id = ?1
            "#,
            params![id, error_message, Utc::now()],
        )?;
        Ok(())
    }

    /// Transition to `cancelled`. Artifacts persisted so far are kept.
    pub fn mark_cancelled(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE recordings
            SET processing_status = 'cancelled', updated_at = ?2
            WHERE id = ?1
            "#,
            params![id, Utc::now()],
        )?;
        Ok(())
    }

    /// Clear failure state ahead of a reprocess: back to `pending`, error
    /// and retry count cleared, processing timestamps nulled.
    pub fn reset_for_reprocess(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE recordings
            SET processing_status = 'pending', error_message = NULL,
                retry_count = 0, processing_started_at = NULL,
                processing_completed_at = NULL, updated_at = ?2
            WHERE id = ?1
            "#,
            params![id, Utc::now()],
        )?;
        Ok(())
    }

    pub fn delete_recording(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM recordings WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn update_text_column(&self, id: i64, column: &str, value: &str) -> Result<(), DbError> {
        // Column names come from the fixed callers above, never from input.
        let sql = format!(
            "UPDATE recordings SET {} = ?2, updated_at = ?3 WHERE id = ?1",
            column
        );
        let conn = self.conn()?;
        conn.execute(&sql, params![id, value, Utc::now()])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batch ledger
    // ------------------------------------------------------------------

    /// Create or replace a batch row in `processing` state.
    pub fn upsert_batch(
        &self,
        batch_id: &str,
        total: u32,
        options: Option<&serde_json::Value>,
    ) -> Result<(), DbError> {
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO batch_processing
                (batch_id, total_count, completed_count, failed_count,
                 created_at, started_at, options, status)
            VALUES (?1, ?2, 0, 0, ?3, ?3, ?4, 'processing')
            "#,
            params![batch_id, total, now, options.map(|v| v.to_string())],
        )?;
        Ok(())
    }

    pub fn update_batch_progress(
        &self,
        batch_id: &str,
        completed: u32,
        failed: u32,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE batch_processing
            SET completed_count = ?2, failed_count = ?3
            WHERE batch_id = ?1
            "#,
            params![batch_id, completed, failed],
        )?;
        Ok(())
    }

    /// Record final counters and mark the batch `completed`.
    pub fn complete_batch(
        &self,
        batch_id: &str,
        completed: u32,
        failed: u32,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE batch_processing
            SET completed_count = ?2, failed_count = ?3, completed_at = ?4,
                status = 'completed'
            WHERE batch_id = ?1
            "#,
            params![batch_id, completed, failed, Utc::now()],
        )?;
        Ok(())
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRow>, DbError> {
        let conn = self.conn()?;
        let batch = conn
            .query_row(
                r#"
                SELECT batch_id, total_count, completed_count, failed_count,
                       created_at, started_at, completed_at, options, status
                FROM batch_processing WHERE batch_id = ?1
                "#,
                params![batch_id],
                |row| {
                    let options: Option<String> = row.get(7)?;
                    Ok(BatchRow {
                        batch_id: row.get(0)?,
                        total_count: row.get(1)?,
                        completed_count: row.get(2)?,
                        failed_count: row.get(3)?,
                        created_at: row.get(4)?,
                        started_at: row.get(5)?,
                        completed_at: row.get(6)?,
                        options: options.and_then(|s| serde_json::from_str(&s).ok()),
                        status: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(batch)
    }
}

fn row_to_recording(row: &Row<'_>) -> rusqlite::Result<Recording> {
    let metadata: Option<String> = row.get("metadata")?;
    let status: String = row.get("processing_status")?;
    Ok(Recording {
        id: row.get("id")?,
        filename: row.get("filename")?,
        patient_name: row.get("patient_name")?,
        audio_path: row.get("audio_path")?,
        transcript: row.get("transcript")?,
        soap_note: row.get("soap_note")?,
        referral: row.get("referral")?,
        letter: row.get("letter")?,
        metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
        processing_status: ProcessingStatus::parse(&status)
            .unwrap_or(ProcessingStatus::Pending),
        error_message: row.get("error_message")?,
        retry_count: row.get("retry_count")?,
        processing_started_at: row.get("processing_started_at")?,
        processing_completed_at: row.get("processing_completed_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db"), 2, Duration::from_secs(5)).unwrap();
        (dir, db)
    }

    #[test]
    fn test_recording_insert_and_load() {
        let (_dir, db) = open_test_db();

        let id = db
            .add_recording(NewRecording {
                filename: "consult.wav".into(),
                patient_name: "Alice".into(),
                transcript: Some("hello".into()),
                metadata: Some(serde_json::json!({"context": "follow-up"})),
                ..Default::default()
            })
            .unwrap();

        let recording = db.get_recording(id).unwrap().unwrap();
        assert_eq!(recording.patient_name, "Alice");
        assert_eq!(recording.transcript.as_deref(), Some("hello"));
        assert_eq!(recording.processing_status, ProcessingStatus::Pending);
        assert_eq!(recording.retry_count, 0);
        assert_eq!(
            recording.metadata.unwrap()["context"],
            serde_json::json!("follow-up")
        );
    }

    #[test]
    fn test_status_transitions_stamp_timestamps() {
        let (_dir, db) = open_test_db();
        let id = db
            .add_recording(NewRecording {
                filename: "a.wav".into(),
                patient_name: "Bob".into(),
                ..Default::default()
            })
            .unwrap();

        db.mark_processing(id).unwrap();
        let recording = db.get_recording(id).unwrap().unwrap();
        assert_eq!(recording.processing_status, ProcessingStatus::Processing);
        assert!(recording.processing_started_at.is_some());
        assert!(recording.processing_completed_at.is_none());

        db.mark_completed(id).unwrap();
        let recording = db.get_recording(id).unwrap().unwrap();
        assert_eq!(recording.processing_status, ProcessingStatus::Completed);
        assert!(recording.processing_completed_at.is_some());
    }

    #[test]
    fn test_failed_rows_carry_error_and_reset_clears_it() {
        let (_dir, db) = open_test_db();
        let id = db
            .add_recording(NewRecording {
                filename: "a.wav".into(),
                patient_name: "Cara".into(),
                ..Default::default()
            })
            .unwrap();

        db.set_retry_count(id, 3).unwrap();
        db.mark_failed(id, "ServiceUnavailable: all providers failed")
            .unwrap();
        let recording = db.get_recording(id).unwrap().unwrap();
        assert_eq!(recording.processing_status, ProcessingStatus::Failed);
        assert!(recording
            .error_message
            .as_deref()
            .unwrap()
            .contains("ServiceUnavailable"));
        assert_eq!(recording.retry_count, 3);

        db.reset_for_reprocess(id).unwrap();
        let recording = db.get_recording(id).unwrap().unwrap();
        assert_eq!(recording.processing_status, ProcessingStatus::Pending);
        assert!(recording.error_message.is_none());
        assert_eq!(recording.retry_count, 0);
        assert!(recording.processing_started_at.is_none());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let (_dir, db) = open_test_db();

        let result: Result<(), DbError> = db.transaction(|tx| {
            tx.execute(
                r#"
                INSERT INTO recordings (filename, patient_name, created_at, updated_at)
                VALUES ('x.wav', 'X', ?1, ?1)
                "#,
                params![Utc::now()],
            )?;
            // Constraint failure: duplicate primary key on the ledger.
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (1, 'dup', ?1)",
                params![Utc::now()],
            )?;
            Ok(())
        });
        assert!(result.is_err());

        let count: i64 = db
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM recordings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_batch_ledger_lifecycle() {
        let (_dir, db) = open_test_db();

        db.upsert_batch("batch-1", 5, Some(&serde_json::json!({"priority": 2})))
            .unwrap();
        db.update_batch_progress("batch-1", 2, 1).unwrap();

        let batch = db.get_batch("batch-1").unwrap().unwrap();
        assert_eq!(batch.total_count, 5);
        assert_eq!(batch.completed_count, 2);
        assert_eq!(batch.failed_count, 1);
        assert_eq!(batch.status, "processing");
        assert!(batch.completed_at.is_none());

        db.complete_batch("batch-1", 4, 1).unwrap();
        let batch = db.get_batch("batch-1").unwrap().unwrap();
        assert_eq!(batch.status, "completed");
        assert!(batch.completed_at.is_some());
    }

    #[test]
    fn test_recordings_with_status() {
        let (_dir, db) = open_test_db();
        let a = db
            .add_recording(NewRecording {
                filename: "a.wav".into(),
                patient_name: "A".into(),
                ..Default::default()
            })
            .unwrap();
        let b = db
            .add_recording(NewRecording {
                filename: "b.wav".into(),
                patient_name: "B".into(),
                ..Default::default()
            })
            .unwrap();
        db.mark_failed(a, "boom").unwrap();

        let failed = db.recordings_with_status(ProcessingStatus::Failed).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a);

        let pending = db
            .recordings_with_status(ProcessingStatus::Pending)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b);
    }
}
