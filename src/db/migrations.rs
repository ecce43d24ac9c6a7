//! Versioned, forward-only schema migrations.
//!
//! Applied versions are recorded in the `schema_migrations` ledger. Each
//! migration runs inside its own transaction, so a failure leaves the
//! database at the last fully-applied version.

use super::DbError;
use chrono::Utc;
use rusqlite::{params, Connection};

/// A single schema migration.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: &'static str,
}

/// The ordered migration list. Append only; never edit a shipped entry.
pub fn all() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "create_recordings",
            up: r#"
                CREATE TABLE IF NOT EXISTS recordings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    filename TEXT NOT NULL,
                    patient_name TEXT NOT NULL DEFAULT 'Patient',
                    audio_path TEXT,
                    transcript TEXT,
                    soap_note TEXT,
                    referral TEXT,
                    letter TEXT,
                    metadata TEXT,
                    processing_status TEXT NOT NULL DEFAULT 'pending',
                    error_message TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    processing_started_at TIMESTAMP,
                    processing_completed_at TIMESTAMP,
                    created_at TIMESTAMP NOT NULL,
                    updated_at TIMESTAMP NOT NULL
                );
            "#,
        },
        Migration {
            version: 2,
            name: "create_batch_processing",
            up: r#"
                CREATE TABLE IF NOT EXISTS batch_processing (
                    batch_id TEXT PRIMARY KEY,
                    total_count INTEGER NOT NULL DEFAULT 0,
                    completed_count INTEGER NOT NULL DEFAULT 0,
                    failed_count INTEGER NOT NULL DEFAULT 0,
                    created_at TIMESTAMP,
                    started_at TIMESTAMP,
                    completed_at TIMESTAMP,
                    options TEXT,
                    status TEXT NOT NULL DEFAULT 'processing'
                );
            "#,
        },
        Migration {
            version: 3,
            name: "add_recording_indexes",
            up: r#"
                CREATE INDEX IF NOT EXISTS idx_recordings_status
                    ON recordings(processing_status);
                CREATE INDEX IF NOT EXISTS idx_recordings_created_at
                    ON recordings(created_at);
            "#,
        },
    ]
}

/// Apply every migration newer than the highest recorded version.
///
/// Returns the number of migrations applied. Idempotent: a second run
/// applies nothing and adds no ledger rows.
pub fn migrate(conn: &mut Connection) -> Result<usize, DbError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP NOT NULL
        );
        "#,
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    let mut applied = 0usize;
    for migration in all() {
        if migration.version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(migration.up)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, Utc::now()],
        )?;
        tx.commit()?;

        log::info!(
            "Database: applied migration v{} ({})",
            migration.version,
            migration.name
        );
        applied += 1;
    }

    Ok(applied)
}
