//! Pooled SQLite connections.
//!
//! Every connection is initialized with WAL journaling, enforced foreign
//! keys and a 64 MB page cache. Checked-out connections are probed first,
//! so a broken connection is discarded and replaced without shrinking the
//! pool.

use super::DbError;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Build a connection pool for the database at `path`.
///
/// The parent directory is created if missing. Acquisition blocks up to
/// `timeout` before failing with a pool error.
pub fn build_pool(path: &Path, pool_size: u32, timeout: Duration) -> Result<DbPool, DbError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys=ON;
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA cache_size=-64000;
            PRAGMA temp_store=MEMORY;
            PRAGMA optimize;
            "#,
        )
    });

    let pool = r2d2::Pool::builder()
        .max_size(pool_size)
        .connection_timeout(timeout)
        .test_on_check_out(true)
        .build(manager)?;

    log::info!(
        "Database: connection pool initialized with {} connections ({})",
        pool_size,
        path.display()
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_applies_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let pool = build_pool(&dir.path().join("test.db"), 2, Duration::from_secs(5)).unwrap();

        let conn = pool.get().unwrap();
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let foreign_keys: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn test_pool_size_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = build_pool(&dir.path().join("test.db"), 2, Duration::from_millis(100)).unwrap();

        let _a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        // Pool exhausted: the third acquisition must time out.
        assert!(pool.get().is_err());
    }
}
