//! SQLite connection pool.
//!
//! Every pooled connection is opened in WAL mode with foreign keys enforced
//! and a busy timeout, so call workers writing concurrently queue behind the
//! single writer instead of failing with `SQLITE_BUSY`.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Pool sizing and lock wait, taken from the `[database]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    pub busy_timeout_ms: u64,
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("could not open sqlite pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Journal modes a connection may end up in. `:memory:` databases cannot use
/// WAL and report `memory`.
const ACCEPTED_JOURNAL_MODES: [&str; 2] = ["wal", "memory"];

fn prepare_connection(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !ACCEPTED_JOURNAL_MODES.contains(&mode.as_str()) {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal mode stayed {mode}")),
        ));
    }
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update(None, "busy_timeout", busy_timeout_ms as i64)?;
    Ok(())
}

/// Opens the engine's database pool at `db_path`.
///
/// `:memory:` gives each pooled connection a separate database; tests that
/// share a schema across connections use a temporary file instead.
///
/// # Errors
///
/// `PoolError::PoolInit` if no connection can be opened and prepared.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| prepare_connection(conn, settings.busy_timeout_ms));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;
    tracing::debug!(
        path = db_path,
        max_size = settings.pool_max_size,
        busy_timeout_ms = settings.busy_timeout_ms,
        "sqlite pool ready"
    );
    Ok(pool)
}
