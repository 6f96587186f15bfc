//! Schema migrations compiled into the binary.
//!
//! Each entry in [`MIGRATIONS`] is applied at most once, in list order,
//! inside its own transaction. Applied names are recorded in
//! `_callflow_migrations`; renaming an entry makes it run again.

use std::collections::HashSet;

use rusqlite::Connection;
use thiserror::Error;

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS _callflow_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// `(name, sql)` pairs. Append only.
const MIGRATIONS: &[(&str, &str)] = &[
    ("000_init", include_str!("migrations/000_init.sql")),
    ("001_calls", include_str!("migrations/001_calls.sql")),
    ("002_webhook_events", include_str!("migrations/002_webhook_events.sql")),
    ("003_transcripts", include_str!("migrations/003_transcripts.sql")),
    ("004_call_activity", include_str!("migrations/004_call_activity.sql")),
    (
        "005_tenant_translation_config",
        include_str!("migrations/005_tenant_translation_config.sql"),
    ),
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    #[error("could not read applied migrations: {0}")]
    StateQuery(rusqlite::Error),
}

/// Brings the schema up to date. Returns how many migrations were applied.
///
/// # Errors
///
/// `MigrationError::ExecutionFailed` names the migration that failed; its
/// statements are rolled back.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

fn applied_names(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM _callflow_migrations")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    names.collect()
}

fn apply(conn: &Connection, migrations: &[(&'static str, &'static str)]) -> Result<usize, MigrationError> {
    conn.execute_batch(TRACKING_TABLE)
        .map_err(|source| MigrationError::ExecutionFailed {
            name: "_callflow_migrations".to_string(),
            source,
        })?;
    let done = applied_names(conn).map_err(MigrationError::StateQuery)?;

    let mut count = 0;
    for &(name, sql) in migrations {
        if done.contains(name) {
            continue;
        }
        let failed = |source| MigrationError::ExecutionFailed {
            name: name.to_string(),
            source,
        };
        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(sql).map_err(failed)?;
        tx.execute("INSERT INTO _callflow_migrations (name) VALUES (?1)", [name])
            .map_err(failed)?;
        tx.commit().map_err(failed)?;
        tracing::info!(migration = name, "migration applied");
        count += 1;
    }
    if count == 0 {
        tracing::debug!("schema up to date");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrated() -> Connection {
        let conn = Connection::open_in_memory().expect("in-memory db");
        run_migrations(&conn).expect("migrations should apply");
        conn
    }

    fn has_table(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .expect("sqlite_master should be readable")
    }

    #[test]
    fn second_run_applies_nothing() {
        let conn = migrated();
        let recorded: usize = conn
            .query_row("SELECT COUNT(*) FROM _callflow_migrations", [], |row| row.get(0))
            .expect("count");
        assert_eq!(recorded, MIGRATIONS.len());
        assert_eq!(run_migrations(&conn).expect("rerun"), 0);
    }

    #[test]
    fn schema_has_every_engine_table() {
        let conn = migrated();
        for table in [
            "calls",
            "call_legs",
            "webhook_events",
            "transcription_segments",
            "translations",
            "call_activity",
            "tenant_translation_config",
        ] {
            assert!(has_table(&conn, table), "missing {table}");
        }
    }

    #[test]
    fn ledger_rejects_repeated_event_ids() {
        let conn = migrated();
        let insert = "INSERT OR IGNORE INTO webhook_events
            (provider_event_id, call_id, event_type, signature_valid)
            VALUES ('evt_1', 'c1', 'call.answered', 1)";
        assert_eq!(conn.execute(insert, []).expect("first insert"), 1);
        assert_eq!(conn.execute(insert, []).expect("second insert"), 0);
    }

    #[test]
    fn failed_migration_leaves_no_partial_schema() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        let broken = [(
            "001_half_applied",
            "CREATE TABLE half_applied (id INTEGER PRIMARY KEY);
             INSERT INTO no_such_table VALUES (1);",
        )];

        match apply(&conn, &broken) {
            Err(MigrationError::ExecutionFailed { name, .. }) => {
                assert_eq!(name, "001_half_applied")
            }
            other => panic!("expected execution failure, got {other:?}"),
        }
        assert!(!has_table(&conn, "half_applied"));
    }
}
