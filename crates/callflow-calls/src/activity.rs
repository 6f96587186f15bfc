//! Append-only per-call activity trail.

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::CallError;

/// What a [`CallActivity`] entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// The call record was created.
    Created,
    /// A legal status transition was applied.
    StatusChanged,
    /// An event was ignored by the state machine.
    Anomaly,
    /// An outbound provider command succeeded.
    CommandIssued,
    /// An outbound provider command failed or timed out.
    CommandFailed,
    /// The segment buffer dropped or skipped transcript segments.
    SegmentsLost,
    /// The call worker finished and released its resources.
    WorkerStopped,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::StatusChanged => "status_changed",
            Self::Anomaly => "anomaly",
            Self::CommandIssued => "command_issued",
            Self::CommandFailed => "command_failed",
            Self::SegmentsLost => "segments_lost",
            Self::WorkerStopped => "worker_stopped",
        }
    }
}

/// One row of the activity trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallActivity {
    pub id: i64,
    pub call_id: String,
    pub kind: String,
    pub detail: serde_json::Value,
    pub created_at: String,
}

/// Appends one entry to a call's activity trail and returns its row id.
///
/// # Errors
///
/// Returns `CallError::Database` on SQL failure or
/// `CallError::Serialization` if the detail cannot be serialised.
pub fn record_activity(
    conn: &Connection,
    call_id: &str,
    kind: ActivityKind,
    detail: &serde_json::Value,
) -> Result<i64, CallError> {
    let detail_json = serde_json::to_string(detail)?;
    conn.execute(
        "INSERT INTO call_activity (call_id, kind, detail_json) VALUES (?1, ?2, ?3)",
        params![call_id, kind.as_str(), detail_json],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Lists a call's activity, oldest first, bounded by `limit`.
pub fn list_activity(
    conn: &Connection,
    call_id: &str,
    limit: i64,
) -> Result<Vec<CallActivity>, CallError> {
    let mut stmt = conn.prepare(
        "SELECT id, call_id, kind, detail_json, created_at
         FROM call_activity
         WHERE call_id = ?1
         ORDER BY id ASC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![call_id, limit], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (id, call_id, kind, detail_json, created_at) = row?;
        entries.push(CallActivity {
            id,
            call_id,
            kind,
            detail: serde_json::from_str(&detail_json)?,
            created_at,
        });
    }
    Ok(entries)
}
