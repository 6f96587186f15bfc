//! Persistence for ordered segments and their translations.

use rusqlite::{ffi, params, Connection};
use serde::Serialize;

use crate::buffer::OrderedSegment;
use crate::error::TranscriptError;

/// A translation produced for one segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationRecord {
    pub segment_index: u64,
    pub source_lang: String,
    pub target_lang: String,
    pub translated_text: String,
    pub provider_used: String,
    pub latency_ms: u64,
}

/// A stored segment joined with its translation, if one exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptLine {
    pub segment_index: u64,
    pub speaker: String,
    pub text: String,
    pub translated_text: Option<String>,
    pub provider_used: Option<String>,
}

fn map_unique_violation(err: rusqlite::Error, call_id: &str, segment_index: u64) -> TranscriptError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _)
            if e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            TranscriptError::DuplicateIndex {
                call_id: call_id.to_string(),
                segment_index,
            }
        }
        other => TranscriptError::Database(other),
    }
}

/// Stores a released segment.
///
/// # Errors
///
/// Returns `TranscriptError::DuplicateIndex` if the call already has a
/// segment with this index.
pub fn insert_segment(
    conn: &Connection,
    call_id: &str,
    segment: &OrderedSegment,
) -> Result<(), TranscriptError> {
    conn.execute(
        "INSERT INTO transcription_segments (
            call_id, segment_index, provider_sequence, speaker, text,
            confidence, occurred_at, received_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            call_id,
            segment.segment_index as i64,
            segment.provider_sequence as i64,
            segment.speaker.as_str(),
            segment.text,
            f64::from(segment.confidence),
            segment.occurred_at.map(|t| t.to_rfc3339()),
            segment.received_at.to_rfc3339(),
        ],
    )
    .map_err(|e| map_unique_violation(e, call_id, segment.segment_index))?;
    Ok(())
}

/// Stores the translation of an already stored segment.
pub fn insert_translation(
    conn: &Connection,
    call_id: &str,
    record: &TranslationRecord,
) -> Result<(), TranscriptError> {
    conn.execute(
        "INSERT INTO translations (
            call_id, segment_index, source_lang, target_lang,
            translated_text, provider_used, latency_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            call_id,
            record.segment_index as i64,
            record.source_lang,
            record.target_lang,
            record.translated_text,
            record.provider_used,
            record.latency_ms as i64,
        ],
    )
    .map_err(|e| map_unique_violation(e, call_id, record.segment_index))?;
    Ok(())
}

pub fn count_segments(conn: &Connection, call_id: &str) -> Result<i64, TranscriptError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM transcription_segments WHERE call_id = ?1",
        [call_id],
        |row| row.get(0),
    )?)
}

pub fn count_translations(conn: &Connection, call_id: &str) -> Result<i64, TranscriptError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM translations WHERE call_id = ?1",
        [call_id],
        |row| row.get(0),
    )?)
}

/// Highest stored `segment_index` and provider sequence of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredMarks {
    pub last_index: u64,
    pub last_sequence: u64,
}

/// Returns where a call's stored transcript ends, or `None` if it has no
/// segments yet.
pub fn stored_marks(conn: &Connection, call_id: &str) -> Result<Option<StoredMarks>, TranscriptError> {
    let (index, sequence): (Option<i64>, Option<i64>) = conn.query_row(
        "SELECT MAX(segment_index), MAX(provider_sequence)
         FROM transcription_segments WHERE call_id = ?1",
        [call_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(index.zip(sequence).map(|(index, sequence)| StoredMarks {
        last_index: index as u64,
        last_sequence: sequence as u64,
    }))
}

/// Lists a call's transcript in `segment_index` order.
pub fn list_transcript(
    conn: &Connection,
    call_id: &str,
) -> Result<Vec<TranscriptLine>, TranscriptError> {
    let mut stmt = conn.prepare(
        "SELECT s.segment_index, s.speaker, s.text, t.translated_text, t.provider_used
         FROM transcription_segments s
         LEFT JOIN translations t
            ON t.call_id = s.call_id AND t.segment_index = s.segment_index
         WHERE s.call_id = ?1
         ORDER BY s.segment_index ASC",
    )?;
    let rows = stmt.query_map([call_id], |row| {
        Ok(TranscriptLine {
            segment_index: row.get::<_, i64>(0)? as u64,
            speaker: row.get(1)?,
            text: row.get(2)?,
            translated_text: row.get(3)?,
            provider_used: row.get(4)?,
        })
    })?;

    let mut lines = Vec::new();
    for row in rows {
        lines.push(row?);
    }
    Ok(lines)
}
