//! Webhook dedup ledger.
//!
//! The unique key on `webhook_events.provider_event_id` is the only
//! cross-call guard against duplicate delivery: whichever request inserts
//! the row first owns the side effects, every later delivery is a no-op.

use rusqlite::{params, Connection};

use crate::error::CallError;

/// One inbound delivery to record.
#[derive(Debug, Clone, Copy)]
pub struct LedgerEntry<'a> {
    pub provider_event_id: &'a str,
    pub call_id: Option<&'a str>,
    pub event_type: &'a str,
    pub signature_valid: bool,
}

/// Records a delivery. Returns `true` if this is the first delivery of the
/// provider event id and `false` if it is a duplicate.
pub fn record_delivery(conn: &Connection, entry: &LedgerEntry<'_>) -> Result<bool, CallError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO webhook_events
            (provider_event_id, call_id, event_type, signature_valid)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            entry.provider_event_id,
            entry.call_id,
            entry.event_type,
            entry.signature_valid,
        ],
    )?;
    Ok(inserted == 1)
}

/// Fills in the call id of a ledger row recorded before the call existed.
pub fn attach_call_id(
    conn: &Connection,
    provider_event_id: &str,
    call_id: &str,
) -> Result<(), CallError> {
    conn.execute(
        "UPDATE webhook_events SET call_id = ?2
         WHERE provider_event_id = ?1 AND call_id IS NULL",
        params![provider_event_id, call_id],
    )?;
    Ok(())
}

/// Removes a delivery whose processing failed, so the provider's retry is
/// treated as a first delivery.
pub fn forget_delivery(conn: &Connection, provider_event_id: &str) -> Result<(), CallError> {
    conn.execute(
        "DELETE FROM webhook_events WHERE provider_event_id = ?1",
        [provider_event_id],
    )?;
    Ok(())
}

/// Counts ledger rows for a provider event id (zero or one).
pub fn delivery_count(conn: &Connection, provider_event_id: &str) -> Result<i64, CallError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM webhook_events WHERE provider_event_id = ?1",
        [provider_event_id],
        |row| row.get(0),
    )?;
    Ok(count)
}
