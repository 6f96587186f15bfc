//! Persistence for call records and their legs.
//!
//! A call row and its leg rows are always written together in one
//! transaction so the leg index never points at a call whose status lags
//! behind.

use callflow_types::{LegRole, ParseLabelError};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::CallError;
use crate::machine::{Call, Leg};

/// Inserts a new call and its known legs.
///
/// # Errors
///
/// Returns `CallError::Database` if the call id or a leg id already exists.
pub fn insert_call(conn: &Connection, call: &Call) -> Result<(), CallError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO calls (
            call_id, tenant_id, flow_type, status, amd_result,
            agent_number, customer_number, failure_reason, duration_seconds,
            created_at, answered_at, bridged_at, ended_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            call.call_id,
            call.tenant_id,
            call.flow_type.as_str(),
            call.status.as_str(),
            call.amd_result.map(|r| r.as_str()),
            call.agent_number,
            call.customer_number,
            call.failure_reason,
            call.duration_seconds,
            call.created_at.to_rfc3339(),
            call.answered_at.map(|t| t.to_rfc3339()),
            call.bridged_at.map(|t| t.to_rfc3339()),
            call.ended_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    upsert_legs(&tx, call)?;
    tx.commit()?;
    Ok(())
}

/// Writes the mutable fields of an existing call and upserts its legs.
///
/// # Errors
///
/// Returns `CallError::NotFound` if the call does not exist.
pub fn save_call(conn: &Connection, call: &Call) -> Result<(), CallError> {
    let tx = conn.unchecked_transaction()?;
    let updated = tx.execute(
        "UPDATE calls SET
            status = ?2, amd_result = ?3, failure_reason = ?4, duration_seconds = ?5,
            answered_at = ?6, bridged_at = ?7, ended_at = ?8,
            updated_at = datetime('now')
         WHERE call_id = ?1",
        params![
            call.call_id,
            call.status.as_str(),
            call.amd_result.map(|r| r.as_str()),
            call.failure_reason,
            call.duration_seconds,
            call.answered_at.map(|t| t.to_rfc3339()),
            call.bridged_at.map(|t| t.to_rfc3339()),
            call.ended_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    if updated == 0 {
        return Err(CallError::NotFound(call.call_id.clone()));
    }
    upsert_legs(&tx, call)?;
    tx.commit()?;
    Ok(())
}

fn upsert_legs(conn: &Connection, call: &Call) -> Result<(), CallError> {
    for (role, leg) in [
        (LegRole::Agent, call.agent_leg.as_ref()),
        (LegRole::Customer, call.customer_leg.as_ref()),
    ] {
        let Some(leg) = leg else { continue };
        conn.execute(
            "INSERT INTO call_legs (call_id, role, leg_id, status)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(call_id, role) DO UPDATE SET
                status = excluded.status,
                updated_at = datetime('now')",
            params![call.call_id, role.as_str(), leg.leg_id, leg.status.as_str()],
        )?;
    }
    Ok(())
}

/// Loads a call with its legs.
///
/// # Errors
///
/// Returns `CallError::NotFound` if no call has this id.
pub fn get_call(conn: &Connection, call_id: &str) -> Result<Call, CallError> {
    let mut call = conn
        .query_row(
            "SELECT
                call_id, tenant_id, flow_type, status, amd_result,
                agent_number, customer_number, failure_reason, duration_seconds,
                created_at, answered_at, bridged_at, ended_at
             FROM calls WHERE call_id = ?1",
            [call_id],
            map_row_to_call,
        )
        .optional()?
        .ok_or_else(|| CallError::NotFound(call_id.to_string()))?;

    let mut stmt =
        conn.prepare("SELECT role, leg_id, status FROM call_legs WHERE call_id = ?1")?;
    let rows = stmt.query_map([call_id], |row| {
        let role: LegRole = parse_label(row, 0)?;
        Ok((
            role,
            Leg {
                leg_id: row.get(1)?,
                status: parse_label(row, 2)?,
            },
        ))
    })?;
    for row in rows {
        let (role, leg) = row?;
        match role {
            LegRole::Agent => call.agent_leg = Some(leg),
            LegRole::Customer => call.customer_leg = Some(leg),
        }
    }
    Ok(call)
}

/// Resolves a provider leg id to the call that owns it.
pub fn find_call_id_by_leg(conn: &Connection, leg_id: &str) -> Result<Option<String>, CallError> {
    let call_id = conn
        .query_row(
            "SELECT call_id FROM call_legs WHERE leg_id = ?1",
            [leg_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(call_id)
}

fn map_row_to_call(row: &Row) -> rusqlite::Result<Call> {
    let amd_result: Option<String> = row.get(4)?;
    Ok(Call {
        call_id: row.get(0)?,
        tenant_id: row.get(1)?,
        flow_type: parse_label(row, 2)?,
        status: parse_label(row, 3)?,
        agent_leg: None,
        customer_leg: None,
        amd_result: amd_result
            .map(|s| s.parse().map_err(|e| conversion_error(4, e)))
            .transpose()?,
        agent_number: row.get(5)?,
        customer_number: row.get(6)?,
        failure_reason: row.get(7)?,
        duration_seconds: row.get(8)?,
        created_at: parse_timestamp(row, 9)?,
        answered_at: parse_optional_timestamp(row, 10)?,
        bridged_at: parse_optional_timestamp(row, 11)?,
        ended_at: parse_optional_timestamp(row, 12)?,
    })
}

fn parse_label<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = ParseLabelError>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_timestamp(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_optional_timestamp(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}
