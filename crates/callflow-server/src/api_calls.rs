//! Call management API.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    Json,
};
use callflow_calls::{
    get_call, insert_call, list_activity, record_activity, ActivityKind, Call, CallActivity,
};
use callflow_transcript::{count_segments, count_translations, list_transcript, TranscriptLine};
use callflow_types::{CallStatus, FlowType};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::{with_conn, ApiError};
use crate::worker::WorkerStart;
use crate::AppState;

const DEFAULT_ACTIVITY_LIMIT: i64 = 100;
const MAX_ACTIVITY_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct StartCallRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub flow_type: FlowType,
    pub agent_number: String,
    #[serde(default)]
    pub customer_number: Option<String>,
    /// Caller id for both legs; falls back to `telephony.from_number`.
    #[serde(default)]
    pub from_number: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartCallResponse {
    pub call_id: String,
    pub status: CallStatus,
    pub flow_type: FlowType,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn validate(request: &StartCallRequest) -> Result<(), ApiError> {
    if request.tenant_id.trim().is_empty() {
        return Err(ApiError::bad_request("INVALID_REQUEST", "tenant_id is required"));
    }
    if request.agent_number.trim().is_empty() {
        return Err(ApiError::bad_request("INVALID_REQUEST", "agent_number is required"));
    }
    match (request.flow_type, non_empty(request.customer_number.as_deref())) {
        (FlowType::Bridge, None) => Err(ApiError::bad_request(
            "INVALID_REQUEST",
            "bridge calls require customer_number",
        )),
        (FlowType::Direct, Some(_)) => Err(ApiError::bad_request(
            "INVALID_REQUEST",
            "direct calls dial a single number; omit customer_number",
        )),
        _ => Ok(()),
    }
}

/// Handler for `POST /api/calls`.
///
/// Creates the call record and starts its worker, which dials the agent.
/// Returns before the dial completes.
pub async fn start_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<StartCallRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StartCallResponse>), ApiError> {
    let Json(request) =
        payload.map_err(|e| ApiError::bad_request("INVALID_REQUEST", e.body_text()))?;
    validate(&request)?;

    let mut call = Call::new(
        Uuid::new_v4().to_string(),
        request.tenant_id.trim(),
        request.flow_type,
        Utc::now(),
    );
    call.agent_number = Some(request.agent_number.trim().to_string());
    call.customer_number = non_empty(request.customer_number.as_deref()).map(str::to_string);

    let stored = call.clone();
    let detail = json!({
        "source": "api",
        "flow_type": call.flow_type,
    });
    with_conn(&state.pool, move |conn| {
        insert_call(conn, &stored)?;
        record_activity(conn, &stored.call_id, ActivityKind::Created, &detail)?;
        Ok(())
    })
    .await?;

    tracing::info!(
        call_id = %call.call_id,
        tenant_id = %call.tenant_id,
        flow_type = call.flow_type.as_str(),
        "call started"
    );

    let response = StartCallResponse {
        call_id: call.call_id.clone(),
        status: call.status,
        flow_type: call.flow_type,
    };
    let from_number = non_empty(request.from_number.as_deref())
        .map(str::to_string)
        .or_else(|| state.from_number.clone());
    state
        .registry
        .spawn(&state.workers, WorkerStart::dial(call, from_number));

    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Debug, Serialize)]
pub struct CallView {
    #[serde(flatten)]
    pub call: Call,
    pub segment_count: i64,
    pub translation_count: i64,
    /// True while a worker is processing the call.
    pub live: bool,
}

/// Handler for `GET /api/calls/{call_id}`.
pub async fn get_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<Json<CallView>, ApiError> {
    let id = call_id.clone();
    let (call, segment_count, translation_count) = with_conn(&state.pool, move |conn| {
        let call = get_call(conn, &id)?;
        let segments = count_segments(conn, &id)?;
        let translations = count_translations(conn, &id)?;
        Ok((call, segments, translations))
    })
    .await?;

    Ok(Json(CallView {
        call,
        segment_count,
        translation_count,
        live: state.registry.is_running(&call_id),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ActivityResponse {
    pub call_id: String,
    pub entries: Vec<CallActivity>,
}

/// Handler for `GET /api/calls/{call_id}/activity`.
pub async fn get_activity_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<ActivityResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .clamp(1, MAX_ACTIVITY_LIMIT);
    let id = call_id.clone();
    let entries = with_conn(&state.pool, move |conn| {
        get_call(conn, &id)?;
        Ok(list_activity(conn, &id, limit)?)
    })
    .await?;
    Ok(Json(ActivityResponse { call_id, entries }))
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub call_id: String,
    pub lines: Vec<TranscriptLine>,
}

/// Handler for `GET /api/calls/{call_id}/transcript`.
pub async fn get_transcript_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<Json<TranscriptResponse>, ApiError> {
    let id = call_id.clone();
    let lines = with_conn(&state.pool, move |conn| {
        get_call(conn, &id)?;
        Ok(list_transcript(conn, &id)?)
    })
    .await?;
    Ok(Json(TranscriptResponse { call_id, lines }))
}
