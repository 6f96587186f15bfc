//! Telephony webhook ingress.
//!
//! Every delivery is authenticated, recorded in the idempotency ledger, and
//! acknowledged quickly. Processing happens in the call's worker, so the
//! handler never waits on translation, synthesis, or outbound commands.

use std::sync::Arc;

use axum::{body::Bytes, extract::Extension, http::HeaderMap, Json};
use callflow_calls::{
    attach_call_id, find_call_id_by_leg, forget_delivery, get_call, insert_call, record_activity,
    record_delivery, ActivityKind, Call, CallError, LedgerEntry,
};
use callflow_types::{LegRole, ProviderEvent, WebhookEnvelope};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{with_conn, ApiError, StorageError};
use crate::signature::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::worker::WorkerStart;
use crate::AppState;

/// What the engine did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Handed to the call's worker.
    Accepted,
    /// Already seen; nothing was done.
    Duplicate,
    /// Recorded but not acted on (unknown type, or the call already ended).
    Ignored,
    /// No call could be found for the event.
    Unresolved,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub success: bool,
    pub status: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl WebhookAck {
    fn new(status: Disposition, call_id: Option<String>) -> Json<Self> {
        Json(Self {
            success: true,
            status,
            call_id,
        })
    }
}

/// Handler for `POST /webhooks/telephony`.
pub async fn telephony_webhook_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if let Err(e) = state.verifier.verify(
        header(TIMESTAMP_HEADER),
        header(SIGNATURE_HEADER),
        &body,
        Utc::now().timestamp(),
    ) {
        tracing::warn!(error = %e, "rejected webhook delivery");
        return Err(ApiError::Unauthorized(e.to_string()));
    }

    let envelope: WebhookEnvelope = serde_json::from_slice(&body).map_err(|e| {
        ApiError::bad_request("MALFORMED_EVENT", format!("invalid event envelope: {e}"))
    })?;
    if envelope.id.trim().is_empty() {
        return Err(ApiError::bad_request("MALFORMED_EVENT", "event id is empty"));
    }
    let event = ProviderEvent::from_envelope(&envelope).map_err(|e| {
        ApiError::bad_request(
            "MALFORMED_EVENT",
            format!("invalid {} payload: {e}", envelope.event_type),
        )
    })?;

    let event_id = envelope.id.clone();
    let hinted_call_id = event.as_ref().and_then(|e| e.call_id()).map(str::to_string);
    let first_delivery = {
        let event_id = event_id.clone();
        let event_type = envelope.event_type.clone();
        let call_id = hinted_call_id.clone();
        with_conn(&state.pool, move |conn| {
            Ok(record_delivery(
                conn,
                &LedgerEntry {
                    provider_event_id: &event_id,
                    call_id: call_id.as_deref(),
                    event_type: &event_type,
                    signature_valid: true,
                },
            )?)
        })
        .await?
    };
    if !first_delivery {
        tracing::debug!(event_id = %event_id, "duplicate delivery acknowledged");
        return Ok(WebhookAck::new(Disposition::Duplicate, hinted_call_id));
    }

    let Some(event) = event else {
        tracing::info!(event_id = %event_id, event_type = %envelope.event_type, "unhandled event type recorded");
        return Ok(WebhookAck::new(Disposition::Ignored, hinted_call_id));
    };

    match route_event(&state, event).await {
        Ok((disposition, call_id)) => {
            if hinted_call_id.is_none() {
                if let Some(call_id) = call_id.clone() {
                    let attach_id = event_id.clone();
                    let attached = with_conn(&state.pool, move |conn| {
                        Ok(attach_call_id(conn, &attach_id, &call_id)?)
                    })
                    .await;
                    if let Err(e) = attached {
                        tracing::warn!(event_id = %event_id, error = %e, "failed to attach call id to ledger entry");
                    }
                }
            }
            Ok(WebhookAck::new(disposition, call_id))
        }
        Err(e) => {
            // Let the provider's retry be processed instead of acknowledged as a duplicate.
            let forget_id = event_id.clone();
            if let Err(forget_err) =
                with_conn(&state.pool, move |conn| Ok(forget_delivery(conn, &forget_id)?)).await
            {
                tracing::error!(event_id = %event_id, error = %forget_err, "failed to release ledger entry");
            }
            Err(e.into())
        }
    }
}

/// Resolves the event's call and hands the event to its worker, starting
/// one if needed.
async fn route_event(
    state: &AppState,
    event: ProviderEvent,
) -> Result<(Disposition, Option<String>), StorageError> {
    let call_id = match event.call_id() {
        Some(call_id) => Some(call_id.to_string()),
        None => {
            let leg_id = event.leg_id().to_string();
            with_conn(&state.pool, move |conn| Ok(find_call_id_by_leg(conn, &leg_id)?)).await?
        }
    };

    let event = match &call_id {
        Some(call_id) => match state.registry.send(call_id, event) {
            Ok(()) => return Ok((Disposition::Accepted, Some(call_id.clone()))),
            Err(event) => event,
        },
        None => event,
    };

    let existing = match call_id.clone() {
        Some(call_id) => {
            with_conn(&state.pool, move |conn| match get_call(conn, &call_id) {
                Ok(call) => Ok(Some(call)),
                Err(CallError::NotFound(_)) => Ok(None),
                Err(e) => Err(e.into()),
            })
            .await?
        }
        None => None,
    };

    match existing {
        Some(call) if call.status.is_terminal() => {
            tracing::info!(
                call_id = %call.call_id,
                event_type = event.event_type(),
                status = %call.status,
                "event for finished call ignored"
            );
            let detail = json!({
                "event_type": event.event_type(),
                "reason": format!("call already {}", call.status),
            });
            let id = call.call_id.clone();
            with_conn(&state.pool, move |conn| {
                record_activity(conn, &id, ActivityKind::Anomaly, &detail)?;
                Ok(())
            })
            .await?;
            Ok((Disposition::Ignored, Some(call.call_id)))
        }
        Some(call) => {
            let call_id = call.call_id.clone();
            tracing::info!(call_id = %call_id, status = %call.status, "resuming call worker");
            state.registry.spawn(&state.workers, WorkerStart::resume(call));
            match state.registry.send(&call_id, event) {
                Ok(()) => Ok((Disposition::Accepted, Some(call_id))),
                Err(_) => {
                    tracing::warn!(call_id = %call_id, "call worker exited before the event could be delivered");
                    Ok((Disposition::Ignored, Some(call_id)))
                }
            }
        }
        None => match event {
            ProviderEvent::Initiated(initiated) if initiated.leg_role == LegRole::Agent => {
                let call_id = call_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                let call = Call::initiated(
                    &call_id,
                    &initiated.tenant_id,
                    initiated.flow_type,
                    &initiated.leg_id,
                    Utc::now(),
                );
                let stored = call.clone();
                let detail = json!({
                    "source": "webhook",
                    "flow_type": initiated.flow_type,
                    "leg_id": initiated.leg_id,
                });
                with_conn(&state.pool, move |conn| {
                    insert_call(conn, &stored)?;
                    record_activity(conn, &stored.call_id, ActivityKind::Created, &detail)?;
                    Ok(())
                })
                .await?;
                tracing::info!(
                    call_id = %call_id,
                    tenant_id = %initiated.tenant_id,
                    flow_type = initiated.flow_type.as_str(),
                    "call created from provider event"
                );
                state.registry.spawn(&state.workers, WorkerStart::resume(call));
                Ok((Disposition::Accepted, Some(call_id)))
            }
            other => {
                tracing::warn!(
                    event_type = other.event_type(),
                    leg_id = other.leg_id(),
                    "event does not resolve to a known call"
                );
                Ok((Disposition::Unresolved, None))
            }
        },
    }
}
