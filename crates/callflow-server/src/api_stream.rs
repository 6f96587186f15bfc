//! SSE stream of a call's translated transcript.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Extension, Path, Query},
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive},
        Sse,
    },
};
use callflow_calls::get_call;
use callflow_stream::{StreamError, StreamEvent};
use futures_util::Stream;
use serde::Deserialize;
use tokio_stream::StreamExt;

use crate::error::{with_conn, ApiError};
use crate::AppState;

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Last segment index the observer has seen.
    pub cursor: Option<u64>,
}

fn resume_cursor(query: &StreamQuery, headers: &HeaderMap) -> Option<u64> {
    query.cursor.or_else(|| {
        headers
            .get(LAST_EVENT_ID)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

fn to_sse(event: &StreamEvent) -> Option<Result<Event, Infallible>> {
    let mut sse = Event::default().event(event.kind());
    if let Some(id) = event.id() {
        sse = sse.id(id.to_string());
    }
    match sse.json_data(event) {
        Ok(sse) => Some(Ok(sse)),
        Err(e) => {
            tracing::error!("failed to serialize stream event: {}", e);
            None
        }
    }
}

/// Handler for `GET /api/calls/{call_id}/stream`.
///
/// Without a cursor the observer joins at the live tail. With one (query
/// `cursor` or the `Last-Event-ID` header) every retained segment after it
/// is replayed first, preceded by a `gap` event if some were evicted.
pub async fn call_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let cursor = resume_cursor(&query, &headers);

    let subscription = match state.hub.subscribe(&call_id, cursor) {
        Ok(subscription) => subscription,
        Err(StreamError::Closed(_)) => return Err(ApiError::Gone(format!("call {call_id} has ended"))),
        Err(_) => {
            let id = call_id.clone();
            let call = with_conn(&state.pool, move |conn| Ok(get_call(conn, &id)?)).await?;
            return Err(if call.status.is_terminal() {
                ApiError::Gone(format!("call {call_id} has ended"))
            } else {
                ApiError::NotFound(format!("no live stream for call {call_id}"))
            });
        }
    };

    tracing::info!(call_id = %call_id, cursor, "stream observer connected");
    let events = subscription.into_stream().filter_map(|event| to_sse(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn query_cursor_wins_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("4"));
        assert_eq!(
            resume_cursor(&StreamQuery { cursor: Some(9) }, &headers),
            Some(9)
        );
        assert_eq!(resume_cursor(&StreamQuery::default(), &headers), Some(4));
    }

    #[test]
    fn unparsable_header_means_live_tail() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("abc"));
        assert_eq!(resume_cursor(&StreamQuery::default(), &headers), None);
        assert_eq!(resume_cursor(&StreamQuery::default(), &HeaderMap::new()), None);
    }
}
