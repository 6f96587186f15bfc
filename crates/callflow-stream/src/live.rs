//! One call's live stream.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use callflow_types::CallStatus;
use futures_util::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;

use crate::error::StreamError;
use crate::event::{SegmentEvent, StreamEvent};

#[derive(Debug)]
struct Inner {
    replay: VecDeque<SegmentEvent>,
    last_index: u64,
    closed: Option<(CallStatus, Instant)>,
}

/// Append-only, replayable fan-out of one call's translated segments.
///
/// Publishing and subscribing both happen under the same lock, so a new
/// subscriber's replay snapshot and its live receiver never overlap or leave
/// a hole between them.
#[derive(Debug)]
pub struct LiveStream {
    call_id: String,
    replay_depth: usize,
    tx: broadcast::Sender<StreamEvent>,
    inner: Mutex<Inner>,
}

impl LiveStream {
    pub fn new(call_id: impl Into<String>, replay_depth: usize, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            call_id: call_id.into(),
            replay_depth: replay_depth.max(1),
            tx,
            inner: Mutex::new(Inner {
                replay: VecDeque::new(),
                last_index: 0,
                closed: None,
            }),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Appends a segment. Out-of-order or repeated indexes are rejected.
    pub fn publish(&self, event: SegmentEvent) -> Result<(), StreamError> {
        let mut inner = self.lock();
        if inner.closed.is_some() {
            return Err(StreamError::Closed(self.call_id.clone()));
        }
        if event.segment_index <= inner.last_index {
            tracing::error!(
                call_id = %self.call_id,
                segment_index = event.segment_index,
                last_index = inner.last_index,
                "refusing to publish non-increasing segment index"
            );
            return Err(StreamError::OutOfOrder {
                call_id: self.call_id.clone(),
                segment_index: event.segment_index,
                last_index: inner.last_index,
            });
        }
        inner.last_index = event.segment_index;
        inner.replay.push_back(event.clone());
        while inner.replay.len() > self.replay_depth {
            inner.replay.pop_front();
        }
        // No receivers is fine: late observers resume from the replay buffer.
        let _ = self.tx.send(StreamEvent::Segment(event));
        Ok(())
    }

    /// Emits the terminal event and refuses further subscriptions.
    pub fn close(&self, status: CallStatus) {
        let mut inner = self.lock();
        if inner.closed.is_some() {
            return;
        }
        inner.closed = Some((status, Instant::now()));
        let _ = self.tx.send(StreamEvent::End { status });
        tracing::debug!(
            call_id = %self.call_id,
            last_index = inner.last_index,
            "live stream closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub(crate) fn closed_at(&self) -> Option<Instant> {
        self.lock().closed.map(|(_, at)| at)
    }

    pub fn last_index(&self) -> u64 {
        self.lock().last_index
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Subscribes an observer.
    ///
    /// With a cursor the observer first receives every buffered segment after
    /// it, preceded by a gap marker if the buffer no longer reaches back that
    /// far. Without a cursor it receives only segments published from now on.
    pub fn subscribe(&self, cursor: Option<u64>) -> Result<Subscription, StreamError> {
        let inner = self.lock();
        if inner.closed.is_some() {
            return Err(StreamError::Closed(self.call_id.clone()));
        }

        let mut backlog = VecDeque::new();
        let last_seen = match cursor {
            Some(cursor) if cursor < inner.last_index => {
                let oldest = inner
                    .replay
                    .front()
                    .map_or(inner.last_index + 1, |e| e.segment_index);
                if cursor + 1 < oldest {
                    backlog.push_back(StreamEvent::Gap {
                        from_index: cursor + 1,
                        to_index: oldest - 1,
                    });
                }
                backlog.extend(
                    inner
                        .replay
                        .iter()
                        .filter(|e| e.segment_index > cursor)
                        .cloned()
                        .map(StreamEvent::Segment),
                );
                inner.last_index
            }
            Some(cursor) => cursor,
            None => inner.last_index,
        };

        Ok(Subscription {
            call_id: self.call_id.clone(),
            backlog,
            rx: self.tx.subscribe(),
            last_seen,
            done: false,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One observer's view: replayed backlog followed by the live tail.
#[derive(Debug)]
pub struct Subscription {
    call_id: String,
    backlog: VecDeque<StreamEvent>,
    rx: broadcast::Receiver<StreamEvent>,
    last_seen: u64,
    done: bool,
}

impl Subscription {
    /// Next event for this observer, or `None` once the stream has ended.
    ///
    /// Live segments already covered by the backlog are skipped. A jump in
    /// `segment_index` (after a broadcast lag) is reported as a gap marker
    /// before the segment that follows it.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(StreamEvent::Segment(segment)) => {
                    let index = segment.segment_index;
                    if index <= self.last_seen {
                        continue;
                    }
                    let expected = self.last_seen + 1;
                    self.last_seen = index;
                    if index > expected {
                        self.backlog.push_back(StreamEvent::Segment(segment));
                        return Some(StreamEvent::Gap {
                            from_index: expected,
                            to_index: index - 1,
                        });
                    }
                    return Some(StreamEvent::Segment(segment));
                }
                Ok(event @ StreamEvent::End { .. }) => {
                    self.done = true;
                    return Some(event);
                }
                Ok(event @ StreamEvent::Gap { .. }) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        call_id = %self.call_id,
                        skipped,
                        "stream observer lagged; a gap marker will follow"
                    );
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            let event = sub.next_event().await?;
            Some((event, sub))
        })
    }
}
