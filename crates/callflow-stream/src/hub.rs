//! Registry of live streams keyed by call id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use callflow_types::CallStatus;
use tokio::time::Instant;

use crate::error::StreamError;
use crate::live::{LiveStream, Subscription};

/// Stream sizing shared by every call.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Segments kept for resuming observers.
    pub replay_depth: usize,
    /// Live events an observer may fall behind before it lags.
    pub broadcast_capacity: usize,
    /// How long a closed stream keeps answering "closed" before it is dropped.
    pub linger: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            replay_depth: 256,
            broadcast_capacity: 64,
            linger: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
pub struct StreamHub {
    settings: StreamSettings,
    streams: RwLock<HashMap<String, Arc<LiveStream>>>,
}

impl StreamHub {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the call's open stream, creating it on first use.
    ///
    /// A closed stream left over from an earlier worker of the same call is
    /// replaced, so a resumed call publishes to a live stream.
    pub fn open(&self, call_id: &str) -> Arc<LiveStream> {
        if let Some(stream) = self.get(call_id).filter(|s| !s.is_closed()) {
            return stream;
        }
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = streams.get(call_id).filter(|s| !s.is_closed()) {
            return Arc::clone(stream);
        }
        let stream = Arc::new(LiveStream::new(
            call_id,
            self.settings.replay_depth,
            self.settings.broadcast_capacity,
        ));
        if streams.insert(call_id.to_string(), Arc::clone(&stream)).is_some() {
            tracing::info!(call_id, "replaced closed live stream");
        }
        stream
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<LiveStream>> {
        self.streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(call_id)
            .cloned()
    }

    /// Subscribes to an existing stream.
    ///
    /// # Errors
    ///
    /// `StreamError::NotFound` if the call has no stream (never started, or
    /// dropped after lingering); `StreamError::Closed` if it has ended.
    pub fn subscribe(&self, call_id: &str, cursor: Option<u64>) -> Result<Subscription, StreamError> {
        self.get(call_id)
            .ok_or_else(|| StreamError::NotFound(call_id.to_string()))?
            .subscribe(cursor)
    }

    /// Closes a call's stream, if it has one.
    pub fn close(&self, call_id: &str, status: CallStatus) {
        if let Some(stream) = self.get(call_id) {
            stream.close(status);
        }
    }

    /// Drops closed streams whose linger period has passed. Returns how many
    /// were removed.
    pub fn sweep_closed(&self, now: Instant) -> usize {
        let linger = self.settings.linger;
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        let before = streams.len();
        streams.retain(|_, stream| {
            stream
                .closed_at()
                .map_or(true, |at| now.saturating_duration_since(at) < linger)
        });
        before - streams.len()
    }

    pub fn len(&self) -> usize {
        self.streams.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
