//! Error types for live streams.

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The call ended; its stream accepts no new observers or segments.
    #[error("stream closed for call {0}")]
    Closed(String),

    /// No stream exists for the call.
    #[error("no stream for call {0}")]
    NotFound(String),

    #[error("segment {segment_index} published after {last_index} on call {call_id}")]
    OutOfOrder {
        call_id: String,
        segment_index: u64,
        last_index: u64,
    },
}
