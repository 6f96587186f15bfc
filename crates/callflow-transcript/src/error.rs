/// Errors from transcript persistence.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("transcript database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A segment index was written twice for the same call.
    #[error("segment index {segment_index} already stored for call {call_id}")]
    DuplicateIndex { call_id: String, segment_index: u64 },
}
