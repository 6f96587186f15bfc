//! Transcript ordering and persistence.
//!
//! [`SegmentBuffer`] turns a call's out-of-order, possibly retried provider
//! transcription events into a strictly increasing, gap-free
//! `segment_index` sequence. The store functions persist released segments
//! and the translations produced for them.

mod buffer;
mod error;
mod store;

pub use buffer::{
    Admission, BufferConfig, BufferStats, IncomingSegment, OrderedSegment, SegmentBuffer,
};
pub use error::TranscriptError;
pub use store::{
    count_segments, count_translations, insert_segment, insert_translation, list_transcript,
    stored_marks, StoredMarks, TranscriptLine, TranslationRecord,
};
