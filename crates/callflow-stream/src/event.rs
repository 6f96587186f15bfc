//! Events delivered to stream observers.

use callflow_types::{CallStatus, Speaker};
use serde::{Deserialize, Serialize};

/// A transcript segment paired with its translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentEvent {
    pub segment_index: u64,
    pub speaker: Speaker,
    pub original_text: String,
    /// `None` when translation was disabled or every provider failed.
    pub translated_text: Option<String>,
    pub provider_used: String,
    pub source_lang: String,
    pub target_lang: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    Segment(SegmentEvent),
    /// Segments in `from_index..=to_index` are not available to this observer.
    Gap { from_index: u64, to_index: u64 },
    /// The call ended; nothing follows.
    End { status: CallStatus },
}

impl StreamEvent {
    /// SSE `event:` name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Segment(_) => "segment",
            Self::Gap { .. } => "gap",
            Self::End { .. } => "end",
        }
    }

    /// SSE `id:` value; only segments carry one.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Segment(s) => Some(s.segment_index),
            _ => None,
        }
    }
}
