//! Per-call transcript reorder buffer.
//!
//! Provider transcription events may arrive out of order or be retried. The
//! buffer holds segments keyed by provider sequence, releases them in
//! sequence order as soon as they are contiguous with the watermark, and
//! re-indexes them onto the call's gap-free `segment_index`.
//!
//! A hole in the provider sequence is waited on for at most the reorder
//! window, measured from the arrival of the oldest waiting segment. After
//! that the watermark jumps past the hole and the missing sequences are
//! counted as lost; if they arrive later they are below the watermark and are
//! discarded.
//!
//! The buffer does no I/O and takes the current instant as a parameter, so
//! the owning worker decides when to call [`SegmentBuffer::poll`] (see
//! [`SegmentBuffer::next_deadline`]).

use std::collections::BTreeMap;
use std::time::Duration;

use callflow_types::Speaker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Reorder settings for one call.
#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    /// Provider sequence number expected first.
    pub first_sequence: u64,
    /// How long a gap is waited on before it is skipped.
    pub reorder_window: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            first_sequence: 1,
            reorder_window: Duration::from_millis(1500),
        }
    }
}

/// A transcript segment as delivered by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingSegment {
    pub provider_sequence: u64,
    pub speaker: Speaker,
    pub text: String,
    pub confidence: f32,
    pub occurred_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// A segment released in order with its engine-assigned index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderedSegment {
    pub segment_index: u64,
    pub provider_sequence: u64,
    pub speaker: Speaker,
    pub text: String,
    pub confidence: f32,
    pub occurred_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// What happened to a segment handed to [`SegmentBuffer::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Held or released in order.
    Accepted,
    /// Below the watermark; discarded.
    Stale,
    /// Same provider sequence already waiting; discarded as a retry.
    Duplicate,
}

/// Running counters, logged when the buffer is flushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub forwarded: u64,
    pub dropped_stale: u64,
    pub dropped_duplicate: u64,
    /// Provider sequences given up on when the watermark skipped a gap.
    pub skipped_gaps: u64,
    pub invariant_violations: u64,
}

#[derive(Debug)]
struct Pending {
    arrived: Instant,
    segment: IncomingSegment,
}

/// Reorders one call's segments.
#[derive(Debug)]
pub struct SegmentBuffer {
    window: Duration,
    /// Next provider sequence that may be released.
    watermark: u64,
    /// Next `segment_index` to assign.
    next_index: u64,
    last_index: Option<u64>,
    pending: BTreeMap<u64, Pending>,
    stats: BufferStats,
}

impl SegmentBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            window: config.reorder_window,
            watermark: config.first_sequence,
            next_index: 1,
            last_index: None,
            pending: BTreeMap::new(),
            stats: BufferStats::default(),
        }
    }

    /// Continues a call whose earlier segments are already stored, e.g. when
    /// its worker is restarted. `last_index` and `last_sequence` are the
    /// highest stored `segment_index` and provider sequence.
    pub fn resume_at(config: BufferConfig, last_index: u64, last_sequence: u64) -> Self {
        let mut buffer = Self::new(config);
        buffer.next_index = last_index.saturating_add(1);
        buffer.last_index = (last_index > 0).then_some(last_index);
        buffer.watermark = last_sequence
            .saturating_add(1)
            .max(config.first_sequence);
        buffer
    }

    /// Offers a segment. Returns the admission verdict and every segment
    /// that became releasable, in order.
    pub fn push(
        &mut self,
        segment: IncomingSegment,
        now: Instant,
    ) -> (Admission, Vec<OrderedSegment>) {
        let seq = segment.provider_sequence;
        // A sequence with no successor could never advance the watermark.
        if seq < self.watermark || seq.checked_add(1).is_none() {
            self.stats.dropped_stale += 1;
            tracing::debug!(
                provider_sequence = seq,
                watermark = self.watermark,
                "dropping segment below watermark"
            );
            return (Admission::Stale, Vec::new());
        }
        if self.pending.contains_key(&seq) {
            self.stats.dropped_duplicate += 1;
            tracing::debug!(provider_sequence = seq, "dropping duplicate segment");
            return (Admission::Duplicate, Vec::new());
        }
        self.pending.insert(
            seq,
            Pending {
                arrived: now,
                segment,
            },
        );
        let mut out = Vec::new();
        self.drain_contiguous(&mut out);
        (Admission::Accepted, out)
    }

    /// Skips gaps whose reorder window has elapsed and returns what that
    /// releases.
    pub fn poll(&mut self, now: Instant) -> Vec<OrderedSegment> {
        let mut out = Vec::new();
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            let Some(&first_waiting) = self.pending.keys().next() else {
                break;
            };
            let skipped = first_waiting - self.watermark;
            tracing::debug!(
                from_sequence = self.watermark,
                to_sequence = first_waiting - 1,
                "reorder window elapsed, skipping gap"
            );
            self.stats.skipped_gaps += skipped;
            self.watermark = first_waiting;
            self.drain_contiguous(&mut out);
        }
        out
    }

    /// When the next gap will be given up on, if any segment is waiting.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.arrived)
            .min()
            .map(|oldest| oldest + self.window)
    }

    /// Releases everything still waiting, in provider-sequence order,
    /// without waiting for gaps.
    pub fn flush(&mut self) -> Vec<OrderedSegment> {
        let pending = std::mem::take(&mut self.pending);
        let mut out = Vec::with_capacity(pending.len());
        for (seq, waiting) in pending {
            if seq > self.watermark {
                self.stats.skipped_gaps += seq - self.watermark;
            }
            self.watermark = seq.saturating_add(1);
            if let Some(ordered) = self.assign_index(waiting.segment) {
                out.push(ordered);
            }
        }
        out
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn drain_contiguous(&mut self, out: &mut Vec<OrderedSegment>) {
        while let Some(waiting) = self.pending.remove(&self.watermark) {
            self.watermark = self.watermark.saturating_add(1);
            if let Some(ordered) = self.assign_index(waiting.segment) {
                out.push(ordered);
            }
        }
    }

    fn assign_index(&mut self, segment: IncomingSegment) -> Option<OrderedSegment> {
        let index = self.next_index;
        if self.last_index.is_some_and(|last| index <= last) {
            self.stats.invariant_violations += 1;
            tracing::error!(
                segment_index = index,
                provider_sequence = segment.provider_sequence,
                "segment index would repeat, dropping segment"
            );
            return None;
        }
        self.next_index += 1;
        self.last_index = Some(index);
        self.stats.forwarded += 1;
        Some(OrderedSegment {
            segment_index: index,
            provider_sequence: segment.provider_sequence,
            speaker: segment.speaker,
            text: segment.text,
            confidence: segment.confidence,
            occurred_at: segment.occurred_at,
            received_at: segment.received_at,
        })
    }
}
