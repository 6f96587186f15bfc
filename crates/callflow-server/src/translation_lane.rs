//! Per-call translation lane.
//!
//! Segments arrive already persisted and in index order. The lane translates
//! them one at a time, records the translation, and publishes the pair to the
//! call's live stream, so publication order equals segment order. Once the
//! worker sets a drain deadline, anything still untranslated at that instant
//! is published without a translation.

use std::sync::Arc;
use std::time::Duration;

use callflow_db::DbPool;
use callflow_stream::{LiveStream, SegmentEvent};
use callflow_transcript::{insert_translation, OrderedSegment, TranslationRecord};
use callflow_translate::{
    TranslationChain, TranslationOutcome, PROVIDER_NONE, PROVIDER_PASSTHROUGH,
};
use callflow_types::TenantTranslationConfig;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::with_conn;
use crate::voice_lane::VoiceMessage;

/// Extra time granted past the drain deadline for publishing what is left.
const DRAIN_SLACK: Duration = Duration::from_secs(1);

/// Stored segments waiting for translation. A full lane makes the worker wait.
pub(crate) const LANE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub(crate) struct LaneStats {
    pub translated: u64,
    pub passthrough: u64,
    pub untranslated: u64,
    pub published: u64,
}

pub(crate) struct TranslationLane {
    call_id: String,
    config: TenantTranslationConfig,
    chain: Arc<TranslationChain>,
    pool: DbPool,
    stream: Arc<LiveStream>,
    voice: Option<mpsc::Sender<VoiceMessage>>,
    drain: watch::Receiver<Option<Instant>>,
    stats: LaneStats,
}

/// The worker's end of a running lane.
pub(crate) struct LaneHandle {
    tx: mpsc::Sender<OrderedSegment>,
    drain: watch::Sender<Option<Instant>>,
    task: JoinHandle<LaneStats>,
}

impl TranslationLane {
    pub(crate) fn spawn(
        config: TenantTranslationConfig,
        chain: Arc<TranslationChain>,
        pool: DbPool,
        stream: Arc<LiveStream>,
        voice: Option<mpsc::Sender<VoiceMessage>>,
    ) -> LaneHandle {
        let (tx, rx) = mpsc::channel(LANE_QUEUE_CAPACITY);
        let (drain_tx, drain_rx) = watch::channel(None);
        let lane = Self {
            call_id: stream.call_id().to_string(),
            config,
            chain,
            pool,
            stream,
            voice,
            drain: drain_rx,
            stats: LaneStats::default(),
        };
        LaneHandle {
            tx,
            drain: drain_tx,
            task: tokio::spawn(lane.run(rx)),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<OrderedSegment>) -> LaneStats {
        while let Some(segment) = rx.recv().await {
            self.process(segment).await;
        }
        self.stats
    }

    async fn process(&mut self, segment: OrderedSegment) {
        let outcome = if self.config.translation_enabled {
            Some(
                translate_before_drain(
                    &self.chain,
                    &segment.text,
                    &self.config.source_lang,
                    &self.config.target_lang,
                    self.drain.clone(),
                )
                .await,
            )
        } else {
            None
        };

        let (translated_text, provider_used, record) = match outcome {
            Some(TranslationOutcome::Translated {
                text,
                provider,
                latency_ms,
            }) => {
                self.stats.translated += 1;
                let record = self.record(segment.segment_index, text.clone(), &provider, latency_ms);
                (Some(text), provider, Some(record))
            }
            Some(TranslationOutcome::Passthrough) => {
                self.stats.passthrough += 1;
                let record =
                    self.record(segment.segment_index, segment.text.clone(), PROVIDER_PASSTHROUGH, 0);
                (Some(segment.text.clone()), PROVIDER_PASSTHROUGH.to_string(), Some(record))
            }
            Some(TranslationOutcome::Untranslated) => {
                self.stats.untranslated += 1;
                (None, PROVIDER_NONE.to_string(), None)
            }
            None => (None, PROVIDER_NONE.to_string(), None),
        };

        if let Some(record) = record {
            let call_id = self.call_id.clone();
            let stored = with_conn(&self.pool, move |conn| {
                Ok(insert_translation(conn, &call_id, &record)?)
            })
            .await;
            if let Err(e) = stored {
                tracing::error!(
                    call_id = %self.call_id,
                    segment_index = segment.segment_index,
                    error = %e,
                    "failed to store translation"
                );
            }
        }

        if let (Some(voice), Some(text)) = (&self.voice, &translated_text) {
            if provider_used != PROVIDER_PASSTHROUGH {
                let job = VoiceMessage::Speak {
                    segment_index: segment.segment_index,
                    speaker: segment.speaker,
                    text: text.clone(),
                };
                if voice.try_send(job).is_err() {
                    tracing::warn!(
                        call_id = %self.call_id,
                        segment_index = segment.segment_index,
                        "voice lane busy; segment will not be spoken"
                    );
                }
            }
        }

        let event = SegmentEvent {
            segment_index: segment.segment_index,
            speaker: segment.speaker,
            original_text: segment.text,
            translated_text,
            provider_used,
            source_lang: self.config.source_lang.clone(),
            target_lang: self.config.target_lang.clone(),
        };
        match self.stream.publish(event) {
            Ok(()) => self.stats.published += 1,
            Err(e) => tracing::error!(call_id = %self.call_id, error = %e, "failed to publish segment"),
        }
    }

    fn record(
        &self,
        segment_index: u64,
        translated_text: String,
        provider: &str,
        latency_ms: u64,
    ) -> TranslationRecord {
        TranslationRecord {
            segment_index,
            source_lang: self.config.source_lang.clone(),
            target_lang: self.config.target_lang.clone(),
            translated_text,
            provider_used: provider.to_string(),
            latency_ms,
        }
    }
}

/// Runs the chain, giving up with `Untranslated` once the drain deadline
/// passes, including a deadline set while the translation is in flight.
async fn translate_before_drain(
    chain: &TranslationChain,
    text: &str,
    source_lang: &str,
    target_lang: &str,
    mut drain: watch::Receiver<Option<Instant>>,
) -> TranslationOutcome {
    let translate = chain.translate(text, source_lang, target_lang);
    tokio::pin!(translate);
    loop {
        let deadline = *drain.borrow_and_update();
        match deadline {
            Some(deadline) => {
                return tokio::time::timeout_at(deadline, &mut translate)
                    .await
                    .unwrap_or(TranslationOutcome::Untranslated);
            }
            None => {
                tokio::select! {
                    outcome = &mut translate => return outcome,
                    changed = drain.changed() => {
                        if changed.is_err() {
                            return (&mut translate).await;
                        }
                    }
                }
            }
        }
    }
}

impl LaneHandle {
    /// Queues a stored segment, waiting while the lane is full. Returns
    /// `false` if the lane has stopped.
    pub(crate) async fn submit(&self, segment: OrderedSegment) -> bool {
        self.tx.send(segment).await.is_ok()
    }

    /// Stops accepting segments and waits for the backlog to be published.
    ///
    /// Translation is abandoned at `now + drain`; the lane is aborted if it
    /// still has not finished shortly after that.
    pub(crate) async fn finish(self, call_id: &str, drain: Duration) -> Option<LaneStats> {
        let deadline = Instant::now() + drain;
        self.drain.send_replace(Some(deadline));
        drop(self.tx);

        let mut task = self.task;
        match tokio::time::timeout_at(deadline + DRAIN_SLACK, &mut task).await {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(e)) => {
                tracing::error!(call_id, error = %e, "translation lane failed");
                None
            }
            Err(_) => {
                task.abort();
                tracing::warn!(call_id, "translation lane missed its drain deadline; aborted");
                None
            }
        }
    }
}
