//! The per-call worker.
//!
//! A worker owns a call's state machine, its segment buffer, and the lanes
//! that translate and speak its segments. It is the only writer of its call
//! record. Events arrive through the registry in the order they were
//! accepted; outbound commands are issued inline, so a slow provider stalls
//! only this call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use callflow_calls::{
    load_tenant_config, record_activity, save_call, ActivityKind, Call, Command, CommandKind,
    Outcome,
};
use callflow_db::DbPool;
use callflow_stream::{LiveStream, StreamHub};
use callflow_transcript::{
    insert_segment, stored_marks, Admission, BufferConfig, IncomingSegment, OrderedSegment,
    SegmentBuffer, TranscriptError,
};
use callflow_translate::TranslationChain;
use callflow_types::{
    FlowType, ProviderEvent, Speaker, TenantTranslationConfig, TranscriptionPayload,
};
use callflow_voice::{PlaybackScheduler, SpeechSynthesizer};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::with_conn;
use crate::telephony::{with_timeout, DialRequest, TelephonyCommands, TelephonyError};
use crate::translation_lane::{LaneHandle, TranslationLane};
use crate::voice_lane::{LegTargets, VoiceLane, VoiceMessage, VOICE_QUEUE_CAPACITY};

/// Time the voice lane gets to notice cancellation before it is aborted.
const VOICE_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub buffer: BufferConfig,
    /// How long a finished call keeps accepting late transcription events.
    pub flush_grace: Duration,
    /// Translation backlog allowance after the call ends.
    pub drain_deadline: Duration,
    pub command_timeout: Duration,
    pub playback_stall_timeout: Duration,
}

/// Shared dependencies for every worker.
pub struct WorkerContext {
    pub pool: DbPool,
    pub hub: Arc<StreamHub>,
    pub chain: Arc<TranslationChain>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub telephony: Arc<dyn TelephonyCommands>,
    pub settings: WorkerSettings,
}

/// How a worker begins.
#[derive(Debug, Clone)]
pub struct WorkerStart {
    pub call: Call,
    /// Dial `call.agent_number` before processing events.
    pub dial_agent: bool,
    pub from_number: Option<String>,
}

impl WorkerStart {
    /// Picks up a call that already has legs, e.g. after a restart.
    pub fn resume(call: Call) -> Self {
        Self {
            call,
            dial_agent: false,
            from_number: None,
        }
    }

    /// Starts a call created by the start-call API.
    pub fn dial(call: Call, from_number: Option<String>) -> Self {
        Self {
            call,
            dial_agent: true,
            from_number,
        }
    }
}

pub(crate) struct CallWorker {
    ctx: Arc<WorkerContext>,
    call: Call,
    dial_agent: bool,
    from_number: Option<String>,
    buffer: SegmentBuffer,
    stream: Arc<LiveStream>,
    legs: watch::Sender<LegTargets>,
}

struct VoiceHandle {
    tx: mpsc::Sender<VoiceMessage>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CallWorker {
    /// Opens the call's live stream right away, so observers can attach as
    /// soon as the worker is registered.
    pub(crate) fn new(ctx: Arc<WorkerContext>, start: WorkerStart) -> Self {
        let buffer = SegmentBuffer::new(ctx.settings.buffer);
        let stream = ctx.hub.open(&start.call.call_id);
        let (legs, _) = watch::channel(LegTargets::from_call(&start.call));
        Self {
            ctx,
            call: start.call,
            dial_agent: start.dial_agent,
            from_number: start.from_number,
            buffer,
            stream,
            legs,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<ProviderEvent>) {
        if !self.dial_agent {
            self.continue_transcript().await;
        }
        let config = self.load_config().await;
        tracing::info!(
            call_id = %self.call.call_id,
            tenant_id = %self.call.tenant_id,
            flow_type = self.call.flow_type.as_str(),
            translation_enabled = config.translation_enabled,
            voice_to_voice = config.voice_to_voice,
            "call worker started"
        );

        let stream = Arc::clone(&self.stream);
        let voice = (config.translation_enabled && config.voice_to_voice)
            .then(|| self.spawn_voice_lane(&config));
        let lane = TranslationLane::spawn(
            config,
            Arc::clone(&self.ctx.chain),
            self.ctx.pool.clone(),
            Arc::clone(&stream),
            voice.as_ref().map(|v| v.tx.clone()),
        );

        if self.dial_agent {
            self.dial_agent().await;
        }

        let mut closing: Option<Instant> = None;
        loop {
            if closing.is_none() && self.call.status.is_terminal() {
                if let Some(voice) = &voice {
                    voice.cancel.cancel();
                }
                closing = Some(Instant::now() + self.ctx.settings.flush_grace);
            }

            let reorder = self.buffer.next_deadline();
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle(event, &lane, voice.as_ref()).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(reorder.unwrap_or_else(Instant::now)), if reorder.is_some() => {
                    let released = self.buffer.poll(Instant::now());
                    self.release(released, &lane).await;
                }
                _ = tokio::time::sleep_until(closing.unwrap_or_else(Instant::now)), if closing.is_some() => break,
            }
        }
        rx.close();

        let dropped = {
            let mut count = 0usize;
            while rx.try_recv().is_ok() {
                count += 1;
            }
            count
        };
        if dropped > 0 {
            tracing::warn!(call_id = %self.call.call_id, dropped, "events arrived after the flush grace; dropped");
        }

        self.shutdown(lane, voice).await;
        stream.close(self.call.status);
    }

    /// Picks up segment numbering where a previous worker of this call left
    /// off, so new segments neither reuse stored indexes nor replay stored
    /// provider sequences.
    async fn continue_transcript(&mut self) {
        let call_id = self.call.call_id.clone();
        let marks = with_conn(&self.ctx.pool, move |conn| Ok(stored_marks(conn, &call_id)?)).await;
        match marks {
            Ok(Some(marks)) => {
                tracing::info!(
                    call_id = %self.call.call_id,
                    last_index = marks.last_index,
                    last_sequence = marks.last_sequence,
                    "continuing stored transcript"
                );
                self.buffer = SegmentBuffer::resume_at(
                    self.ctx.settings.buffer,
                    marks.last_index,
                    marks.last_sequence,
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(call_id = %self.call.call_id, error = %e, "failed to read stored transcript position");
            }
        }
    }

    async fn load_config(&self) -> TenantTranslationConfig {
        let tenant_id = self.call.tenant_id.clone();
        let loaded = with_conn(&self.ctx.pool, move |conn| {
            Ok(load_tenant_config(conn, &tenant_id)?)
        })
        .await;
        match loaded {
            Ok(config) if config.translation_enabled && !config.has_valid_languages() => {
                tracing::warn!(
                    call_id = %self.call.call_id,
                    tenant_id = %self.call.tenant_id,
                    "tenant has invalid language codes; translation disabled"
                );
                TenantTranslationConfig::disabled(&self.call.tenant_id)
            }
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    call_id = %self.call.call_id,
                    error = %e,
                    "failed to load tenant translation config; translation disabled"
                );
                TenantTranslationConfig::disabled(&self.call.tenant_id)
            }
        }
    }

    fn spawn_voice_lane(&self, config: &TenantTranslationConfig) -> VoiceHandle {
        let (tx, rx) = mpsc::channel(VOICE_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let lane = VoiceLane {
            call_id: self.call.call_id.clone(),
            target_lang: config.target_lang.clone(),
            synthesizer: Arc::clone(&self.ctx.synthesizer),
            telephony: Arc::clone(&self.ctx.telephony),
            command_timeout: self.ctx.settings.command_timeout,
            legs: self.legs.subscribe(),
            scheduler: PlaybackScheduler::new(self.ctx.settings.playback_stall_timeout),
            cancel: cancel.clone(),
        };
        VoiceHandle {
            tx,
            cancel,
            task: tokio::spawn(lane.run(rx)),
        }
    }

    async fn handle(&mut self, event: ProviderEvent, lane: &LaneHandle, voice: Option<&VoiceHandle>) {
        match event {
            ProviderEvent::Transcription(payload) => self.on_transcription(payload, lane).await,
            ProviderEvent::PlaybackEnded(ended) => match voice {
                Some(voice) => {
                    let message = VoiceMessage::PlaybackEnded {
                        leg_id: ended.leg_id,
                        playback_id: ended.playback_id,
                    };
                    if voice.tx.send(message).await.is_err() {
                        tracing::warn!(call_id = %self.call.call_id, "voice lane stopped; playback end dropped");
                    }
                }
                None => tracing::debug!(call_id = %self.call.call_id, "playback end for call without voice lane"),
            },
            other => {
                let outcome = self.call.apply(&other, Utc::now());
                self.settle(outcome).await;
            }
        }
    }

    async fn on_transcription(&mut self, payload: TranscriptionPayload, lane: &LaneHandle) {
        let speaker = match (payload.speaker, self.call.flow_type) {
            (Speaker::Unknown, FlowType::Bridge) => self
                .call
                .role_of(&payload.leg_id)
                .map(Speaker::from)
                .unwrap_or(Speaker::Unknown),
            (speaker, _) => speaker,
        };
        let sequence = payload.sequence;
        let segment = IncomingSegment {
            provider_sequence: sequence,
            speaker,
            text: payload.text,
            confidence: payload.confidence,
            occurred_at: payload.occurred_at,
            received_at: Utc::now(),
        };

        let (admission, released) = self.buffer.push(segment, Instant::now());
        match admission {
            Admission::Accepted => {}
            Admission::Stale => {
                tracing::warn!(call_id = %self.call.call_id, provider_sequence = sequence, "late segment below watermark dropped");
                self.persist(
                    None,
                    vec![(
                        ActivityKind::SegmentsLost,
                        json!({ "provider_sequence": sequence, "reason": "below_watermark" }),
                    )],
                )
                .await;
            }
            Admission::Duplicate => {
                tracing::debug!(call_id = %self.call.call_id, provider_sequence = sequence, "duplicate segment dropped");
            }
        }
        self.release(released, lane).await;
    }

    /// Stores released segments and hands them to the translation lane.
    async fn release(&mut self, segments: Vec<OrderedSegment>, lane: &LaneHandle) {
        if segments.is_empty() {
            return;
        }
        let call_id = self.call.call_id.clone();
        let batch = segments.clone();
        let stored = with_conn(&self.ctx.pool, move |conn| {
            let mut stored = Vec::with_capacity(batch.len());
            for segment in batch {
                match insert_segment(conn, &call_id, &segment) {
                    Ok(()) => stored.push(segment),
                    Err(TranscriptError::DuplicateIndex { segment_index, .. }) => {
                        tracing::error!(call_id = %call_id, segment_index, "segment index already stored; dropped");
                    }
                    Err(e) => {
                        tracing::error!(call_id = %call_id, segment_index = segment.segment_index, error = %e, "failed to store segment");
                        stored.push(segment);
                    }
                }
            }
            Ok(stored)
        })
        .await
        .unwrap_or_else(|e| {
            tracing::error!(call_id = %self.call.call_id, error = %e, "failed to store segments");
            segments
        });

        for segment in stored {
            if !lane.submit(segment).await {
                tracing::error!(call_id = %self.call.call_id, "translation lane stopped; segment not published");
            }
        }
    }

    /// Persists and carries out an outcome, then any outcomes its commands
    /// produce.
    async fn settle(&mut self, first: Outcome) {
        let mut pending = VecDeque::from([first]);
        while let Some(outcome) = pending.pop_front() {
            self.record(&outcome).await;
            for command in &outcome.commands {
                if let Some(follow_up) = self.issue(command).await {
                    pending.push_back(follow_up);
                }
            }
        }
        self.legs.send_if_modified(|targets| {
            let current = LegTargets::from_call(&self.call);
            if *targets == current {
                false
            } else {
                *targets = current;
                true
            }
        });
    }

    async fn record(&self, outcome: &Outcome) {
        let mut entries = Vec::new();
        for transition in &outcome.transitions {
            tracing::info!(
                call_id = %self.call.call_id,
                from = %transition.from,
                to = %transition.to,
                "call status changed"
            );
            entries.push((
                ActivityKind::StatusChanged,
                json!({ "from": transition.from, "to": transition.to }),
            ));
        }
        if let Some(anomaly) = &outcome.anomaly {
            tracing::warn!(
                call_id = %self.call.call_id,
                event_type = anomaly.event_type,
                reason = %anomaly.reason,
                "event ignored"
            );
            entries.push((ActivityKind::Anomaly, json!(anomaly)));
        }

        let snapshot = outcome.changed().then(|| self.call.clone());
        if snapshot.is_some() || !entries.is_empty() {
            self.persist(snapshot, entries).await;
        }
    }

    /// Saves the call and appends activity in one blocking task.
    async fn persist(&self, call: Option<Call>, entries: Vec<(ActivityKind, Value)>) {
        let call_id = self.call.call_id.clone();
        let result = with_conn(&self.ctx.pool, move |conn| {
            if let Some(call) = &call {
                save_call(conn, call)?;
            }
            for (kind, detail) in &entries {
                record_activity(conn, &call_id, *kind, detail)?;
            }
            Ok(())
        })
        .await;
        if let Err(e) = result {
            tracing::error!(call_id = %self.call.call_id, error = %e, "failed to persist call state");
        }
    }

    async fn issue(&mut self, command: &Command) -> Option<Outcome> {
        let timeout = self.ctx.settings.command_timeout;
        let telephony = Arc::clone(&self.ctx.telephony);
        let detail = serde_json::to_value(command).unwrap_or(Value::Null);

        match command {
            Command::DialCustomer { to } => {
                let request = self.dial_request(to.clone());
                match with_timeout("dial", timeout, telephony.dial(&request)).await {
                    Ok(leg_id) => {
                        self.command_issued(detail, Some(&leg_id)).await;
                        Some(self.call.customer_dial_started(&leg_id))
                    }
                    Err(e) => {
                        self.command_failed(detail, &e).await;
                        Some(self.call.command_failed(CommandKind::DialCustomer, Utc::now()))
                    }
                }
            }
            Command::BridgeLegs {
                agent_leg_id,
                customer_leg_id,
            } => {
                match with_timeout("bridge", timeout, telephony.bridge(agent_leg_id, customer_leg_id))
                    .await
                {
                    Ok(()) => {
                        self.command_issued(detail, None).await;
                        None
                    }
                    Err(e) => {
                        self.command_failed(detail, &e).await;
                        Some(self.call.command_failed(CommandKind::BridgeLegs, Utc::now()))
                    }
                }
            }
            Command::HangupLeg { leg_id } => {
                match with_timeout("hangup", timeout, telephony.hangup(leg_id)).await {
                    Ok(()) => self.command_issued(detail, None).await,
                    Err(e) => self.command_failed(detail, &e).await,
                }
                None
            }
        }
    }

    async fn dial_agent(&mut self) {
        let Some(to) = self.call.agent_number.clone() else {
            tracing::error!(call_id = %self.call.call_id, "no agent number to dial");
            let outcome = self.call.command_failed(CommandKind::DialAgent, Utc::now());
            self.settle(outcome).await;
            return;
        };
        let detail = json!({ "command": "dial_agent", "to": to });
        let request = self.dial_request(to);
        let timeout = self.ctx.settings.command_timeout;
        let telephony = Arc::clone(&self.ctx.telephony);

        let outcome = match with_timeout("dial", timeout, telephony.dial(&request)).await {
            Ok(leg_id) => {
                self.command_issued(detail, Some(&leg_id)).await;
                self.call.agent_dial_started(&leg_id)
            }
            Err(e) => {
                self.command_failed(detail, &e).await;
                self.call.command_failed(CommandKind::DialAgent, Utc::now())
            }
        };
        self.settle(outcome).await;
    }

    fn dial_request(&self, to: String) -> DialRequest {
        DialRequest {
            call_id: self.call.call_id.clone(),
            to,
            from: self.from_number.clone(),
        }
    }

    async fn command_issued(&self, mut detail: Value, leg_id: Option<&str>) {
        if let (Some(leg_id), Some(map)) = (leg_id, detail.as_object_mut()) {
            map.insert("leg_id".to_string(), json!(leg_id));
        }
        tracing::info!(call_id = %self.call.call_id, command = %detail, "telephony command issued");
        self.persist(None, vec![(ActivityKind::CommandIssued, detail)]).await;
    }

    async fn command_failed(&self, mut detail: Value, error: &TelephonyError) {
        tracing::warn!(call_id = %self.call.call_id, command = %detail, error = %error, "telephony command failed");
        if let Some(map) = detail.as_object_mut() {
            map.insert("error".to_string(), json!(error.to_string()));
        }
        self.persist(None, vec![(ActivityKind::CommandFailed, detail)]).await;
    }

    async fn shutdown(&mut self, lane: LaneHandle, voice: Option<VoiceHandle>) {
        if let Some(voice) = voice {
            voice.cancel.cancel();
            drop(voice.tx);
            let mut task = voice.task;
            if tokio::time::timeout(VOICE_STOP_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        let flushed = self.buffer.flush();
        self.release(flushed, &lane).await;
        let stats = self.buffer.stats();
        let lane_stats = lane
            .finish(&self.call.call_id, self.ctx.settings.drain_deadline)
            .await;

        tracing::info!(
            call_id = %self.call.call_id,
            status = %self.call.status,
            forwarded = stats.forwarded,
            dropped_stale = stats.dropped_stale,
            dropped_duplicate = stats.dropped_duplicate,
            skipped_gaps = stats.skipped_gaps,
            invariant_violations = stats.invariant_violations,
            "call worker stopped"
        );

        let mut entries = Vec::new();
        if stats.skipped_gaps > 0 || stats.invariant_violations > 0 {
            entries.push((
                ActivityKind::SegmentsLost,
                json!({
                    "reason": "reorder_gap",
                    "skipped_gaps": stats.skipped_gaps,
                    "invariant_violations": stats.invariant_violations,
                }),
            ));
        }
        entries.push((
            ActivityKind::WorkerStopped,
            json!({
                "status": self.call.status,
                "buffer": stats,
                "translation": lane_stats,
            }),
        ));
        self.persist(None, entries).await;
    }
}
