//! Voice-to-voice playback for one call.
//!
//! Translated segments are synthesized in the tenant's target language and
//! played into the leg of the party who did not speak them. Playback is
//! serialized per leg by [`PlaybackScheduler`]. The lane stops as soon as the
//! call ends; queued clips are discarded.

use std::sync::Arc;
use std::time::Duration;

use callflow_calls::Call;
use callflow_types::{FlowType, LegStatus, Speaker};
use callflow_voice::{PlaybackScheduler, QueuedClip, SpeechSynthesizer};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::telephony::{with_timeout, TelephonyCommands};

/// Capacity of the lane's input queue.
pub(crate) const VOICE_QUEUE_CAPACITY: usize = 32;

#[derive(Debug)]
pub(crate) enum VoiceMessage {
    Speak {
        segment_index: u64,
        speaker: Speaker,
        text: String,
    },
    PlaybackEnded {
        leg_id: String,
        playback_id: Option<String>,
    },
}

/// Live legs a clip can be played into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LegTargets {
    flow_type: FlowType,
    agent: Option<String>,
    customer: Option<String>,
}

impl LegTargets {
    pub(crate) fn from_call(call: &Call) -> Self {
        let live = |leg: &Option<callflow_calls::Leg>| {
            leg.as_ref()
                .filter(|l| l.status != LegStatus::Ended)
                .map(|l| l.leg_id.clone())
        };
        Self {
            flow_type: call.flow_type,
            agent: live(&call.agent_leg),
            customer: live(&call.customer_leg),
        }
    }

    /// The leg that should hear what `speaker` said.
    fn target_for(&self, speaker: Speaker) -> Option<&str> {
        match (self.flow_type, speaker) {
            (FlowType::Direct, _) => self.agent.as_deref(),
            (FlowType::Bridge, Speaker::Agent) => self.customer.as_deref(),
            (FlowType::Bridge, Speaker::Customer) => self.agent.as_deref(),
            (FlowType::Bridge, Speaker::Unknown) => None,
        }
    }
}

pub(crate) struct VoiceLane {
    pub call_id: String,
    pub target_lang: String,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub telephony: Arc<dyn TelephonyCommands>,
    pub command_timeout: Duration,
    pub legs: watch::Receiver<LegTargets>,
    pub scheduler: PlaybackScheduler,
    pub cancel: CancellationToken,
}

impl VoiceLane {
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<VoiceMessage>) {
        loop {
            let stall = self.scheduler.next_stall_deadline();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(VoiceMessage::Speak { segment_index, speaker, text }) => {
                        self.speak(segment_index, speaker, &text).await;
                    }
                    Some(VoiceMessage::PlaybackEnded { leg_id, playback_id }) => {
                        let next = self.scheduler.playback_ended(
                            &leg_id,
                            playback_id.as_deref(),
                            Instant::now(),
                        );
                        self.dispatch(next).await;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(stall.unwrap_or_else(Instant::now)), if stall.is_some() => {
                    for clip in self.scheduler.expire_stalled(Instant::now()) {
                        tracing::warn!(call_id = %self.call_id, leg_id = %clip.leg_id, "playback stalled; moving on");
                        self.dispatch(Some(clip)).await;
                    }
                }
            }
        }

        let discarded = self.scheduler.clear();
        if discarded > 0 {
            tracing::info!(call_id = %self.call_id, discarded, "discarded queued playback");
        }
    }

    async fn speak(&mut self, segment_index: u64, speaker: Speaker, text: &str) {
        let leg_id = match self.legs.borrow().target_for(speaker) {
            Some(leg_id) => leg_id.to_string(),
            None => {
                tracing::debug!(call_id = %self.call_id, segment_index, "no live leg to play into");
                return;
            }
        };

        let audio = tokio::select! {
            _ = self.cancel.cancelled() => return,
            audio = self.synthesizer.synthesize(text, &self.target_lang) => audio,
        };
        let audio = match audio {
            Ok(audio) => audio,
            Err(e) => {
                tracing::warn!(
                    call_id = %self.call_id,
                    segment_index,
                    synthesizer = self.synthesizer.name(),
                    error = %e,
                    "speech synthesis failed; segment skipped"
                );
                return;
            }
        };

        let clip = QueuedClip {
            playback_id: format!("pb_{}", Uuid::new_v4().simple()),
            leg_id,
            segment_index,
            audio,
        };
        let next = self.scheduler.enqueue(clip, Instant::now());
        self.dispatch(next).await;
    }

    /// Plays `next`, then whatever a failed play releases behind it.
    async fn dispatch(&mut self, mut next: Option<QueuedClip>) {
        while let Some(clip) = next.take() {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = with_timeout(
                    "play",
                    self.command_timeout,
                    self.telephony.play(&clip.leg_id, &clip.playback_id, &clip.audio),
                ) => result,
            };
            match result {
                Ok(()) => tracing::debug!(
                    call_id = %self.call_id,
                    leg_id = %clip.leg_id,
                    playback_id = %clip.playback_id,
                    segment_index = clip.segment_index,
                    "playback started"
                ),
                Err(e) => {
                    tracing::warn!(
                        call_id = %self.call_id,
                        leg_id = %clip.leg_id,
                        segment_index = clip.segment_index,
                        error = %e,
                        "play command failed"
                    );
                    next = self
                        .scheduler
                        .dispatch_failed(&clip.leg_id, &clip.playback_id, Instant::now());
                }
            }
        }
    }
}
