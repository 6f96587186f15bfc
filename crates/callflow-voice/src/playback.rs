//! Per-leg playback serialization.
//!
//! Each leg has at most one clip in flight. Clips queued behind it are
//! released by [`PlaybackScheduler::playback_ended`] (the provider's
//! `call.playback.ended` for the in-flight id), by
//! [`PlaybackScheduler::dispatch_failed`], or by
//! [`PlaybackScheduler::expire_stalled`] once the stall timeout passes.
//! Every method that frees a leg returns the clip that should be
//! dispatched next and marks it in flight.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::synth::SynthesizedAudio;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedClip {
    /// Engine id sent with the play command and echoed on playback end.
    pub playback_id: String,
    pub leg_id: String,
    pub segment_index: u64,
    pub audio: SynthesizedAudio,
}

#[derive(Debug)]
struct InFlight {
    playback_id: String,
    started: Instant,
}

#[derive(Debug, Default)]
struct LegSlot {
    in_flight: Option<InFlight>,
    queue: VecDeque<QueuedClip>,
}

#[derive(Debug)]
pub struct PlaybackScheduler {
    stall_timeout: Duration,
    legs: HashMap<String, LegSlot>,
}

impl PlaybackScheduler {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            stall_timeout,
            legs: HashMap::new(),
        }
    }

    /// Queues a clip. Returns it back, now in flight, if its leg was idle.
    pub fn enqueue(&mut self, clip: QueuedClip, now: Instant) -> Option<QueuedClip> {
        let slot = self.legs.entry(clip.leg_id.clone()).or_default();
        slot.queue.push_back(clip);
        if slot.in_flight.is_none() {
            Self::start_next(slot, now)
        } else {
            None
        }
    }

    /// Handles the provider's end-of-playback event.
    ///
    /// Unknown or stale playback ids are ignored and release nothing.
    pub fn playback_ended(
        &mut self,
        leg_id: &str,
        playback_id: Option<&str>,
        now: Instant,
    ) -> Option<QueuedClip> {
        let slot = self.legs.get_mut(leg_id)?;
        let in_flight = slot.in_flight.as_ref()?;
        if playback_id.is_some_and(|id| id != in_flight.playback_id) {
            tracing::debug!(
                leg_id,
                playback_id,
                expected = %in_flight.playback_id,
                "ignoring end of unknown playback"
            );
            return None;
        }
        slot.in_flight = None;
        Self::start_next(slot, now)
    }

    /// Releases the leg after the play command for `playback_id` failed.
    pub fn dispatch_failed(
        &mut self,
        leg_id: &str,
        playback_id: &str,
        now: Instant,
    ) -> Option<QueuedClip> {
        self.playback_ended(leg_id, Some(playback_id), now)
    }

    /// Releases every leg whose in-flight clip has outlived the stall timeout.
    pub fn expire_stalled(&mut self, now: Instant) -> Vec<QueuedClip> {
        let mut next = Vec::new();
        for (leg_id, slot) in &mut self.legs {
            let stalled = slot
                .in_flight
                .as_ref()
                .is_some_and(|f| now.saturating_duration_since(f.started) >= self.stall_timeout);
            if stalled {
                if let Some(f) = slot.in_flight.take() {
                    tracing::warn!(
                        leg_id = %leg_id,
                        playback_id = %f.playback_id,
                        "playback end never arrived, releasing leg"
                    );
                }
                if let Some(clip) = Self::start_next(slot, now) {
                    next.push(clip);
                }
            }
        }
        next
    }

    /// When the oldest in-flight clip will be considered stalled.
    pub fn next_stall_deadline(&self) -> Option<Instant> {
        self.legs
            .values()
            .filter_map(|s| s.in_flight.as_ref())
            .map(|f| f.started + self.stall_timeout)
            .min()
    }

    /// Drops everything queued or in flight. Returns how many queued clips
    /// were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.legs.values().map(|s| s.queue.len()).sum();
        self.legs.clear();
        discarded
    }

    pub fn is_idle(&self) -> bool {
        self.legs
            .values()
            .all(|s| s.in_flight.is_none() && s.queue.is_empty())
    }

    fn start_next(slot: &mut LegSlot, now: Instant) -> Option<QueuedClip> {
        let clip = slot.queue.pop_front()?;
        slot.in_flight = Some(InFlight {
            playback_id: clip.playback_id.clone(),
            started: now,
        });
        Some(clip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(id: &str, leg: &str, index: u64) -> QueuedClip {
        QueuedClip {
            playback_id: id.to_string(),
            leg_id: leg.to_string(),
            segment_index: index,
            audio: SynthesizedAudio {
                pcm: vec![0; 4],
                sample_rate: 22_050,
            },
        }
    }

    #[test]
    fn second_clip_waits_for_first_to_end() {
        let mut sched = PlaybackScheduler::new(Duration::from_secs(30));
        let now = Instant::now();
        assert_eq!(sched.enqueue(clip("p1", "leg-a", 1), now).unwrap().playback_id, "p1");
        assert!(sched.enqueue(clip("p2", "leg-a", 2), now).is_none());

        let next = sched.playback_ended("leg-a", Some("p1"), now).unwrap();
        assert_eq!(next.playback_id, "p2");
        assert!(sched.playback_ended("leg-a", Some("p2"), now).is_none());
        assert!(sched.is_idle());
    }

    #[test]
    fn legs_play_independently() {
        let mut sched = PlaybackScheduler::new(Duration::from_secs(30));
        let now = Instant::now();
        assert!(sched.enqueue(clip("p1", "leg-a", 1), now).is_some());
        assert!(sched.enqueue(clip("p2", "leg-b", 2), now).is_some());
    }

    #[test]
    fn stale_end_event_does_not_release_leg() {
        let mut sched = PlaybackScheduler::new(Duration::from_secs(30));
        let now = Instant::now();
        sched.enqueue(clip("p1", "leg-a", 1), now);
        sched.enqueue(clip("p2", "leg-a", 2), now);
        assert!(sched.playback_ended("leg-a", Some("p0"), now).is_none());
        assert!(!sched.is_idle());
    }

    #[test]
    fn stalled_playback_is_released() {
        let mut sched = PlaybackScheduler::new(Duration::from_secs(5));
        let start = Instant::now();
        sched.enqueue(clip("p1", "leg-a", 1), start);
        sched.enqueue(clip("p2", "leg-a", 2), start);
        assert_eq!(sched.next_stall_deadline(), Some(start + Duration::from_secs(5)));

        assert!(sched.expire_stalled(start + Duration::from_secs(4)).is_empty());
        let released = sched.expire_stalled(start + Duration::from_secs(5));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].playback_id, "p2");
    }

    #[test]
    fn clear_discards_queued_clips() {
        let mut sched = PlaybackScheduler::new(Duration::from_secs(5));
        let now = Instant::now();
        sched.enqueue(clip("p1", "leg-a", 1), now);
        sched.enqueue(clip("p2", "leg-a", 2), now);
        sched.enqueue(clip("p3", "leg-a", 3), now);
        assert_eq!(sched.clear(), 2);
        assert!(sched.is_idle());
    }
}
