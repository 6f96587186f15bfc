//! Provider webhook events.
//!
//! The telephony provider posts JSON envelopes of the form
//! `{ "id", "event_type", "occurred_at", "payload" }`. The envelope is parsed
//! first so that every delivery can be recorded in the dedup ledger, then
//! known event types are lifted into the closed [`ProviderEvent`] enum.

use crate::{AmdResult, FlowType, LegRole, Speaker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The raw webhook envelope as delivered by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Provider-assigned event id, unique per logical event across retries.
    pub id: String,
    /// Provider event type label, e.g. `call.answered`.
    pub event_type: String,
    /// Provider-reported time of the event.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    /// Event-specific body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Event type labels the engine understands.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "call.initiated",
    "call.ringing",
    "call.answered",
    "call.hangup",
    "call.transcription",
    "call.machine_detection.ended",
    "call.bridged",
    "call.playback.ended",
];

/// A leg reference carried by most events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegRef {
    /// Engine call id echoed back by the provider, when it was set at dial time.
    #[serde(default)]
    pub call_id: Option<String>,
    /// Provider-assigned leg id.
    pub leg_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegInitiated {
    #[serde(default)]
    pub call_id: Option<String>,
    pub leg_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub flow_type: FlowType,
    #[serde(default)]
    pub leg_role: LegRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegHangup {
    #[serde(default)]
    pub call_id: Option<String>,
    pub leg_id: String,
    /// Provider hangup cause (`normal_clearing`, `busy`, `no_answer`, ...).
    #[serde(default)]
    pub cause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionPayload {
    #[serde(default)]
    pub call_id: Option<String>,
    pub leg_id: String,
    /// Provider sequence number of this utterance window.
    pub sequence: u64,
    #[serde(default)]
    pub speaker: Speaker,
    pub text: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDetection {
    #[serde(default)]
    pub call_id: Option<String>,
    pub leg_id: String,
    pub result: AmdResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackEnded {
    #[serde(default)]
    pub call_id: Option<String>,
    pub leg_id: String,
    /// Engine playback id passed to the provider with the play command.
    #[serde(default)]
    pub playback_id: Option<String>,
}

/// Every provider event the call state machine reacts to.
///
/// New event types are added here and the compiler points at every match that
/// must handle them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum ProviderEvent {
    #[serde(rename = "call.initiated")]
    Initiated(LegInitiated),
    #[serde(rename = "call.ringing")]
    Ringing(LegRef),
    #[serde(rename = "call.answered")]
    Answered(LegRef),
    #[serde(rename = "call.hangup")]
    Hangup(LegHangup),
    #[serde(rename = "call.transcription")]
    Transcription(TranscriptionPayload),
    #[serde(rename = "call.machine_detection.ended")]
    MachineDetectionEnded(MachineDetection),
    #[serde(rename = "call.bridged")]
    Bridged(LegRef),
    #[serde(rename = "call.playback.ended")]
    PlaybackEnded(PlaybackEnded),
}

impl ProviderEvent {
    /// Lifts a known envelope into a typed event.
    ///
    /// Returns `Ok(None)` for event types the engine does not handle.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if the type is known but the payload does not
    /// match its schema.
    pub fn from_envelope(envelope: &WebhookEnvelope) -> Result<Option<Self>, serde_json::Error> {
        if !KNOWN_EVENT_TYPES.contains(&envelope.event_type.as_str()) {
            return Ok(None);
        }
        let tagged = serde_json::json!({
            "event_type": envelope.event_type,
            "payload": envelope.payload,
        });
        serde_json::from_value(tagged).map(Some)
    }

    /// The provider label for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Initiated(_) => "call.initiated",
            Self::Ringing(_) => "call.ringing",
            Self::Answered(_) => "call.answered",
            Self::Hangup(_) => "call.hangup",
            Self::Transcription(_) => "call.transcription",
            Self::MachineDetectionEnded(_) => "call.machine_detection.ended",
            Self::Bridged(_) => "call.bridged",
            Self::PlaybackEnded(_) => "call.playback.ended",
        }
    }

    /// The engine call id carried by the event, if any.
    pub fn call_id(&self) -> Option<&str> {
        let id = match self {
            Self::Initiated(e) => &e.call_id,
            Self::Ringing(e) | Self::Answered(e) | Self::Bridged(e) => &e.call_id,
            Self::Hangup(e) => &e.call_id,
            Self::Transcription(e) => &e.call_id,
            Self::MachineDetectionEnded(e) => &e.call_id,
            Self::PlaybackEnded(e) => &e.call_id,
        };
        id.as_deref()
    }

    /// The provider leg id the event refers to.
    pub fn leg_id(&self) -> &str {
        match self {
            Self::Initiated(e) => &e.leg_id,
            Self::Ringing(e) | Self::Answered(e) | Self::Bridged(e) => &e.leg_id,
            Self::Hangup(e) => &e.leg_id,
            Self::Transcription(e) => &e.leg_id,
            Self::MachineDetectionEnded(e) => &e.leg_id,
            Self::PlaybackEnded(e) => &e.leg_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(event_type: &str, payload: serde_json::Value) -> WebhookEnvelope {
        WebhookEnvelope {
            id: "evt_1".to_string(),
            event_type: event_type.to_string(),
            occurred_at: None,
            payload,
        }
    }

    #[test]
    fn answered_envelope_becomes_typed_event() {
        let env = envelope(
            "call.answered",
            serde_json::json!({ "call_id": "c1", "leg_id": "leg-a" }),
        );
        let event = ProviderEvent::from_envelope(&env).unwrap().unwrap();
        assert_eq!(
            event,
            ProviderEvent::Answered(LegRef {
                call_id: Some("c1".to_string()),
                leg_id: "leg-a".to_string(),
            })
        );
        assert_eq!(event.event_type(), "call.answered");
        assert_eq!(event.call_id(), Some("c1"));
        assert_eq!(event.leg_id(), "leg-a");
    }

    #[test]
    fn machine_detection_parses_result() {
        let env = envelope(
            "call.machine_detection.ended",
            serde_json::json!({ "leg_id": "leg-b", "result": "machine" }),
        );
        match ProviderEvent::from_envelope(&env).unwrap() {
            Some(ProviderEvent::MachineDetectionEnded(m)) => {
                assert_eq!(m.result, AmdResult::Machine);
                assert!(m.call_id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn initiated_defaults_to_direct_agent_leg() {
        let env = envelope(
            "call.initiated",
            serde_json::json!({ "leg_id": "leg-a", "tenant_id": "t1" }),
        );
        match ProviderEvent::from_envelope(&env).unwrap() {
            Some(ProviderEvent::Initiated(i)) => {
                assert_eq!(i.flow_type, FlowType::Direct);
                assert_eq!(i.leg_role, LegRole::Agent);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_not_an_error() {
        let env = envelope("call.recording.saved", serde_json::json!({}));
        assert!(ProviderEvent::from_envelope(&env).unwrap().is_none());
    }

    #[test]
    fn known_type_with_bad_payload_is_an_error() {
        let env = envelope("call.transcription", serde_json::json!({ "leg_id": "x" }));
        assert!(ProviderEvent::from_envelope(&env).is_err());
    }
}
