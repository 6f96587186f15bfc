//! Shared types, error definitions, and constants for the callflow engine.
//!
//! This crate provides the foundational vocabulary used across all callflow
//! crates: call flow and status codes, leg sub-states, speaker labels,
//! answering-machine results, the closed set of provider webhook events, and
//! the per-tenant translation configuration consumed by call workers.
//!
//! No crate in the workspace depends on anything *except* `callflow-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

use serde::{Deserialize, Serialize};

pub mod events;
mod tenant;

pub use events::{
    LegHangup, LegInitiated, LegRef, MachineDetection, PlaybackEnded, ProviderEvent,
    TranscriptionPayload, WebhookEnvelope,
};
pub use tenant::{is_valid_language_code, TenantTranslationConfig};

/// Error returned when parsing an unknown enum label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} label: {value}")]
pub struct ParseLabelError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl ParseLabelError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// How a call is set up with the telephony provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    /// A single leg between the provider and one party.
    #[default]
    Direct,
    /// Two independently dialed legs (agent, then customer) joined by the provider.
    Bridge,
}

impl FlowType {
    /// Returns the canonical string label stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Bridge => "bridge",
        }
    }
}

impl std::str::FromStr for FlowType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "bridge" => Ok(Self::Bridge),
            _ => Err(ParseLabelError::new("flow type", s)),
        }
    }
}

/// Lifecycle status of a call.
///
/// `initiating → ringing → answered → (bridging → bridged →) in_progress → completed`,
/// with `failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiating,
    Ringing,
    Answered,
    Bridging,
    Bridged,
    InProgress,
    Completed,
    Failed,
}

impl CallStatus {
    /// Returns the canonical string label stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiating => "initiating",
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Bridging => "bridging",
            Self::Bridged => "bridged",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiating" => Ok(Self::Initiating),
            "ringing" => Ok(Self::Ringing),
            "answered" => Ok(Self::Answered),
            "bridging" => Ok(Self::Bridging),
            "bridged" => Ok(Self::Bridged),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseLabelError::new("call status", s)),
        }
    }
}

/// Which side of a call a leg belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRole {
    /// The agent leg. A direct call stores its only leg here.
    #[default]
    Agent,
    /// The customer leg, dialed once the agent has answered.
    Customer,
}

impl LegRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Customer => "customer",
        }
    }

    /// The opposite party's role.
    pub fn other(self) -> Self {
        match self {
            Self::Agent => Self::Customer,
            Self::Customer => Self::Agent,
        }
    }
}

impl std::str::FromStr for LegRole {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "customer" => Ok(Self::Customer),
            _ => Err(ParseLabelError::new("leg role", s)),
        }
    }
}

/// Sub-status of a single leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    Dialing,
    Ringing,
    Answered,
    Ended,
}

impl LegStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dialing => "dialing",
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Ended => "ended",
        }
    }
}

impl std::str::FromStr for LegStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dialing" => Ok(Self::Dialing),
            "ringing" => Ok(Self::Ringing),
            "answered" => Ok(Self::Answered),
            "ended" => Ok(Self::Ended),
            _ => Err(ParseLabelError::new("leg status", s)),
        }
    }
}

/// Answering-machine detection outcome for the customer leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmdResult {
    Human,
    Machine,
    Unknown,
}

impl AmdResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Machine => "machine",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for AmdResult {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "machine" => Ok(Self::Machine),
            "unknown" => Ok(Self::Unknown),
            _ => Err(ParseLabelError::new("amd result", s)),
        }
    }
}

/// Who spoke a transcribed utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Agent,
    Customer,
    #[default]
    Unknown,
}

impl Speaker {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Customer => "customer",
            Self::Unknown => "unknown",
        }
    }

    /// The leg role of the speaker, if known.
    pub fn leg_role(self) -> Option<LegRole> {
        match self {
            Self::Agent => Some(LegRole::Agent),
            Self::Customer => Some(LegRole::Customer),
            Self::Unknown => None,
        }
    }
}

impl From<LegRole> for Speaker {
    fn from(role: LegRole) -> Self {
        match role {
            LegRole::Agent => Self::Agent,
            LegRole::Customer => Self::Customer,
        }
    }
}

impl std::str::FromStr for Speaker {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "customer" => Ok(Self::Customer),
            "unknown" => Ok(Self::Unknown),
            _ => Err(ParseLabelError::new("speaker", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_status_labels_parse_back() {
        for status in [
            CallStatus::Initiating,
            CallStatus::Ringing,
            CallStatus::Answered,
            CallStatus::Bridging,
            CallStatus::Bridged,
            CallStatus::InProgress,
            CallStatus::Completed,
            CallStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<CallStatus>(), Ok(status));
        }
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(CallStatus::Completed.is_terminal());
        assert!(CallStatus::Failed.is_terminal());
        assert!(!CallStatus::Bridged.is_terminal());
        assert!(!CallStatus::InProgress.is_terminal());
    }

    #[test]
    fn unknown_labels_are_rejected() {
        let err = "on_hold".parse::<CallStatus>().unwrap_err();
        assert_eq!(err.kind, "call status");
        assert!("voicemail".parse::<AmdResult>().is_err());
        assert!("supervisor".parse::<Speaker>().is_err());
    }

    #[test]
    fn speaker_maps_to_leg_role() {
        assert_eq!(Speaker::Agent.leg_role(), Some(LegRole::Agent));
        assert_eq!(Speaker::Customer.leg_role(), Some(LegRole::Customer));
        assert_eq!(Speaker::Unknown.leg_role(), None);
        assert_eq!(LegRole::Agent.other(), LegRole::Customer);
    }
}
