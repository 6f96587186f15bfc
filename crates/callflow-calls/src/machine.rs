//! The call lifecycle state machine.
//!
//! [`Call::apply`] takes one provider event and mutates the call record in
//! place, returning an [`Outcome`] that lists the status transitions taken and
//! the outbound provider commands the owning worker must issue. The machine
//! never performs I/O; every command it emits is guarded by a state check, so
//! re-applying an event cannot emit the same command twice.

use callflow_types::{
    AmdResult, CallStatus, FlowType, LegRole, LegStatus, ProviderEvent,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One independently dialed side of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub leg_id: String,
    pub status: LegStatus,
}

impl Leg {
    fn new(leg_id: impl Into<String>) -> Self {
        Self {
            leg_id: leg_id.into(),
            status: LegStatus::Dialing,
        }
    }

    fn is_live(&self) -> bool {
        self.status != LegStatus::Ended
    }
}

/// A call as seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub call_id: String,
    pub tenant_id: String,
    pub flow_type: FlowType,
    pub status: CallStatus,
    /// The agent leg. Direct calls keep their only leg here.
    pub agent_leg: Option<Leg>,
    /// The customer leg (bridge flow only).
    pub customer_leg: Option<Leg>,
    pub amd_result: Option<AmdResult>,
    pub agent_number: Option<String>,
    pub customer_number: Option<String>,
    pub failure_reason: Option<String>,
    pub duration_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub bridged_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A status change that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: CallStatus,
    pub to: CallStatus,
}

/// Outbound provider command requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Dial the customer to produce the customer leg.
    DialCustomer { to: String },
    /// Join the two answered legs.
    BridgeLegs {
        agent_leg_id: String,
        customer_leg_id: String,
    },
    /// Hang up a leg that is still live.
    HangupLeg { leg_id: String },
}

/// Which outbound command failed, for [`Call::command_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// The first dial issued by the start-call API.
    DialAgent,
    DialCustomer,
    BridgeLegs,
}

/// An event the machine declined to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub event_type: &'static str,
    pub reason: String,
}

/// Result of applying one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub transitions: Vec<Transition>,
    pub commands: Vec<Command>,
    /// True when leg or detection state changed without a status change.
    pub record_changed: bool,
    pub anomaly: Option<Anomaly>,
}

impl Outcome {
    fn ignored(event_type: &'static str, reason: impl Into<String>) -> Self {
        Self {
            anomaly: Some(Anomaly {
                event_type,
                reason: reason.into(),
            }),
            ..Self::default()
        }
    }

    /// True when the call record must be persisted.
    pub fn changed(&self) -> bool {
        self.record_changed || !self.transitions.is_empty()
    }

    /// True when this outcome ended the call.
    pub fn terminated(&self) -> bool {
        self.transitions.iter().any(|t| t.to.is_terminal())
    }
}

/// The legal-transition graph.
pub fn is_legal_transition(from: CallStatus, to: CallStatus) -> bool {
    use CallStatus::*;
    match (from, to) {
        (from, Failed) => !from.is_terminal(),
        (Initiating, Ringing)
        | (Initiating, Answered)
        | (Ringing, Answered)
        | (Answered, Bridging)
        | (Answered, InProgress)
        | (Bridging, Bridged)
        | (Bridged, InProgress)
        | (Answered, Completed)
        | (Bridging, Completed)
        | (Bridged, Completed)
        | (InProgress, Completed) => true,
        _ => false,
    }
}

impl Call {
    /// Creates a call in `initiating` with no legs yet, as the start-call
    /// API does before dialing.
    pub fn new(
        call_id: impl Into<String>,
        tenant_id: impl Into<String>,
        flow_type: FlowType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tenant_id: tenant_id.into(),
            flow_type,
            status: CallStatus::Initiating,
            agent_leg: None,
            customer_leg: None,
            amd_result: None,
            agent_number: None,
            customer_number: None,
            failure_reason: None,
            duration_seconds: None,
            created_at: now,
            answered_at: None,
            bridged_at: None,
            ended_at: None,
        }
    }

    /// Creates a call in `initiating` for its first leg.
    pub fn initiated(
        call_id: impl Into<String>,
        tenant_id: impl Into<String>,
        flow_type: FlowType,
        agent_leg_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_leg: Some(Leg::new(agent_leg_id)),
            ..Self::new(call_id, tenant_id, flow_type, now)
        }
    }

    /// Returns which role the given provider leg id plays in this call.
    pub fn role_of(&self, leg_id: &str) -> Option<LegRole> {
        if self.agent_leg.as_ref().is_some_and(|l| l.leg_id == leg_id) {
            Some(LegRole::Agent)
        } else if self.customer_leg.as_ref().is_some_and(|l| l.leg_id == leg_id) {
            Some(LegRole::Customer)
        } else {
            None
        }
    }

    /// Returns the leg with the given role.
    pub fn leg(&self, role: LegRole) -> Option<&Leg> {
        match role {
            LegRole::Agent => self.agent_leg.as_ref(),
            LegRole::Customer => self.customer_leg.as_ref(),
        }
    }

    fn leg_mut(&mut self, role: LegRole) -> Option<&mut Leg> {
        match role {
            LegRole::Agent => self.agent_leg.as_mut(),
            LegRole::Customer => self.customer_leg.as_mut(),
        }
    }

    /// Applies one provider event.
    pub fn apply(&mut self, event: &ProviderEvent, now: DateTime<Utc>) -> Outcome {
        let event_type = event.event_type();
        match event {
            ProviderEvent::Initiated(e) => self.on_initiated(&e.leg_id, e.leg_role),
            ProviderEvent::Ringing(e) => self.on_ringing(&e.leg_id),
            ProviderEvent::Answered(e) => self.on_answered(&e.leg_id, now),
            ProviderEvent::Hangup(e) => self.on_hangup(&e.leg_id, e.cause.as_deref(), now),
            ProviderEvent::MachineDetectionEnded(e) => {
                self.on_machine_detection(&e.leg_id, e.result, now)
            }
            ProviderEvent::Bridged(e) => self.on_bridged(&e.leg_id),
            ProviderEvent::Transcription(_) | ProviderEvent::PlaybackEnded(_) => {
                Outcome::ignored(event_type, "not a lifecycle event")
            }
        }
    }

    /// Records the leg produced by the start-call dial of the agent.
    ///
    /// The provider's own `call.initiated` for the same leg may arrive later
    /// and is then ignored as already known.
    pub fn agent_dial_started(&mut self, leg_id: &str) -> Outcome {
        const EVENT: &str = "command.dial_agent";
        if self.status.is_terminal() {
            let mut outcome = Outcome::ignored(
                EVENT,
                format!("call already {}; hanging up orphan leg", self.status),
            );
            outcome.commands.push(Command::HangupLeg {
                leg_id: leg_id.to_string(),
            });
            return outcome;
        }
        if self.agent_leg.is_some() {
            return Outcome::ignored(EVENT, "agent leg already known");
        }
        self.agent_leg = Some(Leg::new(leg_id));
        Outcome {
            record_changed: true,
            ..Outcome::default()
        }
    }

    /// Records that the "dial customer" command produced a customer leg.
    ///
    /// If the call ended while the dial was in flight, the new leg is hung up
    /// instead of being attached.
    pub fn customer_dial_started(&mut self, leg_id: &str) -> Outcome {
        let mut outcome = Outcome::default();
        if self.status.is_terminal() {
            outcome.commands.push(Command::HangupLeg {
                leg_id: leg_id.to_string(),
            });
            outcome.anomaly = Some(Anomaly {
                event_type: "command.dial_customer",
                reason: format!("call already {}; hanging up orphan leg", self.status),
            });
            return outcome;
        }
        if self.customer_leg.is_none() {
            self.customer_leg = Some(Leg::new(leg_id));
            outcome.record_changed = true;
        }
        if self.status == CallStatus::Answered {
            self.transition(CallStatus::Bridging, "command.dial_customer", &mut outcome);
        }
        outcome
    }

    /// Fails the call after an outbound command could not be issued.
    pub fn command_failed(&mut self, kind: CommandKind, now: DateTime<Utc>) -> Outcome {
        let mut outcome = Outcome::default();
        if self.status.is_terminal() {
            return outcome;
        }
        let reason = match kind {
            CommandKind::DialAgent | CommandKind::DialCustomer => "dial_failed",
            CommandKind::BridgeLegs => "bridge_failed",
        };
        self.fail(reason, now, &mut outcome);
        outcome
    }

    /// Fails a call whose worker died, hanging up its live legs.
    pub fn abandon(&mut self, now: DateTime<Utc>) -> Outcome {
        let mut outcome = Outcome::default();
        if !self.status.is_terminal() {
            self.fail("worker_failed", now, &mut outcome);
        }
        outcome
    }

    fn on_initiated(&mut self, leg_id: &str, role: LegRole) -> Outcome {
        const EVENT: &str = "call.initiated";
        if self.role_of(leg_id).is_some() {
            return Outcome::ignored(EVENT, "leg already known");
        }
        if self.status.is_terminal() {
            return Outcome::ignored(EVENT, format!("call already {}", self.status));
        }
        let mut outcome = Outcome::default();
        match (self.flow_type, role) {
            (FlowType::Bridge, LegRole::Customer) if self.customer_leg.is_none() => {
                self.customer_leg = Some(Leg::new(leg_id));
                outcome.record_changed = true;
                if self.status == CallStatus::Answered {
                    self.transition(CallStatus::Bridging, EVENT, &mut outcome);
                }
            }
            (_, LegRole::Agent) if self.agent_leg.is_none() => {
                self.agent_leg = Some(Leg::new(leg_id));
                outcome.record_changed = true;
            }
            _ => {
                return Outcome::ignored(
                    EVENT,
                    format!("no free {} leg slot on {} call", role.as_str(), self.flow_type.as_str()),
                )
            }
        }
        outcome
    }

    fn on_ringing(&mut self, leg_id: &str) -> Outcome {
        const EVENT: &str = "call.ringing";
        let Some(role) = self.role_of(leg_id) else {
            return Outcome::ignored(EVENT, format!("unknown leg {leg_id}"));
        };
        if self.status.is_terminal() {
            return Outcome::ignored(EVENT, format!("call already {}", self.status));
        }
        let mut outcome = Outcome::default();
        if let Some(leg) = self.leg_mut(role) {
            if leg.status != LegStatus::Dialing {
                return Outcome::ignored(
                    EVENT,
                    format!("{} leg already {}", role.as_str(), leg.status.as_str()),
                );
            }
            leg.status = LegStatus::Ringing;
            outcome.record_changed = true;
        }
        if role == LegRole::Agent && self.status == CallStatus::Initiating {
            self.transition(CallStatus::Ringing, EVENT, &mut outcome);
        }
        outcome
    }

    fn on_answered(&mut self, leg_id: &str, now: DateTime<Utc>) -> Outcome {
        const EVENT: &str = "call.answered";
        let Some(role) = self.role_of(leg_id) else {
            return Outcome::ignored(EVENT, format!("unknown leg {leg_id}"));
        };
        if self.status.is_terminal() {
            return Outcome::ignored(EVENT, format!("call already {}", self.status));
        }
        let mut outcome = Outcome::default();
        if let Some(leg) = self.leg_mut(role) {
            if matches!(leg.status, LegStatus::Answered | LegStatus::Ended) {
                return Outcome::ignored(
                    EVENT,
                    format!("{} leg already {}", role.as_str(), leg.status.as_str()),
                );
            }
            leg.status = LegStatus::Answered;
            outcome.record_changed = true;
        }

        match (self.flow_type, role) {
            (FlowType::Direct, _) => {
                if self.transition(CallStatus::Answered, EVENT, &mut outcome) {
                    self.answered_at = Some(now);
                    self.transition(CallStatus::InProgress, EVENT, &mut outcome);
                }
            }
            (FlowType::Bridge, LegRole::Agent) => {
                if self.transition(CallStatus::Answered, EVENT, &mut outcome) {
                    self.answered_at = Some(now);
                    if self.customer_leg.is_some() {
                        // The customer leg showed up before the agent answered.
                        self.transition(CallStatus::Bridging, EVENT, &mut outcome);
                        self.bridge_if_ready(EVENT, now, &mut outcome);
                    } else {
                        match self.customer_number.clone() {
                            Some(to) => outcome.commands.push(Command::DialCustomer { to }),
                            None => self.fail("missing_customer_number", now, &mut outcome),
                        }
                    }
                }
            }
            (FlowType::Bridge, LegRole::Customer) => {
                if !self.bridge_if_ready(EVENT, now, &mut outcome) {
                    let agent_answered = self.leg_answered(LegRole::Agent);
                    let reason = if agent_answered {
                        format!("customer answered while call {}", self.status)
                    } else {
                        format!(
                            "customer answered before agent leg; call {}, waiting for agent",
                            self.status
                        )
                    };
                    outcome.anomaly = Some(Anomaly {
                        event_type: EVENT,
                        reason,
                    });
                }
            }
        }
        outcome
    }

    fn leg_answered(&self, role: LegRole) -> bool {
        self.leg(role).is_some_and(|l| l.status == LegStatus::Answered)
    }

    /// Bridges a `bridging` call once both legs have answered. Returns true
    /// when the bridge was requested.
    fn bridge_if_ready(
        &mut self,
        event_type: &'static str,
        now: DateTime<Utc>,
        outcome: &mut Outcome,
    ) -> bool {
        if self.status != CallStatus::Bridging
            || !self.leg_answered(LegRole::Agent)
            || !self.leg_answered(LegRole::Customer)
        {
            return false;
        }
        if !self.transition(CallStatus::Bridged, event_type, outcome) {
            return false;
        }
        self.bridged_at = Some(now);
        if let (Some(agent), Some(customer)) = (&self.agent_leg, &self.customer_leg) {
            outcome.commands.push(Command::BridgeLegs {
                agent_leg_id: agent.leg_id.clone(),
                customer_leg_id: customer.leg_id.clone(),
            });
        }
        true
    }

    fn on_hangup(&mut self, leg_id: &str, cause: Option<&str>, now: DateTime<Utc>) -> Outcome {
        const EVENT: &str = "call.hangup";
        let Some(role) = self.role_of(leg_id) else {
            return Outcome::ignored(EVENT, format!("unknown leg {leg_id}"));
        };
        if self.status.is_terminal() {
            return Outcome::ignored(EVENT, format!("call already {}", self.status));
        }
        let mut outcome = Outcome::default();
        if let Some(leg) = self.leg_mut(role) {
            leg.status = LegStatus::Ended;
            outcome.record_changed = true;
        }

        if self.answered_at.is_some() {
            if self.transition(CallStatus::Completed, EVENT, &mut outcome) {
                self.finish(now, &mut outcome);
            }
        } else {
            self.fail(cause.unwrap_or("no_answer"), now, &mut outcome);
        }
        outcome
    }

    fn on_machine_detection(
        &mut self,
        leg_id: &str,
        result: AmdResult,
        now: DateTime<Utc>,
    ) -> Outcome {
        const EVENT: &str = "call.machine_detection.ended";
        match self.role_of(leg_id) {
            None => return Outcome::ignored(EVENT, format!("unknown leg {leg_id}")),
            Some(LegRole::Agent) => {
                return Outcome::ignored(EVENT, "detection on agent leg is not used")
            }
            Some(LegRole::Customer) => {}
        }
        if self.status.is_terminal() {
            return Outcome::ignored(EVENT, format!("call already {}", self.status));
        }
        if self.amd_result.is_some() {
            return Outcome::ignored(EVENT, "detection result already recorded");
        }
        let mut outcome = Outcome {
            record_changed: true,
            ..Outcome::default()
        };
        self.amd_result = Some(result);
        if result == AmdResult::Machine && self.bridged_at.is_none() {
            self.fail("answering_machine", now, &mut outcome);
        }
        outcome
    }

    fn on_bridged(&mut self, leg_id: &str) -> Outcome {
        const EVENT: &str = "call.bridged";
        if self.role_of(leg_id).is_none() {
            return Outcome::ignored(EVENT, format!("unknown leg {leg_id}"));
        }
        if self.status == CallStatus::InProgress {
            return Outcome::ignored(EVENT, "call already in_progress");
        }
        let mut outcome = Outcome::default();
        self.transition(CallStatus::InProgress, EVENT, &mut outcome);
        outcome
    }

    /// Moves to `to` if the graph allows it; otherwise records an anomaly.
    fn transition(&mut self, to: CallStatus, event_type: &'static str, outcome: &mut Outcome) -> bool {
        let from = self.status;
        if !is_legal_transition(from, to) {
            outcome.anomaly = Some(Anomaly {
                event_type,
                reason: format!("illegal transition {from} -> {to}"),
            });
            return false;
        }
        self.status = to;
        outcome.transitions.push(Transition { from, to });
        true
    }

    fn fail(&mut self, reason: &str, now: DateTime<Utc>, outcome: &mut Outcome) {
        if self.transition(CallStatus::Failed, "call.failed", outcome) {
            self.failure_reason = Some(reason.to_string());
            self.finish(now, outcome);
        }
    }

    /// Hangs up live legs and stamps the end of the call.
    fn finish(&mut self, now: DateTime<Utc>, outcome: &mut Outcome) {
        for leg in [self.agent_leg.as_mut(), self.customer_leg.as_mut()]
            .into_iter()
            .flatten()
        {
            if leg.is_live() {
                outcome.commands.push(Command::HangupLeg {
                    leg_id: leg.leg_id.clone(),
                });
                leg.status = LegStatus::Ended;
            }
        }
        self.ended_at = Some(now);
        self.duration_seconds = self
            .answered_at
            .map(|answered| (now - answered).num_seconds().max(0));
        outcome.record_changed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_types::{LegHangup, LegInitiated, LegRef, MachineDetection};
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-09T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn leg_ref(leg_id: &str) -> LegRef {
        LegRef {
            call_id: Some("c1".to_string()),
            leg_id: leg_id.to_string(),
        }
    }

    fn answered(leg_id: &str) -> ProviderEvent {
        ProviderEvent::Answered(leg_ref(leg_id))
    }

    fn hangup(leg_id: &str, cause: Option<&str>) -> ProviderEvent {
        ProviderEvent::Hangup(LegHangup {
            call_id: Some("c1".to_string()),
            leg_id: leg_id.to_string(),
            cause: cause.map(str::to_string),
        })
    }

    fn amd(leg_id: &str, result: AmdResult) -> ProviderEvent {
        ProviderEvent::MachineDetectionEnded(MachineDetection {
            call_id: Some("c1".to_string()),
            leg_id: leg_id.to_string(),
            result,
        })
    }

    fn bridge_call() -> Call {
        let mut call = Call::initiated("c1", "t1", FlowType::Bridge, "agent-leg", t0());
        call.customer_number = Some("+15555551234".to_string());
        call
    }

    /// Drives a bridge call to `bridging` with both legs present.
    fn bridging_call() -> Call {
        let mut call = bridge_call();
        let out = call.apply(&answered("agent-leg"), t0());
        assert_eq!(
            out.commands,
            vec![Command::DialCustomer {
                to: "+15555551234".to_string()
            }]
        );
        call.customer_dial_started("customer-leg");
        assert_eq!(call.status, CallStatus::Bridging);
        call
    }

    #[test]
    fn direct_call_runs_to_completion() {
        let mut call = Call::initiated("c1", "t1", FlowType::Direct, "leg-1", t0());

        let out = call.apply(&ProviderEvent::Ringing(leg_ref("leg-1")), t0());
        assert_eq!(out.transitions.len(), 1);
        assert_eq!(call.status, CallStatus::Ringing);

        let out = call.apply(&answered("leg-1"), t0());
        assert_eq!(
            out.transitions,
            vec![
                Transition {
                    from: CallStatus::Ringing,
                    to: CallStatus::Answered
                },
                Transition {
                    from: CallStatus::Answered,
                    to: CallStatus::InProgress
                },
            ]
        );
        assert!(out.commands.is_empty());

        let out = call.apply(&hangup("leg-1", Some("normal_clearing")), t0() + Duration::seconds(42));
        assert!(out.terminated());
        assert_eq!(call.status, CallStatus::Completed);
        assert_eq!(call.duration_seconds, Some(42));
        assert!(out.commands.is_empty(), "the only leg is already down");
    }

    #[test]
    fn agent_answer_dials_customer_instead_of_progressing() {
        let mut call = bridge_call();
        let out = call.apply(&answered("agent-leg"), t0());
        assert_eq!(call.status, CallStatus::Answered);
        assert_eq!(out.commands.len(), 1);
        assert!(matches!(out.commands[0], Command::DialCustomer { .. }));
    }

    #[test]
    fn duplicate_agent_answer_does_not_redial() {
        let mut call = bridge_call();
        call.apply(&answered("agent-leg"), t0());
        let out = call.apply(&answered("agent-leg"), t0());
        assert!(out.commands.is_empty());
        assert!(out.anomaly.is_some());
        assert!(!out.changed());
    }

    #[test]
    fn one_answered_leg_leaves_call_bridging() {
        let call = bridging_call();
        assert_eq!(call.status, CallStatus::Bridging);
        assert_eq!(call.bridged_at, None);
    }

    #[test]
    fn both_legs_answered_bridges_once() {
        let mut call = bridging_call();
        let out = call.apply(&answered("customer-leg"), t0());
        assert_eq!(call.status, CallStatus::Bridged);
        assert_eq!(
            out.commands,
            vec![Command::BridgeLegs {
                agent_leg_id: "agent-leg".to_string(),
                customer_leg_id: "customer-leg".to_string(),
            }]
        );

        let replay = call.apply(&answered("customer-leg"), t0());
        assert!(replay.commands.is_empty(), "bridge must not be issued twice");

        let out = call.apply(&ProviderEvent::Bridged(leg_ref("agent-leg")), t0());
        assert_eq!(out.transitions[0].to, CallStatus::InProgress);
    }

    #[test]
    fn customer_answer_before_agent_is_an_anomaly() {
        let mut call = bridge_call();
        call.customer_leg = Some(Leg::new("customer-leg"));
        let out = call.apply(&answered("customer-leg"), t0());
        assert_eq!(call.status, CallStatus::Initiating);
        assert!(out.commands.is_empty());
        assert!(out.anomaly.is_some());
    }

    fn customer_initiated() -> ProviderEvent {
        ProviderEvent::Initiated(LegInitiated {
            call_id: Some("c1".to_string()),
            leg_id: "customer-leg".to_string(),
            tenant_id: "t1".to_string(),
            flow_type: FlowType::Bridge,
            leg_role: LegRole::Customer,
        })
    }

    #[test]
    fn customer_leg_known_before_agent_answer_moves_to_bridging() {
        let mut call = bridge_call();
        call.apply(&customer_initiated(), t0());

        let out = call.apply(&answered("agent-leg"), t0());
        assert_eq!(call.status, CallStatus::Bridging);
        assert!(out.commands.is_empty(), "customer leg already exists, no dial");

        let out = call.apply(&answered("customer-leg"), t0());
        assert_eq!(call.status, CallStatus::Bridged);
        assert!(out.anomaly.is_none());
        assert_eq!(
            out.commands,
            vec![Command::BridgeLegs {
                agent_leg_id: "agent-leg".to_string(),
                customer_leg_id: "customer-leg".to_string(),
            }]
        );
    }

    #[test]
    fn customer_answer_before_agent_bridges_when_agent_answers() {
        let mut call = bridge_call();
        call.apply(&customer_initiated(), t0());
        let out = call.apply(&answered("customer-leg"), t0());
        assert_eq!(call.status, CallStatus::Initiating);
        assert!(out
            .anomaly
            .as_ref()
            .is_some_and(|a| a.reason.contains("before agent leg")));

        let out = call.apply(&answered("agent-leg"), t0());
        assert_eq!(call.status, CallStatus::Bridged);
        assert_eq!(call.bridged_at, Some(t0()));
        let targets: Vec<_> = out.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            targets,
            vec![CallStatus::Answered, CallStatus::Bridging, CallStatus::Bridged]
        );
        assert!(matches!(out.commands[..], [Command::BridgeLegs { .. }]));
    }

    #[test]
    fn amd_on_agent_leg_is_ignored() {
        let mut call = bridging_call();
        let out = call.apply(&amd("agent-leg", AmdResult::Machine), t0());
        assert!(out.anomaly.is_some());
        assert_eq!(call.amd_result, None);
        assert_eq!(call.status, CallStatus::Bridging);
    }

    #[test]
    fn machine_on_customer_leg_fails_and_hangs_up_both_legs() {
        let mut call = bridging_call();
        let out = call.apply(&amd("customer-leg", AmdResult::Machine), t0());
        assert_eq!(call.status, CallStatus::Failed);
        assert_eq!(call.amd_result, Some(AmdResult::Machine));
        assert_eq!(call.failure_reason.as_deref(), Some("answering_machine"));
        assert_eq!(out.commands.len(), 2);
    }

    #[test]
    fn human_on_customer_leg_is_recorded_only() {
        let mut call = bridging_call();
        let out = call.apply(&amd("customer-leg", AmdResult::Human), t0());
        assert!(out.changed());
        assert!(out.transitions.is_empty());
        assert_eq!(call.amd_result, Some(AmdResult::Human));
    }

    #[test]
    fn hangup_on_completed_call_is_ignored() {
        let mut call = Call::initiated("c1", "t1", FlowType::Direct, "leg-1", t0());
        call.apply(&answered("leg-1"), t0());
        call.apply(&hangup("leg-1", None), t0());
        assert_eq!(call.status, CallStatus::Completed);

        let out = call.apply(&hangup("leg-1", None), t0());
        assert!(out.anomaly.is_some());
        assert!(!out.changed());
        assert_eq!(call.status, CallStatus::Completed);
    }

    #[test]
    fn hangup_before_answer_fails_with_cause() {
        let mut call = Call::initiated("c1", "t1", FlowType::Direct, "leg-1", t0());
        call.apply(&hangup("leg-1", Some("busy")), t0());
        assert_eq!(call.status, CallStatus::Failed);
        assert_eq!(call.failure_reason.as_deref(), Some("busy"));
        assert_eq!(call.duration_seconds, None);
    }

    #[test]
    fn agent_hangup_after_bridge_completes_and_hangs_up_customer() {
        let mut call = bridging_call();
        call.apply(&answered("customer-leg"), t0());
        let out = call.apply(&hangup("agent-leg", None), t0());
        assert_eq!(call.status, CallStatus::Completed);
        assert_eq!(
            out.commands,
            vec![Command::HangupLeg {
                leg_id: "customer-leg".to_string()
            }]
        );
    }

    #[test]
    fn customer_leg_after_termination_is_hung_up() {
        let mut call = bridge_call();
        call.apply(&answered("agent-leg"), t0());
        call.apply(&hangup("agent-leg", None), t0());
        assert!(call.status.is_terminal());

        let out = call.customer_dial_started("late-leg");
        assert_eq!(
            out.commands,
            vec![Command::HangupLeg {
                leg_id: "late-leg".to_string()
            }]
        );
        assert!(call.customer_leg.is_none());
    }

    #[test]
    fn customer_initiated_event_can_precede_dial_response() {
        let mut call = bridge_call();
        call.apply(&answered("agent-leg"), t0());
        let out = call.apply(
            &ProviderEvent::Initiated(LegInitiated {
                call_id: Some("c1".to_string()),
                leg_id: "customer-leg".to_string(),
                tenant_id: "t1".to_string(),
                flow_type: FlowType::Bridge,
                leg_role: LegRole::Customer,
            }),
            t0(),
        );
        assert_eq!(out.transitions[0].to, CallStatus::Bridging);

        let out = call.customer_dial_started("customer-leg");
        assert!(out.transitions.is_empty());
        assert_eq!(call.status, CallStatus::Bridging);
    }

    #[test]
    fn dial_failure_fails_call() {
        let mut call = bridge_call();
        call.apply(&answered("agent-leg"), t0());
        let out = call.command_failed(CommandKind::DialCustomer, t0());
        assert_eq!(call.status, CallStatus::Failed);
        assert_eq!(call.failure_reason.as_deref(), Some("dial_failed"));
        assert_eq!(
            out.commands,
            vec![Command::HangupLeg {
                leg_id: "agent-leg".to_string()
            }]
        );
    }

    #[test]
    fn start_call_dial_attaches_agent_leg_once() {
        let mut call = Call::new("c1", "t1", FlowType::Direct, t0());

        let out = call.agent_dial_started("agent-leg");
        assert!(out.changed());
        assert_eq!(call.role_of("agent-leg"), Some(LegRole::Agent));

        let out = call.apply(
            &ProviderEvent::Initiated(LegInitiated {
                call_id: Some("c1".to_string()),
                leg_id: "agent-leg".to_string(),
                tenant_id: "t1".to_string(),
                flow_type: FlowType::Direct,
                leg_role: LegRole::Agent,
            }),
            t0(),
        );
        assert!(!out.changed());
        assert!(out.anomaly.is_some());
    }

    #[test]
    fn failed_agent_dial_fails_call_without_commands() {
        let mut call = Call::new("c1", "t1", FlowType::Bridge, t0());
        let out = call.command_failed(CommandKind::DialAgent, t0());
        assert_eq!(call.status, CallStatus::Failed);
        assert_eq!(call.failure_reason.as_deref(), Some("dial_failed"));
        assert!(out.commands.is_empty());
    }

    #[test]
    fn abandoned_call_fails_once_and_hangs_up_live_legs() {
        let mut call = bridging_call();
        let out = call.abandon(t0());
        assert_eq!(call.status, CallStatus::Failed);
        assert_eq!(call.failure_reason.as_deref(), Some("worker_failed"));
        assert_eq!(out.commands.len(), 2);

        let again = call.abandon(t0());
        assert!(!again.changed());
        assert!(again.commands.is_empty());
    }

    #[test]
    fn legal_graph_rejects_skips_and_exits_from_terminal_states() {
        assert!(is_legal_transition(CallStatus::Initiating, CallStatus::Failed));
        assert!(!is_legal_transition(CallStatus::Completed, CallStatus::Failed));
        assert!(!is_legal_transition(CallStatus::Bridging, CallStatus::InProgress));
        assert!(!is_legal_transition(CallStatus::Initiating, CallStatus::Bridged));
        assert!(!is_legal_transition(CallStatus::Failed, CallStatus::Ringing));
    }
}
