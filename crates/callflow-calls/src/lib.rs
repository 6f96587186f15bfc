//! Call lifecycle for the callflow engine.
//!
//! Owns the call record and its legs, the legal-transition state machine that
//! provider events are applied to, the webhook dedup ledger, the per-call
//! activity trail, and per-tenant translation settings.
//!
//! The state machine in [`machine`] is pure: it mutates a [`Call`] in memory
//! and returns the provider commands to issue. Persisting the result and
//! issuing the commands is the job of the call worker in `callflow-server`,
//! which is the only writer for a given call.
//!
//! # Usage
//!
//! ```rust,ignore
//! use callflow_calls::{record_delivery, LedgerEntry};
//!
//! let first = record_delivery(
//!     &conn,
//!     &LedgerEntry {
//!         provider_event_id: &envelope.id,
//!         call_id: Some(&call_id),
//!         event_type: &envelope.event_type,
//!         signature_valid: true,
//!     },
//! )?;
//! if !first {
//!     // duplicate delivery: acknowledge and stop
//! }
//! ```

mod activity;
mod error;
mod ledger;
pub mod machine;
mod store;
mod tenant;

pub use activity::{list_activity, record_activity, ActivityKind, CallActivity};
pub use error::CallError;
pub use ledger::{
    attach_call_id, delivery_count, forget_delivery, record_delivery, LedgerEntry,
};
pub use machine::{
    is_legal_transition, Anomaly, Call, Command, CommandKind, Leg, Outcome, Transition,
};
pub use store::{find_call_id_by_leg, get_call, insert_call, save_call};
pub use tenant::{get_tenant_config, load_tenant_config, upsert_tenant_config};

#[cfg(test)]
mod tests;
