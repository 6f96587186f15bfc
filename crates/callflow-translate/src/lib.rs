//! Machine translation for transcript segments.
//!
//! A [`TranslationChain`] runs each segment through the configured providers
//! in order (primary, secondary, tertiary, ...), bounding every attempt with a
//! timeout and skipping providers whose [`CircuitBreaker`] is open. When every
//! provider fails the outcome is [`TranslationOutcome::Untranslated`] and the
//! caller publishes the original text.

mod breaker;
mod chain;
mod error;
mod provider;
pub mod providers;

pub use breaker::CircuitBreaker;
pub use chain::{
    ChainSettings, TranslationChain, TranslationOutcome, PROVIDER_NONE, PROVIDER_PASSTHROUGH,
};
pub use error::TranslateError;
pub use provider::TranslationProvider;
pub use providers::{build_providers, ProviderConfig};
