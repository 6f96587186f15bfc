//! Per-tenant translation configuration.
//!
//! Owned by the surrounding administrative system; the engine only reads it,
//! once, when a call worker is created.

use serde::{Deserialize, Serialize};

/// Translation settings for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantTranslationConfig {
    pub tenant_id: String,
    /// Whether transcript segments are translated at all.
    pub translation_enabled: bool,
    /// Language spoken on the call, e.g. `es`.
    pub source_lang: String,
    /// Language observers want to read, e.g. `en`.
    pub target_lang: String,
    /// Whether translated text is synthesized and played back into the call.
    pub voice_to_voice: bool,
}

impl TenantTranslationConfig {
    /// Configuration used for tenants that have never stored one.
    pub fn disabled(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            translation_enabled: false,
            source_lang: "en".to_string(),
            target_lang: "en".to_string(),
            voice_to_voice: false,
        }
    }

    /// True when both language codes are well formed.
    pub fn has_valid_languages(&self) -> bool {
        is_valid_language_code(&self.source_lang) && is_valid_language_code(&self.target_lang)
    }
}

/// Checks a BCP-47-style language code: a 2–3 letter lowercase primary tag,
/// optionally followed by one `-` subtag of 2–4 alphanumerics (`pt-BR`, `zh-Hans`).
pub fn is_valid_language_code(code: &str) -> bool {
    let mut parts = code.split('-');
    let primary = parts.next().unwrap_or_default();
    if !(2..=3).contains(&primary.len()) || !primary.chars().all(|c| c.is_ascii_lowercase()) {
        return false;
    }
    match (parts.next(), parts.next()) {
        (None, _) => true,
        (Some(sub), None) => {
            (2..=4).contains(&sub.len()) && sub.chars().all(|c| c.is_ascii_alphanumeric())
        }
        _ => false,
    }
}
