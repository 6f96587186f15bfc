//! The seam every translation backend implements.

use async_trait::async_trait;

use crate::error::TranslateError;

/// A machine-translation backend.
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    /// Stable label recorded as `provider_used`.
    fn name(&self) -> &str;

    /// Translates `text` from `source_lang` to `target_lang`.
    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, TranslateError>;
}
