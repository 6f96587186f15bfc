//! Concrete translation backends and their configuration.

mod deepl;
mod libretranslate;
mod openai;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

pub use deepl::DeeplProvider;
pub use libretranslate::LibreTranslateProvider;
pub use openai::OpenAiProvider;

use crate::error::TranslateError;
use crate::provider::TranslationProvider;

fn default_deepl_url() -> String {
    "https://api-free.deepl.com".to_string()
}

fn default_openai_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

/// One `[[translation.providers]]` entry.
#[derive(Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Deepl {
        api_key: String,
        #[serde(default = "default_deepl_url")]
        base_url: String,
    },
    Libretranslate {
        base_url: String,
        #[serde(default)]
        api_key: Option<String>,
    },
    Openai {
        api_key: String,
        #[serde(default = "default_openai_url")]
        base_url: String,
        #[serde(default = "default_openai_model")]
        model: String,
    },
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deepl { base_url, .. } => f
                .debug_struct("Deepl")
                .field("api_key", &"[REDACTED]")
                .field("base_url", base_url)
                .finish(),
            Self::Libretranslate { base_url, api_key } => f
                .debug_struct("Libretranslate")
                .field("base_url", base_url)
                .field("api_key", &api_key.as_ref().map(|_| "[REDACTED]"))
                .finish(),
            Self::Openai {
                base_url, model, ..
            } => f
                .debug_struct("Openai")
                .field("api_key", &"[REDACTED]")
                .field("base_url", base_url)
                .field("model", model)
                .finish(),
        }
    }
}

/// Builds the configured providers, in order, sharing one HTTP client.
///
/// # Errors
///
/// Returns `TranslateError::Config` if the HTTP client cannot be built.
pub fn build_providers(
    configs: &[ProviderConfig],
    request_timeout: Duration,
) -> Result<Vec<Arc<dyn TranslationProvider>>, TranslateError> {
    let client = Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| TranslateError::Config(format!("http client: {e}")))?;

    Ok(configs
        .iter()
        .map(|cfg| -> Arc<dyn TranslationProvider> {
            match cfg {
                ProviderConfig::Deepl { api_key, base_url } => {
                    Arc::new(DeeplProvider::new(client.clone(), base_url, api_key))
                }
                ProviderConfig::Libretranslate { base_url, api_key } => Arc::new(
                    LibreTranslateProvider::new(client.clone(), base_url, api_key.clone()),
                ),
                ProviderConfig::Openai {
                    api_key,
                    base_url,
                    model,
                } => Arc::new(OpenAiProvider::new(
                    client.clone(),
                    base_url,
                    api_key,
                    model,
                )),
            }
        })
        .collect())
}
