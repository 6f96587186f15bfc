//! LibreTranslate (`/translate`), self-hosted or public.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::TranslateError;
use crate::provider::TranslationProvider;

const NAME: &str = "libretranslate";

#[derive(Debug, Serialize)]
struct LibreRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibreResponse {
    #[serde(default)]
    translated_text: String,
}

pub struct LibreTranslateProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl LibreTranslateProvider {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

/// LibreTranslate only knows primary language tags.
fn primary_tag(code: &str) -> &str {
    code.split('-').next().unwrap_or(code)
}

#[async_trait]
impl TranslationProvider for LibreTranslateProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, TranslateError> {
        let http = |source| TranslateError::Http {
            provider: NAME.to_string(),
            source,
        };
        let response = self
            .client
            .post(format!("{}/translate", self.base_url))
            .json(&LibreRequest {
                q: text,
                source: primary_tag(source_lang),
                target: primary_tag(target_lang),
                format: "text",
                api_key: self.api_key.as_deref(),
            })
            .send()
            .await
            .map_err(http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranslateError::Status {
                provider: NAME.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        let body: LibreResponse = response.json().await.map_err(http)?;
        if body.translated_text.is_empty() {
            return Err(TranslateError::EmptyResponse {
                provider: NAME.to_string(),
            });
        }
        Ok(body.translated_text)
    }
}
